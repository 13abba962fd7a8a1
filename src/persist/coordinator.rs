//! Atomic database saves
//!
//! The database is encoded into memory first, written to a temporary file in
//! the target directory, synced, and only then renamed over the original.
//! A failure at any step leaves the original file as it was.

use crate::crypto::DatabaseKey;
use crate::error::{Error, Result};
use crate::format;
use crate::tree::Database;
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Progress of the most recent save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveState {
    #[default]
    Idle,
    Saving,
    Committed,
    Failed,
}

impl fmt::Display for SaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaveState::Idle => "idle",
            SaveState::Saving => "saving",
            SaveState::Committed => "committed",
            SaveState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Serializes saves of one database file
#[derive(Clone)]
pub struct Coordinator {
    path: PathBuf,
    state: Arc<Mutex<SaveState>>,
    /// Held for the whole save so two saves never overlap
    writer: Arc<Mutex<()>>,
}

impl Coordinator {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Coordinator {
            path: path.as_ref().to_path_buf(),
            state: Arc::new(Mutex::new(SaveState::Idle)),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Target database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SaveState {
        *self.state.lock()
    }

    /// Encode and atomically replace the database file
    pub fn save(&self, db: &Database, key: &DatabaseKey) -> Result<()> {
        let _writer = self.writer.lock();
        *self.state.lock() = SaveState::Saving;
        debug!("Saving database to {:?}", self.path);

        let result = format::encode(db, key).and_then(|bytes| write_atomic(&self.path, &bytes));

        *self.state.lock() = match &result {
            Ok(()) => {
                info!(
                    "Saved {} groups and {} entries to {:?}",
                    db.group_count(),
                    db.entry_count(),
                    self.path
                );
                SaveState::Committed
            }
            Err(e) => {
                warn!("Saving {:?} failed: {}", self.path, e);
                SaveState::Failed
            }
        };
        result
    }

    /// Save a snapshot of the database on the blocking pool
    ///
    /// The caller keeps using its own copy while the snapshot is written.
    pub async fn save_in_background(&self, snapshot: Database, key: DatabaseKey) -> Result<()> {
        let coordinator = self.clone();
        tokio::task::spawn_blocking(move || coordinator.save(&snapshot, &key))
            .await
            .map_err(|e| Error::InvalidState(format!("Save task failed: {}", e)))?
    }
}

/// Write `bytes` to `path` through a synced temporary file and a rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let save_failed = |source| Error::SaveFailed {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(save_failed)?;
    tmp.write_all(bytes).map_err(save_failed)?;
    tmp.flush().map_err(save_failed)?;
    tmp.as_file().sync_all().map_err(save_failed)?;

    tmp.persist(path).map_err(|e| save_failed(e.error))?;
    sync_dir(dir);
    Ok(())
}

/// Make the rename durable; the file itself is already synced
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Could not sync directory {:?}: {}", dir, e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_composite_key, Algorithm};
    use crate::tree::EntryFields;
    use tempfile::TempDir;

    const ROUNDS: u32 = 1000;

    fn sample() -> (Database, DatabaseKey) {
        let mut db = Database::new(Algorithm::Aes256, ROUNDS);
        let g = db.add_group(None, "Email").unwrap();
        db.add_entry(g, &EntryFields::new("Gmail").username("alice"))
            .unwrap();
        let key = DatabaseKey::generate(&derive_composite_key("pw", None).unwrap(), ROUNDS);
        (db, key)
    }

    #[test]
    fn test_save_commits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kdb");
        let (db, key) = sample();

        let coordinator = Coordinator::new(&path);
        assert_eq!(coordinator.state(), SaveState::Idle);
        coordinator.save(&db, &key).unwrap();
        assert_eq!(coordinator.state(), SaveState::Committed);

        let raw = std::fs::read(&path).unwrap();
        let (loaded, _) = format::decode(&raw, &derive_composite_key("pw", None).unwrap()).unwrap();
        assert_eq!(loaded, db);
    }

    #[test]
    fn test_encode_failure_keeps_original() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kdb");
        std::fs::write(&path, b"original").unwrap();

        let (mut db, key) = sample();
        db.set_rounds(ROUNDS + 1).unwrap();

        let coordinator = Coordinator::new(&path);
        assert!(matches!(coordinator.save(&db, &key), Err(Error::InvalidState(_))));
        assert_eq!(coordinator.state(), SaveState::Failed);
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn test_missing_directory_is_save_failed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("db.kdb");
        let (db, key) = sample();

        let coordinator = Coordinator::new(&path);
        assert!(matches!(
            coordinator.save(&db, &key),
            Err(Error::SaveFailed { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kdb");
        let (db, key) = sample();

        let coordinator = Coordinator::new(&path);
        coordinator.save(&db, &key).unwrap();
        coordinator.save(&db, &key).unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_write_atomic_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kdb");
        std::fs::write(&path, b"old contents").unwrap();

        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_save_in_background() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kdb");
        let (mut db, key) = sample();

        let coordinator = Coordinator::new(&path);
        let save = coordinator.save_in_background(db.clone(), key);

        // The live copy stays usable while the snapshot is written
        let g = db.root_groups()[0];
        db.add_entry(g, &EntryFields::new("Later")).unwrap();

        save.await.unwrap();
        assert_eq!(coordinator.state(), SaveState::Committed);

        let raw = std::fs::read(&path).unwrap();
        let (loaded, _) = format::decode(&raw, &derive_composite_key("pw", None).unwrap()).unwrap();
        assert_eq!(loaded.entry_count(), 1);
    }
}
