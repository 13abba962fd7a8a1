//! Database session lifecycle
//!
//! A session manages at most one database through the states
//! Closed → Unlocking → Open ⇄ Locked → Closed. Keys exist only while a
//! database is loaded, sealed in protected memory. Locking drops them
//! unless fast unlock is available.

mod fast_unlock;
mod state;

pub use state::SessionState;

use crate::config::Config;
use crate::crypto::{
    constant_time_eq, Algorithm, CancelFlag, CompositeKey, Credentials, DatabaseKey, FinalKey,
};
use crate::error::{Error, Result};
use crate::format;
use crate::persist::{self, Coordinator};
use crate::tree::{Database, EntryId, ItemId, Removed};
use fast_unlock::{RetryBudget, UnlockVerifier};
use parking_lot::RwLock;
use state::{KeyParams, SessionKeys};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Database guarded for the session's readers and its single writer
type SharedDatabase = Arc<RwLock<Database>>;

/// Outcome of [`Session::delete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deleted {
    pub removed: Removed,
    /// Entries copied into the backup group; 0 when skipped or failed
    pub backed_up: usize,
}

/// Behaviour of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub fast_unlock: bool,
    pub fast_unlock_retries: u32,
    /// Argon2 memory cost for the unlock verifier
    pub argon2_memory_kib: u32,
    /// `None` disables the inactivity lock
    pub inactivity_lock: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let security = &config.security;
        SessionSettings {
            fast_unlock: security.fast_unlock,
            fast_unlock_retries: security.fast_unlock_retries,
            argon2_memory_kib: security.argon2_memory_kib,
            inactivity_lock: match security.inactivity_lock_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// An open running on the blocking pool
struct PendingOpen {
    path: PathBuf,
    read_only: bool,
    composite: CompositeKey,
    prefix: Zeroizing<String>,
    cancel: CancelFlag,
    task: JoinHandle<Result<(Database, DatabaseKey)>>,
}

/// The single active database and its keys
pub struct Session {
    settings: SessionSettings,
    state: SessionState,
    db: Option<SharedDatabase>,
    coordinator: Option<Coordinator>,
    keys: Option<SessionKeys>,
    params: Option<KeyParams>,
    verifier: Option<UnlockVerifier>,
    budget: RetryBudget,
    pending: Option<PendingOpen>,
    read_only: bool,
    dirty: bool,
    last_activity: Instant,
}

fn read_database(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(Error::DatabaseNotFound(path.to_path_buf()));
    }
    Ok(std::fs::read(path)?)
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        let budget = RetryBudget::new(settings.fast_unlock_retries);
        Session {
            settings,
            state: SessionState::Closed,
            db: None,
            coordinator: None,
            keys: None,
            params: None,
            verifier: None,
            budget,
            pending: None,
            read_only: false,
            dirty: false,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Unsaved changes exist
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// File of the loaded database
    pub fn path(&self) -> Option<&Path> {
        self.coordinator.as_ref().map(|c| c.path())
    }

    /// Fast unlock guesses left before the full password is required
    pub fn fast_unlock_tries_left(&self) -> u32 {
        self.budget.left()
    }

    fn require_closed(&self) -> Result<()> {
        match self.state {
            SessionState::Closed => Ok(()),
            other => Err(Error::InvalidState(format!(
                "A database is already {}; close it first",
                other
            ))),
        }
    }

    fn require_open(&self) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Locked => Err(Error::InvalidState("Database is locked".to_string())),
            SessionState::Closed | SessionState::Unlocking => Err(Error::NotOpen),
        }
    }

    fn require_writable(&self) -> Result<()> {
        self.require_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn shared(&self) -> Result<&SharedDatabase> {
        self.db.as_ref().ok_or(Error::NotOpen)
    }

    fn params(&self) -> Result<&KeyParams> {
        self.params
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No key parameters".to_string()))
    }

    fn sealed_keys(&self) -> Result<&SessionKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Keys are not available".to_string()))
    }

    fn make_verifier(&self, prefix: &str) -> Option<UnlockVerifier> {
        if !self.settings.fast_unlock || prefix.is_empty() {
            return None;
        }
        match UnlockVerifier::new(prefix, self.settings.argon2_memory_kib) {
            Ok(verifier) => Some(verifier),
            Err(e) => {
                warn!("Fast unlock disabled for this session: {}", e);
                None
            }
        }
    }

    /// Take ownership of a freshly loaded database
    fn activate(
        &mut self,
        db: Database,
        coordinator: Coordinator,
        composite: &CompositeKey,
        key: &DatabaseKey,
        prefix: &str,
        read_only: bool,
    ) -> Result<()> {
        let keys = SessionKeys::seal(composite, key.final_key())?;
        self.verifier = self.make_verifier(prefix);
        self.keys = Some(keys);
        self.params = Some(KeyParams::new(key));
        self.db = Some(Arc::new(RwLock::new(db)));
        self.coordinator = Some(coordinator);
        self.read_only = read_only;
        self.dirty = false;
        self.budget.reset();
        self.state = SessionState::Open;
        self.touch();
        Ok(())
    }

    /// Create a new empty database file and open it
    pub fn create<P: AsRef<Path>>(
        &mut self,
        path: P,
        credentials: &Credentials,
        algorithm: Algorithm,
        rounds: u32,
    ) -> Result<()> {
        self.require_closed()?;
        let path = path.as_ref();
        if path.exists() {
            return Err(Error::DatabaseExists(path.to_path_buf()));
        }

        let mut db = Database::new(algorithm, rounds);
        db.set_rounds(rounds)?;
        db.set_path(path);

        let composite = credentials.composite_key()?;
        let key = DatabaseKey::generate(&composite, rounds);
        let coordinator = Coordinator::new(path);
        coordinator.save(&db, &key)?;

        self.activate(db, coordinator, &composite, &key, &credentials.unlock_prefix(), false)?;
        info!("Created {} database {:?} with {} rounds", algorithm, path, rounds);
        Ok(())
    }

    /// Open a database, deriving the key on the calling thread
    pub fn open<P: AsRef<Path>>(
        &mut self,
        path: P,
        credentials: &Credentials,
        read_only: bool,
    ) -> Result<()> {
        self.require_closed()?;
        let path = path.as_ref();
        let raw = read_database(path)?;
        let composite = credentials.composite_key()?;

        let (mut db, key) = format::decode(&raw, &composite)?;
        db.set_path(path);

        self.activate(
            db,
            Coordinator::new(path),
            &composite,
            &key,
            &credentials.unlock_prefix(),
            read_only,
        )?;
        info!("Opened database {:?}{}", path, if read_only { " (read-only)" } else { "" });
        Ok(())
    }

    /// Start opening a database on the blocking pool
    ///
    /// Missing files and key files are reported right away; the key
    /// derivation itself runs in the background until [`Session::complete_open`]
    /// or [`Session::cancel_open`].
    pub fn begin_open<P: AsRef<Path>>(
        &mut self,
        path: P,
        credentials: &Credentials,
        read_only: bool,
    ) -> Result<()> {
        self.require_closed()?;
        let path = path.as_ref();
        let raw = read_database(path)?;
        let composite = credentials.composite_key()?;

        let cancel = CancelFlag::new();
        let task_cancel = cancel.clone();
        let task_composite = composite.clone();
        let task = tokio::task::spawn_blocking(move || {
            format::decode_cancellable(&raw, &task_composite, &task_cancel)
        });

        self.pending = Some(PendingOpen {
            path: path.to_path_buf(),
            read_only,
            composite,
            prefix: credentials.unlock_prefix(),
            cancel,
            task,
        });
        self.state = SessionState::Unlocking;
        debug!("Opening {:?} in the background", path);
        Ok(())
    }

    /// Wait for a background open started with [`Session::begin_open`]
    ///
    /// Dropping the returned future leaves the open pending, so
    /// [`Session::cancel_open`] can still abort it.
    pub async fn complete_open(&mut self) -> Result<()> {
        let no_open = || Error::InvalidState("No open in progress".to_string());
        let joined = match self.pending.as_mut() {
            Some(pending) => (&mut pending.task).await,
            None => return Err(no_open()),
        };
        let pending = self.pending.take().ok_or_else(no_open)?;

        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(Error::InvalidState(format!("Open task failed: {}", e))),
        };
        let (mut db, key) = match result {
            Ok(loaded) => loaded,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        db.set_path(&pending.path);
        let coordinator = Coordinator::new(&pending.path);
        if let Err(e) = self.activate(
            db,
            coordinator,
            &pending.composite,
            &key,
            &pending.prefix,
            pending.read_only,
        ) {
            self.state = SessionState::Closed;
            return Err(e);
        }
        info!("Opened database {:?}", pending.path);
        Ok(())
    }

    /// Abandon a background open; nothing it computed is kept
    pub fn cancel_open(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
            info!("Cancelled opening {:?}", pending.path);
        }
        if self.state == SessionState::Unlocking {
            self.state = SessionState::Closed;
        }
    }

    /// Hide the database until it is unlocked again
    pub fn lock(&mut self) -> Result<()> {
        self.require_open()?;
        if self.verifier.is_none() || self.budget.is_exhausted() {
            self.keys = None;
        }
        self.state = SessionState::Locked;
        info!(
            "Database locked{}",
            if self.keys.is_some() { ", fast unlock available" } else { "" }
        );
        Ok(())
    }

    /// Unlock with the full credentials, re-deriving the key
    pub fn unlock(&mut self, credentials: &Credentials) -> Result<()> {
        if self.state != SessionState::Locked {
            return Err(Error::InvalidState("Database is not locked".to_string()));
        }
        let composite = credentials.composite_key()?;
        let params = self.params()?;
        let final_key = FinalKey::derive(&composite, &params.seeds, params.rounds);
        if !constant_time_eq(&final_key.check_digest(), &params.check) {
            warn!("Unlock failed: wrong credentials");
            return Err(Error::WrongCredentials);
        }

        self.keys = Some(SessionKeys::seal(&composite, &final_key)?);
        self.verifier = self.make_verifier(&credentials.unlock_prefix());
        self.budget.reset();
        self.state = SessionState::Open;
        self.touch();
        info!("Database unlocked");
        Ok(())
    }

    /// Unlock with the first characters of the master password
    ///
    /// Wrong codes spend the retry budget. The attempt that spends the last
    /// try wipes the retained keys; from then on only [`Session::unlock`]
    /// works.
    pub fn fast_unlock(&mut self, prefix: &str) -> Result<()> {
        if self.state != SessionState::Locked {
            return Err(Error::InvalidState("Database is not locked".to_string()));
        }
        if self.budget.is_exhausted() {
            return Err(Error::FastUnlockExhausted);
        }
        let verifier = match (&self.verifier, &self.keys) {
            (Some(verifier), Some(_)) => verifier,
            _ => return Err(Error::FastUnlockUnavailable),
        };

        if verifier.matches(prefix)? {
            self.budget.reset();
            self.state = SessionState::Open;
            self.touch();
            info!("Database unlocked with fast unlock");
            return Ok(());
        }

        let tries_left = self.budget.spend();
        if tries_left == 0 {
            self.keys = None;
            self.verifier = None;
            warn!("Fast unlock retries exhausted, keys wiped; master password required");
            return Err(Error::FastUnlockExhausted);
        }
        warn!("Wrong fast unlock code, {} tries left", tries_left);
        Err(Error::WrongUnlockCode { tries_left })
    }

    /// Drop the database and all keys, discarding unsaved changes
    pub fn close(&mut self) {
        self.cancel_open();
        if self.dirty {
            warn!("Closing database with unsaved changes");
        }
        self.db = None;
        self.coordinator = None;
        self.keys = None;
        self.params = None;
        self.verifier = None;
        self.budget.reset();
        self.read_only = false;
        self.dirty = false;
        if self.state != SessionState::Closed {
            info!("Database closed");
        }
        self.state = SessionState::Closed;
    }

    /// Record user activity for the inactivity lock
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Lock when the inactivity timeout has passed; returns whether it locked
    pub fn lock_if_idle(&mut self) -> Result<bool> {
        if self.state != SessionState::Open {
            return Ok(false);
        }
        match self.settings.inactivity_lock {
            Some(timeout) if self.last_activity.elapsed() >= timeout => {
                debug!("Idle for {:?}, locking", timeout);
                self.lock()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Run `f` against the open database
    pub fn read<R>(&self, f: impl FnOnce(&Database) -> R) -> Result<R> {
        self.require_open()?;
        let db = self.shared()?.read();
        Ok(f(&*db))
    }

    /// Apply a mutation and mark the database as changed
    ///
    /// `f` runs against a draft copy that replaces the database only when
    /// `f` succeeds, so a failure partway through several operations leaves
    /// both the database and the unsaved-changes flag untouched.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut Database) -> Result<R>) -> Result<R> {
        self.require_writable()?;
        let result = {
            let mut db = self.shared()?.write();
            let mut draft = db.clone();
            let result = f(&mut draft)?;
            *db = draft;
            result
        };
        self.dirty = true;
        self.touch();
        Ok(result)
    }

    /// Delete a group or entry, optionally copying the affected entries to
    /// the backup group first
    ///
    /// A failed backup is logged and does not stop the delete.
    pub fn delete(&mut self, item: ItemId, backup: bool) -> Result<Deleted> {
        self.modify(|db| {
            let mut backed_up = 0;
            if backup {
                let affected = entries_to_back_up(db, item)?;
                match persist::create_backup(db, &affected) {
                    Ok(copies) => backed_up = copies.len(),
                    Err(e) => warn!("{}", e),
                }
            }
            let removed = db.delete(item)?;
            Ok(Deleted { removed, backed_up })
        })
    }

    /// Group names in tree order; available while locked
    pub fn group_names(&self) -> Result<Vec<String>> {
        match self.state {
            SessionState::Open | SessionState::Locked => {}
            _ => return Err(Error::NotOpen),
        }
        let db = self.shared()?.read();
        Ok(db
            .groups_in_tree_order()
            .into_iter()
            .map(|(group, _)| group.name.clone())
            .collect())
    }

    /// Replace the master credentials; takes effect on the next save
    pub fn change_password(&mut self, credentials: &Credentials) -> Result<()> {
        self.require_writable()?;
        let composite = credentials.composite_key()?;
        let rounds = self.params()?.rounds;
        let key = DatabaseKey::generate(&composite, rounds);

        self.keys = Some(SessionKeys::seal(&composite, key.final_key())?);
        self.params = Some(KeyParams::new(&key));
        self.verifier = self.make_verifier(&credentials.unlock_prefix());
        self.dirty = true;
        info!("Master key changed");
        Ok(())
    }

    /// Change the key transformation rounds; re-derives the key
    pub fn set_rounds(&mut self, rounds: u32) -> Result<()> {
        self.require_writable()?;
        if rounds == 0 {
            return Err(Error::ValidationError(
                "Key transformation rounds must be greater than 0".to_string(),
            ));
        }
        let composite = self.sealed_keys()?.composite()?;
        let key = DatabaseKey::generate(&composite, rounds);
        let keys = SessionKeys::seal(&composite, key.final_key())?;

        self.shared()?.write().set_rounds(rounds)?;
        self.keys = Some(keys);
        self.params = Some(KeyParams::new(&key));
        self.dirty = true;
        info!("Key transformation rounds set to {}", rounds);
        Ok(())
    }

    /// Change the payload cipher used by the next save
    pub fn set_algorithm(&mut self, algorithm: Algorithm) -> Result<()> {
        self.require_writable()?;
        self.shared()?.write().set_algorithm(algorithm);
        self.dirty = true;
        Ok(())
    }

    fn database_key(&self) -> Result<DatabaseKey> {
        self.params()?.database_key(self.sealed_keys()?)
    }

    fn coordinator(&self) -> Result<&Coordinator> {
        self.coordinator.as_ref().ok_or(Error::NotOpen)
    }

    /// Save to the database file
    pub fn save(&mut self) -> Result<()> {
        self.require_writable()?;
        let key = self.database_key()?;
        {
            let db = self.shared()?.read();
            self.coordinator()?.save(&db, &key)?;
        }
        self.dirty = false;
        self.touch();
        Ok(())
    }

    /// Save a snapshot on the blocking pool; readers keep the live database
    pub async fn save_in_background(&mut self) -> Result<()> {
        self.require_writable()?;
        let key = self.database_key()?;
        let snapshot = self.shared()?.read().clone();
        let coordinator = self.coordinator()?.clone();

        coordinator.save_in_background(snapshot, key).await?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
    }
}

/// Entries a delete of `item` would destroy, excluding ones already backed up
fn entries_to_back_up(db: &Database, item: ItemId) -> Result<Vec<EntryId>> {
    match item {
        ItemId::Entry(id) => {
            let group = db.entry_required(id)?.group;
            if persist::is_in_backup(db, group) {
                Ok(Vec::new())
            } else {
                Ok(vec![id])
            }
        }
        ItemId::Group(id) => {
            db.group_required(id)?;
            if persist::is_in_backup(db, id) {
                return Ok(Vec::new());
            }
            Ok(db
                .subtree(id)
                .into_iter()
                .filter_map(|g| db.group(g))
                .flat_map(|g| g.entries().iter().copied())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{EntryFields, GroupId, SearchScope};
    use tempfile::TempDir;

    const ROUNDS: u32 = 1000;

    fn settings() -> SessionSettings {
        SessionSettings {
            fast_unlock: true,
            fast_unlock_retries: 3,
            argon2_memory_kib: 64,
            inactivity_lock: None,
        }
    }

    fn created(dir: &TempDir, password: &str) -> (Session, PathBuf) {
        let path = dir.path().join("passwords.kdb");
        let mut session = Session::new(settings());
        session
            .create(&path, &Credentials::new(password), Algorithm::Aes256, ROUNDS)
            .unwrap();
        (session, path)
    }

    #[test]
    fn test_create_save_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("passwords.kdb");
        let credentials = Credentials::new("Tr0ub4dor&3");

        let mut session = Session::new(settings());
        session
            .create(&path, &credentials, Algorithm::Aes256, 6000)
            .unwrap();
        assert_eq!(session.state(), SessionState::Open);

        session
            .modify(|db| {
                let email = db.add_group(None, "Email")?;
                db.add_entry(email, &EntryFields::new("Gmail").username("alice"))
            })
            .unwrap();
        assert!(session.is_dirty());
        session.save().unwrap();
        assert!(!session.is_dirty());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        session.open(&path, &credentials, false).unwrap();
        let found = session
            .read(|db| {
                db.search("gmail", SearchScope::Database)
                    .unwrap()
                    .map(|e| e.username.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(found, ["alice"]);
        assert_eq!(session.read(|db| db.rounds()).unwrap(), 6000);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        session.close();

        let result = session.create(&path, &Credentials::new("pw"), Algorithm::Aes256, ROUNDS);
        assert!(matches!(result, Err(Error::DatabaseExists(_))));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_open_missing_and_wrong_password() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::new(settings());
        assert!(matches!(
            session.open(dir.path().join("nope.kdb"), &Credentials::new("pw"), false),
            Err(Error::DatabaseNotFound(_))
        ));

        let (mut session, path) = created(&dir, "right");
        session.close();
        assert!(matches!(
            session.open(&path, &Credentials::new("wrong"), false),
            Err(Error::WrongCredentials)
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.read(|_| ()).is_err());
    }

    #[test]
    fn test_missing_key_file() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        session.close();

        let credentials = Credentials::new("pw").with_key_file(dir.path().join("missing.key"));
        assert!(matches!(
            session.open(&path, &credentials, false),
            Err(Error::KeyFileUnavailable { .. })
        ));
    }

    #[test]
    fn test_fast_unlock() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = created(&dir, "Tr0ub4dor&3");

        session.lock().unwrap();
        assert_eq!(session.state(), SessionState::Locked);
        assert!(session.read(|_| ()).is_err());

        session.fast_unlock("Tr0").unwrap();
        assert_eq!(session.state(), SessionState::Open);
        session.save().unwrap();
    }

    #[test]
    fn test_fast_unlock_exhaustion() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = created(&dir, "Tr0ub4dor&3");
        session.lock().unwrap();

        assert!(matches!(
            session.fast_unlock("abc"),
            Err(Error::WrongUnlockCode { tries_left: 2 })
        ));
        assert!(matches!(
            session.fast_unlock("abd"),
            Err(Error::WrongUnlockCode { tries_left: 1 })
        ));
        assert!(matches!(session.fast_unlock("abe"), Err(Error::FastUnlockExhausted)));
        assert!(matches!(session.fast_unlock("Tr0"), Err(Error::FastUnlockExhausted)));
        assert_eq!(session.state(), SessionState::Locked);
        assert!(session.keys.is_none());

        // The in-memory database survives; the full password restores access
        assert_eq!(session.group_names().unwrap(), Vec::<String>::new());
        assert!(matches!(
            session.unlock(&Credentials::new("Tr0ub4dor&x")),
            Err(Error::WrongCredentials)
        ));
        session.unlock(&Credentials::new("Tr0ub4dor&3")).unwrap();
        assert_eq!(session.fast_unlock_tries_left(), 3);
        session.save().unwrap();

        session.lock().unwrap();
        session.fast_unlock("Tr0").unwrap();
    }

    #[test]
    fn test_lock_without_fast_unlock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("passwords.kdb");
        let mut session = Session::new(SessionSettings {
            fast_unlock: false,
            ..settings()
        });
        session
            .create(&path, &Credentials::new("secret"), Algorithm::Twofish, ROUNDS)
            .unwrap();

        session.lock().unwrap();
        assert!(session.keys.is_none());
        assert!(matches!(session.fast_unlock("sec"), Err(Error::FastUnlockUnavailable)));
        session.unlock(&Credentials::new("secret")).unwrap();
        session.save().unwrap();
    }

    #[test]
    fn test_read_only() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        session.close();

        session.open(&path, &Credentials::new("pw"), true).unwrap();
        assert!(session.is_read_only());
        assert!(matches!(
            session.modify(|db| db.add_group(None, "x")),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(session.save(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_failed_mutation_keeps_clean_state() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = created(&dir, "pw");
        assert!(session.modify(|db| db.add_group(None, "")).is_err());
        assert!(!session.is_dirty());
    }

    #[test]
    fn test_change_password() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "old");
        session.change_password(&Credentials::new("new")).unwrap();
        session.save().unwrap();
        session.close();

        assert!(matches!(
            session.open(&path, &Credentials::new("old"), false),
            Err(Error::WrongCredentials)
        ));
        session.open(&path, &Credentials::new("new"), false).unwrap();
    }

    #[test]
    fn test_set_rounds_and_algorithm() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        assert!(matches!(session.set_rounds(0), Err(Error::ValidationError(_))));

        session.set_rounds(2000).unwrap();
        session.set_algorithm(Algorithm::Twofish).unwrap();
        session.save().unwrap();
        session.close();

        session.open(&path, &Credentials::new("pw"), false).unwrap();
        let (rounds, algorithm) = session.read(|db| (db.rounds(), db.algorithm())).unwrap();
        assert_eq!(rounds, 2000);
        assert_eq!(algorithm, Algorithm::Twofish);
    }

    #[test]
    fn test_lock_if_idle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("passwords.kdb");
        let mut session = Session::new(SessionSettings {
            inactivity_lock: Some(Duration::ZERO),
            ..settings()
        });
        session
            .create(&path, &Credentials::new("pw"), Algorithm::Aes256, ROUNDS)
            .unwrap();

        assert!(session.lock_if_idle().unwrap());
        assert_eq!(session.state(), SessionState::Locked);
        assert!(!session.lock_if_idle().unwrap());
    }

    #[test]
    fn test_delete_with_backup() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = created(&dir, "pw");
        let (group, entry) = session
            .modify(|db| {
                let g = db.add_group(None, "Email")?;
                let e = db.add_entry(g, &EntryFields::new("Gmail"))?;
                Ok((g, e))
            })
            .unwrap();

        let deleted = session.delete(ItemId::Group(group), true).unwrap();
        assert_eq!(deleted.removed, Removed { groups: 1, entries: 1 });
        assert_eq!(deleted.backed_up, 1);

        let backed_up = session
            .read(|db| {
                let backup = persist::backup_group(db).unwrap();
                db.entries_in(backup, Default::default())
                    .unwrap()
                    .iter()
                    .map(|e| (e.id, e.title.clone()))
                    .collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(backed_up.len(), 1);
        assert_ne!(backed_up[0].0, entry);
        assert_eq!(backed_up[0].1, "Gmail");
        assert_eq!(session.group_names().unwrap(), ["Backup"]);
    }

    #[test]
    fn test_delete_inside_backup_makes_no_copies() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = created(&dir, "pw");
        let entry = session
            .modify(|db| {
                let g = db.add_group(None, "Email")?;
                db.add_entry(g, &EntryFields::new("Gmail"))
            })
            .unwrap();
        session.delete(ItemId::Entry(entry), true).unwrap();

        let copy = session
            .read(|db| {
                let backup = persist::backup_group(db).unwrap();
                db.group(backup).unwrap().entries()[0]
            })
            .unwrap();
        let deleted = session.delete(ItemId::Entry(copy), true).unwrap();
        assert_eq!(deleted.removed, Removed { groups: 0, entries: 1 });
        assert_eq!(deleted.backed_up, 0);

        let deleted = session.delete(ItemId::Entry(entry), false);
        assert!(matches!(deleted, Err(Error::EntryNotFound(_))));
    }

    #[test]
    fn test_failed_multi_step_mutation_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = created(&dir, "pw");

        let result = session.modify(|db| {
            let g = db.add_group(None, "Email")?;
            db.add_entry(g, &EntryFields::new(""))
        });
        assert!(result.is_err());
        assert!(!session.is_dirty());
        assert_eq!(session.read(|db| db.group_count()).unwrap(), 0);

        session.modify(|db| db.add_group(None, "Email")).unwrap();
        let result = session.modify(|db| {
            let g = db.add_group(None, "Banking")?;
            db.rename_group(g, "Bank")?;
            db.add_group(Some(GroupId(9999)), "Orphan")
        });
        assert!(matches!(result, Err(Error::ParentNotFound(9999))));
        assert_eq!(session.group_names().unwrap(), ["Email"]);
    }

    #[test]
    fn test_locked_and_read_only_sessions_refuse_tree_access() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        session.modify(|db| db.add_group(None, "Email")).unwrap();
        session.save().unwrap();

        session.lock().unwrap();
        assert!(matches!(session.read(|db| db.group_count()), Err(Error::InvalidState(_))));
        assert!(matches!(
            session.modify(|db| db.add_group(None, "Sneaky")),
            Err(Error::InvalidState(_))
        ));
        session.fast_unlock("pw").unwrap();
        assert_eq!(session.group_names().unwrap(), ["Email"]);
        session.close();

        session.open(&path, &Credentials::new("pw"), true).unwrap();
        let group = session.read(|db| db.root_groups()[0]).unwrap();
        assert!(matches!(
            session.modify(|db| db.add_group(None, "Sneaky")),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(
            session.delete(ItemId::Group(group), true),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(session.set_algorithm(Algorithm::Twofish), Err(Error::ReadOnly)));
        assert!(!session.is_dirty());
        assert_eq!(session.group_names().unwrap(), ["Email"]);
    }

    #[test]
    fn test_group_names_while_locked() {
        let dir = TempDir::new().unwrap();
        let (mut session, _) = created(&dir, "pw");
        session.modify(|db| db.add_group(None, "Email")).unwrap();
        session.lock().unwrap();
        assert_eq!(session.group_names().unwrap(), ["Email"]);
    }

    #[tokio::test]
    async fn test_background_open() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        session.modify(|db| db.add_group(None, "Email")).unwrap();
        session.save_in_background().await.unwrap();
        session.close();

        session.begin_open(&path, &Credentials::new("pw"), false).unwrap();
        assert_eq!(session.state(), SessionState::Unlocking);
        session.complete_open().await.unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.group_names().unwrap(), ["Email"]);
    }

    #[tokio::test]
    async fn test_background_open_wrong_password() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        session.close();

        session.begin_open(&path, &Credentials::new("bad"), false).unwrap();
        assert!(matches!(session.complete_open().await, Err(Error::WrongCredentials)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_open() {
        let dir = TempDir::new().unwrap();
        let (mut session, path) = created(&dir, "pw");
        session.close();

        session.begin_open(&path, &Credentials::new("pw"), false).unwrap();
        session.cancel_open();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.read(|_| ()).is_err());
        assert!(matches!(session.complete_open().await, Err(Error::InvalidState(_))));

        session.open(&path, &Credentials::new("pw"), false).unwrap();
    }
}
