//! Backup group for entries about to be changed destructively

use crate::error::{Error, Result};
use crate::tree::{Database, EntryId, GroupId};
use tracing::info;

/// Name of the top-level backup group
pub const BACKUP_GROUP_NAME: &str = "Backup";

/// Icon of the backup group (the desktop client's trash can)
pub const BACKUP_GROUP_ICON: u32 = 4;

/// Find the backup group, if present
pub fn backup_group(db: &Database) -> Option<GroupId> {
    db.find_root_group(BACKUP_GROUP_NAME)
}

/// Copy `entries` into the backup group, creating it on demand
///
/// Every id is checked before anything is changed. Returns the ids of the
/// copies.
pub fn create_backup(db: &mut Database, entries: &[EntryId]) -> Result<Vec<EntryId>> {
    for id in entries {
        if db.entry(*id).is_none() {
            return Err(Error::BackupFailed(format!("Entry {} does not exist", id)));
        }
    }
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let group = match backup_group(db) {
        Some(group) => group,
        None => {
            let group = db
                .add_group(None, BACKUP_GROUP_NAME)
                .map_err(|e| Error::BackupFailed(e.to_string()))?;
            db.set_group_icon(group, BACKUP_GROUP_ICON)
                .map_err(|e| Error::BackupFailed(e.to_string()))?;
            group
        }
    };

    let copies = entries
        .iter()
        .map(|id| db.duplicate_entry(*id, group))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| Error::BackupFailed(e.to_string()))?;

    info!("Backed up {} entries into group {}", copies.len(), group);
    Ok(copies)
}

/// Whether `group` is the backup group or lies inside it
pub fn is_in_backup(db: &Database, group: GroupId) -> bool {
    match backup_group(db) {
        Some(backup) => {
            group == backup
                || db
                    .ancestors(group)
                    .map(|chain| chain.contains(&backup))
                    .unwrap_or(false)
        }
        None => false,
    }
}
