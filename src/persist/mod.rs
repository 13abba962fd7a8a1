//! Persistence: atomic saves and backup groups

mod backup;
mod coordinator;

pub use backup::{backup_group, create_backup, is_in_backup, BACKUP_GROUP_ICON, BACKUP_GROUP_NAME};
pub use coordinator::{write_atomic, Coordinator, SaveState};
