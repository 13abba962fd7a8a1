//! kdbsafe - KeePass 1.x compatible password database engine
//!
//! This library reads and writes KDB password databases (AES or Twofish),
//! manages the group/entry tree in memory with passwords kept encrypted,
//! and drives the open/lock/unlock/save lifecycle of a database session.

pub mod config;
pub mod crypto;
pub mod error;
pub mod format;
pub mod generator;
pub mod persist;
pub mod session;
pub mod tree;

pub use config::Config;
pub use error::{Error, ErrorCategory, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{Algorithm, Credentials};
    pub use crate::error::{Error, Result};
    pub use crate::session::{Session, SessionSettings, SessionState};
    pub use crate::tree::{Database, Entry, EntryFields, EntryId, Group, GroupId, ItemId, SearchScope};
}
