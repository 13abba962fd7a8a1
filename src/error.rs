//! Error types for kdbsafe

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for kdbsafe
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("Invalid padding in decrypted data")]
    InvalidPadding,

    #[error("Invalid ciphertext length: {0} bytes")]
    InvalidCiphertextLength(usize),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Credential errors
    #[error("Key file unavailable: {path:?}")]
    KeyFileUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // Container errors
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Wrong master password or key file, or the database file is corrupted")]
    WrongCredentials,

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    // Tree errors
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Parent group not found: {0}")]
    ParentNotFound(u32),

    #[error("Group not found: {0}")]
    GroupNotFound(u32),

    #[error("Entry not found: {0}")]
    EntryNotFound(uuid::Uuid),

    // Session errors
    #[error("No database opened")]
    NotOpen,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Database was opened read-only")]
    ReadOnly,

    #[error("Database file already exists: {0:?}")]
    DatabaseExists(PathBuf),

    #[error("Database file does not exist: {0:?}")]
    DatabaseNotFound(PathBuf),

    #[error("Wrong unlock code, {tries_left} tries left")]
    WrongUnlockCode { tries_left: u32 },

    #[error("Fast unlock retries exhausted, full master password required")]
    FastUnlockExhausted,

    #[error("Fast unlock is not available for this session")]
    FastUnlockUnavailable,

    // Persistence errors
    #[error("Could not save database to {path:?}: {source}")]
    SaveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Creation of backup group failed: {0}")]
    BackupFailed(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// User-visible error category.
///
/// Every failure surfaces one of these so a front end can pick a distinct
/// message without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Not a KeePass 1.x file, or an unsupported version
    UnsupportedFormat,
    /// Wrong password/key file or a corrupted file
    WrongCredentials,
    /// Decrypted content could not be parsed
    MalformedRecord,
    /// Key file is missing or unreadable
    KeyFile,
    /// Input rejected by the tree store
    Validation,
    /// Referenced group or entry does not exist
    NotFound,
    /// Fast unlock failed or is used up
    FastUnlock,
    /// Saving (or backing up before saving) failed
    Save,
    /// Operation not allowed in the current session state
    Session,
    /// Configuration could not be loaded or is invalid
    Config,
    /// Anything else (I/O, cancellation, internal crypto failures)
    Internal,
}

impl Error {
    /// Map to the user-visible category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::UnsupportedFormat(_) => ErrorCategory::UnsupportedFormat,
            Error::WrongCredentials | Error::InvalidPadding | Error::InvalidCiphertextLength(_) => {
                ErrorCategory::WrongCredentials
            }
            Error::MalformedRecord(_) => ErrorCategory::MalformedRecord,
            Error::KeyFileUnavailable { .. } => ErrorCategory::KeyFile,
            Error::ValidationError(_) => ErrorCategory::Validation,
            Error::ParentNotFound(_) | Error::GroupNotFound(_) | Error::EntryNotFound(_) => {
                ErrorCategory::NotFound
            }
            Error::WrongUnlockCode { .. }
            | Error::FastUnlockExhausted
            | Error::FastUnlockUnavailable => ErrorCategory::FastUnlock,
            Error::SaveFailed { .. } | Error::BackupFailed(_) => ErrorCategory::Save,
            Error::NotOpen
            | Error::InvalidState(_)
            | Error::ReadOnly
            | Error::DatabaseExists(_)
            | Error::DatabaseNotFound(_) => ErrorCategory::Session,
            Error::Config(_) | Error::InvalidConfig(_) => ErrorCategory::Config,
            _ => ErrorCategory::Internal,
        }
    }

    /// True when the error should be treated as a security event
    pub fn is_security_event(&self) -> bool {
        matches!(self, Error::FastUnlockExhausted)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
