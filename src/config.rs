//! Configuration management for kdbsafe

use crate::crypto::Algorithm;
use crate::error::{Error, Result};
use crate::tree::DEFAULT_ROUNDS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default fast unlock retry budget
pub const DEFAULT_FAST_UNLOCK_RETRIES: u32 = 3;

/// Default inactivity lock: 5 minutes
pub const DEFAULT_INACTIVITY_LOCK_SECS: u64 = 300;

/// Default Argon2 memory cost for the fast unlock verifier: 4 MiB
pub const DEFAULT_ARGON2_MEMORY_KIB: u32 = 4096;

/// Settings applied to newly created databases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Payload cipher (aes256, twofish)
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Key transformation rounds
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

fn default_rounds() -> u32 {
    DEFAULT_ROUNDS
}

/// Lock and unlock behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityConfig {
    /// Allow unlocking a locked session with the first password characters
    #[serde(default = "default_true")]
    pub fast_unlock: bool,

    /// Wrong fast unlock codes allowed before the full password is required
    #[serde(default = "default_fast_unlock_retries")]
    pub fast_unlock_retries: u32,

    /// Lock after this many idle seconds (0 = never)
    #[serde(default = "default_inactivity_lock_secs")]
    pub inactivity_lock_secs: u64,

    /// Argon2 memory cost in KiB for the fast unlock verifier
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,
}

fn default_true() -> bool {
    true
}

fn default_fast_unlock_retries() -> u32 {
    DEFAULT_FAST_UNLOCK_RETRIES
}

fn default_inactivity_lock_secs() -> u64 {
    DEFAULT_INACTIVITY_LOCK_SECS
}

fn default_argon2_memory_kib() -> u32 {
    DEFAULT_ARGON2_MEMORY_KIB
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

/// Last database the user worked with
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentDatabase {
    pub path: PathBuf,

    /// Key file used together with the password, if any
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Defaults for new databases
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Lock and unlock behaviour
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Most recently opened database
    #[serde(default)]
    pub recent_database: Option<RecentDatabase>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            algorithm: Algorithm::Aes256,
            rounds: DEFAULT_ROUNDS,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            fast_unlock: true,
            fast_unlock_retries: DEFAULT_FAST_UNLOCK_RETRIES,
            inactivity_lock_secs: DEFAULT_INACTIVITY_LOCK_SECS,
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
            recent_database: None,
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kdbsafe")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(algorithm) = std::env::var("KDBSAFE_ALGORITHM") {
            if let Ok(algorithm) = algorithm.trim().parse::<Algorithm>() {
                self.database.algorithm = algorithm;
            }
        }

        if let Ok(rounds) = std::env::var("KDBSAFE_ROUNDS") {
            if let Ok(rounds) = rounds.trim().parse::<u32>() {
                self.database.rounds = rounds;
            }
        }

        if let Ok(retries) = std::env::var("KDBSAFE_FAST_UNLOCK_RETRIES") {
            if let Ok(retries) = retries.trim().parse::<u32>() {
                self.security.fast_unlock_retries = retries;
            }
        }

        if let Ok(level) = std::env::var("KDBSAFE_LOG") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.rounds == 0 {
            return Err(Error::InvalidConfig(
                "Key transformation rounds must be greater than 0".to_string(),
            ));
        }

        if self.security.fast_unlock_retries == 0 {
            return Err(Error::InvalidConfig(
                "Fast unlock retries must be greater than 0".to_string(),
            ));
        }

        if self.security.argon2_memory_kib < 8 {
            return Err(Error::InvalidConfig(
                "Argon2 memory cost must be at least 8 KiB".to_string(),
            ));
        }

        Ok(())
    }

    /// Remember the database that was just opened
    pub fn set_recent_database(&mut self, path: &Path, key_file: Option<&Path>) {
        self.recent_database = Some(RecentDatabase {
            path: path.to_path_buf(),
            key_file: key_file.map(Path::to_path_buf),
        });
    }
}
