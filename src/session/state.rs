//! Session lifecycle states and the key material they carry

use crate::crypto::{CompositeKey, DatabaseKey, FinalKey, KeySeeds, ProtectedBytes, KEY_SIZE};
use crate::error::Result;
use std::fmt;

/// Lifecycle of the single database a session manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No database
    #[default]
    Closed,
    /// Key derivation for an open is running in the background
    Unlocking,
    /// Decrypted and usable
    Open,
    /// Still in memory but hidden until unlocked
    Locked,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Unlocking => "unlocking",
            SessionState::Open => "open",
            SessionState::Locked => "locked",
        };
        write!(f, "{}", name)
    }
}

/// Composite and final key, sealed in protected memory
pub(crate) struct SessionKeys {
    composite: ProtectedBytes,
    final_key: ProtectedBytes,
}

impl SessionKeys {
    pub(crate) fn seal(composite: &CompositeKey, final_key: &FinalKey) -> Result<Self> {
        Ok(SessionKeys {
            composite: ProtectedBytes::seal(composite.as_bytes())?,
            final_key: ProtectedBytes::seal(final_key.as_bytes())?,
        })
    }

    pub(crate) fn composite(&self) -> Result<CompositeKey> {
        CompositeKey::from_bytes(&self.composite.unseal()?)
    }

    pub(crate) fn final_key(&self) -> Result<FinalKey> {
        FinalKey::from_bytes(&self.final_key.unseal()?)
    }
}

/// Non-secret key parameters, kept for the lifetime of an open database
pub(crate) struct KeyParams {
    pub(crate) seeds: KeySeeds,
    pub(crate) rounds: u32,
    /// Lets a full unlock verify a fresh derivation without the old key
    pub(crate) check: [u8; KEY_SIZE],
}

impl KeyParams {
    pub(crate) fn new(key: &DatabaseKey) -> Self {
        KeyParams {
            seeds: key.seeds().clone(),
            rounds: key.rounds(),
            check: key.final_key().check_digest(),
        }
    }

    /// Put a database key back together from sealed keys
    pub(crate) fn database_key(&self, keys: &SessionKeys) -> Result<DatabaseKey> {
        Ok(DatabaseKey::from_parts(
            self.seeds.clone(),
            self.rounds,
            keys.final_key()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_composite_key;

    #[test]
    fn test_sealed_keys_round_trip() {
        let composite = derive_composite_key("pw", None).unwrap();
        let key = DatabaseKey::generate(&composite, 100);
        let keys = SessionKeys::seal(&composite, key.final_key()).unwrap();
        let params = KeyParams::new(&key);

        assert_eq!(keys.composite().unwrap().as_bytes(), composite.as_bytes());
        let restored = params.database_key(&keys).unwrap();
        assert_eq!(restored.final_key().as_bytes(), key.final_key().as_bytes());
        assert_eq!(restored.seeds(), key.seeds());
        assert_eq!(params.check, key.final_key().check_digest());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::default().to_string(), "closed");
        assert_eq!(SessionState::Locked.to_string(), "locked");
    }
}
