//! Quick re-entry to a locked session with the first password characters
//!
//! Only an Argon2id hash of the prefix is kept, never the prefix itself.
//! Each wrong guess spends one try; when the budget is gone the session
//! falls back to the full master password.

use crate::crypto::{constant_time_eq, random_bytes, KEY_SIZE};
use crate::error::{Error, Result};
use argon2::{Argon2, ParamsBuilder, Version};
use zeroize::Zeroizing;

const SALT_SIZE: usize = 16;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

/// Hash of the unlock prefix
pub(crate) struct UnlockVerifier {
    salt: [u8; SALT_SIZE],
    digest: Zeroizing<[u8; KEY_SIZE]>,
    memory_kib: u32,
}

impl UnlockVerifier {
    pub(crate) fn new(prefix: &str, memory_kib: u32) -> Result<Self> {
        let salt = random_bytes();
        let digest = hash_prefix(prefix, &salt, memory_kib)?;
        Ok(UnlockVerifier {
            salt,
            digest,
            memory_kib,
        })
    }

    pub(crate) fn matches(&self, prefix: &str) -> Result<bool> {
        let candidate = hash_prefix(prefix, &self.salt, self.memory_kib)?;
        Ok(constant_time_eq(&candidate[..], &self.digest[..]))
    }
}

fn hash_prefix(
    prefix: &str,
    salt: &[u8; SALT_SIZE],
    memory_kib: u32,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let params = ParamsBuilder::new()
        .m_cost(memory_kib)
        .t_cost(ARGON2_ITERATIONS)
        .p_cost(ARGON2_PARALLELISM)
        .output_len(KEY_SIZE)
        .build()
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(prefix.as_bytes(), salt, &mut *out)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
    Ok(out)
}

/// Remaining fast-unlock guesses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryBudget {
    initial: u32,
    left: u32,
}

impl RetryBudget {
    pub(crate) fn new(initial: u32) -> Self {
        RetryBudget {
            initial,
            left: initial,
        }
    }

    pub(crate) fn left(&self) -> u32 {
        self.left
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.left == 0
    }

    /// Spend one try and return how many remain
    pub(crate) fn spend(&mut self) -> u32 {
        self.left = self.left.saturating_sub(1);
        self.left
    }

    pub(crate) fn reset(&mut self) {
        self.left = self.initial;
    }
}
