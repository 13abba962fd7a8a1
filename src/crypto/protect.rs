//! In-memory protection for secrets
//!
//! Passwords and key material held by an open database are kept encrypted
//! under a random per-process memory key and only decrypted transiently.

use crate::crypto::{decrypt, encrypt, random_bytes, Algorithm, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::OnceLock;
use zeroize::Zeroizing;

fn memory_key() -> &'static [u8; KEY_SIZE] {
    static MEMORY_KEY: OnceLock<[u8; KEY_SIZE]> = OnceLock::new();
    MEMORY_KEY.get_or_init(random_bytes)
}

/// Byte buffer encrypted at rest in memory
#[derive(Clone)]
pub struct ProtectedBytes {
    iv: [u8; IV_SIZE],
    ciphertext: Vec<u8>,
}

impl ProtectedBytes {
    /// Encrypt `plaintext` under the memory key
    pub fn seal(plaintext: &[u8]) -> Result<Self> {
        let iv = random_bytes();
        let ciphertext = encrypt(plaintext, memory_key(), &iv, Algorithm::Aes256)?;
        Ok(ProtectedBytes { iv, ciphertext })
    }

    /// Decrypt into a buffer that is wiped when dropped
    pub fn unseal(&self) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = decrypt(&self.ciphertext, memory_key(), &self.iv, Algorithm::Aes256)?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl fmt::Debug for ProtectedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectedBytes(***)")
    }
}

/// String encrypted at rest in memory
#[derive(Clone)]
pub struct ProtectedString {
    inner: ProtectedBytes,
    empty: bool,
}

impl ProtectedString {
    pub fn new(value: &str) -> Result<Self> {
        Ok(ProtectedString {
            inner: ProtectedBytes::seal(value.as_bytes())?,
            empty: value.is_empty(),
        })
    }

    /// An empty protected string
    pub fn empty() -> Result<Self> {
        Self::new("")
    }

    /// Decrypt the value for display or copying
    pub fn reveal(&self) -> Result<Zeroizing<String>> {
        let mut bytes = self.inner.unseal()?;
        let text = String::from_utf8(std::mem::take(&mut *bytes))
            .map_err(|e| Error::Serialization(format!("Protected string is not UTF-8: {}", e)))?;
        Ok(Zeroizing::new(text))
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }
}

impl PartialEq for ProtectedString {
    fn eq(&self, other: &Self) -> bool {
        match (self.reveal(), other.reveal()) {
            (Ok(a), Ok(b)) => *a == *b,
            _ => false,
        }
    }
}

impl Eq for ProtectedString {}

impl fmt::Debug for ProtectedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectedString(***)")
    }
}
