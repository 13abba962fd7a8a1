//! Key management for kdbsafe
//!
//! Implements the KeePass 1.x key schedule:
//! - Composite key: SHA-256 of the master password, optionally combined with key-file material
//! - Transformation: the composite key encrypted with AES-256 (keyed by the transform seed)
//!   `rounds` times, then hashed
//! - Final key: SHA-256 of the master seed and the transformed key

use crate::crypto::{sha256, BLOCK_SIZE, KEY_SIZE, MASTER_SEED_SIZE, TRANSFORM_SEED_SIZE};
use crate::error::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// Rounds computed between two cancellation checks
const CANCEL_CHECK_ROUNDS: u32 = 10_000;

/// Number of password characters used for fast unlock
pub(crate) const UNLOCK_PREFIX_CHARS: usize = 3;

/// Domain separator for the key check digest kept while locked
const KEY_CHECK_CONTEXT: &[u8] = b"kdbsafe-key-check-v1";

/// Cooperative cancellation for in-flight derivations
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// User-supplied credentials: master password and optional key file path
#[derive(Clone)]
pub struct Credentials {
    password: Zeroizing<String>,
    key_file: Option<PathBuf>,
}

impl Credentials {
    /// Credentials consisting of a master password only
    pub fn new(password: impl Into<String>) -> Self {
        Credentials {
            password: Zeroizing::new(password.into()),
            key_file: None,
        }
    }

    /// Add a key file to the credentials
    pub fn with_key_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.key_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    /// The first characters of the password, as typed for fast unlock
    pub fn unlock_prefix(&self) -> Zeroizing<String> {
        Zeroizing::new(self.password.chars().take(UNLOCK_PREFIX_CHARS).collect())
    }

    /// Read the key file, failing before any derivation when it is missing
    pub fn load_key_file(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        match &self.key_file {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|source| Error::KeyFileUnavailable {
                    path: path.clone(),
                    source,
                })?;
                Ok(Some(Zeroizing::new(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Build the composite key from these credentials
    pub fn composite_key(&self) -> Result<CompositeKey> {
        let key_file = self.load_key_file()?;
        derive_composite_key(&self.password, key_file.as_ref().map(|k| k.as_slice()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"***")
            .field("key_file", &self.key_file)
            .finish()
    }
}

/// Turn key-file content into 32 bytes of key material
///
/// A 32-byte file is used as is, a 64-byte file of hex digits is decoded,
/// anything else is hashed.
pub fn key_file_key(content: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    if content.len() == KEY_SIZE {
        key.copy_from_slice(content);
        return key;
    }
    if content.len() == 2 * KEY_SIZE && hex::decode_to_slice(content, &mut key[..]).is_ok() {
        return key;
    }
    *key = sha256(&[content]);
    key
}

/// Hash of the password and key file, before transformation
#[derive(Clone)]
pub struct CompositeKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl CompositeKey {
    /// Restore a composite key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(CompositeKey { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// Combine password and optional key-file content into a composite key
pub fn derive_composite_key(password: &str, key_file: Option<&[u8]>) -> Result<CompositeKey> {
    let key = match key_file {
        None if password.is_empty() => {
            return Err(Error::ValidationError(
                "A master password or a key file is required".to_string(),
            ))
        }
        None => sha256(&[password.as_bytes()]),
        Some(content) if password.is_empty() => *key_file_key(content),
        Some(content) => {
            let password_hash = Zeroizing::new(sha256(&[password.as_bytes()]));
            let file_key = key_file_key(content);
            sha256(&[&password_hash[..], &file_key[..]])
        }
    };
    Ok(CompositeKey {
        key: Zeroizing::new(key),
    })
}

/// Random seeds stored in the file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySeeds {
    /// Salts the final hash
    pub master_seed: [u8; MASTER_SEED_SIZE],
    /// Keys the transformation rounds
    pub transform_seed: [u8; TRANSFORM_SEED_SIZE],
}

impl KeySeeds {
    /// Fresh random seeds
    pub fn random() -> Self {
        KeySeeds {
            master_seed: crate::crypto::random_bytes(),
            transform_seed: crate::crypto::random_bytes(),
        }
    }
}

fn transform_rounds(cipher: &Aes256, key: [u8; KEY_SIZE], rounds: u32) -> [u8; KEY_SIZE] {
    (0..rounds).fold(key, |mut block, _| {
        let (left, right) = block.split_at_mut(BLOCK_SIZE);
        cipher.encrypt_block(GenericArray::from_mut_slice(left));
        cipher.encrypt_block(GenericArray::from_mut_slice(right));
        block
    })
}

/// Iterated transformation of the composite key
///
/// Deterministic: the same inputs always give the same output. Every round
/// is computed; nothing depends on the key content.
pub fn transform_key(
    composite: &CompositeKey,
    transform_seed: &[u8; TRANSFORM_SEED_SIZE],
    rounds: u32,
) -> Zeroizing<[u8; KEY_SIZE]> {
    let cipher = Aes256::new(GenericArray::from_slice(transform_seed));
    let mut block = transform_rounds(&cipher, *composite.as_bytes(), rounds);
    let transformed = Zeroizing::new(sha256(&[&block[..]]));
    block.zeroize();
    transformed
}

/// [`transform_key`] that checks `cancel` between chunks of rounds
fn transform_key_cancellable(
    composite: &CompositeKey,
    transform_seed: &[u8; TRANSFORM_SEED_SIZE],
    rounds: u32,
    cancel: &CancelFlag,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let cipher = Aes256::new(GenericArray::from_slice(transform_seed));
    let mut block = *composite.as_bytes();
    let mut remaining = rounds;

    while remaining > 0 {
        if cancel.is_cancelled() {
            block.zeroize();
            debug!("Key transformation cancelled with {} rounds left", remaining);
            return Err(Error::Cancelled);
        }
        let chunk = remaining.min(CANCEL_CHECK_ROUNDS);
        block = transform_rounds(&cipher, block, chunk);
        remaining -= chunk;
    }

    let transformed = Zeroizing::new(sha256(&[&block[..]]));
    block.zeroize();
    Ok(transformed)
}

/// Key used directly by the cipher engine
#[derive(Clone)]
pub struct FinalKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl FinalKey {
    fn from_transformed(master_seed: &[u8; MASTER_SEED_SIZE], transformed: &[u8; KEY_SIZE]) -> Self {
        FinalKey {
            key: Zeroizing::new(sha256(&[&master_seed[..], &transformed[..]])),
        }
    }

    /// Derive the final key for the given seeds and rounds
    pub fn derive(composite: &CompositeKey, seeds: &KeySeeds, rounds: u32) -> Self {
        let transformed = transform_key(composite, &seeds.transform_seed, rounds);
        Self::from_transformed(&seeds.master_seed, &transformed)
    }

    /// Cancellable variant of [`FinalKey::derive`]
    pub fn derive_cancellable(
        composite: &CompositeKey,
        seeds: &KeySeeds,
        rounds: u32,
        cancel: &CancelFlag,
    ) -> Result<Self> {
        let transformed = transform_key_cancellable(composite, &seeds.transform_seed, rounds, cancel)?;
        Ok(Self::from_transformed(&seeds.master_seed, &transformed))
    }

    /// Restore a final key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(FinalKey { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Digest that lets a later derivation be verified without keeping the key
    pub fn check_digest(&self) -> [u8; KEY_SIZE] {
        sha256(&[KEY_CHECK_CONTEXT, &self.key[..]])
    }
}

/// Everything needed to encrypt a database: seeds, rounds and the final key
#[derive(Clone)]
pub struct DatabaseKey {
    seeds: KeySeeds,
    rounds: u32,
    final_key: FinalKey,
}

impl DatabaseKey {
    /// Derive with fresh random seeds
    pub fn generate(composite: &CompositeKey, rounds: u32) -> Self {
        Self::derive(composite, KeySeeds::random(), rounds)
    }

    /// Derive for existing seeds (e.g. read from a file header)
    pub fn derive(composite: &CompositeKey, seeds: KeySeeds, rounds: u32) -> Self {
        let final_key = FinalKey::derive(composite, &seeds, rounds);
        DatabaseKey {
            seeds,
            rounds,
            final_key,
        }
    }

    /// Cancellable variant of [`DatabaseKey::derive`]
    pub fn derive_cancellable(
        composite: &CompositeKey,
        seeds: KeySeeds,
        rounds: u32,
        cancel: &CancelFlag,
    ) -> Result<Self> {
        let final_key = FinalKey::derive_cancellable(composite, &seeds, rounds, cancel)?;
        Ok(DatabaseKey {
            seeds,
            rounds,
            final_key,
        })
    }

    /// Reassemble from parts kept elsewhere (e.g. sealed while locked)
    pub fn from_parts(seeds: KeySeeds, rounds: u32, final_key: FinalKey) -> Self {
        DatabaseKey {
            seeds,
            rounds,
            final_key,
        }
    }

    pub fn seeds(&self) -> &KeySeeds {
        &self.seeds
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn final_key(&self) -> &FinalKey {
        &self.final_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeds() -> KeySeeds {
        KeySeeds {
            master_seed: [1u8; MASTER_SEED_SIZE],
            transform_seed: [2u8; TRANSFORM_SEED_SIZE],
        }
    }

    #[test]
    fn test_composite_password_only() {
        let key = derive_composite_key("password", None).unwrap();
        assert_eq!(key.as_bytes(), &sha256(&[&b"password"[..]]));
    }

    #[test]
    fn test_composite_with_key_file() {
        let content = b"some key file content that is not 32 or 64 bytes";
        let with_file = derive_composite_key("password", Some(content)).unwrap();
        let without_file = derive_composite_key("password", None).unwrap();
        assert_ne!(with_file.as_bytes(), without_file.as_bytes());

        let expected = sha256(&[&sha256(&[&b"password"[..]])[..], &sha256(&[&content[..]])[..]]);
        assert_eq!(with_file.as_bytes(), &expected);

        // Both parts contribute
        let other_file = derive_composite_key("password", Some(b"different")).unwrap();
        assert_ne!(with_file.as_bytes(), other_file.as_bytes());
    }

    #[test]
    fn test_composite_requires_something() {
        assert!(matches!(
            derive_composite_key("", None),
            Err(Error::ValidationError(_))
        ));
        assert!(derive_composite_key("", Some(b"key file only")).is_ok());
    }

    #[test]
    fn test_key_file_formats() {
        let raw = [0xABu8; 32];
        assert_eq!(*key_file_key(&raw), raw);

        let hex_content = hex::encode([0x11u8; 32]);
        assert_eq!(*key_file_key(hex_content.as_bytes()), [0x11u8; 32]);

        // 64 bytes that are not hex get hashed
        let not_hex = [b'z'; 64];
        assert_eq!(*key_file_key(&not_hex), sha256(&[&not_hex[..]]));
    }

    #[test]
    fn test_transform_deterministic() {
        let composite = derive_composite_key("Tr0ub4dor&3", None).unwrap();
        let a = FinalKey::derive(&composite, &seeds(), 1000);
        let b = FinalKey::derive(&composite, &seeds(), 1000);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_transform_depends_on_rounds_and_seeds() {
        let composite = derive_composite_key("password", None).unwrap();
        let base = FinalKey::derive(&composite, &seeds(), 100);
        let more_rounds = FinalKey::derive(&composite, &seeds(), 101);
        let mut other = seeds();
        other.master_seed[0] ^= 1;
        let other_seed = FinalKey::derive(&composite, &other, 100);

        assert_ne!(base.as_bytes(), more_rounds.as_bytes());
        assert_ne!(base.as_bytes(), other_seed.as_bytes());
    }

    #[test]
    fn test_zero_rounds_is_plain_hash() {
        let composite = derive_composite_key("password", None).unwrap();
        let transformed = transform_key(&composite, &[0u8; TRANSFORM_SEED_SIZE], 0);
        assert_eq!(*transformed, sha256(&[&composite.as_bytes()[..]]));
    }

    #[test]
    fn test_cancellable_matches_plain() {
        let composite = derive_composite_key("password", None).unwrap();
        let rounds = CANCEL_CHECK_ROUNDS * 2 + 17;
        let plain = FinalKey::derive(&composite, &seeds(), rounds);
        let chunked =
            FinalKey::derive_cancellable(&composite, &seeds(), rounds, &CancelFlag::new()).unwrap();
        assert_eq!(plain.as_bytes(), chunked.as_bytes());
    }

    #[test]
    fn test_cancelled_derivation() {
        let composite = derive_composite_key("password", None).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = FinalKey::derive_cancellable(&composite, &seeds(), 1_000_000, &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_missing_key_file() {
        let credentials = Credentials::new("password").with_key_file("/nonexistent/key.file");
        assert!(matches!(
            credentials.composite_key(),
            Err(Error::KeyFileUnavailable { .. })
        ));
    }

    #[test]
    fn test_credentials_with_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keyfile.bin");
        std::fs::write(&path, b"key file bytes").unwrap();

        let credentials = Credentials::new("password").with_key_file(&path);
        let composite = credentials.composite_key().unwrap();
        let expected = derive_composite_key("password", Some(b"key file bytes")).unwrap();
        assert_eq!(composite.as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_unlock_prefix_uses_characters() {
        assert_eq!(Credentials::new("äöüxyz").unlock_prefix().as_str(), "äöü");
        assert_eq!(Credentials::new("ab").unlock_prefix().as_str(), "ab");
    }

    #[test]
    fn test_check_digest_verifies_key() {
        let composite = derive_composite_key("password", None).unwrap();
        let key = DatabaseKey::derive(&composite, seeds(), 10);
        let again = DatabaseKey::derive(&composite, seeds(), 10);
        assert_eq!(
            key.final_key().check_digest(),
            again.final_key().check_digest()
        );
        assert_ne!(&key.final_key().check_digest(), key.final_key().as_bytes());
    }
}
