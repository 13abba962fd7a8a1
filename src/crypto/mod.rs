//! Cryptography module for kdbsafe
//!
//! Provides AES-256 and Twofish in CBC mode, the KeePass 1.x key schedule
//! (composite key, iterated transformation, final key) and in-memory
//! protection for secrets held while a database is open.

mod cipher;
mod keys;
mod protect;

pub use cipher::{decrypt, encrypt, Algorithm};
pub use keys::{
    derive_composite_key, key_file_key, transform_key, CancelFlag, CompositeKey, Credentials,
    DatabaseKey, FinalKey, KeySeeds,
};
pub use protect::{ProtectedBytes, ProtectedString};

use rand::RngCore;
use ring::digest::{Context, SHA256};

/// Size of the cipher key in bytes (AES-256 and Twofish-256)
pub const KEY_SIZE: usize = 32;

/// Cipher block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Size of the CBC initialization vector
pub const IV_SIZE: usize = 16;

/// Size of the master seed stored in the header
pub const MASTER_SEED_SIZE: usize = 16;

/// Size of the transform seed stored in the header
pub const TRANSFORM_SEED_SIZE: usize = 32;

/// Size of a SHA-256 digest
pub const DIGEST_SIZE: usize = 32;

/// SHA-256 over the concatenation of `parts`
pub fn sha256(parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    let mut ctx = Context::new(&SHA256);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// Fill a fixed-size array from the thread RNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Compare two byte strings without an early exit on the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
