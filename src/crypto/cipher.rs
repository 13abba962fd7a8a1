//! Block cipher engine
//!
//! Both supported algorithms use a 256-bit key, 128-bit blocks and CBC
//! chaining with PKCS#7 padding:
//! - AES-256 (Rijndael), the KeePass default
//! - Twofish-256

use crate::crypto::{IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use twofish::Twofish;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type TwofishCbcEnc = cbc::Encryptor<Twofish>;
type TwofishCbcDec = cbc::Decryptor<Twofish>;

/// Payload encryption algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// AES with a 256-bit key
    Aes256,
    /// Twofish with a 256-bit key
    Twofish,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Aes256
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Aes256 => write!(f, "AES/Rijndael"),
            Algorithm::Twofish => write!(f, "Twofish"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes" | "aes256" | "aes-256" | "rijndael" => Ok(Algorithm::Aes256),
            "twofish" => Ok(Algorithm::Twofish),
            other => Err(Error::InvalidConfig(format!("Unknown algorithm: {}", other))),
        }
    }
}

fn key_error(key: &[u8]) -> Error {
    Error::InvalidKeyLength {
        expected: KEY_SIZE,
        got: key.len(),
    }
}

/// Encrypt `plaintext` in CBC mode with PKCS#7 padding
///
/// The output is always a non-empty multiple of the block size.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    algorithm: Algorithm,
) -> Result<Vec<u8>> {
    let ciphertext = match algorithm {
        Algorithm::Aes256 => Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|_| key_error(key))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        Algorithm::Twofish => TwofishCbcEnc::new_from_slices(key, iv)
            .map_err(|_| key_error(key))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    };
    Ok(ciphertext)
}

/// Decrypt CBC `ciphertext` and strip PKCS#7 padding
///
/// Malformed padding fails with [`Error::InvalidPadding`]; it is never
/// silently truncated. A wrong key and corrupted data look the same here.
pub fn decrypt(
    ciphertext: &[u8],
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    algorithm: Algorithm,
) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % crate::crypto::BLOCK_SIZE != 0 {
        return Err(Error::InvalidCiphertextLength(ciphertext.len()));
    }

    let plaintext = match algorithm {
        Algorithm::Aes256 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| key_error(key))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        Algorithm::Twofish => TwofishCbcDec::new_from_slices(key, iv)
            .map_err(|_| key_error(key))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
    };

    plaintext.map_err(|_| Error::InvalidPadding)
}
