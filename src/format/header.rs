//! Fixed-size file header

use crate::crypto::{
    Algorithm, KeySeeds, DIGEST_SIZE, IV_SIZE, MASTER_SEED_SIZE, TRANSFORM_SEED_SIZE,
};
use crate::error::{Error, Result};
use crate::format::reader::ByteReader;

/// First signature word
pub const SIGNATURE_1: u32 = 0x9AA2_D903;

/// Second signature word (KeePass 1.x)
pub const SIGNATURE_2: u32 = 0xB54B_FB65;

/// Version written by this implementation
pub const FILE_VERSION: u32 = 0x0003_0004;

/// Only the major and minor version must match
const VERSION_MASK: u32 = 0xFFFF_FF00;

/// Header flags
pub const FLAG_SHA2: u32 = 1;
pub const FLAG_RIJNDAEL: u32 = 2;
pub const FLAG_ARCFOUR: u32 = 4;
pub const FLAG_TWOFISH: u32 = 8;

/// Size of the encoded header
pub const HEADER_SIZE: usize = 124;

/// Decoded file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flags: u32,
    pub version: u32,
    pub master_seed: [u8; MASTER_SEED_SIZE],
    pub iv: [u8; IV_SIZE],
    pub group_count: u32,
    pub entry_count: u32,
    /// SHA-256 of the decrypted payload
    pub contents_hash: [u8; DIGEST_SIZE],
    pub transform_seed: [u8; TRANSFORM_SEED_SIZE],
    pub rounds: u32,
}

impl Header {
    /// Parse and validate the header at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::UnsupportedFormat(format!(
                "File too short for a KeePass 1.x header: {} bytes",
                bytes.len()
            )));
        }

        let mut reader = ByteReader::new(&bytes[..HEADER_SIZE]);
        let truncated = || Error::UnsupportedFormat("Truncated header".to_string());

        let signature_1 = reader.u32().ok_or_else(truncated)?;
        let signature_2 = reader.u32().ok_or_else(truncated)?;
        if signature_1 != SIGNATURE_1 || signature_2 != SIGNATURE_2 {
            return Err(Error::UnsupportedFormat(format!(
                "Not a KeePass 1.x database (signature {:08x} {:08x})",
                signature_1, signature_2
            )));
        }

        let header = Header {
            flags: reader.u32().ok_or_else(truncated)?,
            version: reader.u32().ok_or_else(truncated)?,
            master_seed: reader.array().ok_or_else(truncated)?,
            iv: reader.array().ok_or_else(truncated)?,
            group_count: reader.u32().ok_or_else(truncated)?,
            entry_count: reader.u32().ok_or_else(truncated)?,
            contents_hash: reader.array().ok_or_else(truncated)?,
            transform_seed: reader.array().ok_or_else(truncated)?,
            rounds: reader.u32().ok_or_else(truncated)?,
        };

        if header.version & VERSION_MASK != FILE_VERSION & VERSION_MASK {
            return Err(Error::UnsupportedFormat(format!(
                "Unsupported file version {:08x}",
                header.version
            )));
        }
        header.algorithm()?;

        Ok(header)
    }

    /// Build a header for a new save
    pub fn new(
        algorithm: Algorithm,
        seeds: &KeySeeds,
        iv: [u8; IV_SIZE],
        rounds: u32,
        group_count: u32,
        entry_count: u32,
        contents_hash: [u8; DIGEST_SIZE],
    ) -> Self {
        let cipher_flag = match algorithm {
            Algorithm::Aes256 => FLAG_RIJNDAEL,
            Algorithm::Twofish => FLAG_TWOFISH,
        };
        Header {
            flags: FLAG_SHA2 | cipher_flag,
            version: FILE_VERSION,
            master_seed: seeds.master_seed,
            iv,
            group_count,
            entry_count,
            contents_hash,
            transform_seed: seeds.transform_seed,
            rounds,
        }
    }

    /// Payload cipher selected by the flags
    pub fn algorithm(&self) -> Result<Algorithm> {
        if self.flags & FLAG_RIJNDAEL != 0 {
            Ok(Algorithm::Aes256)
        } else if self.flags & FLAG_TWOFISH != 0 {
            Ok(Algorithm::Twofish)
        } else if self.flags & FLAG_ARCFOUR != 0 {
            Err(Error::UnsupportedFormat("ArcFour encryption is not supported".to_string()))
        } else {
            Err(Error::UnsupportedFormat(format!(
                "No supported cipher in header flags {:08x}",
                self.flags
            )))
        }
    }

    pub fn seeds(&self) -> KeySeeds {
        KeySeeds {
            master_seed: self.master_seed,
            transform_seed: self.transform_seed,
        }
    }

    /// Encode to the on-disk layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        out.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.master_seed);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.group_count.to_le_bytes());
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.contents_hash);
        out.extend_from_slice(&self.transform_seed);
        out.extend_from_slice(&self.rounds.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header::new(
            Algorithm::Twofish,
            &KeySeeds {
                master_seed: [1; MASTER_SEED_SIZE],
                transform_seed: [2; TRANSFORM_SEED_SIZE],
            },
            [3; IV_SIZE],
            6000,
            4,
            9,
            [5; DIGEST_SIZE],
        )
    }

    #[test]
    fn test_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], &[0x03, 0xD9, 0xA2, 0x9A]);
        assert_eq!(&bytes[4..8], &[0x65, 0xFB, 0x4B, 0xB5]);
        assert_eq!(&bytes[8..12], &(FLAG_SHA2 | FLAG_TWOFISH).to_le_bytes());
        assert_eq!(&bytes[48..52], &4u32.to_le_bytes());
        assert_eq!(&bytes[120..124], &6000u32.to_le_bytes());
        assert_eq!(Header::parse(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_short_input() {
        assert!(matches!(Header::parse(&[]), Err(Error::UnsupportedFormat(_))));
        assert!(matches!(
            Header::parse(&[0u8; HEADER_SIZE - 1]),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = sample().to_bytes();
        bytes[4] = 0x67; // KeePass 2.x signature
        assert!(matches!(Header::parse(&bytes), Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_version_minor_tolerated() {
        let mut header = sample();
        header.version = 0x0003_0002;
        assert!(Header::parse(&header.to_bytes()).is_ok());

        header.version = 0x0002_0000;
        assert!(matches!(
            Header::parse(&header.to_bytes()),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_unsupported_cipher() {
        let mut header = sample();
        header.flags = FLAG_SHA2 | FLAG_ARCFOUR;
        assert!(matches!(
            Header::parse(&header.to_bytes()),
            Err(Error::UnsupportedFormat(_))
        ));
    }
}
