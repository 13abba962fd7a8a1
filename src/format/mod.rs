//! KeePass 1.x (KDB) container format
//!
//! A 124-byte plaintext header followed by the CBC-encrypted payload of
//! group and entry records.

mod codec;
mod header;
mod reader;
mod records;
pub mod time;

pub use codec::{decode, decode_cancellable, decode_payload, encode};
pub use header::{Header, FILE_VERSION, HEADER_SIZE, SIGNATURE_1, SIGNATURE_2};
