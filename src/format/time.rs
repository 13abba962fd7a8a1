//! Packed 5-byte timestamps
//!
//! Bit layout, most significant first: year 14, month 4, day 5, hour 5,
//! minute 6, second 6.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// Size of a packed timestamp
pub const PACKED_TIME_SIZE: usize = 5;

/// Pack a timestamp
pub fn pack(time: &NaiveDateTime) -> [u8; PACKED_TIME_SIZE] {
    let year = time.year().clamp(0, 0x3FFF) as u32;
    let month = time.month();
    let day = time.day();
    let hour = time.hour();
    let minute = time.minute();
    let second = time.second().min(59);

    [
        ((year >> 6) & 0xFF) as u8,
        (((year & 0x3F) << 2) | ((month >> 2) & 0x03)) as u8,
        (((month & 0x03) << 6) | ((day & 0x1F) << 1) | ((hour >> 4) & 0x01)) as u8,
        (((hour & 0x0F) << 4) | ((minute >> 2) & 0x0F)) as u8,
        (((minute & 0x03) << 6) | (second & 0x3F)) as u8,
    ]
}

/// Unpack a timestamp; `None` when the fields do not form a valid date
pub fn unpack(bytes: &[u8; PACKED_TIME_SIZE]) -> Option<NaiveDateTime> {
    let b: [u32; PACKED_TIME_SIZE] = bytes.map(u32::from);

    let year = (b[0] << 6) | (b[1] >> 2);
    let month = ((b[1] & 0x03) << 2) | (b[2] >> 6);
    let day = (b[2] >> 1) & 0x1F;
    let hour = ((b[2] & 0x01) << 4) | (b[3] >> 4);
    let minute = ((b[3] & 0x0F) << 2) | (b[4] >> 6);
    let second = b[4] & 0x3F;

    NaiveDate::from_ymd_opt(year as i32, month, day)?.and_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::never_expires;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_never_expires_encoding() {
        // Bytes written by desktop KeePass for "never expires"
        assert_eq!(pack(&never_expires()), [0x2E, 0xDF, 0x39, 0x7E, 0xFB]);
        assert_eq!(unpack(&[0x2E, 0xDF, 0x39, 0x7E, 0xFB]), Some(never_expires()));
    }

    #[test]
    fn test_pack_unpack() {
        for time in [
            at(2013, 1, 1, 0, 0, 0),
            at(2024, 2, 29, 23, 59, 59),
            at(1999, 12, 31, 12, 30, 45),
        ] {
            assert_eq!(unpack(&pack(&time)), Some(time));
        }
    }

    #[test]
    fn test_invalid_date() {
        assert_eq!(unpack(&[0, 0, 0, 0, 0]), None);
    }
}
