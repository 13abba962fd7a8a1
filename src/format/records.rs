//! Group and entry records of the decrypted payload
//!
//! A record is a run of `u16 type, u32 size, data` fields closed by an
//! end-of-record field. Groups are stored in pre-order with their depth, so
//! parents are rebuilt from position and level.

use crate::crypto::ProtectedString;
use crate::error::{Error, Result};
use crate::format::reader::ByteReader;
use crate::format::time::{self, PACKED_TIME_SIZE};
use crate::tree::{Database, Entry, EntryId, Group, GroupId, Times};
use chrono::NaiveDateTime;
use uuid::Uuid;
use zeroize::Zeroizing;

const FIELD_IGNORE: u16 = 0x0000;
const FIELD_END: u16 = 0xFFFF;

const GROUP_ID: u16 = 0x0001;
const GROUP_NAME: u16 = 0x0002;
const GROUP_CREATED: u16 = 0x0003;
const GROUP_MODIFIED: u16 = 0x0004;
const GROUP_ACCESSED: u16 = 0x0005;
const GROUP_EXPIRES: u16 = 0x0006;
const GROUP_ICON: u16 = 0x0007;
const GROUP_LEVEL: u16 = 0x0008;
const GROUP_FLAGS: u16 = 0x0009;

const ENTRY_UUID: u16 = 0x0001;
const ENTRY_GROUP: u16 = 0x0002;
const ENTRY_ICON: u16 = 0x0003;
const ENTRY_TITLE: u16 = 0x0004;
const ENTRY_URL: u16 = 0x0005;
const ENTRY_USERNAME: u16 = 0x0006;
const ENTRY_PASSWORD: u16 = 0x0007;
const ENTRY_COMMENT: u16 = 0x0008;
const ENTRY_CREATED: u16 = 0x0009;
const ENTRY_MODIFIED: u16 = 0x000A;
const ENTRY_ACCESSED: u16 = 0x000B;
const ENTRY_EXPIRES: u16 = 0x000C;
const ENTRY_BINARY_DESC: u16 = 0x000D;
const ENTRY_BINARY: u16 = 0x000E;

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedRecord(msg.into())
}

/// One raw field
struct Field<'a> {
    kind: u16,
    data: &'a [u8],
}

impl<'a> Field<'a> {
    fn read(reader: &mut ByteReader<'a>) -> Result<Self> {
        let at = reader.position();
        let overrun = || malformed(format!("Field at offset {} overruns the payload", at));
        let kind = reader.u16().ok_or_else(overrun)?;
        let size = reader.u32().ok_or_else(overrun)? as usize;
        let data = reader.take(size).ok_or_else(overrun)?;
        Ok(Field { kind, data })
    }

    fn fixed<const N: usize>(&self) -> Result<[u8; N]> {
        self.data.try_into().map_err(|_| {
            malformed(format!(
                "Field {:#06x} has size {}, expected {}",
                self.kind,
                self.data.len(),
                N
            ))
        })
    }

    fn u16(&self) -> Result<u16> {
        self.fixed().map(u16::from_le_bytes)
    }

    fn u32(&self) -> Result<u32> {
        self.fixed().map(u32::from_le_bytes)
    }

    fn time(&self) -> Result<NaiveDateTime> {
        let packed: [u8; PACKED_TIME_SIZE] = self.fixed()?;
        time::unpack(&packed)
            .ok_or_else(|| malformed(format!("Field {:#06x} holds an invalid date", self.kind)))
    }

    /// NUL-terminated UTF-8 text
    fn text(&self) -> Result<String> {
        let end = self
            .data
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8(self.data[..end].to_vec())
            .map_err(|_| malformed(format!("Field {:#06x} is not valid UTF-8", self.kind)))
    }

    fn end(&self) -> Result<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(malformed("End-of-record field must be empty"))
        }
    }
}

fn write_field(out: &mut Vec<u8>, kind: u16, data: &[u8]) -> Result<()> {
    let size = u32::try_from(data.len())
        .map_err(|_| Error::ValidationError(format!("Field {:#06x} is too large", kind)))?;
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn write_text(out: &mut Vec<u8>, kind: u16, text: &str) -> Result<()> {
    let mut data = Zeroizing::new(Vec::with_capacity(text.len() + 1));
    data.extend_from_slice(text.as_bytes());
    data.push(0);
    write_field(out, kind, &data)
}

fn write_time(out: &mut Vec<u8>, kind: u16, time: &NaiveDateTime) -> Result<()> {
    write_field(out, kind, &time::pack(time))
}

/// Append one group record at the given depth
pub(crate) fn write_group(out: &mut Vec<u8>, group: &Group, level: u16) -> Result<()> {
    write_field(out, GROUP_ID, &group.id.0.to_le_bytes())?;
    write_text(out, GROUP_NAME, &group.name)?;
    write_time(out, GROUP_CREATED, &group.times.created)?;
    write_time(out, GROUP_MODIFIED, &group.times.modified)?;
    write_time(out, GROUP_ACCESSED, &group.times.accessed)?;
    write_time(out, GROUP_EXPIRES, &group.times.expires)?;
    write_field(out, GROUP_ICON, &group.icon.to_le_bytes())?;
    write_field(out, GROUP_LEVEL, &level.to_le_bytes())?;
    write_field(out, GROUP_FLAGS, &group.flags.to_le_bytes())?;
    write_field(out, FIELD_END, &[])
}

/// Append one entry record, filed under `group`
pub(crate) fn write_entry(out: &mut Vec<u8>, entry: &Entry, group: GroupId) -> Result<()> {
    let password = entry.password.reveal()?;

    write_field(out, ENTRY_UUID, entry.id.0.as_bytes())?;
    write_field(out, ENTRY_GROUP, &group.0.to_le_bytes())?;
    write_field(out, ENTRY_ICON, &entry.icon.to_le_bytes())?;
    write_text(out, ENTRY_TITLE, &entry.title)?;
    write_text(out, ENTRY_URL, &entry.url)?;
    write_text(out, ENTRY_USERNAME, &entry.username)?;
    write_text(out, ENTRY_PASSWORD, &password)?;
    write_text(out, ENTRY_COMMENT, &entry.comment)?;
    write_time(out, ENTRY_CREATED, &entry.times.created)?;
    write_time(out, ENTRY_MODIFIED, &entry.times.modified)?;
    write_time(out, ENTRY_ACCESSED, &entry.times.accessed)?;
    write_time(out, ENTRY_EXPIRES, &entry.times.expires)?;
    write_text(out, ENTRY_BINARY_DESC, &entry.binary_desc)?;
    write_field(out, ENTRY_BINARY, &entry.binary)?;
    write_field(out, FIELD_END, &[])
}

/// Read one group record; returns the group (parent unset) and its level
fn read_group(reader: &mut ByteReader<'_>) -> Result<(Group, u16)> {
    let mut group = Group::new(GroupId(0), None, String::new());
    let mut level = 0u16;

    loop {
        let field = Field::read(reader)?;
        match field.kind {
            FIELD_IGNORE => {}
            GROUP_ID => group.id = GroupId(field.u32()?),
            GROUP_NAME => group.name = field.text()?,
            GROUP_CREATED => group.times.created = field.time()?,
            GROUP_MODIFIED => group.times.modified = field.time()?,
            GROUP_ACCESSED => group.times.accessed = field.time()?,
            GROUP_EXPIRES => group.times.expires = field.time()?,
            GROUP_ICON => group.icon = field.u32()?,
            GROUP_LEVEL => level = field.u16()?,
            GROUP_FLAGS => group.flags = field.u32()?,
            FIELD_END => {
                field.end()?;
                return Ok((group, level));
            }
            other => return Err(malformed(format!("Unknown group field type {:#06x}", other))),
        }
    }
}

/// Read one entry record
fn read_entry(reader: &mut ByteReader<'_>) -> Result<Entry> {
    let mut entry = Entry::new(EntryId(Uuid::nil()), GroupId(0))?;
    let mut times = Times::now();

    loop {
        let field = Field::read(reader)?;
        match field.kind {
            FIELD_IGNORE => {}
            ENTRY_UUID => entry.id = EntryId(Uuid::from_bytes(field.fixed()?)),
            ENTRY_GROUP => entry.group = GroupId(field.u32()?),
            ENTRY_ICON => entry.icon = field.u32()?,
            ENTRY_TITLE => entry.title = field.text()?,
            ENTRY_URL => entry.url = field.text()?,
            ENTRY_USERNAME => entry.username = field.text()?,
            ENTRY_PASSWORD => {
                let password = Zeroizing::new(field.text()?);
                entry.password = ProtectedString::new(&password)?;
            }
            ENTRY_COMMENT => entry.comment = field.text()?,
            ENTRY_CREATED => times.created = field.time()?,
            ENTRY_MODIFIED => times.modified = field.time()?,
            ENTRY_ACCESSED => times.accessed = field.time()?,
            ENTRY_EXPIRES => times.expires = field.time()?,
            ENTRY_BINARY_DESC => entry.binary_desc = field.text()?,
            ENTRY_BINARY => entry.binary = field.data.to_vec(),
            FIELD_END => {
                field.end()?;
                entry.times = times;
                return Ok(entry);
            }
            other => return Err(malformed(format!("Unknown entry field type {:#06x}", other))),
        }
    }
}

/// Read `count` group records and rebuild the hierarchy from their levels
pub(crate) fn read_groups(reader: &mut ByteReader<'_>, count: u32, db: &mut Database) -> Result<()> {
    // Ids of the current ancestor chain, indexed by level
    let mut path: Vec<GroupId> = Vec::new();

    for index in 0..count {
        let (mut group, level) = read_group(reader)?;
        let level = usize::from(level);
        if level > path.len() {
            return Err(malformed(format!(
                "Group record {} jumps to level {} below level {}",
                index,
                level,
                path.len().saturating_sub(1)
            )));
        }
        path.truncate(level);
        group.parent = path.last().copied();

        let id = group.id;
        db.insert_loaded_group(group)?;
        path.push(id);
    }
    Ok(())
}

/// Read `count` entry records into their groups
pub(crate) fn read_entries(reader: &mut ByteReader<'_>, count: u32, db: &mut Database) -> Result<()> {
    for _ in 0..count {
        let entry = read_entry(reader)?;
        if entry.id.0.is_nil() {
            return Err(malformed("Entry record without an id"));
        }
        db.insert_loaded_entry(entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Algorithm;
    use crate::tree::{never_expires, EntryFields};

    fn group_record(id: u32, name: &str, level: u16) -> Vec<u8> {
        let mut out = Vec::new();
        write_field(&mut out, GROUP_ID, &id.to_le_bytes()).unwrap();
        write_text(&mut out, GROUP_NAME, name).unwrap();
        write_field(&mut out, GROUP_LEVEL, &level.to_le_bytes()).unwrap();
        write_field(&mut out, FIELD_END, &[]).unwrap();
        out
    }

    fn load_groups(bytes: &[u8], count: u32) -> Result<Database> {
        let mut db = Database::new(Algorithm::Aes256, 1000);
        read_groups(&mut ByteReader::new(bytes), count, &mut db)?;
        Ok(db)
    }

    #[test]
    fn test_levels_rebuild_parents() {
        let mut bytes = group_record(1, "Email", 0);
        bytes.extend(group_record(2, "Work", 1));
        bytes.extend(group_record(3, "Old", 2));
        bytes.extend(group_record(4, "Shops", 0));

        let db = load_groups(&bytes, 4).unwrap();
        assert_eq!(db.root_groups(), &[GroupId(1), GroupId(4)]);
        assert_eq!(db.group(GroupId(2)).unwrap().parent, Some(GroupId(1)));
        assert_eq!(db.group(GroupId(3)).unwrap().parent, Some(GroupId(2)));
        assert_eq!(db.group(GroupId(4)).unwrap().parent, None);
        assert_eq!(db.group(GroupId(2)).unwrap().name, "Work");
    }

    #[test]
    fn test_level_jump_rejected() {
        let mut bytes = group_record(1, "Email", 0);
        bytes.extend(group_record(2, "Deep", 2));
        assert!(matches!(load_groups(&bytes, 2), Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_duplicate_group_id_rejected() {
        let mut bytes = group_record(1, "A", 0);
        bytes.extend(group_record(1, "B", 0));
        assert!(matches!(load_groups(&bytes, 2), Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut bytes = Vec::new();
        write_field(&mut bytes, GROUP_ID, &1u32.to_le_bytes()).unwrap();
        write_field(&mut bytes, 0x0042, &[1, 2]).unwrap();
        write_field(&mut bytes, FIELD_END, &[]).unwrap();
        assert!(matches!(load_groups(&bytes, 1), Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_wrong_field_size_rejected() {
        let mut bytes = Vec::new();
        write_field(&mut bytes, GROUP_ID, &[1, 0]).unwrap();
        write_field(&mut bytes, FIELD_END, &[]).unwrap();
        assert!(matches!(load_groups(&bytes, 1), Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_overrun_rejected() {
        let bytes = group_record(1, "Email", 0);
        assert!(matches!(
            load_groups(&bytes[..bytes.len() - 3], 1),
            Err(Error::MalformedRecord(_))
        ));
        assert!(matches!(load_groups(&bytes, 2), Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = Vec::new();
        write_field(&mut bytes, GROUP_ID, &1u32.to_le_bytes()).unwrap();
        write_field(&mut bytes, GROUP_NAME, &[0xFF, 0xFE, 0x00]).unwrap();
        write_field(&mut bytes, FIELD_END, &[]).unwrap();
        assert!(matches!(load_groups(&bytes, 1), Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_entry_record() {
        let mut source = Database::new(Algorithm::Aes256, 1000);
        let group = source.add_group(None, "Email").unwrap();
        let id = source
            .add_entry(
                group,
                &EntryFields::new("Gmail")
                    .username("alice")
                    .password("Tr0ub4dor&3")
                    .url("https://mail.google.com"),
            )
            .unwrap();
        let entry = source.entry(id).unwrap();

        let mut bytes = Vec::new();
        write_group(&mut bytes, source.group(group).unwrap(), 0).unwrap();
        write_entry(&mut bytes, entry, group).unwrap();

        let mut db = Database::new(Algorithm::Aes256, 1000);
        let mut reader = ByteReader::new(&bytes);
        read_groups(&mut reader, 1, &mut db).unwrap();
        read_entries(&mut reader, 1, &mut db).unwrap();

        let loaded = db.entry(id).unwrap();
        assert_eq!(loaded, entry);
        assert_eq!(loaded.password.reveal().unwrap().as_str(), "Tr0ub4dor&3");
        assert_eq!(loaded.times.expires, never_expires());
    }

    #[test]
    fn test_entry_without_id_rejected() {
        let mut bytes = group_record(1, "Email", 0);
        write_field(&mut bytes, ENTRY_GROUP, &1u32.to_le_bytes()).unwrap();
        write_text(&mut bytes, ENTRY_TITLE, "x").unwrap();
        write_field(&mut bytes, FIELD_END, &[]).unwrap();

        let mut db = Database::new(Algorithm::Aes256, 1000);
        let mut reader = ByteReader::new(&bytes);
        read_groups(&mut reader, 1, &mut db).unwrap();
        assert!(matches!(
            read_entries(&mut reader, 1, &mut db),
            Err(Error::MalformedRecord(_))
        ));
    }
}
