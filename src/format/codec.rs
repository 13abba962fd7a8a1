//! Whole-file encode/decode
//!
//! Decoding is all-or-nothing: a database is only returned once the header,
//! the payload hash and every record have been checked.

use crate::crypto::{
    decrypt, encrypt, random_bytes, sha256, CancelFlag, CompositeKey, DatabaseKey, KeySeeds,
};
use crate::error::{Error, Result};
use crate::format::header::{Header, HEADER_SIZE};
use crate::format::reader::ByteReader;
use crate::format::records;
use crate::tree::{Database, GroupId};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Decode a database file with the given composite key
///
/// Also returns the derived key so the caller can save again without
/// repeating the transformation.
pub fn decode(raw: &[u8], composite: &CompositeKey) -> Result<(Database, DatabaseKey)> {
    decode_with(raw, |seeds, rounds| Ok(DatabaseKey::derive(composite, seeds, rounds)))
}

/// [`decode`] that can be aborted through `cancel` during key derivation
pub fn decode_cancellable(
    raw: &[u8],
    composite: &CompositeKey,
    cancel: &CancelFlag,
) -> Result<(Database, DatabaseKey)> {
    decode_with(raw, |seeds, rounds| {
        DatabaseKey::derive_cancellable(composite, seeds, rounds, cancel)
    })
}

fn decode_with<F>(raw: &[u8], derive: F) -> Result<(Database, DatabaseKey)>
where
    F: FnOnce(KeySeeds, u32) -> Result<DatabaseKey>,
{
    let header = Header::parse(raw)?;
    let key = derive(header.seeds(), header.rounds)?;
    let db = decode_payload(&header, &raw[HEADER_SIZE..], &key)?;
    Ok((db, key))
}

/// Decrypt and parse the payload following `header`
pub fn decode_payload(header: &Header, body: &[u8], key: &DatabaseKey) -> Result<Database> {
    let algorithm = header.algorithm()?;

    let payload = decrypt(body, key.final_key().as_bytes(), &header.iv, algorithm)
        .map(Zeroizing::new)
        .map_err(|e| match e {
            Error::InvalidPadding | Error::InvalidCiphertextLength(_) => {
                debug!("Payload decryption failed: {}", e);
                Error::WrongCredentials
            }
            other => other,
        })?;

    if sha256(&[&payload[..]]) != header.contents_hash {
        debug!("Payload hash does not match the header");
        return Err(Error::WrongCredentials);
    }

    let mut db = Database::new(algorithm, header.rounds);
    let mut reader = ByteReader::new(&payload);
    records::read_groups(&mut reader, header.group_count, &mut db)?;
    records::read_entries(&mut reader, header.entry_count, &mut db)?;

    let trailing = payload.len() - reader.position();
    if trailing > 0 {
        debug!("Ignoring {} trailing payload bytes", trailing);
    }
    db.validate()?;

    debug!(
        "Decoded {} database: {} groups, {} entries, {} meta streams",
        algorithm,
        db.group_count(),
        db.entry_count(),
        db.meta_streams().len()
    );
    Ok(db)
}

fn count(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::ValidationError(format!("Too many {} to save", what)))
}

/// Encode a database with a fresh random IV
///
/// `key` must have been derived for the database's current rounds setting.
pub fn encode(db: &Database, key: &DatabaseKey) -> Result<Vec<u8>> {
    if db.rounds() != key.rounds() {
        return Err(Error::InvalidState(format!(
            "Key was derived for {} rounds but the database uses {}",
            key.rounds(),
            db.rounds()
        )));
    }

    let groups = db.groups_in_tree_order();
    let entries = db.entries_in_tree_order();
    let mut payload = Zeroizing::new(Vec::new());

    for (group, level) in &groups {
        records::write_group(&mut payload, group, *level)?;
    }
    for entry in &entries {
        records::write_entry(&mut payload, entry, entry.group)?;
    }

    // Meta streams go last; re-home them if their group has been deleted
    let fallback: Option<GroupId> = groups.first().map(|(g, _)| g.id);
    let mut meta_count = 0usize;
    for meta in db.meta_streams() {
        let group = if db.group(meta.group).is_some() {
            Some(meta.group)
        } else {
            fallback
        };
        match group {
            Some(group) => {
                records::write_entry(&mut payload, meta, group)?;
                meta_count += 1;
            }
            None => warn!("Dropping meta stream entry {}: database has no groups", meta.id),
        }
    }

    let contents_hash = sha256(&[&payload[..]]);
    let iv = random_bytes();
    let ciphertext = encrypt(&payload, key.final_key().as_bytes(), &iv, db.algorithm())?;

    let header = Header::new(
        db.algorithm(),
        key.seeds(),
        iv,
        key.rounds(),
        count(groups.len(), "groups")?,
        count(entries.len() + meta_count, "entries")?,
        contents_hash,
    );

    let mut out = header.to_bytes();
    out.extend_from_slice(&ciphertext);
    debug!(
        "Encoded {} groups and {} entries into {} bytes",
        groups.len(),
        entries.len(),
        out.len()
    );
    Ok(out)
}
