//! Latest and historic row maintenance.
//!
//! A latest row holds `version ∥ payload` at `root ∥ reference`; exactly one
//! exists per (root, reference) and it is overwritten on every write. When
//! history retention is enabled, every write also appends a historic row at
//! `root ∥ zerofree(reference) ∥ 0x00 ∥ reversed(version)`, and every delete
//! appends an empty-payload tombstone there. Historic rows are append-only;
//! only the retention sweep removes them.

use crate::error::{Error, Result};
use crate::schema::{FieldSpec, Reference, RootKey};
use crate::substrate::{ModelTables, ReadOps, Txn};
use strata_codec::keys;
use strata_hlc::{Version, VERSION_LEN};

/// A decoded latest (or reconstructed historic) row.
pub(crate) struct Row {
    pub version: Version,
    pub payload: Vec<u8>,
}

pub(crate) fn latest_key(buf: &mut Vec<u8>, root: &RootKey, reference: &Reference) {
    keys::pack_key(buf, &[root.as_bytes(), reference.as_bytes()]);
}

fn latest_value(version: Version, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(VERSION_LEN + payload.len());
    value.extend_from_slice(&version.to_bytes());
    value.extend_from_slice(payload);
    value
}

fn decode_latest(value: &[u8]) -> Result<Row> {
    if value.len() < VERSION_LEN {
        return Err(Error::Decode(format!(
            "latest row value too short: {} bytes",
            value.len()
        )));
    }
    let mut version_bytes = [0u8; VERSION_LEN];
    version_bytes.copy_from_slice(&value[..VERSION_LEN]);
    Ok(Row {
        version: Version::from_bytes(version_bytes),
        payload: value[VERSION_LEN..].to_vec(),
    })
}

/// Write one value: latest row, plus a historic row when retention is on.
pub(crate) fn write_value(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    root: &RootKey,
    reference: &Reference,
    version: Version,
    payload: &[u8],
    retain_history: bool,
    buf: &mut Vec<u8>,
) {
    latest_key(buf, root, reference);
    txn.set(&tables.latest, buf.clone(), latest_value(version, payload));

    if retain_history {
        keys::pack_versioned_key(buf, root.as_bytes(), reference.as_bytes(), version);
        txn.set(&tables.historic, buf.clone(), payload.to_vec());
    }
}

/// Delete one value: clear the latest row and append a tombstone.
///
/// The tombstone is a normal historic entry with an empty payload; it is
/// never physically removed on this path.
pub(crate) fn delete_value(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    root: &RootKey,
    reference: &Reference,
    version: Version,
    retain_history: bool,
    buf: &mut Vec<u8>,
) {
    latest_key(buf, root, reference);
    txn.clear(&tables.latest, buf.clone());

    if retain_history {
        keys::pack_versioned_key(buf, root.as_bytes(), reference.as_bytes(), version);
        txn.set(&tables.historic, buf.clone(), Vec::new());
    }
}

/// Point-read the latest row.
pub(crate) fn read_latest<R: ReadOps>(
    view: &R,
    tables: &ModelTables,
    root: &RootKey,
    reference: &Reference,
    buf: &mut Vec<u8>,
) -> Result<Option<Row>> {
    latest_key(buf, root, reference);
    match view.get(&tables.latest, buf)? {
        Some(value) => Ok(Some(decode_latest(&value)?)),
        None => Ok(None),
    }
}

/// Read the newest historic entry at or before `at`.
///
/// Historic keys carry reversed versions, so an ascending scan of one
/// reference's prefix visits entries newest-first; the first entry whose
/// version is `<= at` is the answer. A tombstone there means the value was
/// deleted at that point in time.
pub(crate) fn read_at<R: ReadOps>(
    view: &R,
    tables: &ModelTables,
    root: &RootKey,
    reference: &Reference,
    at: Version,
    buf: &mut Vec<u8>,
) -> Result<Option<Row>> {
    keys::pack_versioned_prefix(buf, root.as_bytes(), reference.as_bytes());

    for (key, payload) in view.prefix(&tables.historic, buf)? {
        let version = match keys::versioned_key_version(&key) {
            Ok(version) => version,
            Err(error) => {
                tracing::warn!(%error, "skipping malformed historic entry");
                continue;
            }
        };
        if version > at {
            continue;
        }
        if payload.is_empty() {
            // Tombstone: deleted at or before the requested version.
            return Ok(None);
        }
        return Ok(Some(Row { version, payload }));
    }
    Ok(None)
}

/// Read a value, either latest or at a historical version.
///
/// Reading from history with retention disabled is a configuration error and
/// is surfaced, never silently degraded to a latest read.
pub(crate) fn read_value<R: ReadOps>(
    view: &R,
    tables: &ModelTables,
    root: &RootKey,
    reference: &Reference,
    at: Option<Version>,
    retain_history: bool,
    buf: &mut Vec<u8>,
) -> Result<Option<Row>> {
    match at {
        None => read_latest(view, tables, root, reference, buf),
        Some(at) => {
            if !retain_history {
                return Err(Error::Config(
                    "point-in-time read requested but history retention is disabled".into(),
                ));
            }
            read_at(view, tables, root, reference, at, buf)
        }
    }
}

/// Read the container count cell (0 when absent).
pub(crate) fn read_count<R: ReadOps>(
    view: &R,
    tables: &ModelTables,
    root: &RootKey,
    field: &FieldSpec,
    buf: &mut Vec<u8>,
) -> Result<u32> {
    match read_latest(view, tables, root, &field.reference, buf)? {
        Some(row) => {
            if row.payload.len() != 4 {
                return Err(Error::Decode(format!(
                    "container count for '{}' has {} bytes",
                    field.name,
                    row.payload.len()
                )));
            }
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&row.payload);
            Ok(u32::from_be_bytes(bytes))
        }
        None => Ok(0),
    }
}

/// Write the container count cell, validating the schema's size bounds.
///
/// A bound violation aborts the enclosing transaction, so the element writes
/// batched alongside never land.
pub(crate) fn write_count(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    root: &RootKey,
    field: &FieldSpec,
    version: Version,
    count: u32,
    retain_history: bool,
    buf: &mut Vec<u8>,
) -> Result<()> {
    field.validate_size(count)?;
    write_value(
        txn,
        tables,
        root,
        &field.reference,
        version,
        &count.to_be_bytes(),
        retain_history,
        buf,
    );
    Ok(())
}

/// Remove the tail of a shrinking list.
///
/// Each dropped index gets its own tombstone; indices that survive with a
/// shifted value are rewritten by the caller at fresh versions. This is not
/// an in-place shift.
pub(crate) fn truncate_list(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    root: &RootKey,
    field: &FieldSpec,
    old_len: u32,
    new_len: u32,
    version: Version,
    retain_history: bool,
    buf: &mut Vec<u8>,
) {
    for index in new_len..old_len {
        let element = field.reference.element(index);
        delete_value(txn, tables, root, &element, version, retain_history, buf);
    }
}
