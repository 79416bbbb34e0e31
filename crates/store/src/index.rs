//! Non-unique secondary index maintenance and scans.
//!
//! Entry layout: `reference ∥ value-bytes ∥ root` maps to `version`. The
//! trailing fixed-width root key disambiguates entries sharing a value, and
//! keeps entries for equal values ordered by root.

use crate::error::{Error, Result};
use crate::schema::{FieldSpec, RootKey, ROOT_KEY_LEN};
use crate::substrate::{ModelTables, ReadOps, Txn};
use strata_codec::keys;
use strata_hlc::{Version, VERSION_LEN};

fn entry_key(buf: &mut Vec<u8>, field: &FieldSpec, value: &[u8], root: &RootKey) {
    keys::pack_key(buf, &[field.reference.as_bytes(), value, root.as_bytes()]);
}

/// Add an entry for the new value, dropping the entry for the old one.
pub(crate) fn apply(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    field: &FieldSpec,
    root: &RootKey,
    value: &[u8],
    old_value: Option<&[u8]>,
    version: Version,
    buf: &mut Vec<u8>,
) {
    if let Some(old_value) = old_value {
        if old_value != value {
            entry_key(buf, field, old_value, root);
            txn.clear(&tables.index, buf.clone());
        }
    }
    entry_key(buf, field, value, root);
    txn.set(&tables.index, buf.clone(), version.to_bytes().to_vec());
}

pub(crate) fn remove(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    field: &FieldSpec,
    root: &RootKey,
    value: &[u8],
    buf: &mut Vec<u8>,
) {
    entry_key(buf, field, value, root);
    txn.clear(&tables.index, buf.clone());
}

/// Scan index entries with values in `[lower, upper)`, ordered by value.
///
/// An open `upper` scans to the end of the field's entries. When `at` is
/// given, entries written after it are filtered out; the index table only
/// carries each entry's latest version, so this approximates historical
/// membership rather than replaying index history.
pub(crate) fn scan<R: ReadOps>(
    view: &R,
    tables: &ModelTables,
    field: &FieldSpec,
    lower: &[u8],
    upper: Option<&[u8]>,
    at: Option<Version>,
) -> Result<Vec<(RootKey, Version)>> {
    let reference = field.reference.as_bytes();

    let mut start = Vec::with_capacity(reference.len() + lower.len());
    start.extend_from_slice(reference);
    start.extend_from_slice(lower);

    let end = match upper {
        Some(upper) => {
            let mut end = Vec::with_capacity(reference.len() + upper.len());
            end.extend_from_slice(reference);
            end.extend_from_slice(upper);
            Some(end)
        }
        // End of this field's keyspace.
        None => keys::prefix_successor(reference),
    };

    let mut out = Vec::new();
    for (key, value) in view.range(&tables.index, &start, end.as_deref())? {
        if key.len() < reference.len() + ROOT_KEY_LEN || value.len() != VERSION_LEN {
            return Err(Error::Decode(format!(
                "malformed index entry for '{}'",
                field.name
            )));
        }
        let root = RootKey::from_slice(&key[key.len() - ROOT_KEY_LEN..])?;
        let mut version_bytes = [0u8; VERSION_LEN];
        version_bytes.copy_from_slice(&value);
        let version = Version::from_bytes(version_bytes);

        if let Some(at) = at {
            if version > at {
                continue;
            }
        }
        out.push((root, version));
    }
    Ok(out)
}
