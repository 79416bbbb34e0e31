//! Unique index maintenance.
//!
//! One entry per value: `reference ∥ value-bytes-or-token` maps to
//! `version ∥ root`. The conflict check, the new entry, and the removal of
//! the stale entry for the field's previous value all happen inside the
//! caller's transaction, so a racing writer either fully succeeds or fully
//! fails.

use crate::error::{Error, Result};
use crate::schema::{FieldSpec, RootKey, ROOT_KEY_LEN};
use crate::substrate::{ModelTables, ReadOps, Txn};
use strata_codec::keys;
use strata_hlc::{Version, VERSION_LEN};

fn unique_key(buf: &mut Vec<u8>, field: &FieldSpec, token: &[u8]) {
    keys::pack_key(buf, &[field.reference.as_bytes(), token]);
}

fn decode_entry(field: &FieldSpec, value: &[u8]) -> Result<(Version, RootKey)> {
    if value.len() != VERSION_LEN + ROOT_KEY_LEN {
        return Err(Error::Decode(format!(
            "unique entry for '{}' has {} bytes",
            field.name,
            value.len()
        )));
    }
    let mut version_bytes = [0u8; VERSION_LEN];
    version_bytes.copy_from_slice(&value[..VERSION_LEN]);
    let root = RootKey::from_slice(&value[VERSION_LEN..])?;
    Ok((Version::from_bytes(version_bytes), root))
}

/// Claim `token` for `root`, releasing `old_token` when the value changed.
///
/// An existing claim by a different root aborts the transaction with
/// [`Error::Conflict`] naming the field and the holder; no index or value
/// mutation lands.
pub(crate) fn apply(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    field: &FieldSpec,
    root: &RootKey,
    token: &[u8],
    old_token: Option<&[u8]>,
    version: Version,
    buf: &mut Vec<u8>,
) -> Result<()> {
    unique_key(buf, field, token);

    if let Some(existing) = txn.get(&tables.unique, buf)? {
        let (_, holder) = decode_entry(field, &existing)?;
        if holder != *root {
            return Err(Error::Conflict {
                field: field.name.clone(),
                existing_key: holder,
            });
        }
    }

    let mut value = Vec::with_capacity(VERSION_LEN + ROOT_KEY_LEN);
    value.extend_from_slice(&version.to_bytes());
    value.extend_from_slice(root.as_bytes());
    txn.set(&tables.unique, buf.clone(), value);

    if let Some(old_token) = old_token {
        if old_token != token {
            remove(txn, tables, field, root, old_token, buf)?;
        }
    }
    Ok(())
}

/// Release a claim, but only when it is held by `root`.
pub(crate) fn remove(
    txn: &mut Txn<'_>,
    tables: &ModelTables,
    field: &FieldSpec,
    root: &RootKey,
    token: &[u8],
    buf: &mut Vec<u8>,
) -> Result<()> {
    unique_key(buf, field, token);
    if let Some(existing) = txn.get(&tables.unique, buf)? {
        let (_, holder) = decode_entry(field, &existing)?;
        if holder == *root {
            txn.clear(&tables.unique, buf.clone());
        }
    }
    Ok(())
}

/// Look up the root currently holding `token`, if any.
pub(crate) fn lookup<R: ReadOps>(
    view: &R,
    tables: &ModelTables,
    field: &FieldSpec,
    token: &[u8],
    buf: &mut Vec<u8>,
) -> Result<Option<(Version, RootKey)>> {
    unique_key(buf, field, token);
    match view.get(&tables.unique, buf)? {
        Some(value) => Ok(Some(decode_entry(field, &value)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::{ModelId, PropertyKind, Reference};
    use crate::substrate::Substrate;

    fn setup() -> (Substrate, ModelTables, FieldSpec) {
        let dir = tempfile::tempdir().unwrap().keep();
        let substrate = Substrate::open(&StoreConfig::new(dir)).unwrap();
        let tables = substrate.model_tables(&ModelId::new("user")).unwrap();
        let field =
            FieldSpec::new("email", Reference::from("email"), PropertyKind::Scalar).unique();
        (substrate, tables, field)
    }

    #[test]
    fn test_conflicting_claim_fails_and_keeps_first_holder() {
        let (substrate, tables, field) = setup();
        let first = RootKey::random();
        let second = RootKey::random();

        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                apply(txn, &tables, &field, &first, b"a@x", None, Version::new(1), &mut buf)
            })
            .unwrap();

        let result: Result<()> = substrate.transact(|txn| {
            let mut buf = Vec::new();
            apply(txn, &tables, &field, &second, b"a@x", None, Version::new(2), &mut buf)
        });
        match result {
            Err(Error::Conflict { field, existing_key }) => {
                assert_eq!(field, "email");
                assert_eq!(existing_key, first);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // The index still points at the first holder.
        let mut buf = Vec::new();
        let (_, holder) = lookup(&substrate, &tables, &field, b"a@x", &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(holder, first);
    }

    #[test]
    fn test_rewriting_same_value_for_same_root_is_allowed() {
        let (substrate, tables, field) = setup();
        let root = RootKey::random();

        for version in 1..=3u64 {
            substrate
                .transact(|txn| {
                    let mut buf = Vec::new();
                    apply(
                        txn,
                        &tables,
                        &field,
                        &root,
                        b"a@x",
                        Some(b"a@x"),
                        Version::new(version),
                        &mut buf,
                    )
                })
                .unwrap();
        }
    }

    #[test]
    fn test_changing_value_releases_old_claim() {
        let (substrate, tables, field) = setup();
        let root = RootKey::random();
        let other = RootKey::random();

        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                apply(txn, &tables, &field, &root, b"old@x", None, Version::new(1), &mut buf)
            })
            .unwrap();
        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                apply(
                    txn,
                    &tables,
                    &field,
                    &root,
                    b"new@x",
                    Some(b"old@x"),
                    Version::new(2),
                    &mut buf,
                )
            })
            .unwrap();

        // The old value is free for someone else now.
        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                apply(txn, &tables, &field, &other, b"old@x", None, Version::new(3), &mut buf)
            })
            .unwrap();
    }
}
