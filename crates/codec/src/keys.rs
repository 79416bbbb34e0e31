//! Ordered key packing for the four logical tables.
//!
//! Latest, index and unique keys are plain segment concatenations; their
//! layout carries no trailing version, so no separator is needed. Historic
//! keys append a reversed version suffix after a zero-free-encoded qualifier
//! and a single 0x00 separator, which makes an ascending scan over one
//! qualifier's entries return them newest-first.

use crate::{zerofree, CodecError, Result};
use strata_hlc::{Version, VERSION_LEN};

/// Separator byte between the zero-free qualifier and the version suffix.
pub const SEPARATOR: u8 = 0x00;

/// Concatenate key segments into `out` (cleared first).
///
/// Used for the latest, index and unique tables, where the fixed segment
/// widths (or trailing position of variable segments) keep the layout
/// unambiguous without escaping.
pub fn pack_key(out: &mut Vec<u8>, segments: &[&[u8]]) {
    out.clear();
    for segment in segments {
        out.extend_from_slice(segment);
    }
}

/// Pack a historic-table key into `out` (cleared first).
///
/// Layout: `root ∥ zerofree(qualifier) ∥ 0x00 ∥ reversed(version)`.
pub fn pack_versioned_key(out: &mut Vec<u8>, root: &[u8], qualifier: &[u8], version: Version) {
    out.clear();
    out.extend_from_slice(root);
    zerofree::encode_into(qualifier, out);
    out.push(SEPARATOR);
    out.extend_from_slice(&version.to_reversed_bytes());
}

/// Pack the prefix shared by all versions of one qualifier (cleared first).
///
/// Layout: `root ∥ zerofree(qualifier) ∥ 0x00`. Range-scanning this prefix
/// over the historic table visits that qualifier's entries newest-first.
pub fn pack_versioned_prefix(out: &mut Vec<u8>, root: &[u8], qualifier: &[u8]) {
    out.clear();
    out.extend_from_slice(root);
    zerofree::encode_into(qualifier, out);
    out.push(SEPARATOR);
}

/// Split a historic-table key back into its qualifier and version.
///
/// `root_len` is the fixed width of the root segment. The version suffix is
/// fixed-width, so it is read from the tail; the byte before it must be the
/// separator, and the qualifier region must decode cleanly.
pub fn split_versioned_key(key: &[u8], root_len: usize) -> Result<(Vec<u8>, Version)> {
    // root + at least the separator + the version suffix
    let min_len = root_len + 1 + VERSION_LEN;
    if key.len() < min_len {
        return Err(CodecError::KeyTooShort {
            expected: min_len,
            actual: key.len(),
        });
    }

    let suffix_start = key.len() - VERSION_LEN;
    if key[suffix_start - 1] != SEPARATOR {
        return Err(CodecError::MissingSeparator);
    }

    let mut version_bytes = [0u8; VERSION_LEN];
    version_bytes.copy_from_slice(&key[suffix_start..]);
    let version = Version::from_reversed_bytes(version_bytes);

    let qualifier = zerofree::decode(&key[root_len..suffix_start - 1])?;
    Ok((qualifier, version))
}

/// Read just the version from a historic-table key.
pub fn versioned_key_version(key: &[u8]) -> Result<Version> {
    if key.len() < VERSION_LEN + 1 {
        return Err(CodecError::KeyTooShort {
            expected: VERSION_LEN + 1,
            actual: key.len(),
        });
    }
    let suffix_start = key.len() - VERSION_LEN;
    if key[suffix_start - 1] != SEPARATOR {
        return Err(CodecError::MissingSeparator);
    }
    let mut version_bytes = [0u8; VERSION_LEN];
    version_bytes.copy_from_slice(&key[suffix_start..]);
    Ok(Version::from_reversed_bytes(version_bytes))
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when the prefix is all 0xFF.
///
/// Used to turn a prefix into an exclusive upper bound for range scans.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &[u8] = &[0xAA; 16];

    #[test]
    fn test_pack_key_concatenates() {
        let mut buf = vec![0xFF]; // stale content must be cleared
        pack_key(&mut buf, &[b"abc", &[0x00], b"def"]);
        assert_eq!(buf, b"abc\x00def");
    }

    #[test]
    fn test_versioned_key_roundtrip() {
        let qualifiers: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x01, 0x00, 0xFF],
            b"name".to_vec(),
        ];
        for qualifier in qualifiers {
            let version = Version::new(123_456_789);
            let mut key = Vec::new();
            pack_versioned_key(&mut key, ROOT, &qualifier, version);

            let (decoded, got_version) = split_versioned_key(&key, ROOT.len()).unwrap();
            assert_eq!(decoded, qualifier);
            assert_eq!(got_version, version);
            assert_eq!(versioned_key_version(&key).unwrap(), version);
        }
    }

    #[test]
    fn test_versioned_keys_sort_newest_first() {
        let mut old_key = Vec::new();
        let mut new_key = Vec::new();
        pack_versioned_key(&mut old_key, ROOT, b"field", Version::new(100));
        pack_versioned_key(&mut new_key, ROOT, b"field", Version::new(200));

        // Ascending key order puts the newer version first.
        assert!(new_key < old_key);
    }

    #[test]
    fn test_versioned_prefix_covers_all_versions() {
        let mut prefix = Vec::new();
        pack_versioned_prefix(&mut prefix, ROOT, b"field");

        for version in [0u64, 1, u64::MAX] {
            let mut key = Vec::new();
            pack_versioned_key(&mut key, ROOT, b"field", Version::new(version));
            assert!(key.starts_with(&prefix));
        }
    }

    #[test]
    fn test_split_rejects_short_key() {
        assert!(matches!(
            split_versioned_key(&[0u8; 4], 16),
            Err(CodecError::KeyTooShort { .. })
        ));
    }

    #[test]
    fn test_split_rejects_missing_separator() {
        let mut key = ROOT.to_vec();
        key.extend_from_slice(b"qualifier");
        key.push(0x02); // not the separator
        key.extend_from_slice(&Version::new(7).to_reversed_bytes());
        assert_eq!(
            split_versioned_key(&key, ROOT.len()),
            Err(CodecError::MissingSeparator)
        );
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_successor(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}
