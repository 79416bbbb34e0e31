//! Field encryption through the store surface: sensitive payloads never hit
//! the substrate in the clear, and deterministic tokens keep unique
//! constraints working over non-deterministic ciphertext.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_store::substrate::ReadOps;
use strata_store::{
    DocumentStore, EncryptionProvider, Error, Expected, FieldSpec, ModelId, ModelSchema,
    PropertyKind, Reference, Result, RootKey, StoreConfig,
};

fn data_dir() -> PathBuf {
    tempfile::tempdir().unwrap().keep()
}

/// XOR cipher with a per-call nonce. Worthless cryptographically, but it has
/// the properties the store cares about: ciphertext differs between calls for
/// equal plaintext, and tokens do not.
struct XorProvider {
    key: u8,
    nonce: AtomicU64,
}

impl XorProvider {
    fn new() -> Self {
        Self {
            key: 0x5a,
            nonce: AtomicU64::new(1),
        }
    }
}

impl EncryptionProvider for XorProvider {
    fn encrypt(&self, _: &ModelId, _: &Reference, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut out = nonce.to_be_bytes().to_vec();
        out.extend(plaintext.iter().map(|b| b ^ self.key ^ (nonce as u8)));
        Ok(out)
    }

    fn decrypt(&self, _: &ModelId, _: &Reference, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 8 {
            return Err(Error::Encryption("ciphertext too short".into()));
        }
        let nonce = u64::from_be_bytes(ciphertext[..8].try_into().unwrap());
        Ok(ciphertext[8..]
            .iter()
            .map(|b| b ^ self.key ^ (nonce as u8))
            .collect())
    }

    fn supports_tokens(&self) -> bool {
        true
    }

    fn deterministic_token(
        &self,
        model: &ModelId,
        reference: &Reference,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut hash: u64 = 0xcbf29ce484222325;
        for chunk in [model.as_str().as_bytes(), reference.as_bytes(), plaintext] {
            for &byte in chunk {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
        }
        Ok(hash.to_be_bytes().to_vec())
    }
}

fn schema() -> ModelSchema {
    ModelSchema::new(
        "patient",
        1,
        vec![
            FieldSpec::new("name", Reference::from("name"), PropertyKind::Scalar),
            FieldSpec::new("ssn", Reference::from("ssn"), PropertyKind::Scalar)
                .sensitive()
                .unique(),
        ],
    )
}

async fn open_with_provider() -> DocumentStore {
    DocumentStore::open(
        StoreConfig::new(data_dir()),
        vec![schema()],
        Some(Arc::new(XorProvider::new())),
        HashMap::new(),
    )
    .await
    .unwrap()
}

/// Raw bytes of a latest row, straight off the substrate.
fn raw_latest(store: &DocumentStore, model: &ModelId, root: &RootKey, field: &[u8]) -> Vec<u8> {
    let substrate = store.substrate();
    let tables = substrate.model_tables(model).unwrap();
    let mut key = root.as_bytes().to_vec();
    key.extend_from_slice(field);
    substrate.get(&tables.latest, &key).unwrap().unwrap()
}

#[tokio::test]
async fn sensitive_values_are_opaque_on_disk_but_read_back_clear() {
    let store = open_with_provider().await;
    let model = ModelId::new("patient");
    let root = RootKey::random();

    store
        .write(
            &model,
            &root,
            &[("ssn", b"123-45-6789".to_vec()), ("name", b"alice".to_vec())],
            Expected::Absent,
        )
        .unwrap();

    // Reads decrypt transparently.
    let values = store.read(&model, &root, &["ssn", "name"], None).unwrap();
    assert_eq!(values[0], Some(b"123-45-6789".to_vec()));

    // The stored row (after the 8-byte version stamp) is not the plaintext.
    let raw = raw_latest(&store, &model, &root, b"ssn");
    assert!(!raw
        .windows(b"123-45-6789".len())
        .any(|window| window == b"123-45-6789"));

    // The plain field is stored as-is.
    let raw_name = raw_latest(&store, &model, &root, b"name");
    assert!(raw_name.ends_with(b"alice"));
}

#[tokio::test]
async fn ciphertext_differs_between_writes_of_equal_plaintext() {
    let store = open_with_provider().await;
    let model = ModelId::new("patient");
    let root = RootKey::random();

    store
        .write(&model, &root, &[("ssn", b"123-45-6789".to_vec())], Expected::Absent)
        .unwrap();
    let first = raw_latest(&store, &model, &root, b"ssn");

    store
        .write(&model, &root, &[("ssn", b"123-45-6789".to_vec())], Expected::Any)
        .unwrap();
    let second = raw_latest(&store, &model, &root, b"ssn");

    assert_ne!(first[8..], second[8..]);
}

#[tokio::test]
async fn unique_constraint_holds_across_differing_ciphertexts() {
    let store = open_with_provider().await;
    let model = ModelId::new("patient");
    let first = RootKey::random();
    let second = RootKey::random();

    store
        .write(&model, &first, &[("ssn", b"123-45-6789".to_vec())], Expected::Absent)
        .unwrap();

    // Same plaintext, fresh ciphertext: the deterministic token still
    // collides and the write is rejected.
    let result = store.write(
        &model,
        &second,
        &[("ssn", b"123-45-6789".to_vec())],
        Expected::Absent,
    );
    match result {
        Err(Error::Conflict { field, existing_key }) => {
            assert_eq!(field, "ssn");
            assert_eq!(existing_key, first);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    assert_eq!(
        store.lookup_unique(&model, "ssn", b"123-45-6789").unwrap(),
        Some(first)
    );
}

#[tokio::test]
async fn sensitive_schema_without_provider_fails_open() {
    let result = DocumentStore::open(
        StoreConfig::new(data_dir()),
        vec![schema()],
        None,
        HashMap::new(),
    )
    .await;
    assert!(matches!(result, Err(Error::Config(_))));
}
