//! The narrow interface consumed from the schema layer.
//!
//! The property-definition DSL, validation rules and wire codecs live above
//! this crate. What the storage core needs from them is small: a stable
//! reference byte-path per property, a canonical value byte-encoding
//! (payloads arrive here already encoded), and per-field flags. Property
//! polymorphism is a closed enum dispatched by pattern matching, not a trait
//! hierarchy.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Fixed width of a root key in bytes.
pub const ROOT_KEY_LEN: usize = 16;

/// Identifier for one stored record. Immutable once assigned and never
/// reused across distinct records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RootKey([u8; ROOT_KEY_LEN]);

impl RootKey {
    /// A fresh random root key, for records without key-defining fields.
    pub fn random() -> Self {
        RootKey(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; ROOT_KEY_LEN]) -> Self {
        RootKey(bytes)
    }

    /// Parse a root key from the leading bytes of a packed table key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ROOT_KEY_LEN {
            return Err(Error::Decode(format!(
                "root key needs {ROOT_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; ROOT_KEY_LEN];
        out.copy_from_slice(&bytes[..ROOT_KEY_LEN]);
        Ok(RootKey(out))
    }

    pub fn as_bytes(&self) -> &[u8; ROOT_KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Canonical byte-path identifying a property or nested element within a
/// record. Produced by the schema layer; opaque here beyond byte ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference(Vec<u8>);

impl Reference {
    pub fn new(path: impl Into<Vec<u8>>) -> Self {
        Reference(path.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The reference of a positional element inside this collection
    /// (list index, set slot). Big-endian index keeps element order aligned
    /// with byte order.
    pub fn element(&self, index: u32) -> Reference {
        let mut path = Vec::with_capacity(self.0.len() + 4);
        path.extend_from_slice(&self.0);
        path.extend_from_slice(&index.to_be_bytes());
        Reference(path)
    }
}

impl From<&str> for Reference {
    fn from(path: &str) -> Self {
        Reference(path.as_bytes().to_vec())
    }
}

/// Model identifier, scoped per store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(name: impl Into<String>) -> Self {
        ModelId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModelId {
    fn from(name: &str) -> Self {
        ModelId(name.to_string())
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of property shapes the storage core distinguishes.
///
/// Scalars, embedded objects and tagged-union arms are written as one payload
/// at one reference; lists, sets and maps additionally maintain a container
/// count cell and per-element rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    Scalar,
    List,
    Set,
    Map,
    Embedded,
    TaggedUnion,
}

impl PropertyKind {
    /// Whether rows of this kind carry a container count cell.
    pub fn is_container(&self) -> bool {
        matches!(self, PropertyKind::List | PropertyKind::Set | PropertyKind::Map)
    }
}

/// One field of a model, as seen by the storage core.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub reference: Reference,
    pub kind: PropertyKind,
    pub unique: bool,
    pub sensitive: bool,
    pub indexed: bool,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, reference: Reference, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            reference,
            kind,
            unique: false,
            sensitive: false,
            indexed: false,
            min_size: None,
            max_size: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn size_bounds(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    /// Validate a container size against the declared bounds.
    pub fn validate_size(&self, count: u32) -> Result<()> {
        if let Some(min) = self.min_size {
            if count < min {
                return Err(Error::Validation(format!(
                    "field '{}': size {count} below minimum {min}",
                    self.name
                )));
            }
        }
        if let Some(max) = self.max_size {
            if count > max {
                return Err(Error::Validation(format!(
                    "field '{}': size {count} above maximum {max}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// The shape of one model as registered with the store.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    pub id: ModelId,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
    /// Models this one references; migrations run dependencies first.
    pub depends_on: Vec<ModelId>,
}

impl ModelSchema {
    pub fn new(id: impl Into<ModelId>, version: u32, fields: Vec<FieldSpec>) -> Self {
        Self {
            id: id.into(),
            version,
            fields,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, models: Vec<ModelId>) -> Self {
        self.depends_on = models;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_reference(&self, reference: &[u8]) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.reference.as_bytes() == reference)
    }

    /// Registration-time validation.
    ///
    /// A sensitive field may not be a non-unique secondary index target:
    /// ciphertext ordering is meaningless, so the combination is rejected
    /// before the store opens. Duplicate references would alias rows and are
    /// rejected too; so is a reference that is a byte-prefix of another,
    /// since prefix scans over the flat keyspaces could not tell the two
    /// fields apart.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.sensitive && field.indexed {
                return Err(Error::Config(format!(
                    "model '{}': field '{}' is sensitive and indexed; \
                     encrypted values cannot back an ordered index",
                    self.id, field.name
                )));
            }
            if !seen.insert(field.reference.as_bytes().to_vec()) {
                return Err(Error::Config(format!(
                    "model '{}': duplicate reference for field '{}'",
                    self.id, field.name
                )));
            }
        }
        for a in &self.fields {
            for b in &self.fields {
                if a.name != b.name && b.reference.as_bytes().starts_with(a.reference.as_bytes())
                {
                    return Err(Error::Config(format!(
                        "model '{}': reference of field '{}' is a prefix of field '{}'",
                        self.id, a.name, b.name
                    )));
                }
            }
        }
        Ok(())
    }
}
