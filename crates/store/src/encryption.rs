//! Field-level encryption.
//!
//! Payload bytes of sensitive fields are encrypted on the way into the
//! latest/historic tables and decrypted on the way out, before schema-level
//! decoding. Key management is pluggable: the store consumes an
//! [`EncryptionProvider`] and never sees key material.
//!
//! Sensitive fields that are also unique need a deterministic index token:
//! ciphertext is non-deterministic by design and cannot serve as an index
//! key, so providers may offer a second capability deriving a stable token
//! from the plaintext.

use crate::error::{Error, Result};
use crate::schema::{FieldSpec, ModelId, ModelSchema, Reference};
use std::sync::Arc;

/// Pluggable encryption backend.
pub trait EncryptionProvider: Send + Sync {
    /// Encrypt a field payload. Output need not be deterministic.
    fn encrypt(&self, model: &ModelId, reference: &Reference, plaintext: &[u8])
        -> Result<Vec<u8>>;

    /// Decrypt a field payload previously produced by [`encrypt`](Self::encrypt).
    fn decrypt(&self, model: &ModelId, reference: &Reference, ciphertext: &[u8])
        -> Result<Vec<u8>>;

    /// Whether this provider can derive deterministic index tokens.
    fn supports_tokens(&self) -> bool {
        false
    }

    /// Derive a deterministic token for a sensitive unique field.
    ///
    /// Must return equal tokens for equal `(model, reference, plaintext)`
    /// inputs across processes and restarts.
    fn deterministic_token(
        &self,
        _model: &ModelId,
        _reference: &Reference,
        _plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        Err(Error::Encryption(
            "provider does not support deterministic tokens".into(),
        ))
    }
}

/// Intercepts payload bytes between the row writer/reader and the substrate.
#[derive(Clone)]
pub struct EncryptionGateway {
    provider: Option<Arc<dyn EncryptionProvider>>,
}

impl EncryptionGateway {
    /// Validate provider requirements against the registered schemas.
    ///
    /// Both checks are fatal at store open: a sensitive field without a
    /// provider, and a sensitive unique field with a provider that cannot
    /// derive deterministic tokens.
    pub fn new(
        provider: Option<Arc<dyn EncryptionProvider>>,
        schemas: &[ModelSchema],
    ) -> Result<Self> {
        for schema in schemas {
            for field in &schema.fields {
                if !field.sensitive {
                    continue;
                }
                let Some(provider) = provider.as_ref() else {
                    return Err(Error::Config(format!(
                        "model '{}': field '{}' is sensitive but no encryption provider is configured",
                        schema.id, field.name
                    )));
                };
                if field.unique && !provider.supports_tokens() {
                    return Err(Error::Config(format!(
                        "model '{}': field '{}' is sensitive and unique but the provider \
                         does not support deterministic index tokens",
                        schema.id, field.name
                    )));
                }
            }
        }
        Ok(Self { provider })
    }

    /// Transform a payload for storage: encrypt sensitive fields, pass
    /// everything else through.
    pub fn seal(&self, model: &ModelId, field: &FieldSpec, payload: &[u8]) -> Result<Vec<u8>> {
        if field.sensitive {
            self.provider()?.encrypt(model, &field.reference, payload)
        } else {
            Ok(payload.to_vec())
        }
    }

    /// Transform a stored payload for the caller: decrypt sensitive fields.
    pub fn open(&self, model: &ModelId, field: &FieldSpec, stored: &[u8]) -> Result<Vec<u8>> {
        if field.sensitive {
            self.provider()?.decrypt(model, &field.reference, stored)
        } else {
            Ok(stored.to_vec())
        }
    }

    /// The unique-index token for a plaintext value: the deterministic token
    /// for sensitive fields, the value bytes themselves otherwise.
    pub fn index_token(
        &self,
        model: &ModelId,
        field: &FieldSpec,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        if field.sensitive {
            self.provider()?
                .deterministic_token(model, &field.reference, plaintext)
        } else {
            Ok(plaintext.to_vec())
        }
    }

    fn provider(&self) -> Result<&Arc<dyn EncryptionProvider>> {
        self.provider.as_ref().ok_or_else(|| {
            Error::Config("sensitive field access without an encryption provider".into())
        })
    }
}
