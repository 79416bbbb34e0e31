//! Error taxonomy for store operations.
//!
//! The split matters to callers: `Conflict`/`StaleWrite`/`NotFound` are
//! recoverable and reported per operation; `Config` is fatal at store open;
//! `Migration`/`MigrationInProgress` gate writes to a model; `Decode` marks a
//! single malformed entry and is logged and skipped inside the log tailer,
//! never propagated out of it.

use crate::schema::{ModelId, RootKey};
use strata_hlc::Version;
use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A unique constraint was violated. The transaction was aborted with no
    /// partial effect; the index still points at `existing_key`.
    #[error("unique constraint on '{field}' violated: value already held by key {existing_key}")]
    Conflict {
        field: String,
        existing_key: RootKey,
    },

    /// An optimistic write found a different prior version than expected.
    #[error("stale write: expected prior version {expected:?}, found {found:?}")]
    StaleWrite {
        expected: Option<Version>,
        found: Option<Version>,
    },

    /// The reference, record, or historical version is absent.
    #[error("not found")]
    NotFound,

    /// A schema-level validation rule failed (size bounds and the like).
    /// The enclosing transaction is aborted with no partial effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fatal configuration problem; the store does not open.
    #[error("configuration error: {0}")]
    Config(String),

    /// A migration handler failed fatally or exhausted its retry budget.
    #[error("migration error for model '{model}': {reason}")]
    Migration { model: ModelId, reason: String },

    /// Writes against a model are rejected while its migration is not Idle.
    #[error("migration in progress for model '{model}'")]
    MigrationInProgress { model: ModelId },

    /// A single malformed log or history entry.
    #[error("decode error: {0}")]
    Decode(String),

    /// Corrupt key bytes.
    #[error(transparent)]
    Codec(#[from] strata_codec::CodecError),

    /// Encryption provider failure.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Substrate failure.
    #[error(transparent)]
    Storage(#[from] fjall::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient substrate failures are re-executed by the transaction loop;
    /// everything else aborts the transaction and surfaces to the caller.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
