//! Versioned document storage over an ordered, transactional KV substrate.
//!
//! This crate maps a rich, versioned data model onto flat byte keyspaces:
//! latest rows, append-only history with tombstones, unique and secondary
//! indexes, field-level encryption, a shard-partitioned cluster update log
//! with clock synchronization, and an online migration engine.
//!
//! The substrate (fjall) is treated as a black box offering point get/set/
//! clear, ordered range scans, and atomic multi-key commits; everything
//! above that (versioning, history, indexing, migration) lives here.

pub mod config;
pub mod encryption;
pub mod error;
pub mod log;
pub mod migrate;
pub mod schema;
pub mod store;
pub mod substrate;

mod index;
mod rows;
mod unique;

pub use config::{BackoffConfig, MigrationConfig, StoreConfig};
pub use encryption::{EncryptionGateway, EncryptionProvider};
pub use error::{Error, Result};
pub use log::{ChangeEntry, ChangeKind};
pub use migrate::{
    MigrationContext, MigrationHandler, MigrationOutcome, MigrationState, MigrationStatus,
};
pub use schema::{FieldSpec, ModelId, ModelSchema, PropertyKind, Reference, RootKey};
pub use store::{DocumentStore, Expected};

// Re-export the clock types; callers stamp subscriptions and point-in-time
// reads with these.
pub use strata_hlc::{Version, VersionClock};
