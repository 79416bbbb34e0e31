//! The document store facade.
//!
//! Ties the pieces together: schema registration, the version clock, the
//! encryption gateway, row/index maintenance inside substrate transactions,
//! the cluster update log, and the migration engine. One write call is one
//! transaction; the latest row, historic row, index entries, keys row and
//! log entry for a write all land atomically or not at all.

use crate::config::StoreConfig;
use crate::encryption::{EncryptionGateway, EncryptionProvider};
use crate::error::{Error, Result};
use crate::log::{self, ChangeEntry, ChangeKind, ClusterLog};
use crate::migrate::{MigrationEngine, MigrationHandler, MigrationState, MigrationStatus};
use crate::schema::{FieldSpec, ModelId, ModelSchema, Reference, RootKey, ROOT_KEY_LEN};
use crate::substrate::{ModelTables, ReadOps, Substrate, Txn};
use crate::{index, rows, unique};
use std::collections::HashMap;
use std::sync::Arc;
use strata_hlc::{Version, VersionClock, VERSION_LEN};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// Precondition on the record's last-written version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// No check.
    Any,
    /// The record must not exist yet.
    Absent,
    /// The record's last write must be exactly this version.
    At(Version),
}

/// A versioned, indexed, optionally encrypted document store.
pub struct DocumentStore {
    config: StoreConfig,
    substrate: Arc<Substrate>,
    schemas: HashMap<ModelId, ModelSchema>,
    tables: HashMap<ModelId, ModelTables>,
    clock: Arc<VersionClock>,
    gateway: EncryptionGateway,
    log: ClusterLog,
    migrations: MigrationEngine,
    clock_sync: JoinHandle<()>,
}

impl DocumentStore {
    /// Open (or create) a store for the given schemas.
    ///
    /// Validates every schema and the encryption setup, then runs the
    /// migration plan. Open blocks on migrations up to the configured inline
    /// budget; past it they continue in the background and writes to the
    /// affected models stay rejected until they finish. A migration error
    /// surfaced within the budget fails the open.
    pub async fn open(
        config: StoreConfig,
        schemas: Vec<ModelSchema>,
        provider: Option<Arc<dyn EncryptionProvider>>,
        handlers: HashMap<ModelId, Arc<dyn MigrationHandler>>,
    ) -> Result<Self> {
        for schema in &schemas {
            schema.validate()?;
        }
        let gateway = EncryptionGateway::new(provider, &schemas)?;

        let substrate = Arc::new(Substrate::open(&config)?);
        let mut tables = HashMap::new();
        let mut by_id = HashMap::new();
        for schema in schemas {
            if by_id.contains_key(&schema.id) {
                return Err(Error::Config(format!(
                    "model '{}' registered twice",
                    schema.id
                )));
            }
            tables.insert(schema.id.clone(), substrate.model_tables(&schema.id)?);
            by_id.insert(schema.id.clone(), schema);
        }

        let clock = Arc::new(VersionClock::new());
        let migrations = MigrationEngine::new(
            substrate.clone(),
            config.migration,
            config.backoff,
        );
        let schema_list: Vec<ModelSchema> = by_id.values().cloned().collect();
        let done = migrations.start(&schema_list, &handlers)?;
        match tokio::time::timeout(config.migration.inline_budget, done).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::Config(
                    "migration task ended without reporting a result".into(),
                ));
            }
            Err(_) => {
                tracing::info!("migration plan exceeded the inline budget; continuing in background");
            }
        }

        let log = ClusterLog::new(
            substrate.clone(),
            clock.clone(),
            config.shard_count,
            config.tail_interval,
            config.backoff,
        );
        let clock_sync = log::spawn_clock_sync(
            substrate.clone(),
            clock.clone(),
            by_id.keys().cloned().collect(),
            config.shard_count,
            config.clock_sync_interval,
        );

        Ok(Self {
            config,
            substrate,
            schemas: by_id,
            tables,
            clock,
            gateway,
            log,
            migrations,
            clock_sync,
        })
    }

    /// Write field values of one record, atomically with its index entries,
    /// history rows and log entry.
    ///
    /// All payloads are the canonical plaintext encodings; sensitive fields
    /// are encrypted on the way in. Returns the version stamped on the
    /// write.
    pub fn write(
        &self,
        model: &ModelId,
        root: &RootKey,
        values: &[(&str, Vec<u8>)],
        expected: Expected,
    ) -> Result<Version> {
        let (schema, tables) = self.model(model)?;
        self.check_writable(model)?;
        let version = self.clock.next();
        let retain = self.config.retain_history;

        self.substrate.transact(|txn| {
            let mut buf = Vec::new();
            let found = self.check_expected(txn, tables, root, expected, &mut buf)?;

            let mut references = Vec::with_capacity(values.len());
            for (name, payload) in values {
                let field = field_of(schema, name)?;
                // A scalar write to a container field would clobber its
                // count cell.
                if field.kind.is_container() {
                    return Err(Error::Validation(format!(
                        "field '{name}' is a container; use write_container"
                    )));
                }
                let old = rows::read_latest(txn, tables, root, &field.reference, &mut buf)?;

                let sealed = self.gateway.seal(model, field, payload)?;
                rows::write_value(
                    txn, tables, root, &field.reference, version, &sealed, retain, &mut buf,
                );

                if field.unique {
                    let token = self.gateway.index_token(model, field, payload)?;
                    let old_token = match &old {
                        Some(row) => {
                            let plain = self.gateway.open(model, field, &row.payload)?;
                            Some(self.gateway.index_token(model, field, &plain)?)
                        }
                        None => None,
                    };
                    unique::apply(
                        txn,
                        tables,
                        field,
                        root,
                        &token,
                        old_token.as_deref(),
                        version,
                        &mut buf,
                    )?;
                }
                if field.indexed {
                    // Sensitive fields are never indexed, so the stored
                    // payload is the plaintext value.
                    index::apply(
                        txn,
                        tables,
                        field,
                        root,
                        payload,
                        old.as_ref().map(|row| row.payload.as_slice()),
                        version,
                        &mut buf,
                    );
                }
                references.push(field.reference.clone());
            }

            self.write_keys_row(txn, tables, root, found, version);
            self.append_log(txn, model, root, version, ChangeKind::Write, references)?;
            Ok(version)
        })
    }

    /// Replace the contents of a list/set/map field.
    ///
    /// Writes the count cell (validating size bounds) and one row per
    /// element; a shrinking container gets tombstones for the dropped tail.
    pub fn write_container(
        &self,
        model: &ModelId,
        root: &RootKey,
        field_name: &str,
        elements: &[Vec<u8>],
    ) -> Result<Version> {
        let (schema, tables) = self.model(model)?;
        self.check_writable(model)?;
        let field = field_of(schema, field_name)?;
        if !field.kind.is_container() {
            return Err(Error::Validation(format!(
                "field '{field_name}' is not a container"
            )));
        }
        let version = self.clock.next();
        let retain = self.config.retain_history;
        let new_len = elements.len() as u32;

        self.substrate.transact(|txn| {
            let mut buf = Vec::new();
            let found = self.check_expected(txn, tables, root, Expected::Any, &mut buf)?;

            let old_len = rows::read_count(txn, tables, root, field, &mut buf)?;
            rows::write_count(txn, tables, root, field, version, new_len, retain, &mut buf)?;
            for (i, element) in elements.iter().enumerate() {
                let reference = field.reference.element(i as u32);
                let sealed = self.gateway.seal(model, field, element)?;
                rows::write_value(txn, tables, root, &reference, version, &sealed, retain, &mut buf);
            }
            if new_len < old_len {
                rows::truncate_list(
                    txn, tables, root, field, old_len, new_len, version, retain, &mut buf,
                );
            }

            self.write_keys_row(txn, tables, root, found, version);
            self.append_log(
                txn,
                model,
                root,
                version,
                ChangeKind::Write,
                vec![field.reference.clone()],
            )?;
            Ok(version)
        })
    }

    /// Read field values, latest or as of a historical version.
    ///
    /// Results align with the requested field names; `None` marks a field
    /// that was never written or was deleted at the requested point in time.
    pub fn read(
        &self,
        model: &ModelId,
        root: &RootKey,
        fields: &[&str],
        at: Option<Version>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let (schema, tables) = self.model(model)?;
        let retain = self.config.retain_history;
        let view = &*self.substrate;

        let mut buf = Vec::new();
        let mut out = Vec::with_capacity(fields.len());
        for name in fields {
            let field = field_of(schema, name)?;
            let row = rows::read_value(view, tables, root, &field.reference, at, retain, &mut buf)?;
            out.push(match row {
                Some(row) => Some(self.gateway.open(model, field, &row.payload)?),
                None => None,
            });
        }
        Ok(out)
    }

    /// Read a container's elements, latest or at a historical version.
    pub fn read_container(
        &self,
        model: &ModelId,
        root: &RootKey,
        field_name: &str,
        at: Option<Version>,
    ) -> Result<Vec<Vec<u8>>> {
        let (schema, tables) = self.model(model)?;
        let field = field_of(schema, field_name)?;
        if !field.kind.is_container() {
            return Err(Error::Validation(format!(
                "field '{field_name}' is not a container"
            )));
        }
        let retain = self.config.retain_history;
        let view = &*self.substrate;

        let mut buf = Vec::new();
        let count = match rows::read_value(view, tables, root, &field.reference, at, retain, &mut buf)? {
            Some(row) => {
                let bytes: [u8; 4] = row.payload.as_slice().try_into().map_err(|_| {
                    Error::Decode(format!(
                        "container count for '{field_name}' has {} bytes",
                        row.payload.len()
                    ))
                })?;
                u32::from_be_bytes(bytes)
            }
            None => 0,
        };
        // A count cell that violates the schema bounds cannot have been
        // written by the container path; refuse to act on it.
        field.validate_size(count)?;

        let mut out = Vec::new();
        for i in 0..count {
            let reference = field.reference.element(i);
            let row = rows::read_value(view, tables, root, &reference, at, retain, &mut buf)?
                .ok_or_else(|| {
                    Error::Decode(format!("container '{field_name}' is missing element {i}"))
                })?;
            out.push(self.gateway.open(model, field, &row.payload)?);
        }
        Ok(out)
    }

    /// Delete one field value: tombstone, index release, log entry.
    pub fn delete(&self, model: &ModelId, root: &RootKey, field_name: &str) -> Result<Version> {
        let (schema, tables) = self.model(model)?;
        self.check_writable(model)?;
        let field = field_of(schema, field_name)?;
        if field.kind.is_container() {
            return Err(Error::Validation(format!(
                "field '{field_name}' is a container; write an empty container to clear it"
            )));
        }
        let version = self.clock.next();
        let retain = self.config.retain_history;

        self.substrate.transact(|txn| {
            let mut buf = Vec::new();
            let row = rows::read_latest(txn, tables, root, &field.reference, &mut buf)?
                .ok_or(Error::NotFound)?;
            self.release_claims(txn, tables, model, field, root, &row.payload, &mut buf)?;
            rows::delete_value(txn, tables, root, &field.reference, version, retain, &mut buf);

            let found = self.check_expected(txn, tables, root, Expected::Any, &mut buf)?;
            self.write_keys_row(txn, tables, root, found, version);
            self.append_log(
                txn,
                model,
                root,
                version,
                ChangeKind::Delete,
                vec![field.reference.clone()],
            )?;
            Ok(version)
        })
    }

    /// Delete a whole record: every live row is tombstoned, every index
    /// claim released, and the keys row removed.
    pub fn delete_record(&self, model: &ModelId, root: &RootKey) -> Result<Version> {
        let (schema, tables) = self.model(model)?;
        self.check_writable(model)?;
        let version = self.clock.next();
        let retain = self.config.retain_history;

        self.substrate.transact(|txn| {
            let mut buf = Vec::new();
            if self.read_keys_row(txn, tables, root, &mut buf)?.is_none() {
                return Err(Error::NotFound);
            }

            let mut references = Vec::new();
            for (key, value) in txn.prefix(&tables.latest, root.as_bytes())? {
                if key.len() <= ROOT_KEY_LEN || value.len() < VERSION_LEN {
                    return Err(Error::Decode("malformed latest row".into()));
                }
                let reference = Reference::new(key[ROOT_KEY_LEN..].to_vec());
                let payload = &value[VERSION_LEN..];
                if let Some(field) = schema.field_by_reference(reference.as_bytes()) {
                    self.release_claims(txn, tables, model, field, root, payload, &mut buf)?;
                }
                rows::delete_value(txn, tables, root, &reference, version, retain, &mut buf);
                references.push(reference);
            }

            txn.clear(&tables.keys, root.as_bytes().to_vec());
            self.append_log(txn, model, root, version, ChangeKind::Delete, references)?;
            Ok(version)
        })
    }

    /// Range scan over a secondary index: roots whose field value lies in
    /// `[lower, upper)`, ordered by value. `at` filters out entries written
    /// after the given version.
    pub fn scan_by_index(
        &self,
        model: &ModelId,
        field_name: &str,
        lower: &[u8],
        upper: Option<&[u8]>,
        at: Option<Version>,
    ) -> Result<Vec<(RootKey, Version)>> {
        let (schema, tables) = self.model(model)?;
        let field = field_of(schema, field_name)?;
        if !field.indexed {
            return Err(Error::Validation(format!(
                "field '{field_name}' is not indexed"
            )));
        }
        index::scan(&*self.substrate, tables, field, lower, upper, at)
    }

    /// The root currently holding a unique field's value, if any.
    pub fn lookup_unique(
        &self,
        model: &ModelId,
        field_name: &str,
        value: &[u8],
    ) -> Result<Option<RootKey>> {
        let (schema, tables) = self.model(model)?;
        let field = field_of(schema, field_name)?;
        if !field.unique {
            return Err(Error::Validation(format!(
                "field '{field_name}' is not unique"
            )));
        }
        let token = self.gateway.index_token(model, field, value)?;
        let mut buf = Vec::new();
        Ok(unique::lookup(&*self.substrate, tables, field, &token, &mut buf)?
            .map(|(_, root)| root))
    }

    /// Whether a record with this root exists.
    pub fn contains_key(&self, model: &ModelId, root: &RootKey) -> Result<bool> {
        let (_, tables) = self.model(model)?;
        Ok(self.substrate.get(&tables.keys, root.as_bytes())?.is_some())
    }

    /// Number of live records of a model.
    pub fn record_count(&self, model: &ModelId) -> Result<u64> {
        let (_, tables) = self.model(model)?;
        Ok(self.substrate.prefix(&tables.keys, &[])?.len() as u64)
    }

    /// Creation and last-write versions of a record.
    pub fn record_versions(
        &self,
        model: &ModelId,
        root: &RootKey,
    ) -> Result<Option<(Version, Version)>> {
        let (_, tables) = self.model(model)?;
        let mut buf = Vec::new();
        self.read_keys_row(&*self.substrate, tables, root, &mut buf)
    }

    /// Subscribe to committed changes of a model with version >= `from`.
    pub fn subscribe_updates(&self, model: &ModelId, from: Version) -> mpsc::Receiver<ChangeEntry> {
        self.log.subscribe(model, from)
    }

    /// Stream adapter over [`subscribe_updates`](Self::subscribe_updates).
    pub fn update_stream(
        &self,
        model: &ModelId,
        from: Version,
    ) -> ReceiverStream<ChangeEntry> {
        ReceiverStream::new(self.log.subscribe(model, from))
    }

    /// Drop historic rows no longer needed for point-in-time reads at or
    /// after `horizon`. Per (root, reference), the newest entry at or below
    /// the horizon survives; everything older goes. Returns the number of
    /// rows removed.
    pub fn history_sweep(&self, model: &ModelId, horizon: Version) -> Result<u64> {
        let (_, tables) = self.model(model)?;

        let entries = self.substrate.prefix(&tables.historic, &[])?;
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        // Keys group by (root, reference) and order newest-first within a
        // group; the first at-or-below-horizon entry per group is the one
        // point-in-time reads at the horizon still need.
        let mut group: Option<Vec<u8>> = None;
        let mut kept_floor = false;
        for (key, _) in entries {
            if key.len() < VERSION_LEN + 1 {
                continue;
            }
            let prefix = key[..key.len() - VERSION_LEN].to_vec();
            if group.as_ref() != Some(&prefix) {
                group = Some(prefix);
                kept_floor = false;
            }
            let version = match strata_codec::keys::versioned_key_version(&key) {
                Ok(version) => version,
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed historic entry in sweep");
                    continue;
                }
            };
            if version > horizon {
                continue;
            }
            if !kept_floor {
                kept_floor = true;
                continue;
            }
            doomed.push(key);
        }

        let removed = doomed.len() as u64;
        if !doomed.is_empty() {
            self.substrate.transact(|txn| {
                for key in &doomed {
                    txn.clear(&tables.historic, key.clone());
                }
                Ok(())
            })?;
        }
        Ok(removed)
    }

    /// Drop cluster-log entries for a model below `horizon`. Companion to
    /// [`history_sweep`](Self::history_sweep); the horizon should trail the
    /// slowest subscriber. Returns the number of entries removed.
    pub fn log_sweep(&self, model: &ModelId, horizon: Version) -> Result<u64> {
        self.model(model)?;
        log::sweep(&self.substrate, self.config.shard_count, model, horizon)
    }

    pub fn migration_status(&self, model: &ModelId) -> Option<MigrationStatus> {
        self.migrations.status(model)
    }

    pub fn pause_migration(&self, model: &ModelId) -> Result<()> {
        self.migrations.pause(model)
    }

    pub fn resume_migration(&self, model: &ModelId) -> Result<()> {
        self.migrations.resume(model)
    }

    pub fn cancel_migration(&self, model: &ModelId) -> Result<()> {
        self.migrations.cancel(model)
    }

    /// Wait for a model's migration to reach Idle or Canceled.
    pub async fn await_migration(&self, model: &ModelId) -> Result<MigrationStatus> {
        self.migrations.await_terminal(model).await
    }

    /// Flush buffered writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.substrate.persist()
    }

    pub fn clock(&self) -> &Arc<VersionClock> {
        &self.clock
    }

    pub fn substrate(&self) -> &Arc<Substrate> {
        &self.substrate
    }

    fn model(&self, model: &ModelId) -> Result<(&ModelSchema, &ModelTables)> {
        let schema = self.schemas.get(model).ok_or_else(|| {
            Error::Validation(format!("model '{model}' is not registered"))
        })?;
        let tables = self.tables.get(model).ok_or_else(|| {
            Error::Validation(format!("model '{model}' is not registered"))
        })?;
        Ok((schema, tables))
    }

    fn check_writable(&self, model: &ModelId) -> Result<()> {
        match self.migrations.status(model) {
            Some(status) if status.state != MigrationState::Idle => {
                Err(Error::MigrationInProgress {
                    model: model.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Read the keys row and enforce the caller's precondition. Returns the
    /// decoded creation/last versions when the record exists.
    fn check_expected<R: ReadOps>(
        &self,
        view: &R,
        tables: &ModelTables,
        root: &RootKey,
        expected: Expected,
        buf: &mut Vec<u8>,
    ) -> Result<Option<(Version, Version)>> {
        let found = self.read_keys_row(view, tables, root, buf)?;
        let found_last = found.map(|(_, last)| last);
        match expected {
            Expected::Any => {}
            Expected::Absent => {
                if found_last.is_some() {
                    return Err(Error::StaleWrite {
                        expected: None,
                        found: found_last,
                    });
                }
            }
            Expected::At(version) => {
                if found_last != Some(version) {
                    return Err(Error::StaleWrite {
                        expected: Some(version),
                        found: found_last,
                    });
                }
            }
        }
        Ok(found)
    }

    fn read_keys_row<R: ReadOps>(
        &self,
        view: &R,
        tables: &ModelTables,
        root: &RootKey,
        _buf: &mut Vec<u8>,
    ) -> Result<Option<(Version, Version)>> {
        match view.get(&tables.keys, root.as_bytes())? {
            Some(value) => {
                if value.len() != 2 * VERSION_LEN {
                    return Err(Error::Decode(format!(
                        "keys row has {} bytes",
                        value.len()
                    )));
                }
                let mut creation = [0u8; VERSION_LEN];
                let mut last = [0u8; VERSION_LEN];
                creation.copy_from_slice(&value[..VERSION_LEN]);
                last.copy_from_slice(&value[VERSION_LEN..]);
                Ok(Some((
                    Version::from_bytes(creation),
                    Version::from_bytes(last),
                )))
            }
            None => Ok(None),
        }
    }

    /// Keys row: `creation(8) ∥ last(8)`. Creation sticks from the first
    /// write; last advances on every write.
    fn write_keys_row(
        &self,
        txn: &mut Txn<'_>,
        tables: &ModelTables,
        root: &RootKey,
        found: Option<(Version, Version)>,
        version: Version,
    ) {
        let creation = found.map(|(creation, _)| creation).unwrap_or(version);
        let mut value = Vec::with_capacity(2 * VERSION_LEN);
        value.extend_from_slice(&creation.to_bytes());
        value.extend_from_slice(&version.to_bytes());
        txn.set(&tables.keys, root.as_bytes().to_vec(), value);
    }

    fn append_log(
        &self,
        txn: &mut Txn<'_>,
        model: &ModelId,
        root: &RootKey,
        version: Version,
        kind: ChangeKind,
        references: Vec<Reference>,
    ) -> Result<()> {
        let mut buf = Vec::new();
        log::append(
            txn,
            &self.substrate,
            self.config.shard_count,
            &ChangeEntry {
                model: model.clone(),
                root: *root,
                version,
                kind,
                references,
            },
            &mut buf,
        )
    }

    /// Release the unique claim and index entry backed by a stored payload.
    fn release_claims(
        &self,
        txn: &mut Txn<'_>,
        tables: &ModelTables,
        model: &ModelId,
        field: &FieldSpec,
        root: &RootKey,
        stored_payload: &[u8],
        buf: &mut Vec<u8>,
    ) -> Result<()> {
        if field.unique {
            let plain = self.gateway.open(model, field, stored_payload)?;
            let token = self.gateway.index_token(model, field, &plain)?;
            unique::remove(txn, tables, field, root, &token, buf)?;
        }
        if field.indexed {
            index::remove(txn, tables, field, root, stored_payload, buf);
        }
        Ok(())
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        self.clock_sync.abort();
    }
}

fn field_of<'a>(schema: &'a ModelSchema, name: &str) -> Result<&'a FieldSpec> {
    schema.field(name).ok_or_else(|| {
        Error::Validation(format!(
            "model '{}' has no field '{name}'",
            schema.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertyKind;

    async fn open_store(schemas: Vec<ModelSchema>) -> DocumentStore {
        let dir = tempfile::tempdir().unwrap().keep();
        DocumentStore::open(StoreConfig::new(dir), schemas, None, HashMap::new())
            .await
            .unwrap()
    }

    fn user_schema() -> ModelSchema {
        ModelSchema::new(
            "user",
            1,
            vec![
                FieldSpec::new("name", Reference::from("name"), PropertyKind::Scalar),
                FieldSpec::new("email", Reference::from("email"), PropertyKind::Scalar).unique(),
                FieldSpec::new("age", Reference::from("age"), PropertyKind::Scalar).indexed(),
                FieldSpec::new("tags", Reference::from("tags"), PropertyKind::List)
                    .size_bounds(None, Some(4)),
            ],
        )
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let store = open_store(vec![user_schema()]).await;
        let model = ModelId::new("user");
        let root = RootKey::random();

        let version = store
            .write(
                &model,
                &root,
                &[("name", b"alice".to_vec()), ("age", vec![30])],
                Expected::Absent,
            )
            .unwrap();

        let values = store.read(&model, &root, &["name", "age"], None).unwrap();
        assert_eq!(values[0], Some(b"alice".to_vec()));
        assert_eq!(values[1], Some(vec![30]));

        let (creation, last) = store.record_versions(&model, &root).unwrap().unwrap();
        assert_eq!(creation, version);
        assert_eq!(last, version);
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let store = open_store(vec![user_schema()]).await;
        let model = ModelId::new("user");
        let root = RootKey::random();

        let v1 = store
            .write(&model, &root, &[("name", b"a".to_vec())], Expected::Absent)
            .unwrap();

        // Re-creating an existing record fails.
        assert!(matches!(
            store.write(&model, &root, &[("name", b"b".to_vec())], Expected::Absent),
            Err(Error::StaleWrite { .. })
        ));

        // A write conditioned on the right version succeeds; on a wrong one
        // it fails without effect.
        store
            .write(&model, &root, &[("name", b"b".to_vec())], Expected::At(v1))
            .unwrap();
        assert!(matches!(
            store.write(&model, &root, &[("name", b"c".to_vec())], Expected::At(v1)),
            Err(Error::StaleWrite { .. })
        ));
        let values = store.read(&model, &root, &["name"], None).unwrap();
        assert_eq!(values[0], Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_model_and_field_are_validation_errors() {
        let store = open_store(vec![user_schema()]).await;
        let root = RootKey::random();

        assert!(matches!(
            store.read(&ModelId::new("nope"), &root, &["name"], None),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.read(&ModelId::new("user"), &root, &["nope"], None),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_contains_and_count_track_records() {
        let store = open_store(vec![user_schema()]).await;
        let model = ModelId::new("user");
        let a = RootKey::random();
        let b = RootKey::random();

        store
            .write(&model, &a, &[("name", b"a".to_vec())], Expected::Absent)
            .unwrap();
        store
            .write(&model, &b, &[("name", b"b".to_vec())], Expected::Absent)
            .unwrap();

        assert!(store.contains_key(&model, &a).unwrap());
        assert_eq!(store.record_count(&model).unwrap(), 2);

        store.delete_record(&model, &a).unwrap();
        assert!(!store.contains_key(&model, &a).unwrap());
        assert_eq!(store.record_count(&model).unwrap(), 1);
    }
}
