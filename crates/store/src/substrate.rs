//! The transactional substrate wrapper.
//!
//! fjall provides ordered byte keyspaces, point reads and atomic multi-key
//! batches; this module layers the transaction shape the rest of the store
//! relies on. A [`Txn`] collects writes in an overlay keyed per table, so
//! reads inside the transaction see earlier writes of the same transaction
//! (read-your-own-writes) and commit applies the whole overlay through one
//! atomic batch. Committing transactions are serialized; the closure is
//! re-executed from scratch on a transient substrate error, so transaction
//! bodies must derive all state from transaction-local reads.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::schema::ModelId;
use fjall::{Keyspace, Partition, PartitionCreateOptions};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const TXN_MAX_ATTEMPTS: u32 = 3;

/// One named, ordered byte table.
#[derive(Clone)]
pub struct Table {
    name: Arc<str>,
    part: Partition,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The five per-model tables.
#[derive(Clone)]
pub struct ModelTables {
    pub latest: Table,
    pub historic: Table,
    pub index: Table,
    pub unique: Table,
    pub keys: Table,
}

/// Read operations shared by transactions and committed-state reads.
///
/// Point-in-time reads go straight against committed state and never block
/// writers; the write path reads through the transaction overlay.
pub trait ReadOps {
    fn get(&self, table: &Table, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered scan of all live entries whose key starts with `prefix`.
    fn prefix(&self, table: &Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Ordered scan of `[start, end)`.
    fn range(&self, table: &Table, start: &[u8], end: Option<&[u8]>)
        -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Handle to the underlying keyspace and its partitions.
pub struct Substrate {
    keyspace: Keyspace,
    compression: fjall::CompressionType,
    meta: Table,
    log: Table,
    write_lock: Mutex<()>,
    tables: Mutex<HashMap<ModelId, ModelTables>>,
}

impl Substrate {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let keyspace = fjall::Config::new(&config.data_dir)
            .cache_size(config.block_cache_size)
            .open()?;

        let meta = open_table(
            &keyspace,
            "_meta",
            PartitionCreateOptions::default()
                .block_size(16 * 1024)
                .compression(fjall::CompressionType::None),
        )?;
        let log = open_table(
            &keyspace,
            "_log",
            PartitionCreateOptions::default()
                .block_size(32 * 1024)
                .compression(config.compression),
        )?;

        Ok(Self {
            keyspace,
            compression: config.compression,
            meta,
            log,
            write_lock: Mutex::new(()),
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn meta(&self) -> &Table {
        &self.meta
    }

    pub fn log(&self) -> &Table {
        &self.log
    }

    /// Open (or fetch the cached handles for) one model's tables.
    pub fn model_tables(&self, model: &ModelId) -> Result<ModelTables> {
        if let Some(tables) = self.tables.lock().get(model) {
            return Ok(tables.clone());
        }

        let options = || {
            PartitionCreateOptions::default()
                .block_size(64 * 1024)
                .compression(self.compression)
        };
        let open = |suffix: &str| -> Result<Table> {
            open_table(&self.keyspace, &format!("{}_{}", model.as_str(), suffix), options())
        };

        let tables = ModelTables {
            latest: open("latest")?,
            historic: open("historic")?,
            index: open("index")?,
            unique: open("unique")?,
            keys: open("keys")?,
        };
        self.tables.lock().insert(model.clone(), tables.clone());
        Ok(tables)
    }

    /// Run `f` inside a transaction and commit its writes atomically.
    ///
    /// Transient substrate errors re-execute the closure from scratch (with
    /// a fresh, empty overlay); any other error aborts with no partial
    /// effect. Committing transactions are serialized, so reads of committed
    /// state inside the closure are stable for its duration.
    pub fn transact<T>(&self, mut f: impl FnMut(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let _guard = self.write_lock.lock();
            let mut txn = Txn::new(&self.keyspace);
            match f(&mut txn).and_then(|value| txn.commit().map(|_| value)) {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < TXN_MAX_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(attempt, %error, "transaction re-executing after transient substrate error");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Flush buffered writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// The last committed entry under `prefix`, without materializing the
    /// rest of the prefix.
    pub fn last_in_prefix(
        &self,
        table: &Table,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match table.part.prefix(prefix).next_back() {
            Some(item) => {
                let (key, value) = item?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        let _ = self.keyspace.persist(fjall::PersistMode::SyncAll);
    }
}

// Committed-state reads, used by the read path and the log tailers.
impl ReadOps for Substrate {
    fn get(&self, table: &Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(table.part.get(key)?.map(|slice| slice.to_vec()))
    }

    fn prefix(&self, table: &Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in table.part.prefix(prefix) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn range(
        &self,
        table: &Table,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        match end {
            Some(end) => {
                for item in table.part.range(start.to_vec()..end.to_vec()) {
                    let (key, value) = item?;
                    out.push((key.to_vec(), value.to_vec()));
                }
            }
            None => {
                for item in table.part.range(start.to_vec()..) {
                    let (key, value) = item?;
                    out.push((key.to_vec(), value.to_vec()));
                }
            }
        }
        Ok(out)
    }
}

fn open_table(keyspace: &Keyspace, name: &str, options: PartitionCreateOptions) -> Result<Table> {
    let part = keyspace.open_partition(name, options)?;
    Ok(Table {
        name: Arc::from(name),
        part,
    })
}

type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// An in-flight transaction: committed state plus a write overlay.
pub struct Txn<'a> {
    keyspace: &'a Keyspace,
    writes: BTreeMap<Arc<str>, (Partition, Overlay)>,
}

impl<'a> Txn<'a> {
    fn new(keyspace: &'a Keyspace) -> Self {
        Self {
            keyspace,
            writes: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, table: &Table, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.overlay_mut(table).insert(key.into(), Some(value.into()));
    }

    pub fn clear(&mut self, table: &Table, key: impl Into<Vec<u8>>) {
        self.overlay_mut(table).insert(key.into(), None);
    }

    fn overlay_mut(&mut self, table: &Table) -> &mut Overlay {
        &mut self
            .writes
            .entry(table.name.clone())
            .or_insert_with(|| (table.part.clone(), Overlay::new()))
            .1
    }

    fn overlay(&self, table: &Table) -> Option<&Overlay> {
        self.writes.get(table.name()).map(|(_, overlay)| overlay)
    }

    /// Merge an ordered committed scan with this transaction's overlay.
    fn merge_scan(
        &self,
        table: &Table,
        committed: Vec<(Vec<u8>, Vec<u8>)>,
        in_bounds: impl Fn(&[u8]) -> bool,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = committed
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect();
        if let Some(overlay) = self.overlay(table) {
            for (key, value) in overlay {
                if in_bounds(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect()
    }

    fn commit(self) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for (_, (part, overlay)) in self.writes {
            for (key, value) in overlay {
                match value {
                    Some(value) => batch.insert(&part, key, value),
                    None => batch.remove(&part, key),
                }
            }
        }
        batch.commit()?;
        Ok(())
    }
}

impl ReadOps for Txn<'_> {
    fn get(&self, table: &Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(overlay) = self.overlay(table) {
            if let Some(value) = overlay.get(key) {
                return Ok(value.clone());
            }
        }
        Ok(table.part.get(key)?.map(|slice| slice.to_vec()))
    }

    fn prefix(&self, table: &Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut committed = Vec::new();
        for item in table.part.prefix(prefix) {
            let (key, value) = item?;
            committed.push((key.to_vec(), value.to_vec()));
        }
        Ok(self.merge_scan(table, committed, |key| key.starts_with(prefix)))
    }

    fn range(
        &self,
        table: &Table,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut committed = Vec::new();
        match end {
            Some(end) => {
                for item in table.part.range(start.to_vec()..end.to_vec()) {
                    let (key, value) = item?;
                    committed.push((key.to_vec(), value.to_vec()));
                }
            }
            None => {
                for item in table.part.range(start.to_vec()..) {
                    let (key, value) = item?;
                    committed.push((key.to_vec(), value.to_vec()));
                }
            }
        }
        Ok(self.merge_scan(table, committed, |key| {
            key >= start && end.map_or(true, |end| key < end)
        }))
    }
}
