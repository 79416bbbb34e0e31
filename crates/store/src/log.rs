//! Cluster update log and clock synchronization.
//!
//! Every committed write against a model appends an entry to an append-only
//! log partitioned into shards by a hash of the root key. Tailers poll the
//! log per (shard, model) and republish decoded entries to live subscribers;
//! a periodic clock-sync scan folds the highest version seen anywhere in the
//! log into the local clock, which keeps versions issued on this node above
//! everything it has observed from other nodes.
//!
//! A malformed entry is logged and skipped; it never stalls a tailer. On
//! repeated tail errors the poll interval backs off multiplicatively up to a
//! cap and resets to the base interval after a success.

use crate::config::BackoffConfig;
use crate::error::{Error, Result};
use crate::schema::{ModelId, Reference, RootKey};
use crate::substrate::{ReadOps, Substrate, Txn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_codec::{keys, zerofree};
use strata_hlc::{Version, VersionClock, VERSION_LEN};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Write,
    Delete,
}

/// One decoded cluster-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub model: ModelId,
    pub root: RootKey,
    pub version: Version,
    pub kind: ChangeKind,
    /// References touched by the change.
    pub references: Vec<Reference>,
}

/// Shard for a root key: FNV-1a over the key bytes, reduced mod shard count.
/// Stable across processes, so every node agrees on the placement.
pub(crate) fn shard_of(root: &RootKey, shard_count: u8) -> u8 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for &byte in root.as_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % shard_count.max(1) as u64) as u8
}

/// Log key: `shard(1) ∥ zerofree(model) ∥ 0x00 ∥ version(8)`.
///
/// The forward version suffix keeps one (shard, model)'s entries in commit
/// order under an ascending scan.
pub(crate) fn log_key(buf: &mut Vec<u8>, shard: u8, model: &ModelId, version: Version) {
    buf.clear();
    buf.push(shard);
    zerofree::encode_into(model.as_str().as_bytes(), buf);
    buf.push(0x00);
    buf.extend_from_slice(&version.to_bytes());
}

fn log_prefix(buf: &mut Vec<u8>, shard: u8, model: &ModelId) {
    buf.clear();
    buf.push(shard);
    zerofree::encode_into(model.as_str().as_bytes(), buf);
    buf.push(0x00);
}

fn log_key_version(key: &[u8]) -> Result<Version> {
    if key.len() < VERSION_LEN + 2 {
        return Err(Error::Decode(format!("log key too short: {} bytes", key.len())));
    }
    let mut bytes = [0u8; VERSION_LEN];
    bytes.copy_from_slice(&key[key.len() - VERSION_LEN..]);
    Ok(Version::from_bytes(bytes))
}

/// Append a change entry inside the writing transaction.
pub(crate) fn append(
    txn: &mut Txn<'_>,
    substrate: &Substrate,
    shard_count: u8,
    entry: &ChangeEntry,
    buf: &mut Vec<u8>,
) -> Result<()> {
    let shard = shard_of(&entry.root, shard_count);
    log_key(buf, shard, &entry.model, entry.version);
    let value =
        serde_json::to_vec(entry).map_err(|e| Error::Decode(format!("encode log entry: {e}")))?;
    txn.set(substrate.log(), buf.clone(), value);
    Ok(())
}

struct Subscriber {
    tx: mpsc::Sender<ChangeEntry>,
    /// Entries below this version are not delivered to this subscriber.
    from: Version,
}

struct Group {
    subscribers: Vec<Subscriber>,
    running: bool,
}

struct LogInner {
    groups: HashMap<ModelId, Group>,
    /// Last-consumed log key per (shard, model); preserved when the last
    /// subscriber disconnects so a resubscribe resumes where tailing
    /// stopped.
    cursors: HashMap<(u8, ModelId), Vec<u8>>,
}

/// Tailing and subscription state for the cluster log.
pub(crate) struct ClusterLog {
    substrate: Arc<Substrate>,
    clock: Arc<VersionClock>,
    shard_count: u8,
    tail_interval: Duration,
    backoff: BackoffConfig,
    inner: Arc<Mutex<LogInner>>,
}

impl ClusterLog {
    pub(crate) fn new(
        substrate: Arc<Substrate>,
        clock: Arc<VersionClock>,
        shard_count: u8,
        tail_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            substrate,
            clock,
            shard_count,
            tail_interval,
            backoff,
            inner: Arc::new(Mutex::new(LogInner {
                groups: HashMap::new(),
                cursors: HashMap::new(),
            })),
        }
    }

    /// Subscribe to changes of one model with version >= `from`.
    ///
    /// Tailer tasks for the model's shards are started lazily with the first
    /// subscriber and wind down (cursors preserved) when the last receiver
    /// is dropped.
    pub(crate) fn subscribe(&self, model: &ModelId, from: Version) -> mpsc::Receiver<ChangeEntry> {
        let (tx, rx) = mpsc::channel(256);

        let mut inner = self.inner.lock();
        for shard in 0..self.shard_count {
            inner
                .cursors
                .entry((shard, model.clone()))
                .or_insert_with(|| {
                    let mut cursor = Vec::new();
                    if from == Version::ZERO {
                        // The bare prefix sorts below every full key, so an
                        // entry stamped exactly ZERO is still delivered.
                        log_prefix(&mut cursor, shard, model);
                    } else {
                        // One below `from`, so `from` itself is delivered.
                        log_key(&mut cursor, shard, model, Version::new(from.as_u64() - 1));
                    }
                    cursor
                });
        }

        let group = inner.groups.entry(model.clone()).or_insert(Group {
            subscribers: Vec::new(),
            running: false,
        });
        group.subscribers.push(Subscriber { tx, from });

        if !group.running {
            group.running = true;
            for shard in 0..self.shard_count {
                self.spawn_tailer(shard, model.clone());
            }
        }
        rx
    }

    fn spawn_tailer(&self, shard: u8, model: ModelId) {
        let substrate = self.substrate.clone();
        let clock = self.clock.clone();
        let inner = self.inner.clone();
        let base = self.tail_interval;
        let backoff = self.backoff;

        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                let interval = if failures == 0 {
                    base
                } else {
                    backoff.delay(failures - 1)
                };
                tokio::time::sleep(interval).await;

                // Snapshot live subscribers; wind down when none remain.
                let subscribers: Vec<(mpsc::Sender<ChangeEntry>, Version)> = {
                    let mut guard = inner.lock();
                    let Some(group) = guard.groups.get_mut(&model) else {
                        return;
                    };
                    group.subscribers.retain(|s| !s.tx.is_closed());
                    if group.subscribers.is_empty() {
                        group.running = false;
                        return;
                    }
                    group.subscribers.iter().map(|s| (s.tx.clone(), s.from)).collect()
                };

                let cursor = inner
                    .lock()
                    .cursors
                    .get(&(shard, model.clone()))
                    .cloned()
                    .unwrap_or_default();

                // Smallest key strictly greater than the cursor.
                let mut start = cursor.clone();
                start.push(0x00);
                let mut prefix = Vec::new();
                log_prefix(&mut prefix, shard, &model);
                let end = keys::prefix_successor(&prefix);

                let batch = substrate.range(substrate.log(), &start, end.as_deref());
                match batch {
                    Ok(entries) => {
                        failures = 0;
                        let mut new_cursor = cursor;
                        for (key, value) in entries {
                            match serde_json::from_slice::<ChangeEntry>(&value) {
                                Ok(entry) => {
                                    clock.observe(entry.version);
                                    // The shared cursor outlives any single
                                    // subscriber; each one still only sees
                                    // entries from its own starting version.
                                    for (tx, from) in &subscribers {
                                        if entry.version >= *from {
                                            let _ = tx.send(entry.clone()).await;
                                        }
                                    }
                                }
                                Err(error) => {
                                    tracing::warn!(
                                        model = %model,
                                        shard,
                                        %error,
                                        "skipping malformed cluster-log entry"
                                    );
                                }
                            }
                            // Advance past the entry either way.
                            new_cursor = key;
                        }
                        inner
                            .lock()
                            .cursors
                            .insert((shard, model.clone()), new_cursor);
                    }
                    Err(error) => {
                        failures += 1;
                        tracing::warn!(
                            model = %model,
                            shard,
                            failures,
                            %error,
                            "cluster-log tail failed; backing off"
                        );
                    }
                }
            }
        });
    }
}

/// Drop log entries with version below `horizon` for one model, across all
/// shards. The log is append-only otherwise; without a periodic sweep it
/// grows without bound. Entries a live subscriber has not consumed yet are
/// removed like any other, so the horizon should trail the slowest cursor.
pub(crate) fn sweep(
    substrate: &Substrate,
    shard_count: u8,
    model: &ModelId,
    horizon: Version,
) -> Result<u64> {
    let mut removed = 0u64;
    let mut start = Vec::new();
    let mut end = Vec::new();
    for shard in 0..shard_count {
        log_prefix(&mut start, shard, model);
        log_key(&mut end, shard, model, horizon);
        let doomed = substrate.range(substrate.log(), &start, Some(&end))?;
        if doomed.is_empty() {
            continue;
        }
        removed += doomed.len() as u64;
        substrate.transact(|txn| {
            for (key, _) in &doomed {
                txn.clear(substrate.log(), key.clone());
            }
            Ok(())
        })?;
    }
    Ok(removed)
}

/// Periodic scan folding the highest version observed anywhere in the log
/// into the local clock.
pub(crate) fn spawn_clock_sync(
    substrate: Arc<Substrate>,
    clock: Arc<VersionClock>,
    models: Vec<ModelId>,
    shard_count: u8,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut prefix = Vec::new();
        loop {
            tokio::time::sleep(interval).await;
            for shard in 0..shard_count {
                for model in &models {
                    log_prefix(&mut prefix, shard, model);
                    // Keys are version-ordered; the last one is the shard's
                    // head, so one reverse step suffices.
                    match substrate.last_in_prefix(substrate.log(), &prefix) {
                        Ok(Some((key, _))) => match log_key_version(&key) {
                            Ok(version) => clock.observe(version),
                            Err(error) => {
                                tracing::warn!(%error, "malformed cluster-log key")
                            }
                        },
                        Ok(None) => {}
                        Err(error) => {
                            tracing::debug!(%error, shard, "clock-sync scan failed");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn setup() -> (Arc<Substrate>, Arc<VersionClock>) {
        let dir = tempfile::tempdir().unwrap().keep();
        let substrate = Arc::new(Substrate::open(&StoreConfig::new(dir)).unwrap());
        (substrate, Arc::new(VersionClock::new()))
    }

    fn entry(model: &ModelId, version: u64) -> ChangeEntry {
        ChangeEntry {
            model: model.clone(),
            root: RootKey::random(),
            version: Version::new(version),
            kind: ChangeKind::Write,
            references: vec![Reference::from("name")],
        }
    }

    #[test]
    fn test_shard_is_stable_and_bounded() {
        let root = RootKey::random();
        let a = shard_of(&root, 8);
        let b = shard_of(&root, 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn test_log_keys_order_by_version_within_shard_and_model() {
        let model = ModelId::new("doc");
        let mut older = Vec::new();
        let mut newer = Vec::new();
        log_key(&mut older, 3, &model, Version::new(10));
        log_key(&mut newer, 3, &model, Version::new(20));
        assert!(older < newer);
        assert_eq!(log_key_version(&older).unwrap(), Version::new(10));
    }

    #[tokio::test]
    async fn test_subscriber_receives_appended_changes() {
        let (substrate, clock) = setup();
        let model = ModelId::new("doc");
        let log = ClusterLog::new(
            substrate.clone(),
            clock,
            4,
            Duration::from_millis(5),
            BackoffConfig::default(),
        );

        let mut rx = log.subscribe(&model, Version::ZERO);

        let change = entry(&model, 42);
        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                append(txn, &substrate, 4, &change, &mut buf)
            })
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.version, Version::new(42));
        assert_eq!(received.root, change.root);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_skipped_not_fatal() {
        let (substrate, clock) = setup();
        let model = ModelId::new("doc");
        let log = ClusterLog::new(
            substrate.clone(),
            clock,
            1,
            Duration::from_millis(5),
            BackoffConfig::default(),
        );

        let mut rx = log.subscribe(&model, Version::ZERO);

        // A garbage entry followed by a valid one.
        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                log_key(&mut buf, 0, &model, Version::new(10));
                txn.set(substrate.log(), buf.clone(), b"not json".to_vec());
                Ok(())
            })
            .unwrap();
        let change = entry(&model, 20);
        // Force the valid entry into shard 0 regardless of its root's hash.
        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                append(txn, &substrate, 1, &change, &mut buf)
            })
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.version, Version::new(20));
    }

    #[tokio::test]
    async fn test_entry_at_version_zero_is_delivered() {
        let (substrate, clock) = setup();
        let model = ModelId::new("doc");
        let log = ClusterLog::new(
            substrate.clone(),
            clock,
            1,
            Duration::from_millis(5),
            BackoffConfig::default(),
        );

        let mut rx = log.subscribe(&model, Version::ZERO);

        let change = entry(&model, 0);
        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                append(txn, &substrate, 1, &change, &mut buf)
            })
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.version, Version::ZERO);
    }

    #[test]
    fn test_sweep_removes_entries_below_horizon() {
        let (substrate, _clock) = setup();
        let model = ModelId::new("doc");

        for version in [10u64, 20, 30] {
            let change = entry(&model, version);
            substrate
                .transact(|txn| {
                    let mut buf = Vec::new();
                    append(txn, &substrate, 2, &change, &mut buf)
                })
                .unwrap();
        }

        // Entries below 30 go; the newest one stays.
        let removed = sweep(&substrate, 2, &model, Version::new(30)).unwrap();
        assert_eq!(removed, 2);

        let mut remaining = Vec::new();
        for shard in 0..2u8 {
            let mut prefix = Vec::new();
            log_prefix(&mut prefix, shard, &model);
            remaining.extend(substrate.prefix(substrate.log(), &prefix).unwrap());
        }
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            log_key_version(&remaining[0].0).unwrap(),
            Version::new(30)
        );

        // A second sweep at the same horizon is a no-op.
        assert_eq!(sweep(&substrate, 2, &model, Version::new(30)).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clock_sync_folds_remote_versions() {
        let (substrate, clock) = setup();
        let model = ModelId::new("doc");

        // A remote node's entry with a version far ahead of local time.
        let remote_version = clock.next().as_u64() + 60_000_000;
        let change = entry(&model, remote_version);
        substrate
            .transact(|txn| {
                let mut buf = Vec::new();
                append(txn, &substrate, 2, &change, &mut buf)
            })
            .unwrap();

        let handle = spawn_clock_sync(
            substrate.clone(),
            clock.clone(),
            vec![model],
            2,
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        // Everything issued after observation is above the remote version.
        assert!(clock.next().as_u64() > remote_version);
    }
}
