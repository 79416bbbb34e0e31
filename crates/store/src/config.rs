//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a document store.
#[derive(Clone)]
pub struct StoreConfig {
    /// Directory for substrate data.
    pub data_dir: PathBuf,

    /// Block cache size for fjall (in bytes).
    pub block_cache_size: u64,

    /// Compression for data partitions.
    pub compression: fjall::CompressionType,

    /// Whether historic rows (and tombstones) are written alongside latest
    /// rows. Point-in-time reads require this.
    pub retain_history: bool,

    /// Number of cluster-log shards. Shard = hash(root key) % shard_count.
    pub shard_count: u8,

    /// Poll interval for log tailers when idle.
    pub tail_interval: Duration,

    /// Interval of the clock-sync scan over the cluster log.
    pub clock_sync_interval: Duration,

    /// Backoff curve for tail errors and lease acquisition.
    pub backoff: BackoffConfig,

    /// Migration engine tuning.
    pub migration: MigrationConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        // Unique temp directory per instance, kept past the handle's drop.
        let temp_dir = tempfile::tempdir()
            .expect("Failed to create temporary directory")
            .keep();

        Self {
            data_dir: temp_dir,
            block_cache_size: 32 * 1024 * 1024,
            compression: fjall::CompressionType::Lz4,
            retain_history: true,
            shard_count: 8,
            tail_interval: Duration::from_millis(25),
            clock_sync_interval: Duration::from_millis(500),
            backoff: BackoffConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    pub fn with_retain_history(mut self, retain: bool) -> Self {
        self.retain_history = retain;
        self
    }

    pub fn with_shard_count(mut self, shards: u8) -> Self {
        self.shard_count = shards.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    pub fn with_clock_sync_interval(mut self, interval: Duration) -> Self {
        self.clock_sync_interval = interval;
        self
    }
}

/// Multiplicative backoff: `base * multiplier^attempt`, capped, reset to base
/// after a success. The exact curve is operational tuning, so it is
/// configuration rather than constants.
#[derive(Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            cap: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    /// Delay before the given retry attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let raw = self.base.mul_f64(factor.max(1.0));
        raw.min(self.cap)
    }
}

/// Migration engine tuning.
#[derive(Clone, Copy)]
pub struct MigrationConfig {
    /// Maximum handler attempts before a retrying migration turns fatal.
    pub max_attempts: u32,

    /// How long store-open blocks on migrations before they continue in the
    /// background.
    pub inline_budget: Duration,

    /// Lease lifetime; an expired lease is reclaimed by the next acquirer.
    pub lease_ttl: Duration,

    /// Attempts at lease acquisition before giving up.
    pub lease_max_attempts: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            inline_budget: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(30),
            lease_max_attempts: 10,
        }
    }
}

impl MigrationConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_inline_budget(mut self, budget: Duration) -> Self {
        self.inline_budget = budget;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            cap: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_shard_count_floor() {
        let config = StoreConfig::default().with_shard_count(0);
        assert_eq!(config.shard_count, 1);
    }
}
