//! Hybrid logical clock versions for commit ordering.
//!
//! Every committed write is stamped with a [`Version`]: a 64-bit logical
//! timestamp seeded from physical time and advanced causally when remote
//! versions are observed. Versions are strictly increasing per process and,
//! once clocks are synchronized through the cluster log, non-decreasing
//! across the whole cluster.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A logical commit timestamp.
///
/// The value is microseconds since the Unix epoch in the common case; under
/// contention the low bits act as a logical counter (each issue bumps the
/// clock by at least one). Two byte encodings exist:
///
/// - *forward* ([`Version::to_bytes`]): big-endian, natural ascending order,
///   used as a value prefix in latest/index rows.
/// - *reversed* ([`Version::to_reversed_bytes`]): every byte XORed with 0xFF,
///   used as a key suffix so ascending key order yields newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(u64);

/// Byte width of an encoded version.
pub const VERSION_LEN: usize = 8;

impl Version {
    /// The lowest representable version. Sorts before every real commit.
    pub const ZERO: Version = Version(0);

    pub const fn new(value: u64) -> Self {
        Version(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian forward encoding (ascending byte order matches version order).
    pub fn to_bytes(&self) -> [u8; VERSION_LEN] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; VERSION_LEN]) -> Self {
        Version(u64::from_be_bytes(bytes))
    }

    /// Reversed encoding: bitwise complement of the forward form.
    ///
    /// For versions `v1 < v2`, `v1.to_reversed_bytes()` is lexicographically
    /// greater than `v2.to_reversed_bytes()`, so a key suffix in this form
    /// makes an ascending range scan return entries newest-first.
    pub fn to_reversed_bytes(&self) -> [u8; VERSION_LEN] {
        (!self.0).to_be_bytes()
    }

    pub fn from_reversed_bytes(bytes: [u8; VERSION_LEN]) -> Self {
        Version(!u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Clock issuing commit versions.
///
/// `next()` returns `max(physical_clock_micros, last_issued + 1)`, so issued
/// versions are strictly increasing even when the wall clock stalls or steps
/// backwards. `observe()` folds a remote version into the floor: after
/// observing `v`, every subsequently issued version is greater than `v`.
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Issue the next version.
    pub fn next(&self) -> Version {
        let physical = physical_micros();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(physical.max(last + 1))
            })
            .unwrap_or_else(|v| v);
        Version(physical.max(prev + 1))
    }

    /// Fold a remotely observed version into the clock floor.
    ///
    /// Subsequent calls to [`next`](Self::next) return versions strictly
    /// greater than `remote`.
    pub fn observe(&self, remote: Version) {
        self.last.fetch_max(remote.0, Ordering::SeqCst);
    }

    /// The highest version issued or observed so far.
    pub fn last_seen(&self) -> Version {
        Version(self.last.load(Ordering::SeqCst))
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

fn physical_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
