//! Migration leases.
//!
//! A migration for one model runs under a lease stored in the meta table, so
//! at most one node works on it at a time. The lease carries an expiry; a
//! holder that crashes simply stops renewing and the next acquirer reclaims
//! the record once the TTL lapses. Acquisition retries on the shared backoff
//! curve up to a configured attempt count.

use crate::config::BackoffConfig;
use crate::error::{Error, Result};
use crate::schema::ModelId;
use crate::substrate::{ReadOps, Substrate};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
struct LeaseRecord {
    token: Uuid,
    expires_at_ms: u64,
}

fn lease_key(model: &ModelId) -> Vec<u8> {
    format!("migration_lease:{model}").into_bytes()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn decode(model: &ModelId, raw: &[u8]) -> Result<LeaseRecord> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::Decode(format!("lease record for '{model}': {e}")))
}

/// Acquire the migration lease for `model`, waiting out a live holder.
pub(crate) async fn acquire(
    substrate: &Substrate,
    model: &ModelId,
    ttl: Duration,
    backoff: &BackoffConfig,
    max_attempts: u32,
) -> Result<Uuid> {
    let token = Uuid::new_v4();
    for attempt in 0..max_attempts.max(1) {
        let claimed = try_claim(substrate, model, token, ttl)?;
        if claimed {
            return Ok(token);
        }
        tracing::debug!(model = %model, attempt, "migration lease held elsewhere; waiting");
        tokio::time::sleep(backoff.delay(attempt)).await;
    }
    Err(Error::Migration {
        model: model.clone(),
        reason: "could not acquire migration lease".into(),
    })
}

fn try_claim(substrate: &Substrate, model: &ModelId, token: Uuid, ttl: Duration) -> Result<bool> {
    substrate.transact(|txn| {
        let key = lease_key(model);
        if let Some(raw) = txn.get(substrate.meta(), &key)? {
            let existing = decode(model, &raw)?;
            if existing.token != token && existing.expires_at_ms > now_ms() {
                return Ok(false);
            }
        }
        let record = LeaseRecord {
            token,
            expires_at_ms: now_ms() + ttl.as_millis() as u64,
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| Error::Decode(format!("encode lease record: {e}")))?;
        txn.set(substrate.meta(), key, value);
        Ok(true)
    })
}

/// Extend the expiry of a lease this node holds.
pub(crate) fn renew(
    substrate: &Substrate,
    model: &ModelId,
    token: Uuid,
    ttl: Duration,
) -> Result<()> {
    let renewed = try_claim(substrate, model, token, ttl)?;
    if renewed {
        Ok(())
    } else {
        Err(Error::Migration {
            model: model.clone(),
            reason: "migration lease lost to another holder".into(),
        })
    }
}

/// Drop the lease, but only while this node still holds it.
pub(crate) fn release(substrate: &Substrate, model: &ModelId, token: Uuid) -> Result<()> {
    substrate.transact(|txn| {
        let key = lease_key(model);
        if let Some(raw) = txn.get(substrate.meta(), &key)? {
            if decode(model, &raw)?.token == token {
                txn.clear(substrate.meta(), key);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn setup() -> Substrate {
        let dir = tempfile::tempdir().unwrap().keep();
        Substrate::open(&StoreConfig::new(dir)).unwrap()
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(1),
            multiplier: 1.0,
            cap: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_second_acquirer_is_blocked_until_release() {
        let substrate = setup();
        let model = ModelId::new("user");

        let first = acquire(&substrate, &model, Duration::from_secs(30), &fast_backoff(), 1)
            .await
            .unwrap();

        let second =
            acquire(&substrate, &model, Duration::from_secs(30), &fast_backoff(), 2).await;
        assert!(matches!(second, Err(Error::Migration { .. })));

        release(&substrate, &model, first).unwrap();
        acquire(&substrate, &model, Duration::from_secs(30), &fast_backoff(), 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let substrate = setup();
        let model = ModelId::new("user");

        // A holder that never renews.
        acquire(&substrate, &model, Duration::from_millis(1), &fast_backoff(), 1)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        acquire(&substrate, &model, Duration::from_secs(30), &fast_backoff(), 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_renew_fails_after_takeover() {
        let substrate = setup();
        let model = ModelId::new("user");

        let stale = acquire(&substrate, &model, Duration::from_millis(1), &fast_backoff(), 1)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        acquire(&substrate, &model, Duration::from_secs(30), &fast_backoff(), 1)
            .await
            .unwrap();

        assert!(renew(&substrate, &model, stale, Duration::from_secs(30)).is_err());
    }
}
