//! Liveness tracking for running stage invocations.
//!
//! Each invocation periodically writes `"<jobID>:<invocationID>"` into the
//! `heartbeats` sorted set with the current wall clock in milliseconds. An
//! entry older than two intervals plus a buffer is stale.

mod emitter;

pub use emitter::HeartbeatEmitter;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::Result;
use crate::domain::keys;
use crate::store::StoreClient;

/// Reads and writes the shared heartbeat set.
#[derive(Clone)]
pub struct HeartbeatRegistry {
    store: Arc<StoreClient>,
    interval: Duration,
    staleness_buffer: Duration,
}

/// Current wall clock in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl HeartbeatRegistry {
    pub fn new(store: Arc<StoreClient>, interval: Duration, staleness_buffer: Duration) -> Self {
        Self {
            store,
            interval,
            staleness_buffer,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a heartbeat for an invocation at the current time.
    pub async fn beat(&self, job_id: &str, invocation_id: &str) -> Result<()> {
        self.beat_at(job_id, invocation_id, now_ms()).await
    }

    /// Record a heartbeat with an explicit timestamp.
    pub async fn beat_at(&self, job_id: &str, invocation_id: &str, at_ms: i64) -> Result<()> {
        let member = keys::heartbeat_member(job_id, invocation_id);
        self.store.zadd(keys::HEARTBEAT_SET, at_ms, &member).await?;
        trace!(job_id, invocation_id, at_ms, "Heartbeat");
        Ok(())
    }

    pub async fn remove(&self, job_id: &str, invocation_id: &str) -> Result<bool> {
        self.remove_member(&keys::heartbeat_member(job_id, invocation_id))
            .await
    }

    pub async fn remove_member(&self, member: &str) -> Result<bool> {
        self.store.zrem(keys::HEARTBEAT_SET, member).await
    }

    /// Last heartbeat of an invocation, in milliseconds.
    pub async fn last_seen(&self, job_id: &str, invocation_id: &str) -> Result<Option<i64>> {
        self.store
            .zscore(
                keys::HEARTBEAT_SET,
                &keys::heartbeat_member(job_id, invocation_id),
            )
            .await
    }

    /// Newest heartbeat timestamp still considered stale at `now_ms`.
    pub fn stale_cutoff(&self, now_ms: i64) -> i64 {
        let window = 2 * self.interval.as_millis() as i64 + self.staleness_buffer.as_millis() as i64;
        now_ms - window
    }

    /// Members whose last heartbeat is at or before the stale cutoff.
    pub async fn stale_members(&self, now_ms: i64) -> Result<Vec<String>> {
        self.store
            .zrange_by_score(keys::HEARTBEAT_SET, i64::MIN, self.stale_cutoff(now_ms))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::store::MemoryStore;

    async fn registry() -> HeartbeatRegistry {
        let store = StoreClient::connect(Arc::new(MemoryStore::new()), RetryPolicy::fast(1))
            .await
            .unwrap();
        HeartbeatRegistry::new(
            Arc::new(store),
            Duration::from_millis(3000),
            Duration::from_millis(1000),
        )
    }

    #[tokio::test]
    async fn test_stale_boundary_is_inclusive() {
        let heartbeats = registry().await;
        let now = 1_000_000;
        let cutoff = heartbeats.stale_cutoff(now);
        assert_eq!(cutoff, now - 7000);

        heartbeats.beat_at("at", "i", cutoff).await.unwrap();
        heartbeats.beat_at("before", "i", cutoff - 1).await.unwrap();
        heartbeats.beat_at("after", "i", cutoff + 1).await.unwrap();

        let stale = heartbeats.stale_members(now).await.unwrap();
        assert_eq!(stale, vec!["before:i".to_string(), "at:i".to_string()]);
    }

    #[tokio::test]
    async fn test_beat_refreshes_score() {
        let heartbeats = registry().await;
        heartbeats.beat_at("j", "i", 10).await.unwrap();
        heartbeats.beat_at("j", "i", 20).await.unwrap();
        assert_eq!(heartbeats.last_seen("j", "i").await.unwrap(), Some(20));

        assert!(heartbeats.remove("j", "i").await.unwrap());
        assert_eq!(heartbeats.last_seen("j", "i").await.unwrap(), None);
    }
}
