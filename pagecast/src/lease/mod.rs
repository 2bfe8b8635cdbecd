//! Time-bounded exclusive leases on named resources.
//!
//! A lease is a store key holding a random owner token with a TTL. Only the
//! token holder can extend or release it; a crashed holder's lease simply
//! expires.

mod keeper;

pub use keeper::HeldLease;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::store::StoreClient;
use crate::{Error, Result};

/// Upper bound of the random delay added between acquisition attempts.
const ACQUIRE_JITTER_MS: u64 = 50;

/// An owned lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    token: String,
    ttl: Duration,
    expires_at: Instant,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Local estimate of when the lease lapses.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before the lease lapses, as seen locally.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    fn refreshed(&self, ttl: Duration) -> Self {
        Self {
            key: self.key.clone(),
            token: self.token.clone(),
            ttl,
            expires_at: Instant::now() + ttl,
        }
    }
}

/// Acquire, renew and release leases against the shared store.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<StoreClient>,
}

impl LeaseLock {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Acquire `name` for `ttl`.
    ///
    /// Makes `retry_count + 1` attempts, sleeping `retry_delay` plus up to
    /// 50 ms of jitter between them. Fails with [`Error::LockFailed`] when
    /// every attempt finds the lease held.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Result<Lease> {
        let token = Uuid::new_v4().to_string();
        let attempts = retry_count.saturating_add(1);

        for attempt in 0..attempts {
            if self.store.set_nx(name, &token, ttl).await? {
                trace!(lease = name, attempt, "Lease acquired");
                return Ok(Lease {
                    key: name.to_string(),
                    token,
                    ttl,
                    expires_at: Instant::now() + ttl,
                });
            }
            if attempt + 1 < attempts {
                let jitter = rand::random::<u64>() % (ACQUIRE_JITTER_MS + 1);
                tokio::time::sleep(retry_delay + Duration::from_millis(jitter)).await;
            }
        }

        debug!(lease = name, attempts, "Lease is held elsewhere");
        Err(Error::LockFailed {
            key: name.to_string(),
            attempts,
        })
    }

    /// Extend an owned lease to `ttl` from now.
    ///
    /// Fails with [`Error::LeaseExpired`] if the lease lapsed or was taken
    /// over; the caller no longer owns the resource.
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        if self.store.expire_if_eq(&lease.key, &lease.token, ttl).await? {
            Ok(lease.refreshed(ttl))
        } else {
            Err(Error::LeaseExpired {
                key: lease.key.clone(),
            })
        }
    }

    /// Release a lease. Releasing an expired or already released lease is a
    /// no-op.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        if !self.store.delete_if_eq(&lease.key, &lease.token).await? {
            debug!(lease = %lease.key, "Lease already expired or released");
        }
        Ok(())
    }

    /// Release a lease, logging instead of failing. Used on cleanup paths.
    pub async fn release_quietly(&self, lease: &Lease) {
        if let Err(e) = self.release(lease).await {
            warn!(lease = %lease.key, error = %e, "Failed to release lease");
        }
    }

    /// Acquire `name` and keep it renewed in the background until released.
    pub async fn acquire_held(
        &self,
        name: &str,
        ttl: Duration,
        retry_count: u32,
        retry_delay: Duration,
        renew_check_interval: Duration,
    ) -> Result<HeldLease> {
        let lease = self.acquire(name, ttl, retry_count, retry_delay).await?;
        Ok(HeldLease::spawn(self.clone(), lease, renew_check_interval))
    }
}
