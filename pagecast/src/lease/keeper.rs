//! Background renewal of an owned lease.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Lease, LeaseLock};
use crate::{Error, Result};

/// A lease kept alive by a background task.
///
/// The task wakes every `check_interval` and renews once less than half of
/// the TTL remains. If the store reports the lease gone, [`HeldLease::lost`]
/// fires and renewal stops; the holder must stop acting on the resource.
/// Dropping a `HeldLease` stops renewal and lets the lease expire.
pub struct HeldLease {
    lock: LeaseLock,
    current: Arc<Mutex<Lease>>,
    cancel: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeldLease {
    pub(super) fn spawn(lock: LeaseLock, lease: Lease, check_interval: Duration) -> Self {
        let current = Arc::new(Mutex::new(lease));
        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();

        let task = tokio::spawn(renew_loop(
            lock.clone(),
            current.clone(),
            check_interval,
            cancel.clone(),
            lost.clone(),
        ));

        Self {
            lock,
            current,
            cancel,
            lost,
            task: Some(task),
        }
    }

    pub fn key(&self) -> String {
        self.current.lock().key().to_string()
    }

    /// Snapshot of the lease as last renewed.
    pub fn lease(&self) -> Lease {
        self.current.lock().clone()
    }

    /// Token cancelled when ownership is lost.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop renewing and release the lease.
    pub async fn release(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Lease renewal task ended abnormally");
        }
        let lease = self.lease();
        self.lock.release(&lease).await
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn renew_loop(
    lock: LeaseLock,
    current: Arc<Mutex<Lease>>,
    check_interval: Duration,
    cancel: CancellationToken,
    lost: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(check_interval) => {}
        }

        let lease = current.lock().clone();
        if lease.remaining() >= lease.ttl() / 2 {
            continue;
        }

        match lock.renew(&lease, lease.ttl()).await {
            Ok(renewed) => {
                debug!(lease = %renewed.key(), "Lease renewed");
                *current.lock() = renewed;
            }
            Err(Error::LeaseExpired { key }) => {
                warn!(lease = %key, "Lease lost before renewal");
                lost.cancel();
                break;
            }
            Err(e) => {
                warn!(lease = %lease.key(), error = %e, "Lease renewal failed");
                if lease.remaining().is_zero() {
                    lost.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::store::{MemoryStore, Store, StoreClient};

    async fn lock_with_backend() -> (LeaseLock, MemoryStore) {
        let backend = MemoryStore::new();
        let store = StoreClient::connect(Arc::new(backend.clone()), RetryPolicy::fast(1))
            .await
            .unwrap();
        (LeaseLock::new(Arc::new(store)), backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_extends_past_ttl() {
        let (lock, _) = lock_with_backend().await;
        let held = lock
            .acquire_held(
                "transcodelock:j1",
                Duration::from_secs(10),
                0,
                Duration::ZERO,
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!held.is_lost());
        assert!(
            lock.acquire("transcodelock:j1", Duration::from_secs(10), 0, Duration::ZERO)
                .await
                .is_err()
        );

        held.release().await.unwrap();
        lock.acquire("transcodelock:j1", Duration::from_secs(10), 0, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_reports_loss() {
        let (lock, backend) = lock_with_backend().await;
        let held = lock
            .acquire_held("l", Duration::from_secs(10), 0, Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap();

        // Someone else wipes the lease out from under the holder.
        backend.delete("l").await.unwrap();

        tokio::time::timeout(Duration::from_secs(30), held.lost().cancelled())
            .await
            .unwrap();
        assert!(held.is_lost());
        held.release().await.unwrap();
    }
}
