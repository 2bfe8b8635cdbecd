//! Control signals from the dispatcher to a running record stage.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::domain::{ControlSignal, keys};
use crate::store::StoreClient;

/// Pause between pop attempts after a store error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Per-job FIFO of control signals.
///
/// Signals are not deduplicated; consumers must tolerate repeats.
#[derive(Clone)]
pub struct ControlChannel {
    store: Arc<StoreClient>,
}

impl ControlChannel {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    pub async fn send(&self, job_id: &str, signal: ControlSignal) -> Result<()> {
        self.store
            .rpush(&keys::control(job_id), &signal.encode())
            .await?;
        info!(job_id, %signal, "Control signal sent");
        Ok(())
    }

    /// Wait up to `timeout` for the next signal. Unknown payloads are skipped.
    pub async fn recv(&self, job_id: &str, timeout: Duration) -> Result<Option<ControlSignal>> {
        let Some(raw) = self
            .store
            .blocking_pop(&keys::control(job_id), timeout)
            .await?
        else {
            return Ok(None);
        };
        match ControlSignal::decode(&raw) {
            Some(signal) => Ok(Some(signal)),
            None => {
                warn!(job_id, payload = %raw, "Ignoring unknown control signal");
                Ok(None)
            }
        }
    }
}

/// Background loop forwarding a job's control signals into a channel.
pub struct ControlListener {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ControlListener {
    pub fn spawn<T, F>(
        channel: ControlChannel,
        job_id: String,
        poll_timeout: Duration,
        events: mpsc::Sender<T>,
        map: F,
        parent: &CancellationToken,
    ) -> Self
    where
        T: Send + 'static,
        F: Fn(ControlSignal) -> T + Send + 'static,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    received = channel.recv(&job_id, poll_timeout) => received,
                };
                match received {
                    Ok(Some(signal)) => {
                        debug!(job_id, %signal, "Control signal received");
                        if events.send(map(signal)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(job_id, error = %e, "Control listener failed to poll");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
            debug!(job_id, "Control listener stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Control listener ended abnormally");
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::store::MemoryStore;

    async fn channel() -> ControlChannel {
        let store = StoreClient::connect(Arc::new(MemoryStore::new()), RetryPolicy::fast(1))
            .await
            .unwrap();
        ControlChannel::new(Arc::new(store))
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_arrive_in_order() {
        let channel = channel().await;
        channel.send("j", ControlSignal::Pause).await.unwrap();
        channel.send("j", ControlSignal::Resume).await.unwrap();
        channel.send("j", ControlSignal::Stop).await.unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(channel.recv("j", timeout).await.unwrap(), Some(ControlSignal::Pause));
        assert_eq!(channel.recv("j", timeout).await.unwrap(), Some(ControlSignal::Resume));
        assert_eq!(channel.recv("j", timeout).await.unwrap(), Some(ControlSignal::Stop));
        assert_eq!(channel.recv("j", timeout).await.unwrap(), None);
        assert_eq!(channel.recv("other", timeout).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_forwards_signals() {
        let channel = channel().await;
        let (tx, mut rx) = mpsc::channel(8);
        let root = CancellationToken::new();
        let listener = ControlListener::spawn(
            channel.clone(),
            "j".into(),
            Duration::from_secs(2),
            tx,
            |signal| signal,
            &root,
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        channel.send("j", ControlSignal::Refresh).await.unwrap();
        channel.send("j", ControlSignal::Stop).await.unwrap();

        assert_eq!(rx.recv().await, Some(ControlSignal::Refresh));
        assert_eq!(rx.recv().await, Some(ControlSignal::Stop));

        root.cancel();
        listener.stop().await;
    }
}
