//! Periodic heartbeat emission for one invocation.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::HeartbeatRegistry;

/// Background task that beats immediately and then every interval until
/// stopped. A failed beat is logged and retried on the next tick.
pub struct HeartbeatEmitter {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatEmitter {
    pub fn spawn(
        heartbeats: HeartbeatRegistry,
        job_id: String,
        invocation_id: String,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeats.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeats.beat(&job_id, &invocation_id).await {
                            warn!(job_id, invocation_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
            debug!(job_id, invocation_id, "Heartbeat emitter stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop emitting and wait for an in-flight beat to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Heartbeat emitter ended abnormally");
        }
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
