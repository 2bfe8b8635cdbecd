//! Automatic stop of recordings that reach their duration limit.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::StageEvent;
use crate::domain::{ControlSignal, TaskStatus, TaskUpdate};
use crate::services::ServiceContainer;

/// Fires once when a recording has run for `limit` since `started_at`:
/// pushes `Stop` onto the job's control list, marks the task `canceled` and
/// notifies the worker.
pub(super) struct DurationWatchdog {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DurationWatchdog {
    pub(super) fn spawn(
        services: ServiceContainer,
        job_id: String,
        started_at: DateTime<Utc>,
        limit: Duration,
        events: mpsc::Sender<StageEvent>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let token = cancel.clone();

        let elapsed = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
        let remaining = limit.saturating_sub(elapsed);

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(remaining) => {}
            }

            match services.tasks.find_task(&job_id).await {
                Ok(Some(task)) if task.status.is_recording_phase() => {}
                Ok(_) => return,
                Err(e) => {
                    warn!(job_id, error = %e, "Duration watchdog could not read task");
                    return;
                }
            }

            info!(job_id, limit_secs = limit.as_secs(), "Recording reached its duration limit");
            if let Err(e) = services.control.send(&job_id, ControlSignal::Stop).await {
                warn!(job_id, error = %e, "Failed to push auto-stop signal");
            }
            let update = TaskUpdate::new()
                .status(TaskStatus::Canceled)
                .cancel_time(Utc::now());
            if let Err(e) = services.tasks.update_task(&job_id, update).await {
                warn!(job_id, error = %e, "Failed to mark auto-stopped task canceled");
            }
            let _ = events.send(StageEvent::DurationLimitReached).await;
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    pub(super) async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Duration watchdog ended abnormally");
        }
    }
}

impl Drop for DurationWatchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
