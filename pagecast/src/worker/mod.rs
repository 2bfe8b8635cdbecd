//! Per-invocation coordination for a stage worker.
//!
//! A [`StageWorker`] is created by the compute unit running one stage of one
//! job. It owns that invocation's heartbeat, the stage lease and (for the
//! record stage) the control listener and duration watchdog, and performs the
//! hand-off to the next stage. Background activity reports to a single event
//! channel consumed by the worker's supervising loop.

mod watchdog;

use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::ControlListener;
use crate::domain::{
    ControlSignal, ERROR_CALLBACK_FAILED, Stage, Task, TaskResult, TaskStatus, TaskUpdate,
    TaskView, keys,
};
use crate::heartbeat::HeartbeatEmitter;
use crate::invoker::CallbackSender;
use crate::lease::HeldLease;
use crate::services::ServiceContainer;
use crate::{Error, Result};
use watchdog::DurationWatchdog;

/// Capacity of a worker's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Prefix of the invocation id recorded when dispatching a stage failed.
const UNDISPATCHED_PREFIX: &str = "undispatched-";

/// Lifecycle events delivered to a stage worker's supervising loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    /// The worker holds the stage lease and the task accepted it.
    Started { stage: Stage, invocation_id: String },
    /// A control signal from the dispatcher (record stage only).
    Signal(ControlSignal),
    /// The recording ran for its maximum duration and was stopped.
    DurationLimitReached,
    /// The stage lease was lost; the worker must stop acting on the job.
    LeaseLost,
}

/// Coordinator for one invocation of one stage of one job.
pub struct StageWorker {
    services: ServiceContainer,
    stage: Stage,
    job_id: String,
    invocation_id: String,
    cancel: CancellationToken,
    lease: Option<HeldLease>,
    emitter: Option<HeartbeatEmitter>,
    listener: Option<ControlListener>,
    watchdog: Option<DurationWatchdog>,
    events_tx: mpsc::Sender<StageEvent>,
    events_rx: mpsc::Receiver<StageEvent>,
}

impl StageWorker {
    /// Start coordinating `invocation_id` as the `stage` worker of `job_id`.
    ///
    /// Begins heartbeating, takes the stage lease and moves the task into the
    /// stage's status. A duplicate invocation fails with `LockFailed` after
    /// removing its own heartbeat, leaving the running worker untouched.
    pub async fn start(
        services: ServiceContainer,
        stage: Stage,
        job_id: impl Into<String>,
        invocation_id: impl Into<String>,
    ) -> Result<Self> {
        let job_id = job_id.into();
        let invocation_id = invocation_id.into();
        let cancel = services.cancellation_token().child_token();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let emitter = HeartbeatEmitter::spawn(
            services.heartbeats.clone(),
            job_id.clone(),
            invocation_id.clone(),
            &cancel,
        );

        let mut worker = Self {
            services,
            stage,
            job_id,
            invocation_id,
            cancel,
            lease: None,
            emitter: Some(emitter),
            listener: None,
            watchdog: None,
            events_tx,
            events_rx,
        };

        if let Err(e) = worker.enter().await {
            match &e {
                Error::LockFailed { .. } => info!(
                    job_id = %worker.job_id,
                    stage = %worker.stage,
                    invocation_id = %worker.invocation_id,
                    "Another invocation owns this stage, exiting"
                ),
                _ => warn!(
                    job_id = %worker.job_id,
                    stage = %worker.stage,
                    error = %e,
                    "Stage worker failed to start"
                ),
            }
            worker.teardown().await;
            return Err(e);
        }

        Ok(worker)
    }

    async fn enter(&mut self) -> Result<()> {
        let lease_config = &self.services.config.lease;
        let lease = self
            .services
            .locks
            .acquire_held(
                &keys::stage_lock(self.stage, &self.job_id),
                lease_config.stage_ttl(),
                lease_config.acquire_retry_count,
                lease_config.acquire_retry_delay(),
                lease_config.renew_check_interval(),
            )
            .await?;
        self.watch_lease(&lease);
        self.lease = Some(lease);

        let task = self.services.tasks.get_task(&self.job_id).await?;
        // A record invocation only ever drives a task still in the recording
        // phase. Anything later belongs to another stage.
        if self.stage == Stage::Record && !task.status.is_recording_phase() {
            return Err(Error::IllegalTransition {
                from: task.status.to_string(),
                to: TaskStatus::Recording.to_string(),
            });
        }
        let task = self.services.tasks.update_task(&self.job_id, self.entry_update(&task)).await?;

        if self.stage == Stage::Record {
            self.start_record_supervision(&task);
        }

        info!(
            job_id = %self.job_id,
            stage = %self.stage,
            invocation_id = %self.invocation_id,
            status = %task.status,
            "Stage worker started"
        );
        let _ = self
            .events_tx
            .send(StageEvent::Started {
                stage: self.stage,
                invocation_id: self.invocation_id.clone(),
            })
            .await;
        Ok(())
    }

    fn entry_update(&self, task: &Task) -> TaskUpdate {
        match self.stage {
            // A paused recording that restarts stays paused.
            Stage::Record => {
                let update = TaskUpdate::new().start_time(Utc::now());
                if task.status == TaskStatus::Normal {
                    update.status(TaskStatus::Recording)
                } else {
                    update
                }
            }
            stage => TaskUpdate::new().status(stage.entry_status()),
        }
    }

    fn watch_lease(&self, lease: &HeldLease) {
        let lost = lease.lost();
        let cancel = self.cancel.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = lost.cancelled() => {
                    let _ = events.send(StageEvent::LeaseLost).await;
                }
            }
        });
    }

    fn start_record_supervision(&mut self, task: &Task) {
        self.listener = Some(ControlListener::spawn(
            self.services.control.clone(),
            self.job_id.clone(),
            self.services.config.control.poll_timeout(),
            self.events_tx.clone(),
            StageEvent::Signal,
            &self.cancel,
        ));

        let limits = &self.services.config.limits;
        let limit_secs = task
            .param
            .max_duration_limit
            .filter(|limit| *limit > 0)
            .unwrap_or(limits.max_record_duration_secs)
            .min(limits.max_record_duration_secs);
        let started_at = task.start_time.unwrap_or_else(Utc::now);
        self.watchdog = Some(DurationWatchdog::spawn(
            self.services.clone(),
            self.job_id.clone(),
            started_at,
            Duration::from_secs(limit_secs),
            self.events_tx.clone(),
            &self.cancel,
        ));
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Wait for the next lifecycle event.
    pub async fn next_event(&mut self) -> Option<StageEvent> {
        self.events_rx.recv().await
    }

    pub async fn task(&self) -> Result<Task> {
        self.services.tasks.get_task(&self.job_id).await
    }

    /// Apply an intermediate update while the stage runs.
    pub async fn update(&self, update: TaskUpdate) -> Result<Task> {
        self.services.tasks.update_task(&self.job_id, update).await
    }

    /// Pass the job to `next`.
    ///
    /// Moves the task to `next`'s status (merged with `extra`), dispatches
    /// the next stage and records its invocation and first heartbeat. Only
    /// then is this invocation's heartbeat removed and the lease released.
    /// Returns the next stage's invocation id.
    ///
    /// If the status was applied but the dispatch could not be recorded,
    /// this invocation's heartbeat is left in place to go stale, so the
    /// sweep re-dispatches the next stage.
    pub async fn hand_off(mut self, next: Stage, extra: TaskUpdate) -> Result<String> {
        let update = extra.status(next.entry_status());
        let (result, status_applied) =
            match self.services.tasks.update_task(&self.job_id, update).await {
                Ok(_) => (
                    dispatch_stage(&self.services, next, &self.job_id, None).await,
                    true,
                ),
                Err(e) => (Err(e), false),
            };

        match &result {
            Ok(next_invocation) => info!(
                job_id = %self.job_id,
                from = %self.stage,
                to = %next,
                next_invocation = %next_invocation,
                "Stage handed off"
            ),
            Err(e) => warn!(
                job_id = %self.job_id,
                from = %self.stage,
                to = %next,
                error = %e,
                "Stage hand-off aborted"
            ),
        }
        let stranded = status_applied && result.is_err();
        if stranded {
            warn!(
                job_id = %self.job_id,
                invocation_id = %self.invocation_id,
                "Keeping heartbeat for recovery of the interrupted hand-off"
            );
        }
        self.teardown_with(!stranded).await;
        result
    }

    /// Pass the job to the next stage in the fixed chain.
    pub async fn complete(self, extra: TaskUpdate) -> Result<String> {
        match self.stage.next() {
            Some(next) => self.hand_off(next, extra).await,
            None => Err(Error::invalid_status(
                "the callback stage has no successor; use complete_callback",
            )),
        }
    }

    /// Report an unrecoverable failure: record `result` and hand the job to
    /// the callback stage so the user is notified.
    pub async fn escalate(self, result: TaskResult) -> Result<String> {
        warn!(
            job_id = %self.job_id,
            stage = %self.stage,
            error_code = ?result.error_code,
            "Escalating job to callback"
        );
        self.hand_off(Stage::Callback, TaskUpdate::new().result(result))
            .await
    }

    /// Finish the job after the callback attempt.
    ///
    /// `outcome` is the delivery result; a failure is recorded as
    /// `CallbackFailed` on top of any existing result.
    pub async fn complete_callback(
        mut self,
        outcome: std::result::Result<(), String>,
    ) -> Result<Task> {
        if self.stage != Stage::Callback {
            let e = Error::invalid_status(format!(
                "complete_callback called from the {} stage",
                self.stage
            ));
            self.teardown().await;
            return Err(e);
        }

        let result = self.finish_update(outcome).await;
        self.teardown().await;
        result
    }

    async fn finish_update(&self, outcome: std::result::Result<(), String>) -> Result<Task> {
        let mut update = TaskUpdate::new()
            .status(TaskStatus::Finished)
            .finish_time(Utc::now());
        if let Err(last_error) = outcome {
            let existing = self.task().await?.result.unwrap_or_default();
            update = update.result(TaskResult {
                error_code: Some(ERROR_CALLBACK_FAILED.to_string()),
                error_message: Some(format!(
                    "Callback failed even after all tries. last error message: {}",
                    last_error
                )),
                artifacts: existing.artifacts,
            });
        }
        let task = self.update(update).await?;
        info!(job_id = %self.job_id, "Job finished");
        Ok(task)
    }

    /// Deliver the task's public view to its callback URL and finish the job.
    /// Jobs without a callback URL finish directly.
    pub async fn deliver_callback(self, sender: &CallbackSender) -> Result<Task> {
        let task = match self.task().await {
            Ok(task) => task,
            Err(e) => {
                self.shutdown("task unreadable").await;
                return Err(e);
            }
        };
        let outcome = match task.param.callback_url.clone() {
            Some(url) => sender.deliver(&url, &TaskView::from(task)).await,
            None => Ok(()),
        };
        self.complete_callback(outcome).await
    }

    /// Stop all background activity, remove this invocation's heartbeat and
    /// release the lease.
    pub async fn shutdown(mut self, reason: &str) {
        info!(
            job_id = %self.job_id,
            stage = %self.stage,
            invocation_id = %self.invocation_id,
            reason,
            "Stage worker shutting down"
        );
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.teardown_with(true).await;
    }

    async fn teardown_with(&mut self, remove_heartbeat: bool) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop().await;
        }
        if let Some(emitter) = self.emitter.take() {
            emitter.stop().await;
        }

        // The heartbeat goes first so the sweep never sees a live lease
        // without a heartbeat for this invocation.
        if remove_heartbeat
            && let Err(e) = self
                .services
                .heartbeats
                .remove(&self.job_id, &self.invocation_id)
                .await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to remove heartbeat");
        }
        if let Some(lease) = self.lease.take()
            && let Err(e) = lease.release().await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to release stage lease");
        }
        debug!(job_id = %self.job_id, stage = %self.stage, "Stage worker torn down");
    }
}

impl Drop for StageWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Dispatch `stage` for `job_id` and make the new invocation authoritative.
///
/// Adds the invocation's first heartbeat, then records the invocation id
/// (and `status`, when given) on the task. A heartbeat whose invocation never
/// made it onto the task is treated as superseded by the sweep. If the
/// platform rejects the invocation a placeholder id is recorded instead, so
/// the job still carries a heartbeat and the sweep will re-dispatch it.
pub(crate) async fn dispatch_stage(
    services: &ServiceContainer,
    stage: Stage,
    job_id: &str,
    status: Option<TaskStatus>,
) -> Result<String> {
    let invocation_id = match services.invoker.invoke(stage, job_id).await {
        Ok(id) => id,
        Err(e) => {
            let placeholder = format!("{}{}", UNDISPATCHED_PREFIX, Uuid::new_v4());
            warn!(
                job_id,
                %stage,
                error = %e,
                placeholder = %placeholder,
                "Stage dispatch failed, leaving it to the sweep"
            );
            placeholder
        }
    };

    let mut update = TaskUpdate::new().invocation(&invocation_id);
    if let Some(status) = status {
        update = update.status(status);
    }
    services.heartbeats.beat(job_id, &invocation_id).await?;
    services.tasks.update_task(job_id, update).await?;
    Ok(invocation_id)
}

/// Whether an invocation id is a placeholder for a failed dispatch.
pub fn is_placeholder_invocation(invocation_id: &str) -> bool {
    invocation_id.starts_with(UNDISPATCHED_PREFIX)
}
