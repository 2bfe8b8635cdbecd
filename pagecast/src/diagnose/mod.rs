//! Recovery sweep over stale heartbeats.
//!
//! The sweep is the only component that decides a worker is dead. It runs
//! under the `diagnoselock:0` lease so at most one sweep is active, walks the
//! heartbeat entries older than the staleness window and, per job, either
//! cleans up, restarts the stage that owns the job's status, escalates the
//! job to the callback stage or abandons it.
//!
//! Every corrective update is guarded by the stale entry's invocation id, so
//! running the sweep twice over the same entry restarts the job at most once.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, instrument, warn};

use crate::domain::{
    ERROR_INTERNAL, Stage, Task, TaskResult, TaskStatus, TaskUpdate, keys, restart_status,
};
use crate::heartbeat::now_ms;
use crate::services::ServiceContainer;
use crate::worker::is_placeholder_invocation;
use crate::{Error, Result};

/// Error message recorded on jobs that ran out of retries.
const MAX_RETRIES_MESSAGE: &str = "exceeded max retries";

/// Outcome counters of one sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep held the lock; nothing was examined.
    pub skipped: bool,
    /// Stale entries examined.
    pub examined: usize,
    /// Jobs whose owning stage was re-dispatched.
    pub restarted: usize,
    /// Jobs moved to the callback stage after exhausting retries.
    pub escalated: usize,
    /// Jobs finished with an error after exhausting callback retries.
    pub abandoned: usize,
    /// Stale entries of invocations that were no longer authoritative.
    pub superseded: usize,
    /// Entries dropped because they were malformed, orphaned or finished.
    pub cleaned: usize,
    /// Entries left for the next run after an error.
    pub failed: usize,
    /// The run stopped before visiting every stale entry.
    pub truncated: bool,
}

/// What happened to a single stale entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Cleaned,
    Superseded,
    Restarted,
    Escalated,
    Abandoned,
}

/// The recovery sweep.
#[derive(Clone)]
pub struct DiagnoseSweep {
    services: ServiceContainer,
}

impl DiagnoseSweep {
    pub fn new(services: ServiceContainer) -> Self {
        Self { services }
    }

    /// Run one sweep, spending at most `budget` minus the configured safety
    /// margin on recovery before leaving the remaining entries to the next
    /// run.
    pub async fn run(&self, budget: Duration) -> Result<SweepReport> {
        let started = Instant::now();
        let config = &self.services.config;
        let mut report = SweepReport::default();

        let lease = match self
            .services
            .locks
            .acquire_held(
                keys::DIAGNOSE_LOCK,
                config.lease.stage_ttl(),
                0,
                Duration::ZERO,
                config.lease.renew_check_interval(),
            )
            .await
        {
            Ok(lease) => lease,
            Err(Error::LockFailed { .. }) => {
                info!("Another diagnose sweep is running, skipping");
                report.skipped = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let deadline = budget.saturating_sub(config.diagnose.safety_margin());
        let stale = match self.services.heartbeats.stale_members(now_ms()).await {
            Ok(stale) => stale,
            Err(e) => {
                lease.release().await.ok();
                return Err(e);
            }
        };
        debug!(count = stale.len(), "Stale heartbeat entries found");

        for (index, member) in stale.iter().enumerate() {
            if started.elapsed() >= deadline || lease.is_lost() {
                warn!(
                    remaining = stale.len() - index,
                    lease_lost = lease.is_lost(),
                    "Diagnose sweep out of time, leaving the rest for the next run"
                );
                report.truncated = true;
                break;
            }
            if index > 0 {
                self.jitter().await;
            }

            report.examined += 1;
            match self.recover(member).await {
                Ok(Recovery::Cleaned) => report.cleaned += 1,
                Ok(Recovery::Superseded) => report.superseded += 1,
                Ok(Recovery::Restarted) => report.restarted += 1,
                Ok(Recovery::Escalated) => report.escalated += 1,
                Ok(Recovery::Abandoned) => report.abandoned += 1,
                Err(e) => {
                    warn!(member = %member, error = %e, "Failed to recover stale entry");
                    report.failed += 1;
                }
            }
        }

        if let Err(e) = lease.release().await {
            warn!(error = %e, "Failed to release diagnose lock");
        }
        info!(
            examined = report.examined,
            restarted = report.restarted,
            escalated = report.escalated,
            abandoned = report.abandoned,
            superseded = report.superseded,
            cleaned = report.cleaned,
            failed = report.failed,
            truncated = report.truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Diagnose sweep finished"
        );
        Ok(report)
    }

    /// Run a sweep every `interval` until `cancel` fires.
    pub async fn run_forever(
        &self,
        interval: Duration,
        budget: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Diagnose scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run(budget).await {
                warn!(error = %e, "Diagnose sweep failed");
            }
        }
    }

    async fn jitter(&self) {
        let max = self.services.config.diagnose.jitter_max_ms;
        if max > 0 {
            let jitter = rand::random::<u64>() % (max + 1);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    #[instrument(skip(self), fields(job_id = field::Empty, invocation_id = field::Empty))]
    async fn recover(&self, member: &str) -> Result<Recovery> {
        let Some((job_id, stale_invocation)) = keys::parse_heartbeat_member(member) else {
            warn!("Removing malformed heartbeat entry");
            self.services.heartbeats.remove_member(member).await?;
            return Ok(Recovery::Cleaned);
        };
        tracing::Span::current()
            .record("job_id", job_id)
            .record("invocation_id", stale_invocation);

        let task = match self.services.tasks.find_task(job_id).await? {
            Some(task) if task.status != TaskStatus::Finished => task,
            Some(_) => {
                debug!("Job already finished, dropping heartbeat");
                self.services.heartbeats.remove_member(member).await?;
                return Ok(Recovery::Cleaned);
            }
            None => {
                info!("Dropping heartbeat of unknown job");
                self.services.heartbeats.remove_member(member).await?;
                return Ok(Recovery::Cleaned);
            }
        };

        let stage = Stage::owning(task.status).unwrap_or(Stage::Callback);
        if task.invoked_request_id.as_deref() != Some(stale_invocation) {
            info!(
                current = ?task.invoked_request_id,
                "Stale invocation was superseded, terminating it"
            );
            self.terminate_quietly(stage, stale_invocation).await;
            self.services.heartbeats.remove_member(member).await?;
            return Ok(Recovery::Superseded);
        }

        let diagnose = &self.services.config.diagnose;
        if task.retry_num >= diagnose.max_retry_num + diagnose.callback_grace_retries {
            self.abandon(&task, member, stale_invocation, stage).await
        } else if task.retry_num >= diagnose.max_retry_num {
            self.escalate(&task, member, stale_invocation, stage).await
        } else {
            self.restart(&task, member, stale_invocation, stage).await
        }
    }

    /// Re-dispatch the stage owning the task's status.
    async fn restart(
        &self,
        task: &Task,
        member: &str,
        stale_invocation: &str,
        stage: Stage,
    ) -> Result<Recovery> {
        let update = TaskUpdate::new().status(restart_status(task.status));
        self.redispatch(task, member, stale_invocation, stage, stage, update)
            .await?;
        info!(
            %stage,
            status = %task.status,
            retry_num = task.retry_num + 1,
            "Job restarted"
        );
        Ok(Recovery::Restarted)
    }

    /// Move a job that ran out of retries to the callback stage with an
    /// error result.
    async fn escalate(
        &self,
        task: &Task,
        member: &str,
        stale_invocation: &str,
        stage: Stage,
    ) -> Result<Recovery> {
        let update = TaskUpdate::new()
            .status(TaskStatus::Callback)
            .result(TaskResult::error(ERROR_INTERNAL, MAX_RETRIES_MESSAGE));
        self.redispatch(
            task,
            member,
            stale_invocation,
            stage,
            Stage::Callback,
            update,
        )
        .await?;
        let reason = Error::MaxRetriesExceeded {
            job_id: task.task_id.clone(),
            retry_num: task.retry_num,
        };
        warn!(from = %task.status, error = %reason, "Job escalated to callback");
        Ok(Recovery::Escalated)
    }

    /// Finish a job whose callback stage kept dying as well.
    async fn abandon(
        &self,
        task: &Task,
        member: &str,
        stale_invocation: &str,
        stage: Stage,
    ) -> Result<Recovery> {
        let update = TaskUpdate::new()
            .expect_invocation(stale_invocation)
            .status(TaskStatus::Finished)
            .finish_time(chrono::Utc::now())
            .result(TaskResult::error(ERROR_INTERNAL, MAX_RETRIES_MESSAGE));
        match self.services.tasks.update_task(&task.task_id, update).await {
            Ok(_) => {}
            Err(e @ (Error::Superseded { .. } | Error::IllegalTransition { .. })) => {
                info!(error = %e, "Job changed during abandon, leaving it");
                return Ok(Recovery::Superseded);
            }
            Err(e) => return Err(e),
        }

        self.terminate_quietly(stage, stale_invocation).await;
        self.services.heartbeats.remove_member(member).await?;
        warn!(retry_num = task.retry_num, "Job abandoned after exhausting retries");
        Ok(Recovery::Abandoned)
    }

    /// Terminate the stale invocation, dispatch `next` and make the new
    /// invocation authoritative with a guarded update. The stale entry is
    /// replaced by the new invocation's heartbeat.
    async fn redispatch(
        &self,
        task: &Task,
        member: &str,
        stale_invocation: &str,
        stale_stage: Stage,
        next: Stage,
        update: TaskUpdate,
    ) -> Result<()> {
        self.terminate_quietly(stale_stage, stale_invocation).await;

        let invocation_id = self.services.invoker.invoke(next, &task.task_id).await?;

        let update = update
            .expect_invocation(stale_invocation)
            .invocation(&invocation_id)
            .increment_retry();
        if let Err(e) = self.services.tasks.update_task(&task.task_id, update).await {
            if matches!(e, Error::Superseded { .. } | Error::IllegalTransition { .. }) {
                info!(error = %e, "Job changed during recovery, dropping new invocation");
            }
            self.terminate_quietly(next, &invocation_id).await;
            return Err(e);
        }

        self.services.heartbeats.remove_member(member).await?;
        self.services
            .heartbeats
            .beat(&task.task_id, &invocation_id)
            .await?;
        Ok(())
    }

    async fn terminate_quietly(&self, stage: Stage, invocation_id: &str) {
        if is_placeholder_invocation(invocation_id) {
            return;
        }
        if let Err(e) = self.services.invoker.terminate(stage, invocation_id).await {
            debug!(%stage, invocation_id, error = %e, "Terminating invocation failed");
        }
    }
}
