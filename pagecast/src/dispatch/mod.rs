//! User-facing job control: start, stop, pause, resume, refresh, describe,
//! list and force-stop.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchLimits;
use crate::domain::{ControlSignal, Stage, Task, TaskParam, TaskStatus, TaskUpdate, TaskView};
use crate::registry::{ListScope, TaskFilter};
use crate::services::ServiceContainer;
use crate::{Error, Result};

/// Video muxers accepted in `Output.Video.Muxer`.
const ALLOWED_MUXERS: [&str; 2] = ["mp4", "hls"];

/// Listing request.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub scope: ListScope,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Entry point for job control requests.
#[derive(Clone)]
pub struct Dispatcher {
    services: ServiceContainer,
}

impl Dispatcher {
    pub fn new(services: ServiceContainer) -> Self {
        Self { services }
    }

    /// Create a job and dispatch its record stage. Returns the job id.
    ///
    /// If the record stage cannot be dispatched the task record is removed
    /// again and the error returned.
    pub async fn start(&self, param: TaskParam, job_id: Option<String>) -> Result<String> {
        validate_param(&param, &self.services.config.limits)?;
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        self.services.tasks.create_task(&job_id, param).await?;
        info!(job_id, "Task created");

        let invocation_id = match self.services.invoker.invoke(Stage::Record, &job_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id, error = %e, "Failed to dispatch record stage");
                self.discard(&job_id).await;
                return Err(e);
            }
        };

        let update = TaskUpdate::new()
            .invocation(&invocation_id)
            .status(TaskStatus::Recording);
        if let Err(e) = self.services.tasks.update_task(&job_id, update).await {
            self.discard(&job_id).await;
            return Err(e);
        }

        if let Err(e) = self.services.heartbeats.beat(&job_id, &invocation_id).await {
            warn!(job_id, invocation_id, error = %e, "Failed to add first record heartbeat");
        }

        info!(job_id, invocation_id, "Record stage dispatched");
        Ok(job_id)
    }

    async fn discard(&self, job_id: &str) {
        if let Err(e) = self.services.tasks.delete_task(job_id).await {
            warn!(job_id, error = %e, "Failed to remove task after dispatch failure");
        }
    }

    /// Stop a recording. A task past the recording phase is left alone.
    pub async fn stop(&self, job_id: &str) -> Result<()> {
        let task = self.services.tasks.get_task(job_id).await?;
        if !task.status.is_recording_phase() {
            info!(job_id, status = %task.status, "No need to stop task");
            return Ok(());
        }

        let update = TaskUpdate::new()
            .status(TaskStatus::Canceled)
            .cancel_time(Utc::now());
        match self.services.tasks.update_task(job_id, update).await {
            Ok(_) => {}
            // The task moved on between the read and the update.
            Err(Error::IllegalTransition { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.services.control.send(job_id, ControlSignal::Stop).await
    }

    pub async fn pause(&self, job_id: &str) -> Result<()> {
        let task = self.services.tasks.get_task(job_id).await?;
        if !task.status.is_recording_phase() {
            return Err(Error::invalid_status(format!(
                "can't pause a task in status {}",
                task.status
            )));
        }
        if task.status == TaskStatus::Paused {
            return Ok(());
        }

        self.update_or_invalid(job_id, TaskUpdate::new().status(TaskStatus::Paused))
            .await?;
        self.services.control.send(job_id, ControlSignal::Pause).await
    }

    pub async fn resume(&self, job_id: &str) -> Result<()> {
        let task = self.services.tasks.get_task(job_id).await?;
        if !matches!(task.status, TaskStatus::Recording | TaskStatus::Paused) {
            return Err(Error::invalid_status(format!(
                "can't resume a task in status {}",
                task.status
            )));
        }

        self.update_or_invalid(job_id, TaskUpdate::new().status(TaskStatus::Recording))
            .await?;
        self.services.control.send(job_id, ControlSignal::Resume).await
    }

    /// Ask the recorder to reload the page. Ignored outside recording.
    pub async fn refresh(&self, job_id: &str) -> Result<()> {
        let task = self.services.tasks.get_task(job_id).await?;
        if !matches!(task.status, TaskStatus::Recording | TaskStatus::Paused) {
            info!(job_id, status = %task.status, "Ignoring refresh");
            return Ok(());
        }
        self.services.control.send(job_id, ControlSignal::Refresh).await
    }

    async fn update_or_invalid(&self, job_id: &str, update: TaskUpdate) -> Result<Task> {
        match self.services.tasks.update_task(job_id, update).await {
            Err(Error::IllegalTransition { from, to }) => Err(Error::invalid_status(format!(
                "task moved to {} before it could become {}",
                from, to
            ))),
            other => other,
        }
    }

    /// Public view of a task.
    pub async fn describe(&self, job_id: &str) -> Result<TaskView> {
        Ok(self.services.tasks.get_task(job_id).await?.into())
    }

    /// Full task record, including parameters and the current invocation.
    pub async fn describe_detail(&self, job_id: &str) -> Result<Task> {
        self.services.tasks.get_task(job_id).await
    }

    pub async fn list(&self, request: &ListRequest) -> Result<Vec<TaskView>> {
        let filter = TaskFilter {
            scope: request.scope,
            created_after: request.created_after,
            created_before: request.created_before,
        };
        let tasks = self.services.tasks.list_tasks(&filter).await?;
        Ok(tasks.into_iter().map(TaskView::from).collect())
    }

    /// Cancel a task regardless of its state and terminate its record
    /// invocation after a grace period.
    pub async fn force_stop(&self, job_id: &str) -> Result<()> {
        let task = self.services.tasks.get_task(job_id).await?;

        let update = TaskUpdate::new()
            .status(TaskStatus::Canceled)
            .cancel_time(task.cancel_time.unwrap_or_else(Utc::now));
        match self.services.tasks.update_task(job_id, update).await {
            Ok(_) => {}
            Err(Error::IllegalTransition { from, .. }) => {
                info!(job_id, status = %from, "Task already past recording, force stop skips status change");
            }
            Err(e) => return Err(e),
        }
        self.services.control.send(job_id, ControlSignal::Stop).await?;

        let grace = Duration::from_millis(self.services.config.limits.force_stop_grace_ms);
        tokio::time::sleep(grace).await;

        if let Some(invocation_id) = task.invoked_request_id.as_deref()
            && task.status.is_recording_phase()
            && let Err(e) = self
                .services
                .invoker
                .terminate(Stage::Record, invocation_id)
                .await
        {
            warn!(job_id, invocation_id, error = %e, "Failed to terminate record invocation");
        }
        info!(job_id, "Task force stopped");
        Ok(())
    }
}

/// Check user-supplied capture parameters against the configured limits.
pub fn validate_param(param: &TaskParam, limits: &DispatchLimits) -> Result<()> {
    if param.record_url.trim().is_empty() {
        return Err(Error::validation("RecordURL is missing"));
    }
    if param.width.is_some_and(|width| width > limits.max_width) {
        return Err(Error::validation(format!(
            "Width must in range [1, {}]",
            limits.max_width
        )));
    }
    if param.height.is_some_and(|height| height > limits.max_height) {
        return Err(Error::validation(format!(
            "Height must in range [1, {}]",
            limits.max_height
        )));
    }
    if param
        .max_duration_limit
        .is_some_and(|limit| limit > limits.max_record_duration_secs)
    {
        return Err(Error::validation(format!(
            "MaxDurationLimit must in range [0, {}]",
            limits.max_record_duration_secs
        )));
    }

    if let Some(video) = param.output.as_ref().and_then(|output| output.get("Video")) {
        let muxer = video
            .get("Muxer")
            .and_then(|muxer| muxer.as_str())
            .ok_or_else(|| Error::validation("Muxer must set in OutputVideo"))?;
        if !ALLOWED_MUXERS.contains(&muxer) {
            return Err(Error::validation(format!(
                "OutputVideoFormat must be one of {:?}",
                ALLOWED_MUXERS
            )));
        }
        if muxer == "hls" && video.get("EncryptKey").is_some() && video.get("AuthUrl").is_none() {
            return Err(Error::validation("The AuthUrl must be set with EncryptKey"));
        }
    }
    Ok(())
}
