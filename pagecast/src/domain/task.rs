//! Task record and partial updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TaskStatus;
use crate::{Error, Result};

/// Error code for failures the core itself decides on.
pub const ERROR_INTERNAL: &str = "InternalErr";
/// Error code for exhausted callback delivery.
pub const ERROR_CALLBACK_FAILED: &str = "CallbackFailed";

/// Capture configuration supplied at job creation. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TaskParam {
    #[serde(rename = "RecordURL")]
    pub record_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Maximum recording duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_limit: Option<u64>,
    #[serde(rename = "CallbackURL", default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub manual_start: bool,
    /// Output target, opaque to the coordinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl TaskParam {
    pub fn new(record_url: impl Into<String>) -> Self {
        Self {
            record_url: record_url.into(),
            ..Default::default()
        }
    }
}

/// Terminal payload of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl TaskResult {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            artifacts: Vec::new(),
        }
    }

    pub fn success(artifacts: Vec<String>) -> Self {
        Self {
            artifacts,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Persisted task record, stored as JSON under `tasks:<jobID>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    #[serde(rename = "TaskID")]
    pub task_id: String,
    pub status: TaskStatus,
    pub param: TaskParam,
    #[serde(rename = "InvokedRequestID", default, skip_serializing_if = "Option::is_none")]
    pub invoked_request_id: Option<String>,
    #[serde(default)]
    pub retry_num: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub create_time: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub cancel_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, param: TaskParam, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Normal,
            param,
            invoked_request_id: None,
            retry_num: 0,
            create_time: now,
            start_time: None,
            stop_time: None,
            cancel_time: None,
            finish_time: None,
            result: None,
        }
    }

    /// Merge a partial update into this record.
    ///
    /// The status rank is checked before any field is touched, so a rejected
    /// update leaves the record unchanged.
    pub fn apply(&mut self, update: &TaskUpdate) -> Result<()> {
        if let Some(expected) = update.expect_invocation.as_deref()
            && self.invoked_request_id.as_deref() != Some(expected)
        {
            return Err(Error::Superseded {
                job_id: self.task_id.clone(),
                expected: expected.to_string(),
                actual: self.invoked_request_id.clone().unwrap_or_default(),
            });
        }

        if let Some(status) = update.status {
            self.status = self.status.transition_to(status)?;
        }
        if let Some(invocation_id) = &update.invoked_request_id {
            self.invoked_request_id = Some(invocation_id.clone());
        }
        if update.increment_retry {
            self.retry_num = self.retry_num.saturating_add(1);
        }

        set_once(&self.task_id, "StartTime", &mut self.start_time, update.start_time);
        set_once(&self.task_id, "StopTime", &mut self.stop_time, update.stop_time);
        set_once(&self.task_id, "CancelTime", &mut self.cancel_time, update.cancel_time);
        set_once(&self.task_id, "FinishTime", &mut self.finish_time, update.finish_time);

        if let Some(result) = &update.result {
            self.result = Some(result.clone());
        }
        Ok(())
    }
}

fn set_once(
    job_id: &str,
    field: &'static str,
    slot: &mut Option<DateTime<Utc>>,
    value: Option<DateTime<Utc>>,
) {
    match (slot.as_ref(), value) {
        (None, Some(value)) => *slot = Some(value),
        (Some(existing), Some(value)) if *existing != value => {
            debug!(job_id, field, "Timestamp already set, ignoring new value");
        }
        _ => {}
    }
}

/// Partial update of a task record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub invoked_request_id: Option<String>,
    pub increment_retry: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub cancel_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    /// Reject the update with `Superseded` unless the stored
    /// `InvokedRequestID` equals this value.
    pub expect_invocation: Option<String>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn invocation(mut self, invocation_id: impl Into<String>) -> Self {
        self.invoked_request_id = Some(invocation_id.into());
        self
    }

    pub fn increment_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn stop_time(mut self, at: DateTime<Utc>) -> Self {
        self.stop_time = Some(at);
        self
    }

    pub fn cancel_time(mut self, at: DateTime<Utc>) -> Self {
        self.cancel_time = Some(at);
        self
    }

    pub fn finish_time(mut self, at: DateTime<Utc>) -> Self {
        self.finish_time = Some(at);
        self
    }

    pub fn result(mut self, result: TaskResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn expect_invocation(mut self, invocation_id: impl Into<String>) -> Self {
        self.expect_invocation = Some(invocation_id.into());
        self
    }
}

/// Public view of a task, without the capture parameters or the
/// authoritative invocation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskView {
    #[serde(rename = "TaskID")]
    pub task_id: String,
    pub status: TaskStatus,
    pub retry_num: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub create_time: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub cancel_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            status: task.status,
            retry_num: task.retry_num,
            create_time: task.create_time,
            start_time: task.start_time,
            stop_time: task.stop_time,
            cancel_time: task.cancel_time,
            finish_time: task.finish_time,
            result: task.result,
        }
    }
}
