//! Processing stages and their relationship to task status.

use serde::{Deserialize, Serialize};

use super::TaskStatus;

/// A named stage of the capture pipeline. Each stage runs as an independently
/// invoked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Record,
    Transcode,
    Upload,
    Callback,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Transcode => "transcode",
            Self::Upload => "upload",
            Self::Callback => "callback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "record" => Some(Self::Record),
            "transcode" => Some(Self::Transcode),
            "upload" => Some(Self::Upload),
            "callback" => Some(Self::Callback),
            _ => None,
        }
    }

    /// The stage responsible for a task in the given status, or `None` once
    /// the task is finished.
    pub fn owning(status: TaskStatus) -> Option<Stage> {
        match status {
            TaskStatus::Normal | TaskStatus::Recording | TaskStatus::Paused => Some(Self::Record),
            TaskStatus::Canceled | TaskStatus::Transcode => Some(Self::Transcode),
            TaskStatus::Upload => Some(Self::Upload),
            TaskStatus::Callback => Some(Self::Callback),
            TaskStatus::Finished => None,
        }
    }

    /// Status written when this stage takes ownership through a normal hand-off.
    pub fn entry_status(&self) -> TaskStatus {
        match self {
            Self::Record => TaskStatus::Recording,
            Self::Transcode => TaskStatus::Transcode,
            Self::Upload => TaskStatus::Upload,
            Self::Callback => TaskStatus::Callback,
        }
    }

    /// The stage that follows this one on success.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Record => Some(Self::Transcode),
            Self::Transcode => Some(Self::Upload),
            Self::Upload => Some(Self::Callback),
            Self::Callback => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status to write when the sweep restarts the owning stage of a task.
///
/// A task that never confirmed recording resumes as `recording`; a canceled
/// recording resumes as `transcode`. Everything else keeps its status.
pub fn restart_status(current: TaskStatus) -> TaskStatus {
    match current {
        TaskStatus::Normal => TaskStatus::Recording,
        TaskStatus::Canceled => TaskStatus::Transcode,
        other => other,
    }
}
