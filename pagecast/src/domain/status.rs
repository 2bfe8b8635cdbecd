//! Task status state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a capture task.
///
/// Each status has a rank; a task may only move to a status whose rank is
/// greater than or equal to its current rank. `Recording` and `Paused` share a
/// rank so that pause/resume can toggle freely while the record stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, record stage not yet confirmed running.
    #[default]
    Normal,
    Recording,
    Paused,
    /// Recording stopped by the user or the duration limit; transcoding follows.
    Canceled,
    Transcode,
    Upload,
    Callback,
    Finished,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        Self::Normal,
        Self::Recording,
        Self::Paused,
        Self::Canceled,
        Self::Transcode,
        Self::Upload,
        Self::Callback,
        Self::Finished,
    ];

    /// Convert to the persisted string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
            Self::Transcode => "transcode",
            Self::Upload => "upload",
            Self::Callback => "callback",
            Self::Finished => "finished",
        }
    }

    /// Parse from the persisted string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "recording" => Some(Self::Recording),
            "paused" => Some(Self::Paused),
            "canceled" => Some(Self::Canceled),
            "transcode" => Some(Self::Transcode),
            "upload" => Some(Self::Upload),
            "callback" => Some(Self::Callback),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Recording | Self::Paused => 1,
            Self::Canceled => 2,
            Self::Transcode => 3,
            Self::Upload => 4,
            Self::Callback => 5,
            Self::Finished => 6,
        }
    }

    /// Statuses in which the record stage owns the task.
    pub fn is_recording_phase(&self) -> bool {
        matches!(self, Self::Normal | Self::Recording | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        target.rank() >= self.rank()
    }

    /// Attempt to transition to a new status.
    pub fn transition_to(&self, target: TaskStatus) -> Result<TaskStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::IllegalTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("RECORDING"), None);
    }

    #[test]
    fn test_rank_order() {
        assert_eq!(TaskStatus::Normal.rank(), 0);
        assert_eq!(TaskStatus::Recording.rank(), TaskStatus::Paused.rank());
        assert!(TaskStatus::Canceled.rank() < TaskStatus::Transcode.rank());
        assert_eq!(TaskStatus::Finished.rank(), 6);
    }

    #[test]
    fn test_transition_never_decreases_rank() {
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let result = from.transition_to(to);
                if to.rank() < from.rank() {
                    assert!(
                        matches!(result, Err(Error::IllegalTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                } else {
                    assert_eq!(result.unwrap(), to);
                }
            }
        }
    }

    #[test]
    fn test_pause_resume_toggle() {
        assert!(TaskStatus::Recording.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Recording));
    }

    #[test]
    fn test_finished_is_final() {
        assert!(!TaskStatus::Finished.can_transition_to(TaskStatus::Callback));
        assert!(TaskStatus::Finished.can_transition_to(TaskStatus::Finished));
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Transcode).unwrap();
        assert_eq!(json, "\"transcode\"");
        let parsed: TaskStatus = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(parsed, TaskStatus::Canceled);
    }
}
