//! Bounded-concurrency task runner with in-order result delivery.
//!
//! [`OrderedRunner`] runs up to `C` tasks at a time but hands results to the
//! completion callback strictly in submission order. It can be paused and
//! resumed cooperatively, and [`BacklogThrottle`] drives that pause from a
//! consumer's backlog so a fast producer cannot run arbitrarily far ahead of
//! a sequential consumer.

mod runner;
mod throttle;

pub use runner::{OrderedRunner, PauseHandle};
pub use throttle::{BacklogThrottle, FlowControl, ThrottleConfig, ThrottleEvent};

use thiserror::Error;

/// Errors returned by [`OrderedRunner::run`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("run cancelled after delivering {delivered} of {total} results")]
    Cancelled { delivered: usize, total: usize },

    #[error("run ended after delivering {delivered} of {total} results")]
    Incomplete { delivered: usize, total: usize },
}
