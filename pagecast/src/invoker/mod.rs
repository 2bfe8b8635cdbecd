//! Dispatch of stage workers on the compute platform.

mod callback;
mod http;

pub use callback::{CallbackConfig, CallbackSender};
pub use http::{HttpStageInvoker, InvokerConfig};

use async_trait::async_trait;

use crate::Result;
use crate::domain::Stage;

/// Starts and terminates stage invocations.
///
/// `invoke` returns the invocation id the platform assigned; the coordinator
/// records it as the task's authoritative invocation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, stage: Stage, job_id: &str) -> Result<String>;

    async fn terminate(&self, stage: Stage, invocation_id: &str) -> Result<()>;
}
