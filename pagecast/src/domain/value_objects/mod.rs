//! Value objects shared across the coordinator.

mod retry_policy;

pub use retry_policy::RetryPolicy;
