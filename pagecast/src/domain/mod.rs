//! Domain model: task records, statuses, stages and control signals.

pub mod keys;
pub mod signal;
pub mod stage;
pub mod status;
pub mod task;
pub mod value_objects;

pub use signal::ControlSignal;
pub use stage::{Stage, restart_status};
pub use status::TaskStatus;
pub use task::{
    ERROR_CALLBACK_FAILED, ERROR_INTERNAL, Task, TaskParam, TaskResult, TaskUpdate, TaskView,
};
pub use value_objects::RetryPolicy;
