//! pagecast library crate.
//!
//! Coordination of multi-stage page capture jobs across stateless workers:
//! a shared task registry with an enforced status order, lease locks, a
//! heartbeat registry, a control signal channel and the recovery sweep.

pub mod config;
pub mod control;
pub mod diagnose;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod heartbeat;
pub mod invoker;
pub mod lease;
pub mod logging;
pub mod registry;
pub mod services;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
