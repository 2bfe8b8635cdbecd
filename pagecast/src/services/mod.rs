//! Service wiring.

mod container;

pub use container::ServiceContainer;
