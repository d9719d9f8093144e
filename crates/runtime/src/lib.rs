//! Runtime assembly: the service container and the orchestrator that wires
//! config → components → workflow engine.

pub mod container;
pub mod orchestrator;

pub use container::{ServiceContainer, ServiceSpec};
pub use orchestrator::Orchestrator;
