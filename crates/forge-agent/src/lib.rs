//! Agent domain model and the lifecycle service seam.
//!
//! The [`service::AgentService`] trait is the only way other subsystems
//! reach agents: the daemon's manager implements it, the connector router
//! consumes it, and [`mock::MockAgentService`] stands in for tests.

pub mod error;
pub mod mock;
pub mod service;
pub mod types;
pub mod wait;

pub use error::AgentServiceError;
pub use service::AgentService;
pub use types::{
    AgentLocation, AgentSnapshot, AgentStatus, ControlAction, HookEvent, ListFilter, SpawnParams,
};
