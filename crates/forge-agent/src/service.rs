//! Agent service trait: the primary abstraction for agent lifecycle
//! operations.
//!
//! The daemon's manager implements it; the connector router and the
//! external dispatch layer consume it; tests use the mock.

use async_trait::async_trait;

use crate::error::AgentServiceError;
use crate::types::{AgentSnapshot, ControlAction, ListFilter, SpawnParams};

/// The agent lifecycle interface.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Spawn a new agent. Returns the initial snapshot.
    async fn spawn(&self, params: SpawnParams) -> Result<AgentSnapshot, AgentServiceError>;

    /// Kill an agent: end its session, remove its workspace, mark it
    /// stopped. Killing an unknown id returns `NotFound`.
    async fn kill(&self, agent_id: &str) -> Result<(), AgentServiceError>;

    /// Kill then respawn with the same project, task, and profile.
    /// The replacement gets a fresh id.
    async fn restart(&self, agent_id: &str) -> Result<AgentSnapshot, AgentServiceError>;

    /// Send a text message to the agent's terminal, submitting it.
    async fn send_message(&self, agent_id: &str, text: &str) -> Result<(), AgentServiceError>;

    /// Translate a control action into key sequences and inject them.
    async fn send_control(
        &self,
        agent_id: &str,
        action: ControlAction,
    ) -> Result<(), AgentServiceError>;

    /// Reset the agent's conversation context. Only sensible on idle agents.
    async fn clear_context(&self, agent_id: &str) -> Result<(), AgentServiceError>;

    /// Snapshot of a single agent.
    async fn get(&self, agent_id: &str) -> Result<AgentSnapshot, AgentServiceError>;

    /// Snapshots of all agents matching the filter.
    async fn list(&self, filter: ListFilter) -> Vec<AgentSnapshot>;
}
