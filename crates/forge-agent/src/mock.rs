//! Mock agent service for unit testing.
//!
//! Records every call and serves snapshots from an in-memory table so
//! router and wait tests run without a daemon.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use forge_core::naming;

use crate::error::AgentServiceError;
use crate::service::AgentService;
use crate::types::{AgentSnapshot, AgentStatus, ControlAction, ListFilter, SpawnParams};

/// A recorded call to the mock service.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Spawn(SpawnParams),
    Kill(String),
    Restart(String),
    SendMessage(String, String),
    SendControl(String, ControlAction),
    ClearContext(String),
    Get(String),
    List(ListFilter),
}

/// Builds a plausible snapshot for seeding tests.
pub fn test_snapshot(id: &str, project: &str, status: AgentStatus) -> AgentSnapshot {
    let mut snapshot = AgentSnapshot::starting(
        id,
        project,
        naming::session_name(project, id),
        format!("/tmp/{project}/.worktrees/{id}"),
        naming::branch_name("agent", id, "task"),
    );
    snapshot.status = status;
    snapshot
}

/// Mock implementation of [`AgentService`].
#[derive(Default)]
pub struct MockAgentService {
    agents: Mutex<HashMap<String, AgentSnapshot>>,
    calls: Mutex<Vec<MockCall>>,
    spawn_error: Mutex<Option<AgentServiceError>>,
    send_error: Mutex<Option<AgentServiceError>>,
}

impl MockAgentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an agent into the table.
    pub fn insert(&self, snapshot: AgentSnapshot) {
        let mut agents = lock(&self.agents);
        agents.insert(snapshot.id.clone(), snapshot);
    }

    /// Make the next (and every subsequent) spawn fail with `err`.
    pub fn fail_spawn(&self, err: AgentServiceError) {
        *lock(&self.spawn_error) = Some(err);
    }

    /// Make every send_message fail with `err`.
    pub fn fail_send(&self, err: AgentServiceError) {
        *lock(&self.send_error) = Some(err);
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Directly mutate a seeded agent (e.g. to script a status change).
    pub fn update<F: FnOnce(&mut AgentSnapshot)>(&self, agent_id: &str, f: F) {
        let mut agents = lock(&self.agents);
        if let Some(agent) = agents.get_mut(agent_id) {
            f(agent);
        }
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl AgentService for MockAgentService {
    async fn spawn(&self, params: SpawnParams) -> Result<AgentSnapshot, AgentServiceError> {
        self.record(MockCall::Spawn(params.clone()));
        if let Some(err) = lock(&self.spawn_error).clone() {
            return Err(err);
        }

        let id = naming::new_agent_id();
        let mut snapshot = test_snapshot(&id, &params.project, AgentStatus::Starting);
        snapshot.task = params.task.clone();
        snapshot.profile = params.profile.clone();
        snapshot.branch_name = naming::branch_name(&params.branch_prefix, &id, &params.task);
        self.insert(snapshot.clone());
        Ok(snapshot)
    }

    async fn kill(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        self.record(MockCall::Kill(agent_id.to_string()));
        let mut agents = lock(&self.agents);
        match agents.remove(agent_id) {
            Some(_) => Ok(()),
            None => Err(AgentServiceError::not_found(agent_id)),
        }
    }

    async fn restart(&self, agent_id: &str) -> Result<AgentSnapshot, AgentServiceError> {
        self.record(MockCall::Restart(agent_id.to_string()));
        let previous = {
            let agents = lock(&self.agents);
            agents
                .get(agent_id)
                .cloned()
                .ok_or_else(|| AgentServiceError::not_found(agent_id))?
        };
        self.kill(agent_id).await?;
        let mut params = SpawnParams::new(previous.project, previous.task);
        params.profile = previous.profile;
        self.spawn(params).await
    }

    async fn send_message(&self, agent_id: &str, text: &str) -> Result<(), AgentServiceError> {
        self.record(MockCall::SendMessage(
            agent_id.to_string(),
            text.to_string(),
        ));
        if let Some(err) = lock(&self.send_error).clone() {
            return Err(err);
        }
        let mut agents = lock(&self.agents);
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
        if agent.status.is_terminal() {
            return Err(AgentServiceError::terminated(agent_id));
        }
        agent.last_user_message = text.to_string();
        agent.last_activity_at = Utc::now();
        Ok(())
    }

    async fn send_control(
        &self,
        agent_id: &str,
        action: ControlAction,
    ) -> Result<(), AgentServiceError> {
        self.record(MockCall::SendControl(agent_id.to_string(), action));
        let agents = lock(&self.agents);
        match agents.get(agent_id) {
            Some(agent) if agent.status.is_terminal() => {
                Err(AgentServiceError::terminated(agent_id))
            }
            Some(_) => Ok(()),
            None => Err(AgentServiceError::not_found(agent_id)),
        }
    }

    async fn clear_context(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        self.record(MockCall::ClearContext(agent_id.to_string()));
        let agents = lock(&self.agents);
        match agents.get(agent_id) {
            Some(_) => Ok(()),
            None => Err(AgentServiceError::not_found(agent_id)),
        }
    }

    async fn get(&self, agent_id: &str) -> Result<AgentSnapshot, AgentServiceError> {
        self.record(MockCall::Get(agent_id.to_string()));
        let agents = lock(&self.agents);
        agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentServiceError::not_found(agent_id))
    }

    async fn list(&self, filter: ListFilter) -> Vec<AgentSnapshot> {
        self.record(MockCall::List(filter.clone()));
        let agents = lock(&self.agents);
        let mut result: Vec<AgentSnapshot> = agents
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }
}
