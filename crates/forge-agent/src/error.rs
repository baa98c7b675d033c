//! Normalized error types for agent service operations.
//!
//! Transport-agnostic errors shared by the daemon's manager, the connector
//! router, and any future remote front end.

use std::fmt;

/// Normalized error for agent service operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentServiceError {
    /// Agent not found by id.
    NotFound { agent_id: String },

    /// The agent exists but has stopped; input can no longer reach it.
    Terminated { agent_id: String },

    /// The project's live-agent cap would be exceeded.
    CapExceeded {
        project: String,
        running: usize,
        limit: usize,
    },

    /// The named project is not configured.
    UnknownProject { project: String },

    /// The named profile is not configured.
    UnknownProfile { profile: String },

    /// Workspace or branch setup failed; the agent was not created.
    Provision { message: String },

    /// The terminal multiplexer refused or lost the session.
    Session { message: String },

    /// Request validation failed.
    InvalidArgument { message: String },

    /// A wait operation timed out before the target status was reached.
    WaitTimeout {
        agent_id: String,
        target: String,
        last_observed: String,
    },

    /// A wait operation was cancelled.
    Cancelled { agent_id: String },

    /// Unexpected internal failure.
    Internal { message: String },
}

impl fmt::Display for AgentServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { agent_id } => write!(f, "agent {agent_id:?} not found"),
            Self::Terminated { agent_id } => write!(f, "agent {agent_id:?} is stopped"),
            Self::CapExceeded {
                project,
                running,
                limit,
            } => write!(
                f,
                "agent limit reached for {project:?}: {running}/{limit}"
            ),
            Self::UnknownProject { project } => write!(f, "project {project:?} not found"),
            Self::UnknownProfile { profile } => write!(f, "profile {profile:?} not found"),
            Self::Provision { message } => write!(f, "workspace provisioning failed: {message}"),
            Self::Session { message } => write!(f, "terminal session error: {message}"),
            Self::InvalidArgument { message } => write!(f, "invalid argument: {message}"),
            Self::WaitTimeout {
                agent_id,
                target,
                last_observed,
            } => write!(
                f,
                "timed out waiting for agent {agent_id:?} to reach {target} (last observed: {last_observed})"
            ),
            Self::Cancelled { agent_id } => {
                write!(f, "wait for agent {agent_id:?} was cancelled")
            }
            Self::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for AgentServiceError {}

impl AgentServiceError {
    pub fn not_found(agent_id: impl Into<String>) -> Self {
        Self::NotFound {
            agent_id: agent_id.into(),
        }
    }

    pub fn terminated(agent_id: impl Into<String>) -> Self {
        Self::Terminated {
            agent_id: agent_id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
