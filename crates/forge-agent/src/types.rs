//! Transport-agnostic agent types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discrete agent status inferred from terminal output or set by the
/// lifecycle manager. `Stopped` is the only terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Working,
    WaitingInput,
    Idle,
    Error,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Working => "working",
            Self::WaitingInput => "waiting_input",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(Self::Starting),
            "working" => Some(Self::Working),
            "waiting_input" => Some(Self::WaitingInput),
            "idle" => Some(Self::Idle),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }

    /// Statuses that flag the agent card for user attention.
    pub fn needs_attention(self) -> bool {
        matches!(self, Self::WaitingInput | Self::Error)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the agent process runs. Only `Local` is produced by this kernel;
/// the variant survives in snapshots for forward compatibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLocation {
    #[default]
    Local,
    Remote,
}

impl AgentLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// Immutable image of an agent's fields, returned to callers and persisted
/// as the snapshot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub project: String,
    pub session_name: String,
    pub workspace_path: String,
    pub branch_name: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub task: String,
    pub profile: String,
    pub sub_agent_count: u32,
    pub needs_attention: bool,
    pub parked: bool,
    /// Bounded copy of the most recent pane capture. Not persisted.
    pub last_output: String,
    pub last_response: String,
    pub last_user_message: String,
    pub location: AgentLocation,
}

impl AgentSnapshot {
    /// Minimal snapshot for a freshly spawned agent.
    pub fn starting(
        id: impl Into<String>,
        project: impl Into<String>,
        session_name: impl Into<String>,
        workspace_path: impl Into<String>,
        branch_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project: project.into(),
            session_name: session_name.into(),
            workspace_path: workspace_path.into(),
            branch_name: branch_name.into(),
            status: AgentStatus::Starting,
            created_at: now,
            last_activity_at: now,
            task: String::new(),
            profile: String::new(),
            sub_agent_count: 0,
            needs_attention: false,
            parked: false,
            last_output: String::new(),
            last_response: String::new(),
            last_user_message: String::new(),
            location: AgentLocation::Local,
        }
    }
}

/// Parameters for spawning a new agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnParams {
    pub project: String,
    pub task: String,
    pub branch_prefix: String,
    pub profile: String,
}

impl SpawnParams {
    pub fn new(project: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            task: task.into(),
            branch_prefix: "agent".to_string(),
            profile: String::new(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }
}

/// Filter for `list` queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub project: Option<String>,
    pub statuses: Vec<AgentStatus>,
}

impl ListFilter {
    pub fn project(name: impl Into<String>) -> Self {
        Self {
            project: Some(name.into()),
            statuses: Vec::new(),
        }
    }

    pub fn matches(&self, agent: &AgentSnapshot) -> bool {
        if let Some(ref project) = self.project {
            if &agent.project != project {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&agent.status)
    }
}

/// Control actions accepted by `send_control`. Closed set; the key
/// sequences they translate to come from the configurable keymap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Approve,
    AlwaysAllow,
    Reject,
    Interrupt,
    Restart,
    Up,
    Down,
    Left,
    Right,
    Enter,
    Escape,
    Tab,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::AlwaysAllow => "always_allow",
            Self::Reject => "reject",
            Self::Interrupt => "interrupt",
            Self::Restart => "restart",
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
            Self::Enter => "enter",
            Self::Escape => "escape",
            Self::Tab => "tab",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(Self::Approve),
            "always_allow" | "approve_all" => Some(Self::AlwaysAllow),
            "reject" => Some(Self::Reject),
            "interrupt" => Some(Self::Interrupt),
            "restart" => Some(Self::Restart),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "enter" => Some(Self::Enter),
            "escape" => Some(Self::Escape),
            "tab" => Some(Self::Tab),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-agent lifecycle callbacks reported by the workspace hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEvent {
    SubagentStart,
    SubagentStop,
}

impl HookEvent {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SubagentStart" => Some(Self::SubagentStart),
            "SubagentStop" => Some(Self::SubagentStop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubagentStart => "SubagentStart",
            Self::SubagentStop => "SubagentStop",
        }
    }
}
