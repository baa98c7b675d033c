//! Shared foundation for the Agent Forge orchestrator: the typed
//! configuration record consumed by every subsystem, and the naming
//! conventions (agent ids, session names, branch names) that other
//! components parse.

pub mod config;
pub mod naming;

pub use config::{
    ChannelBinding, ConfigError, ConnectorConfig, ControlKeymap, DefaultsConfig, ForgeConfig,
    ProfileConfig, ProjectConfig, ServerConfig, SharedConfig, StartAction, StartSequenceStep,
};
pub use naming::{branch_name, new_agent_id, parse_session_name, session_name, slugify};
