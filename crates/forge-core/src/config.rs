//! Configuration record for the Agent Forge orchestrator.
//!
//! The record is *consumed* here, not parsed: the embedding application
//! deserializes whatever file format it likes into [`ForgeConfig`] and hands
//! it over. Every section has full defaults so a minimal deployment only
//! needs to declare its projects.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation failure. Surfaced at startup or hot-reload and
/// never fatal after boot.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("config field {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// HTTP/WebSocket server settings (the dispatch layer itself lives outside
/// the kernel; the kernel needs the address to build hook callbacks).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secret_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            secret_key: String::new(),
        }
    }
}

/// Action → tmux key-sequence table for `send_control`.
///
/// Kept as plain strings because numeric-prompt ordering varies between
/// agent CLI versions; deployments rebind entries without code changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlKeymap(pub HashMap<String, Vec<String>>);

impl ControlKeymap {
    pub fn keys_for(&self, action: &str) -> Option<&[String]> {
        self.0.get(action).map(|v| v.as_slice())
    }
}

impl Default for ControlKeymap {
    fn default() -> Self {
        let mut map = HashMap::new();
        let entry = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
        map.insert("approve".to_string(), entry(&["1", "Enter"]));
        map.insert("always_allow".to_string(), entry(&["2", "Enter"]));
        map.insert("reject".to_string(), entry(&["Escape"]));
        map.insert("interrupt".to_string(), entry(&["C-c"]));
        map.insert("up".to_string(), entry(&["Up"]));
        map.insert("down".to_string(), entry(&["Down"]));
        map.insert("left".to_string(), entry(&["Left"]));
        map.insert("right".to_string(), entry(&["Right"]));
        map.insert("enter".to_string(), entry(&["Enter"]));
        map.insert("escape".to_string(), entry(&["Escape"]));
        map.insert("tab".to_string(), entry(&["Tab"]));
        Self(map)
    }
}

/// Global defaults applied where a project does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub max_agents_per_project: usize,
    pub sandbox: bool,
    /// Platform-specific sandbox enforcer prefixed to the launch command
    /// when the effective sandbox flag is on. Empty disables wrapping.
    pub sandbox_command: String,
    pub claude_command: String,
    pub claude_env: HashMap<String, String>,
    pub poll_interval_seconds: f64,
    pub agent_instructions: String,
    pub control_keymap: ControlKeymap,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_agents_per_project: 5,
            sandbox: true,
            sandbox_command: String::new(),
            claude_command: "claude".to_string(),
            claude_env: HashMap::new(),
            poll_interval_seconds: 3.0,
            agent_instructions: String::new(),
            control_keymap: ControlKeymap::default(),
        }
    }
}

/// Directive actions in a profile start sequence. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAction {
    Wait,
    Send,
    WaitForIdle,
}

/// One step of an agent's post-boot script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSequenceStep {
    pub action: StartAction,
    #[serde(default)]
    pub value: String,
}

impl StartSequenceStep {
    pub fn new(action: StartAction, value: impl Into<String>) -> Self {
        Self {
            action,
            value: value.into(),
        }
    }
}

/// Named preset bundling a system prompt, instructions, and a start
/// sequence replayed after the session boots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub description: String,
    pub system_prompt: String,
    pub instructions: String,
    pub start_sequence: Vec<StartSequenceStep>,
}

/// Binding between a project and a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub connector_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default = "default_true")]
    pub inbound: bool,
    #[serde(default = "default_true")]
    pub outbound: bool,
}

fn default_true() -> bool {
    true
}

/// A source repository agents are spawned into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub path: PathBuf,
    pub default_branch: String,
    pub max_agents: Option<usize>,
    pub description: String,
    pub agent_instructions: String,
    pub context_files: Vec<String>,
    pub sandbox: Option<bool>,
    pub channels: Vec<ChannelBinding>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            default_branch: "main".to_string(),
            max_agents: None,
            description: String::new(),
            agent_instructions: String::new(),
            context_files: Vec::new(),
            sandbox: None,
            channels: Vec::new(),
        }
    }
}

/// A chat-platform connector instance. Credentials stay opaque to the
/// kernel; the typed factory interprets them per `type` tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
    pub credentials: HashMap<String, String>,
    pub settings: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

/// Root configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub server: ServerConfig,
    pub defaults: DefaultsConfig,
    pub profiles: HashMap<String, ProfileConfig>,
    pub projects: HashMap<String, ProjectConfig>,
    pub connectors: HashMap<String, ConnectorConfig>,
}

impl ForgeConfig {
    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.get(name)
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.get(name)
    }

    /// Effective agent cap for a project (project override or default).
    pub fn max_agents_for(&self, project: &str) -> usize {
        self.projects
            .get(project)
            .and_then(|p| p.max_agents)
            .unwrap_or(self.defaults.max_agents_per_project)
    }

    /// Effective sandbox flag for a project.
    pub fn sandbox_for(&self, project: &str) -> bool {
        self.projects
            .get(project)
            .and_then(|p| p.sandbox)
            .unwrap_or(self.defaults.sandbox)
    }

    /// Validates the record. Project paths are checked for shape only;
    /// whether they are live git repositories is a provisioning concern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid("server.port", "must be non-zero"));
        }
        if self.defaults.poll_interval_seconds <= 0.0 {
            return Err(invalid(
                "defaults.poll_interval_seconds",
                "must be positive",
            ));
        }
        if self.defaults.claude_command.trim().is_empty() {
            return Err(invalid("defaults.claude_command", "must not be empty"));
        }
        for (name, project) in &self.projects {
            if project.path.as_os_str().is_empty() {
                return Err(invalid(
                    &format!("projects.{name}.path"),
                    "must not be empty",
                ));
            }
            if project.default_branch.trim().is_empty() {
                return Err(invalid(
                    &format!("projects.{name}.default_branch"),
                    "must not be empty",
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for binding in &project.channels {
                let key = (binding.connector_id.as_str(), binding.channel_id.as_str());
                if !seen.insert(key) {
                    return Err(invalid(
                        &format!("projects.{name}.channels"),
                        format!(
                            "duplicate binding {}/{}",
                            binding.connector_id, binding.channel_id
                        ),
                    ));
                }
            }
        }
        for (id, connector) in &self.connectors {
            if connector.kind.trim().is_empty() {
                return Err(invalid(&format!("connectors.{id}.type"), "must not be empty"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the live configuration. The reload endpoint swaps
/// the record atomically; readers take a short-lived guard or a snapshot.
#[derive(Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<ForgeConfig>>,
}

impl SharedConfig {
    pub fn new(config: ForgeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ForgeConfig> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Owned copy for work that must not hold the lock across awaits.
    pub fn snapshot(&self) -> ForgeConfig {
        self.read().clone()
    }

    /// Atomically replaces the live record, returning the previous one.
    pub fn swap(&self, config: ForgeConfig) -> ForgeConfig {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_project(name: &str, project: ProjectConfig) -> ForgeConfig {
        let mut config = ForgeConfig::default();
        config.projects.insert(name.to_string(), project);
        config
    }

    #[test]
    fn default_config_validates() {
        assert!(ForgeConfig::default().validate().is_ok());
    }

    #[test]
    fn max_agents_falls_back_to_defaults() {
        let mut config = config_with_project(
            "api",
            ProjectConfig {
                path: PathBuf::from("/tmp/api"),
                ..ProjectConfig::default()
            },
        );
        assert_eq!(config.max_agents_for("api"), 5);
        assert_eq!(config.max_agents_for("unknown"), 5);

        if let Some(project) = config.projects.get_mut("api") {
            project.max_agents = Some(1);
        }
        assert_eq!(config.max_agents_for("api"), 1);
    }

    #[test]
    fn empty_project_path_is_rejected() {
        let config = config_with_project("api", ProjectConfig::default());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("projects.api.path"));
    }

    #[test]
    fn duplicate_channel_binding_is_rejected() {
        let binding = ChannelBinding {
            connector_id: "tg".to_string(),
            channel_id: "c1".to_string(),
            channel_name: String::new(),
            inbound: true,
            outbound: true,
        };
        let config = config_with_project(
            "api",
            ProjectConfig {
                path: PathBuf::from("/tmp/api"),
                channels: vec![binding.clone(), binding],
                ..ProjectConfig::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_keymap_covers_every_control_action() {
        let keymap = ControlKeymap::default();
        for action in [
            "approve",
            "always_allow",
            "reject",
            "interrupt",
            "up",
            "down",
            "left",
            "right",
            "enter",
            "escape",
            "tab",
        ] {
            assert!(keymap.keys_for(action).is_some(), "missing {action}");
        }
        assert_eq!(keymap.keys_for("approve").unwrap(), ["1", "Enter"]);
    }

    #[test]
    fn shared_config_swap_replaces_record() {
        let shared = SharedConfig::new(ForgeConfig::default());
        let mut next = ForgeConfig::default();
        next.defaults.max_agents_per_project = 9;

        let old = shared.swap(next);
        assert_eq!(old.defaults.max_agents_per_project, 5);
        assert_eq!(shared.read().defaults.max_agents_per_project, 9);
    }
}
