//! Workspace provisioning: one isolated git worktree per agent on a
//! dedicated branch, plus the files every agent expects to find inside.
//!
//! Provisioning is idempotent against a previously half-created workspace;
//! teardown survives interrupted earlier teardowns. Failures are fatal to
//! the spawn that requested them and to nothing else.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Subdirectory of the project root that holds agent worktrees.
const WORKTREES_DIR: &str = ".worktrees";

/// Per-file cap when inlining declared context files into CLAUDE.md.
const CONTEXT_FILE_CAP: usize = 16 * 1024;

const GIT_ADD_TIMEOUT: Duration = Duration::from_secs(30);
const GIT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
    #[error("git {command} timed out")]
    Timeout { command: String },
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProvisionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Instruction layers merged into the workspace CLAUDE.md, in order.
#[derive(Debug, Clone, Default)]
pub struct InstructionLayers {
    pub global: String,
    pub project: String,
    pub profile: String,
    /// File names relative to the project root, inlined with a per-file cap.
    pub context_files: Vec<String>,
}

/// Everything a provisioner needs for one spawn.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub project_path: PathBuf,
    pub default_branch: String,
    pub agent_id: String,
    pub branch_name: String,
    pub instructions: InstructionLayers,
}

/// Seam between the agent manager and workspace setup. The git
/// implementation is the real thing; tests use [`MockProvisioner`].
pub trait Provisioner: Send + Sync {
    /// Creates the isolated workspace and returns its path.
    fn provision(&self, request: &ProvisionRequest) -> Result<PathBuf, ProvisionError>;

    /// Removes the working copy first, then prunes its branch metadata.
    /// Idempotent; survives interrupted earlier teardowns.
    fn teardown(
        &self,
        project_path: &Path,
        workspace: &Path,
        branch: &str,
    ) -> Result<(), ProvisionError>;
}

// ---------------------------------------------------------------------------
// Git implementation
// ---------------------------------------------------------------------------

pub struct GitWorkspaceProvisioner {
    /// Full URL of the hook endpoint the workspace callbacks POST to.
    hook_endpoint: String,
}

impl GitWorkspaceProvisioner {
    pub fn new(hook_endpoint: impl Into<String>) -> Self {
        Self {
            hook_endpoint: hook_endpoint.into(),
        }
    }

    /// Workspace directory for an agent: `<project>/.worktrees/<id>`.
    pub fn workspace_dir(project_path: &Path, agent_id: &str) -> PathBuf {
        project_path.join(WORKTREES_DIR).join(agent_id)
    }

    fn write_instructions(
        &self,
        workspace: &Path,
        project_path: &Path,
        layers: &InstructionLayers,
    ) -> Result<(), ProvisionError> {
        let mut sections: Vec<String> = Vec::new();
        for layer in [&layers.global, &layers.project, &layers.profile] {
            let trimmed = layer.trim();
            if !trimmed.is_empty() {
                sections.push(trimmed.to_string());
            }
        }
        for name in &layers.context_files {
            let path = project_path.join(name);
            match fs::read_to_string(&path) {
                Ok(content) => {
                    let mut content = content.trim().to_string();
                    if content.is_empty() {
                        continue;
                    }
                    if content.len() > CONTEXT_FILE_CAP {
                        let cut = floor_char_boundary(&content, CONTEXT_FILE_CAP);
                        content.truncate(cut);
                        content.push_str("\n[truncated]");
                    }
                    sections.push(format!("## {name}\n\n{content}"));
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "context file not readable");
                }
            }
        }
        if sections.is_empty() {
            return Ok(());
        }
        fs::write(workspace.join("CLAUDE.md"), format!("{}\n", sections.join("\n\n")))?;
        Ok(())
    }

    /// Registers the sub-agent start/stop callbacks in
    /// `.claude/settings.local.json`.
    fn install_hooks(&self, workspace: &Path, agent_id: &str) -> Result<(), ProvisionError> {
        let hook_command = |event: &str| {
            format!(
                "curl -s -X POST {} -H 'Content-Type: application/json' -d '{{\"agent_id\":\"{}\",\"event\":\"{}\"}}'",
                self.hook_endpoint, agent_id, event
            )
        };
        let hook_entry = |event: &str| {
            json!([{
                "matcher": "",
                "hooks": [{"type": "command", "command": hook_command(event)}],
            }])
        };
        let settings = json!({
            "hooks": {
                "SubagentStart": hook_entry("SubagentStart"),
                "SubagentStop": hook_entry("SubagentStop"),
            }
        });

        let claude_dir = workspace.join(".claude");
        fs::create_dir_all(&claude_dir)?;
        let payload = serde_json::to_string_pretty(&settings)
            .map_err(|e| ProvisionError::Io(e.to_string()))?;
        fs::write(claude_dir.join("settings.local.json"), payload)?;
        Ok(())
    }

    /// Replicates the project's `.claude/agents/` skill catalog into the
    /// workspace, whole directory.
    fn copy_skill_catalog(&self, project_path: &Path, workspace: &Path) {
        let source = project_path.join(".claude").join("agents");
        if !source.is_dir() {
            return;
        }
        let dest = workspace.join(".claude").join("agents");
        if let Err(err) = copy_dir_all(&source, &dest) {
            warn!(error = %err, "failed to copy skill catalog");
        }
    }

    /// Copies gitignored `.env*` files from the project root; they never
    /// travel with the worktree.
    fn copy_env_files(&self, project_path: &Path, workspace: &Path) {
        let Ok(entries) = fs::read_dir(project_path) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(".env") {
                continue;
            }
            if entry.path().is_file() {
                if let Err(err) = fs::copy(entry.path(), workspace.join(name.as_ref())) {
                    warn!(file = %name, error = %err, "failed to copy env file");
                }
            }
        }
    }

    /// Clears leftovers of a previously interrupted provision for the same
    /// agent id so the retry starts clean.
    fn cleanup_partial(&self, request: &ProvisionRequest, workspace: &Path) {
        if workspace.exists() {
            debug!(workspace = %workspace.display(), "clearing partial workspace");
            let _ = self.teardown(&request.project_path, workspace, &request.branch_name);
        } else {
            // The branch may survive a crash that lost the directory.
            let _ = run_git(
                &request.project_path,
                &["branch", "-D", &request.branch_name],
                GIT_CLEANUP_TIMEOUT,
            );
        }
    }
}

impl Provisioner for GitWorkspaceProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<PathBuf, ProvisionError> {
        let workspace = Self::workspace_dir(&request.project_path, &request.agent_id);
        self.cleanup_partial(request, &workspace);

        if let Some(parent) = workspace.parent() {
            fs::create_dir_all(parent)?;
        }

        let workspace_arg = workspace.display().to_string();
        run_git(
            &request.project_path,
            &[
                "worktree",
                "add",
                "-b",
                &request.branch_name,
                &workspace_arg,
                &request.default_branch,
            ],
            GIT_ADD_TIMEOUT,
        )?;

        fs::create_dir_all(workspace.join(".media"))?;
        self.copy_env_files(&request.project_path, &workspace);
        self.install_hooks(&workspace, &request.agent_id)?;
        self.copy_skill_catalog(&request.project_path, &workspace);
        self.write_instructions(&workspace, &request.project_path, &request.instructions)?;

        info!(
            agent_id = %request.agent_id,
            branch = %request.branch_name,
            workspace = %workspace.display(),
            "workspace provisioned"
        );
        Ok(workspace)
    }

    fn teardown(
        &self,
        project_path: &Path,
        workspace: &Path,
        branch: &str,
    ) -> Result<(), ProvisionError> {
        let workspace_arg = workspace.display().to_string();
        let removed = run_git(
            project_path,
            &["worktree", "remove", &workspace_arg, "--force"],
            GIT_CLEANUP_TIMEOUT,
        );
        if let Err(err) = removed {
            debug!(error = %err, "worktree remove failed, falling back to rm");
            if workspace.exists() {
                let _ = fs::remove_dir_all(workspace);
            }
        }
        let _ = run_git(project_path, &["worktree", "prune"], GIT_CLEANUP_TIMEOUT);
        let _ = run_git(project_path, &["branch", "-D", branch], GIT_CLEANUP_TIMEOUT);
        Ok(())
    }
}

fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, ProvisionError> {
    let label = args.join(" ");
    let mut child = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProvisionError::Io(e.to_string()))?;

    let status = match child
        .wait_timeout(timeout)
        .map_err(|e| ProvisionError::Io(e.to_string()))?
    {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProvisionError::Timeout { command: label });
        }
    };

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }
        return Err(ProvisionError::Git {
            command: label,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(stdout)
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let dest = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// Filesystem-only provisioner for manager tests: creates plain
/// directories under a root instead of git worktrees.
pub struct MockProvisioner {
    root: PathBuf,
    fail_next: Mutex<bool>,
    torn_down: Mutex<Vec<String>>,
}

impl MockProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fail_next: Mutex::new(false),
            torn_down: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self) {
        if let Ok(mut flag) = self.fail_next.lock() {
            *flag = true;
        }
    }

    /// Branches passed to `teardown`, in order.
    pub fn torn_down(&self) -> Vec<String> {
        self.torn_down
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl Provisioner for MockProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<PathBuf, ProvisionError> {
        if self
            .fail_next
            .lock()
            .map(|mut flag| std::mem::take(&mut *flag))
            .unwrap_or(false)
        {
            return Err(ProvisionError::Git {
                command: "worktree add".to_string(),
                stderr: "scripted failure".to_string(),
            });
        }
        let workspace = self.root.join(&request.agent_id);
        fs::create_dir_all(workspace.join(".media"))?;
        Ok(workspace)
    }

    fn teardown(
        &self,
        _project_path: &Path,
        workspace: &Path,
        branch: &str,
    ) -> Result<(), ProvisionError> {
        if workspace.exists() {
            let _ = fs::remove_dir_all(workspace);
        }
        if let Ok(mut torn) = self.torn_down.lock() {
            torn.push(branch.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_dir_nests_under_worktrees() {
        let dir = GitWorkspaceProvisioner::workspace_dir(Path::new("/repo"), "a1b2c3");
        assert_eq!(dir, PathBuf::from("/repo/.worktrees/a1b2c3"));
    }

    #[test]
    fn instructions_merge_layers_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(&workspace).expect("mkdir");
        fs::write(tmp.path().join("ARCHITECTURE.md"), "layout notes").expect("write");

        let provisioner = GitWorkspaceProvisioner::new("http://localhost:8080/api/hooks/event");
        let layers = InstructionLayers {
            global: "be careful".to_string(),
            project: "project rules".to_string(),
            profile: String::new(),
            context_files: vec!["ARCHITECTURE.md".to_string(), "missing.md".to_string()],
        };
        provisioner
            .write_instructions(&workspace, tmp.path(), &layers)
            .expect("write instructions");

        let content = fs::read_to_string(workspace.join("CLAUDE.md")).expect("read");
        let global_pos = content.find("be careful").expect("global layer");
        let project_pos = content.find("project rules").expect("project layer");
        let context_pos = content.find("## ARCHITECTURE.md").expect("context section");
        assert!(global_pos < project_pos && project_pos < context_pos);
        assert!(content.contains("layout notes"));
        assert!(!content.contains("missing.md"));
    }

    #[test]
    fn empty_layers_write_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let provisioner = GitWorkspaceProvisioner::new("http://localhost:8080/api/hooks/event");
        provisioner
            .write_instructions(tmp.path(), tmp.path(), &InstructionLayers::default())
            .expect("write");
        assert!(!tmp.path().join("CLAUDE.md").exists());
    }

    #[test]
    fn hooks_settings_register_both_callbacks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let provisioner = GitWorkspaceProvisioner::new("http://localhost:8080/api/hooks/event");
        provisioner
            .install_hooks(tmp.path(), "a1b2c3")
            .expect("install hooks");

        let raw = fs::read_to_string(tmp.path().join(".claude/settings.local.json")).expect("read");
        let settings: serde_json::Value = serde_json::from_str(&raw).expect("json");
        for event in ["SubagentStart", "SubagentStop"] {
            let command = settings["hooks"][event][0]["hooks"][0]["command"]
                .as_str()
                .expect("command");
            assert!(command.contains("http://localhost:8080/api/hooks/event"));
            assert!(command.contains("a1b2c3"));
            assert!(command.contains(event));
        }
    }

    #[test]
    fn mock_provisioner_creates_and_removes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockProvisioner::new(tmp.path());
        let request = ProvisionRequest {
            project_path: tmp.path().to_path_buf(),
            default_branch: "main".to_string(),
            agent_id: "a1b2c3".to_string(),
            branch_name: "agent/a1b2c3/task".to_string(),
            instructions: InstructionLayers::default(),
        };
        let workspace = mock.provision(&request).expect("provision");
        assert!(workspace.join(".media").is_dir());

        mock.teardown(tmp.path(), &workspace, "agent/a1b2c3/task")
            .expect("teardown");
        assert!(!workspace.exists());
        assert_eq!(mock.torn_down(), vec!["agent/a1b2c3/task".to_string()]);
    }
}
