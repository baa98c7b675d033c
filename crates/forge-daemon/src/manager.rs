//! Agent lifecycle manager: spawn, kill, restart, message and control
//! routing, recovery, and sub-agent accounting.
//!
//! Owns the in-memory agent table exclusively; the polling scheduler and
//! the hook endpoint mutate agent fields only through the methods here.
//! Operations on the same agent serialize on an id-keyed lock; spawn
//! re-checks the project cap under the project lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use forge_agent::wait::wait_for_status;
use forge_agent::{
    AgentService, AgentServiceError, AgentSnapshot, AgentStatus, ControlAction, HookEvent,
    ListFilter, SpawnParams,
};
use forge_core::{
    naming, ControlKeymap, ForgeConfig, ProfileConfig, SharedConfig, StartAction,
    StartSequenceStep,
};
use forge_db::event_repository as events;
use forge_db::{Db, EventRepository, SnapshotRepository};

use crate::inference::StatusRuleset;
use crate::tmux::{CreateOutcome, TmuxClient, DEFAULT_COLS, DEFAULT_ROWS};
use crate::workspace::{GitWorkspaceProvisioner, InstructionLayers, ProvisionRequest, Provisioner};

/// In-memory bound on the retained pane capture.
const LAST_OUTPUT_CAP: usize = 8000;

/// Event payloads keep user messages short.
const USER_MESSAGE_EVENT_CAP: usize = 500;

const WAIT_FOR_IDLE_DEFAULT: Duration = Duration::from_secs(120);
const WAIT_FOR_IDLE_POLL: Duration = Duration::from_secs(2);
const RECOVERY_CAPTURE_ROWS: u32 = 100;

struct ManagerInner {
    config: SharedConfig,
    tmux: Arc<dyn TmuxClient>,
    provisioner: Arc<dyn Provisioner>,
    db: Option<Arc<Db>>,
    agents: RwLock<HashMap<String, AgentSnapshot>>,
    agent_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    project_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    ruleset: StatusRuleset,
    cancel: CancellationToken,
}

/// Cloneable handle to the lifecycle authority.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

/// Before/after pair returned by poll mutations so the scheduler can log
/// transitions without touching the table directly.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub before: AgentSnapshot,
    pub after: AgentSnapshot,
}

impl AgentManager {
    pub fn new(
        config: SharedConfig,
        tmux: Arc<dyn TmuxClient>,
        provisioner: Arc<dyn Provisioner>,
        db: Option<Arc<Db>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                tmux,
                provisioner,
                db,
                agents: RwLock::new(HashMap::new()),
                agent_locks: StdMutex::new(HashMap::new()),
                project_locks: StdMutex::new(HashMap::new()),
                ruleset: StatusRuleset::default(),
                cancel,
            }),
        }
    }

    pub fn tmux(&self) -> Arc<dyn TmuxClient> {
        Arc::clone(&self.inner.tmux)
    }

    // -- table access for the scheduler --

    /// Cheap synchronous snapshot of every agent.
    pub fn snapshot_list(&self) -> Vec<AgentSnapshot> {
        let agents = read_agents(&self.inner.agents);
        let mut list: Vec<AgentSnapshot> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        read_agents(&self.inner.agents).get(agent_id).cloned()
    }

    /// Applies a poll observation: status, retained output, and an
    /// optional extracted response. Returns the before/after pair, or
    /// `None` when the agent vanished mid-poll (its result is dropped).
    pub fn apply_observation(
        &self,
        agent_id: &str,
        status: AgentStatus,
        output: &str,
        response: Option<String>,
    ) -> Option<PollOutcome> {
        let mut agents = write_agents(&self.inner.agents);
        let agent = agents.get_mut(agent_id)?;
        // A kill that raced the poll wins; stopped agents stay stopped.
        if agent.status.is_terminal() {
            return None;
        }
        let before = agent.clone();

        if status != agent.status {
            agent.status = status;
            agent.last_activity_at = Utc::now();
            match status {
                AgentStatus::Idle | AgentStatus::WaitingInput | AgentStatus::Error => {
                    agent.needs_attention = true;
                    agent.parked = false;
                }
                AgentStatus::Working => agent.needs_attention = false,
                _ => {}
            }
        }
        if let Some(response) = response {
            agent.last_response = response;
        }
        agent.last_output = tail_bounded(output, LAST_OUTPUT_CAP);

        Some(PollOutcome {
            before,
            after: agent.clone(),
        })
    }

    /// Marks an agent stopped after its session disappeared. The entry
    /// stays in the table (only an explicit kill removes it).
    pub fn mark_stopped(&self, agent_id: &str) -> Option<PollOutcome> {
        let mut agents = write_agents(&self.inner.agents);
        let agent = agents.get_mut(agent_id)?;
        if agent.status.is_terminal() {
            return None;
        }
        let before = agent.clone();
        agent.status = AgentStatus::Stopped;
        agent.needs_attention = true;
        agent.parked = false;
        agent.last_activity_at = Utc::now();
        Some(PollOutcome {
            before,
            after: agent.clone(),
        })
    }

    /// Parks or unparks an agent. Parking clears the attention flag; the
    /// UI uses it to shelve finished agents without killing them.
    pub fn set_parked(
        &self,
        agent_id: &str,
        parked: bool,
    ) -> Result<AgentSnapshot, AgentServiceError> {
        let updated = {
            let mut agents = write_agents(&self.inner.agents);
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
            agent.parked = parked;
            if parked {
                agent.needs_attention = false;
            }
            agent.clone()
        };
        self.save_snapshot(&updated);
        Ok(updated)
    }

    /// Clears the attention flag without any other side effect.
    pub fn acknowledge(&self, agent_id: &str) -> Result<AgentSnapshot, AgentServiceError> {
        let updated = {
            let mut agents = write_agents(&self.inner.agents);
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
            agent.needs_attention = false;
            agent.clone()
        };
        self.save_snapshot(&updated);
        Ok(updated)
    }

    /// Sub-agent accounting driven by the workspace hook callbacks.
    pub fn handle_hook_event(
        &self,
        agent_id: &str,
        event: HookEvent,
    ) -> Result<AgentSnapshot, AgentServiceError> {
        let updated = {
            let mut agents = write_agents(&self.inner.agents);
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
            match event {
                HookEvent::SubagentStart => agent.sub_agent_count += 1,
                HookEvent::SubagentStop => {
                    agent.sub_agent_count = agent.sub_agent_count.saturating_sub(1);
                }
            }
            agent.clone()
        };

        let kind = match event {
            HookEvent::SubagentStart => events::KIND_SUB_AGENT_START,
            HookEvent::SubagentStop => events::KIND_SUB_AGENT_STOP,
        };
        self.log_event(
            agent_id,
            &updated.project,
            kind,
            json!({"sub_agent_count": updated.sub_agent_count}),
        );
        self.save_snapshot(&updated);
        Ok(updated)
    }

    /// Readopts agents whose sessions survived a process restart; the
    /// rest are marked stopped with a crash event. Sub-agent counters
    /// reset to zero and are repopulated by hook callbacks.
    pub fn recover(&self) -> Result<usize, forge_db::DbError> {
        let Some(db) = self.inner.db.clone() else {
            return Ok(0);
        };
        let snapshots = SnapshotRepository::new(&db).load_active()?;
        let config = self.inner.config.snapshot();
        let mut recovered = 0;

        for mut snapshot in snapshots {
            if read_agents(&self.inner.agents).contains_key(&snapshot.id) {
                continue;
            }

            let session_alive = self
                .inner
                .tmux
                .session_exists(&snapshot.session_name)
                .unwrap_or(false);
            let project_path = config.project(&snapshot.project).map(|p| p.path.clone());

            match (session_alive, project_path) {
                (true, Some(project_path)) => {
                    snapshot.workspace_path =
                        GitWorkspaceProvisioner::workspace_dir(&project_path, &snapshot.id)
                            .display()
                            .to_string();
                    // Seed the change detector with the live pane so the
                    // first poll does not fabricate a transition.
                    let output = self
                        .inner
                        .tmux
                        .capture_pane(&snapshot.session_name, RECOVERY_CAPTURE_ROWS)
                        .unwrap_or_default();
                    snapshot.status =
                        self.inner
                            .ruleset
                            .detect(&output, &output, AgentStatus::Starting);
                    snapshot.last_output = tail_bounded(&output, LAST_OUTPUT_CAP);
                    snapshot.sub_agent_count = 0;

                    info!(agent_id = %snapshot.id, status = %snapshot.status, "readopted agent");
                    self.save_snapshot(&snapshot);
                    write_agents(&self.inner.agents).insert(snapshot.id.clone(), snapshot);
                    recovered += 1;
                }
                (alive, project_path) => {
                    if alive && project_path.is_none() {
                        warn!(
                            agent_id = %snapshot.id,
                            project = %snapshot.project,
                            "live session references unknown project; marking stopped"
                        );
                    }
                    snapshot.status = AgentStatus::Stopped;
                    snapshot.needs_attention = true;
                    self.save_snapshot(&snapshot);
                    self.log_event(
                        &snapshot.id,
                        &snapshot.project,
                        events::KIND_CRASHED,
                        json!({"reason": "session_missing"}),
                    );
                }
            }
        }
        Ok(recovered)
    }

    // -- persistence helpers (log-and-drop per the store policy) --

    fn log_event(&self, agent_id: &str, project: &str, kind: &str, payload: serde_json::Value) {
        if let Some(db) = &self.inner.db {
            if let Err(err) = EventRepository::new(db).log(agent_id, project, kind, Some(&payload))
            {
                warn!(agent_id, kind, error = %err, "failed to log event");
            }
        }
    }

    fn save_snapshot(&self, agent: &AgentSnapshot) {
        if let Some(db) = &self.inner.db {
            if let Err(err) = SnapshotRepository::new(db).save(agent) {
                warn!(agent_id = %agent.id, error = %err, "failed to save snapshot");
            }
        }
    }

    // -- locks --

    fn agent_lock(&self, agent_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = lock_std(&self.inner.agent_locks);
        Arc::clone(
            locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn project_lock(&self, project: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = lock_std(&self.inner.project_locks);
        Arc::clone(
            locks
                .entry(project.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn live_count(&self, project: &str) -> usize {
        read_agents(&self.inner.agents)
            .values()
            .filter(|a| a.project == project && !a.status.is_terminal())
            .count()
    }

    // -- start sequence --

    fn spawn_start_sequence(&self, agent_id: String, steps: Vec<StartSequenceStep>, task: String) {
        let manager = self.clone();
        let cancel = self.inner.cancel.child_token();
        tokio::spawn(async move {
            manager
                .replay_start_sequence(&agent_id, &steps, &task, &cancel)
                .await;
        });
    }

    /// Walks a profile's start sequence. Failures downgrade to warnings;
    /// the agent keeps running regardless.
    async fn replay_start_sequence(
        &self,
        agent_id: &str,
        steps: &[StartSequenceStep],
        task: &str,
        cancel: &CancellationToken,
    ) {
        for step in steps {
            if cancel.is_cancelled() {
                return;
            }
            let alive = self
                .snapshot(agent_id)
                .is_some_and(|a| !a.status.is_terminal());
            if !alive {
                return;
            }

            match step.action {
                StartAction::Wait => {
                    let secs = step.value.parse::<f64>().unwrap_or(3.0).max(0.0);
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                }
                StartAction::Send => {
                    let text = step.value.replace("{task}", task);
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(err) = self.send_message(agent_id, &text).await {
                        warn!(agent_id, error = %err, "start sequence send failed");
                    }
                }
                StartAction::WaitForIdle => {
                    let timeout = step
                        .value
                        .parse::<f64>()
                        .map(Duration::from_secs_f64)
                        .unwrap_or(WAIT_FOR_IDLE_DEFAULT);
                    let result = wait_for_status(
                        self,
                        agent_id,
                        &[AgentStatus::Idle, AgentStatus::WaitingInput],
                        timeout,
                        WAIT_FOR_IDLE_POLL,
                        cancel,
                    )
                    .await;
                    if let Err(err) = result {
                        warn!(agent_id, error = %err, "wait_for_idle did not settle");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AgentService for AgentManager {
    async fn spawn(&self, params: SpawnParams) -> Result<AgentSnapshot, AgentServiceError> {
        let config = self.inner.config.snapshot();
        let project_cfg = config
            .project(&params.project)
            .cloned()
            .ok_or_else(|| AgentServiceError::UnknownProject {
                project: params.project.clone(),
            })?;
        let profile_cfg: Option<ProfileConfig> = if params.profile.is_empty() {
            None
        } else {
            Some(config.profile(&params.profile).cloned().ok_or_else(|| {
                AgentServiceError::UnknownProfile {
                    profile: params.profile.clone(),
                }
            })?)
        };

        // Hold the project lock across the cap re-check and registration
        // so concurrent spawns cannot both pass the check.
        let project_lock = self.project_lock(&params.project);
        let _project_guard = project_lock.lock().await;

        let limit = config.max_agents_for(&params.project);
        let running = self.live_count(&params.project);
        if running >= limit {
            return Err(AgentServiceError::CapExceeded {
                project: params.project.clone(),
                running,
                limit,
            });
        }

        let agent_id = naming::new_agent_id();
        let session_name = naming::session_name(&params.project, &agent_id);
        let branch_prefix = if params.branch_prefix.is_empty() {
            "agent"
        } else {
            params.branch_prefix.as_str()
        };
        let branch_name = naming::branch_name(branch_prefix, &agent_id, &params.task);

        let request = ProvisionRequest {
            project_path: project_cfg.path.clone(),
            default_branch: project_cfg.default_branch.clone(),
            agent_id: agent_id.clone(),
            branch_name: branch_name.clone(),
            instructions: InstructionLayers {
                global: config.defaults.agent_instructions.clone(),
                project: project_cfg.agent_instructions.clone(),
                profile: profile_cfg
                    .as_ref()
                    .map(|p| p.instructions.clone())
                    .unwrap_or_default(),
                context_files: project_cfg.context_files.clone(),
            },
        };
        let workspace = self
            .inner
            .provisioner
            .provision(&request)
            .map_err(|e| AgentServiceError::Provision {
                message: e.to_string(),
            })?;

        let command =
            build_launch_command(&workspace, &config, &params.project, profile_cfg.as_ref());
        let created = self.inner.tmux.create_session(
            &session_name,
            &workspace,
            &command,
            DEFAULT_COLS,
            DEFAULT_ROWS,
        );
        match created {
            Ok(CreateOutcome::Created) => {}
            Ok(CreateOutcome::AlreadyExists) => {
                let _ = self
                    .inner
                    .provisioner
                    .teardown(&project_cfg.path, &workspace, &branch_name);
                return Err(AgentServiceError::Session {
                    message: format!("session {session_name} already exists"),
                });
            }
            Err(err) => {
                let _ = self
                    .inner
                    .provisioner
                    .teardown(&project_cfg.path, &workspace, &branch_name);
                return Err(AgentServiceError::Session {
                    message: err.to_string(),
                });
            }
        }

        let mut agent = AgentSnapshot::starting(
            agent_id.clone(),
            params.project.clone(),
            session_name,
            workspace.display().to_string(),
            branch_name.clone(),
        );
        agent.task = params.task.clone();
        agent.profile = params.profile.clone();
        write_agents(&self.inner.agents).insert(agent_id.clone(), agent.clone());

        self.log_event(
            &agent_id,
            &params.project,
            events::KIND_SPAWNED,
            json!({
                "task": params.task,
                "branch": branch_name,
                "profile": params.profile,
            }),
        );
        self.save_snapshot(&agent);

        let steps = start_sequence_for(profile_cfg.as_ref(), &params.task);
        if !steps.is_empty() {
            self.spawn_start_sequence(agent_id.clone(), steps, params.task.clone());
        }

        info!(
            agent_id = %agent_id,
            project = %params.project,
            branch = %agent.branch_name,
            profile = %params.profile,
            "spawned agent"
        );
        Ok(agent)
    }

    async fn kill(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        let agent_lock = self.agent_lock(agent_id);
        let _guard = agent_lock.lock().await;

        let agent = self
            .snapshot(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))?;

        if let Err(err) = self.inner.tmux.kill_session(&agent.session_name) {
            warn!(agent_id, error = %err, "failed to kill session");
        }

        let project_path = self
            .inner
            .config
            .read()
            .project(&agent.project)
            .map(|p| p.path.clone());
        if let Some(project_path) = project_path {
            let result = self.inner.provisioner.teardown(
                &project_path,
                Path::new(&agent.workspace_path),
                &agent.branch_name,
            );
            if let Err(err) = result {
                warn!(agent_id, error = %err, "workspace teardown failed");
            }
        }

        let mut stopped = agent;
        stopped.status = AgentStatus::Stopped;
        stopped.needs_attention = false;
        stopped.parked = false;
        stopped.last_activity_at = Utc::now();
        self.save_snapshot(&stopped);
        self.log_event(agent_id, &stopped.project, events::KIND_KILLED, json!({}));

        // Explicit kill clears the in-memory entry and its lock.
        write_agents(&self.inner.agents).remove(agent_id);
        lock_std(&self.inner.agent_locks).remove(agent_id);

        info!(agent_id, project = %stopped.project, "killed agent");
        Ok(())
    }

    async fn restart(&self, agent_id: &str) -> Result<AgentSnapshot, AgentServiceError> {
        let agent = self
            .snapshot(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
        let params = SpawnParams {
            project: agent.project.clone(),
            task: agent.task.clone(),
            branch_prefix: "agent".to_string(),
            profile: agent.profile.clone(),
        };

        self.kill(agent_id).await?;
        let replacement = self.spawn(params).await?;
        self.log_event(
            &replacement.id,
            &replacement.project,
            events::KIND_RESTARTED,
            json!({"previous": agent_id}),
        );
        Ok(replacement)
    }

    async fn send_message(&self, agent_id: &str, text: &str) -> Result<(), AgentServiceError> {
        let agent_lock = self.agent_lock(agent_id);
        let _guard = agent_lock.lock().await;

        let agent = self
            .snapshot(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
        if agent.status.is_terminal() {
            return Err(AgentServiceError::terminated(agent_id));
        }

        let session = &agent.session_name;
        self.inner
            .tmux
            .send_text(session, text)
            .map_err(|e| AgentServiceError::Session {
                message: e.to_string(),
            })?;
        // First Enter finalises the composed line, second submits it.
        for _ in 0..2 {
            self.inner
                .tmux
                .send_key(session, "Enter")
                .map_err(|e| AgentServiceError::Session {
                    message: e.to_string(),
                })?;
        }

        let updated = {
            let mut agents = write_agents(&self.inner.agents);
            agents.get_mut(agent_id).map(|a| {
                a.last_user_message = text.to_string();
                a.last_activity_at = Utc::now();
                a.needs_attention = false;
                a.clone()
            })
        };

        self.log_event(
            agent_id,
            &agent.project,
            events::KIND_USER_MESSAGE,
            json!({"text": tail_bounded(text, USER_MESSAGE_EVENT_CAP)}),
        );
        if let Some(updated) = updated {
            self.save_snapshot(&updated);
        }
        debug!(agent_id, chars = text.len(), "sent message");
        Ok(())
    }

    async fn send_control(
        &self,
        agent_id: &str,
        action: ControlAction,
    ) -> Result<(), AgentServiceError> {
        // Restart re-enters the full kill+spawn path; it must not run
        // under this agent's lock.
        if action == ControlAction::Restart {
            return self.restart(agent_id).await.map(|_| ());
        }

        let agent_lock = self.agent_lock(agent_id);
        let _guard = agent_lock.lock().await;

        let agent = self
            .snapshot(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
        if agent.status.is_terminal() {
            return Err(AgentServiceError::terminated(agent_id));
        }

        let keys = resolve_keys(&self.inner.config.read().defaults.control_keymap, action)
            .ok_or_else(|| AgentServiceError::InvalidArgument {
                message: format!("no key binding for action {action}"),
            })?;
        for key in &keys {
            self.inner
                .tmux
                .send_key(&agent.session_name, key)
                .map_err(|e| AgentServiceError::Session {
                    message: e.to_string(),
                })?;
        }

        {
            let mut agents = write_agents(&self.inner.agents);
            if let Some(a) = agents.get_mut(agent_id) {
                a.last_activity_at = Utc::now();
                a.needs_attention = false;
            }
        }
        info!(agent_id, action = %action, "sent control");
        Ok(())
    }

    async fn clear_context(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        let agent_lock = self.agent_lock(agent_id);
        let _guard = agent_lock.lock().await;

        let agent = self
            .snapshot(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
        if agent.status.is_terminal() {
            return Err(AgentServiceError::terminated(agent_id));
        }

        let session = &agent.session_name;
        self.inner
            .tmux
            .send_text(session, "/clear")
            .and_then(|_| self.inner.tmux.send_key(session, "Enter"))
            .map_err(|e| AgentServiceError::Session {
                message: e.to_string(),
            })?;

        let mut agents = write_agents(&self.inner.agents);
        if let Some(a) = agents.get_mut(agent_id) {
            a.last_activity_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<AgentSnapshot, AgentServiceError> {
        self.snapshot(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))
    }

    async fn list(&self, filter: ListFilter) -> Vec<AgentSnapshot> {
        self.snapshot_list()
            .into_iter()
            .filter(|a| filter.matches(a))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Composes the shell command the session runs: cd into the workspace,
/// export configured env, optionally wrap in the sandbox enforcer, append
/// the profile system prompt.
fn build_launch_command(
    workspace: &Path,
    config: &ForgeConfig,
    project: &str,
    profile: Option<&ProfileConfig>,
) -> String {
    let defaults = &config.defaults;
    let mut claude_cmd = defaults.claude_command.clone();

    if let Some(profile) = profile {
        let prompt = profile.system_prompt.trim();
        if !prompt.is_empty() {
            let escaped = prompt.replace('\'', "'\\''");
            claude_cmd = format!("{claude_cmd} --append-system-prompt '{escaped}'");
        }
    }
    if config.sandbox_for(project) && !defaults.sandbox_command.trim().is_empty() {
        claude_cmd = format!("{} {claude_cmd}", defaults.sandbox_command.trim());
    }

    let mut env: Vec<(&String, &String)> = defaults.claude_env.iter().collect();
    env.sort();
    let exports: String = env
        .iter()
        .map(|(k, v)| format!("export {k}={v} && "))
        .collect();

    let workspace = workspace.display().to_string().replace('\'', "'\\''");
    format!("cd '{workspace}' && {exports}{claude_cmd}")
}

/// Profile sequence, or the default "settle then hand over the task".
fn start_sequence_for(profile: Option<&ProfileConfig>, task: &str) -> Vec<StartSequenceStep> {
    if let Some(profile) = profile {
        if !profile.start_sequence.is_empty() {
            return profile.start_sequence.clone();
        }
    }
    if task.is_empty() {
        return Vec::new();
    }
    vec![
        StartSequenceStep::new(StartAction::WaitForIdle, "60"),
        StartSequenceStep::new(StartAction::Send, "{task}"),
    ]
}

fn resolve_keys(keymap: &ControlKeymap, action: ControlAction) -> Option<Vec<String>> {
    if let Some(keys) = keymap.keys_for(action.as_str()) {
        return Some(keys.to_vec());
    }
    ControlKeymap::default()
        .keys_for(action.as_str())
        .map(<[String]>::to_vec)
}

fn tail_bounded(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let start = text
        .char_indices()
        .rev()
        .nth(cap.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

fn read_agents(
    lock: &RwLock<HashMap<String, AgentSnapshot>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, AgentSnapshot>> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_agents(
    lock: &RwLock<HashMap<String, AgentSnapshot>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentSnapshot>> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
