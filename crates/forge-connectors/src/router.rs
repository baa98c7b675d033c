//! Connector router: lifecycle, inbound routing, and outbound delivery
//! for all chat connectors.
//!
//! Inbound messages flow through a single mpsc channel into the dispatch
//! task; routing resolves a target agent via channel bindings, `@project`
//! prefixes, sticky context, or command verbs, and everything reaches
//! agents through the `AgentService` seam.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use forge_agent::{
    AgentService, AgentServiceError, AgentSnapshot, AgentStatus, ControlAction, ListFilter,
    SpawnParams,
};
use forge_core::{ChannelBinding, ConnectorConfig, SharedConfig};

use crate::factory::{BuildOutcome, ConnectorFactory};
use crate::state::{next_state, transition, InstanceEvent, InstanceState};
use crate::types::{
    chunk_text, ActionButton, Attachment, ChannelInfo, Connector, InboundMessage, OutboundMessage,
    PlatformError, CHUNK_LIMIT,
};

const INBOUND_QUEUE: usize = 64;
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(200);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

static TARGET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^@([\w-]+)(?::([\w-]+))?[:\s]\s*(.*)").expect("target regex")
});

/// Agent state transition relayed to a project's bound channels.
/// Formatting is generic text plus action buttons; platforms decide how
/// buttons render.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentNote {
    Started {
        agent_id: String,
        task: String,
    },
    WaitingInput {
        agent_id: String,
        prompt: String,
    },
    Idle {
        agent_id: String,
        response: String,
    },
    Errored {
        agent_id: String,
        excerpt: String,
    },
    Stopped {
        agent_id: String,
        summary: String,
    },
    StatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
        summary: String,
    },
}

/// Outbound notification seam consumed by the polling scheduler.
#[async_trait]
pub trait ProjectNotifier: Send + Sync {
    async fn notify_project(&self, project: &str, note: AgentNote);
}

type ChannelKey = (String, String);

struct Instance {
    connector: Option<Arc<dyn Connector>>,
    state: InstanceState,
    fingerprint: String,
}

struct RouterInner {
    config: SharedConfig,
    agents: Arc<dyn AgentService>,
    factory: ConnectorFactory,
    instances: Mutex<HashMap<String, Instance>>,
    channel_map: StdRwLock<HashMap<ChannelKey, Vec<(String, ChannelBinding)>>>,
    /// Last-interacted agent per channel; bare control commands target it.
    context: StdMutex<HashMap<ChannelKey, String>>,
    /// Channels that reached a project via `@project`; they receive that
    /// project's notifications even without an outbound binding.
    reply_channels: StdMutex<HashMap<String, HashSet<ChannelKey>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<InboundMessage>>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectorRouter {
    inner: Arc<RouterInner>,
}

impl ConnectorRouter {
    pub fn new(
        config: SharedConfig,
        agents: Arc<dyn AgentService>,
        factory: ConnectorFactory,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            inner: Arc::new(RouterInner {
                config,
                agents,
                factory,
                instances: Mutex::new(HashMap::new()),
                channel_map: StdRwLock::new(HashMap::new()),
                context: StdMutex::new(HashMap::new()),
                reply_channels: StdMutex::new(HashMap::new()),
                inbound_tx,
                inbound_rx: StdMutex::new(Some(inbound_rx)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Sender side of the inbound queue, for connectors constructed
    /// outside the factory (e.g. tests).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inner.inbound_tx.clone()
    }

    /// Starts the dispatch task and every enabled connector from config.
    /// Idempotent: already-running instances are left alone.
    pub async fn start(&self) {
        self.rebuild_channel_map();
        self.spawn_dispatch();

        let connectors = self.inner.config.snapshot().connectors;
        for (id, cfg) in connectors {
            if !self.has_instance(&id).await {
                self.start_instance(&id, &cfg).await;
            }
        }
    }

    /// Stops every connector and the dispatch task. Connectors are
    /// stopped before bridges/store per the shutdown order.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let ids: Vec<String> = {
            let instances = self.inner.instances.lock().await;
            instances.keys().cloned().collect()
        };
        for id in ids {
            self.stop_instance(&id).await;
        }
    }

    /// Reconciles running instances against the (possibly hot-swapped)
    /// config: new ids start, removed ids stop, changed credentials
    /// restart.
    pub async fn reconcile(&self) {
        let config = self.inner.config.snapshot();

        let mut to_stop: Vec<String> = Vec::new();
        let mut to_start: Vec<(String, ConnectorConfig)> = Vec::new();
        {
            let instances = self.inner.instances.lock().await;
            for id in instances.keys() {
                if !config.connectors.contains_key(id) {
                    to_stop.push(id.clone());
                }
            }
            for (id, cfg) in &config.connectors {
                match instances.get(id) {
                    None => to_start.push((id.clone(), cfg.clone())),
                    Some(instance) if instance.fingerprint != fingerprint(cfg) => {
                        to_stop.push(id.clone());
                        to_start.push((id.clone(), cfg.clone()));
                    }
                    Some(_) => {}
                }
            }
        }

        for id in &to_stop {
            self.stop_instance(id).await;
            self.inner.instances.lock().await.remove(id);
            info!(connector_id = %id, "connector removed");
        }
        for (id, cfg) in &to_start {
            self.start_instance(id, cfg).await;
        }
        self.rebuild_channel_map();
    }

    /// Per-connector status for the UI.
    pub async fn instance_states(&self) -> HashMap<String, InstanceState> {
        let instances = self.inner.instances.lock().await;
        instances
            .iter()
            .map(|(id, instance)| (id.clone(), instance.state))
            .collect()
    }

    /// Channel listing for the binding UX.
    pub async fn list_channels(
        &self,
        connector_id: &str,
    ) -> Result<Vec<ChannelInfo>, PlatformError> {
        let connector = self.running_connector(connector_id).await?;
        connector.list_channels().await
    }

    /// Checks a channel id against the platform before a binding is saved.
    pub async fn validate_channel(
        &self,
        connector_id: &str,
        channel_id: &str,
    ) -> Result<bool, PlatformError> {
        let connector = self.running_connector(connector_id).await?;
        connector.validate_channel(channel_id).await
    }

    async fn running_connector(
        &self,
        connector_id: &str,
    ) -> Result<Arc<dyn Connector>, PlatformError> {
        self.connector_handle(connector_id).await.ok_or_else(|| {
            PlatformError::Unavailable(format!("connector {connector_id:?} is not running"))
        })
    }

    // -- lifecycle internals --

    async fn has_instance(&self, id: &str) -> bool {
        self.inner.instances.lock().await.contains_key(id)
    }

    async fn start_instance(&self, id: &str, cfg: &ConnectorConfig) {
        let fp = fingerprint(cfg);
        match self.inner.factory.build(id, cfg) {
            BuildOutcome::Disabled { reason } => {
                info!(connector_id = %id, %reason, "connector disabled");
                self.inner.instances.lock().await.insert(
                    id.to_string(),
                    Instance {
                        connector: None,
                        state: InstanceState::Disabled,
                        fingerprint: fp,
                    },
                );
            }
            BuildOutcome::Ready(connector) => {
                self.inner.instances.lock().await.insert(
                    id.to_string(),
                    Instance {
                        connector: Some(Arc::clone(&connector)),
                        state: InstanceState::Starting,
                        fingerprint: fp,
                    },
                );
                match connector.start(self.inner.inbound_tx.clone()).await {
                    Ok(()) => {
                        self.apply_instance_event(id, InstanceEvent::Started).await;
                        info!(connector_id = %id, kind = %cfg.kind, "connector started");
                    }
                    Err(err) => {
                        warn!(connector_id = %id, error = %err, "connector start failed, retrying");
                        self.apply_instance_event(id, InstanceEvent::ConnectionLost)
                            .await;
                        self.spawn_start_retry(id.to_string(), connector);
                    }
                }
            }
        }
    }

    async fn stop_instance(&self, id: &str) {
        let connector = {
            let mut instances = self.inner.instances.lock().await;
            match instances.get_mut(id) {
                Some(instance) if instance.state.is_active() => {
                    instance.state = next_state(instance.state, InstanceEvent::StopRequested);
                    instance.connector.clone()
                }
                _ => None,
            }
        };
        if let Some(connector) = connector {
            if let Err(err) = connector.stop().await {
                warn!(connector_id = %id, error = %err, "connector stop failed");
            }
        }
        self.apply_instance_event(id, InstanceEvent::StopCompleted)
            .await;
    }

    async fn apply_instance_event(&self, id: &str, event: InstanceEvent) {
        let mut instances = self.inner.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            // Disabled instances have no runtime to transition.
            if instance.state == InstanceState::Disabled {
                return;
            }
            let (next, changed) = transition(instance.state, event);
            if changed {
                debug!(
                    connector_id = %id,
                    from = %instance.state,
                    to = %next,
                    "connector state change"
                );
                instance.state = next;
            }
        }
    }

    fn spawn_start_retry(&self, id: String, connector: Arc<dyn Connector>) {
        let router = self.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                tokio::select! {
                    _ = router.inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                {
                    let instances = router.inner.instances.lock().await;
                    match instances.get(&id) {
                        Some(instance) if instance.state == InstanceState::Reconnecting => {}
                        _ => return,
                    }
                }
                match connector.start(router.inner.inbound_tx.clone()).await {
                    Ok(()) => {
                        router.apply_instance_event(&id, InstanceEvent::Reconnected).await;
                        info!(connector_id = %id, "connector reconnected");
                        return;
                    }
                    Err(err) => {
                        debug!(connector_id = %id, error = %err, "connector retry failed");
                        backoff = (backoff * 2).min(RECONNECT_CAP);
                    }
                }
            }
        });
    }

    fn spawn_dispatch(&self) {
        let Some(mut rx) = self.inner.inbound_rx.lock().ok().and_then(|mut g| g.take()) else {
            return;
        };
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = router.inner.cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => router.handle_inbound(msg).await,
                        None => break,
                    },
                }
            }
        });
    }

    fn rebuild_channel_map(&self) {
        let config = self.inner.config.snapshot();
        let mut map: HashMap<ChannelKey, Vec<(String, ChannelBinding)>> = HashMap::new();
        for (project, project_cfg) in &config.projects {
            for binding in &project_cfg.channels {
                if !binding.inbound {
                    continue;
                }
                let key = (binding.connector_id.clone(), binding.channel_id.clone());
                map.entry(key).or_default().push((project.clone(), binding.clone()));
            }
        }
        if let Ok(mut guard) = self.inner.channel_map.write() {
            *guard = map;
        }
    }

    // -- inbound routing --

    async fn handle_inbound(&self, msg: InboundMessage) {
        let key = (msg.connector_id.clone(), msg.channel_id.clone());
        let bindings = self.bindings_for(&key);
        if bindings.is_empty() {
            debug!(
                connector_id = %msg.connector_id,
                channel_id = %msg.channel_id,
                "inbound on unbound channel, ignoring"
            );
            return;
        }

        if let Some(callback) = msg.button_callback.clone() {
            self.handle_callback(&msg, &callback.action, &callback.agent_id)
                .await;
            return;
        }

        if let Some(rest) = msg.text.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            let cmd = parts.next().unwrap_or_default().to_string();
            let args: Vec<String> = parts.map(str::to_string).collect();
            self.handle_command(&msg, &cmd, &args).await;
            return;
        }

        if let Some((project, agent_id, rest)) = parse_target(&msg.text) {
            self.route_addressed(&msg, &project, agent_id.as_deref(), &rest)
                .await;
            return;
        }

        let projects: BTreeSet<&str> = bindings.iter().map(|(p, _)| p.as_str()).collect();
        if projects.len() == 1 {
            let project = projects.into_iter().next().unwrap_or_default().to_string();
            let Some(agent) = self.most_recent_active(&project).await else {
                debug!(project = %project, "bare message with no active agent, ignoring");
                return;
            };
            self.forward(&msg, &agent, &msg.text).await;
            return;
        }

        // Multiple projects share the channel: sticky context, then usage.
        if let Some(agent_id) = self.context_agent(&key).await {
            if let Ok(agent) = self.inner.agents.get(&agent_id).await {
                self.forward(&msg, &agent, &msg.text).await;
                return;
            }
        }
        let list = projects.into_iter().collect::<Vec<_>>().join(", ");
        self.reply(
            &msg,
            &format!(
                "Multiple projects bound to this channel: {list}\nUse @project message to specify."
            ),
        )
        .await;
    }

    async fn route_addressed(
        &self,
        msg: &InboundMessage,
        project: &str,
        agent_id: Option<&str>,
        text: &str,
    ) {
        if self.inner.config.read().project(project).is_none() {
            let available = self.project_names().join(", ");
            self.reply(
                msg,
                &format!("Unknown project: {project:?}\nAvailable: {available}"),
            )
            .await;
            return;
        }

        let agent = match agent_id {
            Some(id) => match self.inner.agents.get(id).await {
                Ok(agent) => agent,
                Err(_) => {
                    self.reply(msg, &format!("Agent `{id}` not found.")).await;
                    return;
                }
            },
            None => match self.most_recent_active(project).await {
                Some(agent) => agent,
                None => {
                    self.reply(
                        msg,
                        &format!(
                            "No active agents for {project}. Spawn one with /spawn {project} [task]."
                        ),
                    )
                    .await;
                    return;
                }
            },
        };
        self.forward(msg, &agent, text).await;
    }

    /// Stages attachments into the workspace, sends the text, confirms.
    /// An idle agent picked up for a new task gets its conversation
    /// context cleared first.
    async fn forward(&self, msg: &InboundMessage, agent: &AgentSnapshot, text: &str) {
        let mut body = text.to_string();
        let staged = self
            .stage_attachments(&agent.workspace_path, &msg.attachments)
            .await;
        if !staged.is_empty() {
            let refs = staged
                .iter()
                .map(|p| format!("  - {}", p.display()))
                .collect::<Vec<_>>()
                .join("\n");
            if body.trim().is_empty() {
                body = format!("Media files staged:\n{refs}");
            } else {
                body = format!("{body}\n\nReferenced files:\n{refs}");
            }
        }
        if body.trim().is_empty() {
            return;
        }

        if agent.status == AgentStatus::Idle {
            if let Err(err) = self.inner.agents.clear_context(&agent.id).await {
                debug!(agent_id = %agent.id, error = %err, "context clear failed");
            }
        }

        match self.inner.agents.send_message(&agent.id, &body).await {
            Ok(()) => {
                self.set_context(msg, &agent.id);
                self.track_reply_channel(msg, &agent.project);
                self.reply(msg, &format!("Sent to `{}` ({})", agent.id, agent.project))
                    .await;
            }
            Err(err) => {
                self.reply(msg, &format!("Failed to send to `{}`: {err}", agent.id))
                    .await;
            }
        }
    }

    /// Copies inbound attachments under the workspace `.media/` directory,
    /// de-duplicating file names. Failures are logged per file.
    async fn stage_attachments(
        &self,
        workspace_path: &str,
        attachments: &[Attachment],
    ) -> Vec<PathBuf> {
        if attachments.is_empty() || workspace_path.is_empty() {
            return Vec::new();
        }
        let media_dir = Path::new(workspace_path).join(".media");
        if let Err(err) = tokio::fs::create_dir_all(&media_dir).await {
            warn!(error = %err, dir = %media_dir.display(), "failed to create media dir");
            return Vec::new();
        }

        let mut staged = Vec::new();
        for attachment in attachments {
            let dest = unique_destination(&media_dir, &attachment.file_name).await;
            match tokio::fs::copy(&attachment.path, &dest).await {
                Ok(_) => staged.push(dest),
                Err(err) => warn!(
                    error = %err,
                    source = %attachment.path.display(),
                    "failed to stage attachment"
                ),
            }
        }
        staged
    }

    async fn handle_callback(&self, msg: &InboundMessage, action: &str, agent_id: &str) {
        let Some(action) = ControlAction::parse(action) else {
            self.reply(msg, &format!("Unknown control action: {action}")).await;
            return;
        };
        let result = match action {
            ControlAction::Restart => self.inner.agents.restart(agent_id).await.map(|_| ()),
            other => self.inner.agents.send_control(agent_id, other).await,
        };
        match result {
            Ok(()) => {
                self.set_context(msg, agent_id);
                self.reply(msg, &format!("Sent `{action}` to agent `{agent_id}`"))
                    .await;
            }
            Err(err) => {
                self.reply(msg, &format!("Failed `{action}` for `{agent_id}`: {err}"))
                    .await;
            }
        }
    }

    async fn handle_command(&self, msg: &InboundMessage, cmd: &str, args: &[String]) {
        match cmd {
            "help" | "commands" | "start" => {
                self.reply(msg, HELP_TEXT).await;
            }
            "status" => {
                let agents = self.inner.agents.list(ListFilter::default()).await;
                if agents.is_empty() {
                    self.reply(msg, "No active agents.").await;
                    return;
                }
                let mut grouped: BTreeMap<String, Vec<AgentSnapshot>> = BTreeMap::new();
                for agent in agents {
                    grouped.entry(agent.project.clone()).or_default().push(agent);
                }
                let mut lines = Vec::new();
                for (project, agents) in grouped {
                    lines.push(format!("** {project} **"));
                    for agent in agents {
                        let task = if agent.task.is_empty() {
                            String::new()
                        } else {
                            format!(" - {}", agent.task)
                        };
                        lines.push(format!("  [{}] {}{}", agent.status, agent.id, task));
                    }
                }
                self.reply(msg, &lines.join("\n")).await;
            }
            "projects" => {
                let config = self.inner.config.snapshot();
                if config.projects.is_empty() {
                    self.reply(msg, "No projects registered.").await;
                    return;
                }
                let mut lines: Vec<String> = Vec::new();
                let mut names: Vec<&String> = config.projects.keys().collect();
                names.sort();
                for name in names {
                    let desc = &config.projects[name].description;
                    if desc.is_empty() {
                        lines.push(format!("* {name}"));
                    } else {
                        lines.push(format!("* {name} - {desc}"));
                    }
                }
                self.reply(msg, &lines.join("\n")).await;
            }
            "spawn" => {
                let Some(project) = args.first() else {
                    self.reply(msg, "Usage: /spawn project [task description]").await;
                    return;
                };
                if self.inner.config.read().project(project).is_none() {
                    let available = self.project_names().join(", ");
                    self.reply(
                        msg,
                        &format!("Unknown project: {project:?}\nAvailable: {available}"),
                    )
                    .await;
                    return;
                }
                let task = args[1..].join(" ");
                match self
                    .inner
                    .agents
                    .spawn(SpawnParams::new(project.clone(), task.clone()))
                    .await
                {
                    Ok(agent) => {
                        self.set_context(msg, &agent.id);
                        self.track_reply_channel(msg, project);
                        let mut reply = format!("Spawned agent `{}` for {project}", agent.id);
                        if !task.is_empty() {
                            reply.push_str(&format!("\nTask: {task}"));
                        }
                        self.reply(msg, &reply).await;
                    }
                    Err(err) => {
                        self.reply(msg, &format!("Failed to spawn agent: {err}")).await;
                    }
                }
            }
            "kill" => {
                let Some(agent_id) = args.first() else {
                    self.reply(msg, "Usage: /kill agent_id").await;
                    return;
                };
                match self.inner.agents.kill(agent_id).await {
                    Ok(()) => self.reply(msg, &format!("Agent `{agent_id}` killed.")).await,
                    Err(AgentServiceError::NotFound { .. }) => {
                        self.reply(msg, &format!("Agent `{agent_id}` not found.")).await;
                    }
                    Err(err) => {
                        self.reply(msg, &format!("Failed to kill `{agent_id}`: {err}")).await;
                    }
                }
            }
            "approve" | "always_allow" | "approve_all" | "reject" | "interrupt" => {
                let Some(agent_id) = self.resolve_control_target(msg, args).await else {
                    self.reply(
                        msg,
                        &format!(
                            "Usage: /{cmd} [agent_id]\nSend a message to an agent first to set context."
                        ),
                    )
                    .await;
                    return;
                };
                self.handle_callback(msg, cmd, &agent_id).await;
            }
            other => {
                self.reply(msg, &format!("Unknown command: /{other}")).await;
            }
        }
    }

    /// Target resolution for bare control commands: explicit arg, then
    /// sticky context, then the single-bound single-agent shortcut.
    async fn resolve_control_target(
        &self,
        msg: &InboundMessage,
        args: &[String],
    ) -> Option<String> {
        if let Some(id) = args.first() {
            return Some(id.clone());
        }
        let key = (msg.connector_id.clone(), msg.channel_id.clone());
        if let Some(id) = self.context_agent(&key).await {
            return Some(id);
        }

        let bindings = self.bindings_for(&key);
        let projects: BTreeSet<&str> = bindings.iter().map(|(p, _)| p.as_str()).collect();
        if projects.len() != 1 {
            return None;
        }
        let project = projects.into_iter().next()?;
        let agents = self.inner.agents.list(ListFilter::project(project)).await;
        let mut live = agents.into_iter().filter(|a| !a.status.is_terminal());
        match (live.next(), live.next()) {
            (Some(agent), None) => Some(agent.id),
            _ => None,
        }
    }

    // -- outbound --

    async fn reply(&self, msg: &InboundMessage, text: &str) {
        let Some(connector) = self.connector_handle(&msg.connector_id).await else {
            warn!(connector_id = %msg.connector_id, "cannot reply: connector not running");
            return;
        };
        // Long replies are split at natural boundaries; once a chunk is
        // dropped the rest would arrive out of order, so stop there.
        for chunk in chunk_text(text, CHUNK_LIMIT) {
            let out = OutboundMessage::text(msg.channel_id.clone(), chunk);
            if !self
                .send_with_retry(&msg.connector_id, Arc::clone(&connector), &out)
                .await
            {
                break;
            }
        }
    }

    async fn connector_handle(&self, connector_id: &str) -> Option<Arc<dyn Connector>> {
        let instances = self.inner.instances.lock().await;
        instances
            .get(connector_id)
            .filter(|i| i.state.is_active())
            .and_then(|i| i.connector.clone())
    }

    /// Sends with exponential backoff; after the retry cap the message is
    /// logged and dropped.
    async fn send_with_retry(
        &self,
        connector_id: &str,
        connector: Arc<dyn Connector>,
        message: &OutboundMessage,
    ) -> bool {
        let mut backoff = RETRY_BASE;
        for attempt in 1..=RETRY_ATTEMPTS {
            match connector.send_text(message).await {
                Ok(()) => return true,
                Err(err) if attempt == RETRY_ATTEMPTS => {
                    warn!(
                        connector_id,
                        channel_id = %message.channel_id,
                        error = %err,
                        "dropping outbound message after {RETRY_ATTEMPTS} attempts"
                    );
                    return false;
                }
                Err(err) => {
                    debug!(connector_id, error = %err, attempt, "send failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        false
    }

    /// Delivery targets for a project: outbound bindings plus tracked
    /// reply channels, de-duplicated.
    fn outbound_targets(&self, project: &str) -> Vec<ChannelKey> {
        let config = self.inner.config.snapshot();
        let mut seen: HashSet<ChannelKey> = HashSet::new();
        let mut targets = Vec::new();

        if let Some(project_cfg) = config.projects.get(project) {
            for binding in &project_cfg.channels {
                if !binding.outbound {
                    continue;
                }
                let key = (binding.connector_id.clone(), binding.channel_id.clone());
                if seen.insert(key.clone()) {
                    targets.push(key);
                }
            }
        }
        if let Ok(reply) = self.inner.reply_channels.lock() {
            if let Some(keys) = reply.get(project) {
                for key in keys {
                    if seen.insert(key.clone()) {
                        targets.push(key.clone());
                    }
                }
            }
        }
        targets
    }

    // -- context helpers --

    fn set_context(&self, msg: &InboundMessage, agent_id: &str) {
        if let Ok(mut context) = self.inner.context.lock() {
            context.insert(
                (msg.connector_id.clone(), msg.channel_id.clone()),
                agent_id.to_string(),
            );
        }
    }

    async fn context_agent(&self, key: &ChannelKey) -> Option<String> {
        let agent_id = self
            .inner
            .context
            .lock()
            .ok()
            .and_then(|context| context.get(key).cloned())?;
        if self.inner.agents.get(&agent_id).await.is_ok() {
            Some(agent_id)
        } else {
            if let Ok(mut context) = self.inner.context.lock() {
                context.remove(key);
            }
            None
        }
    }

    fn track_reply_channel(&self, msg: &InboundMessage, project: &str) {
        if let Ok(mut reply) = self.inner.reply_channels.lock() {
            reply
                .entry(project.to_string())
                .or_default()
                .insert((msg.connector_id.clone(), msg.channel_id.clone()));
        }
    }

    fn bindings_for(&self, key: &ChannelKey) -> Vec<(String, ChannelBinding)> {
        self.inner
            .channel_map
            .read()
            .ok()
            .and_then(|map| map.get(key).cloned())
            .unwrap_or_default()
    }

    fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.config.read().projects.keys().cloned().collect();
        names.sort();
        names
    }

    async fn most_recent_active(&self, project: &str) -> Option<AgentSnapshot> {
        let agents = self.inner.agents.list(ListFilter::project(project)).await;
        agents
            .into_iter()
            .filter(|a| !a.status.is_terminal())
            .max_by_key(|a| a.last_activity_at)
    }
}

#[async_trait]
impl ProjectNotifier for ConnectorRouter {
    async fn notify_project(&self, project: &str, note: AgentNote) {
        let (text, buttons) = render_note(project, &note);
        let chunks = chunk_text(&text, CHUNK_LIMIT);
        for (connector_id, channel_id) in self.outbound_targets(project) {
            let Some(connector) = self.connector_handle(&connector_id).await else {
                debug!(connector_id, "skipping notification: connector not running");
                continue;
            };
            // Action buttons ride on the final chunk, under the full text.
            for (i, chunk) in chunks.iter().enumerate() {
                let message = OutboundMessage {
                    channel_id: channel_id.clone(),
                    text: chunk.clone(),
                    buttons: if i + 1 == chunks.len() {
                        buttons.clone()
                    } else {
                        Vec::new()
                    },
                };
                if !self
                    .send_with_retry(&connector_id, Arc::clone(&connector), &message)
                    .await
                {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fingerprint(cfg: &ConnectorConfig) -> String {
    let mut creds: Vec<(&String, &String)> = cfg.credentials.iter().collect();
    creds.sort();
    format!("{}|{}|{:?}", cfg.kind, cfg.enabled, creds)
}

/// Parses `@project message` or `@project:agent_id message`.
fn parse_target(text: &str) -> Option<(String, Option<String>, String)> {
    let caps = TARGET_RE.captures(text)?;
    let project = caps.get(1)?.as_str().to_string();
    let agent_id = caps.get(2).map(|m| m.as_str().to_string());
    let rest = caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    Some((project, agent_id, rest))
}

fn render_note(project: &str, note: &AgentNote) -> (String, Vec<ActionButton>) {
    match note {
        AgentNote::Started { agent_id, task } => {
            let mut text = format!("Agent `{agent_id}` ({project}) started");
            if !task.is_empty() {
                text.push_str(&format!("\nTask: {task}"));
            }
            (text, Vec::new())
        }
        AgentNote::WaitingInput { agent_id, prompt } => {
            let mut text = format!("Agent `{agent_id}` ({project}) is waiting for input");
            if !prompt.is_empty() {
                text.push_str(&format!(":\n```\n{prompt}\n```"));
            }
            text.push_str("\n\nReply: /approve | /reject | /interrupt");
            let buttons = vec![
                ActionButton::new("Approve", "approve", agent_id),
                ActionButton::new("Reject", "reject", agent_id),
                ActionButton::new("Interrupt", "interrupt", agent_id),
            ];
            (text, buttons)
        }
        AgentNote::Idle { agent_id, response } => {
            let text = if response.is_empty() {
                format!("Agent `{agent_id}` ({project}) is idle")
            } else {
                format!("Agent `{agent_id}` ({project}) response:\n\n{response}")
            };
            (text, Vec::new())
        }
        AgentNote::Errored { agent_id, excerpt } => {
            let mut text = format!("Agent `{agent_id}` ({project}) hit an error");
            if !excerpt.is_empty() {
                text.push_str(&format!("\n```\n{excerpt}\n```"));
            }
            (text, Vec::new())
        }
        AgentNote::Stopped { agent_id, summary } => {
            let mut text = format!("Agent `{agent_id}` ({project}) stopped");
            if !summary.is_empty() {
                text.push_str(&format!("\n```\n{summary}\n```"));
            }
            (text, Vec::new())
        }
        AgentNote::StatusChanged {
            agent_id,
            from,
            to,
            summary,
        } => {
            let mut text = format!("Agent `{agent_id}` ({project}): {from} -> {to}");
            if !summary.is_empty() {
                text.push_str(&format!("\n```\n{summary}\n```"));
            }
            (text, Vec::new())
        }
    }
}

async fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !matches!(tokio::fs::try_exists(&candidate).await, Ok(true)) {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (file_name.to_string(), String::new()),
    };
    for n in 1..1000 {
        let candidate = dir.join(format!("{stem}-{n}{ext}"));
        if !matches!(tokio::fs::try_exists(&candidate).await, Ok(true)) {
            return candidate;
        }
    }
    dir.join(file_name)
}

const HELP_TEXT: &str = "Agent Forge - Command Reference\n\
\n\
AGENT MANAGEMENT\n\
  /status - List all active agents and their status\n\
  /spawn <project> [task] - Spawn a new agent\n\
  /kill <agent_id> - Terminate an agent\n\
  /projects - List available projects\n\
\n\
AGENT CONTROL\n\
  /approve [agent_id] - Approve a pending action\n\
  /always_allow [agent_id] - Approve and remember\n\
  /reject [agent_id] - Reject a pending action\n\
  /interrupt [agent_id] - Interrupt an agent\n\
\n\
  Control commands use your last-interacted agent\n\
  if no agent_id is given.\n\
\n\
SENDING MESSAGES\n\
  @project message - Send to the most recent agent\n\
  @project:agent_id message - Send to a specific agent\n\
\n\
  If the channel is bound to a single project, just\n\
  type your message directly - no prefix needed.";
