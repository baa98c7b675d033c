//! Daemon composition root.
//!
//! Explicitly constructs every long-lived service and hands out the
//! handles the external dispatch layer needs. No process-wide globals;
//! teardown runs in shutdown order: scheduler, connectors, bridges, store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use forge_agent::{AgentServiceError, HookEvent};
use forge_connectors::{ConnectorFactory, ConnectorRouter, ProjectNotifier};
use forge_core::{ConfigError, ForgeConfig, SharedConfig};
use forge_db::{Db, DbError};

use crate::bridge::{BridgeSubscription, TerminalBridgeManager};
use crate::hub::{spawn_ping_task, BroadcastHub, UpdateMessage};
use crate::manager::AgentManager;
use crate::monitor::StatusMonitor;
use crate::tmux::{ShellTmuxClient, TmuxClient};
use crate::workspace::GitWorkspaceProvisioner;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] DbError),
}

/// Runtime options not carried by the config record.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// SQLite path; `None` keeps the store in memory (tests, dry runs).
    pub db_path: Option<PathBuf>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            db_path: Some(PathBuf::from("agent-forge.db")),
        }
    }
}

impl DaemonOptions {
    pub fn in_memory() -> Self {
        Self { db_path: None }
    }
}

/// The assembled orchestrator.
pub struct Daemon {
    config: SharedConfig,
    manager: AgentManager,
    hub: Arc<BroadcastHub>,
    bridges: Arc<TerminalBridgeManager>,
    router: ConnectorRouter,
    cancel: CancellationToken,
    scheduler_cancel: CancellationToken,
    monitor_handle: JoinHandle<()>,
}

impl Daemon {
    /// Builds and starts every service: store, recovery, connectors,
    /// scheduler, ping task.
    pub async fn start(
        config: ForgeConfig,
        factory: ConnectorFactory,
        options: DaemonOptions,
    ) -> Result<Self, DaemonError> {
        config.validate()?;

        let db = Arc::new(match &options.db_path {
            Some(path) => Db::open(path)?,
            None => Db::open_in_memory()?,
        });

        let hook_endpoint = format!(
            "http://127.0.0.1:{}/api/hooks/event",
            config.server.port
        );
        let poll_interval = Duration::from_secs_f64(config.defaults.poll_interval_seconds);
        let shared = SharedConfig::new(config);

        let cancel = CancellationToken::new();
        let scheduler_cancel = cancel.child_token();

        let tmux: Arc<dyn TmuxClient> = Arc::new(ShellTmuxClient::default());
        let provisioner = Arc::new(GitWorkspaceProvisioner::new(hook_endpoint));
        let manager = AgentManager::new(
            shared.clone(),
            tmux,
            provisioner,
            Some(Arc::clone(&db)),
            cancel.child_token(),
        );

        match manager.recover() {
            Ok(0) => {}
            Ok(count) => info!(count, "recovered agents from snapshots"),
            Err(err) => warn!(error = %err, "recovery scan failed"),
        }

        let hub = Arc::new(BroadcastHub::new());
        spawn_ping_task(Arc::clone(&hub), cancel.child_token());

        let bridges = TerminalBridgeManager::new(cancel.child_token());

        let router = ConnectorRouter::new(
            shared.clone(),
            Arc::new(manager.clone()) as Arc<dyn forge_agent::AgentService>,
            factory,
        );
        router.start().await;

        let monitor = StatusMonitor::new(
            manager.clone(),
            Some(Arc::clone(&db)),
            Arc::clone(&hub),
            Some(Arc::new(router.clone()) as Arc<dyn ProjectNotifier>),
            poll_interval,
            scheduler_cancel.clone(),
        );
        let monitor_handle = tokio::spawn(async move { monitor.run().await });

        info!("daemon started");
        Ok(Self {
            config: shared,
            manager,
            hub,
            bridges,
            router,
            cancel,
            scheduler_cancel,
            monitor_handle,
        })
    }

    pub fn manager(&self) -> &AgentManager {
        &self.manager
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    pub fn router(&self) -> &ConnectorRouter {
        &self.router
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Atomically swaps the live config, then reconciles connectors.
    /// Backs the `POST /api/config/reload` endpoint.
    pub async fn reload_config(&self, config: ForgeConfig) -> Result<(), DaemonError> {
        config.validate()?;
        self.config.swap(config);
        self.router.reconcile().await;
        info!("config reloaded");
        Ok(())
    }

    /// Backs `POST /api/hooks/event`: sub-agent accounting plus the UI
    /// broadcast the snapshot change implies.
    pub fn handle_hook_event(&self, agent_id: &str, event: &str) -> Result<(), AgentServiceError> {
        let event = HookEvent::parse(event).ok_or_else(|| AgentServiceError::InvalidArgument {
            message: format!("unknown hook event {event:?}"),
        })?;
        let updated = self.manager.handle_hook_event(agent_id, event)?;
        self.hub.publish(UpdateMessage::agent_update(&updated));
        Ok(())
    }

    /// Backs `/ws/terminal/{agent_id}`: attaches a subscriber to the
    /// agent's session bridge.
    pub async fn subscribe_terminal(
        &self,
        agent_id: &str,
    ) -> Result<(String, BridgeSubscription), AgentServiceError> {
        let agent = self
            .manager
            .snapshot(agent_id)
            .ok_or_else(|| AgentServiceError::not_found(agent_id))?;
        if agent.status.is_terminal() {
            return Err(AgentServiceError::terminated(agent_id));
        }
        let subscription = self.bridges.subscribe(&agent.session_name).await;
        Ok((agent.session_name, subscription))
    }

    pub async fn release_terminal(&self, session: &str, subscription_id: u64) {
        self.bridges.release(session, subscription_id).await;
    }

    /// Ordered shutdown: scheduler first, then connectors, then bridges;
    /// the store closes when the last handle drops.
    pub async fn shutdown(self) {
        self.scheduler_cancel.cancel();
        let _ = self.monitor_handle.await;
        self.router.stop().await;
        self.bridges.shutdown().await;
        self.cancel.cancel();
        info!("daemon stopped");
    }
}

/// Installs the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default filter. Safe to call more than once.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
