//! Polling scheduler: captures every live agent's pane, runs inference,
//! persists events and snapshots, and fans out broadcasts and connector
//! notifications.
//!
//! One agent's failure never affects another: capture errors skip that
//! agent's poll, store errors are logged and dropped, and notifications
//! fire only on transitions so a state never notifies twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use forge_agent::{AgentSnapshot, AgentStatus};
use forge_connectors::{AgentNote, ProjectNotifier};
use forge_db::event_repository as events;
use forge_db::{Db, EventRepository, SnapshotRepository};

use crate::hub::{BroadcastHub, UpdateMessage};
use crate::inference::{
    extract_activity_summary, extract_last_response, extract_prompt_text, StatusRuleset,
};
use crate::manager::{AgentManager, PollOutcome};

/// Pane rows captured per poll.
const POLL_ROWS: u32 = 100;

pub struct StatusMonitor {
    manager: AgentManager,
    db: Option<Arc<Db>>,
    hub: Arc<BroadcastHub>,
    notifier: Option<Arc<dyn ProjectNotifier>>,
    ruleset: StatusRuleset,
    poll_interval: Duration,
    cancel: CancellationToken,
    /// Agents already announced to outbound channels.
    announced: Mutex<HashSet<String>>,
}

impl StatusMonitor {
    pub fn new(
        manager: AgentManager,
        db: Option<Arc<Db>>,
        hub: Arc<BroadcastHub>,
        notifier: Option<Arc<dyn ProjectNotifier>>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            db,
            hub,
            notifier,
            ruleset: StatusRuleset::default(),
            poll_interval,
            cancel,
            announced: Mutex::new(HashSet::new()),
        }
    }

    /// Runs the periodic driver until cancelled.
    pub async fn run(&self) {
        info!(interval = ?self.poll_interval, "status monitor started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.tick().await;
        }
        info!("status monitor stopped");
    }

    /// One full poll cycle over every non-stopped agent.
    pub async fn tick(&self) {
        for agent in self.manager.snapshot_list() {
            if agent.status.is_terminal() {
                continue;
            }
            self.poll_agent(agent).await;
        }
    }

    async fn poll_agent(&self, agent: AgentSnapshot) {
        self.announce_if_new(&agent).await;

        let tmux = self.manager.tmux();
        let session_alive = tmux.session_exists(&agent.session_name).unwrap_or(false);

        if !session_alive {
            // Crash detection: the session vanished without a kill.
            let Some(outcome) = self.manager.mark_stopped(&agent.id) else {
                return;
            };
            self.log_event(
                &agent.id,
                &agent.project,
                events::KIND_STATUS_CHANGE,
                json!({"status": "stopped", "reason": "session_missing"}),
            );
            self.save_snapshot(&outcome.after);
            self.notify(
                &agent.project,
                AgentNote::Stopped {
                    agent_id: agent.id.clone(),
                    summary: extract_activity_summary(&agent.last_output),
                },
            )
            .await;
            self.hub.publish(UpdateMessage::agent_update(&outcome.after));
            return;
        }

        let capture = match tmux.capture_pane(&agent.session_name, POLL_ROWS) {
            Ok(capture) => capture,
            Err(err) => {
                // One skipped poll; the agent's status is unchanged.
                debug!(agent_id = %agent.id, error = %err, "pane capture failed, skipping poll");
                return;
            }
        };

        let new_status = self
            .ruleset
            .detect(&capture, &agent.last_output, agent.status);
        let response = if new_status == AgentStatus::Idle && agent.status == AgentStatus::Working {
            let extracted = extract_last_response(&capture);
            (!extracted.is_empty()).then_some(extracted)
        } else {
            None
        };

        // A kill racing this poll makes apply_observation drop the result.
        let Some(outcome) = self
            .manager
            .apply_observation(&agent.id, new_status, &capture, response.clone())
        else {
            return;
        };

        if outcome.before.status != outcome.after.status {
            self.log_event(
                &agent.id,
                &agent.project,
                events::KIND_STATUS_CHANGE,
                json!({"status": outcome.after.status.as_str()}),
            );
            self.apply_transition_effects(&outcome, &capture, response).await;
        }

        self.save_snapshot(&outcome.after);
        self.hub.publish(UpdateMessage::agent_update(&outcome.after));
        self.hub.publish(UpdateMessage::TerminalOutput {
            agent_id: agent.id.clone(),
            output: capture,
        });
    }

    async fn apply_transition_effects(
        &self,
        outcome: &PollOutcome,
        capture: &str,
        response: Option<String>,
    ) {
        let agent = &outcome.after;
        match agent.status {
            AgentStatus::WaitingInput => {
                let prompt = extract_prompt_text(&self.ruleset, capture);
                self.log_event(
                    &agent.id,
                    &agent.project,
                    events::KIND_WAITING_INPUT,
                    json!({"prompt": prompt}),
                );
                self.notify(
                    &agent.project,
                    AgentNote::WaitingInput {
                        agent_id: agent.id.clone(),
                        prompt,
                    },
                )
                .await;
            }
            AgentStatus::Error => {
                let excerpt = extract_activity_summary(capture);
                self.log_event(
                    &agent.id,
                    &agent.project,
                    events::KIND_ERROR,
                    json!({"excerpt": excerpt}),
                );
                self.notify(
                    &agent.project,
                    AgentNote::Errored {
                        agent_id: agent.id.clone(),
                        excerpt,
                    },
                )
                .await;
            }
            AgentStatus::Idle if outcome.before.status == AgentStatus::Working => {
                let response = response.unwrap_or_default();
                if !response.is_empty() {
                    self.log_event(
                        &agent.id,
                        &agent.project,
                        events::KIND_AGENT_RESPONSE,
                        json!({"response": response}),
                    );
                }
                self.notify(
                    &agent.project,
                    AgentNote::Idle {
                        agent_id: agent.id.clone(),
                        response,
                    },
                )
                .await;
            }
            AgentStatus::Working => {}
            _ => {
                self.notify(
                    &agent.project,
                    AgentNote::StatusChanged {
                        agent_id: agent.id.clone(),
                        from: outcome.before.status,
                        to: agent.status,
                        summary: extract_activity_summary(capture),
                    },
                )
                .await;
            }
        }
    }

    /// First sighting of a starting agent announces it to the project's
    /// channels.
    async fn announce_if_new(&self, agent: &AgentSnapshot) {
        let first_sighting = {
            let mut announced = match self.announced.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            announced.insert(agent.id.clone())
        };
        if first_sighting && agent.status == AgentStatus::Starting {
            self.notify(
                &agent.project,
                AgentNote::Started {
                    agent_id: agent.id.clone(),
                    task: agent.task.clone(),
                },
            )
            .await;
        }
    }

    async fn notify(&self, project: &str, note: AgentNote) {
        if let Some(notifier) = &self.notifier {
            notifier.notify_project(project, note).await;
        }
    }

    fn log_event(&self, agent_id: &str, project: &str, kind: &str, payload: serde_json::Value) {
        if let Some(db) = &self.db {
            if let Err(err) = EventRepository::new(db).log(agent_id, project, kind, Some(&payload))
            {
                warn!(agent_id, kind, error = %err, "failed to log event");
            }
        }
    }

    fn save_snapshot(&self, agent: &AgentSnapshot) {
        if let Some(db) = &self.db {
            if let Err(err) = SnapshotRepository::new(db).save(agent) {
                warn!(agent_id = %agent.id, error = %err, "failed to save snapshot");
            }
        }
    }
}
