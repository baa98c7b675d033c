#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Scheduler tests: status transitions driven by scripted pane captures,
//! crash detection, notification fan-out, and hub broadcasts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forge_agent::{AgentService, AgentStatus, SpawnParams};
use forge_connectors::{AgentNote, ProjectNotifier};
use forge_core::{ForgeConfig, ProjectConfig, SharedConfig};
use forge_daemon::hub::{BroadcastHub, UpdateMessage};
use forge_daemon::manager::AgentManager;
use forge_daemon::monitor::StatusMonitor;
use forge_daemon::tmux::MockTmuxClient;
use forge_daemon::workspace::MockProvisioner;
use forge_db::{Db, EventFilter, EventRepository, SnapshotRepository};

#[derive(Default)]
struct RecordingNotifier {
    notes: Mutex<Vec<(String, AgentNote)>>,
}

impl RecordingNotifier {
    fn notes(&self) -> Vec<(String, AgentNote)> {
        self.notes.lock().expect("notes lock").clone()
    }
}

#[async_trait]
impl ProjectNotifier for RecordingNotifier {
    async fn notify_project(&self, project: &str, note: AgentNote) {
        self.notes
            .lock()
            .expect("notes lock")
            .push((project.to_string(), note));
    }
}

struct Harness {
    manager: AgentManager,
    monitor: StatusMonitor,
    tmux: Arc<MockTmuxClient>,
    hub: Arc<BroadcastHub>,
    notifier: Arc<RecordingNotifier>,
    db: Arc<Db>,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let project_path = tmp.path().join("repo");
    std::fs::create_dir_all(&project_path).expect("mkdir");

    let mut config = ForgeConfig::default();
    config.projects.insert(
        "api".to_string(),
        ProjectConfig {
            path: project_path,
            ..ProjectConfig::default()
        },
    );

    let tmux = Arc::new(MockTmuxClient::new());
    let db = Arc::new(Db::open_in_memory().expect("db"));
    let manager = AgentManager::new(
        SharedConfig::new(config),
        Arc::clone(&tmux) as Arc<dyn forge_daemon::TmuxClient>,
        Arc::new(MockProvisioner::new(tmp.path().join("worktrees")))
            as Arc<dyn forge_daemon::Provisioner>,
        Some(Arc::clone(&db)),
        CancellationToken::new(),
    );

    let hub = Arc::new(BroadcastHub::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = StatusMonitor::new(
        manager.clone(),
        Some(Arc::clone(&db)),
        Arc::clone(&hub),
        Some(Arc::clone(&notifier) as Arc<dyn ProjectNotifier>),
        Duration::from_secs(3),
        CancellationToken::new(),
    );

    Harness {
        manager,
        monitor,
        tmux,
        hub,
        notifier,
        db,
        _tmp: tmp,
    }
}

async fn spawn_quiet(h: &Harness) -> forge_agent::AgentSnapshot {
    h.manager
        .spawn(SpawnParams::new("api", ""))
        .await
        .expect("spawn")
}

#[tokio::test]
async fn permission_prompt_flips_to_waiting_input_with_side_effects() {
    let h = harness();
    let agent = spawn_quiet(&h).await;
    let (_sub, mut rx) = h.hub.subscribe();

    h.tmux.set_capture(
        &agent.session_name,
        "Edit(src/lib.rs)\nDo you want to proceed?\n❯ 1. Yes\n  2. No",
    );
    h.monitor.tick().await;

    let updated = h.manager.get(&agent.id).await.expect("get");
    assert_eq!(updated.status, AgentStatus::WaitingInput);
    assert!(updated.needs_attention);

    // Event log: a status_change and a waiting_input with the prompt.
    let changes = EventRepository::new(&h.db)
        .recent(&EventFilter {
            agent_id: Some(agent.id.clone()),
            kind: Some("status_change".to_string()),
            ..EventFilter::default()
        })
        .expect("events");
    assert_eq!(changes.len(), 1);
    let waiting = EventRepository::new(&h.db)
        .recent(&EventFilter {
            kind: Some("waiting_input".to_string()),
            ..EventFilter::default()
        })
        .expect("events");
    assert_eq!(waiting.len(), 1);

    // Notifier: started announcement plus the waiting-input alert.
    let notes = h.notifier.notes();
    assert!(matches!(notes[0].1, AgentNote::Started { .. }));
    match &notes[1].1 {
        AgentNote::WaitingInput { agent_id, prompt } => {
            assert_eq!(agent_id, &agent.id);
            assert!(prompt.contains("Do you want to proceed?"));
        }
        other => panic!("expected WaitingInput, got {other:?}"),
    }

    // Hub: agent_update then terminal_output, in order.
    match rx.recv().await.expect("update") {
        UpdateMessage::AgentUpdate {
            agent_id, status, ..
        } => {
            assert_eq!(agent_id, agent.id);
            assert_eq!(status, AgentStatus::WaitingInput);
        }
        other => panic!("expected AgentUpdate, got {other:?}"),
    }
    match rx.recv().await.expect("output") {
        UpdateMessage::TerminalOutput { agent_id, output } => {
            assert_eq!(agent_id, agent.id);
            assert!(output.contains("Do you want to proceed?"));
        }
        other => panic!("expected TerminalOutput, got {other:?}"),
    }
}

#[tokio::test]
async fn working_to_idle_extracts_and_relays_the_response() {
    let h = harness();
    let agent = spawn_quiet(&h).await;

    h.tmux
        .set_capture(&agent.session_name, "compiling the fix now");
    h.monitor.tick().await;
    assert_eq!(
        h.manager.get(&agent.id).await.expect("get").status,
        AgentStatus::Working
    );

    h.tmux.set_capture(
        &agent.session_name,
        "⏺ Fixed the race in the poller.\nAll 14 tests pass.\n❯ ",
    );
    h.monitor.tick().await;

    let updated = h.manager.get(&agent.id).await.expect("get");
    assert_eq!(updated.status, AgentStatus::Idle);
    assert!(updated.last_response.contains("Fixed the race"));

    let responses = EventRepository::new(&h.db)
        .recent(&EventFilter {
            kind: Some("agent_response".to_string()),
            ..EventFilter::default()
        })
        .expect("events");
    assert_eq!(responses.len(), 1);

    let notes = h.notifier.notes();
    let idle = notes
        .iter()
        .find_map(|(_, note)| match note {
            AgentNote::Idle { response, .. } => Some(response.clone()),
            _ => None,
        })
        .expect("idle note");
    assert!(idle.contains("Fixed the race"));
}

#[tokio::test]
async fn error_marker_logs_an_error_event_and_notifies() {
    let h = harness();
    let agent = spawn_quiet(&h).await;

    h.tmux.set_capture(
        &agent.session_name,
        "thread 'main' panicked at src/poll.rs:42\nerror: poll loop died",
    );
    h.monitor.tick().await;

    let updated = h.manager.get(&agent.id).await.expect("get");
    assert_eq!(updated.status, AgentStatus::Error);
    assert!(updated.needs_attention);

    let errors = EventRepository::new(&h.db)
        .recent(&EventFilter {
            agent_id: Some(agent.id.clone()),
            kind: Some("error".to_string()),
            ..EventFilter::default()
        })
        .expect("events");
    assert_eq!(errors.len(), 1);

    let errored = h
        .notifier
        .notes()
        .into_iter()
        .any(|(_, note)| matches!(note, AgentNote::Errored { .. }));
    assert!(errored);
}

#[tokio::test]
async fn unchanged_pane_produces_no_duplicate_notifications() {
    let h = harness();
    let agent = spawn_quiet(&h).await;

    h.tmux
        .set_capture(&agent.session_name, "Do you want to proceed?");
    h.monitor.tick().await;
    let notes_after_first = h.notifier.notes().len();

    // Same pane again: same state, no new notification.
    h.monitor.tick().await;
    h.monitor.tick().await;
    assert_eq!(h.notifier.notes().len(), notes_after_first);
}

#[tokio::test]
async fn vanished_session_marks_agent_stopped_but_keeps_it_listed() {
    let h = harness();
    let agent = spawn_quiet(&h).await;

    h.tmux.remove_session(&agent.session_name);
    h.monitor.tick().await;

    let updated = h.manager.get(&agent.id).await.expect("still tracked");
    assert_eq!(updated.status, AgentStatus::Stopped);
    assert!(updated.needs_attention);

    let row = SnapshotRepository::new(&h.db)
        .get(&agent.id)
        .expect("query")
        .expect("row");
    assert_eq!(row.status, AgentStatus::Stopped);

    let stopped_note = h
        .notifier
        .notes()
        .into_iter()
        .any(|(_, note)| matches!(note, AgentNote::Stopped { .. }));
    assert!(stopped_note);

    // Stopped agents are skipped on later ticks.
    let notes = h.notifier.notes().len();
    h.monitor.tick().await;
    assert_eq!(h.notifier.notes().len(), notes);
}

#[tokio::test]
async fn capture_failure_skips_the_poll_without_status_change() {
    let h = harness();
    let agent = spawn_quiet(&h).await;

    h.tmux.set_capture(&agent.session_name, "some output");
    h.monitor.tick().await;
    assert_eq!(
        h.manager.get(&agent.id).await.expect("get").status,
        AgentStatus::Working
    );

    // The session is fine but the capture call flakes: the poll is
    // skipped, the status stands, and the retained output is untouched.
    h.tmux
        .set_capture(&agent.session_name, "Do you want to proceed?");
    h.tmux.fail_next_capture();
    h.monitor.tick().await;

    let after = h.manager.get(&agent.id).await.expect("get");
    assert_eq!(after.status, AgentStatus::Working);
    assert_eq!(after.last_output, "some output");
}
