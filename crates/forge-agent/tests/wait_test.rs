#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Tests for `wait_for_status` against the mock service:
//! target reached immediately, reached after a scripted transition,
//! timeout expiry, cancellation, terminal-state detection, and missing
//! agents.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use forge_agent::error::AgentServiceError;
use forge_agent::mock::{test_snapshot, MockAgentService};
use forge_agent::types::AgentStatus;
use forge_agent::wait::wait_for_status;

const POLL: Duration = Duration::from_millis(10);

#[tokio::test]
async fn returns_immediately_when_already_in_target_status() {
    let mock = MockAgentService::new();
    mock.insert(test_snapshot("a1", "api", AgentStatus::Idle));
    let cancel = CancellationToken::new();

    let snapshot = wait_for_status(
        &mock,
        "a1",
        &[AgentStatus::Idle],
        Duration::from_secs(5),
        POLL,
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(snapshot.id, "a1");
    assert_eq!(snapshot.status, AgentStatus::Idle);
}

#[tokio::test]
async fn observes_transition_scripted_mid_wait() {
    let mock = Arc::new(MockAgentService::new());
    mock.insert(test_snapshot("a1", "api", AgentStatus::Working));

    let flipper = Arc::clone(&mock);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        flipper.update("a1", |a| a.status = AgentStatus::Idle);
    });

    let cancel = CancellationToken::new();
    let snapshot = wait_for_status(
        mock.as_ref(),
        "a1",
        &[AgentStatus::Idle, AgentStatus::WaitingInput],
        Duration::from_secs(5),
        POLL,
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(snapshot.status, AgentStatus::Idle);
}

#[tokio::test]
async fn times_out_when_target_never_arrives() {
    let mock = MockAgentService::new();
    mock.insert(test_snapshot("a1", "api", AgentStatus::Working));
    let cancel = CancellationToken::new();

    let err = wait_for_status(
        &mock,
        "a1",
        &[AgentStatus::Idle],
        Duration::from_millis(60),
        POLL,
        &cancel,
    )
    .await
    .unwrap_err();

    match err {
        AgentServiceError::WaitTimeout {
            agent_id,
            target,
            last_observed,
        } => {
            assert_eq!(agent_id, "a1");
            assert_eq!(target, "idle");
            assert_eq!(last_observed, "working");
        }
        other => panic!("expected WaitTimeout, got {other}"),
    }
}

#[tokio::test]
async fn cancellation_wins_over_polling() {
    let mock = MockAgentService::new();
    mock.insert(test_snapshot("a1", "api", AgentStatus::Working));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = wait_for_status(
        &mock,
        "a1",
        &[AgentStatus::Idle],
        Duration::from_secs(5),
        POLL,
        &cancel,
    )
    .await
    .unwrap_err();

    assert_eq!(
        err,
        AgentServiceError::Cancelled {
            agent_id: "a1".to_string()
        }
    );
}

#[tokio::test]
async fn terminal_status_short_circuits_the_wait() {
    let mock = MockAgentService::new();
    mock.insert(test_snapshot("a1", "api", AgentStatus::Stopped));
    let cancel = CancellationToken::new();

    let err = wait_for_status(
        &mock,
        "a1",
        &[AgentStatus::Idle],
        Duration::from_secs(5),
        POLL,
        &cancel,
    )
    .await
    .unwrap_err();

    assert_eq!(err, AgentServiceError::terminated("a1"));
}

#[tokio::test]
async fn missing_agent_propagates_not_found() {
    let mock = MockAgentService::new();
    let cancel = CancellationToken::new();

    let err = wait_for_status(
        &mock,
        "ghost1",
        &[AgentStatus::Idle],
        Duration::from_secs(1),
        POLL,
        &cancel,
    )
    .await
    .unwrap_err();

    assert_eq!(err, AgentServiceError::not_found("ghost1"));
}
