//! Polling wait for agent status transitions.
//!
//! Used by start-sequence replay (`wait_for_idle` directives) and by any
//! caller that needs to block until an agent settles.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AgentServiceError;
use crate::service::AgentService;
use crate::types::{AgentSnapshot, AgentStatus};

/// Polls `service.get` until the agent reaches one of `targets`.
///
/// Returns the snapshot on success. Fails with:
/// - `WaitTimeout` when the deadline passes first,
/// - `Cancelled` when the token fires,
/// - `Terminated` when the agent reaches a terminal status not in
///   `targets`,
/// - any error the service itself returns (e.g. `NotFound`).
pub async fn wait_for_status(
    service: &dyn AgentService,
    agent_id: &str,
    targets: &[AgentStatus],
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<AgentSnapshot, AgentServiceError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_observed = AgentStatus::Starting;
    let mut first = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AgentServiceError::Cancelled {
                    agent_id: agent_id.to_string(),
                });
            }
            _ = tokio::time::sleep_until(deadline) => {
                let target = targets
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join("|");
                return Err(AgentServiceError::WaitTimeout {
                    agent_id: agent_id.to_string(),
                    target,
                    last_observed: last_observed.as_str().to_string(),
                });
            }
            _ = async {
                if first {
                    first = false;
                } else {
                    tokio::time::sleep(poll_interval).await;
                }
            } => {
                let snapshot = service.get(agent_id).await?;
                last_observed = snapshot.status;

                if targets.contains(&snapshot.status) {
                    return Ok(snapshot);
                }
                if snapshot.status.is_terminal() {
                    return Err(AgentServiceError::terminated(agent_id));
                }
            }
        }
    }
}
