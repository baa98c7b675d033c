//! Typed pub/sub for UI clients, with lossy backpressure.
//!
//! Each subscriber owns a bounded mailbox; when it overflows the oldest
//! messages are dropped, so a stalled WebSocket can never wedge the
//! scheduler. Delivery is FIFO per subscriber; cross-subscriber ordering
//! is unspecified.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use forge_agent::{AgentSnapshot, AgentStatus};

/// Default per-subscriber mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Liveness ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Messages pushed to subscribed UI clients. Serialized with a `type`
/// discriminator for the WebSocket layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateMessage {
    AgentUpdate {
        agent_id: String,
        project: String,
        status: AgentStatus,
        task: String,
        last_activity: String,
        sub_agent_count: u32,
        needs_attention: bool,
        parked: bool,
        last_output: String,
    },
    /// Legacy text relay of a full pane capture.
    TerminalOutput { agent_id: String, output: String },
    MetricsUpdate { payload: serde_json::Value },
    LogLine { line: String },
    Ping,
}

impl UpdateMessage {
    /// Builds the standard agent card update from a snapshot.
    pub fn agent_update(agent: &AgentSnapshot) -> Self {
        const OUTPUT_PREVIEW: usize = 2000;
        let last_output = if agent.last_output.len() > OUTPUT_PREVIEW {
            let start = agent
                .last_output
                .char_indices()
                .rev()
                .nth(OUTPUT_PREVIEW - 1)
                .map(|(i, _)| i)
                .unwrap_or(0);
            agent.last_output[start..].to_string()
        } else {
            agent.last_output.clone()
        };
        Self::AgentUpdate {
            agent_id: agent.id.clone(),
            project: agent.project.clone(),
            status: agent.status,
            task: agent.task.clone(),
            last_activity: agent.last_activity_at.to_rfc3339(),
            sub_agent_count: agent.sub_agent_count,
            needs_attention: agent.needs_attention,
            parked: agent.parked,
            last_output,
        }
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

struct MailboxInner<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Sender half of a bounded drop-oldest queue.
pub struct MailboxSender<T> {
    inner: Arc<MailboxInner<T>>,
}

/// Receiver half; FIFO over whatever survived the bound.
pub struct MailboxReceiver<T> {
    inner: Arc<MailboxInner<T>>,
}

pub fn mailbox<T>(capacity: usize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let inner = Arc::new(MailboxInner {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        notify: Notify::new(),
        capacity: capacity.max(1),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        MailboxSender {
            inner: Arc::clone(&inner),
        },
        MailboxReceiver { inner },
    )
}

impl<T> MailboxSender<T> {
    /// Enqueues a message, evicting the oldest when full. Never blocks.
    pub fn push(&self, message: T) {
        {
            let mut queue = match self.inner.queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.inner.notify.notify_one();
    }

    pub fn is_full(&self) -> bool {
        match self.inner.queue.lock() {
            Ok(queue) => queue.len() >= self.inner.capacity,
            Err(poisoned) => poisoned.into_inner().len() >= self.inner.capacity,
        }
    }

    /// Messages evicted so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }
}

impl<T> MailboxReceiver<T> {
    /// Receives the next message; `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    fn try_pop(&self) -> Option<T> {
        let mut queue = match self.inner.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Fan-out of typed updates to subscribed clients.
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<u64, MailboxSender<UpdateMessage>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Registers a subscriber; the returned id is the unsubscribe handle.
    pub fn subscribe(&self) -> (u64, MailboxReceiver<UpdateMessage>) {
        let (tx, rx) = mailbox(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_subscribers().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Some(sender) = self.lock_subscribers().remove(&id) {
            sender.close();
        }
    }

    /// Delivers a message to every subscriber, lossily.
    pub fn publish(&self, message: UpdateMessage) {
        let subscribers = self.lock_subscribers();
        for sender in subscribers.values() {
            sender.push(message.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, MailboxSender<UpdateMessage>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic liveness pings until cancelled.
pub fn spawn_ping_task(hub: Arc<BroadcastHub>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => hub.publish(UpdateMessage::Ping),
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mailbox_is_fifo() {
        let (tx, mut rx) = mailbox(8);
        tx.push(1);
        tx.push(2);
        tx.push(3);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (tx, mut rx) = mailbox(3);
        for i in 0..5 {
            tx.push(i);
        }
        assert_eq!(tx.dropped(), 2);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, Some(4));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let (tx, mut rx) = mailbox(8);
        tx.push("last");
        tx.close();
        assert_eq!(rx.recv().await, Some("last"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn each_subscriber_gets_every_message() {
        let hub = BroadcastHub::new();
        let (id1, mut rx1) = hub.subscribe();
        let (_id2, mut rx2) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(UpdateMessage::LogLine {
            line: "one".to_string(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await {
                Some(UpdateMessage::LogLine { line }) => assert_eq!(line, "one"),
                other => panic!("unexpected {other:?}"),
            }
        }

        hub.unsubscribe(id1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(rx1.recv().await, None);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publish() {
        let hub = BroadcastHub::with_capacity(2);
        let (_id, mut rx) = hub.subscribe();

        for i in 0..100 {
            hub.publish(UpdateMessage::LogLine {
                line: i.to_string(),
            });
        }
        // Only the newest `capacity` messages survive.
        match rx.recv().await {
            Some(UpdateMessage::LogLine { line }) => assert_eq!(line, "98"),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(UpdateMessage::LogLine { line }) => assert_eq!(line, "99"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn agent_update_serializes_with_type_tag() {
        let agent = forge_agent::mock::test_snapshot("a1b2c3", "api", AgentStatus::Idle);
        let message = UpdateMessage::agent_update(&agent);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "agent_update");
        assert_eq!(json["agent_id"], "a1b2c3");
        assert_eq!(json["status"], "idle");
    }
}
