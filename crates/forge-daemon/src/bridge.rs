//! Terminal bridge fan-out: real-time tmux control-mode streaming.
//!
//! One `tmux -C attach-session` child per session reads raw `%output`
//! bytes and mirrors them verbatim to every subscriber. Subscriber
//! mailboxes are bounded drop-oldest, so byte order per subscriber is
//! preserved but a late joiner starts at the live tail. Keyboard input
//! flows back through the control-mode stdin; resizes shell out.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{mailbox, MailboxReceiver, MailboxSender};

/// Per-subscriber buffered output chunks.
pub const BRIDGE_MAILBOX_CAPACITY: usize = 512;

/// How long an idle bridge lingers after its last subscriber leaves.
const LINGER: Duration = Duration::from_secs(3);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Pause applied to reads while every subscriber mailbox is full.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("failed to attach to session {session:?}: {message}")]
    Attach { session: String, message: String },
}

/// A live subscription to a session's raw output.
pub struct BridgeSubscription {
    pub id: u64,
    pub receiver: MailboxReceiver<Vec<u8>>,
}

struct BridgeShared {
    session: String,
    subscribers: StdMutex<HashMap<u64, MailboxSender<Vec<u8>>>>,
    next_id: AtomicU64,
    stdin: Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
}

impl BridgeShared {
    fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    fn all_full(&self) -> bool {
        let subscribers = lock(&self.subscribers);
        !subscribers.is_empty() && subscribers.values().all(MailboxSender::is_full)
    }

    fn fan_out(&self, bytes: &[u8]) {
        let subscribers = lock(&self.subscribers);
        for sender in subscribers.values() {
            sender.push(bytes.to_vec());
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fan-out bridge for one tmux session.
pub struct TerminalBridge {
    shared: Arc<BridgeShared>,
}

impl TerminalBridge {
    /// Starts the control-mode attachment and its supervisor task.
    pub fn start(session: &str, parent_cancel: &CancellationToken) -> Arc<Self> {
        let shared = Arc::new(BridgeShared {
            session: session.to_string(),
            subscribers: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(None),
            cancel: parent_cancel.child_token(),
        });
        tokio::spawn(supervise(Arc::clone(&shared)));
        info!(session, "terminal bridge started");
        Arc::new(Self { shared })
    }

    /// Registers a subscriber and seeds it with the current pane snapshot
    /// so the client renders immediately.
    pub async fn subscribe(&self) -> BridgeSubscription {
        let (tx, receiver) = mailbox(BRIDGE_MAILBOX_CAPACITY);
        if let Some(snapshot) = capture_snapshot(&self.shared.session).await {
            tx.push(snapshot);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.subscribers).insert(id, tx);
        BridgeSubscription { id, receiver }
    }

    /// Removes a subscriber, returning how many remain.
    pub fn unsubscribe(&self, id: u64) -> usize {
        let mut subscribers = lock(&self.shared.subscribers);
        if let Some(sender) = subscribers.remove(&id) {
            sender.close();
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count()
    }

    /// Forwards client keyboard bytes to the session. Printable ASCII is
    /// sent literally; anything with control bytes goes in hex so raw ESC
    /// sequences cannot corrupt the line-oriented control stream.
    pub async fn handle_input(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let command = input_command(&self.shared.session, data);
        let mut guard = self.shared.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            if let Err(err) = stdin.write_all(format!("{command}\n").as_bytes()).await {
                debug!(session = %self.shared.session, error = %err, "bridge input write failed");
            }
        }
    }

    /// Applies a client resize to the session window.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let result = Command::new("tmux")
            .args([
                "resize-window",
                "-t",
                &self.shared.session,
                "-x",
                &cols.to_string(),
                "-y",
                &rows.to_string(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(err) = result {
            debug!(session = %self.shared.session, error = %err, "resize failed");
        }
    }

    /// Tears the bridge down: detaches, closes every subscriber.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let mut subscribers = lock(&self.shared.subscribers);
        for (_, sender) in subscribers.drain() {
            sender.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

async fn supervise(shared: Arc<BridgeShared>) {
    let mut backoff = BACKOFF_BASE;
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        match attach(&shared.session) {
            Ok((mut child, stdin, stdout)) => {
                *shared.stdin.lock().await = Some(stdin);
                let saw_output = read_loop(&shared, stdout).await;
                *shared.stdin.lock().await = None;
                let _ = child.kill().await;
                if saw_output {
                    backoff = BACKOFF_BASE;
                }
            }
            Err(err) => {
                debug!(session = %shared.session, error = %err, "bridge attach failed");
            }
        }

        if shared.cancel.is_cancelled() || shared.subscriber_count() == 0 {
            break;
        }
        warn!(session = %shared.session, ?backoff, "terminal attachment lost, reconnecting");
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
    debug!(session = %shared.session, "bridge supervisor exited");
}

fn attach(session: &str) -> Result<(Child, ChildStdin, ChildStdout), BridgeError> {
    let mut child = Command::new("tmux")
        .args(["-C", "attach-session", "-t", session])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BridgeError::Attach {
            session: session.to_string(),
            message: e.to_string(),
        })?;
    let stdin = child.stdin.take().ok_or_else(|| BridgeError::Attach {
        session: session.to_string(),
        message: "no stdin handle".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| BridgeError::Attach {
        session: session.to_string(),
        message: "no stdout handle".to_string(),
    })?;
    Ok((child, stdin, stdout))
}

/// Reads control-mode lines until EOF or cancellation. Returns whether
/// any `%output` was seen (used to reset the reconnect backoff).
async fn read_loop(shared: &Arc<BridgeShared>, stdout: ChildStdout) -> bool {
    let mut lines = BufReader::new(stdout).lines();
    let mut saw_output = false;
    loop {
        let line = tokio::select! {
            _ = shared.cancel.cancelled() => return saw_output,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            // EOF or read error: the session died or detached us.
            Ok(None) | Err(_) => return saw_output,
        };

        let Some(payload) = parse_output_line(&line) else {
            // %begin/%end/%error/%session-changed and friends.
            continue;
        };
        saw_output = true;
        let bytes = decode_output(payload);
        if shared.all_full() {
            tokio::time::sleep(BACKPRESSURE_PAUSE).await;
        }
        shared.fan_out(&bytes);
    }
}

/// Splits `%output %PANE_ID DATA` into the escaped data part.
fn parse_output_line(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("%output ")?;
    let space = rest.find(' ')?;
    Some(&rest[space + 1..])
}

/// Decodes tmux control-mode escaping: `\\` for backslash and `\NNN`
/// octal for non-printable bytes.
fn decode_output(data: &str) -> Vec<u8> {
    let bytes = data.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'\\' {
                result.push(b'\\');
                i += 2;
                continue;
            }
            if i + 3 < bytes.len()
                && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
            {
                let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("0");
                if let Ok(value) = u8::from_str_radix(octal, 8) {
                    result.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        result.push(bytes[i]);
        i += 1;
    }
    result
}

/// Builds the control-mode command that injects client bytes.
fn input_command(session: &str, data: &[u8]) -> String {
    let all_printable = data.iter().all(|b| (0x20..=0x7e).contains(b));
    if all_printable {
        let text = String::from_utf8_lossy(data);
        let escaped = text.replace('\'', "'\\''");
        format!("send-keys -t {session} -l -- '{escaped}'")
    } else {
        let hex = data
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("send-keys -t {session} -H {hex}")
    }
}

/// One-shot pane snapshot for newly attached clients, converted to CRLF
/// line endings with trailing blank rows trimmed.
async fn capture_snapshot(session: &str) -> Option<Vec<u8>> {
    let output = Command::new("tmux")
        .args(["capture-pane", "-e", "-p", "-t", session])
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() || output.stdout.is_empty() {
        return None;
    }
    let mut snapshot = Vec::with_capacity(output.stdout.len());
    for &byte in &output.stdout {
        if byte == b'\n' {
            snapshot.extend_from_slice(b"\r\n");
        } else {
            snapshot.push(byte);
        }
    }
    while snapshot.ends_with(b"\r\n\r\n") {
        snapshot.truncate(snapshot.len() - 2);
    }
    Some(snapshot)
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Bridges keyed by session name: created on first subscriber, destroyed
/// shortly after the last one leaves.
pub struct TerminalBridgeManager {
    bridges: Mutex<HashMap<String, Arc<TerminalBridge>>>,
    cancel: CancellationToken,
}

impl TerminalBridgeManager {
    pub fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            bridges: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Subscribes to a session's raw output, starting a bridge if none is
    /// running.
    pub async fn subscribe(self: &Arc<Self>, session: &str) -> BridgeSubscription {
        let bridge = {
            let mut bridges = self.bridges.lock().await;
            Arc::clone(
                bridges
                    .entry(session.to_string())
                    .or_insert_with(|| TerminalBridge::start(session, &self.cancel)),
            )
        };
        bridge.subscribe().await
    }

    pub async fn bridge(&self, session: &str) -> Option<Arc<TerminalBridge>> {
        self.bridges.lock().await.get(session).cloned()
    }

    /// Drops one subscription; when it was the last, the bridge is torn
    /// down after a short linger (a reconnecting client keeps it warm).
    pub async fn release(self: &Arc<Self>, session: &str, subscription_id: u64) {
        let remaining = {
            let bridges = self.bridges.lock().await;
            match bridges.get(session) {
                Some(bridge) => bridge.unsubscribe(subscription_id),
                None => return,
            }
        };
        if remaining > 0 {
            return;
        }
        let manager = Arc::clone(self);
        let session = session.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(LINGER).await;
            let mut bridges = manager.bridges.lock().await;
            let empty = bridges
                .get(&session)
                .is_some_and(|b| b.subscriber_count() == 0);
            if empty {
                if let Some(bridge) = bridges.remove(&session) {
                    bridge.stop().await;
                    info!(session = %session, "terminal bridge closed");
                }
            }
        });
    }

    /// Immediately removes a session's bridge (agent killed).
    pub async fn remove(&self, session: &str) {
        let bridge = self.bridges.lock().await.remove(session);
        if let Some(bridge) = bridge {
            bridge.stop().await;
        }
    }

    pub async fn shutdown(&self) {
        let bridges: Vec<Arc<TerminalBridge>> = {
            let mut map = self.bridges.lock().await;
            map.drain().map(|(_, bridge)| bridge).collect()
        };
        for bridge in bridges {
            bridge.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_output_line_extracts_payload() {
        assert_eq!(parse_output_line("%output %0 hello"), Some("hello"));
        assert_eq!(
            parse_output_line("%output %12 multi word data"),
            Some("multi word data")
        );
        assert_eq!(parse_output_line("%begin 123"), None);
        assert_eq!(parse_output_line("%output %0"), None);
    }

    #[test]
    fn decode_output_handles_octal_and_backslash() {
        assert_eq!(decode_output("plain"), b"plain");
        assert_eq!(decode_output(r"a\015\012b"), b"a\r\nb");
        assert_eq!(decode_output(r"back\\slash"), b"back\\slash");
        assert_eq!(decode_output(r"\033[31mred"), b"\x1b[31mred");
        // Trailing incomplete escape passes through untouched.
        assert_eq!(decode_output(r"tail\0"), b"tail\\0");
    }

    #[test]
    fn input_command_picks_literal_or_hex() {
        let literal = input_command("s", b"hello world");
        assert_eq!(literal, "send-keys -t s -l -- 'hello world'");

        let quoted = input_command("s", b"it's");
        assert!(quoted.contains(r"it'\''s"));

        let hex = input_command("s", &[0x1b, 0x5b, 0x41]);
        assert_eq!(hex, "send-keys -t s -H 1b 5b 41");
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_in_order() {
        let cancel = CancellationToken::new();
        let shared = Arc::new(BridgeShared {
            session: "s".to_string(),
            subscribers: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(None),
            cancel: cancel.clone(),
        });

        let (tx1, mut rx1) = mailbox(8);
        let (tx2, mut rx2) = mailbox(8);
        lock(&shared.subscribers).insert(1, tx1);
        lock(&shared.subscribers).insert(2, tx2);

        shared.fan_out(b"one");
        shared.fan_out(b"two");

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.as_deref(), Some(b"one".as_slice()));
            assert_eq!(rx.recv().await.as_deref(), Some(b"two".as_slice()));
        }
    }
}
