//! Tmux client abstraction for hosting and driving agent sessions.
//!
//! Abstracted behind a trait for testability; the default implementation
//! shells out to tmux. Every invocation is bounded so a wedged tmux server
//! fails with a diagnostic instead of hanging the caller.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use wait_timeout::ChildExt;

/// Default bound for a single tmux invocation.
pub const DEFAULT_TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pane grid for new sessions.
pub const DEFAULT_COLS: u16 = 200;
pub const DEFAULT_ROWS: u16 = 50;

/// Literal sends are split into chunks this large; tmux rejects very long
/// single arguments.
const SEND_CHUNK: usize = 500;

#[derive(Debug, Clone, Error)]
pub enum TmuxError {
    #[error("tmux not found on PATH")]
    NotInstalled,
    #[error("tmux {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("tmux {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("tmux io error: {0}")]
    Io(String),
}

/// Result of `create_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Trait over the terminal multiplexer. The default implementation shells
/// out; tests swap in [`MockTmuxClient`].
pub trait TmuxClient: Send + Sync {
    /// Create a detached session running `command` in `cwd` with the given
    /// grid. Returns `AlreadyExists` when the name is taken.
    fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        command: &str,
        cols: u16,
        rows: u16,
    ) -> Result<CreateOutcome, TmuxError>;

    /// Send literal text (no key-name interpretation). Large payloads are
    /// split into chunks.
    fn send_text(&self, session: &str, text: &str) -> Result<(), TmuxError>;

    /// Send a single tmux key name, e.g. "Enter", "Escape", "C-c", "Up".
    fn send_key(&self, session: &str, key: &str) -> Result<(), TmuxError>;

    /// Capture the last `rows` lines of the pane, escape codes included.
    fn capture_pane(&self, session: &str, rows: u32) -> Result<String, TmuxError>;

    fn session_exists(&self, session: &str) -> Result<bool, TmuxError>;

    /// Kill a session. Killing a missing session is not an error.
    fn kill_session(&self, session: &str) -> Result<(), TmuxError>;

    /// Resize the session's window to the client's grid.
    fn resize_window(&self, session: &str, cols: u16, rows: u16) -> Result<(), TmuxError>;
}

// ---------------------------------------------------------------------------
// Shell implementation
// ---------------------------------------------------------------------------

struct CmdOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Shell-based tmux client.
pub struct ShellTmuxClient {
    timeout: Duration,
}

impl ShellTmuxClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn run(&self, args: &[&str]) -> Result<CmdOutput, TmuxError> {
        let label = args.first().copied().unwrap_or("tmux");
        let mut child = Command::new("tmux")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TmuxError::NotInstalled
                } else {
                    TmuxError::Io(e.to_string())
                }
            })?;

        let status = match child
            .wait_timeout(self.timeout)
            .map_err(|e| TmuxError::Io(e.to_string()))?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TmuxError::Timeout {
                    command: label.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout);
        }
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }

        Ok(CmdOutput {
            success: status.success(),
            stdout,
            stderr,
        })
    }

    fn run_ok(&self, args: &[&str]) -> Result<(), TmuxError> {
        let label = args.first().copied().unwrap_or("tmux");
        let output = self.run(args)?;
        if !output.success {
            return Err(TmuxError::Failed {
                command: label.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ShellTmuxClient {
    fn default() -> Self {
        Self::new(DEFAULT_TMUX_TIMEOUT)
    }
}

impl TmuxClient for ShellTmuxClient {
    fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        command: &str,
        cols: u16,
        rows: u16,
    ) -> Result<CreateOutcome, TmuxError> {
        let cwd = cwd.display().to_string();
        let cols = cols.to_string();
        let rows = rows.to_string();
        let output = self.run(&[
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            &cwd,
            "-x",
            &cols,
            "-y",
            &rows,
            command,
        ])?;
        if output.success {
            return Ok(CreateOutcome::Created);
        }
        if output.stderr.contains("duplicate session") {
            return Ok(CreateOutcome::AlreadyExists);
        }
        Err(TmuxError::Failed {
            command: "new-session".to_string(),
            stderr: output.stderr.trim().to_string(),
        })
    }

    fn send_text(&self, session: &str, text: &str) -> Result<(), TmuxError> {
        for chunk in char_chunks(text, SEND_CHUNK) {
            self.run_ok(&["send-keys", "-t", session, "-l", "--", &chunk])?;
        }
        Ok(())
    }

    fn send_key(&self, session: &str, key: &str) -> Result<(), TmuxError> {
        self.run_ok(&["send-keys", "-t", session, key])
    }

    fn capture_pane(&self, session: &str, rows: u32) -> Result<String, TmuxError> {
        let start = format!("-{rows}");
        let output = self.run(&["capture-pane", "-t", session, "-p", "-e", "-S", &start])?;
        if !output.success {
            return Err(TmuxError::Failed {
                command: "capture-pane".to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn session_exists(&self, session: &str) -> Result<bool, TmuxError> {
        let output = self.run(&["has-session", "-t", session])?;
        Ok(output.success)
    }

    fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        let output = self.run(&["kill-session", "-t", session])?;
        if output.success
            || output.stderr.contains("can't find session")
            || output.stderr.contains("no server running")
        {
            return Ok(());
        }
        Err(TmuxError::Failed {
            command: "kill-session".to_string(),
            stderr: output.stderr.trim().to_string(),
        })
    }

    fn resize_window(&self, session: &str, cols: u16, rows: u16) -> Result<(), TmuxError> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        self.run_ok(&["resize-window", "-t", session, "-x", &cols, "-y", &rows])
    }
}

/// Splits text on char boundaries into chunks of at most `max` bytes.
fn char_chunks(text: &str, max: usize) -> Vec<String> {
    if text.len() <= max {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// In-memory tmux for tests: tracks sessions, scripted pane contents, and
/// every key/text sent.
#[derive(Default)]
pub struct MockTmuxClient {
    sessions: Mutex<HashSet<String>>,
    captures: Mutex<HashMap<String, String>>,
    sent_text: Mutex<Vec<(String, String)>>,
    sent_keys: Mutex<Vec<(String, String)>>,
    fail_create: Mutex<bool>,
    fail_capture: Mutex<bool>,
}

impl MockTmuxClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capture(&self, session: &str, content: &str) {
        lock(&self.captures).insert(session.to_string(), content.to_string());
    }

    /// Register a session without going through `create_session`
    /// (recovery tests).
    pub fn add_session(&self, session: &str) {
        lock(&self.sessions).insert(session.to_string());
    }

    pub fn remove_session(&self, session: &str) {
        lock(&self.sessions).remove(session);
    }

    pub fn has_session(&self, session: &str) -> bool {
        lock(&self.sessions).contains(session)
    }

    pub fn fail_next_create(&self) {
        *lock(&self.fail_create) = true;
    }

    pub fn fail_next_capture(&self) {
        *lock(&self.fail_capture) = true;
    }

    pub fn sent_text(&self) -> Vec<(String, String)> {
        lock(&self.sent_text).clone()
    }

    pub fn sent_keys(&self) -> Vec<(String, String)> {
        lock(&self.sent_keys).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TmuxClient for MockTmuxClient {
    fn create_session(
        &self,
        name: &str,
        _cwd: &Path,
        _command: &str,
        _cols: u16,
        _rows: u16,
    ) -> Result<CreateOutcome, TmuxError> {
        if std::mem::take(&mut *lock(&self.fail_create)) {
            return Err(TmuxError::Failed {
                command: "new-session".to_string(),
                stderr: "scripted failure".to_string(),
            });
        }
        let mut sessions = lock(&self.sessions);
        if !sessions.insert(name.to_string()) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        Ok(CreateOutcome::Created)
    }

    fn send_text(&self, session: &str, text: &str) -> Result<(), TmuxError> {
        if !self.has_session(session) {
            return Err(TmuxError::Failed {
                command: "send-keys".to_string(),
                stderr: format!("can't find session: {session}"),
            });
        }
        lock(&self.sent_text).push((session.to_string(), text.to_string()));
        Ok(())
    }

    fn send_key(&self, session: &str, key: &str) -> Result<(), TmuxError> {
        if !self.has_session(session) {
            return Err(TmuxError::Failed {
                command: "send-keys".to_string(),
                stderr: format!("can't find session: {session}"),
            });
        }
        lock(&self.sent_keys).push((session.to_string(), key.to_string()));
        Ok(())
    }

    fn capture_pane(&self, session: &str, _rows: u32) -> Result<String, TmuxError> {
        if std::mem::take(&mut *lock(&self.fail_capture)) {
            return Err(TmuxError::Timeout {
                command: "capture-pane".to_string(),
                timeout: DEFAULT_TMUX_TIMEOUT,
            });
        }
        if !self.has_session(session) {
            return Err(TmuxError::Failed {
                command: "capture-pane".to_string(),
                stderr: format!("can't find session: {session}"),
            });
        }
        Ok(lock(&self.captures).get(session).cloned().unwrap_or_default())
    }

    fn session_exists(&self, session: &str) -> Result<bool, TmuxError> {
        Ok(self.has_session(session))
    }

    fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        lock(&self.sessions).remove(session);
        Ok(())
    }

    fn resize_window(&self, _session: &str, _cols: u16, _rows: u16) -> Result<(), TmuxError> {
        Ok(())
    }
}
