//! Type definitions for the parallel worker engine.
//!
//! These types form the shared vocabulary between the
//! [`super::spawner::Spawner`], the [`super::monitor::Monitor`] and the
//! [`super::collector`]. A [`TerminalHandle`] is cheap to clone; every clone
//! observes the same mutex-guarded state, which is mutated by the spawner's
//! waiter task and by the monitor's timeout check.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::collector::HANDOFF_MARKER;
use crate::provider::Provider;

/// Unique identifier for a launched worker: `<role>-<seq>-<unix millis>`.
pub type TerminalId = String;

/// Exit code recorded when the orchestrator could not create the process.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;
/// Exit code recorded when the orchestrator killed the process on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -2;
/// Default per-stream cap on captured output chunks.
pub const DEFAULT_OUTPUT_CHUNKS: usize = 10_000;

/// Everything needed to launch one worker.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Worker role, e.g. `"architect"`. Required.
    pub role: String,
    /// Task identifier from the plan. Required.
    pub task_id: String,
    /// External provider name (`"claude"`, `"gemini"`, ...). Empty means the
    /// configured default.
    pub provider: String,
    /// Model tier passed through the provider's model flag.
    pub model: Option<String>,
    /// Prompt text piped to the worker's stdin.
    pub prompt: String,
    /// Structured context, serialized into `CHATI_CONTEXT`.
    pub context: Option<serde_json::Value>,
    /// Working directory; defaults to the project root.
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit; defaults to the spawner's configured timeout.
    pub timeout: Option<Duration>,
    /// Replaces the role's configured write scope for this request only.
    pub write_scope: Option<Vec<String>>,
}

impl LaunchRequest {
    pub fn new(role: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_write_scope(mut self, scope: Vec<String>) -> Self {
        self.write_scope = Some(scope);
        self
    }
}

/// Lifecycle status of a worker handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    /// Process is (believed to be) alive.
    Running,
    /// Process ended on its own, failed to spawn, or timed out.
    Exited,
    /// Process was stopped through [`super::spawner::terminate`].
    Killed,
}

impl TerminalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TerminalStatus::Running)
    }
}

/// Append-only chunk buffer that silently drops chunks past its capacity.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: Vec<String>,
    capacity: usize,
    dropped: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append a chunk. Returns `false` if the buffer is full and the chunk was dropped.
    pub fn push(&mut self, chunk: impl Into<String>) -> bool {
        if self.chunks.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.chunks.push(chunk.into());
        true
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of chunks discarded because the buffer was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// All retained chunks concatenated.
    pub fn text(&self) -> String {
        self.chunks.concat()
    }
}

/// Mutable part of a handle, always accessed under the handle's mutex.
#[derive(Debug)]
struct TerminalState {
    status: TerminalStatus,
    exit_code: Option<i32>,
    pid: Option<u32>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    /// Last stdout line carrying a handoff declaration. Kept outside the
    /// capped buffer so a chatty worker cannot lose its declaration.
    handoff_line: Option<String>,
    finished: Option<Instant>,
}

struct Shared {
    state: Mutex<TerminalState>,
    /// Flips to `true` once the OS process is gone (or never existed).
    exited_tx: watch::Sender<bool>,
    cancel_token: CancellationToken,
}

/// A launched worker.
///
/// The OS process itself is owned by the waiter task the spawner starts; the
/// handle observes it through shared state and can request its termination
/// through a [`CancellationToken`].
#[derive(Clone)]
pub struct TerminalHandle {
    pub id: TerminalId,
    pub role: String,
    pub task_id: String,
    pub model: Option<String>,
    pub provider: Provider,
    /// Wall-clock time the handle was created.
    pub started_at: DateTime<Utc>,
    /// Effective timeout for this worker.
    pub timeout: Duration,
    started: Instant,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TerminalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("task_id", &self.task_id)
            .field("status", &self.status())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

impl TerminalHandle {
    /// Create a handle in `Running` state with no process attached yet.
    pub fn new(
        id: TerminalId,
        role: impl Into<String>,
        task_id: impl Into<String>,
        model: Option<String>,
        provider: Provider,
        timeout: Duration,
        output_capacity: usize,
    ) -> Self {
        let (exited_tx, _) = watch::channel(false);
        Self {
            id,
            role: role.into(),
            task_id: task_id.into(),
            model,
            provider,
            started_at: Utc::now(),
            timeout,
            started: Instant::now(),
            shared: Arc::new(Shared {
                state: Mutex::new(TerminalState {
                    status: TerminalStatus::Running,
                    exit_code: None,
                    pid: None,
                    stdout: OutputBuffer::new(output_capacity),
                    stderr: OutputBuffer::new(output_capacity),
                    handoff_line: None,
                    finished: None,
                }),
                exited_tx,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    /// A handle for a worker whose process is managed elsewhere.
    ///
    /// Its lifecycle is driven entirely through [`record_exit`](Self::record_exit)
    /// and the monitor's timeout check.
    pub fn detached(
        role: impl Into<String>,
        task_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let role = role.into();
        let id = super::spawner::next_terminal_id(&role);
        Self::new(
            id,
            role,
            task_id,
            None,
            Provider::Shell,
            timeout,
            DEFAULT_OUTPUT_CHUNKS,
        )
    }

    pub fn status(&self) -> TerminalStatus {
        self.shared.state.lock().unwrap().status
    }

    /// `None` while running.
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.state.lock().unwrap().exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.state.lock().unwrap().pid
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Terminal with anything other than exit code 0.
    pub fn is_failed(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.status.is_terminal() && state.exit_code != Some(0)
    }

    /// Time since launch, frozen once the handle becomes terminal.
    pub fn elapsed(&self) -> Duration {
        let state = self.shared.state.lock().unwrap();
        match state.finished {
            Some(done) => done.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    pub fn stdout_text(&self) -> String {
        self.shared.state.lock().unwrap().stdout.text()
    }

    pub fn stderr_text(&self) -> String {
        self.shared.state.lock().unwrap().stderr.text()
    }

    /// Chunks dropped from `(stdout, stderr)` because the buffers were full.
    pub fn dropped_chunks(&self) -> (usize, usize) {
        let state = self.shared.state.lock().unwrap();
        (state.stdout.dropped(), state.stderr.dropped())
    }

    /// Last handoff declaration line seen on stdout, whether or not it fit
    /// in the buffer.
    pub fn handoff_line(&self) -> Option<String> {
        self.shared.state.lock().unwrap().handoff_line.clone()
    }

    pub fn append_stdout(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        let mut state = self.shared.state.lock().unwrap();
        if chunk.trim_start().starts_with(HANDOFF_MARKER) {
            state.handoff_line = Some(chunk.clone());
        }
        if !state.stdout.push(chunk) && state.stdout.dropped() == 1 {
            tracing::debug!(terminal_id = %self.id, "stdout buffer full; dropping further output");
        }
    }

    pub fn append_stderr(&self, chunk: impl Into<String>) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.stderr.push(chunk) && state.stderr.dropped() == 1 {
            tracing::debug!(terminal_id = %self.id, "stderr buffer full; dropping further output");
        }
    }

    /// Record a natural process exit. No-op if the handle is already terminal.
    pub fn record_exit(&self, exit_code: i32) -> bool {
        self.transition(TerminalStatus::Exited, Some(exit_code), None)
    }

    /// Mark the handle as timed out (`Exited`, [`TIMEOUT_EXIT_CODE`]) and ask
    /// the owning waiter to kill the process. Does not wait for the kill.
    pub fn expire(&self) -> bool {
        let diagnostic = format!(
            "[chati] worker timed out after {}s and was killed\n",
            self.timeout.as_secs_f64()
        );
        let applied = self.transition(
            TerminalStatus::Exited,
            Some(TIMEOUT_EXIT_CODE),
            Some(diagnostic),
        );
        if applied {
            self.shared.cancel_token.cancel();
        }
        applied
    }

    /// Apply a terminal transition exactly once.
    ///
    /// Returns `false` (and changes nothing) if the handle is already terminal.
    pub(crate) fn transition(
        &self,
        status: TerminalStatus,
        exit_code: Option<i32>,
        diagnostic: Option<String>,
    ) -> bool {
        let has_process = {
            let mut state = self.shared.state.lock().unwrap();
            if state.status.is_terminal() {
                return false;
            }
            if let Some(msg) = diagnostic {
                state.stderr.push(msg);
            }
            state.status = status;
            state.exit_code = exit_code;
            state.finished = Some(Instant::now());
            state.pid.is_some()
        };

        tracing::debug!(terminal_id = %self.id, ?status, ?exit_code, "Terminal state changed");

        if !has_process {
            self.mark_reaped();
        }
        true
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.shared.state.lock().unwrap().pid = pid;
    }

    /// Signal that the underlying process is gone.
    pub(crate) fn mark_reaped(&self) {
        self.shared.exited_tx.send_replace(true);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel_token
    }

    /// Resolves once the underlying process has exited and been reaped.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.shared.exited_tx.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

/// A batch of workers launched together after passing scope validation.
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    pub id: String,
    pub handles: Vec<TerminalHandle>,
    pub started_at: DateTime<Utc>,
}
