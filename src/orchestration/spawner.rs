//! Worker process spawner.
//!
//! Launching is split in two:
//! - [`Spawner::build_command`] is pure: it validates the request and plans
//!   the full invocation (binary, args, env, stdin payload) without touching
//!   the OS.
//! - [`Spawner::launch`] executes a plan. The child runs in its own process
//!   group with piped stdio. Stdout/stderr are captured line by line into the
//!   handle's capped buffers. A waiter task owns the child and races its exit
//!   against the wall-clock timeout and the handle's cancellation token.
//!
//! [`terminate`] stops a worker gracefully (SIGTERM to the group), escalating
//! to SIGKILL after the grace period.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::types::{
    LaunchRequest, ParallelGroup, SPAWN_FAILED_EXIT_CODE, TIMEOUT_EXIT_CODE, TerminalHandle,
    TerminalId, TerminalStatus,
};
use crate::error::LaunchError;
use crate::isolation::{WriteScopeTable, build_isolation_env};
use crate::provider::Provider;

/// Unique per-process counter mixed into terminal ids.
static TERMINAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// How long to keep draining output pipes after the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const ENV_TERMINAL_ID: &str = "CHATI_TERMINAL_ID";
pub const ENV_AGENT: &str = "CHATI_AGENT";
pub const ENV_TASK_ID: &str = "CHATI_TASK_ID";
pub const ENV_PARALLEL: &str = "CHATI_PARALLEL";
pub const ENV_MODEL: &str = "CHATI_MODEL";
pub const ENV_CONTEXT: &str = "CHATI_CONTEXT";

/// Runtime settings for launching workers.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Directory workers run in unless a request overrides it.
    pub project_root: PathBuf,
    pub default_provider: Provider,
    pub default_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Per-stream cap on captured output chunks.
    pub output_buffer_chunks: usize,
    /// Binary overrides per provider.
    pub commands: HashMap<Provider, String>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            default_provider: crate::provider::DEFAULT_PROVIDER,
            default_timeout: Duration::from_secs(30 * 60),
            grace_period: Duration::from_secs(5),
            output_buffer_chunks: super::types::DEFAULT_OUTPUT_CHUNKS,
            commands: HashMap::new(),
        }
    }
}

/// A fully planned invocation. Produced by [`Spawner::build_command`].
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub terminal_id: TerminalId,
    pub role: String,
    pub task_id: String,
    pub model: Option<String>,
    pub provider: Provider,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub stdin_payload: String,
}

/// Result of [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateOutcome {
    /// `true` if this call stopped the worker; `false` if it had already ended.
    pub killed: bool,
    pub exit_code: Option<i32>,
}

/// Plans and launches worker processes.
#[derive(Debug, Clone)]
pub struct Spawner {
    config: SpawnerConfig,
    scopes: Arc<WriteScopeTable>,
}

impl Spawner {
    pub fn new(config: SpawnerConfig, scopes: Arc<WriteScopeTable>) -> Self {
        Self { config, scopes }
    }

    pub fn scopes(&self) -> &WriteScopeTable {
        &self.scopes
    }

    /// Plan the invocation for `request` without creating a process.
    pub fn build_command(&self, request: &LaunchRequest) -> Result<CommandPlan, LaunchError> {
        if request.role.trim().is_empty() {
            return Err(LaunchError::MissingField { field: "role" });
        }
        if request.task_id.trim().is_empty() {
            return Err(LaunchError::MissingField { field: "task_id" });
        }

        let terminal_id = next_terminal_id(&request.role);
        let scope = self.scopes.resolve(request);
        let isolation = build_isolation_env(&scope);

        let mut env = BTreeMap::new();
        for (key, value) in isolation.vars() {
            env.insert(key.to_string(), value);
        }
        env.insert(ENV_TERMINAL_ID.to_string(), terminal_id.clone());
        env.insert(ENV_AGENT.to_string(), request.role.clone());
        env.insert(ENV_TASK_ID.to_string(), request.task_id.clone());
        env.insert(ENV_PARALLEL.to_string(), "true".to_string());
        if let Some(model) = &request.model {
            env.insert(ENV_MODEL.to_string(), model.clone());
        }
        if let Some(context) = &request.context {
            // Serializing a `Value` cannot fail.
            env.insert(ENV_CONTEXT.to_string(), context.to_string());
        }

        let provider = Provider::resolve(&request.provider, self.config.default_provider);
        let command = self
            .config
            .commands
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| provider.default_command().to_string());

        Ok(CommandPlan {
            terminal_id,
            role: request.role.clone(),
            task_id: request.task_id.clone(),
            model: request.model.clone(),
            provider,
            command,
            args: provider.args(request.model.as_deref()),
            env,
            working_dir: request
                .working_dir
                .clone()
                .unwrap_or_else(|| self.config.project_root.clone()),
            timeout: request.timeout.unwrap_or(self.config.default_timeout),
            stdin_payload: request.prompt.clone(),
        })
    }

    /// Validate and launch a single worker.
    ///
    /// Only request validation is reported as `Err`. A process that fails to
    /// start still yields a handle, already `Exited` with
    /// [`SPAWN_FAILED_EXIT_CODE`].
    pub async fn launch(&self, request: &LaunchRequest) -> Result<TerminalHandle, LaunchError> {
        let plan = self.build_command(request)?;
        Ok(self.launch_plan(plan).await)
    }

    /// Launch a batch whose write scopes are pairwise disjoint.
    ///
    /// Either every request is launched or none is: scope conflicts and
    /// request validation errors are raised before any process exists.
    pub async fn launch_group(
        &self,
        requests: &[LaunchRequest],
    ) -> Result<ParallelGroup, LaunchError> {
        let plans = self.preflight(requests)?;

        let group_id = format!("group-{}", Uuid::new_v4());
        let started_at = Utc::now();
        let mut handles = Vec::with_capacity(plans.len());
        for plan in plans {
            handles.push(self.launch_plan(plan).await);
        }

        tracing::info!(group_id = %group_id, workers = handles.len(), "Parallel group launched");

        Ok(ParallelGroup {
            id: group_id,
            handles,
            started_at,
        })
    }

    /// Run every pre-launch check for a batch and return the planned commands.
    pub fn preflight(&self, requests: &[LaunchRequest]) -> Result<Vec<CommandPlan>, LaunchError> {
        let validation = self.scopes.validate(requests);
        if !validation.valid {
            for conflict in &validation.conflicts {
                tracing::warn!(
                    role_a = %conflict.role_a,
                    role_b = %conflict.role_b,
                    path = %conflict.path,
                    "Write scope conflict"
                );
            }
            return Err(LaunchError::IsolationConflict {
                conflicts: validation.conflicts,
            });
        }

        requests.iter().map(|r| self.build_command(r)).collect()
    }

    /// Start the process described by `plan` and wire up its waiter.
    async fn launch_plan(&self, plan: CommandPlan) -> TerminalHandle {
        let handle = TerminalHandle::new(
            plan.terminal_id.clone(),
            plan.role.clone(),
            plan.task_id.clone(),
            plan.model.clone(),
            plan.provider,
            plan.timeout,
            self.config.output_buffer_chunks,
        );

        // process_group(0) requires the CommandExt trait on Unix.
        #[allow(unused_imports)]
        use std::os::unix::process::CommandExt;

        let spawned = Command::new(&plan.command)
            .args(&plan.args)
            .envs(&plan.env)
            .current_dir(&plan.working_dir)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(
                    terminal_id = %handle.id,
                    command = %plan.command,
                    error = %e,
                    "Failed to spawn worker"
                );
                handle.transition(
                    TerminalStatus::Exited,
                    Some(SPAWN_FAILED_EXIT_CODE),
                    Some(format!("[chati] failed to spawn `{}`: {e}\n", plan.command)),
                );
                return handle;
            }
        };

        handle.set_pid(child.id());
        tracing::info!(
            terminal_id = %handle.id,
            role = %plan.role,
            task_id = %plan.task_id,
            provider = %plan.provider,
            pid = ?child.id(),
            "Worker launched"
        );

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, handle.clone(), Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, handle.clone(), Stream::Stderr));
        }

        // The prompt may exceed the pipe buffer of a worker that never reads
        // it, so the write runs beside the waiter instead of blocking launch.
        if let Some(mut stdin) = child.stdin.take() {
            let terminal_id = handle.id.clone();
            let payload = plan.stdin_payload;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    tracing::warn!(terminal_id = %terminal_id, error = %e, "Failed to write prompt to worker stdin");
                }
                // Dropping stdin closes the pipe so the worker sees EOF.
                drop(stdin);
            });
        }

        tokio::spawn(supervise(
            child,
            handle.clone(),
            readers,
            self.config.grace_period,
        ));

        handle
    }
}

/// Generate a process-unique terminal id for `role`.
pub fn next_terminal_id(role: &str) -> TerminalId {
    let seq = TERMINAL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{role}-{seq}-{}", Utc::now().timestamp_millis())
}

/// Stop a worker: SIGTERM to its process group, SIGKILL after the grace period.
///
/// Idempotent: on an already-terminal handle this returns its existing exit
/// code without signalling anything.
pub async fn terminate(handle: &TerminalHandle) -> TerminateOutcome {
    if handle.is_terminal() {
        return TerminateOutcome {
            killed: false,
            exit_code: handle.exit_code(),
        };
    }

    if handle.pid().is_none() {
        // Nothing to signal; the worker is not ours to kill.
        let applied = handle.transition(TerminalStatus::Killed, Some(signal_exit_code(15)), None);
        return TerminateOutcome {
            killed: applied,
            exit_code: handle.exit_code(),
        };
    }

    tracing::info!(terminal_id = %handle.id, "Terminating worker");
    handle.cancel_token().cancel();
    handle.wait_for_exit().await;

    TerminateOutcome {
        killed: handle.status() == TerminalStatus::Killed,
        exit_code: handle.exit_code(),
    }
}

/// Terminate every handle concurrently.
pub async fn terminate_all(handles: &[TerminalHandle]) -> Vec<TerminateOutcome> {
    futures::future::join_all(handles.iter().map(|h| terminate(h))).await
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R>(pipe: R, handle: TerminalHandle, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(pipe);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match stream {
                Stream::Stdout => handle.append_stdout(format!("{line}\n")),
                Stream::Stderr => handle.append_stderr(format!("{line}\n")),
            }
        }
    })
}

/// Owns the child until it is reaped, then records the outcome on `handle`.
async fn supervise(
    mut child: Child,
    handle: TerminalHandle,
    readers: Vec<JoinHandle<()>>,
    grace: Duration,
) {
    let pid = child.id();
    let cancel_token = handle.cancel_token().clone();

    tokio::select! {
        wait_result = child.wait() => {
            drain(readers).await;
            match wait_result {
                Ok(status) => {
                    let status_kind = classify_exit(status, cancel_token.is_cancelled());
                    handle.transition(status_kind, Some(exit_code_of(status)), None);
                }
                Err(e) => {
                    handle.transition(
                        TerminalStatus::Exited,
                        Some(SPAWN_FAILED_EXIT_CODE),
                        Some(format!("[chati] failed to wait for worker: {e}\n")),
                    );
                }
            }
        }
        _ = tokio::time::sleep(handle.timeout) => {
            tracing::warn!(
                terminal_id = %handle.id,
                timeout_secs = handle.timeout.as_secs_f64(),
                "Worker timed out"
            );
            handle.transition(
                TerminalStatus::Exited,
                Some(TIMEOUT_EXIT_CODE),
                Some(format!(
                    "[chati] worker timed out after {}s and was killed\n",
                    handle.timeout.as_secs_f64()
                )),
            );
            let _ = shutdown_child(&mut child, pid, grace).await;
            drain(readers).await;
        }
        _ = cancel_token.cancelled() => {
            let result = shutdown_child(&mut child, pid, grace).await;
            drain(readers).await;
            let code = match result {
                Ok(status) => exit_code_of(status),
                Err(_) => signal_exit_code(9),
            };
            // No-op when the monitor already expired this handle.
            handle.transition(TerminalStatus::Killed, Some(code), None);
        }
    }

    handle.mark_reaped();
}

/// Graceful-then-forced shutdown of the child's whole process group.
async fn shutdown_child(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return child.wait().await;
    };
    let pgid = Pid::from_raw(pid as i32);

    let _ = killpg(pgid, Signal::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(pid, "Worker ignored SIGTERM; sending SIGKILL");
            let _ = killpg(pgid, Signal::SIGKILL);
            child.wait().await
        }
    }
}

/// Wait for output readers to hit EOF, bounded so orphaned pipes cannot hang us.
async fn drain(readers: Vec<JoinHandle<()>>) {
    let all = futures::future::join_all(readers);
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, all).await;
}

/// A natural exit racing a termination request stays `Exited` unless the
/// process actually died from a signal.
fn classify_exit(status: ExitStatus, cancelled: bool) -> TerminalStatus {
    use std::os::unix::process::ExitStatusExt;
    if cancelled && status.signal().is_some() {
        TerminalStatus::Killed
    } else {
        TerminalStatus::Exited
    }
}

/// Exit code, or the shell convention `128 + signal` for signalled processes.
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(signal_exit_code))
        .unwrap_or(SPAWN_FAILED_EXIT_CODE)
}

fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spawner() -> Spawner {
        Spawner::new(SpawnerConfig::default(), Arc::new(WriteScopeTable::default()))
    }

    #[test]
    fn build_command_rejects_missing_role() {
        let err = spawner()
            .build_command(&LaunchRequest::new("", "T1"))
            .unwrap_err();
        assert!(matches!(err, LaunchError::MissingField { field: "role" }));
    }

    #[test]
    fn build_command_rejects_missing_task_id() {
        let err = spawner()
            .build_command(&LaunchRequest::new("dev", "  "))
            .unwrap_err();
        assert!(matches!(err, LaunchError::MissingField { field: "task_id" }));
    }

    #[test]
    fn build_command_sets_worker_environment() {
        let request = LaunchRequest::new("architect", "T7")
            .with_provider("claude")
            .with_model("opus")
            .with_prompt("design it")
            .with_context(json!({"phase": "planning"}));
        let plan = spawner().build_command(&request).unwrap();

        assert_eq!(plan.command, "claude");
        assert_eq!(plan.stdin_payload, "design it");
        assert_eq!(plan.env[ENV_AGENT], "architect");
        assert_eq!(plan.env[ENV_TASK_ID], "T7");
        assert_eq!(plan.env[ENV_PARALLEL], "true");
        assert_eq!(plan.env[ENV_TERMINAL_ID], plan.terminal_id);
        assert_eq!(plan.env["CHATI_WRITE_SCOPE"], ".chati/artifacts/3-Architecture/");
        assert_eq!(plan.env["CHATI_READ_SCOPE"], "*");
        assert_eq!(plan.env[ENV_CONTEXT], r#"{"phase":"planning"}"#);
        assert!(plan.args.contains(&"opus".to_string()));
    }

    #[test]
    fn build_command_falls_back_on_unknown_provider() {
        let plan = spawner()
            .build_command(&LaunchRequest::new("dev", "T1").with_provider("mystery-ai"))
            .unwrap();
        assert_eq!(plan.provider, Provider::Claude);
    }

    #[test]
    fn build_command_uses_command_override_and_request_timeout() {
        let mut config = SpawnerConfig::default();
        config
            .commands
            .insert(Provider::Gemini, "/opt/bin/gemini".to_string());
        let spawner = Spawner::new(config, Arc::new(WriteScopeTable::default()));
        let plan = spawner
            .build_command(
                &LaunchRequest::new("ux", "T2")
                    .with_provider("gemini")
                    .with_timeout(Duration::from_secs(42)),
            )
            .unwrap();
        assert_eq!(plan.command, "/opt/bin/gemini");
        assert_eq!(plan.timeout, Duration::from_secs(42));
    }

    #[test]
    fn terminal_ids_are_unique_under_rapid_generation() {
        let ids: std::collections::HashSet<_> =
            (0..500).map(|_| next_terminal_id("dev")).collect();
        assert_eq!(ids.len(), 500);
        assert!(ids.iter().all(|id| id.starts_with("dev-")));
    }

    #[test]
    fn preflight_rejects_overlapping_scopes() {
        let requests = vec![
            LaunchRequest::new("dev", "T1"),
            LaunchRequest::new("qa-implementation", "T2"),
        ];
        let err = spawner().preflight(&requests).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("dev"));
        assert!(message.contains("qa-implementation"));
        assert!(message.contains("test/"));
    }

    #[test]
    fn signalled_exit_uses_shell_convention() {
        assert_eq!(signal_exit_code(15), 143);
    }

    #[test]
    fn natural_exit_during_termination_stays_exited() {
        use std::os::unix::process::ExitStatusExt;
        // Raw wait statuses: exit code 0 is `0`, death by SIGTERM is `15`.
        let clean = ExitStatus::from_raw(0);
        let signalled = ExitStatus::from_raw(15);

        assert_eq!(classify_exit(clean, true), TerminalStatus::Exited);
        assert_eq!(classify_exit(clean, false), TerminalStatus::Exited);
        assert_eq!(classify_exit(signalled, true), TerminalStatus::Killed);
        assert_eq!(classify_exit(signalled, false), TerminalStatus::Exited);
    }
}
