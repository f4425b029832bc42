//! Poll-driven supervisor over a set of worker handles.
//!
//! [`Monitor`] does not rely solely on exit notifications. A periodic tick
//! re-reads every handle, enforces per-handle timeouts, recomputes an
//! aggregate [`StatusSnapshot`] and fans it out to registered callbacks. When
//! every handle is terminal the loop stops itself and fires the completion
//! callbacks exactly once.
//!
//! **Concurrency model:** the handle set and callback lists sit behind
//! `Mutex`es inside an `Arc`, so the monitor can be cloned into the poll task
//! and still queried from the caller. Callbacks are invoked after the locks
//! are released; a panicking callback is caught and logged so it cannot stop
//! the others or kill the poll task.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::types::{TerminalHandle, TerminalId, TerminalStatus};

/// Default time between poll ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub type ProgressCallback = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(&TerminalHandle) + Send + Sync>;

/// Aggregate view of the supervised handles at one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub total: usize,
    pub active: usize,
    /// Exited with code 0.
    pub completed: usize,
    /// Terminal with a non-zero code.
    pub failed: usize,
    /// Time since monitoring started.
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Callbacks {
    progress: Vec<ProgressCallback>,
    failure: Vec<FailureCallback>,
    complete: Vec<ProgressCallback>,
}

struct MonitorInner {
    handles: Mutex<Vec<TerminalHandle>>,
    poll_interval: Duration,
    callbacks: Mutex<Callbacks>,
    started_at: Mutex<Option<Instant>>,
    /// Handles already passed to failure callbacks.
    reported_failures: Mutex<HashSet<TerminalId>>,
    completed: AtomicBool,
    loop_token: Mutex<Option<CancellationToken>>,
    final_tx: watch::Sender<Option<StatusSnapshot>>,
}

/// Supervisor over a caller-managed set of [`TerminalHandle`]s.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new(handles: Vec<TerminalHandle>, poll_interval: Duration) -> Self {
        let (final_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(MonitorInner {
                handles: Mutex::new(handles),
                poll_interval,
                callbacks: Mutex::new(Callbacks::default()),
                started_at: Mutex::new(None),
                reported_failures: Mutex::new(HashSet::new()),
                completed: AtomicBool::new(false),
                loop_token: Mutex::new(None),
                final_tx,
            }),
        }
    }

    /// Add a handle to the supervised set.
    ///
    /// Watching a live handle after completion re-arms the monitor: `wait`
    /// blocks again and completion callbacks fire once more when the new set
    /// finishes. The poll loop has already stopped by then, so call `start`
    /// again (or drive `tick` manually).
    pub fn watch(&self, handle: TerminalHandle) {
        let live = !handle.is_terminal();
        self.inner.handles.lock().unwrap().push(handle);
        if live && self.inner.completed.swap(false, Ordering::SeqCst) {
            self.inner.final_tx.send_replace(None);
        }
    }

    pub fn handles(&self) -> Vec<TerminalHandle> {
        self.inner.handles.lock().unwrap().clone()
    }

    /// Called with a fresh snapshot on every tick.
    pub fn on_progress(&self, f: impl Fn(&StatusSnapshot) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().progress.push(Arc::new(f));
    }

    /// Called once per handle, on the first tick that sees it failed.
    pub fn on_failure(&self, f: impl Fn(&TerminalHandle) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().failure.push(Arc::new(f));
    }

    /// Called once with the final snapshot when every handle is terminal.
    pub fn on_complete(&self, f: impl Fn(&StatusSnapshot) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().complete.push(Arc::new(f));
    }

    /// Start the poll loop on the current tokio runtime. No-op if already running.
    pub fn start(&self) {
        let token = {
            let mut slot = self.inner.loop_token.lock().unwrap();
            if slot.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        self.mark_started();

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.inner.poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.tick();
                        if monitor.inner.completed.load(Ordering::SeqCst) {
                            monitor.stop();
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Monitor poll loop stopped");
        });
    }

    /// Stop the poll loop. No-op if it is not running.
    pub fn stop(&self) {
        if let Some(token) = self.inner.loop_token.lock().unwrap().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.loop_token.lock().unwrap().is_some()
    }

    /// Run one supervision pass and return the resulting snapshot.
    pub fn tick(&self) -> StatusSnapshot {
        self.mark_started();
        let handles = self.handles();

        for handle in &handles {
            if handle.status() == TerminalStatus::Running && handle.elapsed() >= handle.timeout {
                if handle.expire() {
                    tracing::warn!(
                        terminal_id = %handle.id,
                        role = %handle.role,
                        timeout_secs = handle.timeout.as_secs_f64(),
                        "Worker exceeded its timeout"
                    );
                }
            }
        }

        let snapshot = self.snapshot_of(&handles);
        tracing::debug!(
            active = snapshot.active,
            completed = snapshot.completed,
            failed = snapshot.failed,
            "Monitor tick"
        );

        let (progress, failure, complete) = {
            let callbacks = self.inner.callbacks.lock().unwrap();
            (
                callbacks.progress.clone(),
                callbacks.failure.clone(),
                callbacks.complete.clone(),
            )
        };

        for cb in &progress {
            invoke_guarded(|| cb(&snapshot));
        }

        let newly_failed: Vec<&TerminalHandle> = {
            let mut reported = self.inner.reported_failures.lock().unwrap();
            handles
                .iter()
                .filter(|h| h.is_failed() && reported.insert(h.id.clone()))
                .collect()
        };
        for handle in newly_failed {
            for cb in &failure {
                invoke_guarded(|| cb(handle));
            }
        }

        if snapshot.active == 0 && !self.inner.completed.swap(true, Ordering::SeqCst) {
            self.stop();
            tracing::info!(
                total = snapshot.total,
                completed = snapshot.completed,
                failed = snapshot.failed,
                "All workers finished"
            );
            for cb in &complete {
                invoke_guarded(|| cb(&snapshot));
            }
            self.inner.final_tx.send_replace(Some(snapshot));
        }

        snapshot
    }

    /// Current aggregate status without side effects.
    pub fn status(&self) -> StatusSnapshot {
        self.snapshot_of(&self.handles())
    }

    /// Vacuously true for an empty set.
    pub fn is_all_complete(&self) -> bool {
        self.inner
            .handles
            .lock()
            .unwrap()
            .iter()
            .all(TerminalHandle::is_terminal)
    }

    pub fn failed_terminals(&self) -> Vec<TerminalHandle> {
        self.inner
            .handles
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.is_failed())
            .cloned()
            .collect()
    }

    /// Resolves with the final snapshot once a tick observes completion.
    pub async fn wait(&self) -> StatusSnapshot {
        let mut rx = self.inner.final_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(snapshot) => snapshot.unwrap_or_else(|| self.status()),
            Err(_) => self.status(),
        }
    }

    fn mark_started(&self) {
        let mut started = self.inner.started_at.lock().unwrap();
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    fn snapshot_of(&self, handles: &[TerminalHandle]) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot {
            total: handles.len(),
            active: 0,
            completed: 0,
            failed: 0,
            elapsed_ms: self
                .inner
                .started_at
                .lock()
                .unwrap()
                .map_or(0, |s| s.elapsed().as_millis() as u64),
        };
        for handle in handles {
            if !handle.is_terminal() {
                snapshot.active += 1;
            } else if handle.is_failed() {
                snapshot.failed += 1;
            } else {
                snapshot.completed += 1;
            }
        }
        snapshot
    }
}

fn invoke_guarded(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("Monitor callback panicked; continuing with remaining callbacks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::orchestration::types::TIMEOUT_EXIT_CODE;

    fn handle(role: &str, timeout: Duration) -> TerminalHandle {
        TerminalHandle::detached(role, "T1", timeout)
    }

    #[test]
    fn empty_set_is_complete() {
        let monitor = Monitor::new(Vec::new(), DEFAULT_POLL_INTERVAL);
        assert!(monitor.is_all_complete());
        assert!(monitor.failed_terminals().is_empty());
    }

    #[test]
    fn tick_counts_completed_and_failed() {
        let a = handle("architect", Duration::from_secs(60));
        let b = handle("ux", Duration::from_secs(60));
        let c = handle("phases", Duration::from_secs(60));
        a.record_exit(0);
        b.record_exit(2);

        let monitor = Monitor::new(vec![a, b, c], DEFAULT_POLL_INTERVAL);
        let snap = monitor.tick();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert!(!monitor.is_all_complete());
    }

    #[test]
    fn watched_handles_join_the_set() {
        let monitor = Monitor::new(Vec::new(), DEFAULT_POLL_INTERVAL);
        let h = handle("qa-planning", Duration::from_secs(60));
        monitor.watch(h.clone());
        assert_eq!(monitor.status().active, 1);

        h.record_exit(0);
        let snap = monitor.status();
        assert_eq!((snap.total, snap.completed), (1, 1));
        assert!(monitor.is_all_complete());
    }

    #[test]
    fn tick_expires_overdue_handles() {
        let h = handle("dev", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        let monitor = Monitor::new(vec![h.clone()], DEFAULT_POLL_INTERVAL);

        monitor.tick();

        assert_eq!(h.status(), TerminalStatus::Exited);
        assert_eq!(h.exit_code(), Some(TIMEOUT_EXIT_CODE));
        assert!(h.stderr_text().contains("timed out"));
        assert_eq!(monitor.failed_terminals().len(), 1);
    }

    #[test]
    fn failure_callback_fires_once_per_handle() {
        let h = handle("dev", Duration::from_secs(60));
        let other = handle("ux", Duration::from_secs(60));
        h.record_exit(1);
        let monitor = Monitor::new(vec![h, other.clone()], DEFAULT_POLL_INTERVAL);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        monitor.on_failure(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        monitor.tick();
        monitor.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        other.record_exit(0);
        monitor.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let h = handle("dev", Duration::from_secs(60));
        h.record_exit(0);
        let monitor = Monitor::new(vec![h], DEFAULT_POLL_INTERVAL);

        let seen = Arc::new(AtomicUsize::new(0));
        monitor.on_progress(|_| panic!("listener bug"));
        let s = seen.clone();
        monitor.on_progress(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let s = seen.clone();
        monitor.on_complete(move |_| {
            s.fetch_add(10, Ordering::SeqCst);
        });

        monitor.tick();
        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn completion_fires_exactly_once() {
        let h = handle("dev", Duration::from_secs(60));
        h.record_exit(0);
        let monitor = Monitor::new(vec![h], DEFAULT_POLL_INTERVAL);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        monitor.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        monitor.tick();
        monitor.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let monitor = Monitor::new(
            vec![handle("dev", Duration::from_secs(60))],
            Duration::from_millis(10),
        );
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn watching_after_completion_rearms_wait() {
        let first = handle("architect", Duration::from_secs(60));
        first.record_exit(0);
        let monitor = Monitor::new(vec![first], Duration::from_millis(10));
        let completions = Arc::new(AtomicUsize::new(0));
        let c = completions.clone();
        monitor.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(monitor.tick().total, 1);
        assert_eq!(monitor.wait().await.total, 1);

        let second = handle("ux", Duration::from_secs(60));
        monitor.watch(second.clone());
        let pending = tokio::time::timeout(Duration::from_millis(50), monitor.wait()).await;
        assert!(pending.is_err(), "wait must not return the stale snapshot");

        monitor.start();
        second.record_exit(0);
        let snap = tokio::time::timeout(Duration::from_secs(2), monitor.wait())
            .await
            .expect("monitor should observe the new handle finishing");
        assert_eq!((snap.total, snap.completed), (2, 2));
        assert_eq!(completions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn watching_a_finished_handle_keeps_completion() {
        let monitor = Monitor::new(Vec::new(), DEFAULT_POLL_INTERVAL);
        monitor.tick();
        let done = handle("qa", Duration::from_secs(60));
        done.record_exit(0);
        monitor.watch(done);
        assert!(monitor.inner.completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn poll_loop_stops_itself_when_all_done() {
        let h = handle("dev", Duration::from_secs(60));
        let monitor = Monitor::new(vec![h.clone()], Duration::from_millis(10));
        monitor.start();

        h.record_exit(0);
        let snap = tokio::time::timeout(Duration::from_secs(2), monitor.wait())
            .await
            .expect("monitor should observe completion");
        assert_eq!(snap.completed, 1);
        assert!(!monitor.is_running());
    }
}
