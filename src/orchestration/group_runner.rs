//! End-to-end parallel step: launch, supervise, collect, validate, hand off.
//!
//! [`GroupRunner::run_step`] drives one attempt. [`GroupRunner::run_with_retries`]
//! repeats it through a [`CircuitBreaker`], treating an invalid result set as
//! a failed attempt, and stops as soon as the breaker refuses a call.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{BreakerStats, CircuitBreaker};
use super::collector::{
    ConsolidatedHandoff, GroupResults, ResultValidation, build_consolidated_handoff,
    collect_results, merge_handoffs, validate_results,
};
use super::monitor::Monitor;
use super::spawner::{Spawner, terminate_all};
use super::types::LaunchRequest;
use crate::error::{BreakerError, LaunchError};

/// Everything produced by one attempt.
#[derive(Clone, Debug, Serialize)]
pub struct StepOutcome {
    pub group_id: String,
    pub results: GroupResults,
    pub validation: ResultValidation,
    pub handoff: ConsolidatedHandoff,
    /// Workers were terminated by a shutdown request.
    pub interrupted: bool,
}

/// Why an attempt counts as failed.
#[derive(Debug, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Group {} produced invalid results", .0.group_id)]
    Invalid(Box<StepOutcome>),

    #[error("Group {} was interrupted", .0.group_id)]
    Interrupted(Box<StepOutcome>),
}

/// Summary of a retried run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub attempts: u32,
    /// The last attempt that got as far as collecting results.
    pub outcome: Option<StepOutcome>,
    pub valid: bool,
    pub breaker: BreakerStats,
}

pub struct GroupRunner {
    spawner: Spawner,
    poll_interval: Duration,
    breaker: CircuitBreaker,
    max_attempts: u32,
    shutdown: CancellationToken,
}

impl GroupRunner {
    pub fn new(
        spawner: Spawner,
        poll_interval: Duration,
        breaker: CircuitBreaker,
        max_attempts: u32,
    ) -> Self {
        Self {
            spawner,
            poll_interval,
            breaker,
            max_attempts: max_attempts.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token terminates any running group.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run one parallel step for `requests` and hand off to `next_role`.
    pub async fn run_step(
        &self,
        requests: &[LaunchRequest],
        next_role: &str,
    ) -> Result<StepOutcome, StepFailure> {
        let group = self.spawner.launch_group(requests).await?;

        let monitor = Monitor::new(group.handles.clone(), self.poll_interval);
        let group_id = group.id.clone();
        monitor.on_progress(move |snap| {
            tracing::info!(
                group_id = %group_id,
                active = snap.active,
                completed = snap.completed,
                failed = snap.failed,
                elapsed_ms = snap.elapsed_ms,
                "Group progress"
            );
        });
        monitor.on_failure(|handle| {
            tracing::warn!(
                terminal_id = %handle.id,
                role = %handle.role,
                exit_code = ?handle.exit_code(),
                "Worker failed"
            );
        });
        monitor.start();

        let interrupted = tokio::select! {
            _ = monitor.wait() => false,
            _ = self.shutdown.cancelled() => {
                tracing::warn!(group_id = %group.id, "Shutdown requested; terminating workers");
                monitor.stop();
                terminate_all(&group.handles).await;
                true
            }
        };

        let results = collect_results(&group.id, &group.handles);
        let validation = validate_results(&results.results);
        let merged = merge_handoffs(&results.results, self.spawner.scopes());
        let handoff =
            build_consolidated_handoff(merged.merged.then_some(&merged), next_role);

        tracing::info!(
            group_id = %group.id,
            succeeded = results.summary.succeeded,
            failed = results.summary.failed,
            valid = validation.valid,
            "Group finished"
        );

        let outcome = StepOutcome {
            group_id: group.id,
            results,
            validation,
            handoff,
            interrupted,
        };

        if interrupted {
            Err(StepFailure::Interrupted(Box::new(outcome)))
        } else if !outcome.validation.valid {
            Err(StepFailure::Invalid(Box::new(outcome)))
        } else {
            Ok(outcome)
        }
    }

    /// Run the step up to `max_attempts` times through the breaker.
    ///
    /// Pre-launch errors (bad requests, scope conflicts) are returned without
    /// any attempt being made.
    pub async fn run_with_retries(
        &self,
        requests: &[LaunchRequest],
        next_role: &str,
    ) -> Result<RunReport, LaunchError> {
        self.spawner.preflight(requests)?;

        let mut attempts = 0;
        let mut last = None;
        let mut valid = false;

        while attempts < self.max_attempts && !self.shutdown.is_cancelled() {
            attempts += 1;
            tracing::info!(attempt = attempts, max_attempts = self.max_attempts, "Running parallel step");

            match self
                .breaker
                .execute(|| self.run_step(requests, next_role))
                .await
            {
                Ok(outcome) => {
                    last = Some(outcome);
                    valid = true;
                    break;
                }
                Err(BreakerError::Operation(StepFailure::Invalid(outcome))) => {
                    tracing::warn!(
                        attempt = attempts,
                        errors = outcome.validation.errors.len(),
                        "Parallel step produced invalid results"
                    );
                    last = Some(*outcome);
                }
                Err(BreakerError::Operation(StepFailure::Interrupted(outcome))) => {
                    last = Some(*outcome);
                    break;
                }
                Err(BreakerError::Operation(StepFailure::Launch(e))) => return Err(e),
                Err(rejected) => {
                    tracing::warn!(attempt = attempts, error = %rejected, "Parallel step not attempted");
                    attempts -= 1;
                    break;
                }
            }
        }

        Ok(RunReport {
            attempts,
            outcome: last,
            valid,
            breaker: self.breaker.stats(),
        })
    }
}
