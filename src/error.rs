use std::path::PathBuf;
use std::time::Duration;

use crate::isolation::ScopeConflict;

/// Errors related to configuration and plan loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}

/// Errors raised before any worker process is created.
///
/// Everything that can go wrong after a handle exists (spawn failure, timeout,
/// scope violation) is recorded on the handle instead.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Launch request is missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("{}", format_conflicts(.conflicts))]
    IsolationConflict { conflicts: Vec<ScopeConflict> },
}

/// Errors returned by [`crate::orchestration::circuit_breaker::CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker is open; retry in {}ms", .retry_after.as_millis())]
    Open { retry_after: Duration },

    #[error("Circuit breaker is half-open and a trial call is already in flight")]
    TrialInFlight,

    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True when the guarded operation was never invoked.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Operation(_))
    }
}

fn format_conflicts(conflicts: &[ScopeConflict]) -> String {
    let pairs: Vec<String> = conflicts
        .iter()
        .map(|c| format!("{} <-> {} on {}", c.role_a, c.role_b, c.path))
        .collect();
    format!("Write scope conflict: {}", pairs.join("; "))
}
