//! Result collection and handoff consolidation for a finished group.
//!
//! Nothing in here returns an error: collection is the terminal reporting
//! step of a parallel run, so malformed or missing input degrades to empty
//! results or a placeholder handoff rather than a failure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::TerminalHandle;
use crate::isolation::WriteScopeTable;
use crate::isolation::violation::ViolationDetector;

/// `from` field of a consolidated handoff.
pub const PARALLEL_GROUP_ORIGIN: &str = "parallel-group";
/// Stdout line prefix a worker uses to declare its handoff.
pub const HANDOFF_MARKER: &str = "CHATI_HANDOFF";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// What a worker said it produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredHandoff {
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub decisions: BTreeMap<String, Value>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Read-only projection of one finished worker.
#[derive(Clone, Debug, Serialize)]
pub struct CollectedResult {
    pub terminal_id: String,
    pub role: String,
    pub task_id: String,
    pub model: Option<String>,
    pub status: ResultStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub handoff: DeclaredHandoff,
}

impl CollectedResult {
    pub fn from_handle(handle: &TerminalHandle) -> Self {
        let exit_code = handle.exit_code();
        let stdout = handle.stdout_text();
        let handoff = handle
            .handoff_line()
            .and_then(|line| parse_declared_handoff(&line))
            .unwrap_or_default();
        Self {
            terminal_id: handle.id.clone(),
            role: handle.role.clone(),
            task_id: handle.task_id.clone(),
            model: handle.model.clone(),
            status: if exit_code == Some(0) {
                ResultStatus::Success
            } else {
                ResultStatus::Failed
            },
            exit_code,
            stdout,
            stderr: handle.stderr_text(),
            duration_ms: handle.elapsed().as_millis() as u64,
            handoff,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct GroupResults {
    pub group_id: String,
    pub results: Vec<CollectedResult>,
    pub summary: ResultSummary,
}

/// Project every handle into a [`CollectedResult`] and tally outcomes.
pub fn collect_results(group_id: &str, handles: &[TerminalHandle]) -> GroupResults {
    let results: Vec<CollectedResult> = handles.iter().map(CollectedResult::from_handle).collect();
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    GroupResults {
        group_id: group_id.to_string(),
        summary: ResultSummary {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        },
        results,
    }
}

/// Union of every member's outputs, decisions and blockers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MergedHandoff {
    pub merged: bool,
    pub outputs: Vec<String>,
    /// Keys are `<role>.<key>`.
    pub decisions: BTreeMap<String, Value>,
    pub blockers: Vec<String>,
    pub summary: String,
}

/// Merge member handoffs in input order.
///
/// A member that declared no outputs contributes its role's write scope as
/// its artifact list.
pub fn merge_handoffs(results: &[CollectedResult], scopes: &WriteScopeTable) -> MergedHandoff {
    if results.is_empty() {
        return MergedHandoff::default();
    }

    let mut merged = MergedHandoff {
        merged: true,
        ..Default::default()
    };
    let mut lines = Vec::with_capacity(results.len());

    for result in results {
        let declared = &result.handoff;
        if declared.outputs.is_empty() {
            merged
                .outputs
                .extend(scopes.get(&result.role).iter().cloned());
        } else {
            merged.outputs.extend(declared.outputs.iter().cloned());
        }

        for (key, value) in &declared.decisions {
            merged
                .decisions
                .insert(format!("{}.{key}", result.role), value.clone());
        }
        merged.blockers.extend(declared.blockers.iter().cloned());

        let line = match &declared.summary {
            Some(summary) => summary.clone(),
            None if result.is_success() => format!("Completed task {}", result.task_id),
            None => format!(
                "Failed task {} (exit code {})",
                result.task_id,
                result
                    .exit_code
                    .map_or_else(|| "none".to_string(), |c| c.to_string())
            ),
        };
        lines.push(format!("{}: {line}", result.role));
    }

    merged.summary = lines.join("\n");
    merged
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Complete,
    Partial,
}

/// The single handoff handed to the next pipeline step.
#[derive(Clone, Debug, Serialize)]
pub struct ConsolidatedHandoff {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    pub status: HandoffStatus,
    pub outputs: Vec<String>,
    pub decisions: BTreeMap<String, Value>,
    pub blockers: Vec<String>,
    pub summary: String,
}

/// Build the handoff for `next_role`. `None` yields a placeholder marked partial.
pub fn build_consolidated_handoff(
    merged: Option<&MergedHandoff>,
    next_role: &str,
) -> ConsolidatedHandoff {
    let Some(merged) = merged else {
        return ConsolidatedHandoff {
            from: PARALLEL_GROUP_ORIGIN.to_string(),
            to: next_role.to_string(),
            timestamp: Utc::now(),
            status: HandoffStatus::Partial,
            outputs: Vec::new(),
            decisions: BTreeMap::new(),
            blockers: vec!["No merged results available from parallel group".to_string()],
            summary: "Parallel group produced no collectable results".to_string(),
        };
    };

    ConsolidatedHandoff {
        from: PARALLEL_GROUP_ORIGIN.to_string(),
        to: next_role.to_string(),
        timestamp: Utc::now(),
        status: if merged.blockers.is_empty() {
            HandoffStatus::Complete
        } else {
            HandoffStatus::Partial
        },
        outputs: merged.outputs.clone(),
        decisions: merged.decisions.clone(),
        blockers: merged.blockers.clone(),
        summary: merged.summary.clone(),
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ResultValidation {
    pub valid: bool,
    pub missing: Vec<String>,
    pub errors: Vec<String>,
}

/// Flag incomplete results, failed workers and self-reported scope violations.
///
/// A scope violation is reported separately from (and in addition to) an
/// exit-code failure of the same worker.
pub fn validate_results(results: &[CollectedResult]) -> ResultValidation {
    validate_results_with(results, &ViolationDetector::default())
}

/// [`validate_results`] with a caller-supplied violation detector.
pub fn validate_results_with(
    results: &[CollectedResult],
    detector: &ViolationDetector,
) -> ResultValidation {
    let mut report = ResultValidation::default();

    for (index, result) in results.iter().enumerate() {
        for (field, value) in [
            ("terminal_id", &result.terminal_id),
            ("role", &result.role),
            ("task_id", &result.task_id),
        ] {
            if value.trim().is_empty() {
                report.missing.push(format!("result[{index}] missing {field}"));
            }
        }

        if !result.is_success() {
            report.errors.push(format!(
                "Terminal {} ({}) failed with exit code {}",
                result.terminal_id,
                result.role,
                result
                    .exit_code
                    .map_or_else(|| "none".to_string(), |c| c.to_string())
            ));
        }

        for line in detector.scan(&result.stderr) {
            report.errors.push(format!(
                "Write scope violation by terminal {} ({}): {line}",
                result.terminal_id, result.role
            ));
        }
    }

    report.valid = report.missing.is_empty() && report.errors.is_empty();
    report
}

/// Find the last `CHATI_HANDOFF {json}` line in a worker's stdout.
pub fn parse_declared_handoff(stdout: &str) -> Option<DeclaredHandoff> {
    let payload = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim_start().strip_prefix(HANDOFF_MARKER))?;

    match serde_json::from_str(payload.trim()) {
        Ok(handoff) => Some(handoff),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring malformed handoff declaration");
            None
        }
    }
}
