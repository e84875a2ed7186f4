//! Execution reports.
//!
//! A reporting run returns the terminal outcome together with a `RunReport`:
//! one row per visited step in execution order, plus run-level totals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Overall state of a workflow run.
///
/// `Completed`, `Failed`, and `Cancelled` are sinks. `Paused` is reachable
/// from `Running` via a checkpoint and returns to `Running` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Whether this state is a sink.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

/// Outcome of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
    Skipped,
    RolledBack,
}

/// Outcome of a step's compensation during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Ok,
    Error,
}

/// Report row for one step, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name.
    pub name: String,
    /// Final status of the step.
    pub status: StepStatus,
    /// Wall-clock duration in milliseconds (0 for skipped steps).
    pub duration_ms: u64,
    /// Attempts made (0 for skipped steps).
    pub attempts: u32,
    /// Context keys this step added or overwrote.
    #[serde(default)]
    pub added_keys: Vec<String>,
    /// Failure reason, when the step errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
    /// Compensation outcome, when the step was rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStatus>,
}

/// Per-run execution report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Name of the workflow that ran.
    pub workflow_name: String,
    /// Execution id of the run.
    pub exec_id: String,
    /// Terminal (or paused) state of the run.
    pub state: RunState,
    /// Step rows in execution order.
    pub steps: Vec<StepReport>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished (None while paused).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Total wall-clock duration in milliseconds.
    pub total_duration_ms: u64,
}

impl RunReport {
    /// Number of steps that completed successfully.
    pub fn ok_count(&self) -> usize {
        self.count(StepStatus::Ok)
    }

    /// Number of steps that failed.
    pub fn error_count(&self) -> usize {
        self.count(StepStatus::Error)
    }

    /// Number of steps that were skipped.
    pub fn skipped_count(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    /// Number of steps whose compensation ran.
    pub fn rolled_back_count(&self) -> usize {
        self.count(StepStatus::RolledBack)
    }

    /// Total attempts across all steps.
    pub fn total_attempts(&self) -> u32 {
        self.steps.iter().map(|s| s.attempts).sum()
    }

    /// Look up the row for a step by name.
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
