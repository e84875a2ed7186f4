//! Structured run errors.
//!
//! A failed run surfaces exactly one `RunError`: the failing step, its
//! reason, the error tag, the context snapshot at the point of failure,
//! attempt accounting, and the outcomes of every compensation that ran
//! during rollback.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Classification of a failure reason.
///
/// Tags drive local recovery (`fallback` matching, retry predicates) and
/// recoverability checks; the reason value itself stays opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    /// Builder-level failure: cycle, missing predecessor, duplicate name.
    InvalidGraph,
    /// A body returned something outside the result protocol.
    InvalidStepReturn,
    /// Per-step or per-run deadline exceeded.
    Timeout,
    /// A branch selector panicked or failed.
    SelectorError,
    /// A branch key matched no route and no default was given.
    NoMatchingBranch,
    /// An embedded workflow failed.
    NestedWorkflowFailed,
    /// An `each` item failed.
    IterationFailed,
    /// Every race participant failed.
    RaceAllFailed,
    /// No race participant finished in time.
    RaceTimeout,
    /// `using` acquisition failed.
    AcquireFailed,
    /// `using` release failed (after a successful body).
    ReleaseFailed,
    /// A step body panicked.
    BodyFailed,
    /// The checkpoint store rejected the state.
    CheckpointStoreFailed,
    /// No registered checkpoint store had state for the execution.
    CheckpointNotFound,
    /// A checkpoint belonged to a different workflow.
    WorkflowMismatch,
    /// Retries were exhausted.
    MaxAttemptsExceeded,
    /// A transient failure worth retrying.
    Transient,
    /// The operation was rate limited.
    RateLimited,
    /// The run was cancelled cooperatively.
    Cancelled,
}

impl ErrorTag {
    /// Whether a failure with this tag is worth retrying by default.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorTag::Timeout | ErrorTag::RateLimited | ErrorTag::Transient
        )
    }
}

/// Outcome of one failed compensation during rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackError {
    /// The step whose compensation failed.
    pub step: String,
    /// The compensation's failure reason.
    pub reason: Value,
}

/// The structured failure of a workflow run.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("step '{step}' failed after {attempts} attempt(s): {reason}")]
pub struct RunError {
    /// Name of the failing step (`dag` for build-time failures).
    pub step: String,
    /// Opaque failure reason as returned by the step.
    pub reason: Value,
    /// Classification of the failure, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<ErrorTag>,
    /// Context snapshot at the point of failure (JSON object).
    pub context: Value,
    /// Attempts made before surfacing (1 when no retry policy applied).
    pub attempts: u32,
    /// Wall-clock duration of the failing step in milliseconds.
    pub duration_ms: u64,
    /// Failed compensations collected by the rollback coordinator.
    #[serde(default)]
    pub rollback_errors: Vec<RollbackError>,
    /// Execution id of the run.
    pub exec_id: String,
    /// Name of the workflow that was running.
    pub workflow_name: String,
    /// Kind-specific extras (e.g. the nested error of an embed failure).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl RunError {
    /// Build a minimal error for `step` with the given reason; the runtime
    /// fills in context, timing, and identifiers.
    pub fn new(step: impl Into<String>, reason: Value) -> Self {
        Self {
            step: step.into(),
            reason,
            tag: None,
            context: Value::Null,
            attempts: 1,
            duration_ms: 0,
            rollback_errors: Vec::new(),
            exec_id: String::new(),
            workflow_name: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a tag.
    pub fn with_tag(mut self, tag: ErrorTag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Whether this failure is recoverable: the tag is one of
    /// `timeout`, `rate_limited`, `transient`.
    pub fn is_recoverable(&self) -> bool {
        self.tag.is_some_and(ErrorTag::is_recoverable)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
