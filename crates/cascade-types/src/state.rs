//! Checkpoint state.
//!
//! The snapshot persisted when a run pauses at a checkpoint node and
//! restored on resume. The engine does not prescribe how a store serializes
//! it, but everything needed to continue the walk is here: the workflow and
//! checkpoint names, the context, and the completed-step list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution state captured at a checkpoint node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Execution id of the paused run.
    pub exec_id: String,
    /// Name of the workflow that was running.
    pub workflow_name: String,
    /// Name of the checkpoint step that paused the run.
    pub checkpoint_name: String,
    /// Context at the pause point (JSON object).
    pub context: Value,
    /// Completed step names, most recent first.
    pub completed: Vec<String>,
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
