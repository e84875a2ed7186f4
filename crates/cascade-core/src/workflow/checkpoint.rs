//! Checkpoint stores.
//!
//! A checkpoint step persists the run's execution state through a pluggable
//! key-value store and pauses the walk; `Runtime::resume` probes the
//! registered stores and continues after the checkpoint node. The engine
//! treats the stored state as opaque beyond the fields of
//! [`CheckpointState`]; serialization is the store's business.

use chrono::Utc;

use cascade_types::state::CheckpointState;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use thiserror::Error;

use super::context::Context;

/// Errors from checkpoint persistence and restore.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The store rejected the state.
    #[error("checkpoint store error: {0}")]
    Store(String),

    /// No state exists for the execution id.
    #[error("no checkpoint found for execution '{0}'")]
    NotFound(String),

    /// The loaded state belongs to a different workflow.
    #[error("checkpoint belongs to workflow '{actual}', expected '{expected}'")]
    WorkflowMismatch { expected: String, actual: String },

    /// The persisted context could not be restored.
    #[error("failed to restore checkpoint state: {0}")]
    Restore(String),
}

/// A pluggable execution-state store keyed by execution id.
///
/// Object-safe so workflows can carry heterogeneous stores; implementations
/// capture what they need and return boxed futures.
pub trait CheckpointStore: Send + Sync {
    /// Persist `state` under `exec_id`, replacing any prior state.
    fn store(
        &self,
        exec_id: &str,
        state: &CheckpointState,
    ) -> BoxFuture<'static, Result<(), CheckpointError>>;

    /// Load the state stored under `exec_id`.
    fn load(&self, exec_id: &str) -> BoxFuture<'static, Result<CheckpointState, CheckpointError>>;
}

/// Build the state snapshot persisted at a checkpoint node.
pub(crate) fn build_state(
    exec_id: &str,
    workflow_name: &str,
    checkpoint_name: &str,
    ctx: &Context,
    completed: &[String],
) -> CheckpointState {
    CheckpointState {
        exec_id: exec_id.to_string(),
        workflow_name: workflow_name.to_string(),
        checkpoint_name: checkpoint_name.to_string(),
        context: ctx.to_value(),
        completed: completed.to_vec(),
        timestamp: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// In-memory reference store
// ---------------------------------------------------------------------------

/// In-memory checkpoint store.
///
/// The reference implementation used by tests and demos; production callers
/// plug in their own durable store behind the same trait.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: DashMap<String, CheckpointState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop the state for an execution, if any.
    pub fn remove(&self, exec_id: &str) -> Option<CheckpointState> {
        self.states.remove(exec_id).map(|(_, state)| state)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn store(
        &self,
        exec_id: &str,
        state: &CheckpointState,
    ) -> BoxFuture<'static, Result<(), CheckpointError>> {
        self.states.insert(exec_id.to_string(), state.clone());
        Box::pin(async { Ok(()) })
    }

    fn load(&self, exec_id: &str) -> BoxFuture<'static, Result<CheckpointState, CheckpointError>> {
        let result = self
            .states
            .get(exec_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| CheckpointError::NotFound(exec_id.to_string()));
        Box::pin(async move { result })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
