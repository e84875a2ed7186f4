//! Step descriptors and the step result protocol.
//!
//! A `StepDescriptor` is the immutable record of one operation in a
//! workflow: its name, kind, body (or kind-specific payload), dependencies,
//! and the retry/timeout/rollback policies that govern its execution. Step
//! bodies are first-class async callables speaking one result protocol:
//! `StepOutput::Ok` with a JSON object to merge, `StepOutput::Error`, or
//! `StepOutput::Halt` for a cooperative early exit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cascade_types::error::ErrorTag;
use cascade_types::retry::RetryPolicy;
use cascade_types::telemetry::OutcomeLabel;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::builder::Workflow;
use super::checkpoint::CheckpointStore;
use super::context::Context;
use super::services::Services;

// ---------------------------------------------------------------------------
// Result protocol
// ---------------------------------------------------------------------------

/// What a step body resolves to.
///
/// `Ok(Value::Null)` stands for "no contribution" and merges as an empty
/// map; an `Ok` payload that is neither `null` nor an object is rejected by
/// the runtime as an invalid return.
#[derive(Debug, Clone)]
pub enum StepOutput {
    /// Merge the carried object into the run context.
    Ok(Value),
    /// Abort the step (subject to retry, catch, fallback).
    Error(StepError),
    /// End the run early without rollback.
    Halt(Value),
}

impl StepOutput {
    /// An `Ok` output carrying the given fields.
    pub fn ok(fields: Value) -> Self {
        StepOutput::Ok(fields)
    }

    /// An `Ok` output with no contribution.
    pub fn empty() -> Self {
        StepOutput::Ok(Value::Null)
    }

    /// An untagged error.
    pub fn err(reason: impl Into<Value>) -> Self {
        StepOutput::Error(StepError::new(reason))
    }

    /// A tagged error.
    pub fn err_tagged(reason: impl Into<Value>, tag: ErrorTag) -> Self {
        StepOutput::Error(StepError::tagged(reason, tag))
    }

    /// A cooperative early exit.
    pub fn halt(reason: impl Into<Value>) -> Self {
        StepOutput::Halt(reason.into())
    }
}

/// A step failure: an opaque reason plus optional classification.
///
/// `step` overrides the failing-step name reported by the runtime (used by
/// parallel groups to attribute the failure to a substep), and `metadata`
/// is folded into the surfaced `RunError`.
#[derive(Debug, Clone)]
pub struct StepError {
    /// Opaque failure reason.
    pub reason: Value,
    /// Classification, when known.
    pub tag: Option<ErrorTag>,
    /// Name to attribute the failure to, when not the step itself.
    pub step: Option<String>,
    /// Extras folded into the surfaced error.
    pub metadata: HashMap<String, Value>,
}

impl StepError {
    pub fn new(reason: impl Into<Value>) -> Self {
        Self {
            reason: reason.into(),
            tag: None,
            step: None,
            metadata: HashMap::new(),
        }
    }

    pub fn tagged(reason: impl Into<Value>, tag: ErrorTag) -> Self {
        Self {
            reason: reason.into(),
            tag: Some(tag),
            step: None,
            metadata: HashMap::new(),
        }
    }

    /// The sentinel produced when cooperative cancellation interrupts a body.
    pub(crate) fn cancelled() -> Self {
        Self::tagged(json!("cancelled"), ErrorTag::Cancelled)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.tag == Some(ErrorTag::Cancelled)
    }

    pub(crate) fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Validate an `Ok` payload against the result protocol.
///
/// `null` is an empty contribution; an object is merged as-is; anything
/// else is an invalid return.
pub(crate) fn output_fields(value: Value) -> Result<Map<String, Value>, StepError> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(fields) => Ok(fields),
        other => Err(StepError::tagged(
            json!({ "invalid_step_return": other }),
            ErrorTag::InvalidStepReturn,
        )),
    }
}

/// Render a panic payload as a readable string.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Callable types
// ---------------------------------------------------------------------------

/// A boxed step body future.
pub type StepFuture = BoxFuture<'static, StepOutput>;

/// A step body: async function of the context and injected services.
pub type BodyFn = Arc<dyn Fn(Context, Services) -> StepFuture + Send + Sync>;

/// Conditional-execution predicate (`when`).
pub type WhenFn = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Maps a step failure into a replacement output.
pub type CatchFn = Arc<dyn Fn(&StepError) -> StepOutput + Send + Sync>;

/// Decides whether a failure is worth retrying.
pub type RetryIfFn = Arc<dyn Fn(&StepError) -> bool + Send + Sync>;

/// Compensation invoked during rollback.
pub type RollbackFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), Value>> + Send + Sync>;

/// Branch selector: maps the context to a route key.
pub type SelectorFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Context transform applied before running an embedded workflow.
pub type ContextMapFn = Arc<dyn Fn(&Context) -> Context + Send + Sync>;

/// Item extractor for `each`.
pub type ExtractorFn = Arc<dyn Fn(&Context) -> Result<Vec<Value>, Value> + Send + Sync>;

/// Value producer for `assign`.
pub type AssignFn = Arc<dyn Fn(&Context) -> Value + Send + Sync>;

/// Resource release for `using`: receives the final scoped context and the
/// body outcome, runs regardless of that outcome.
pub type ReleaseFn =
    Arc<dyn Fn(Context, Result<(), Value>) -> BoxFuture<'static, Result<(), Value>> + Send + Sync>;

/// Workflow-level cleanup, invoked once with the terminal outcome.
pub type EnsureFn = Arc<dyn Fn(OutcomeLabel) + Send + Sync>;

/// Continuation handed to a middleware.
pub type NextFn = Box<dyn FnOnce(Context) -> StepFuture + Send>;

/// A middleware wraps every body invocation: `(step_name, context, next)`.
/// First registered is outermost; it may short-circuit or transform.
pub type MiddlewareFn = Arc<dyn Fn(String, Context, NextFn) -> StepFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Step kinds and per-kind payloads
// ---------------------------------------------------------------------------

/// The kind of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Step,
    Validate,
    Require,
    Tap,
    Assign,
    Parallel,
    Branch,
    Embed,
    Each,
    Race,
    Using,
    Checkpoint,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Step => "step",
            StepKind::Validate => "validate",
            StepKind::Require => "require",
            StepKind::Tap => "tap",
            StepKind::Assign => "assign",
            StepKind::Parallel => "parallel",
            StepKind::Branch => "branch",
            StepKind::Embed => "embed",
            StepKind::Each => "each",
            StepKind::Race => "race",
            StepKind::Using => "using",
            StepKind::Checkpoint => "checkpoint",
        }
    }
}

/// Error mode for a parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelErrorMode {
    /// First error cancels outstanding substeps.
    FailFast,
    /// Await every substep; the first declared error surfaces afterwards.
    Continue,
}

/// Kind-specific payload interpreted by the runtime.
pub(crate) enum StepAction {
    Body(BodyFn),
    Parallel(ParallelSpec),
    Branch(BranchSpec),
    Embed(EmbedSpec),
    Each(EachSpec),
    Race(RaceSpec),
    Using(UsingSpec),
    Checkpoint(CheckpointSpec),
}

pub(crate) struct ParallelSpec {
    pub substeps: Vec<(String, BodyFn)>,
    pub on_error: ParallelErrorMode,
    pub timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
}

pub(crate) enum RouteTarget {
    Body(BodyFn),
    Workflow(Workflow),
}

pub(crate) struct BranchSpec {
    pub selector: SelectorFn,
    pub routes: Vec<(String, RouteTarget)>,
    pub fallback_route: Option<RouteTarget>,
}

pub(crate) struct EmbedSpec {
    pub workflow: Workflow,
    pub map_context: Option<ContextMapFn>,
}

pub(crate) struct EachSpec {
    pub extractor: ExtractorFn,
    pub item_workflow: Workflow,
    pub concurrency: usize,
    /// Key under which each item is exposed to the nested workflow.
    pub bind: String,
    /// Key under which the per-item outputs are gathered.
    pub collect: String,
}

pub(crate) struct RaceSpec {
    pub entrants: Vec<Workflow>,
    pub timeout: Option<Duration>,
}

pub(crate) struct UsingSpec {
    pub acquire: BodyFn,
    pub release: ReleaseFn,
    pub body: Workflow,
    pub bind: Option<String>,
}

pub(crate) struct CheckpointSpec {
    pub store: Arc<dyn CheckpointStore>,
}

// ---------------------------------------------------------------------------
// Policies carried on the descriptor
// ---------------------------------------------------------------------------

/// Retry behavior for one step: the delay policy plus an optional
/// retryable predicate (default: retry every error).
#[derive(Clone)]
pub struct RetrySpec {
    pub policy: RetryPolicy,
    pub(crate) retry_if: Option<RetryIfFn>,
}

impl RetrySpec {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_if: None,
        }
    }

    pub fn retry_if(mut self, pred: impl Fn(&StepError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Some(Arc::new(pred));
        self
    }

    pub(crate) fn should_retry(&self, error: &StepError) -> bool {
        match &self.retry_if {
            Some(pred) => pred(error),
            None => true,
        }
    }
}

impl fmt::Debug for RetrySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySpec")
            .field("policy", &self.policy)
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

/// A default value substituted when a step fails with a matching tag.
#[derive(Debug, Clone)]
pub struct Fallback {
    /// Object merged in place of the failed step's output.
    pub value: Value,
    /// Tags the fallback applies to; `None` matches any failure.
    pub tags: Option<Vec<ErrorTag>>,
}

impl Fallback {
    pub(crate) fn matches(&self, tag: Option<ErrorTag>) -> bool {
        match &self.tags {
            None => true,
            Some(tags) => tag.is_some_and(|t| tags.contains(&t)),
        }
    }
}

/// What to do when a step fails after local recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the run and roll back (default).
    #[default]
    Fail,
    /// Record the step as skipped and proceed.
    Skip,
    /// Record the error and proceed.
    Continue,
}

/// Declarative circuit-breaker tag. Enforced by outer wrappers, carried
/// untouched by the core walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub reset_after_ms: u64,
}

/// Declarative rate-limit tag. Enforced by outer wrappers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_per_interval: u32,
    pub interval_ms: u64,
}

// ---------------------------------------------------------------------------
// StepDescriptor
// ---------------------------------------------------------------------------

/// Immutable record of one operation in a workflow.
///
/// Descriptors are created by the builder and never mutated; the runtime
/// reads them through the frozen `Workflow`.
pub struct StepDescriptor {
    pub(crate) name: String,
    pub(crate) kind: StepKind,
    pub(crate) action: StepAction,
    pub(crate) after: Vec<String>,
    pub(crate) when: Option<WhenFn>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetrySpec>,
    pub(crate) catch: Option<CatchFn>,
    pub(crate) fallback: Option<Fallback>,
    pub(crate) rollback: Option<RollbackFn>,
    pub(crate) on_error: OnError,
    pub(crate) circuit: Option<CircuitPolicy>,
    pub(crate) rate_limit: Option<RateLimitPolicy>,
    pub(crate) metadata: HashMap<String, Value>,
}

impl StepDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    /// Explicitly declared predecessors (before implicit edge derivation).
    pub fn after(&self) -> &[String] {
        &self.after
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    pub fn circuit(&self) -> Option<&CircuitPolicy> {
        self.circuit.as_ref()
    }

    pub fn rate_limit(&self) -> Option<&RateLimitPolicy> {
        self.rate_limit.as_ref()
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("after", &self.after)
            .field("on_error", &self.on_error)
            .field("has_retry", &self.retry.is_some())
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
