//! The workflow runtime.
//!
//! `Runtime` executes a frozen `Workflow`: it walks the graph in stable
//! topological order, dispatches each node through the middleware stack to
//! its kind-specific executor, merges results into the context, and tracks
//! completions for rollback. Failures trigger the rollback coordinator;
//! `halt` ends the run early without rollback; checkpoint nodes persist
//! state and pause. Cancellation is cooperative: every suspension point
//! observes the run's token, and `cancel` rolls back completed work.
//!
//! # Execution flow
//!
//! 1. Mint a random execution id and register the cancellation token.
//! 2. Emit `run.start`, fire `on_start` hooks.
//! 3. Walk nodes in topological order (skip on `when`, retry per policy,
//!    recover via catch/fallback/on_error).
//! 4. Finalize: hooks, rollback on failure, `ensure` callbacks, `run.stop`.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cascade_types::config::EngineConfig;
use cascade_types::error::{ErrorTag, RunError};
use cascade_types::report::{RollbackStatus, RunReport, RunState, StepReport, StepStatus};
use cascade_types::state::CheckpointState;
use cascade_types::telemetry::{OutcomeLabel, TelemetryEvent, TelemetrySignal};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::builder::Workflow;
use super::checkpoint;
use super::context::Context;
use super::retry;
use super::rollback;
use super::services::Services;
use super::step::{
    NextFn, StepAction, StepDescriptor, StepFuture, StepKind, StepOutput, output_fields,
};
use super::step_runner;
use crate::telemetry::{self as telemetry_mod, TelemetryBus};

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Per-run options.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Deadline for the whole run; elapsing rolls back and fails with a
    /// `timeout` tag.
    pub timeout: Option<Duration>,
    /// Log step results at debug level.
    pub debug: bool,
    /// Services overriding the workflow-level registration for this run.
    pub services: Option<Services>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Terminal result of `run` / `resume`.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every node finished; the final context.
    Completed(Context),
    /// A step failed beyond recovery; rollback has already run.
    Failed(Box<RunError>),
    /// A body requested a cooperative early exit; no rollback.
    Halted(Value),
    /// A checkpoint node persisted state and paused the run.
    Checkpointed {
        exec_id: String,
        checkpoint: String,
        context: Context,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }

    /// The final context of a completed or checkpointed run.
    pub fn context(&self) -> Option<&Context> {
        match self {
            RunOutcome::Completed(ctx) => Some(ctx),
            RunOutcome::Checkpointed { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The error of a failed run.
    pub fn error(&self) -> Option<&RunError> {
        match self {
            RunOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-run shared state
// ---------------------------------------------------------------------------

/// Immutable per-run state shared by the walk and every nested executor.
#[derive(Clone)]
pub(crate) struct RunCore {
    pub exec_id: String,
    pub cancel: CancellationToken,
    pub timed_out: Arc<AtomicBool>,
    pub telemetry: TelemetryBus,
    pub services: Services,
    pub config: EngineConfig,
    pub debug: bool,
}

impl RunCore {
    pub fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(event);
    }

    /// A copy of this core driven by a different cancellation token; used
    /// by `race` to stop losers without cancelling the run.
    pub fn with_cancel(self: &Arc<Self>, cancel: CancellationToken) -> Arc<RunCore> {
        Arc::new(RunCore {
            cancel,
            ..(**self).clone()
        })
    }
}

/// Details of the node failure that aborted a walk.
pub(crate) struct StepFailureInfo {
    /// The walked node's name.
    pub node: String,
    /// The name the failure is attributed to (a parallel substep may
    /// differ from the node).
    pub step: String,
    pub reason: Value,
    pub tag: Option<ErrorTag>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub metadata: HashMap<String, Value>,
}

/// How a walk ended.
pub(crate) enum WalkEnd {
    Done,
    Halted(Value),
    Failed(StepFailureInfo),
    Paused {
        checkpoint: String,
        state: CheckpointState,
    },
    Cancelled,
}

/// The full result of walking one workflow.
pub(crate) struct WalkResult {
    pub ctx: Context,
    /// Completed step names, most recent first.
    pub completed: Vec<String>,
    pub steps: Vec<StepReport>,
    pub end: WalkEnd,
}

/// Resume bookkeeping: nodes to skip and the position to start from.
pub(crate) struct ResumeSkip {
    pub done: HashSet<String>,
    pub start_pos: usize,
}

// ---------------------------------------------------------------------------
// The walk
// ---------------------------------------------------------------------------

/// Walk `workflow` in stable topological order.
///
/// Boxed so the kind executors (embed, each, race, using) can recurse into
/// nested workflows.
pub(crate) fn execute_workflow(
    core: Arc<RunCore>,
    workflow: Arc<Workflow>,
    mut ctx: Context,
    mut completed: Vec<String>,
    resume: Option<ResumeSkip>,
) -> BoxFuture<'static, WalkResult> {
    Box::pin(async move {
        let mut rows: Vec<StepReport> = Vec::new();
        let (start_pos, done) = match resume {
            Some(skip) => (skip.start_pos, skip.done),
            None => (0, HashSet::new()),
        };

        for pos in start_pos..workflow.plan.order.len() {
            let index = workflow.plan.order[pos];
            let step = workflow.steps[index].clone();
            let name = step.name.clone();
            if done.contains(&name) {
                continue;
            }

            if core.cancel.is_cancelled() {
                return WalkResult {
                    ctx,
                    completed,
                    steps: rows,
                    end: WalkEnd::Cancelled,
                };
            }

            // Conditional execution.
            if let Some(when) = &step.when {
                let proceed =
                    match std::panic::catch_unwind(AssertUnwindSafe(|| when(&ctx))) {
                        Ok(proceed) => proceed,
                        Err(_) => {
                            tracing::warn!(
                                step = name.as_str(),
                                "when predicate panicked; skipping step"
                            );
                            false
                        }
                    };
                if !proceed {
                    core.emit(
                        TelemetryEvent::new(
                            TelemetrySignal::StepSkip,
                            workflow.name(),
                            &core.exec_id,
                        )
                        .with_step(name.clone())
                        .with_result(OutcomeLabel::Skipped),
                    );
                    rows.push(skipped_row(&name, None));
                    continue;
                }
            }

            // Checkpoint nodes pause the walk; they bypass middleware and
            // retry.
            if let StepAction::Checkpoint(spec) = &step.action {
                let started = Instant::now();
                core.emit(
                    TelemetryEvent::new(
                        TelemetrySignal::StepStart,
                        workflow.name(),
                        &core.exec_id,
                    )
                    .with_step(name.clone())
                    .with_attempt(1),
                );
                let state = checkpoint::build_state(
                    &core.exec_id,
                    workflow.name(),
                    &name,
                    &ctx,
                    &completed,
                );
                let stored = tokio::select! {
                    stored = spec.store.store(&core.exec_id, &state) => stored,
                    _ = core.cancel.cancelled() => {
                        core.emit(step_cancel_event(&core, &workflow, &name));
                        return WalkResult { ctx, completed, steps: rows, end: WalkEnd::Cancelled };
                    }
                };
                let duration = started.elapsed();
                match stored {
                    Ok(()) => {
                        core.emit(
                            TelemetryEvent::new(
                                TelemetrySignal::StepStop,
                                workflow.name(),
                                &core.exec_id,
                            )
                            .with_step(name.clone())
                            .with_attempt(1)
                            .with_duration(duration)
                            .with_result(OutcomeLabel::Ok),
                        );
                        rows.push(StepReport {
                            name: name.clone(),
                            status: StepStatus::Ok,
                            duration_ms: duration.as_millis() as u64,
                            attempts: 1,
                            added_keys: Vec::new(),
                            reason: None,
                            rollback: None,
                        });
                        tracing::info!(
                            exec_id = core.exec_id.as_str(),
                            checkpoint = name.as_str(),
                            "run paused at checkpoint"
                        );
                        return WalkResult {
                            ctx,
                            completed,
                            steps: rows,
                            end: WalkEnd::Paused {
                                checkpoint: name,
                                state,
                            },
                        };
                    }
                    Err(err) => {
                        let reason = json!({ "checkpoint_store_failed": err.to_string() });
                        rows.push(StepReport {
                            name: name.clone(),
                            status: StepStatus::Error,
                            duration_ms: duration.as_millis() as u64,
                            attempts: 1,
                            added_keys: Vec::new(),
                            reason: Some(reason.clone()),
                            rollback: None,
                        });
                        return WalkResult {
                            ctx,
                            completed,
                            steps: rows,
                            end: WalkEnd::Failed(StepFailureInfo {
                                node: name.clone(),
                                step: name,
                                reason,
                                tag: Some(ErrorTag::CheckpointStoreFailed),
                                attempts: 1,
                                duration_ms: duration.as_millis() as u64,
                                metadata: HashMap::new(),
                            }),
                        };
                    }
                }
            }

            // Regular dispatch: middleware-wrapped executor under the retry
            // loop.
            let started = Instant::now();
            core.emit(
                TelemetryEvent::new(TelemetrySignal::StepStart, workflow.name(), &core.exec_id)
                    .with_step(name.clone())
                    .with_attempt(1),
            );
            let call = build_call(core.clone(), workflow.clone(), step.clone());
            let attempt_ctx = ctx.clone();
            let run_attempt = move || call(attempt_ctx.clone());
            let attempt_timeout = step
                .timeout
                .or(core.config.default_step_timeout_ms.map(Duration::from_millis));
            let on_retry = {
                let core = core.clone();
                let workflow = workflow.clone();
                let name = name.clone();
                move |attempt: u32, error: &super::step::StepError, delay_ms: u64| {
                    tracing::debug!(
                        exec_id = core.exec_id.as_str(),
                        step = name.as_str(),
                        attempt,
                        delay_ms,
                        reason = %error.reason,
                        "retrying step"
                    );
                    core.emit(
                        TelemetryEvent::new(
                            TelemetrySignal::StepRetry,
                            workflow.name(),
                            &core.exec_id,
                        )
                        .with_step(name.clone())
                        .with_attempt(attempt)
                        .with_duration(Duration::from_millis(delay_ms)),
                    );
                }
            };

            let settled = retry::execute_with_retry(
                run_attempt,
                step.retry.as_ref(),
                attempt_timeout,
                &core.cancel,
                on_retry,
            )
            .await;
            let Some(settled) = settled else {
                core.emit(step_cancel_event(&core, &workflow, &name));
                return WalkResult {
                    ctx,
                    completed,
                    steps: rows,
                    end: WalkEnd::Cancelled,
                };
            };
            let attempts = settled.attempts;
            let duration = started.elapsed();
            let mut output = settled.output;

            // Local recovery: catch handler, then fallback value.
            if let StepOutput::Error(error) = &output {
                if !error.is_cancelled() {
                    if let Some(catch) = &step.catch {
                        match std::panic::catch_unwind(AssertUnwindSafe(|| catch(error))) {
                            Ok(replacement) => output = replacement,
                            Err(_) => tracing::warn!(
                                step = name.as_str(),
                                "catch handler panicked; keeping original error"
                            ),
                        }
                    }
                }
            }
            if let StepOutput::Error(error) = &output {
                if !error.is_cancelled() {
                    if let Some(fallback) = &step.fallback {
                        if fallback.matches(error.tag) {
                            tracing::debug!(
                                step = name.as_str(),
                                "substituting fallback value"
                            );
                            output = StepOutput::Ok(fallback.value.clone());
                        }
                    }
                }
            }

            // Validate Ok payloads against the result protocol.
            if let StepOutput::Ok(value) = output {
                output = match output_fields(value) {
                    Ok(fields) => StepOutput::Ok(Value::Object(fields)),
                    Err(invalid) => StepOutput::Error(invalid),
                };
            }

            match output {
                StepOutput::Ok(value) => {
                    let fields = match value {
                        Value::Object(fields) => fields,
                        _ => Default::default(),
                    };
                    let added = ctx.merge(fields);
                    completed.insert(0, name.clone());
                    if core.debug {
                        tracing::debug!(
                            exec_id = core.exec_id.as_str(),
                            step = name.as_str(),
                            added = ?added,
                            "step completed"
                        );
                    }
                    core.emit(
                        TelemetryEvent::new(
                            TelemetrySignal::StepStop,
                            workflow.name(),
                            &core.exec_id,
                        )
                        .with_step(name.clone())
                        .with_attempt(attempts)
                        .with_duration(duration)
                        .with_result(OutcomeLabel::Ok),
                    );
                    rows.push(StepReport {
                        name,
                        status: StepStatus::Ok,
                        duration_ms: duration.as_millis() as u64,
                        attempts,
                        added_keys: added,
                        reason: None,
                        rollback: None,
                    });
                }
                StepOutput::Halt(reason) => {
                    core.emit(
                        TelemetryEvent::new(
                            TelemetrySignal::StepStop,
                            workflow.name(),
                            &core.exec_id,
                        )
                        .with_step(name.clone())
                        .with_attempt(attempts)
                        .with_duration(duration)
                        .with_result(OutcomeLabel::Halted),
                    );
                    rows.push(StepReport {
                        name,
                        status: StepStatus::Ok,
                        duration_ms: duration.as_millis() as u64,
                        attempts,
                        added_keys: Vec::new(),
                        reason: None,
                        rollback: None,
                    });
                    return WalkResult {
                        ctx,
                        completed,
                        steps: rows,
                        end: WalkEnd::Halted(reason),
                    };
                }
                StepOutput::Error(error) => {
                    if error.is_cancelled() {
                        core.emit(step_cancel_event(&core, &workflow, &name));
                        return WalkResult {
                            ctx,
                            completed,
                            steps: rows,
                            end: WalkEnd::Cancelled,
                        };
                    }
                    let signal = if error.tag == Some(ErrorTag::BodyFailed) {
                        TelemetrySignal::StepException
                    } else {
                        TelemetrySignal::StepStop
                    };
                    match step.on_error {
                        super::step::OnError::Fail => {
                            core.emit(
                                TelemetryEvent::new(signal, workflow.name(), &core.exec_id)
                                    .with_step(name.clone())
                                    .with_attempt(attempts)
                                    .with_duration(duration)
                                    .with_result(OutcomeLabel::Error),
                            );
                            rows.push(StepReport {
                                name: name.clone(),
                                status: StepStatus::Error,
                                duration_ms: duration.as_millis() as u64,
                                attempts,
                                added_keys: Vec::new(),
                                reason: Some(error.reason.clone()),
                                rollback: None,
                            });
                            return WalkResult {
                                ctx,
                                completed,
                                steps: rows,
                                end: WalkEnd::Failed(StepFailureInfo {
                                    node: name.clone(),
                                    step: error.step.unwrap_or(name),
                                    reason: error.reason,
                                    tag: error.tag,
                                    attempts,
                                    duration_ms: duration.as_millis() as u64,
                                    metadata: error.metadata,
                                }),
                            };
                        }
                        super::step::OnError::Skip => {
                            tracing::warn!(
                                step = name.as_str(),
                                reason = %error.reason,
                                "step failed; skipping per policy"
                            );
                            core.emit(
                                TelemetryEvent::new(
                                    TelemetrySignal::StepSkip,
                                    workflow.name(),
                                    &core.exec_id,
                                )
                                .with_step(name.clone())
                                .with_attempt(attempts)
                                .with_result(OutcomeLabel::Skipped),
                            );
                            rows.push(skipped_row(&name, Some(error.reason)));
                        }
                        super::step::OnError::Continue => {
                            tracing::warn!(
                                step = name.as_str(),
                                reason = %error.reason,
                                "step failed; continuing per policy"
                            );
                            core.emit(
                                TelemetryEvent::new(signal, workflow.name(), &core.exec_id)
                                    .with_step(name.clone())
                                    .with_attempt(attempts)
                                    .with_duration(duration)
                                    .with_result(OutcomeLabel::Error),
                            );
                            rows.push(StepReport {
                                name: name.clone(),
                                status: StepStatus::Error,
                                duration_ms: duration.as_millis() as u64,
                                attempts,
                                added_keys: Vec::new(),
                                reason: Some(error.reason),
                                rollback: None,
                            });
                        }
                    }
                }
            }
        }

        WalkResult {
            ctx,
            completed,
            steps: rows,
            end: WalkEnd::Done,
        }
    })
}

fn skipped_row(name: &str, reason: Option<Value>) -> StepReport {
    StepReport {
        name: name.to_string(),
        status: StepStatus::Skipped,
        duration_ms: 0,
        attempts: 0,
        added_keys: Vec::new(),
        reason,
        rollback: None,
    }
}

fn step_cancel_event(core: &RunCore, workflow: &Workflow, step: &str) -> TelemetryEvent {
    TelemetryEvent::new(TelemetrySignal::StepCancel, workflow.name(), &core.exec_id)
        .with_step(step.to_string())
}

/// Wrap the node's executor in the middleware stack; the first registered
/// middleware ends up outermost.
fn build_call(
    core: Arc<RunCore>,
    workflow: Arc<Workflow>,
    step: Arc<StepDescriptor>,
) -> Arc<dyn Fn(Context) -> StepFuture + Send + Sync> {
    Arc::new(move |ctx: Context| {
        let mut next: NextFn = {
            let core = core.clone();
            let workflow = workflow.clone();
            let step = step.clone();
            Box::new(move |c: Context| step_runner::dispatch_kind(core, workflow, step, c))
        };
        for middleware in workflow.middleware.iter().rev() {
            let middleware = middleware.clone();
            let name = step.name.clone();
            let inner = next;
            next = Box::new(move |c: Context| middleware(name, c, inner));
        }
        next(ctx)
    })
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Executes workflows; one instance can drive many concurrent runs.
pub struct Runtime {
    config: EngineConfig,
    telemetry: TelemetryBus,
    active_runs: DashMap<String, CancellationToken>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Runtime {
    /// A runtime emitting to the process-wide telemetry bus.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            telemetry: telemetry_mod::global().clone(),
            config,
            active_runs: DashMap::new(),
        }
    }

    /// A runtime emitting to a dedicated bus.
    pub fn with_telemetry(config: EngineConfig, telemetry: TelemetryBus) -> Self {
        Self {
            config,
            telemetry,
            active_runs: DashMap::new(),
        }
    }

    /// A runtime with its own bus, sized from the config.
    pub fn with_isolated_telemetry(config: EngineConfig) -> Self {
        let telemetry = TelemetryBus::new(config.telemetry_capacity);
        Self::with_telemetry(config, telemetry)
    }

    pub fn telemetry(&self) -> &TelemetryBus {
        &self.telemetry
    }

    /// Execute `workflow` from the beginning.
    pub async fn run(
        &self,
        workflow: &Workflow,
        initial: Context,
        options: RunOptions,
    ) -> RunOutcome {
        self.run_with_report(workflow, initial, options).await.0
    }

    /// Execute `workflow` and return the per-step report alongside the
    /// outcome.
    pub async fn run_with_report(
        &self,
        workflow: &Workflow,
        initial: Context,
        options: RunOptions,
    ) -> (RunOutcome, RunReport) {
        let exec_id = Uuid::new_v4().to_string();
        self.drive(workflow, initial, options, exec_id, Vec::new(), None)
            .await
    }

    /// Resume a checkpointed run.
    ///
    /// Probes each registered checkpoint store in declaration order; the
    /// first loaded state wins.
    pub async fn resume(
        &self,
        workflow: &Workflow,
        exec_id: &str,
        options: RunOptions,
    ) -> RunOutcome {
        self.resume_with_report(workflow, exec_id, options).await.0
    }

    pub async fn resume_with_report(
        &self,
        workflow: &Workflow,
        exec_id: &str,
        options: RunOptions,
    ) -> (RunOutcome, RunReport) {
        let mut state = None;
        for (checkpoint_name, store) in &workflow.checkpoints {
            match store.load(exec_id).await {
                Ok(loaded) => {
                    state = Some(loaded);
                    break;
                }
                Err(err) => tracing::debug!(
                    checkpoint = checkpoint_name.as_str(),
                    error = %err,
                    "no state in checkpoint store"
                ),
            }
        }
        let Some(state) = state else {
            return self.failed_before_start(
                workflow,
                exec_id,
                json!({ "checkpoint_not_found": exec_id }),
                ErrorTag::CheckpointNotFound,
            );
        };

        if state.workflow_name != workflow.name() {
            return self.failed_before_start(
                workflow,
                exec_id,
                json!({
                    "workflow_mismatch": {
                        "expected": workflow.name(),
                        "actual": state.workflow_name,
                    }
                }),
                ErrorTag::WorkflowMismatch,
            );
        }

        let Some(pos) = workflow
            .plan
            .order
            .iter()
            .position(|&i| workflow.steps[i].name == state.checkpoint_name)
        else {
            return self.failed_before_start(
                workflow,
                exec_id,
                json!({
                    "workflow_mismatch": {
                        "expected": workflow.name(),
                        "unknown_checkpoint": state.checkpoint_name,
                    }
                }),
                ErrorTag::WorkflowMismatch,
            );
        };

        let ctx = match Context::from_value(state.context.clone()) {
            Ok(ctx) => ctx,
            Err(err) => {
                return self.failed_before_start(
                    workflow,
                    exec_id,
                    json!({ "checkpoint_restore_failed": err.to_string() }),
                    ErrorTag::CheckpointStoreFailed,
                );
            }
        };

        let done: HashSet<String> = state.completed.iter().cloned().collect();
        tracing::info!(
            exec_id,
            workflow = workflow.name(),
            checkpoint = state.checkpoint_name.as_str(),
            completed = state.completed.len(),
            "resuming workflow run"
        );
        self.drive(
            workflow,
            ctx,
            options,
            exec_id.to_string(),
            state.completed,
            Some(ResumeSkip {
                done,
                start_pos: pos + 1,
            }),
        )
        .await
    }

    /// Signal a running execution to stop. Returns whether the id was
    /// active.
    pub fn cancel(&self, exec_id: &str) -> bool {
        match self.active_runs.get(exec_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(exec_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    // -- internals ----------------------------------------------------------

    async fn drive(
        &self,
        workflow: &Workflow,
        initial: Context,
        options: RunOptions,
        exec_id: String,
        completed: Vec<String>,
        resume: Option<ResumeSkip>,
    ) -> (RunOutcome, RunReport) {
        let cancel = CancellationToken::new();
        self.active_runs.insert(exec_id.clone(), cancel.clone());
        let services = match &options.services {
            Some(overrides) => workflow.services.overridden_by(overrides),
            None => workflow.services.clone(),
        };
        let core = Arc::new(RunCore {
            exec_id: exec_id.clone(),
            cancel: cancel.clone(),
            timed_out: Arc::new(AtomicBool::new(false)),
            telemetry: self.telemetry.clone(),
            services,
            config: self.config.clone(),
            debug: options.debug,
        });
        let workflow = Arc::new(workflow.clone());

        let started_at = Utc::now();
        let started = Instant::now();
        core.emit(TelemetryEvent::new(
            TelemetrySignal::RunStart,
            workflow.name(),
            &exec_id,
        ));
        workflow.hooks.fire_start(workflow.name(), &initial);
        tracing::info!(
            exec_id = exec_id.as_str(),
            workflow = workflow.name(),
            "starting workflow run"
        );

        let watchdog = options.timeout.map(|limit| {
            let cancel = cancel.clone();
            let timed_out = core.timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        });

        let walk =
            execute_workflow(core.clone(), workflow.clone(), initial, completed, resume).await;

        if let Some(handle) = watchdog {
            handle.abort();
        }

        let result = self
            .finalize(&core, &workflow, walk, started_at, started)
            .await;
        self.active_runs.remove(&exec_id);
        result
    }

    async fn finalize(
        &self,
        core: &Arc<RunCore>,
        workflow: &Arc<Workflow>,
        walk: WalkResult,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> (RunOutcome, RunReport) {
        let WalkResult {
            ctx,
            completed,
            mut steps,
            end,
        } = walk;

        match end {
            WalkEnd::Done => {
                workflow.hooks.fire_complete(workflow.name(), &ctx);
                run_ensure(workflow, OutcomeLabel::Ok);
                core.emit(
                    TelemetryEvent::new(TelemetrySignal::RunStop, workflow.name(), &core.exec_id)
                        .with_duration(started.elapsed())
                        .with_result(OutcomeLabel::Ok),
                );
                tracing::info!(
                    exec_id = core.exec_id.as_str(),
                    workflow = workflow.name(),
                    "workflow run completed"
                );
                let report = self.report(core, workflow, RunState::Completed, steps, started_at, started, true);
                (RunOutcome::Completed(ctx), report)
            }
            WalkEnd::Halted(reason) => {
                run_ensure(workflow, OutcomeLabel::Halted);
                core.emit(
                    TelemetryEvent::new(TelemetrySignal::RunStop, workflow.name(), &core.exec_id)
                        .with_duration(started.elapsed())
                        .with_result(OutcomeLabel::Halted),
                );
                tracing::info!(
                    exec_id = core.exec_id.as_str(),
                    workflow = workflow.name(),
                    reason = %reason,
                    "workflow run halted"
                );
                let report = self.report(core, workflow, RunState::Completed, steps, started_at, started, true);
                (RunOutcome::Halted(reason), report)
            }
            WalkEnd::Paused { checkpoint, state } => {
                // Not terminal: no completion hooks, no ensure, no run.stop.
                let report =
                    self.report(core, workflow, RunState::Paused, steps, started_at, started, false);
                (
                    RunOutcome::Checkpointed {
                        exec_id: state.exec_id,
                        checkpoint,
                        context: ctx,
                    },
                    report,
                )
            }
            WalkEnd::Failed(info) => {
                let targets = rollback_targets(workflow, &completed, &info);
                let mut error = RunError {
                    step: info.step,
                    reason: info.reason,
                    tag: info.tag,
                    context: ctx.to_value(),
                    attempts: info.attempts,
                    duration_ms: info.duration_ms,
                    rollback_errors: Vec::new(),
                    exec_id: core.exec_id.clone(),
                    workflow_name: workflow.name().to_string(),
                    metadata: info.metadata,
                };
                workflow.hooks.fire_error(&error.step, &error.reason, &ctx);
                error.rollback_errors =
                    rollback::rollback_completed(core, workflow, &targets, &ctx).await;
                mark_rolled_back(&mut steps, &targets, workflow, &error);
                run_ensure(workflow, OutcomeLabel::Error);
                core.emit(
                    TelemetryEvent::new(TelemetrySignal::RunStop, workflow.name(), &core.exec_id)
                        .with_duration(started.elapsed())
                        .with_result(OutcomeLabel::Error),
                );
                tracing::error!(
                    exec_id = core.exec_id.as_str(),
                    workflow = workflow.name(),
                    step = error.step.as_str(),
                    reason = %error.reason,
                    "workflow run failed"
                );
                let report = self.report(core, workflow, RunState::Failed, steps, started_at, started, true);
                (RunOutcome::Failed(Box::new(error)), report)
            }
            WalkEnd::Cancelled => {
                let timed_out = core.timed_out.load(Ordering::SeqCst);
                let (reason, tag, state) = if timed_out {
                    (json!("timeout"), ErrorTag::Timeout, RunState::Failed)
                } else {
                    (json!("cancelled"), ErrorTag::Cancelled, RunState::Cancelled)
                };
                let mut error = RunError {
                    step: "run".to_string(),
                    reason,
                    tag: Some(tag),
                    context: ctx.to_value(),
                    attempts: 1,
                    duration_ms: started.elapsed().as_millis() as u64,
                    rollback_errors: Vec::new(),
                    exec_id: core.exec_id.clone(),
                    workflow_name: workflow.name().to_string(),
                    metadata: HashMap::new(),
                };
                workflow.hooks.fire_error(&error.step, &error.reason, &ctx);
                error.rollback_errors =
                    rollback::rollback_completed(core, workflow, &completed, &ctx).await;
                mark_rolled_back(&mut steps, &completed, workflow, &error);
                run_ensure(workflow, OutcomeLabel::Error);
                core.emit(
                    TelemetryEvent::new(TelemetrySignal::RunStop, workflow.name(), &core.exec_id)
                        .with_duration(started.elapsed())
                        .with_result(OutcomeLabel::Error),
                );
                tracing::warn!(
                    exec_id = core.exec_id.as_str(),
                    workflow = workflow.name(),
                    timed_out,
                    "workflow run cancelled"
                );
                let report = self.report(core, workflow, state, steps, started_at, started, true);
                (RunOutcome::Failed(Box::new(error)), report)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        core: &RunCore,
        workflow: &Workflow,
        state: RunState,
        steps: Vec<StepReport>,
        started_at: DateTime<Utc>,
        started: Instant,
        finished: bool,
    ) -> RunReport {
        RunReport {
            workflow_name: workflow.name().to_string(),
            exec_id: core.exec_id.clone(),
            state,
            steps,
            started_at,
            finished_at: finished.then(Utc::now),
            total_duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed_before_start(
        &self,
        workflow: &Workflow,
        exec_id: &str,
        reason: Value,
        tag: ErrorTag,
    ) -> (RunOutcome, RunReport) {
        let error = RunError {
            step: "checkpoint".to_string(),
            reason,
            tag: Some(tag),
            context: Value::Null,
            attempts: 1,
            duration_ms: 0,
            rollback_errors: Vec::new(),
            exec_id: exec_id.to_string(),
            workflow_name: workflow.name().to_string(),
            metadata: HashMap::new(),
        };
        let now = Utc::now();
        let report = RunReport {
            workflow_name: workflow.name().to_string(),
            exec_id: exec_id.to_string(),
            state: RunState::Failed,
            steps: Vec::new(),
            started_at: now,
            finished_at: Some(now),
            total_duration_ms: 0,
        };
        (RunOutcome::Failed(Box::new(error)), report)
    }
}

/// Which steps the rollback coordinator compensates.
///
/// Normally the completed set, already in reverse-completion order. A
/// failed parallel group or `each` with partially completed work is
/// prepended: the substeps' (or items') results were never merged, so the
/// node's own compensation is the remaining way to undo their effects.
pub(crate) fn rollback_targets(
    workflow: &Workflow,
    completed: &[String],
    failure: &StepFailureInfo,
) -> Vec<String> {
    let mut targets = completed.to_vec();
    let partial = failure
        .metadata
        .get("completed_before_failure")
        .and_then(Value::as_array)
        .is_some_and(|names| !names.is_empty());
    if partial {
        if let Some(step) = workflow.step(&failure.node) {
            if matches!(step.kind(), StepKind::Parallel | StepKind::Each) && step.has_rollback() {
                targets.insert(0, failure.node.clone());
            }
        }
    }
    targets
}

/// Mark report rows of rolled-back steps.
fn mark_rolled_back(
    rows: &mut [StepReport],
    targets: &[String],
    workflow: &Workflow,
    error: &RunError,
) {
    for name in targets {
        let Some(step) = workflow.step(name) else {
            continue;
        };
        if !step.has_rollback() {
            continue;
        }
        if let Some(row) = rows.iter_mut().find(|row| row.name == *name) {
            if row.status == StepStatus::Ok {
                row.status = StepStatus::RolledBack;
            }
            row.rollback = Some(
                if error.rollback_errors.iter().any(|e| e.step == *name) {
                    RollbackStatus::Error
                } else {
                    RollbackStatus::Ok
                },
            );
        }
    }
}

/// Run `ensure` callbacks once with the terminal outcome; failures are
/// swallowed and logged.
fn run_ensure(workflow: &Workflow, outcome: OutcomeLabel) {
    for cleanup in &workflow.ensure {
        if std::panic::catch_unwind(AssertUnwindSafe(|| cleanup(outcome))).is_err() {
            tracing::warn!(workflow = workflow.name(), "ensure callback panicked");
        }
    }
}

/// Surface a builder failure in the runtime's error shape.
impl super::builder::GraphError {
    pub fn into_run_error(self, workflow_name: &str) -> RunError {
        RunError {
            step: "dag".to_string(),
            reason: json!(self.to_string()),
            tag: Some(ErrorTag::InvalidGraph),
            context: Value::Null,
            attempts: 1,
            duration_ms: 0,
            rollback_errors: Vec::new(),
            exec_id: String::new(),
            workflow_name: workflow_name.to_string(),
            metadata: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::builder::{StepBuilder, Workflow};
    use crate::workflow::checkpoint::MemoryCheckpointStore;
    use crate::workflow::step::OnError;
    use cascade_types::retry::RetryPolicy;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    fn runtime() -> Runtime {
        Runtime::with_telemetry(EngineConfig::default(), TelemetryBus::new(256))
    }

    // -----------------------------------------------------------------------
    // Linear success
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_success_with_report() {
        let wf = Workflow::builder("linear")
            .add(StepBuilder::validate("check", |ctx| {
                if ctx.get("x") == Some(&json!(5)) {
                    Ok(())
                } else {
                    Err(json!("x must be 5"))
                }
            }))
            .step("double", |ctx| {
                let x = ctx.get("x").and_then(Value::as_i64).unwrap_or(0);
                async move { StepOutput::ok(json!({"y": x * 2})) }
            })
            .step("save", |_| async { StepOutput::empty() })
            .build()
            .unwrap();

        let (outcome, report) = runtime()
            .run_with_report(
                &wf,
                Context::new().with("x", json!(5)),
                RunOptions::default(),
            )
            .await;

        let ctx = match outcome {
            RunOutcome::Completed(ctx) => ctx,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(ctx.get("x"), Some(&json!(5)));
        assert_eq!(ctx.get("y"), Some(&json!(10)));

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.ok_count(), 3);
        assert_eq!(report.step("double").unwrap().added_keys, vec!["y"]);
    }

    #[tokio::test]
    async fn test_empty_workflow_returns_initial_context() {
        let wf = Workflow::builder("empty").build().unwrap();
        let initial = Context::new().with("seed", json!(1));
        let outcome = runtime().run(&wf, initial.clone(), RunOptions::default()).await;
        match outcome {
            RunOutcome::Completed(ctx) => assert_eq!(ctx, initial),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nil_body_records_completion() {
        let wf = Workflow::builder("wf")
            .step("noop", |_| async { StepOutput::empty() })
            .build()
            .unwrap();
        let (outcome, report) = runtime()
            .run_with_report(&wf, Context::new(), RunOptions::default())
            .await;
        assert!(outcome.is_completed());
        let row = report.step("noop").unwrap();
        assert_eq!(row.status, StepStatus::Ok);
        assert!(row.added_keys.is_empty());
    }

    // -----------------------------------------------------------------------
    // Failure with rollback (saga ordering)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_failure_rolls_back_in_reverse_completion_order() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let wf = Workflow::builder("orders")
            .add(
                StepBuilder::run("reserve", |_| async {
                    StepOutput::ok(json!({"reservation": "r-1"}))
                })
                .rollback({
                    let log = log.clone();
                    move |_| {
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push("unreserve");
                            Ok(())
                        }
                    }
                }),
            )
            .add(
                StepBuilder::run("charge", |_| async {
                    StepOutput::ok(json!({"charge_id": "c-1"}))
                })
                .rollback({
                    let log = log.clone();
                    move |_| {
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push("refund");
                            Ok(())
                        }
                    }
                }),
            )
            .step("ship", |_| async { StepOutput::err(json!("ship_failed")) })
            .build()
            .unwrap();

        let (outcome, report) = runtime()
            .run_with_report(&wf, Context::new(), RunOptions::default())
            .await;

        let error = outcome.error().expect("expected failure");
        assert_eq!(error.step, "ship");
        assert_eq!(error.reason, json!("ship_failed"));
        assert!(error.rollback_errors.is_empty());
        assert_eq!(error.context["charge_id"], json!("c-1"));

        assert_eq!(*log.lock().unwrap(), vec!["refund", "unreserve"]);
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(
            report.step("charge").unwrap().status,
            StepStatus::RolledBack
        );
        assert_eq!(
            report.step("charge").unwrap().rollback,
            Some(RollbackStatus::Ok)
        );
        assert_eq!(report.step("ship").unwrap().status, StepStatus::Error);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_aggregated() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("reserve", |_| async { StepOutput::empty() })
                    .rollback(|_| async { Err(json!("unreserve_unavailable")) }),
            )
            .step("boom", |_| async { StepOutput::err(json!("bad")) })
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.rollback_errors.len(), 1);
        assert_eq!(error.rollback_errors[0].step, "reserve");
        assert_eq!(error.rollback_errors[0].reason, json!("unreserve_unavailable"));
    }

    // -----------------------------------------------------------------------
    // Halt
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_halt_ends_run_without_rollback() {
        let rolled_back = Arc::new(AtomicU32::new(0));
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("first", |_| async { StepOutput::ok(json!({"a": 1})) }).rollback({
                    let rolled_back = rolled_back.clone();
                    move |_| {
                        let rolled_back = rolled_back.clone();
                        async move {
                            rolled_back.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }
                }),
            )
            .step("stop", |_| async { StepOutput::halt(json!("maintenance")) })
            .step("unreached", |_| async {
                StepOutput::ok(json!({"never": true}))
            })
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        match outcome {
            RunOutcome::Halted(reason) => assert_eq!(reason, json!("maintenance")),
            other => panic!("expected halt, got {other:?}"),
        }
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let attempts_seen = Arc::new(AtomicU32::new(0));
        let wf = {
            let attempts_seen = attempts_seen.clone();
            Workflow::builder("wf")
                .add(
                    StepBuilder::run("flaky", move |_| {
                        let n = attempts_seen.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if n < 2 {
                                StepOutput::err_tagged(json!("transient"), ErrorTag::Transient)
                            } else {
                                StepOutput::ok(json!({"value": 7}))
                            }
                        }
                    })
                    .retry(RetryPolicy::fixed(3, 10)),
                )
                .build()
                .unwrap()
        };

        let (outcome, report) = runtime()
            .run_with_report(&wf, Context::new(), RunOptions::default())
            .await;

        match outcome {
            RunOutcome::Completed(ctx) => assert_eq!(ctx.get("value"), Some(&json!(7))),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(report.step("flaky").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("always-bad", |_| async {
                    StepOutput::err_tagged(json!("transient"), ErrorTag::Transient)
                })
                .retry(RetryPolicy::fixed(3, 5)),
            )
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.attempts, 3);
        assert_eq!(error.tag, Some(ErrorTag::Transient));
    }

    // -----------------------------------------------------------------------
    // Local recovery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_catch_handler_recovers() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("fragile", |_| async { StepOutput::err(json!("boom")) })
                    .catch(|err| StepOutput::ok(json!({"recovered_from": err.reason.clone()}))),
            )
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        match outcome {
            RunOutcome::Completed(ctx) => {
                assert_eq!(ctx.get("recovered_from"), Some(&json!("boom")));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fallback_applies_on_matching_tag() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("slow", |_| async {
                    StepOutput::err_tagged(json!("timeout"), ErrorTag::Timeout)
                })
                .fallback_on(json!({"cached": true}), vec![ErrorTag::Timeout]),
            )
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        match outcome {
            RunOutcome::Completed(ctx) => assert_eq!(ctx.get("cached"), Some(&json!(true))),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fallback_ignores_non_matching_tag() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("bad", |_| async {
                    StepOutput::err_tagged(json!("rate_limited"), ErrorTag::RateLimited)
                })
                .fallback_on(json!({"cached": true}), vec![ErrorTag::Timeout]),
            )
            .build()
            .unwrap();

        assert!(runtime()
            .run(&wf, Context::new(), RunOptions::default())
            .await
            .is_failed());
    }

    #[tokio::test]
    async fn test_on_error_skip_proceeds() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("optional", |_| async { StepOutput::err(json!("nope")) })
                    .on_error(OnError::Skip),
            )
            .step("after", |_| async { StepOutput::ok(json!({"after": 1})) })
            .build()
            .unwrap();

        let (outcome, report) = runtime()
            .run_with_report(&wf, Context::new(), RunOptions::default())
            .await;
        assert!(outcome.is_completed());
        assert_eq!(report.step("optional").unwrap().status, StepStatus::Skipped);
        assert_eq!(report.step("after").unwrap().status, StepStatus::Ok);
    }

    #[tokio::test]
    async fn test_invalid_step_return_fails() {
        let wf = Workflow::builder("wf")
            .step("weird", |_| async { StepOutput::ok(json!([1, 2, 3])) })
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.tag, Some(ErrorTag::InvalidStepReturn));
    }

    // -----------------------------------------------------------------------
    // Sugar kinds: validate, require, tap, assign
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_validate_failure_fails_run() {
        let wf = Workflow::builder("wf")
            .add(StepBuilder::validate("check", |ctx| {
                if ctx.contains_key("x") {
                    Ok(())
                } else {
                    Err(json!("x is required"))
                }
            }))
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.step, "check");
        assert_eq!(error.reason, json!("x is required"));
    }

    #[tokio::test]
    async fn test_require_passes_and_contributes_nothing() {
        let wf = Workflow::builder("wf")
            .add(StepBuilder::require("precondition", |_| Ok(())))
            .build()
            .unwrap();

        let (outcome, report) = runtime()
            .run_with_report(&wf, Context::new().with("x", json!(1)), RunOptions::default())
            .await;
        assert!(outcome.is_completed());
        assert!(report.step("precondition").unwrap().added_keys.is_empty());
    }

    #[tokio::test]
    async fn test_tap_swallows_body_failure() {
        let wf = Workflow::builder("wf")
            .add(StepBuilder::tap("audit", |_| async {
                StepOutput::err(json!("audit sink down"))
            }))
            .step("after", |_| async { StepOutput::ok(json!({"done": true})) })
            .build()
            .unwrap();

        match runtime().run(&wf, Context::new(), RunOptions::default()).await {
            RunOutcome::Completed(ctx) => assert_eq!(ctx.get("done"), Some(&json!(true))),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_assign_computes_from_context() {
        let wf = Workflow::builder("wf")
            .add(StepBuilder::assign_value("seed", "x", json!(20)))
            .add(StepBuilder::assign("derive", "half", |ctx| {
                json!(ctx.get("x").and_then(Value::as_i64).unwrap_or(0) / 2)
            }))
            .build()
            .unwrap();

        match runtime().run(&wf, Context::new(), RunOptions::default()).await {
            RunOutcome::Completed(ctx) => {
                assert_eq!(ctx.get("x"), Some(&json!(20)));
                assert_eq!(ctx.get("half"), Some(&json!(10)));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // when / skip
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_when_false_skips_step() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("gated", |_| async { StepOutput::ok(json!({"ran": true})) })
                    .when(|ctx| ctx.get("enabled") == Some(&json!(true))),
            )
            .build()
            .unwrap();

        let (outcome, report) = runtime()
            .run_with_report(&wf, Context::new(), RunOptions::default())
            .await;
        match outcome {
            RunOutcome::Completed(ctx) => assert!(ctx.get("ran").is_none()),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(report.step("gated").unwrap().status, StepStatus::Skipped);
    }

    // -----------------------------------------------------------------------
    // Checkpoint and resume
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_checkpoint_pause_and_resume() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let wf = Workflow::builder("fulfillment")
            .add(StepBuilder::validate("validate", |_| Ok(())))
            .step("prepare", |_| async {
                StepOutput::ok(json!({"prepared": true}))
            })
            .add(StepBuilder::checkpoint("pause", store.clone()))
            .step("fulfill", |ctx| {
                let prepared = ctx.get("prepared").cloned().unwrap_or(json!(false));
                async move { StepOutput::ok(json!({"fulfilled": prepared})) }
            })
            .build()
            .unwrap();

        let rt = runtime();
        let outcome = rt.run(&wf, Context::new(), RunOptions::default()).await;
        let exec_id = match outcome {
            RunOutcome::Checkpointed {
                exec_id,
                checkpoint,
                context,
            } => {
                assert_eq!(checkpoint, "pause");
                assert_eq!(context.get("prepared"), Some(&json!(true)));
                exec_id
            }
            other => panic!("expected checkpoint, got {other:?}"),
        };
        assert_eq!(store.len(), 1);

        let (resumed, report) = rt
            .resume_with_report(&wf, &exec_id, RunOptions::default())
            .await;
        match resumed {
            RunOutcome::Completed(ctx) => {
                assert_eq!(ctx.get("fulfilled"), Some(&json!(true)));
                assert_eq!(ctx.get("prepared"), Some(&json!(true)));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        // Only the remaining node ran.
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].name, "fulfill");
    }

    #[tokio::test]
    async fn test_resume_unknown_exec_id() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let wf = Workflow::builder("wf")
            .add(StepBuilder::checkpoint("pause", store))
            .build()
            .unwrap();

        let outcome = runtime().resume(&wf, "ghost", RunOptions::default()).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.tag, Some(ErrorTag::CheckpointNotFound));
    }

    #[tokio::test]
    async fn test_resume_rejects_foreign_workflow_state() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let wf_a = Workflow::builder("a")
            .add(StepBuilder::checkpoint("pause", store.clone()))
            .build()
            .unwrap();
        let wf_b = Workflow::builder("b")
            .add(StepBuilder::checkpoint("pause", store))
            .build()
            .unwrap();

        let rt = runtime();
        let outcome = rt.run(&wf_a, Context::new(), RunOptions::default()).await;
        let exec_id = match outcome {
            RunOutcome::Checkpointed { exec_id, .. } => exec_id,
            other => panic!("expected checkpoint, got {other:?}"),
        };

        let outcome = rt.resume(&wf_b, &exec_id, RunOptions::default()).await;
        assert_eq!(outcome.error().unwrap().tag, Some(ErrorTag::WorkflowMismatch));
    }

    // -----------------------------------------------------------------------
    // Cancellation and run timeout
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_timeout_rolls_back_and_tags_timeout() {
        let rolled_back = Arc::new(AtomicU32::new(0));
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("quick", |_| async { StepOutput::ok(json!({"q": 1})) }).rollback({
                    let rolled_back = rolled_back.clone();
                    move |_| {
                        let rolled_back = rolled_back.clone();
                        async move {
                            rolled_back.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }
                }),
            )
            .step("stuck", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StepOutput::empty()
            })
            .build()
            .unwrap();

        let (outcome, report) = runtime()
            .run_with_report(
                &wf,
                Context::new(),
                RunOptions::with_timeout(Duration::from_millis(60)),
            )
            .await;

        let error = outcome.error().unwrap();
        assert_eq!(error.tag, Some(ErrorTag::Timeout));
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_cancel_ends_run_as_cancelled() {
        let wf = Workflow::builder("wf")
            .step("first", |_| async { StepOutput::ok(json!({"a": 1})) })
            .step("stuck", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StepOutput::empty()
            })
            .build()
            .unwrap();

        let rt = Arc::new(runtime());
        let mut events = rt.telemetry().subscribe();
        let handle = {
            let rt = rt.clone();
            let wf = wf.clone();
            tokio::spawn(async move {
                rt.run_with_report(&wf, Context::new(), RunOptions::default())
                    .await
            })
        };

        // Wait for run.start to learn the exec id.
        let exec_id = loop {
            let event = events.recv().await.unwrap();
            if event.signal == TelemetrySignal::RunStart {
                break event.exec_id;
            }
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rt.cancel(&exec_id));

        let (outcome, report) = handle.await.unwrap();
        let error = outcome.error().unwrap();
        assert_eq!(error.tag, Some(ErrorTag::Cancelled));
        assert_eq!(report.state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_exec_id_is_false() {
        assert!(!runtime().cancel("ghost"));
    }

    // -----------------------------------------------------------------------
    // Per-step timeout
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_step_timeout_fails_locally() {
        let wf = Workflow::builder("wf")
            .add(
                StepBuilder::run("slow", |_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    StepOutput::empty()
                })
                .timeout(Duration::from_millis(30)),
            )
            .build()
            .unwrap();

        let outcome = runtime().run(&wf, Context::new(), RunOptions::default()).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.step, "slow");
        assert_eq!(error.tag, Some(ErrorTag::Timeout));
    }

    // -----------------------------------------------------------------------
    // Middleware
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_middleware_order_first_registered_outermost() {
        let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let wf = Workflow::builder("wf")
            .middleware({
                let trace = trace.clone();
                move |name: String, ctx: Context, next: NextFn| {
                    let trace = trace.clone();
                    async move {
                        trace.lock().unwrap().push(format!("outer:{name}:in"));
                        let result = next(ctx).await;
                        trace.lock().unwrap().push(format!("outer:{name}:out"));
                        result
                    }
                }
            })
            .middleware({
                let trace = trace.clone();
                move |name: String, ctx: Context, next: NextFn| {
                    let trace = trace.clone();
                    async move {
                        trace.lock().unwrap().push(format!("inner:{name}:in"));
                        let result = next(ctx).await;
                        trace.lock().unwrap().push(format!("inner:{name}:out"));
                        result
                    }
                }
            })
            .step("work", |_| async { StepOutput::empty() })
            .build()
            .unwrap();

        assert!(runtime()
            .run(&wf, Context::new(), RunOptions::default())
            .await
            .is_completed());
        assert_eq!(
            *trace.lock().unwrap(),
            vec![
                "outer:work:in",
                "inner:work:in",
                "inner:work:out",
                "outer:work:out"
            ]
        );
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let wf = Workflow::builder("wf")
            .middleware(|_name: String, _ctx: Context, _next: NextFn| async {
                StepOutput::ok(json!({"from_middleware": true}))
            })
            .step("never", |_| async { StepOutput::err(json!("unreachable")) })
            .build()
            .unwrap();

        match runtime().run(&wf, Context::new(), RunOptions::default()).await {
            RunOutcome::Completed(ctx) => {
                assert_eq!(ctx.get("from_middleware"), Some(&json!(true)));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Hooks, ensure, services
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_hooks_and_ensure_fire_on_success() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let wf = Workflow::builder("wf")
            .on_start({
                let log = log.clone();
                move |name, _| log.lock().unwrap().push(format!("start:{name}"))
            })
            .on_complete({
                let log = log.clone();
                move |name, _| log.lock().unwrap().push(format!("complete:{name}"))
            })
            .ensure({
                let log = log.clone();
                move |outcome| log.lock().unwrap().push(format!("ensure:{}", outcome.as_str()))
            })
            .step("work", |_| async { StepOutput::empty() })
            .build()
            .unwrap();

        assert!(runtime()
            .run(&wf, Context::new(), RunOptions::default())
            .await
            .is_completed());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:wf", "complete:wf", "ensure:ok"]
        );
    }

    #[tokio::test]
    async fn test_error_hook_and_ensure_fire_on_failure() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let wf = Workflow::builder("wf")
            .on_error({
                let log = log.clone();
                move |step, reason, _| {
                    log.lock().unwrap().push(format!("error:{step}:{reason}"))
                }
            })
            .ensure({
                let log = log.clone();
                move |outcome| log.lock().unwrap().push(format!("ensure:{}", outcome.as_str()))
            })
            .step("boom", |_| async { StepOutput::err(json!("bad")) })
            .build()
            .unwrap();

        assert!(runtime()
            .run(&wf, Context::new(), RunOptions::default())
            .await
            .is_failed());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["error:boom:\"bad\"", "ensure:error"]
        );
    }

    #[tokio::test]
    async fn test_services_injected_and_overridable() {
        #[derive(Debug, PartialEq)]
        struct Region(&'static str);

        let wf = Workflow::builder("wf")
            .service("region", Region("eu"))
            .add(StepBuilder::run_with_services("read", |_, services| {
                let region = services
                    .get::<Region>("region")
                    .map(|r| r.0)
                    .unwrap_or("missing");
                async move { StepOutput::ok(json!({"region": region})) }
            }))
            .build()
            .unwrap();

        // Workflow-registered service.
        match runtime().run(&wf, Context::new(), RunOptions::default()).await {
            RunOutcome::Completed(ctx) => assert_eq!(ctx.get("region"), Some(&json!("eu"))),
            other => panic!("expected completion, got {other:?}"),
        }

        // Per-run override wins.
        let options = RunOptions {
            services: Some(Services::new().with("region", Region("us"))),
            ..RunOptions::default()
        };
        match runtime().run(&wf, Context::new(), options).await {
            RunOutcome::Completed(ctx) => assert_eq!(ctx.get("region"), Some(&json!("us"))),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Telemetry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_emits_lifecycle_events() {
        let rt = runtime();
        let mut events = rt.telemetry().subscribe();
        let wf = Workflow::builder("wf")
            .step("work", |_| async { StepOutput::empty() })
            .build()
            .unwrap();

        assert!(rt
            .run(&wf, Context::new(), RunOptions::default())
            .await
            .is_completed());

        let mut signals = Vec::new();
        while let Ok(event) = events.try_recv() {
            signals.push(event.signal);
        }
        assert_eq!(
            signals,
            vec![
                TelemetrySignal::RunStart,
                TelemetrySignal::StepStart,
                TelemetrySignal::StepStop,
                TelemetrySignal::RunStop,
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_emits_step_retry_events() {
        let rt = runtime();
        let mut events = rt.telemetry().subscribe();
        let attempts = Arc::new(AtomicU32::new(0));
        let wf = {
            let attempts = attempts.clone();
            Workflow::builder("wf")
                .add(
                    StepBuilder::run("flaky", move |_| {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if n == 0 {
                                StepOutput::err(json!("once"))
                            } else {
                                StepOutput::empty()
                            }
                        }
                    })
                    .retry(RetryPolicy::fixed(2, 1)),
                )
                .build()
                .unwrap()
        };

        assert!(rt
            .run(&wf, Context::new(), RunOptions::default())
            .await
            .is_completed());

        let mut saw_retry = false;
        while let Ok(event) = events.try_recv() {
            if event.signal == TelemetrySignal::StepRetry {
                saw_retry = true;
                assert_eq!(event.attempt, Some(1));
                assert_eq!(event.step_name.as_deref(), Some("flaky"));
            }
        }
        assert!(saw_retry);
    }

    // -----------------------------------------------------------------------
    // Graph error surface
    // -----------------------------------------------------------------------

    #[test]
    fn test_graph_error_into_run_error() {
        let err = Workflow::builder("wf")
            .step("a", |_| async { StepOutput::empty() })
            .add(StepBuilder::run("a", |_| async { StepOutput::empty() }))
            .build()
            .unwrap_err();
        let run_error = err.into_run_error("wf");
        assert_eq!(run_error.step, "dag");
        assert_eq!(run_error.tag, Some(ErrorTag::InvalidGraph));
        assert_eq!(run_error.workflow_name, "wf");
    }
}
