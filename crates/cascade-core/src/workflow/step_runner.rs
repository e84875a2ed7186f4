//! Kind-specific step executors.
//!
//! `dispatch_kind` routes a node to the executor for its payload: plain
//! bodies run directly; parallel groups fan out over the bounded executor;
//! branch, embed, each, race, and using compose nested workflows through
//! the same walk the runtime uses, so cancellation and rollback behave
//! identically at every nesting level.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use cascade_types::error::ErrorTag;
use cascade_types::telemetry::{TelemetryEvent, TelemetrySignal};
use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;

use super::builder::Workflow;
use super::context::Context;
use super::parallel::{BoundedOptions, BoundedOutcome, BoundedTask, run_bounded};
use super::rollback;
use super::runtime::{RunCore, WalkEnd, execute_workflow};
use super::step::{
    BranchSpec, EachSpec, EmbedSpec, ParallelErrorMode, ParallelSpec, RaceSpec, RouteTarget,
    StepAction, StepDescriptor, StepError, StepFuture, StepOutput, UsingSpec, output_fields,
    panic_message,
};

/// Dispatch one node to its kind-specific executor.
///
/// Checkpoint nodes never reach this point; the runtime walk intercepts
/// them before the middleware stack.
pub(crate) fn dispatch_kind(
    core: Arc<RunCore>,
    workflow: Arc<Workflow>,
    step: Arc<StepDescriptor>,
    ctx: Context,
) -> StepFuture {
    Box::pin(async move {
        match &step.action {
            StepAction::Body(body) => body(ctx, core.services.clone()).await,
            StepAction::Parallel(spec) => run_parallel_group(&core, spec, ctx).await,
            StepAction::Branch(spec) => run_branch(&core, spec, ctx).await,
            StepAction::Embed(spec) => run_embed(&core, spec, ctx).await,
            StepAction::Each(spec) => run_each(&core, &workflow, step.name(), spec, ctx).await,
            StepAction::Race(spec) => run_race(&core, spec, ctx).await,
            StepAction::Using(spec) => run_using(&core, spec, ctx).await,
            StepAction::Checkpoint(_) => StepOutput::err(json!(
                "checkpoint steps are executed by the runtime walk"
            )),
        }
    })
}

// ---------------------------------------------------------------------------
// Parallel group
// ---------------------------------------------------------------------------

async fn run_parallel_group(core: &Arc<RunCore>, spec: &ParallelSpec, ctx: Context) -> StepOutput {
    // Every substep sees exactly this snapshot.
    let snapshot = ctx;
    let tasks: Vec<BoundedTask> = spec
        .substeps
        .iter()
        .map(|(name, body)| {
            let future = body(snapshot.clone(), core.services.clone());
            BoundedTask {
                name: name.clone(),
                future: Box::pin(async move {
                    match future.await {
                        StepOutput::Ok(value) => output_fields(value),
                        StepOutput::Error(error) => Err(error),
                        // Substeps speak the plain body protocol; a halt has
                        // no group-level meaning and surfaces as a failure.
                        StepOutput::Halt(reason) => Err(StepError::new(reason)),
                    }
                }),
            }
        })
        .collect();

    let options = BoundedOptions {
        max_concurrency: spec
            .max_concurrency
            .unwrap_or_else(|| core.config.effective_max_concurrency()),
        timeout: Some(spec.timeout.unwrap_or(std::time::Duration::from_millis(
            core.config.parallel_timeout_ms,
        ))),
        fail_fast: spec.on_error == ParallelErrorMode::FailFast,
        cancel: core.cancel.clone(),
        stop: None,
        cooperative: false,
    };

    match run_bounded(tasks, options).await {
        BoundedOutcome::Completed(results) => {
            // Merge in declaration order, last writer wins.
            let mut merged = Map::new();
            for (_, fields) in results {
                for (key, value) in fields {
                    merged.insert(key, value);
                }
            }
            StepOutput::Ok(Value::Object(merged))
        }
        BoundedOutcome::Failed {
            name,
            mut error,
            completed,
            ..
        } => {
            error.step = Some(name);
            let completed_names: Vec<Value> = completed
                .iter()
                .map(|(_, name, _)| Value::String(name.clone()))
                .collect();
            error = error.with_meta("completed_before_failure", Value::Array(completed_names));
            StepOutput::Error(error)
        }
        BoundedOutcome::TimedOut { .. } => {
            StepOutput::Error(StepError::tagged(json!("timeout"), ErrorTag::Timeout))
        }
        BoundedOutcome::Cancelled => StepOutput::Error(StepError::cancelled()),
    }
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

async fn run_branch(core: &Arc<RunCore>, spec: &BranchSpec, ctx: Context) -> StepOutput {
    let key = match std::panic::catch_unwind(AssertUnwindSafe(|| (spec.selector)(&ctx))) {
        Ok(key) => key,
        Err(payload) => {
            return StepOutput::Error(StepError::tagged(
                json!({ "selector_error": panic_message(payload) }),
                ErrorTag::SelectorError,
            ));
        }
    };

    let target = spec
        .routes
        .iter()
        .find(|(route_key, _)| *route_key == key)
        .map(|(_, target)| target)
        .or(spec.fallback_route.as_ref());
    let Some(target) = target else {
        return StepOutput::Error(StepError::tagged(
            json!({ "no_matching_branch": key }),
            ErrorTag::NoMatchingBranch,
        ));
    };

    match target {
        RouteTarget::Body(body) => body(ctx, core.services.clone()).await,
        RouteTarget::Workflow(nested) => {
            let snapshot = ctx.clone();
            match run_nested(core, nested, ctx).await {
                NestedOutcome::Done { ctx: final_ctx, .. } => {
                    StepOutput::Ok(Value::Object(final_ctx.changes_since(&snapshot)))
                }
                NestedOutcome::Failed { reason, tag, .. } => StepOutput::Error(StepError {
                    reason,
                    tag,
                    step: None,
                    metadata: Default::default(),
                }),
                NestedOutcome::Halted { reason, .. } => StepOutput::Halt(reason),
                NestedOutcome::Cancelled { .. } => StepOutput::Error(StepError::cancelled()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Embed
// ---------------------------------------------------------------------------

async fn run_embed(core: &Arc<RunCore>, spec: &EmbedSpec, ctx: Context) -> StepOutput {
    let child_ctx = match &spec.map_context {
        Some(map) => map(&ctx),
        None => ctx.clone(),
    };

    match run_nested(core, &spec.workflow, child_ctx).await {
        NestedOutcome::Done { ctx: final_ctx, .. } => {
            StepOutput::Ok(Value::Object(final_ctx.changes_since(&ctx)))
        }
        NestedOutcome::Failed { step, reason, .. } => {
            let error = StepError::tagged(
                json!({ "nested_workflow_failed": reason.clone() }),
                ErrorTag::NestedWorkflowFailed,
            )
            .with_meta("nested_workflow", json!(spec.workflow.name()))
            .with_meta("nested_step", json!(step))
            .with_meta("nested_error", reason);
            StepOutput::Error(error)
        }
        NestedOutcome::Halted { reason, .. } => StepOutput::Halt(reason),
        NestedOutcome::Cancelled { .. } => StepOutput::Error(StepError::cancelled()),
    }
}

// ---------------------------------------------------------------------------
// Each
// ---------------------------------------------------------------------------

async fn run_each(
    core: &Arc<RunCore>,
    workflow: &Arc<Workflow>,
    step_name: &str,
    spec: &EachSpec,
    ctx: Context,
) -> StepOutput {
    let items = match std::panic::catch_unwind(AssertUnwindSafe(|| (spec.extractor)(&ctx))) {
        Ok(Ok(items)) => items,
        Ok(Err(reason)) => return StepOutput::Error(StepError::new(reason)),
        Err(payload) => {
            return StepOutput::Error(StepError::tagged(
                Value::String(panic_message(payload)),
                ErrorTag::BodyFailed,
            ));
        }
    };

    core.emit(
        TelemetryEvent::new(TelemetrySignal::GraftExpand, workflow.name(), &core.exec_id)
            .with_step(step_name.to_string())
            .with_item_count(items.len()),
    );

    if items.is_empty() {
        return StepOutput::Ok(collect_output(&spec.collect, Vec::new()));
    }

    let snapshot = ctx;

    if spec.concurrency <= 1 {
        let mut collected: Vec<Value> = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if core.cancel.is_cancelled() {
                return StepOutput::Error(StepError::cancelled());
            }
            let mut child_ctx = snapshot.clone();
            child_ctx.insert(spec.bind.clone(), item);
            match run_nested(core, &spec.item_workflow, child_ctx).await {
                NestedOutcome::Done { ctx: final_ctx, .. } => {
                    collected.push(Value::Object(item_output(&final_ctx, &snapshot, &spec.bind)));
                }
                NestedOutcome::Failed { reason, .. } => {
                    return StepOutput::Error(StepError::tagged(
                        json!({ "iteration_failed": { "index": index, "reason": reason } }),
                        ErrorTag::IterationFailed,
                    ));
                }
                NestedOutcome::Halted { reason, .. } => return StepOutput::Halt(reason),
                NestedOutcome::Cancelled { .. } => {
                    return StepOutput::Error(StepError::cancelled());
                }
            }
        }
        return StepOutput::Ok(collect_output(&spec.collect, collected));
    }

    // Bounded-parallel iteration with preserved input order. One failing
    // item stops the rest: the items run against a stop token they observe
    // cooperatively, so an in-flight item rolls back its own completed
    // steps, while items that already finished are compensated here.
    let stop = core.cancel.child_token();
    let item_core = core.with_cancel(stop.clone());
    let finished: Arc<Mutex<Vec<FinishedItem>>> = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<BoundedTask> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let item_core = item_core.clone();
            let item_workflow = spec.item_workflow.clone();
            let mut child_ctx = snapshot.clone();
            child_ctx.insert(spec.bind.clone(), item);
            let parent = snapshot.clone();
            let bind = spec.bind.clone();
            let finished = finished.clone();
            BoundedTask {
                name: format!("{step_name}[{index}]"),
                future: Box::pin(async move {
                    match run_nested(&item_core, &item_workflow, child_ctx).await {
                        NestedOutcome::Done { ctx: final_ctx, completed } => {
                            let output = item_output(&final_ctx, &parent, &bind);
                            record_finished(
                                &finished,
                                FinishedItem {
                                    ctx: final_ctx,
                                    completed,
                                },
                            );
                            Ok(output)
                        }
                        NestedOutcome::Failed { reason, .. } => Err(StepError::tagged(
                            json!({ "iteration_failed": { "index": index, "reason": reason } }),
                            ErrorTag::IterationFailed,
                        )),
                        NestedOutcome::Halted { reason, .. } => {
                            Err(StepError::new(json!({ "halted": reason })))
                        }
                        NestedOutcome::Cancelled { .. } => Err(StepError::cancelled()),
                    }
                }),
            }
        })
        .collect();

    let options = BoundedOptions {
        max_concurrency: spec.concurrency,
        timeout: None,
        fail_fast: true,
        cancel: core.cancel.clone(),
        stop: Some(stop),
        cooperative: true,
    };

    match run_bounded(tasks, options).await {
        BoundedOutcome::Completed(results) => {
            let collected: Vec<Value> = results
                .into_iter()
                .map(|(_, fields)| Value::Object(fields))
                .collect();
            StepOutput::Ok(collect_output(&spec.collect, collected))
        }
        BoundedOutcome::Failed {
            mut error,
            completed,
            ..
        } => {
            rollback_finished_items(core, &spec.item_workflow, &finished).await;
            let completed_names: Vec<Value> = completed
                .iter()
                .map(|(_, name, _)| Value::String(name.clone()))
                .collect();
            error = error.with_meta("completed_before_failure", Value::Array(completed_names));
            StepOutput::Error(error)
        }
        BoundedOutcome::TimedOut { .. } => {
            StepOutput::Error(StepError::tagged(json!("timeout"), ErrorTag::Timeout))
        }
        BoundedOutcome::Cancelled => {
            rollback_finished_items(core, &spec.item_workflow, &finished).await;
            StepOutput::Error(StepError::cancelled())
        }
    }
}

/// A concurrently-executed item that ran to completion, kept so its nested
/// steps can be compensated when a sibling item fails.
struct FinishedItem {
    ctx: Context,
    completed: Vec<String>,
}

fn record_finished(registry: &Mutex<Vec<FinishedItem>>, item: FinishedItem) {
    registry
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(item);
}

async fn rollback_finished_items(
    core: &Arc<RunCore>,
    item_workflow: &Workflow,
    registry: &Mutex<Vec<FinishedItem>>,
) {
    let items = std::mem::take(
        &mut *registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner),
    );
    for item in items {
        let errors =
            rollback::rollback_completed(core, item_workflow, &item.completed, &item.ctx).await;
        if !errors.is_empty() {
            tracing::warn!(
                workflow = item_workflow.name(),
                failed = errors.len(),
                "item compensation reported failures"
            );
        }
    }
}

fn collect_output(collect_key: &str, collected: Vec<Value>) -> Value {
    let mut out = Map::new();
    out.insert(collect_key.to_string(), Value::Array(collected));
    Value::Object(out)
}

/// The per-item contribution: keys the nested workflow added beyond the
/// parent snapshot, the bind key excluded.
fn item_output(final_ctx: &Context, parent: &Context, bind: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for key in final_ctx.added_since(parent) {
        if key == bind {
            continue;
        }
        if let Some(value) = final_ctx.get(&key) {
            out.insert(key, value.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Race
// ---------------------------------------------------------------------------

async fn run_race(core: &Arc<RunCore>, spec: &RaceSpec, ctx: Context) -> StepOutput {
    let snapshot = ctx;
    let child = core.cancel.child_token();
    let mut join_set: JoinSet<(usize, NestedOutcome)> = JoinSet::new();

    for (index, entrant) in spec.entrants.iter().enumerate() {
        let entrant_core = core.with_cancel(child.clone());
        let entrant = entrant.clone();
        let entrant_ctx = snapshot.clone();
        join_set.spawn(async move {
            let outcome = run_nested(&entrant_core, &entrant, entrant_ctx).await;
            (index, outcome)
        });
    }

    let deadline = async {
        match spec.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut failures: Vec<(usize, Value)> = Vec::new();
    loop {
        tokio::select! {
            joined = join_set.join_next() => {
                let Some(joined) = joined else { break };
                let Ok((index, outcome)) = joined else { continue };
                match outcome {
                    NestedOutcome::Done { ctx: final_ctx, .. } => {
                        // First success wins; losers are signalled to stop
                        // and roll back before we return.
                        child.cancel();
                        drain_race(&mut join_set).await;
                        return StepOutput::Ok(Value::Object(
                            final_ctx.changes_since(&snapshot),
                        ));
                    }
                    NestedOutcome::Failed { reason, .. } => failures.push((index, reason)),
                    NestedOutcome::Halted { reason, .. } => {
                        failures.push((index, json!({ "halted": reason })));
                    }
                    NestedOutcome::Cancelled { .. } => {
                        failures.push((index, json!("cancelled")));
                    }
                }
            }
            _ = &mut deadline => {
                child.cancel();
                drain_race(&mut join_set).await;
                failures.sort_by_key(|(index, _)| *index);
                let partial: Vec<Value> = failures
                    .iter()
                    .map(|(index, reason)| json!({ "index": index, "reason": reason }))
                    .collect();
                return StepOutput::Error(StepError::tagged(
                    json!({ "race_timeout": partial }),
                    ErrorTag::RaceTimeout,
                ));
            }
            _ = core.cancel.cancelled() => {
                drain_race(&mut join_set).await;
                return StepOutput::Error(StepError::cancelled());
            }
        }
    }

    failures.sort_by_key(|(index, _)| *index);
    let listed: Vec<Value> = failures
        .iter()
        .map(|(index, reason)| json!({ "index": index, "reason": reason }))
        .collect();
    StepOutput::Error(StepError::tagged(
        json!({ "race_all_failed": listed }),
        ErrorTag::RaceAllFailed,
    ))
}

async fn drain_race(join_set: &mut JoinSet<(usize, NestedOutcome)>) {
    while join_set.join_next().await.is_some() {}
}

// ---------------------------------------------------------------------------
// Using (scoped resource)
// ---------------------------------------------------------------------------

async fn run_using(core: &Arc<RunCore>, spec: &UsingSpec, ctx: Context) -> StepOutput {
    let acquired = (spec.acquire)(ctx.clone(), core.services.clone()).await;
    let fields = match acquired {
        StepOutput::Ok(value) => match output_fields(value) {
            Ok(fields) => fields,
            Err(invalid) => return StepOutput::Error(invalid),
        },
        StepOutput::Error(error) => {
            return StepOutput::Error(StepError::tagged(
                json!({ "acquire_failed": error.reason }),
                ErrorTag::AcquireFailed,
            ));
        }
        StepOutput::Halt(reason) => return StepOutput::Halt(reason),
    };

    let mut local = ctx.clone();
    local.merge(fields.clone());
    if let Some(bind) = &spec.bind {
        local.insert(bind.clone(), Value::Object(fields));
    }
    let base = local.clone();

    match run_nested(core, &spec.body, local).await {
        NestedOutcome::Done { ctx: final_local, .. } => {
            match call_release(spec, final_local.clone(), Ok(())).await {
                Ok(()) => {
                    let mut out = Map::new();
                    for key in final_local.added_since(&base) {
                        if let Some(value) = final_local.get(&key) {
                            out.insert(key, value.clone());
                        }
                    }
                    StepOutput::Ok(Value::Object(out))
                }
                Err(release_error) => StepOutput::Error(StepError::tagged(
                    json!({ "release_failed": release_error }),
                    ErrorTag::ReleaseFailed,
                )),
            }
        }
        NestedOutcome::Failed {
            ctx: failed_ctx,
            reason,
            tag,
            ..
        } => {
            // The body error wins; a release failure on top is only logged.
            if let Err(release_error) =
                call_release(spec, failed_ctx, Err(reason.clone())).await
            {
                tracing::warn!(
                    release_error = %release_error,
                    "release failed after body error; body error surfaces"
                );
            }
            StepOutput::Error(StepError {
                reason,
                tag,
                step: None,
                metadata: Default::default(),
            })
        }
        NestedOutcome::Halted {
            ctx: halted_ctx,
            reason,
        } => {
            if let Err(release_error) = call_release(spec, halted_ctx, Ok(())).await {
                tracing::warn!(
                    release_error = %release_error,
                    "release failed after halted body; halt surfaces"
                );
            }
            StepOutput::Halt(reason)
        }
        NestedOutcome::Cancelled { ctx: cancelled_ctx } => {
            if let Err(release_error) =
                call_release(spec, cancelled_ctx, Err(json!("cancelled"))).await
            {
                tracing::warn!(
                    release_error = %release_error,
                    "release failed after cancelled body"
                );
            }
            StepOutput::Error(StepError::cancelled())
        }
    }
}

async fn call_release(
    spec: &UsingSpec,
    ctx: Context,
    outcome: Result<(), Value>,
) -> Result<(), Value> {
    match AssertUnwindSafe((spec.release)(ctx, outcome)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Value::String(panic_message(payload))),
    }
}

// ---------------------------------------------------------------------------
// Nested execution
// ---------------------------------------------------------------------------

/// Outcome of running a nested workflow to completion.
pub(crate) enum NestedOutcome {
    Done {
        ctx: Context,
        /// Completed step names, most recent first; `each` uses these to
        /// compensate an already-finished item when a sibling fails.
        completed: Vec<String>,
    },
    Failed {
        ctx: Context,
        step: String,
        reason: Value,
        tag: Option<ErrorTag>,
    },
    Halted {
        ctx: Context,
        reason: Value,
    },
    Cancelled {
        ctx: Context,
    },
}

/// Walk a nested workflow; on failure or cancellation its own completed
/// steps are rolled back before the outcome propagates to the parent.
pub(crate) async fn run_nested(
    core: &Arc<RunCore>,
    workflow: &Workflow,
    ctx: Context,
) -> NestedOutcome {
    let workflow = Arc::new(workflow.clone());
    let result = execute_workflow(core.clone(), workflow.clone(), ctx, Vec::new(), None).await;
    match result.end {
        WalkEnd::Done => NestedOutcome::Done {
            ctx: result.ctx,
            completed: result.completed,
        },
        WalkEnd::Halted(reason) => NestedOutcome::Halted {
            ctx: result.ctx,
            reason,
        },
        WalkEnd::Failed(failure) => {
            let targets =
                super::runtime::rollback_targets(&workflow, &result.completed, &failure);
            let rollback_errors =
                rollback::rollback_completed(core, &workflow, &targets, &result.ctx).await;
            if !rollback_errors.is_empty() {
                tracing::warn!(
                    workflow = workflow.name(),
                    failed = rollback_errors.len(),
                    "nested rollback reported failures"
                );
            }
            NestedOutcome::Failed {
                ctx: result.ctx,
                step: failure.step,
                reason: failure.reason,
                tag: failure.tag,
            }
        }
        WalkEnd::Cancelled => {
            let _ = rollback::rollback_completed(core, &workflow, &result.completed, &result.ctx)
                .await;
            NestedOutcome::Cancelled { ctx: result.ctx }
        }
        // Builder validation keeps checkpoints out of nested workflows.
        WalkEnd::Paused { checkpoint, .. } => NestedOutcome::Failed {
            ctx: result.ctx,
            step: checkpoint,
            reason: json!("nested workflows cannot checkpoint"),
            tag: None,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
