//! Rollback coordination.
//!
//! When a run aborts, compensations of completed steps run in
//! reverse-completion order. Rollback is strictly best-effort: a failing or
//! panicking compensation is recorded and the sweep continues; the
//! coordinator itself never fails. Halted and checkpointed runs are never
//! rolled back.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use cascade_types::error::RollbackError;
use cascade_types::telemetry::{OutcomeLabel, TelemetryEvent, TelemetrySignal};
use futures_util::FutureExt;
use serde_json::Value;

use super::builder::Workflow;
use super::context::Context;
use super::runtime::RunCore;
use super::step::panic_message;

/// Invoke the compensations of `completed` (already in reverse-completion
/// order) against `ctx`, collecting the failures.
pub(crate) async fn rollback_completed(
    core: &RunCore,
    workflow: &Workflow,
    completed: &[String],
    ctx: &Context,
) -> Vec<RollbackError> {
    let mut errors = Vec::new();

    for name in completed {
        let Some(step) = workflow.step(name) else {
            continue;
        };
        let Some(compensation) = &step.rollback else {
            continue;
        };

        core.emit(
            TelemetryEvent::new(TelemetrySignal::RollbackStart, workflow.name(), &core.exec_id)
                .with_step(name.clone()),
        );
        workflow.hooks.fire_rollback(name, ctx);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(compensation(ctx.clone())).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(exec_id = core.exec_id.as_str(), step = name.as_str(), "rolled back step");
                core.emit(
                    TelemetryEvent::new(
                        TelemetrySignal::RollbackStop,
                        workflow.name(),
                        &core.exec_id,
                    )
                    .with_step(name.clone())
                    .with_duration(started.elapsed())
                    .with_result(OutcomeLabel::Ok),
                );
            }
            Ok(Err(reason)) => {
                tracing::warn!(
                    exec_id = core.exec_id.as_str(),
                    step = name.as_str(),
                    reason = %reason,
                    "rollback failed"
                );
                core.emit(
                    TelemetryEvent::new(
                        TelemetrySignal::RollbackStop,
                        workflow.name(),
                        &core.exec_id,
                    )
                    .with_step(name.clone())
                    .with_duration(started.elapsed())
                    .with_result(OutcomeLabel::Error),
                );
                errors.push(RollbackError {
                    step: name.clone(),
                    reason,
                });
            }
            Err(payload) => {
                let message = panic_message(payload);
                tracing::warn!(
                    exec_id = core.exec_id.as_str(),
                    step = name.as_str(),
                    message = message.as_str(),
                    "rollback panicked"
                );
                core.emit(
                    TelemetryEvent::new(
                        TelemetrySignal::RollbackException,
                        workflow.name(),
                        &core.exec_id,
                    )
                    .with_step(name.clone())
                    .with_duration(started.elapsed())
                    .with_result(OutcomeLabel::Error),
                );
                errors.push(RollbackError {
                    step: name.clone(),
                    reason: Value::String(message),
                });
            }
        }
    }

    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
