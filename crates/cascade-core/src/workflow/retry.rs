//! The retry loop.
//!
//! Wraps a step invocation in attempt accounting: failed attempts are
//! retried while the policy allows, with a cancellable backoff sleep
//! between attempts. Panics inside an attempt are contained and surface as
//! tagged failures. Halt is never retried.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use cascade_types::error::ErrorTag;
use futures_util::FutureExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::step::{RetrySpec, StepError, StepFuture, StepOutput, panic_message};

/// The settled output of a step after retries, with the attempt count.
pub(crate) struct AttemptResult {
    pub output: StepOutput,
    pub attempts: u32,
}

/// Run `call` until it succeeds, halts, exhausts the policy, or the run is
/// cancelled (`None`).
///
/// `attempt_timeout` bounds each attempt individually; an elapsed deadline
/// counts as a `timeout`-tagged failure and is retryable like any other.
/// `on_retry` fires before each backoff sleep with the failing attempt,
/// its error, and the computed delay.
pub(crate) async fn execute_with_retry<F>(
    call: F,
    retry: Option<&RetrySpec>,
    attempt_timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut on_retry: impl FnMut(u32, &StepError, u64),
) -> Option<AttemptResult>
where
    F: Fn() -> StepFuture,
{
    let max_attempts = retry.map(|spec| spec.policy.max_attempts.max(1)).unwrap_or(1);
    let mut attempt = 1u32;

    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let guarded = AssertUnwindSafe(call()).catch_unwind();
        let output = match attempt_timeout {
            Some(limit) => {
                tokio::select! {
                    result = tokio::time::timeout(limit, guarded) => match result {
                        Ok(Ok(output)) => output,
                        Ok(Err(payload)) => panic_output(payload),
                        Err(_) => StepOutput::Error(StepError::tagged(
                            json!("timeout"),
                            ErrorTag::Timeout,
                        )),
                    },
                    _ = cancel.cancelled() => return None,
                }
            }
            None => {
                tokio::select! {
                    result = guarded => match result {
                        Ok(output) => output,
                        Err(payload) => panic_output(payload),
                    },
                    _ = cancel.cancelled() => return None,
                }
            }
        };

        let StepOutput::Error(error) = output else {
            return Some(AttemptResult { output, attempts: attempt });
        };
        if error.is_cancelled() {
            return Some(AttemptResult {
                output: StepOutput::Error(error),
                attempts: attempt,
            });
        }

        if let Some(spec) = retry {
            if attempt < max_attempts && spec.should_retry(&error) {
                let delay_ms = spec.policy.delay_ms(attempt, fastrand::f64);
                on_retry(attempt, &error, delay_ms);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = cancel.cancelled() => return None,
                }
                attempt += 1;
                continue;
            }
        }

        return Some(AttemptResult {
            output: StepOutput::Error(error),
            attempts: attempt,
        });
    }
}

fn panic_output(payload: Box<dyn std::any::Any + Send>) -> StepOutput {
    StepOutput::Error(StepError::tagged(
        Value::String(panic_message(payload)),
        ErrorTag::BodyFailed,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
