//! Bounded concurrent dispatch.
//!
//! The shared fan-out machinery behind parallel groups and concurrent
//! `each` iteration: tasks run under a semaphore-enforced concurrency
//! bound, results are collected by declaration index, and a child
//! cancellation token stops outstanding work on fail-fast errors, group
//! timeouts, and run cancellation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cascade_types::error::ErrorTag;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::step::{StepError, panic_message};

/// One unit of work: a named future resolving to a result object or a
/// failure.
pub(crate) struct BoundedTask {
    pub name: String,
    pub future: BoxFuture<'static, Result<Map<String, Value>, StepError>>,
}

pub(crate) struct BoundedOptions {
    pub max_concurrency: usize,
    /// Deadline for the whole bag; `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Cancel outstanding tasks on the first failure.
    pub fail_fast: bool,
    /// The run's token; cancelling it cancels the whole bag.
    pub cancel: CancellationToken,
    /// Token cancelled to stop outstanding tasks (fail-fast, timeout).
    /// Derived from `cancel` when not supplied; callers whose task futures
    /// observe a token themselves pass that token in.
    pub stop: Option<CancellationToken>,
    /// Let a stopped task run to completion so it can observe `stop` and
    /// compensate its own work; when false the task future is dropped the
    /// moment the stop token fires.
    pub cooperative: bool,
}

pub(crate) enum BoundedOutcome {
    /// Every task succeeded; results in declaration order.
    Completed(Vec<(String, Map<String, Value>)>),
    /// At least one task failed; the lowest-index failure is surfaced
    /// together with everything that did complete.
    Failed {
        index: usize,
        name: String,
        error: StepError,
        completed: Vec<(usize, String, Map<String, Value>)>,
    },
    /// The deadline elapsed before all tasks finished.
    TimedOut {
        completed: Vec<(usize, String, Map<String, Value>)>,
    },
    /// The run itself was cancelled.
    Cancelled,
}

type Slot = Option<(String, Result<Map<String, Value>, StepError>)>;

/// Run `tasks` with bounded concurrency and collect ordered results.
pub(crate) async fn run_bounded(tasks: Vec<BoundedTask>, opts: BoundedOptions) -> BoundedOutcome {
    if tasks.is_empty() {
        return BoundedOutcome::Completed(Vec::new());
    }

    let child = opts
        .stop
        .clone()
        .unwrap_or_else(|| opts.cancel.child_token());
    let semaphore = Arc::new(Semaphore::new(opts.max_concurrency.max(1)));
    let cooperative = opts.cooperative;
    let mut join_set: JoinSet<(usize, String, Result<Map<String, Value>, StepError>)> =
        JoinSet::new();

    for (index, task) in tasks.into_iter().enumerate() {
        let BoundedTask { name, future } = task;
        let semaphore = semaphore.clone();
        let token = child.clone();
        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, name, Err(StepError::cancelled())),
            };
            if token.is_cancelled() {
                return (index, name, Err(StepError::cancelled()));
            }
            let guarded = AssertUnwindSafe(future).catch_unwind();
            if cooperative {
                // The future observes the stop token itself and winds down
                // its own work before resolving.
                match guarded.await {
                    Ok(result) => (index, name, result),
                    Err(payload) => (
                        index,
                        name,
                        Err(StepError::tagged(
                            Value::String(panic_message(payload)),
                            ErrorTag::BodyFailed,
                        )),
                    ),
                }
            } else {
                tokio::select! {
                    result = guarded => match result {
                        Ok(result) => (index, name, result),
                        Err(payload) => (
                            index,
                            name,
                            Err(StepError::tagged(
                                Value::String(panic_message(payload)),
                                ErrorTag::BodyFailed,
                            )),
                        ),
                    },
                    _ = token.cancelled() => (index, name, Err(StepError::cancelled())),
                }
            }
        });
    }

    let total = join_set.len();
    let mut slots: Vec<Slot> = std::iter::repeat_with(|| None).take(total).collect();
    let mut timed_out = false;
    let mut parent_cancelled = false;

    let deadline = async {
        match opts.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = join_set.join_next() => {
                let Some(joined) = joined else { break };
                if let Ok((index, name, result)) = joined {
                    let failed = matches!(&result, Err(err) if !err.is_cancelled());
                    slots[index] = Some((name, result));
                    if failed && opts.fail_fast {
                        child.cancel();
                    }
                }
            }
            _ = &mut deadline => {
                timed_out = true;
                child.cancel();
                drain(&mut join_set, &mut slots).await;
                break;
            }
            _ = opts.cancel.cancelled() => {
                parent_cancelled = true;
                drain(&mut join_set, &mut slots).await;
                break;
            }
        }
    }

    if parent_cancelled {
        return BoundedOutcome::Cancelled;
    }

    let completed: Vec<(usize, String, Map<String, Value>)> = slots
        .iter()
        .enumerate()
        .filter_map(|(index, slot)| match slot {
            Some((name, Ok(fields))) => Some((index, name.clone(), fields.clone())),
            _ => None,
        })
        .collect();

    if timed_out {
        return BoundedOutcome::TimedOut { completed };
    }

    // Lowest declaration index wins when several tasks failed.
    let first_failure = slots.iter().enumerate().find_map(|(index, slot)| {
        match slot {
            Some((name, Err(err))) if !err.is_cancelled() => {
                Some((index, name.clone(), err.clone()))
            }
            _ => None,
        }
    });

    match first_failure {
        Some((index, name, error)) => BoundedOutcome::Failed {
            index,
            name,
            error,
            completed,
        },
        None => {
            let ordered = slots
                .into_iter()
                .flatten()
                .filter_map(|(name, result)| result.ok().map(|fields| (name, fields)))
                .collect();
            BoundedOutcome::Completed(ordered)
        }
    }
}

async fn drain(
    join_set: &mut JoinSet<(usize, String, Result<Map<String, Value>, StepError>)>,
    slots: &mut [Slot],
) {
    while let Some(joined) = join_set.join_next().await {
        if let Ok((index, name, result)) = joined {
            slots[index] = Some((name, result));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn ok_task(name: &str, value: Value) -> BoundedTask {
        let fields = fields(value);
        BoundedTask {
            name: name.to_string(),
            future: Box::pin(async move { Ok(fields) }),
        }
    }

    fn err_task(name: &str, reason: Value) -> BoundedTask {
        BoundedTask {
            name: name.to_string(),
            future: Box::pin(async move { Err(StepError::new(reason)) }),
        }
    }

    fn opts(fail_fast: bool) -> BoundedOptions {
        BoundedOptions {
            max_concurrency: 8,
            timeout: Some(Duration::from_secs(5)),
            fail_fast,
            cancel: CancellationToken::new(),
            stop: None,
            cooperative: false,
        }
    }

    // -----------------------------------------------------------------------
    // Ordered collection
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_results_keep_declaration_order() {
        // The first task finishes last; order must still hold.
        let slow = BoundedTask {
            name: "slow".to_string(),
            future: Box::pin(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(fields(json!({"slow": 1})))
            }),
        };
        let tasks = vec![slow, ok_task("fast", json!({"fast": 2}))];

        match run_bounded(tasks, opts(true)).await {
            BoundedOutcome::Completed(results) => {
                let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["slow", "fast"]);
            }
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_empty_bag_completes() {
        match run_bounded(Vec::new(), opts(true)).await {
            BoundedOutcome::Completed(results) => assert!(results.is_empty()),
            _ => panic!("expected completion"),
        }
    }

    // -----------------------------------------------------------------------
    // Concurrency bound
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrency_bound_is_honored() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<BoundedTask> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                BoundedTask {
                    name: format!("t{i}"),
                    future: Box::pin(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(Map::new())
                    }),
                }
            })
            .collect();

        let options = BoundedOptions {
            max_concurrency: 2,
            timeout: Some(Duration::from_secs(5)),
            fail_fast: true,
            cancel: CancellationToken::new(),
            stop: None,
            cooperative: false,
        };
        match run_bounded(tasks, options).await {
            BoundedOutcome::Completed(results) => assert_eq!(results.len(), 6),
            _ => panic!("expected completion"),
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "bound exceeded");
    }

    // -----------------------------------------------------------------------
    // Failure modes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_fail_fast_cancels_outstanding() {
        let survivor_ran = Arc::new(AtomicUsize::new(0));
        let slow = {
            let survivor_ran = survivor_ran.clone();
            BoundedTask {
                name: "slow".to_string(),
                future: Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    survivor_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(Map::new())
                }),
            }
        };
        let tasks = vec![err_task("bad", json!("boom")), slow];

        let started = std::time::Instant::now();
        match run_bounded(tasks, opts(true)).await {
            BoundedOutcome::Failed { name, error, .. } => {
                assert_eq!(name, "bad");
                assert_eq!(error.reason, json!("boom"));
            }
            _ => panic!("expected failure"),
        }
        assert!(started.elapsed() < Duration::from_secs(5), "did not fail fast");
        assert_eq!(survivor_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_continue_collects_completions_and_first_declared_error() {
        let tasks = vec![
            ok_task("a", json!({"a": 1})),
            err_task("b", json!("bad")),
            ok_task("c", json!({"c": 3})),
        ];

        match run_bounded(tasks, opts(false)).await {
            BoundedOutcome::Failed {
                index,
                name,
                error,
                completed,
            } => {
                assert_eq!(index, 1);
                assert_eq!(name, "b");
                assert_eq!(error.reason, json!("bad"));
                let names: Vec<&str> = completed.iter().map(|(_, n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["a", "c"]);
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let tasks = vec![BoundedTask {
            name: "boom".to_string(),
            future: Box::pin(async { panic!("kaboom") }),
        }];
        match run_bounded(tasks, opts(false)).await {
            BoundedOutcome::Failed { error, .. } => {
                assert_eq!(error.tag, Some(ErrorTag::BodyFailed));
                assert_eq!(error.reason, json!("kaboom"));
            }
            _ => panic!("expected failure"),
        }
    }

    // -----------------------------------------------------------------------
    // Timeout and cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_group_timeout() {
        let tasks = vec![
            ok_task("quick", json!({"q": 1})),
            BoundedTask {
                name: "stuck".to_string(),
                future: Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Map::new())
                }),
            },
        ];
        let options = BoundedOptions {
            max_concurrency: 4,
            timeout: Some(Duration::from_millis(50)),
            fail_fast: false,
            cancel: CancellationToken::new(),
            stop: None,
            cooperative: false,
        };
        match run_bounded(tasks, options).await {
            BoundedOutcome::TimedOut { completed } => {
                assert_eq!(completed.len(), 1);
                assert_eq!(completed[0].1, "quick");
            }
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn test_cooperative_stop_lets_tasks_wind_down() {
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        let cleaned_up = Arc::new(AtomicUsize::new(0));

        // Stands in for a nested workflow that observes the stop token and
        // compensates before resolving.
        let stalled = {
            let stop = stop.clone();
            let cleaned_up = cleaned_up.clone();
            BoundedTask {
                name: "stalled".to_string(),
                future: Box::pin(async move {
                    stop.cancelled().await;
                    cleaned_up.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::cancelled())
                }),
            }
        };
        let tasks = vec![err_task("bad", json!("boom")), stalled];

        let options = BoundedOptions {
            max_concurrency: 4,
            timeout: None,
            fail_fast: true,
            cancel,
            stop: Some(stop),
            cooperative: true,
        };
        match run_bounded(tasks, options).await {
            BoundedOutcome::Failed { name, .. } => assert_eq!(name, "bad"),
            _ => panic!("expected failure"),
        }
        // The stalled task finished its cleanup before run_bounded returned.
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parent_cancellation() {
        let cancel = CancellationToken::new();
        let tasks = vec![BoundedTask {
            name: "stuck".to_string(),
            future: Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Map::new())
            }),
        }];
        let options = BoundedOptions {
            max_concurrency: 1,
            timeout: None,
            fail_fast: false,
            cancel: cancel.clone(),
            stop: None,
            cooperative: false,
        };
        let handle = tokio::spawn(run_bounded(tasks, options));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        match handle.await.unwrap() {
            BoundedOutcome::Cancelled => {}
            _ => panic!("expected cancellation"),
        }
    }
}
