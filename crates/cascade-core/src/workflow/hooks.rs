//! Lifecycle hooks.
//!
//! Hooks observe run transitions: start, completion, step errors, and
//! rollback of individual steps. They are best-effort by contract: a
//! panicking hook is contained and logged, never surfaced to the run.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::Value;

use super::context::Context;

/// Invoked with the workflow name and initial context when a run starts.
pub type StartHook = Arc<dyn Fn(&str, &Context) + Send + Sync>;

/// Invoked with the workflow name and final context on clean completion.
pub type CompleteHook = Arc<dyn Fn(&str, &Context) + Send + Sync>;

/// Invoked with the failing step, reason, and context when a run fails.
pub type ErrorHook = Arc<dyn Fn(&str, &Value, &Context) + Send + Sync>;

/// Invoked with the step name and context as its compensation runs.
pub type RollbackHook = Arc<dyn Fn(&str, &Context) + Send + Sync>;

/// The hook lists registered on a workflow.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) on_start: Vec<StartHook>,
    pub(crate) on_complete: Vec<CompleteHook>,
    pub(crate) on_error: Vec<ErrorHook>,
    pub(crate) on_rollback: Vec<RollbackHook>,
}

impl Hooks {
    pub(crate) fn fire_start(&self, workflow: &str, ctx: &Context) {
        for hook in &self.on_start {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(workflow, ctx))).is_err() {
                tracing::warn!(workflow, hook = "on_start", "lifecycle hook panicked");
            }
        }
    }

    pub(crate) fn fire_complete(&self, workflow: &str, ctx: &Context) {
        for hook in &self.on_complete {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(workflow, ctx))).is_err() {
                tracing::warn!(workflow, hook = "on_complete", "lifecycle hook panicked");
            }
        }
    }

    pub(crate) fn fire_error(&self, step: &str, reason: &Value, ctx: &Context) {
        for hook in &self.on_error {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(step, reason, ctx))).is_err() {
                tracing::warn!(step, hook = "on_error", "lifecycle hook panicked");
            }
        }
    }

    pub(crate) fn fire_rollback(&self, step: &str, ctx: &Context) {
        for hook in &self.on_rollback {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(step, ctx))).is_err() {
                tracing::warn!(step, hook = "on_rollback", "lifecycle hook panicked");
            }
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_start", &self.on_start.len())
            .field("on_complete", &self.on_complete.len())
            .field("on_error", &self.on_error.len())
            .field("on_rollback", &self.on_rollback.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_fire_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::default();
        for label in ["first", "second"] {
            let calls = calls.clone();
            hooks
                .on_start
                .push(Arc::new(move |_, _| calls.lock().unwrap().push(label)));
        }

        hooks.fire_start("wf", &Context::new());
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let ran_after = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::default();
        hooks.on_error.push(Arc::new(|_, _, _| panic!("bad hook")));
        {
            let ran_after = ran_after.clone();
            hooks.on_error.push(Arc::new(move |_, _, _| {
                ran_after.fetch_add(1, Ordering::SeqCst);
            }));
        }

        hooks.fire_error("charge", &json!("declined"), &Context::new());
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_hook_sees_step_and_reason() {
        let seen = Arc::new(Mutex::new(None));
        let mut hooks = Hooks::default();
        {
            let seen = seen.clone();
            hooks.on_error.push(Arc::new(move |step, reason, _| {
                *seen.lock().unwrap() = Some((step.to_string(), reason.clone()));
            }));
        }

        hooks.fire_error("ship", &json!("ship_failed"), &Context::new());
        let guard = seen.lock().unwrap();
        let (step, reason) = guard.as_ref().unwrap();
        assert_eq!(step, "ship");
        assert_eq!(reason, &json!("ship_failed"));
    }
}
