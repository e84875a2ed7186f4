//! Typed telemetry events.
//!
//! The runtime emits one `TelemetryEvent` at every lifecycle transition.
//! Events carry a monotonic timestamp and, where meaningful, a duration;
//! metadata always includes the workflow name and execution id, and step
//! events add the step name, attempt, and result label.

use std::time::{Duration, Instant};

/// The lifecycle transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetrySignal {
    RunStart,
    RunStop,
    RunException,
    StepStart,
    StepStop,
    StepException,
    StepRetry,
    StepSkip,
    StepCancel,
    RollbackStart,
    RollbackStop,
    RollbackException,
    /// Emitted when `each` expands a collection into per-item executions.
    GraftExpand,
}

impl TelemetrySignal {
    /// Dotted event name, e.g. `step.retry`.
    pub fn as_str(self) -> &'static str {
        match self {
            TelemetrySignal::RunStart => "run.start",
            TelemetrySignal::RunStop => "run.stop",
            TelemetrySignal::RunException => "run.exception",
            TelemetrySignal::StepStart => "step.start",
            TelemetrySignal::StepStop => "step.stop",
            TelemetrySignal::StepException => "step.exception",
            TelemetrySignal::StepRetry => "step.retry",
            TelemetrySignal::StepSkip => "step.skip",
            TelemetrySignal::StepCancel => "step.cancel",
            TelemetrySignal::RollbackStart => "rollback.start",
            TelemetrySignal::RollbackStop => "rollback.stop",
            TelemetrySignal::RollbackException => "rollback.exception",
            TelemetrySignal::GraftExpand => "graft.expand",
        }
    }
}

impl std::fmt::Display for TelemetrySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result label attached to stop events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeLabel {
    Ok,
    Error,
    Halted,
    Skipped,
}

impl OutcomeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeLabel::Ok => "ok",
            OutcomeLabel::Error => "error",
            OutcomeLabel::Halted => "halted",
            OutcomeLabel::Skipped => "skipped",
        }
    }
}

/// One telemetry emission.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    /// The transition being reported.
    pub signal: TelemetrySignal,
    /// Wall-clock duration, on stop/retry events.
    pub duration: Option<Duration>,
    /// Monotonic capture time.
    pub monotonic_time: Instant,
    /// Name of the workflow the event belongs to.
    pub workflow_name: String,
    /// Execution id of the run.
    pub exec_id: String,
    /// Step name, on step and rollback events.
    pub step_name: Option<String>,
    /// Attempt number, on step events.
    pub attempt: Option<u32>,
    /// Result label, on stop events.
    pub result: Option<OutcomeLabel>,
    /// Expanded item count, on `graft.expand`.
    pub item_count: Option<usize>,
}

impl TelemetryEvent {
    /// A bare event for `signal` with run-level metadata.
    pub fn new(
        signal: TelemetrySignal,
        workflow_name: impl Into<String>,
        exec_id: impl Into<String>,
    ) -> Self {
        Self {
            signal,
            duration: None,
            monotonic_time: Instant::now(),
            workflow_name: workflow_name.into(),
            exec_id: exec_id.into(),
            step_name: None,
            attempt: None,
            result: None,
            item_count: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step_name = Some(step.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_result(mut self, result: OutcomeLabel) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_item_count(mut self, count: usize) -> Self {
        self.item_count = Some(count);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_are_dotted() {
        assert_eq!(TelemetrySignal::RunStart.as_str(), "run.start");
        assert_eq!(TelemetrySignal::StepRetry.as_str(), "step.retry");
        assert_eq!(TelemetrySignal::RollbackStop.as_str(), "rollback.stop");
        assert_eq!(TelemetrySignal::GraftExpand.as_str(), "graft.expand");
    }

    #[test]
    fn test_event_builder_chain() {
        let event = TelemetryEvent::new(TelemetrySignal::StepStop, "checkout", "exec-1")
            .with_step("charge")
            .with_attempt(2)
            .with_duration(Duration::from_millis(40))
            .with_result(OutcomeLabel::Error);
        assert_eq!(event.workflow_name, "checkout");
        assert_eq!(event.step_name.as_deref(), Some("charge"));
        assert_eq!(event.attempt, Some(2));
        assert_eq!(event.duration, Some(Duration::from_millis(40)));
        assert_eq!(event.result, Some(OutcomeLabel::Error));
        assert_eq!(event.item_count, None);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(OutcomeLabel::Ok.as_str(), "ok");
        assert_eq!(OutcomeLabel::Halted.as_str(), "halted");
    }
}
