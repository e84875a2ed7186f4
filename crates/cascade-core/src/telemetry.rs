//! Broadcast telemetry bus.
//!
//! Built on `tokio::sync::broadcast`: the runtime emits a `TelemetryEvent`
//! at every lifecycle transition and any number of subscribers observe
//! them. Emitting with no active subscribers is a no-op. The process-wide
//! default bus returned by [`global`] is the subscriber registry runtimes
//! use unless one is injected explicitly.

use std::sync::OnceLock;

use cascade_types::telemetry::TelemetryEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for workflow telemetry.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct TelemetryBus {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that receives all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all current subscribers.
    ///
    /// Silently dropped when nobody is listening.
    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for TelemetryBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

/// The process-wide default bus.
///
/// This is the only process-wide state in the engine; everything else is
/// per run.
pub fn global() -> &'static TelemetryBus {
    static GLOBAL: OnceLock<TelemetryBus> = OnceLock::new();
    GLOBAL.get_or_init(|| TelemetryBus::new(1024))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
