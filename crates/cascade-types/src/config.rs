//! Engine configuration.
//!
//! `EngineConfig` controls the runtime defaults that are not set per step:
//! the fallback step timeout, the parallel-group timeout, the fan-out bound,
//! and the telemetry channel capacity. All fields have sensible defaults and
//! the whole struct can be loaded from TOML.

use serde::{Deserialize, Serialize};

/// Runtime defaults for the Cascade engine.
///
/// Loaded from a `cascade.toml` section or built in code. Every field is
/// optional in the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to a single step attempt when the step does not set
    /// its own. `None` means attempts are unbounded.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,

    /// Timeout for a parallel group that does not set its own (default 30s).
    #[serde(default = "default_parallel_timeout_ms")]
    pub parallel_timeout_ms: u64,

    /// Upper bound on concurrent substeps for parallel groups, `each`, and
    /// `race`. `None` means twice the available parallelism.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Capacity of the telemetry broadcast channel.
    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,
}

fn default_parallel_timeout_ms() -> u64 {
    30_000
}

fn default_telemetry_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: None,
            parallel_timeout_ms: default_parallel_timeout_ms(),
            max_concurrency: None,
            telemetry_capacity: default_telemetry_capacity(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// The effective fan-out bound: the configured value, or twice the
    /// available parallelism when unset.
    pub fn effective_max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cores * 2
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
