//! Retry policies and pure backoff delay computation.
//!
//! A `RetryPolicy` describes how many attempts a step gets and how long to
//! wait between them. The delay computation is pure: randomness is injected
//! as uniform samples in `[0, 1)`, so tests can pin the sample and assert
//! exact delays.

use serde::{Deserialize, Serialize};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant `base_delay_ms` between attempts.
    Fixed,
    /// `base * attempt`, capped at `max_delay_ms`.
    Linear,
    /// `base * 2^(attempt - 1)`, capped at `max_delay_ms`.
    Exponential,
    /// `base + uniform * (base * 3^(attempt - 1) - base)`, capped.
    DecorrelatedJitter,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in milliseconds (default 100).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff strategy (default exponential).
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Cap on the computed delay in milliseconds (default 30s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter fraction `j` in `[0, 1]`: the computed delay is multiplied by
    /// a uniform factor in `[1 - j, 1 + j]` (default 0, no jitter).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            strategy: BackoffStrategy::default(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A fixed-delay policy, the simplest useful shape.
    pub fn fixed(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            strategy: BackoffStrategy::Fixed,
            ..Self::default()
        }
    }

    /// An exponential policy with the given base and cap.
    pub fn exponential(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            strategy: BackoffStrategy::Exponential,
            max_delay_ms,
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Compute the delay in milliseconds before the attempt following
    /// `attempt` (1-based). `sample` supplies uniform values in `[0, 1)`;
    /// it is consulted once for decorrelated jitter and once more when a
    /// jitter fraction is configured.
    pub fn delay_ms(&self, attempt: u32, mut sample: impl FnMut() -> f64) -> u64 {
        let attempt = attempt.max(1);
        let base = self.base_delay_ms;

        let computed = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)).min(self.max_delay_ms),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor).min(self.max_delay_ms)
            }
            BackoffStrategy::DecorrelatedJitter => {
                // 3^(attempt-1) overflows f64 usefulness past ~40 doublings;
                // the cap makes the exact ceiling irrelevant by then.
                let exponent = i32::try_from(attempt.min(41)).unwrap_or(41) - 1;
                let ceiling = base as f64 * 3f64.powi(exponent);
                let spread = (ceiling - base as f64).max(0.0);
                let raw = (base as f64 + sample() * spread).round() as u64;
                return raw.min(self.max_delay_ms);
            }
        };

        self.jittered(computed, &mut sample)
    }

    fn jittered(&self, value: u64, sample: &mut impl FnMut() -> f64) -> u64 {
        if self.jitter <= 0.0 {
            return value;
        }
        let j = self.jitter.clamp(0.0, 1.0);
        let factor = (1.0 - j + 2.0 * j * sample()).max(0.0);
        (value as f64 * factor).round() as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
