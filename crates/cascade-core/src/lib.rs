//! Cascade: a composable workflow orchestration engine.
//!
//! A workflow is a declared graph of steps executed with dependency
//! ordering, bounded concurrency, per-step retries, saga-style rollback,
//! conditional branching, iteration, racing, scoped resources, and
//! checkpoint/resume. The builder freezes the graph; the runtime walks it
//! and emits typed telemetry at every transition.
//!
//! ```no_run
//! use cascade_core::workflow::{Context, RunOptions, Runtime, StepOutput, Workflow};
//! use serde_json::json;
//!
//! # async fn demo() {
//! let workflow = Workflow::builder("double")
//!     .step("compute", |ctx: Context| {
//!         let x = ctx.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
//!         async move { StepOutput::ok(json!({ "y": x * 2 })) }
//!     })
//!     .build()
//!     .unwrap();
//!
//! let runtime = Runtime::default();
//! let outcome = runtime
//!     .run(&workflow, Context::new().with("x", json!(5)), RunOptions::default())
//!     .await;
//! assert!(outcome.is_completed());
//! # }
//! ```

pub mod telemetry;
pub mod workflow;
