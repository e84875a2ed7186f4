//! Workflow builder and the frozen `Workflow` graph.
//!
//! `WorkflowBuilder` accumulates step descriptors and workflow-level
//! registrations (middleware, hooks, services, ensure callbacks);
//! `build()` validates the graph -- unique names, resolvable predecessors,
//! acyclicity, kind-specific payloads -- and freezes everything into a
//! `Workflow` with a precomputed, declaration-stable topological order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cascade_types::error::ErrorTag;
use cascade_types::retry::RetryPolicy;
use cascade_types::telemetry::OutcomeLabel;
use serde_json::{Map, Value};
use thiserror::Error;

use super::checkpoint::CheckpointStore;
use super::context::Context;
use super::dag::{self, ExecutionPlan};
use super::hooks::Hooks;
use super::services::Services;
use super::step::{
    AssignFn, BodyFn, BranchSpec, CatchFn, CheckpointSpec, CircuitPolicy, ContextMapFn, EachSpec,
    EmbedSpec, EnsureFn, ExtractorFn, Fallback, MiddlewareFn, NextFn, OnError, ParallelErrorMode,
    ParallelSpec, RaceSpec, RateLimitPolicy, ReleaseFn, RetrySpec, RouteTarget, SelectorFn,
    StepAction, StepDescriptor, StepError, StepKind, StepOutput, UsingSpec, WhenFn,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural validation failures raised by `build()`.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two steps share a name.
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    /// A step references a predecessor that does not exist.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    /// A kind-specific payload is structurally invalid.
    #[error("invalid step '{step}': {reason}")]
    InvalidMeta { step: String, reason: String },
}

// ---------------------------------------------------------------------------
// Body boxing helpers
// ---------------------------------------------------------------------------

fn body_fn<F, Fut>(body: F) -> BodyFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepOutput> + Send + 'static,
{
    Arc::new(move |ctx, _services| Box::pin(body(ctx)))
}

fn body_fn_with_services<F, Fut>(body: F) -> BodyFn
where
    F: Fn(Context, Services) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepOutput> + Send + 'static,
{
    Arc::new(move |ctx, services| Box::pin(body(ctx, services)))
}

fn check_body<F>(check: F) -> BodyFn
where
    F: Fn(&Context) -> Result<(), Value> + Send + Sync + 'static,
{
    Arc::new(move |ctx, _services| {
        let result = check(&ctx);
        Box::pin(async move {
            match result {
                Ok(()) => StepOutput::empty(),
                Err(reason) => StepOutput::err(reason),
            }
        })
    })
}

// ---------------------------------------------------------------------------
// StepBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for one step descriptor.
///
/// Construct with a kind-specific constructor (`run`, `validate`,
/// `parallel`, ...), chain option setters, and hand the result to
/// `WorkflowBuilder::add`.
pub struct StepBuilder {
    name: String,
    kind: StepKind,
    action: StepAction,
    after: Vec<String>,
    when: Option<WhenFn>,
    timeout: Option<Duration>,
    retry: Option<RetrySpec>,
    catch: Option<CatchFn>,
    fallback: Option<Fallback>,
    rollback: Option<super::step::RollbackFn>,
    on_error: OnError,
    circuit: Option<CircuitPolicy>,
    rate_limit: Option<RateLimitPolicy>,
    metadata: HashMap<String, Value>,
}

impl StepBuilder {
    fn base(name: impl Into<String>, kind: StepKind, action: StepAction) -> Self {
        Self {
            name: name.into(),
            kind,
            action,
            after: Vec::new(),
            when: None,
            timeout: None,
            retry: None,
            catch: None,
            fallback: None,
            rollback: None,
            on_error: OnError::Fail,
            circuit: None,
            rate_limit: None,
            metadata: HashMap::new(),
        }
    }

    // -- kind constructors --------------------------------------------------

    /// A sequential step whose body reads the context.
    pub fn run<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        Self::base(name, StepKind::Step, StepAction::Body(body_fn(body)))
    }

    /// A sequential step whose body also receives the injected services.
    pub fn run_with_services<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context, Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        Self::base(
            name,
            StepKind::Step,
            StepAction::Body(body_fn_with_services(body)),
        )
    }

    /// A context check: `Ok(())` contributes nothing, `Err` fails the step.
    pub fn validate<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Context) -> Result<(), Value> + Send + Sync + 'static,
    {
        Self::base(name, StepKind::Validate, StepAction::Body(check_body(check)))
    }

    /// A precondition: same protocol as `validate`, declared intent.
    pub fn require<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Context) -> Result<(), Value> + Send + Sync + 'static,
    {
        Self::base(name, StepKind::Require, StepAction::Body(check_body(check)))
    }

    /// An observational step: the body runs, its output is discarded, and
    /// the step always contributes `{}`.
    pub fn tap<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        let inner = body_fn(body);
        let wrapped: BodyFn = Arc::new(move |ctx, services| {
            let fut = inner(ctx, services);
            Box::pin(async move {
                match fut.await {
                    StepOutput::Error(err) => {
                        tracing::warn!(error = %err.reason, "tap body failed; output ignored");
                    }
                    StepOutput::Halt(reason) => {
                        tracing::debug!(reason = %reason, "tap body halted; output ignored");
                    }
                    StepOutput::Ok(_) => {}
                }
                StepOutput::empty()
            })
        });
        Self::base(name, StepKind::Tap, StepAction::Body(wrapped))
    }

    /// Bind `key` to the value computed from the context.
    pub fn assign<F>(name: impl Into<String>, key: impl Into<String>, value_fn: F) -> Self
    where
        F: Fn(&Context) -> Value + Send + Sync + 'static,
    {
        let key = key.into();
        let value_fn: AssignFn = Arc::new(value_fn);
        let body: BodyFn = Arc::new(move |ctx, _services| {
            let mut fields = Map::new();
            fields.insert(key.clone(), value_fn(&ctx));
            Box::pin(async move { StepOutput::Ok(Value::Object(fields)) })
        });
        Self::base(name, StepKind::Assign, StepAction::Body(body))
    }

    /// Bind `key` to a constant value.
    pub fn assign_value(
        name: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::assign(name, key, move |_| value.clone())
    }

    /// A parallel group of substeps.
    pub fn parallel(name: impl Into<String>, group: ParallelBuilder) -> Self {
        Self::base(name, StepKind::Parallel, StepAction::Parallel(group.into_spec()))
    }

    /// A conditional route chosen by a selector over the context.
    pub fn branch(name: impl Into<String>, branch: BranchBuilder) -> Self {
        Self::base(name, StepKind::Branch, StepAction::Branch(branch.into_spec()))
    }

    /// Run a nested workflow against the parent context.
    pub fn embed(name: impl Into<String>, workflow: Workflow) -> Self {
        Self::base(
            name,
            StepKind::Embed,
            StepAction::Embed(EmbedSpec {
                workflow,
                map_context: None,
            }),
        )
    }

    /// Run a nested workflow against a transformed parent context.
    pub fn embed_mapped<F>(name: impl Into<String>, workflow: Workflow, map: F) -> Self
    where
        F: Fn(&Context) -> Context + Send + Sync + 'static,
    {
        let map: ContextMapFn = Arc::new(map);
        Self::base(
            name,
            StepKind::Embed,
            StepAction::Embed(EmbedSpec {
                workflow,
                map_context: Some(map),
            }),
        )
    }

    /// Iterate a nested workflow over an extracted collection.
    pub fn each(name: impl Into<String>, each: EachBuilder) -> Self {
        Self::base(name, StepKind::Each, StepAction::Each(each.into_spec()))
    }

    /// Race nested workflows; the first success wins.
    pub fn race(name: impl Into<String>, race: RaceBuilder) -> Self {
        Self::base(name, StepKind::Race, StepAction::Race(race.into_spec()))
    }

    /// Scoped resource: acquire, run a nested workflow, always release.
    pub fn using(name: impl Into<String>, using: UsingBuilder) -> Self {
        Self::base(name, StepKind::Using, StepAction::Using(using.into_spec()))
    }

    /// A named pause point persisting state through `store`.
    pub fn checkpoint(name: impl Into<String>, store: Arc<dyn CheckpointStore>) -> Self {
        Self::base(
            name,
            StepKind::Checkpoint,
            StepAction::Checkpoint(CheckpointSpec { store }),
        )
    }

    // -- option setters -----------------------------------------------------

    /// Explicit predecessors. Steps without any inherit an implicit edge
    /// from the previously declared step.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Skip the step when the predicate is false.
    pub fn when(mut self, pred: impl Fn(&Context) -> bool + Send + Sync + 'static) -> Self {
        self.when = Some(Arc::new(pred));
        self
    }

    /// Upper bound for a single attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry failed attempts according to `policy`.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        let retry_if = self.retry.take().and_then(|spec| spec.retry_if);
        let mut spec = RetrySpec::new(policy);
        spec.retry_if = retry_if;
        self.retry = Some(spec);
        self
    }

    /// Restrict retries to failures matching the predicate.
    pub fn retry_if(mut self, pred: impl Fn(&StepError) -> bool + Send + Sync + 'static) -> Self {
        let spec = self
            .retry
            .take()
            .unwrap_or_else(|| RetrySpec::new(RetryPolicy::default()));
        self.retry = Some(spec.retry_if(pred));
        self
    }

    /// Map a failure into a replacement output (may recover to `Ok`).
    pub fn catch(mut self, handler: impl Fn(&StepError) -> StepOutput + Send + Sync + 'static) -> Self {
        self.catch = Some(Arc::new(handler));
        self
    }

    /// Substitute `value` for any failure.
    pub fn fallback(mut self, value: Value) -> Self {
        self.fallback = Some(Fallback { value, tags: None });
        self
    }

    /// Substitute `value` for failures carrying one of `tags`.
    pub fn fallback_on(mut self, value: Value, tags: Vec<ErrorTag>) -> Self {
        self.fallback = Some(Fallback {
            value,
            tags: Some(tags),
        });
        self
    }

    /// Compensation invoked in reverse-completion order when a later step
    /// fails.
    pub fn rollback<F, Fut>(mut self, compensation: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Value>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move |ctx| Box::pin(compensation(ctx))));
        self
    }

    /// What to do when the step fails after local recovery.
    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Declarative circuit-breaker tag (enforced by outer wrappers).
    pub fn circuit(mut self, policy: CircuitPolicy) -> Self {
        self.circuit = Some(policy);
        self
    }

    /// Declarative rate-limit tag (enforced by outer wrappers).
    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    /// Attach free-form metadata.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn into_descriptor(self) -> StepDescriptor {
        StepDescriptor {
            name: self.name,
            kind: self.kind,
            action: self.action,
            after: self.after,
            when: self.when,
            timeout: self.timeout,
            retry: self.retry,
            catch: self.catch,
            fallback: self.fallback,
            rollback: self.rollback,
            on_error: self.on_error,
            circuit: self.circuit,
            rate_limit: self.rate_limit,
            metadata: self.metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// Kind-specific sub-builders
// ---------------------------------------------------------------------------

/// Builds the substep bag of a parallel group.
#[derive(Default)]
pub struct ParallelBuilder {
    substeps: Vec<(String, BodyFn)>,
    on_error: Option<ParallelErrorMode>,
    timeout: Option<Duration>,
    max_concurrency: Option<usize>,
}

impl ParallelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a substep; results merge in declaration order.
    pub fn substep<F, Fut>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        self.substeps.push((name.into(), body_fn(body)));
        self
    }

    /// Fail-fast (default) or continue on substep errors.
    pub fn on_error(mut self, mode: ParallelErrorMode) -> Self {
        self.on_error = Some(mode);
        self
    }

    /// Deadline for the whole group (default 30s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fan-out bound (default: twice the available parallelism).
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    fn into_spec(self) -> ParallelSpec {
        ParallelSpec {
            substeps: self.substeps,
            on_error: self.on_error.unwrap_or(ParallelErrorMode::FailFast),
            timeout: self.timeout,
            max_concurrency: self.max_concurrency,
        }
    }
}

/// Builds the route table of a branch step.
pub struct BranchBuilder {
    selector: SelectorFn,
    routes: Vec<(String, RouteTarget)>,
    fallback_route: Option<RouteTarget>,
}

impl BranchBuilder {
    /// Create a branch routed by `selector`.
    pub fn new(selector: impl Fn(&Context) -> String + Send + Sync + 'static) -> Self {
        Self {
            selector: Arc::new(selector),
            routes: Vec::new(),
            fallback_route: None,
        }
    }

    /// Route `key` to a body.
    pub fn route<F, Fut>(mut self, key: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        self.routes
            .push((key.into(), RouteTarget::Body(body_fn(body))));
        self
    }

    /// Route `key` to a nested workflow.
    pub fn route_workflow(mut self, key: impl Into<String>, workflow: Workflow) -> Self {
        self.routes
            .push((key.into(), RouteTarget::Workflow(workflow)));
        self
    }

    /// Default body when no route matches.
    pub fn default_route<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        self.fallback_route = Some(RouteTarget::Body(body_fn(body)));
        self
    }

    /// Default nested workflow when no route matches.
    pub fn default_workflow(mut self, workflow: Workflow) -> Self {
        self.fallback_route = Some(RouteTarget::Workflow(workflow));
        self
    }

    fn into_spec(self) -> BranchSpec {
        BranchSpec {
            selector: self.selector,
            routes: self.routes,
            fallback_route: self.fallback_route,
        }
    }
}

/// Builds an `each` iteration.
pub struct EachBuilder {
    extractor: ExtractorFn,
    item_workflow: Workflow,
    concurrency: usize,
    bind: String,
    collect: String,
}

impl EachBuilder {
    /// Iterate `item_workflow` over the items produced by `extractor`.
    pub fn new<F>(extractor: F, item_workflow: Workflow) -> Self
    where
        F: Fn(&Context) -> Result<Vec<Value>, Value> + Send + Sync + 'static,
    {
        Self {
            extractor: Arc::new(extractor),
            item_workflow,
            concurrency: 1,
            bind: "item".to_string(),
            collect: "results".to_string(),
        }
    }

    /// Key under which each item is exposed to the nested workflow
    /// (default `item`).
    pub fn bind_as(mut self, key: impl Into<String>) -> Self {
        self.bind = key.into();
        self
    }

    /// Key under which the per-item outputs are gathered in input order
    /// (default `results`).
    pub fn collect_into(mut self, key: impl Into<String>) -> Self {
        self.collect = key.into();
        self
    }

    /// Bounded fan-out; 1 (the default) iterates sequentially.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn into_spec(self) -> EachSpec {
        EachSpec {
            extractor: self.extractor,
            item_workflow: self.item_workflow,
            concurrency: self.concurrency,
            bind: self.bind,
            collect: self.collect,
        }
    }
}

/// Builds a race over nested workflows.
#[derive(Default)]
pub struct RaceBuilder {
    entrants: Vec<Workflow>,
    timeout: Option<Duration>,
}

impl RaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant.
    pub fn entrant(mut self, workflow: Workflow) -> Self {
        self.entrants.push(workflow);
        self
    }

    /// Deadline for a winner to emerge.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_spec(self) -> RaceSpec {
        RaceSpec {
            entrants: self.entrants,
            timeout: self.timeout,
        }
    }
}

/// Builds a scoped-resource (`using`) step.
pub struct UsingBuilder {
    acquire: BodyFn,
    release: ReleaseFn,
    body: Workflow,
    bind: Option<String>,
}

impl UsingBuilder {
    /// Acquire a resource, run `body` against the scoped context, and
    /// always release.
    pub fn new<AF, AFut, RF, RFut>(acquire: AF, release: RF, body: Workflow) -> Self
    where
        AF: Fn(Context) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = StepOutput> + Send + 'static,
        RF: Fn(Context, Result<(), Value>) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<(), Value>> + Send + 'static,
    {
        Self {
            acquire: body_fn(acquire),
            release: Arc::new(move |ctx, outcome| Box::pin(release(ctx, outcome))),
            body,
            bind: None,
        }
    }

    /// Additionally expose the acquired mapping under `key`.
    pub fn bind_as(mut self, key: impl Into<String>) -> Self {
        self.bind = Some(key.into());
        self
    }

    fn into_spec(self) -> UsingSpec {
        UsingSpec {
            acquire: self.acquire,
            release: self.release,
            body: self.body,
            bind: self.bind,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A built, immutable workflow graph.
///
/// Cheap to clone: steps, callbacks, and stores are shared by `Arc`.
#[derive(Clone)]
pub struct Workflow {
    pub(crate) name: String,
    pub(crate) steps: Vec<Arc<StepDescriptor>>,
    pub(crate) by_name: HashMap<String, usize>,
    pub(crate) plan: ExecutionPlan,
    pub(crate) middleware: Vec<MiddlewareFn>,
    pub(crate) hooks: Hooks,
    pub(crate) services: Services,
    pub(crate) ensure: Vec<EnsureFn>,
    pub(crate) checkpoints: Vec<(String, Arc<dyn CheckpointStore>)>,
}

impl Workflow {
    /// Start building a workflow.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.by_name.get(name).map(|&i| self.steps[i].as_ref())
    }

    /// Steps in declaration order (read-only; visualization consumers walk
    /// this).
    pub fn steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps.iter().map(Arc::as_ref)
    }

    /// Step names in the stable topological execution order.
    pub fn topological_names(&self) -> Vec<&str> {
        self.plan
            .order
            .iter()
            .map(|&i| self.steps[i].name.as_str())
            .collect()
    }

    /// Effective predecessors of a step, implicit edges included.
    pub fn predecessors(&self, name: &str) -> Option<&[String]> {
        self.plan.predecessors.get(name).map(Vec::as_slice)
    }

    /// Whether this workflow declares any checkpoint steps.
    pub fn has_checkpoints(&self) -> bool {
        !self.checkpoints.is_empty()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("middleware", &self.middleware.len())
            .field("checkpoints", &self.checkpoints.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Accumulates steps and workflow-level registrations.
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepBuilder>,
    middleware: Vec<MiddlewareFn>,
    hooks: Hooks,
    services: Services,
    ensure: Vec<EnsureFn>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            middleware: Vec::new(),
            hooks: Hooks::default(),
            services: Services::new(),
            ensure: Vec::new(),
        }
    }

    /// Add a fully configured step.
    pub fn add(mut self, step: StepBuilder) -> Self {
        self.steps.push(step);
        self
    }

    /// Shorthand for `add(StepBuilder::run(name, body))`.
    pub fn step<F, Fut>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        self.add(StepBuilder::run(name, body))
    }

    /// Register a middleware; the first registered is outermost.
    pub fn middleware<F, Fut>(mut self, middleware: F) -> Self
    where
        F: Fn(String, Context, NextFn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutput> + Send + 'static,
    {
        self.middleware
            .push(Arc::new(move |name, ctx, next| {
                Box::pin(middleware(name, ctx, next))
            }));
        self
    }

    pub fn on_start(mut self, hook: impl Fn(&str, &Context) + Send + Sync + 'static) -> Self {
        self.hooks.on_start.push(Arc::new(hook));
        self
    }

    pub fn on_complete(mut self, hook: impl Fn(&str, &Context) + Send + Sync + 'static) -> Self {
        self.hooks.on_complete.push(Arc::new(hook));
        self
    }

    pub fn on_error(
        mut self,
        hook: impl Fn(&str, &Value, &Context) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_error.push(Arc::new(hook));
        self
    }

    pub fn on_rollback(mut self, hook: impl Fn(&str, &Context) + Send + Sync + 'static) -> Self {
        self.hooks.on_rollback.push(Arc::new(hook));
        self
    }

    /// Register a named service available to two-arity bodies.
    pub fn service<T: Send + Sync + 'static>(
        mut self,
        name: impl Into<String>,
        service: T,
    ) -> Self {
        self.services.insert(name, service);
        self
    }

    /// Register a cleanup callback run once with the terminal outcome.
    pub fn ensure(mut self, cleanup: impl Fn(OutcomeLabel) + Send + Sync + 'static) -> Self {
        self.ensure.push(Arc::new(cleanup));
        self
    }

    /// Validate and freeze the workflow.
    pub fn build(self) -> Result<Workflow, GraphError> {
        let steps: Vec<Arc<StepDescriptor>> = self
            .steps
            .into_iter()
            .map(|builder| Arc::new(builder.into_descriptor()))
            .collect();

        let plan = dag::plan(&steps)?;
        validate_meta(&self.name, &steps)?;

        let by_name = steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.name.clone(), i))
            .collect();
        let checkpoints = steps
            .iter()
            .filter_map(|step| match &step.action {
                StepAction::Checkpoint(spec) => Some((step.name.clone(), spec.store.clone())),
                _ => None,
            })
            .collect();

        Ok(Workflow {
            name: self.name,
            steps,
            by_name,
            plan,
            middleware: self.middleware,
            hooks: self.hooks,
            services: self.services,
            ensure: self.ensure,
            checkpoints,
        })
    }
}

/// Kind-specific payload validation.
fn validate_meta(workflow_name: &str, steps: &[Arc<StepDescriptor>]) -> Result<(), GraphError> {
    for step in steps {
        match &step.action {
            StepAction::Branch(spec) => {
                if spec.routes.is_empty() && spec.fallback_route.is_none() {
                    return Err(invalid(step, "branch declares no routes"));
                }
            }
            StepAction::Embed(spec) => {
                if spec.workflow.name == workflow_name {
                    return Err(invalid(step, "workflow cannot embed itself"));
                }
                no_nested_checkpoints(step, &spec.workflow)?;
            }
            StepAction::Each(spec) => {
                if spec.concurrency == 0 {
                    return Err(invalid(step, "concurrency must be at least 1"));
                }
                no_nested_checkpoints(step, &spec.item_workflow)?;
            }
            StepAction::Race(spec) => {
                if spec.entrants.is_empty() {
                    return Err(invalid(step, "race declares no participants"));
                }
                for entrant in &spec.entrants {
                    no_nested_checkpoints(step, entrant)?;
                }
            }
            StepAction::Using(spec) => {
                no_nested_checkpoints(step, &spec.body)?;
            }
            StepAction::Body(_) | StepAction::Parallel(_) | StepAction::Checkpoint(_) => {}
        }
    }
    Ok(())
}

fn invalid(step: &StepDescriptor, reason: &str) -> GraphError {
    GraphError::InvalidMeta {
        step: step.name.clone(),
        reason: reason.to_string(),
    }
}

/// Checkpoints pause the walk that owns them; a nested workflow has no walk
/// of its own to resume, so nesting one is a build error.
fn no_nested_checkpoints(step: &StepDescriptor, nested: &Workflow) -> Result<(), GraphError> {
    if nested.has_checkpoints() {
        return Err(GraphError::InvalidMeta {
            step: step.name.clone(),
            reason: format!(
                "nested workflow '{}' declares checkpoints; checkpoints only run at the top level",
                nested.name
            ),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
