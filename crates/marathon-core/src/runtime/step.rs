use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

/// Input handed to a work callback for one attempt.
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// State snapshot produced by the previous step, or the empty object for
    /// the first step of a run. Opaque to the engine.
    pub state: Value,
    /// Static per-step parameters fixed at task creation.
    pub params: Value,
    /// Cooperative cancellation signal. The engine only acts on it at step
    /// boundaries; long-running callbacks may poll it between units of work.
    pub cancel: watch::Receiver<bool>,
}

impl WorkContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// What a successful attempt hands back to the engine.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The accumulated state to snapshot in this step's checkpoint and feed
    /// into the next step.
    pub state: Value,
    /// This step's entry in the task's observer-visible accumulated results.
    pub result: Value,
}

/// Outcome of one work-callback attempt.
pub type StepResult = Result<StepOutput, String>;

/// The opaque unit-of-work capability injected at task creation.
///
/// Implementations must keep their side effects idempotent across retries;
/// the executor re-invokes `run` on failure without any rollback.
#[async_trait]
pub trait StepWork: Send + Sync + 'static {
    async fn run(&self, ctx: WorkContext) -> StepResult;
}

/// Adapter that lets a plain async closure act as a [`StepWork`].
pub struct StepFn<F>(pub F);

#[async_trait]
impl<F, Fut> StepWork for StepFn<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    async fn run(&self, ctx: WorkContext) -> StepResult {
        (self.0)(ctx).await
    }
}

/// Describes a single step in a task's pipeline.
///
/// Definitions are cloneable descriptions (not running work); the engine
/// consumes them when driving a task and keeps a copy for recovery.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub description: String,
    /// Maximum number of attempts before the step fails the task. At least 1.
    pub max_retries: u32,
    /// Relative share of this step in progress computation.
    pub weight: u32,
    /// Opaque parameters forwarded to every attempt.
    pub params: Value,
    pub work: Arc<dyn StepWork>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("weight", &self.weight)
            .finish()
    }
}

impl StepDefinition {
    /// Construct a definition from a name and a work capability.
    pub fn new(name: impl Into<String>, work: impl StepWork) -> Self {
        Self::with_work(name, Arc::new(work))
    }

    /// Construct a definition sharing an already-boxed work capability,
    /// e.g. one held by a work-callback registry.
    pub fn with_work(name: impl Into<String>, work: Arc<dyn StepWork>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            max_retries: 1,
            weight: 1,
            params: Value::Null,
            work,
        }
    }

    /// Construct a definition from a name and an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        Self::new(name, StepFn(work))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the maximum number of attempts. Zero is rejected at submission.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}
