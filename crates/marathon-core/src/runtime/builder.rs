use crate::runtime::engine::PipelineEngine;
use crate::runtime::step::StepDefinition;
use crate::runtime::types::{EngineError, TaskId};

/// Declarative task builder.
///
/// Use the fluent API to append step definitions, then call [`submit`] to
/// validate the task and hand it to the [`PipelineEngine`].
///
/// ```rust,ignore
/// let task_id = engine
///     .task()
///     .step(StepDefinition::from_fn("fetch", fetch_step).max_retries(3))
///     .step(StepDefinition::from_fn("digest", digest_step))
///     .submit()
///     .await?;
/// ```
///
/// [`submit`]: TaskBuilder::submit
pub struct TaskBuilder {
    engine: PipelineEngine,
    definitions: Vec<StepDefinition>,
}

impl TaskBuilder {
    pub(crate) fn new(engine: PipelineEngine) -> Self {
        Self {
            engine,
            definitions: Vec::new(),
        }
    }

    /// Append a step definition.
    pub fn step(mut self, definition: StepDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Submit the task for execution and return the allocated [`TaskId`].
    pub async fn submit(self) -> Result<TaskId, EngineError> {
        self.engine.create(self.definitions).await
    }
}
