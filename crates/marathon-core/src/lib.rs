mod runtime;

pub use runtime::builder::TaskBuilder;
pub use runtime::checkpoint::{Checkpoint, CheckpointStore};
pub use runtime::engine::{EngineConfig, PipelineEngine};
pub use runtime::executor::{ExecReport, StepExecutor, StepFailure};
pub use runtime::registry::{TaskEvent, TaskRegistry};
pub use runtime::step::{StepDefinition, StepFn, StepOutput, StepResult, StepWork, WorkContext};
pub use runtime::types::{EngineError, Step, StepState, Task, TaskId, TaskState, TaskView};
