use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::runtime::builder::TaskBuilder;
use crate::runtime::checkpoint::CheckpointStore;
use crate::runtime::executor::StepExecutor;
use crate::runtime::registry::TaskRegistry;
use crate::runtime::step::StepDefinition;
use crate::runtime::types::{EngineError, Task, TaskId};

/// Configuration passed to [`PipelineEngine::start`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the engine's command queue.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

/// Commands sent to the engine's internal event loop.
#[derive(Debug)]
enum EngineCommand {
    /// Submit a validated task for execution.
    Submit {
        definitions: Vec<StepDefinition>,
        /// Channel used to return the allocated [`TaskId`] to the caller.
        reply_tx: oneshot::Sender<TaskId>,
    },
    /// Request cooperative cancellation of a task.
    Cancel { task_id: TaskId },
    /// Resume a failed task from its latest checkpoint.
    Recover {
        task_id: TaskId,
        reply_tx: oneshot::Sender<Result<Task, EngineError>>,
    },
}

/// The pipeline engine.
///
/// Accepts task submissions, drives each task's steps strictly in order on
/// its own spawned tokio task, writes a checkpoint after every completed
/// step, and commits all status transitions through the [`TaskRegistry`].
///
/// The engine is an ordinary cloneable handle with an explicit lifecycle:
/// construct it once at process start with [`start`] and share clones; there
/// is no ambient global state.
///
/// [`start`]: PipelineEngine::start
#[derive(Debug, Clone)]
pub struct PipelineEngine {
    registry: TaskRegistry,
    checkpoints: CheckpointStore,
    submit_tx: mpsc::Sender<EngineCommand>,
}

impl PipelineEngine {
    /// Start the engine.
    ///
    /// Spawns the internal command-dispatch loop and returns a
    /// `PipelineEngine` handle.
    pub fn start(config: EngineConfig) -> Self {
        let checkpoints = CheckpointStore::new();
        let registry = TaskRegistry::new(checkpoints.clone());
        let (submit_tx, submit_rx) = mpsc::channel::<EngineCommand>(config.queue_capacity);

        let loop_registry = registry.clone();
        let loop_checkpoints = checkpoints.clone();
        tokio::spawn(async move {
            Self::run_loop(submit_rx, loop_registry, loop_checkpoints).await;
        });

        Self {
            registry,
            checkpoints,
            submit_tx,
        }
    }

    /// The registry backing this engine: the read surface for observers.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The checkpoint store backing this engine.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Start building a task with the fluent API.
    pub fn task(&self) -> TaskBuilder {
        TaskBuilder::new(self.clone())
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Create a task from an ordered, non-empty list of step definitions and
    /// start executing it.
    ///
    /// Validation failures (`InvalidDefinition`) are returned synchronously;
    /// no task is created.
    pub async fn create(
        &self,
        definitions: Vec<StepDefinition>,
    ) -> Result<TaskId, EngineError> {
        validate_definitions(&definitions)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineCommand::Submit {
            definitions,
            reply_tx,
        })?;
        reply_rx.await.map_err(|_| EngineError::EngineShutdown)
    }

    /// Request best-effort cancellation of a task.
    ///
    /// Returns immediately; the running task observes the flag at its next
    /// step boundary. The in-flight step finishes and its outcome is
    /// recorded, but no further steps start.
    pub fn cancel(&self, task_id: TaskId) {
        // Best-effort: ignore send errors (engine may be shutting down).
        let _ = self.submit_tx.try_send(EngineCommand::Cancel { task_id });
    }

    /// Resume a failed task from its latest checkpoint.
    ///
    /// Fails with [`EngineError::NotRecoverable`] when the task is not in the
    /// `Failed` state or no usable checkpoint exists. On success the returned
    /// snapshot already reflects the `Failed → Recovering` transition.
    pub async fn recover(&self, task_id: TaskId) -> Result<Task, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineCommand::Recover { task_id, reply_tx })?;
        reply_rx.await.map_err(|_| EngineError::EngineShutdown)?
    }

    fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        let capacity = self.submit_tx.max_capacity();
        self.submit_tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::QueueFull { capacity },
            mpsc::error::TrySendError::Closed(_) => EngineError::EngineShutdown,
        })
    }

    // ── Internal loop ────────────────────────────────────────────────────────

    /// Internal event loop: receives commands and spawns task drivers.
    async fn run_loop(
        mut rx: mpsc::Receiver<EngineCommand>,
        registry: TaskRegistry,
        checkpoints: CheckpointStore,
    ) {
        while let Some(command) = rx.recv().await {
            match command {
                EngineCommand::Submit {
                    definitions,
                    reply_tx,
                } => {
                    let task_id = registry.insert(definitions.clone()).await;
                    let _ = reply_tx.send(task_id);

                    let task_registry = registry.clone();
                    let task_checkpoints = checkpoints.clone();
                    tokio::spawn(async move {
                        Self::execute_task(
                            task_id,
                            definitions,
                            0,
                            Value::Object(Map::new()),
                            Map::new(),
                            task_registry,
                            task_checkpoints,
                        )
                        .await;
                    });
                }

                EngineCommand::Cancel { task_id } => {
                    match registry.cancel_sender(task_id).await {
                        Some(tx) => {
                            let _ = tx.send(true);
                            info!(task_id = %task_id, "cancellation requested");
                        }
                        None => warn!(task_id = %task_id, "cancel: task not found"),
                    }
                }

                EngineCommand::Recover { task_id, reply_tx } => {
                    match registry.begin_recovery(task_id).await {
                        Ok(plan) => {
                            let snapshot = registry
                                .get(task_id)
                                .await
                                .ok_or(EngineError::NotFound { task_id });
                            let _ = reply_tx.send(snapshot);

                            let task_registry = registry.clone();
                            let task_checkpoints = checkpoints.clone();
                            tokio::spawn(async move {
                                Self::execute_task(
                                    task_id,
                                    plan.definitions,
                                    plan.resume_index,
                                    plan.state_snapshot,
                                    plan.accumulated_results,
                                    task_registry,
                                    task_checkpoints,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            let _ = reply_tx.send(Err(e));
                        }
                    }
                }
            }
        }
    }

    /// Drive a single task through its steps, strictly sequentially.
    async fn execute_task(
        task_id: TaskId,
        definitions: Vec<StepDefinition>,
        start_index: usize,
        mut state: Value,
        mut accumulated: Map<String, Value>,
        registry: TaskRegistry,
        checkpoints: CheckpointStore,
    ) {
        let cancel_rx = match registry.cancel_receiver(task_id).await {
            Some(rx) => rx,
            None => return,
        };

        registry.mark_running(task_id).await;

        for step_index in start_index..definitions.len() {
            // Cancellation is cooperative and checked only at step
            // boundaries: an in-flight step always finishes and records its
            // outcome, but nothing further starts.
            if *cancel_rx.borrow() {
                registry.cancel_task(task_id).await;
                return;
            }

            let definition = &definitions[step_index];
            registry.set_step_running(task_id, step_index).await;

            let report =
                StepExecutor::execute(definition, state.clone(), cancel_rx.clone()).await;
            match report.outcome {
                Ok(output) => {
                    accumulated.insert(definition.name.clone(), output.result);
                    state = output.state;
                    let checkpoint_id = checkpoints
                        .append(task_id, step_index, state.clone(), accumulated.clone())
                        .await;
                    let task_done = registry
                        .complete_step(
                            task_id,
                            step_index,
                            report.duration_ms,
                            report.failed_attempts,
                            checkpoint_id,
                        )
                        .await;
                    if task_done {
                        info!(task_id = %task_id, "task completed");
                        return;
                    }
                }
                Err(failure) => {
                    let can_recover = step_index > 0
                        && checkpoints
                            .latest_before_or_at(task_id, step_index - 1)
                            .await
                            .is_some();
                    registry
                        .fail_task(
                            task_id,
                            step_index,
                            failure.attempts,
                            report.duration_ms,
                            failure.message,
                            can_recover,
                        )
                        .await;
                    return;
                }
            }
        }
    }
}

fn validate_definitions(definitions: &[StepDefinition]) -> Result<(), EngineError> {
    if definitions.is_empty() {
        return Err(EngineError::InvalidDefinition(
            "step list is empty".to_owned(),
        ));
    }
    for (index, definition) in definitions.iter().enumerate() {
        if definition.name.trim().is_empty() {
            return Err(EngineError::InvalidDefinition(format!(
                "step {index} has an empty name"
            )));
        }
        if definition.max_retries == 0 {
            return Err(EngineError::InvalidDefinition(format!(
                "step '{}' has max_retries 0; at least one attempt is required",
                definition.name
            )));
        }
    }
    Ok(())
}
