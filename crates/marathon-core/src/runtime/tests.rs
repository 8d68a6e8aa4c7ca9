#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::runtime::checkpoint::CheckpointStore;
    use crate::runtime::engine::{EngineConfig, PipelineEngine};
    use crate::runtime::executor::StepExecutor;
    use crate::runtime::registry::{TaskEvent, compute_progress, project_completion};
    use crate::runtime::step::{StepDefinition, StepOutput, WorkContext};
    use crate::runtime::types::{EngineError, Step, StepState, Task, TaskId, TaskState};

    // ── helpers ───────────────────────────────────────────────────────────────

    fn engine() -> PipelineEngine {
        PipelineEngine::start(EngineConfig::default())
    }

    /// A step that passes its input state through unchanged.
    fn ok_step(name: &str) -> StepDefinition {
        StepDefinition::from_fn(name, |ctx: WorkContext| async move {
            Ok(StepOutput {
                state: ctx.state,
                result: json!("ok"),
            })
        })
    }

    /// A step that counts invocations and always succeeds.
    fn counted_step(name: &str, calls: Arc<AtomicU32>) -> StepDefinition {
        StepDefinition::from_fn(name, move |ctx: WorkContext| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput {
                    state: ctx.state,
                    result: json!("ok"),
                })
            }
        })
    }

    /// A step that fails its first `fail_first` invocations, then succeeds.
    fn flaky_step(name: &str, fail_first: u32, calls: Arc<AtomicU32>) -> StepDefinition {
        StepDefinition::from_fn(name, move |ctx: WorkContext| {
            let calls = Arc::clone(&calls);
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= fail_first {
                    Err(format!("simulated failure on attempt {attempt}"))
                } else {
                    Ok(StepOutput {
                        state: ctx.state,
                        result: json!({ "attempt": attempt }),
                    })
                }
            }
        })
    }

    /// A step that counts invocations and always fails.
    fn failing_step(name: &str, calls: Arc<AtomicU32>) -> StepDefinition {
        StepDefinition::from_fn(name, move |_ctx: WorkContext| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("simulated failure".to_owned())
            }
        })
    }

    /// A step that sleeps before succeeding.
    fn slow_step(name: &str, millis: u64, calls: Arc<AtomicU32>) -> StepDefinition {
        StepDefinition::from_fn(name, move |ctx: WorkContext| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(StepOutput {
                    state: ctx.state,
                    result: json!(millis),
                })
            }
        })
    }

    async fn wait_terminal(engine: &PipelineEngine, task_id: TaskId) -> Task {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = engine
                    .registry()
                    .get(task_id)
                    .await
                    .expect("task should exist");
                if task.status.is_terminal() {
                    break task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should reach a terminal state within timeout")
    }

    // ── Basic lifecycle ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_step_task_completes() {
        let engine = engine();
        let task_id = engine
            .task()
            .step(ok_step("only"))
            .submit()
            .await
            .expect("submit should succeed");

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Completed);
        assert_eq!(task.current_step_index, task.steps.len());
        assert_eq!(task.progress, 1.0);
        assert!(task.completed_at.is_some());
        assert!(task.estimated_completion.is_none());
        assert!(task.error.is_none());
        assert!(!task.can_recover);
        assert_eq!(task.steps[0].status, StepState::Completed);

        let view = engine
            .registry()
            .view(task_id)
            .await
            .expect("view should exist");
        assert_eq!(view.checkpoints.len(), 1);
        assert_eq!(view.checkpoints[0].step_index, 0);
    }

    #[tokio::test]
    async fn state_flows_between_steps_and_into_checkpoints() {
        let engine = engine();
        let first = StepDefinition::from_fn("first", |_ctx: WorkContext| async move {
            Ok(StepOutput {
                state: json!({ "count": 1 }),
                result: json!(1),
            })
        });
        let second = StepDefinition::from_fn("second", |ctx: WorkContext| async move {
            let count = ctx.state["count"].as_i64().unwrap_or(0) + 1;
            Ok(StepOutput {
                state: json!({ "count": count }),
                result: json!(count),
            })
        });

        let task_id = engine
            .task()
            .step(first)
            .step(second)
            .submit()
            .await
            .expect("submit should succeed");

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Completed);

        let view = engine.registry().view(task_id).await.expect("view");
        assert_eq!(view.checkpoints.len(), 2);
        let last = &view.checkpoints[1];
        assert_eq!(last.state_snapshot, json!({ "count": 2 }));
        assert_eq!(last.accumulated_results.get("first"), Some(&json!(1)));
        assert_eq!(last.accumulated_results.get("second"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn progress_is_monotone_and_index_stays_in_bounds() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let task_id = engine
            .task()
            .step(slow_step("s0", 30, Arc::clone(&calls)))
            .step(slow_step("s1", 30, Arc::clone(&calls)))
            .step(slow_step("s2", 30, Arc::clone(&calls)))
            .step(slow_step("s3", 30, Arc::clone(&calls)))
            .submit()
            .await
            .expect("submit should succeed");

        let mut last_progress = 0.0_f64;
        let task = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = engine.registry().get(task_id).await.expect("task exists");
                assert!(
                    task.progress >= last_progress,
                    "progress went backwards: {} -> {}",
                    last_progress,
                    task.progress
                );
                last_progress = task.progress;
                if task.status == TaskState::Completed {
                    break task;
                }
                // Anything short of Completed keeps the index inside the list.
                assert!(task.current_step_index < task.steps.len());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task should complete within timeout");

        assert_eq!(task.current_step_index, task.steps.len());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    // ── Retry policy ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn last_attempt_success_completes_the_step() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let task_id = engine
            .task()
            .step(flaky_step("flaky", 2, Arc::clone(&calls)).max_retries(3))
            .submit()
            .await
            .expect("submit should succeed");

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(task.steps[0].status, StepState::Completed);
        assert_eq!(task.steps[0].retry_count, 2);
        assert!(task.steps[0].error_message.is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_task_with_one_checkpoint() {
        let engine = engine();
        let calls_first = Arc::new(AtomicU32::new(0));
        let calls_mid = Arc::new(AtomicU32::new(0));
        let calls_last = Arc::new(AtomicU32::new(0));

        let task_id = engine
            .task()
            .step(counted_step("extract", Arc::clone(&calls_first)))
            .step(flaky_step("judge", 2, Arc::clone(&calls_mid)).max_retries(2))
            .step(counted_step("publish", Arc::clone(&calls_last)))
            .submit()
            .await
            .expect("submit should succeed");

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Failed);
        assert_eq!(calls_mid.load(Ordering::SeqCst), 2, "exactly max_retries attempts");
        assert_eq!(calls_last.load(Ordering::SeqCst), 0, "later steps never start");
        assert_eq!(task.current_step_index, 1);
        assert!(task.can_recover);
        assert!(task.error.as_deref().unwrap_or("").contains("simulated failure"));
        assert_eq!(task.steps[1].status, StepState::Failed);
        assert_eq!(task.steps[1].retry_count, 2);
        assert_eq!(task.steps[2].status, StepState::Pending);

        let view = engine.registry().view(task_id).await.expect("view");
        assert_eq!(view.checkpoints.len(), 1);
        assert_eq!(view.checkpoints[0].step_index, 0);

        // Recovery resumes at the failed step, not at the beginning.
        let recovered = engine.recover(task_id).await.expect("recover should succeed");
        assert!(recovered.status.is_active());
        assert!(recovered.error.is_none());

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Completed);
        assert_eq!(calls_first.load(Ordering::SeqCst), 1, "completed steps are not re-run");
        assert_eq!(calls_mid.load(Ordering::SeqCst), 3);
        assert_eq!(calls_last.load(Ordering::SeqCst), 1);
        // Historical failure count stays visible after the recovered success.
        assert_eq!(task.steps[1].retry_count, 2);
        assert_eq!(task.progress, 1.0);

        let view = engine.registry().view(task_id).await.expect("view");
        assert_eq!(view.checkpoints.len(), 3);
    }

    #[tokio::test]
    async fn task_without_checkpoints_is_not_recoverable() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let task_id = engine
            .task()
            .step(failing_step("doomed", Arc::clone(&calls)).max_retries(1))
            .submit()
            .await
            .expect("submit should succeed");

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!task.can_recover);
        let view = engine.registry().view(task_id).await.expect("view");
        assert!(view.checkpoints.is_empty());

        let err = engine.recover(task_id).await.unwrap_err();
        assert!(
            matches!(err, EngineError::NotRecoverable { .. }),
            "expected NotRecoverable, got {err:?}"
        );
    }

    #[tokio::test]
    async fn repeated_recovery_resumes_from_the_same_point() {
        let engine = engine();
        let calls_first = Arc::new(AtomicU32::new(0));
        let calls_bad = Arc::new(AtomicU32::new(0));

        let task_id = engine
            .task()
            .step(counted_step("seed", Arc::clone(&calls_first)))
            .step(failing_step("bad", Arc::clone(&calls_bad)).max_retries(1))
            .submit()
            .await
            .expect("submit should succeed");

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Failed);
        assert_eq!(task.current_step_index, 1);

        for round in 1..=2u32 {
            engine.recover(task_id).await.expect("recover should succeed");
            let task = wait_terminal(&engine, task_id).await;
            assert_eq!(task.status, TaskState::Failed);
            assert_eq!(task.current_step_index, 1, "resume point is stable");
            assert!(task.can_recover);
            assert_eq!(calls_first.load(Ordering::SeqCst), 1);
            assert_eq!(calls_bad.load(Ordering::SeqCst), 1 + round);

            // Re-execution never duplicates the seed checkpoint.
            let view = engine.registry().view(task_id).await.expect("view");
            assert_eq!(view.checkpoints.len(), 1);
            assert_eq!(view.checkpoints[0].step_index, 0);
        }
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_takes_effect_at_the_step_boundary() {
        let engine = engine();
        let calls_a = Arc::new(AtomicU32::new(0));
        let calls_b = Arc::new(AtomicU32::new(0));
        let calls_c = Arc::new(AtomicU32::new(0));

        let task_id = engine
            .task()
            .step(slow_step("a", 100, Arc::clone(&calls_a)))
            .step(slow_step("b", 100, Arc::clone(&calls_b)))
            .step(slow_step("c", 100, Arc::clone(&calls_c)))
            .submit()
            .await
            .expect("submit should succeed");

        // Let the first step get in flight, then request cancellation.
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.cancel(task_id);

        let task = wait_terminal(&engine, task_id).await;
        assert_eq!(task.status, TaskState::Cancelled);
        assert!(
            task.current_step_index <= 1,
            "cancellation never skips ahead (index {})",
            task.current_step_index
        );
        assert_eq!(calls_c.load(Ordering::SeqCst), 0);
        assert_eq!(task.steps[2].status, StepState::Skipped);
        assert!(task.completed_at.is_some());

        // The in-flight step's outcome was still recorded.
        if task.current_step_index == 1 {
            assert_eq!(task.steps[0].status, StepState::Completed);
            let view = engine.registry().view(task_id).await.expect("view");
            assert_eq!(view.checkpoints.len(), 1);
        }
    }

    // ── Validation & lifecycle errors ─────────────────────────────────────────

    #[tokio::test]
    async fn invalid_definitions_are_rejected_synchronously() {
        let engine = engine();

        let err = engine.create(Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));

        let err = engine
            .create(vec![ok_step("")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));

        let err = engine
            .create(vec![ok_step("zero").max_retries(0)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));

        // Nothing was created.
        assert!(engine.registry().list(None).await.is_empty());
    }

    #[tokio::test]
    async fn remove_is_rejected_while_the_task_is_active() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let task_id = engine
            .task()
            .step(slow_step("slow", 150, Arc::clone(&calls)))
            .submit()
            .await
            .expect("submit should succeed");

        let err = engine.registry().remove(task_id).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskStillActive { .. }));

        wait_terminal(&engine, task_id).await;
        engine
            .registry()
            .remove(task_id)
            .await
            .expect("terminal task should be removable");
        assert!(engine.registry().get(task_id).await.is_none());
        assert!(engine.checkpoints().list(task_id).await.is_empty());

        let err = engine.registry().remove(task_id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn gc_removes_only_expired_terminal_tasks() {
        let engine = engine();
        let done_id = engine
            .task()
            .step(ok_step("quick"))
            .submit()
            .await
            .expect("submit should succeed");
        wait_terminal(&engine, done_id).await;

        let calls = Arc::new(AtomicU32::new(0));
        let running_id = engine
            .task()
            .step(slow_step("slow", 200, Arc::clone(&calls)))
            .submit()
            .await
            .expect("submit should succeed");

        let removed = engine.registry().gc_expired(Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert!(engine.registry().get(done_id).await.is_none());
        assert!(engine.registry().get(running_id).await.is_some());

        wait_terminal(&engine, running_id).await;
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let engine = engine();
        let done = engine.task().step(ok_step("one")).submit().await.unwrap();
        wait_terminal(&engine, done).await;
        let calls = Arc::new(AtomicU32::new(0));
        let failed = engine
            .task()
            .step(failing_step("bad", calls).max_retries(1))
            .submit()
            .await
            .unwrap();
        wait_terminal(&engine, failed).await;

        let completed = engine.registry().list(Some(TaskState::Completed)).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done);
        assert_eq!(engine.registry().list(None).await.len(), 2);
    }

    // ── Event stream ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn events_report_each_transition_in_order() {
        let engine = engine();
        let mut events = engine.registry().subscribe();

        let task_id = engine
            .task()
            .step(ok_step("only"))
            .submit()
            .await
            .expect("submit should succeed");

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        assert_eq!(event.task_id(), task_id);
                        let done = matches!(
                            event,
                            TaskEvent::StatusChanged {
                                status: TaskState::Completed,
                                ..
                            }
                        );
                        seen.push(event);
                        if done {
                            break;
                        }
                    }
                    Err(e) => panic!("event channel closed early: {e}"),
                }
            }
        })
        .await
        .expect("terminal event should arrive within timeout");

        let labels: Vec<&'static str> = seen
            .iter()
            .map(|event| match event {
                TaskEvent::StatusChanged { .. } => "status",
                TaskEvent::StepStarted { .. } => "step_started",
                TaskEvent::StepCompleted { .. } => "step_completed",
                TaskEvent::StepFailed { .. } => "step_failed",
                TaskEvent::CheckpointRecorded { .. } => "checkpoint",
            })
            .collect();
        assert_eq!(
            labels,
            vec![
                "status",
                "step_started",
                "checkpoint",
                "step_completed",
                "status"
            ]
        );
    }

    // ── Executor ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn executor_attempts_the_callback_at_most_max_retries_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let definition = failing_step("always-bad", Arc::clone(&calls)).max_retries(3);
        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let report = StepExecutor::execute(&definition, json!({}), cancel_rx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.failed_attempts, 3);
        let failure = report.outcome.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.message, "simulated failure");
    }

    #[tokio::test]
    async fn executor_treats_a_panicking_callback_as_a_failed_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let definition = StepDefinition::from_fn("panicky", {
            let calls = Arc::clone(&calls);
            move |ctx: WorkContext| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("intentional panic");
                    }
                    Ok(StepOutput {
                        state: ctx.state,
                        result: json!("recovered"),
                    })
                }
            }
        })
        .max_retries(2);
        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let report = StepExecutor::execute(&definition, json!({}), cancel_rx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.failed_attempts, 1);
        assert!(report.outcome.is_ok());
    }

    // ── Checkpoint store ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_append_replaces_same_step_index() {
        let store = CheckpointStore::new();
        let task_id = TaskId::new_v4();

        let first = store
            .append(task_id, 0, json!({ "v": 1 }), serde_json::Map::new())
            .await;
        let second = store
            .append(task_id, 0, json!({ "v": 2 }), serde_json::Map::new())
            .await;
        assert_ne!(first, second);

        let list = store.list(task_id).await;
        assert_eq!(list.len(), 1, "re-completion replaces, never duplicates");
        assert_eq!(list[0].state_snapshot, json!({ "v": 2 }));

        store
            .append(task_id, 1, json!({ "v": 3 }), serde_json::Map::new())
            .await;
        let list = store.list(task_id).await;
        assert_eq!(list.len(), 2);
        assert!(list[0].step_index < list[1].step_index);

        let resume = store.latest_before_or_at(task_id, 0).await.expect("hit");
        assert_eq!(resume.step_index, 0);
        let resume = store.latest_before_or_at(task_id, 10).await.expect("hit");
        assert_eq!(resume.step_index, 1);

        store.remove_task(task_id).await;
        assert!(store.list(task_id).await.is_empty());
    }

    // ── Telemetry helpers ─────────────────────────────────────────────────────

    fn make_step(status: StepState, weight: u32, duration_ms: Option<u64>) -> Step {
        Step {
            id: uuid::Uuid::new_v4(),
            name: "step".to_owned(),
            description: String::new(),
            status,
            retry_count: 0,
            max_retries: 1,
            weight,
            started_at: None,
            completed_at: None,
            duration_ms,
            error_message: None,
        }
    }

    #[test]
    fn progress_respects_step_weights() {
        let steps = vec![
            make_step(StepState::Completed, 1, Some(10)),
            make_step(StepState::Pending, 3, None),
        ];
        assert_eq!(compute_progress(&steps), 0.25);

        let steps = vec![
            make_step(StepState::Completed, 1, Some(10)),
            make_step(StepState::Completed, 3, Some(10)),
        ];
        assert_eq!(compute_progress(&steps), 1.0);
    }

    #[test]
    fn completion_projection_uses_average_step_duration() {
        let now = chrono::Utc::now();

        let steps = vec![make_step(StepState::Pending, 1, None)];
        assert!(project_completion(&steps, now).is_none());

        let steps = vec![
            make_step(StepState::Completed, 1, Some(100)),
            make_step(StepState::Pending, 1, None),
            make_step(StepState::Pending, 1, None),
        ];
        let projected = project_completion(&steps, now).expect("projection");
        assert_eq!(projected, now + chrono::Duration::milliseconds(200));

        let steps = vec![make_step(StepState::Completed, 1, Some(100))];
        assert!(project_completion(&steps, now).is_none(), "nothing remains");
    }
}
