use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::runtime::step::{StepDefinition, StepOutput, WorkContext};

/// A step that exhausted its attempt budget.
#[derive(Debug, Clone)]
pub struct StepFailure {
    /// Number of attempts made.
    pub attempts: u32,
    /// The last attempt's error.
    pub message: String,
}

/// Outcome of executing one step, including retry bookkeeping.
#[derive(Debug)]
pub struct ExecReport {
    pub outcome: Result<StepOutput, StepFailure>,
    /// Failed attempts before the final outcome (equals `max_retries` on
    /// failure, anything below it on success).
    pub failed_attempts: u32,
    /// Wall-clock time across all attempts.
    pub duration_ms: u64,
}

/// Runs one step's work callback with the step's retry policy.
///
/// Retries are immediate; callbacks needing backoff or timeouts wrap that
/// behavior themselves and report it as a failed attempt.
pub struct StepExecutor;

impl StepExecutor {
    pub async fn execute(
        definition: &StepDefinition,
        input_state: Value,
        cancel_rx: watch::Receiver<bool>,
    ) -> ExecReport {
        let started = Instant::now();
        let mut failed_attempts = 0u32;
        let mut last_error = String::new();

        for attempt in 1..=definition.max_retries {
            let work = Arc::clone(&definition.work);
            let ctx = WorkContext {
                state: input_state.clone(),
                params: definition.params.clone(),
                cancel: cancel_rx.clone(),
            };

            // Each attempt runs on its own task so that a panicking callback
            // surfaces as a join error and counts as a failed attempt, the
            // same as an explicit Err.
            let outcome = tokio::spawn(async move { work.run(ctx).await }).await;
            match outcome {
                Ok(Ok(output)) => {
                    return ExecReport {
                        outcome: Ok(output),
                        failed_attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Ok(Err(message)) => last_error = message,
                Err(join_error) => {
                    last_error = format!("work callback panicked: {join_error}");
                }
            }

            failed_attempts += 1;
            if attempt < definition.max_retries {
                debug!(
                    step = %definition.name,
                    attempt,
                    error = %last_error,
                    "step attempt failed; retrying"
                );
            }
        }

        warn!(
            step = %definition.name,
            attempts = failed_attempts,
            error = %last_error,
            "step exhausted its retries"
        );
        ExecReport {
            outcome: Err(StepFailure {
                attempts: failed_attempts,
                message: last_error,
            }),
            failed_attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
