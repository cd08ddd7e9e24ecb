//! Task dispatch for the final processing stage
//!
//! Every descriptor of a plan goes to a worker under the bounded pool.
//! `execute_plan` is a join barrier: it returns one result per task, in plan
//! order, only after every task succeeded, failed or was cancelled.

use crate::capability::{with_retry, TextGenerator};
use crate::concurrency::{run_bounded, UnitOutcome};
use crate::config::{RetryPolicy, TaskConfig};
use crate::error::PipelineError;
use crate::models::MessageRecord;
use crate::planner::{TaskDescriptor, TaskPlan};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub order: u32,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub execution_time_ms: u64,
}

impl TaskResult {
    fn cancelled(task: &TaskDescriptor) -> Self {
        Self {
            task_id: task.task_id,
            order: task.order,
            status: TaskStatus::Cancelled,
            output: None,
            error: Some("cancelled before completion".to_string()),
            attempts: 0,
            execution_time_ms: 0,
        }
    }

    fn failed(task: &TaskDescriptor, error: String, attempts: u32) -> Self {
        Self {
            task_id: task.task_id,
            order: task.order,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error),
            attempts,
            execution_time_ms: 0,
        }
    }
}

/// Trait for final-stage workers
#[async_trait]
pub trait TaskWorker: Send + Sync {
    /// Perform one attempt of `task` over its member messages
    async fn execute(&self, task: &TaskDescriptor, messages: &[Arc<MessageRecord>]) -> Result<String>;
}

/// Worker that hands the task to the text generation capability
pub struct LlmTaskWorker {
    generator: Arc<dyn TextGenerator>,
}

impl LlmTaskWorker {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl TaskWorker for LlmTaskWorker {
    async fn execute(&self, task: &TaskDescriptor, messages: &[Arc<MessageRecord>]) -> Result<String> {
        let listing = messages
            .iter()
            .map(|m| format!("- {}", m.summary_line()))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "TASK {} ({})\n{}\n\nMESSAGES:\n{}\n\nProcess these messages and report the outcome. \
             If the task cannot be completed, answer with a line `STATUS: FAILED <reason>`.",
            task.order, task.task_type, task.instructions, listing
        );

        // Timeout and retries are owned by the dispatcher
        let output = self.generator.generate(&prompt, &[]).await?;

        if let Some(reason) = output
            .lines()
            .find_map(|line| line.trim().strip_prefix("STATUS: FAILED"))
        {
            return Err(PipelineError::WorkerError(format!(
                "task {} reported failure:{}",
                task.order, reason
            )));
        }

        Ok(output)
    }
}

/// Dispatches plans to a worker with bounded concurrency and retry
pub struct TaskDispatcher {
    worker: Arc<dyn TaskWorker>,
    config: TaskConfig,
}

impl TaskDispatcher {
    pub fn new(worker: Arc<dyn TaskWorker>, config: TaskConfig) -> Self {
        Self { worker, config }
    }

    pub async fn execute_plan(
        &self,
        plan: &TaskPlan,
        messages: &HashMap<String, Arc<MessageRecord>>,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        debug!(plan_id = %plan.plan_id, tasks = plan.tasks.len(), "Dispatching plan");

        let mut units = Vec::with_capacity(plan.tasks.len());
        let mut results: Vec<Option<TaskResult>> = vec![None; plan.tasks.len()];

        for (slot, task) in plan.tasks.iter().enumerate() {
            let members: Option<Vec<Arc<MessageRecord>>> = task
                .message_ids
                .iter()
                .map(|id| messages.get(id).cloned())
                .collect();

            match members {
                Some(members) => units.push((slot, task.clone(), members)),
                None => {
                    warn!(task_id = %task.task_id, "Task references messages outside the batch");
                    results[slot] = Some(TaskResult::failed(
                        task,
                        PipelineError::InvariantViolation("task references unknown message".to_string())
                            .to_string(),
                        0,
                    ));
                }
            }
        }

        let slots: Vec<usize> = units.iter().map(|(slot, _, _)| *slot).collect();
        let worker = self.worker.clone();
        let retry = self.config.retry.clone();

        let outcomes = run_bounded(
            units,
            self.config.max_concurrent_tasks,
            cancel,
            move |(_, task, members)| {
                let worker = worker.clone();
                let retry = retry.clone();
                async move { run_task(worker, retry, task, members).await }
            },
        )
        .await;

        for (slot, outcome) in slots.into_iter().zip(outcomes) {
            let task = &plan.tasks[slot];
            results[slot] = Some(match outcome {
                UnitOutcome::Completed(result) => result,
                UnitOutcome::Cancelled => TaskResult::cancelled(task),
                UnitOutcome::Panicked(reason) => {
                    TaskResult::failed(task, format!("worker panicked: {}", reason), 1)
                }
            });
        }

        let results: Vec<TaskResult> = results
            .into_iter()
            .zip(&plan.tasks)
            .map(|(result, task)| result.unwrap_or_else(|| TaskResult::cancelled(task)))
            .collect();

        let failed = results.iter().filter(|r| r.status == TaskStatus::Failed).count();
        let cancelled = results.iter().filter(|r| r.status == TaskStatus::Cancelled).count();
        info!(
            plan_id = %plan.plan_id,
            tasks = results.len(),
            failed,
            cancelled,
            "Plan execution completed"
        );

        results
    }
}

async fn run_task(
    worker: Arc<dyn TaskWorker>,
    retry: RetryPolicy,
    task: TaskDescriptor,
    members: Vec<Arc<MessageRecord>>,
) -> TaskResult {
    let start = Instant::now();
    let label = format!("task:{}", task.order);
    let (worker_ref, task_ref, members_ref) = (&worker, &task, &members);

    let outcome = with_retry(&retry, &label, move |_| worker_ref.execute(task_ref, members_ref)).await;
    let execution_time_ms = start.elapsed().as_millis() as u64;

    match outcome.result {
        Ok(output) => {
            debug!(task_id = %task.task_id, attempts = outcome.attempts, "Task succeeded");
            TaskResult {
                task_id: task.task_id,
                order: task.order,
                status: TaskStatus::Succeeded,
                output: Some(output),
                error: None,
                attempts: outcome.attempts,
                execution_time_ms,
            }
        }
        Err(e) => {
            warn!(
                task_id = %task.task_id,
                attempts = outcome.attempts,
                error = %e,
                "Task failed"
            );
            TaskResult {
                execution_time_ms,
                ..TaskResult::failed(&task, e.to_string(), outcome.attempts)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::ScriptedGenerator;
    use crate::planner::TaskType;
    use crate::validation::tests::valid_message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Worker failing transiently for tasks whose first member is in `failing`
    pub(crate) struct FlakyWorker {
        pub failing: Vec<String>,
        pub calls: AtomicUsize,
        pub delay: Duration,
    }

    impl FlakyWorker {
        pub(crate) fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TaskWorker for FlakyWorker {
        async fn execute(&self, task: &TaskDescriptor, messages: &[Arc<MessageRecord>]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let first = &messages[0].message_id;
            if self.failing.contains(first) {
                return Err(PipelineError::TransientCapability("settlement gateway busy".into()));
            }
            Ok(format!("task {} processed {} messages", task.order, messages.len()))
        }
    }

    pub(crate) fn fast_task_config() -> TaskConfig {
        TaskConfig {
            retry: RetryPolicy {
                max_retries: 2,
                backoff_ms: 1,
                timeout_ms: 500,
            },
            ..TaskConfig::default()
        }
    }

    fn batch(ids: &[&str]) -> HashMap<String, Arc<MessageRecord>> {
        ids.iter()
            .map(|id| (id.to_string(), Arc::new(valid_message(id))))
            .collect()
    }

    fn plan(groups: &[&[&str]]) -> TaskPlan {
        TaskPlan::new(
            groups
                .iter()
                .enumerate()
                .map(|(i, ids)| {
                    TaskDescriptor::new(
                        i as u32 + 1,
                        TaskType::Settlement,
                        ids.iter().map(|s| s.to_string()).collect(),
                        "settle".into(),
                    )
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_failed_task_does_not_affect_siblings() {
        let worker = Arc::new(FlakyWorker::new(&["B1"]));
        let dispatcher = TaskDispatcher::new(worker.clone(), fast_task_config());
        let plan = plan(&[&["A1", "A2"], &["B1"], &["C1"]]);

        let results = dispatcher
            .execute_plan(&plan, &batch(&["A1", "A2", "B1", "C1"]), &CancellationToken::new())
            .await;

        let statuses: Vec<TaskStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Succeeded]
        );
        assert_eq!(results[1].attempts, 3);
        // 1 + 3 + 1 attempts
        assert_eq!(worker.calls.load(Ordering::SeqCst), 5);
        assert!(results[1].error.as_deref().unwrap_or_default().contains("gateway busy"));
    }

    #[tokio::test]
    async fn test_unknown_member_fails_only_that_task() {
        let dispatcher = TaskDispatcher::new(Arc::new(FlakyWorker::new(&[])), fast_task_config());
        let plan = plan(&[&["A1"], &["GHOST"]]);

        let results = dispatcher
            .execute_plan(&plan, &batch(&["A1"]), &CancellationToken::new())
            .await;
        assert_eq!(results[0].status, TaskStatus::Succeeded);
        assert_eq!(results[1].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_marks_tasks_cancelled() {
        let dispatcher = TaskDispatcher::new(Arc::new(FlakyWorker::new(&[])), fast_task_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = dispatcher
            .execute_plan(&plan(&[&["A1"], &["B1"]]), &batch(&["A1", "B1"]), &cancel)
            .await;
        assert!(results.iter().all(|r| r.status == TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_llm_worker_failure_marker() {
        let ok = LlmTaskWorker::new(Arc::new(ScriptedGenerator::always("Settled 1 message.")));
        let bad = LlmTaskWorker::new(Arc::new(ScriptedGenerator::always(
            "Checked.\nSTATUS: FAILED nostro account frozen",
        )));
        let task = TaskDescriptor::new(1, TaskType::Settlement, vec!["A1".into()], "settle".into());
        let members = vec![Arc::new(valid_message("A1"))];

        tokio_test::assert_ok!(ok.execute(&task, &members).await);
        let err = bad.execute(&task, &members).await.unwrap_err();
        assert!(matches!(err, PipelineError::WorkerError(_)));
        assert!(err.to_string().contains("nostro account frozen"));
    }
}
