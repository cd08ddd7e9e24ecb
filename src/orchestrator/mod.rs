//! Task orchestrator
//!
//! Two phases over the clean subset: plan once, then dispatch every task and
//! wait for all of them before the report is assembled.

use crate::config::TaskConfig;
use crate::execution::{TaskDispatcher, TaskResult, TaskStatus, TaskWorker};
use crate::models::{Disposition, MessageRecord};
use crate::planner::{CleanMessage, RuleBasedPlanner, TaskDescriptor, TaskPlanner};
use crate::report::{FinalReport, ReportEntry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct TaskOrchestrator {
    planner: Arc<dyn TaskPlanner>,
    dispatcher: TaskDispatcher,
    config: TaskConfig,
}

impl TaskOrchestrator {
    pub fn new(planner: Arc<dyn TaskPlanner>, worker: Arc<dyn TaskWorker>, config: TaskConfig) -> Self {
        Self {
            planner,
            dispatcher: TaskDispatcher::new(worker, config.clone()),
            config,
        }
    }

    /// Plan, dispatch and report on the clean subset.
    ///
    /// The report has one entry per input message, in input order, with
    /// `position` relative to `messages`.
    pub async fn process_clean(&self, messages: Vec<CleanMessage>, cancel: &CancellationToken) -> FinalReport {
        let batch_id = Uuid::new_v4();

        let planned = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            planned = self.planner.plan(&messages) => Some(planned),
        };

        let plan = match planned {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => {
                warn!(error = %e, "Planner failed, using rule-based plan");
                RuleBasedPlanner::new(self.config.clone()).build_plan(&messages)
            }
            // Dispatch will mark every task cancelled
            None => RuleBasedPlanner::new(self.config.clone()).build_plan(&messages),
        };
        let plan = plan.reconcile(&messages, &self.config);

        info!(
            %batch_id,
            plan_id = %plan.plan_id,
            messages = messages.len(),
            tasks = plan.tasks.len(),
            "Task plan ready"
        );

        let lookup: HashMap<String, Arc<MessageRecord>> = messages
            .iter()
            .map(|m| (m.id().to_string(), m.message.clone()))
            .collect();

        let results = self.dispatcher.execute_plan(&plan, &lookup, cancel).await;

        let mut assignment: HashMap<&str, (&TaskDescriptor, &TaskResult)> = HashMap::new();
        for (task, result) in plan.tasks.iter().zip(&results) {
            for id in &task.message_ids {
                assignment.insert(id.as_str(), (task, result));
            }
        }

        let entries: Vec<ReportEntry> = messages
            .iter()
            .enumerate()
            .map(|(position, message)| build_entry(position, message, assignment.get(message.id()).copied()))
            .collect();

        let partial = cancel.is_cancelled() || results.iter().any(|r| r.status == TaskStatus::Cancelled);
        let report = FinalReport::new(batch_id, entries, partial);

        info!(
            %batch_id,
            approved = report.summary.approved,
            held = report.summary.held,
            partial,
            "Clean subset processed"
        );

        report
    }
}

fn build_entry(
    position: usize,
    message: &CleanMessage,
    assigned: Option<(&TaskDescriptor, &TaskResult)>,
) -> ReportEntry {
    let mut entry = ReportEntry::new(position, message.id(), Disposition::HeldForReview);
    entry.classification = Some(message.classification);
    entry.risk_score = Some(message.risk_score);
    entry.was_corrected = message.was_corrected;
    entry.notes = message.annotations.clone();

    match assigned {
        Some((task, result)) => {
            entry.task_id = Some(task.task_id);
            match result.status {
                TaskStatus::Succeeded => entry.disposition = Disposition::Approved,
                TaskStatus::Failed => entry.notes.push(format!(
                    "failed task {} ({}): {}",
                    task.order,
                    task.task_type,
                    result.error.as_deref().unwrap_or("unknown error")
                )),
                TaskStatus::Cancelled => entry.notes.push(format!("task {} cancelled", task.order)),
            }
        }
        None => {
            entry.error = Some("message was not assigned to any task".to_string());
        }
    }

    entry
}
