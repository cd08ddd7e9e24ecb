//! Task planning for the final processing stage
//!
//! A planner decomposes the clean batch into task descriptors. Plans are
//! always reconciled against the batch before dispatch, so every message ends
//! up in exactly one task whatever the planner produced.

use crate::config::TaskConfig;
use crate::models::MessageRecord;
use crate::risk::RiskClassification;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub mod llm;
pub mod rule_based;

pub use llm::LlmTaskPlanner;
pub use rule_based::RuleBasedPlanner;

/// A message that reached the final stage, with what earlier stages learned
#[derive(Debug, Clone)]
pub struct CleanMessage {
    pub message: Arc<MessageRecord>,
    pub classification: RiskClassification,
    pub risk_score: u8,
    pub was_corrected: bool,
    /// Notes carried over from the analysis chain
    pub annotations: Vec<String>,
}

impl CleanMessage {
    pub fn id(&self) -> &str {
        &self.message.message_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Settlement,
    ComplianceReview,
    HighValueReview,
}

impl TaskType {
    /// Derive the task type from the members of a group
    pub fn for_members(members: &[&CleanMessage], config: &TaskConfig) -> Self {
        if members
            .iter()
            .any(|m| m.classification != RiskClassification::Clean || !m.annotations.is_empty())
        {
            TaskType::ComplianceReview
        } else if members
            .iter()
            .any(|m| m.message.amount.value > config.high_value_threshold)
        {
            TaskType::HighValueReview
        } else {
            TaskType::Settlement
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "settlement" => Some(TaskType::Settlement),
            "compliance_review" | "compliance" => Some(TaskType::ComplianceReview),
            "high_value_review" | "high_value" => Some(TaskType::HighValueReview),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::Settlement => "settlement",
            TaskType::ComplianceReview => "compliance_review",
            TaskType::HighValueReview => "high_value_review",
        };
        write!(f, "{}", s)
    }
}

/// One unit of final-stage work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescriptor {
    pub task_id: Uuid,
    pub order: u32,
    pub task_type: TaskType,
    pub message_ids: Vec<String>,
    pub instructions: String,
}

impl TaskDescriptor {
    pub fn new(order: u32, task_type: TaskType, message_ids: Vec<String>, instructions: String) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            order,
            task_type,
            message_ids,
            instructions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub plan_id: Uuid,
    pub tasks: Vec<TaskDescriptor>,
    pub created_at: DateTime<Utc>,
}

impl TaskPlan {
    pub fn new(tasks: Vec<TaskDescriptor>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            tasks,
            created_at: Utc::now(),
        }
    }

    pub fn message_count(&self) -> usize {
        self.tasks.iter().map(|t| t.message_ids.len()).sum()
    }

    /// Make the plan cover `messages` exactly once.
    ///
    /// Unknown and repeated ids are dropped, tasks left empty are removed,
    /// oversized tasks are split, and messages no task mentions are placed in
    /// extra tasks. Orders are renumbered from 1.
    pub fn reconcile(self, messages: &[CleanMessage], config: &TaskConfig) -> TaskPlan {
        let known: HashSet<&str> = messages.iter().map(|m| m.id()).collect();
        let mut seen: HashSet<String> = HashSet::with_capacity(messages.len());
        let max = config.max_messages_per_task.max(1);
        let mut tasks: Vec<TaskDescriptor> = Vec::with_capacity(self.tasks.len());

        for task in self.tasks {
            let mut ids = Vec::with_capacity(task.message_ids.len());
            for id in task.message_ids {
                if !known.contains(id.as_str()) {
                    warn!(task_id = %task.task_id, message_id = %id, "Plan references unknown message, dropped");
                } else if seen.contains(&id) {
                    warn!(task_id = %task.task_id, message_id = %id, "Message assigned twice, keeping first");
                } else {
                    seen.insert(id.clone());
                    ids.push(id);
                }
            }

            if ids.len() <= max {
                if !ids.is_empty() {
                    tasks.push(TaskDescriptor { message_ids: ids, ..task });
                }
                continue;
            }

            for chunk in ids.chunks(max) {
                tasks.push(TaskDescriptor::new(
                    0,
                    task.task_type,
                    chunk.to_vec(),
                    task.instructions.clone(),
                ));
            }
        }

        let missing: Vec<&CleanMessage> = messages.iter().filter(|m| !seen.contains(m.id())).collect();
        if !missing.is_empty() {
            warn!(count = missing.len(), "Plan omitted messages, adding catch-up tasks");
            for chunk in missing.chunks(max) {
                let task_type = TaskType::for_members(chunk, config);
                tasks.push(TaskDescriptor::new(
                    0,
                    task_type,
                    chunk.iter().map(|m| m.id().to_string()).collect(),
                    format!("Process {} message(s) left unassigned by the plan", chunk.len()),
                ));
            }
        }

        for (index, task) in tasks.iter_mut().enumerate() {
            task.order = index as u32 + 1;
        }

        TaskPlan {
            plan_id: self.plan_id,
            tasks,
            created_at: self.created_at,
        }
    }
}

/// Trait for task planning
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    async fn plan(&self, messages: &[CleanMessage]) -> Result<TaskPlan>;
}
