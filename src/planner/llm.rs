//! Capability-backed planner
//!
//! Asks the text generator for a JSON task plan. Any unusable reply falls
//! back to the rule-based plan, so planning itself never fails the batch.

use super::{CleanMessage, RuleBasedPlanner, TaskDescriptor, TaskPlan, TaskPlanner, TaskType};
use crate::capability::{generate_with_retry, strip_code_fences, TextGenerator};
use crate::config::{RetryPolicy, TaskConfig};
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct LlmTaskPlanner {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    config: TaskConfig,
    fallback: RuleBasedPlanner,
}

impl LlmTaskPlanner {
    pub fn new(generator: Arc<dyn TextGenerator>, retry: RetryPolicy, config: TaskConfig) -> Self {
        Self {
            generator,
            retry,
            fallback: RuleBasedPlanner::new(config.clone()),
            config,
        }
    }

    fn build_prompt(&self, messages: &[CleanMessage]) -> String {
        let listing = messages
            .iter()
            .map(|m| {
                format!(
                    "- {} | {} | {} | bank={} | risk={} ({})",
                    m.id(),
                    m.message.message_type,
                    m.message.amount,
                    m.message.receiver_bank(),
                    m.classification,
                    m.risk_score
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are a payments operations planner.

Split the following cleared transfer messages into processing tasks.
Group messages that can be processed together (same currency, same
destination bank or same risk profile).

MESSAGES:
{}

Rules:
- Every message id must appear in exactly one task
- At most {} messages per task
- task_type is one of: settlement, compliance_review, high_value_review
- Return ONLY valid JSON
- No explanation text
- JSON format:

{{
  "tasks": [
    {{
      "task_type": "settlement",
      "message_ids": ["..."],
      "instructions": "..."
    }}
  ]
}}
"#,
            listing, self.config.max_messages_per_task
        )
    }
}

#[async_trait]
impl TaskPlanner for LlmTaskPlanner {
    async fn plan(&self, messages: &[CleanMessage]) -> Result<TaskPlan> {
        if messages.is_empty() {
            return Ok(TaskPlan::new(Vec::new()));
        }

        let prompt = self.build_prompt(messages);
        let parsed = match generate_with_retry(self.generator.as_ref(), &self.retry, "planning", &prompt, &[]).await {
            Ok(response) => parse_plan_response(&response),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(plan) => {
                info!(tasks = plan.tasks.len(), "Capability plan accepted");
                Ok(plan)
            }
            Err(e) => {
                warn!(error = %e, "Capability plan unusable, falling back to rule-based plan");
                self.fallback.plan(messages).await
            }
        }
    }
}

/// Parse a JSON plan reply
fn parse_plan_response(response: &str) -> Result<TaskPlan> {
    let cleaned = strip_code_fences(response);

    let json: serde_json::Value = serde_json::from_str(cleaned).map_err(|e| {
        PipelineError::MalformedResponse(format!("Failed to parse plan response: {}", e))
    })?;

    let tasks_json = json
        .get("tasks")
        .ok_or_else(|| PipelineError::InvalidPlan("No tasks in response".to_string()))?
        .as_array()
        .ok_or_else(|| PipelineError::InvalidPlan("Tasks is not an array".to_string()))?;

    let mut tasks = Vec::with_capacity(tasks_json.len());

    for (index, task_json) in tasks_json.iter().enumerate() {
        let raw_type = task_json
            .get("task_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::InvalidPlan("Missing task_type".to_string()))?;

        let task_type = TaskType::parse(raw_type)
            .ok_or_else(|| PipelineError::InvalidPlan(format!("Unknown task_type '{}'", raw_type)))?;

        let message_ids: Vec<String> = task_json
            .get("message_ids")
            .and_then(|v| v.as_array())
            .ok_or_else(|| PipelineError::InvalidPlan("Missing message_ids".to_string()))?
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();

        let instructions = task_json
            .get("instructions")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        tasks.push(TaskDescriptor::new(index as u32 + 1, task_type, message_ids, instructions));
    }

    if tasks.is_empty() {
        return Err(PipelineError::InvalidPlan("Plan has no tasks".to_string()));
    }

    Ok(TaskPlan::new(tasks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ScriptedGenerator;
    use crate::planner::tests::clean;

    fn planner(generator: Arc<dyn TextGenerator>) -> LlmTaskPlanner {
        LlmTaskPlanner::new(
            generator,
            RetryPolicy {
                max_retries: 0,
                backoff_ms: 1,
                timeout_ms: 500,
            },
            TaskConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_capability_plan_is_used() {
        let generator = Arc::new(ScriptedGenerator::always(
            r#"```json
{"tasks": [
  {"task_type": "settlement", "message_ids": ["A", "B"], "instructions": "settle USD"},
  {"task_type": "high_value_review", "message_ids": ["C"], "instructions": "check size"}
]}
```"#,
        ));
        let messages = vec![clean("A", "USD", 1), clean("B", "USD", 1), clean("C", "USD", 90_000)];

        let plan = planner(generator.clone()).plan(&messages).await.unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].task_type, TaskType::HighValueReview);
        assert_eq!(plan.tasks[0].instructions, "settle USD");
        assert!(generator.recorded_calls()[0].prompt.contains("- C |"));
    }

    #[tokio::test]
    async fn test_garbage_reply_falls_back() {
        let generator = Arc::new(ScriptedGenerator::always("Sure! Here's my plan: do them all."));
        let messages = vec![clean("A", "USD", 1), clean("B", "EUR", 1)];

        let plan = planner(generator).plan(&messages).await.unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.message_count(), 2);
    }

    #[tokio::test]
    async fn test_capability_failure_falls_back() {
        let generator = Arc::new(ScriptedGenerator::new(|_, _| {
            Err(PipelineError::FatalCapability("unauthorized".into()))
        }));
        let plan = planner(generator).plan(&[clean("A", "USD", 1)]).await.unwrap();
        assert_eq!(plan.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_capability() {
        let generator = Arc::new(ScriptedGenerator::always("{}"));
        let plan = planner(generator.clone()).plan(&[]).await.unwrap();
        assert!(plan.tasks.is_empty());
        assert_eq!(generator.call_count(), 0);
    }

    #[test]
    fn test_unknown_task_type_rejected() {
        let err = parse_plan_response(r#"{"tasks": [{"task_type": "teleport", "message_ids": ["A"]}]}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPlan(_)));
    }
}
