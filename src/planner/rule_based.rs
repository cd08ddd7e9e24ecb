//! Deterministic planner: partition by a key, split large groups

use super::{CleanMessage, TaskDescriptor, TaskPlan, TaskPlanner, TaskType};
use crate::config::{PartitionStrategy, TaskConfig};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

pub struct RuleBasedPlanner {
    config: TaskConfig,
}

impl RuleBasedPlanner {
    pub fn new(config: TaskConfig) -> Self {
        Self { config }
    }

    fn partition_key(&self, message: &CleanMessage) -> String {
        match self.config.partition {
            PartitionStrategy::Currency => message.message.amount.currency.clone(),
            PartitionStrategy::DestinationBank => message.message.receiver_bank().to_string(),
            PartitionStrategy::RiskClassification => message.classification.to_string(),
            PartitionStrategy::MessageType => message.message.message_type.to_string(),
        }
    }

    /// Synchronous planning; groups keep the order of first appearance
    pub fn build_plan(&self, messages: &[CleanMessage]) -> TaskPlan {
        let mut groups: Vec<(String, Vec<&CleanMessage>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for message in messages {
            let key = self.partition_key(message);
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(message),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![message]));
                }
            }
        }

        let max = self.config.max_messages_per_task.max(1);
        let mut tasks = Vec::new();

        for (key, members) in &groups {
            let parts = members.len().div_ceil(max);
            for (part, chunk) in members.chunks(max).enumerate() {
                let task_type = TaskType::for_members(chunk, &self.config);
                let instructions = format!(
                    "{} for {} message(s) in group '{}' (part {}/{})",
                    task_type,
                    chunk.len(),
                    key,
                    part + 1,
                    parts
                );
                tasks.push(TaskDescriptor::new(
                    tasks.len() as u32 + 1,
                    task_type,
                    chunk.iter().map(|m| m.id().to_string()).collect(),
                    instructions,
                ));
            }
        }

        debug!(
            strategy = ?self.config.partition,
            groups = groups.len(),
            tasks = tasks.len(),
            "Rule-based plan built"
        );

        TaskPlan::new(tasks)
    }
}

#[async_trait]
impl TaskPlanner for RuleBasedPlanner {
    async fn plan(&self, messages: &[CleanMessage]) -> Result<TaskPlan> {
        Ok(self.build_plan(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::clean;

    fn planner(partition: PartitionStrategy, max: usize) -> RuleBasedPlanner {
        RuleBasedPlanner::new(TaskConfig {
            partition,
            max_messages_per_task: max,
            ..TaskConfig::default()
        })
    }

    #[tokio::test]
    async fn test_partition_by_currency() {
        let messages = vec![
            clean("A", "USD", 10),
            clean("B", "EUR", 10),
            clean("C", "USD", 10),
            clean("D", "GBP", 10),
        ];

        let plan = planner(PartitionStrategy::Currency, 5).plan(&messages).await.unwrap();
        let groups: Vec<Vec<String>> = plan.tasks.iter().map(|t| t.message_ids.clone()).collect();
        assert_eq!(groups, vec![vec!["A", "C"], vec!["B"], vec!["D"]]);
        assert!(plan.tasks.iter().all(|t| t.task_type == TaskType::Settlement));
    }

    #[tokio::test]
    async fn test_large_groups_are_split() {
        let messages: Vec<_> = (0..10).map(|i| clean(&format!("M{}", i), "USD", 10)).collect();
        let plan = planner(PartitionStrategy::Currency, 4).plan(&messages).await.unwrap();

        let sizes: Vec<usize> = plan.tasks.iter().map(|t| t.message_ids.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(plan.message_count(), 10);
        let orders: Vec<u32> = plan.tasks.iter().map(|t| t.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_partition_by_destination_bank() {
        let mut a = clean("A", "USD", 10);
        let mut b = clean("B", "USD", 10);
        std::sync::Arc::make_mut(&mut a.message).receiver_bic = "BARCGB22".to_string();
        std::sync::Arc::make_mut(&mut b.message).receiver_bic = "BNPAFRPP".to_string();

        let plan = planner(PartitionStrategy::DestinationBank, 5)
            .plan(&[a, b])
            .await
            .unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert!(plan.tasks[0].instructions.contains("BARC"));
    }

    #[tokio::test]
    async fn test_empty_batch_yields_empty_plan() {
        let plan = planner(PartitionStrategy::Currency, 5).plan(&[]).await.unwrap();
        assert!(plan.tasks.is_empty());
    }
}
