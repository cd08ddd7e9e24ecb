//! Pipeline configuration
//!
//! One immutable value handed to every stage at construction. Defaults mirror
//! the production rule set; `from_env` applies operator overrides.

use crate::analysis::AnalysisRole;
use crate::error::PipelineError;
use crate::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Full configuration for one pipeline instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub validation: ValidationRules,
    pub risk: RiskConfig,
    pub analysis: AnalysisConfig,
    pub tasks: TaskConfig,
    pub capability: RetryPolicy,
}

//
// ================= Retry =================
//

/// Timeout and bounded retry applied to every external call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt, transient failures only
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `n * backoff_ms`
    pub backoff_ms: u64,
    /// Per-attempt timeout
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 250,
            timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

//
// ================= Validation =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub accepted_currencies: Vec<String>,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub max_reference_length: usize,
    /// Total evaluation passes, including the first one
    pub max_iterations: u32,
    pub max_concurrent_messages: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            accepted_currencies: ["USD", "EUR", "GBP", "JPY", "CHF"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            min_amount: Decimal::new(1, 2),
            max_amount: Decimal::new(99_999_999_999, 2),
            max_reference_length: 16,
            max_iterations: 3,
            max_concurrent_messages: 4,
        }
    }
}

//
// ================= Risk =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Scores at or above this value are at least `review`
    pub review_threshold: u8,
    /// Scores strictly above this value are `fraudulent`
    pub fraud_threshold: u8,
    pub detector_timeout_ms: u64,
    pub max_concurrent_messages: usize,
    pub max_concurrent_detectors: usize,
    pub amount: AmountRules,
    pub patterns: PatternRules,
    pub geography: RiskTierTable,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            review_threshold: 30,
            fraud_threshold: 50,
            detector_timeout_ms: 5_000,
            max_concurrent_messages: 4,
            max_concurrent_detectors: 8,
            amount: AmountRules::default(),
            patterns: PatternRules::default(),
            geography: RiskTierTable::default(),
        }
    }
}

impl RiskConfig {
    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmountRules {
    pub high_value_threshold: Decimal,
    pub high_value_delta: u32,
    pub round_unit: Decimal,
    pub round_delta: u32,
    pub precision_threshold: Decimal,
    pub precision_delta: u32,
    /// More decimal places than this counts as unusual precision
    pub max_minor_units: u32,
}

impl Default for AmountRules {
    fn default() -> Self {
        Self {
            high_value_threshold: Decimal::from(10_000),
            high_value_delta: 30,
            round_unit: Decimal::from(1_000),
            round_delta: 20,
            precision_threshold: Decimal::from(100_000),
            precision_delta: 10,
            max_minor_units: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternRules {
    pub placeholder_identifiers: Vec<String>,
    pub placeholder_delta: u32,
    pub same_party_delta: u32,
    pub suspicious_keywords: Vec<String>,
    pub keyword_delta: u32,
}

impl Default for PatternRules {
    fn default() -> Self {
        Self {
            placeholder_identifiers: ["TEST", "FAKE", "DEMO", "999", "000000"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            placeholder_delta: 40,
            same_party_delta: 50,
            suspicious_keywords: ["urgent", "immediately", "secret", "confidential"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            keyword_delta: 20,
        }
    }
}

/// Jurisdiction tiers keyed by ISO country code
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskTierTable {
    pub high: Vec<String>,
    pub high_delta: u32,
    pub medium: Vec<String>,
    pub medium_delta: u32,
    pub offshore: Vec<String>,
    pub offshore_delta: u32,
    pub domestic_high_delta: u32,
}

impl Default for RiskTierTable {
    fn default() -> Self {
        let codes = |list: &[&str]| list.iter().map(|c| c.to_string()).collect();
        Self {
            high: codes(&["IR", "KP", "SY", "SD", "CU", "BY", "MM", "VE", "ZW"]),
            high_delta: 70,
            medium: codes(&["AF", "IQ", "LB", "LY", "SO", "YE", "PK"]),
            medium_delta: 40,
            offshore: codes(&["KY", "BM", "VG", "PA", "LI", "MC"]),
            offshore_delta: 30,
            domestic_high_delta: 20,
        }
    }
}

//
// ================= Analysis =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub roles: Vec<AnalysisRole>,
    pub max_concurrent_chains: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            roles: AnalysisRole::SEQUENCE.to_vec(),
            max_concurrent_chains: 4,
        }
    }
}

//
// ================= Tasks =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    Currency,
    DestinationBank,
    RiskClassification,
    MessageType,
}

impl PartitionStrategy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "currency" => Some(PartitionStrategy::Currency),
            "destination_bank" | "bank" => Some(PartitionStrategy::DestinationBank),
            "risk" | "risk_classification" => Some(PartitionStrategy::RiskClassification),
            "message_type" | "type" => Some(PartitionStrategy::MessageType),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub partition: PartitionStrategy,
    pub max_messages_per_task: usize,
    pub high_value_threshold: Decimal,
    pub max_concurrent_tasks: usize,
    pub retry: RetryPolicy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            partition: PartitionStrategy::Currency,
            max_messages_per_task: 5,
            high_value_threshold: Decimal::from(50_000),
            max_concurrent_tasks: 4,
            retry: RetryPolicy::default(),
        }
    }
}

//
// ================= Loading =================
//

impl PipelineConfig {
    /// Build configuration from the environment (after `dotenv`).
    ///
    /// `PIPELINE_CONFIG_FILE` points at a JSON document replacing the defaults;
    /// individual variables override on top of it.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("PIPELINE_CONFIG_FILE") {
            Ok(path) => Self::from_json_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Some(limit) = env_parse::<usize>("PIPELINE_MAX_CONCURRENCY")? {
            config.validation.max_concurrent_messages = limit;
            config.risk.max_concurrent_messages = limit;
            config.analysis.max_concurrent_chains = limit;
            config.tasks.max_concurrent_tasks = limit;
        }
        if let Some(timeout_ms) = env_parse::<u64>("CAPABILITY_TIMEOUT_MS")? {
            config.capability.timeout_ms = timeout_ms;
            config.tasks.retry.timeout_ms = timeout_ms;
        }
        if let Some(retries) = env_parse::<u32>("CAPABILITY_MAX_RETRIES")? {
            config.capability.max_retries = retries;
            config.tasks.retry.max_retries = retries;
        }
        if let Some(backoff_ms) = env_parse::<u64>("CAPABILITY_BACKOFF_MS")? {
            config.capability.backoff_ms = backoff_ms;
            config.tasks.retry.backoff_ms = backoff_ms;
        }
        if let Ok(raw) = env::var("TASK_PARTITION") {
            config.tasks.partition = PartitionStrategy::parse(&raw).ok_or_else(|| {
                PipelineError::Config(format!("unknown TASK_PARTITION '{}'", raw))
            })?;
        }
        if let Some(max) = env_parse::<usize>("TASK_MAX_MESSAGES")? {
            config.tasks.max_messages_per_task = max;
        }

        config.validate()?;

        info!(
            partition = ?config.tasks.partition,
            timeout_ms = config.capability.timeout_ms,
            max_retries = config.capability.max_retries,
            "Pipeline configuration loaded"
        );

        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Reject configurations that would break stage invariants
    pub fn validate(&self) -> Result<()> {
        if self.validation.max_iterations == 0 {
            return Err(PipelineError::Config(
                "validation.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.validation.min_amount > self.validation.max_amount {
            return Err(PipelineError::Config(
                "validation.min_amount exceeds max_amount".to_string(),
            ));
        }
        if self.risk.review_threshold > self.risk.fraud_threshold || self.risk.fraud_threshold > 100 {
            return Err(PipelineError::Config(format!(
                "risk thresholds must satisfy review <= fraud <= 100 (got {} / {})",
                self.risk.review_threshold, self.risk.fraud_threshold
            )));
        }
        // Roles may be skipped but never reordered or repeated
        let roles = &self.analysis.roles;
        let mut sequence = AnalysisRole::SEQUENCE.iter();
        let in_order = roles.iter().all(|role| sequence.any(|known| known == role));
        if !in_order || roles.last() != Some(&AnalysisRole::FinalDecision) {
            return Err(PipelineError::Config(format!(
                "analysis.roles must follow the fixed role order and end with final_decision (got {:?})",
                roles
            )));
        }
        if self.tasks.max_messages_per_task == 0 {
            return Err(PipelineError::Config(
                "tasks.max_messages_per_task must be at least 1".to_string(),
            ));
        }

        let limits = [
            ("validation.max_concurrent_messages", self.validation.max_concurrent_messages),
            ("risk.max_concurrent_messages", self.risk.max_concurrent_messages),
            ("risk.max_concurrent_detectors", self.risk.max_concurrent_detectors),
            ("analysis.max_concurrent_chains", self.analysis.max_concurrent_chains),
            ("tasks.max_concurrent_tasks", self.tasks.max_concurrent_tasks),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, limit)| *limit == 0) {
            return Err(PipelineError::Config(format!("{} must be at least 1", name)));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}
