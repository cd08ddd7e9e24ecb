//! Risk scoring
//!
//! Independent detectors each contribute a bounded delta; the aggregator fans
//! them out concurrently and seals the verdicts into an immutable profile.

use crate::config::RiskConfig;
use crate::models::MessageRecord;
use crate::validation::ValidationOutcome;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod aggregator;
pub mod detectors;

pub use aggregator::RiskAggregator;
pub use detectors::{AmountAnomalyDetector, BehavioralPatternDetector, GeographicRiskDetector};

/// Upper bound of a single detector's contribution and of the total score
pub const MAX_SCORE: u32 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskClassification {
    Clean,
    Review,
    Fraudulent,
}

impl RiskClassification {
    /// `< review` clean, `review..=fraud` review, `> fraud` fraudulent
    pub fn from_score(score: u8, config: &RiskConfig) -> Self {
        if score > config.fraud_threshold {
            RiskClassification::Fraudulent
        } else if score >= config.review_threshold {
            RiskClassification::Review
        } else {
            RiskClassification::Clean
        }
    }
}

impl fmt::Display for RiskClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskClassification::Clean => "clean",
            RiskClassification::Review => "review",
            RiskClassification::Fraudulent => "fraudulent",
        };
        write!(f, "{}", s)
    }
}

/// One detector's contribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskVerdict {
    pub detector: String,
    pub delta: u32,
    pub rationale: Vec<String>,
    pub failed: bool,
}

impl RiskVerdict {
    /// Successful verdict; the delta is capped per detector
    pub fn new(detector: &str, delta: u32, rationale: Vec<String>) -> Self {
        Self {
            detector: detector.to_string(),
            delta: delta.min(MAX_SCORE),
            rationale,
            failed: false,
        }
    }

    /// Zero-contribution verdict for a detector that did not finish
    pub fn failure(detector: &str, reason: impl Into<String>) -> Self {
        Self {
            detector: detector.to_string(),
            delta: 0,
            rationale: vec![reason.into()],
            failed: true,
        }
    }
}

/// Sealed risk assessment of one message.
///
/// Only [`RiskProfile::seal`] builds one; there are no mutators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskProfile {
    verdicts: Vec<RiskVerdict>,
    score: u8,
    classification: RiskClassification,
}

impl RiskProfile {
    /// Sum the verdicts, clamp to `[0, 100]` and classify
    pub fn seal(verdicts: Vec<RiskVerdict>, config: &RiskConfig) -> Self {
        let total: u32 = verdicts.iter().map(|v| v.delta).sum();
        let score = total.min(MAX_SCORE) as u8;

        Self {
            classification: RiskClassification::from_score(score, config),
            verdicts,
            score,
        }
    }

    pub fn verdicts(&self) -> &[RiskVerdict] {
        &self.verdicts
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn classification(&self) -> RiskClassification {
        self.classification
    }

    pub fn failed_detectors(&self) -> impl Iterator<Item = &str> {
        self.verdicts
            .iter()
            .filter(|v| v.failed)
            .map(|v| v.detector.as_str())
    }

    /// Every rationale line, prefixed with its detector
    pub fn reasons(&self) -> Vec<String> {
        self.verdicts
            .iter()
            .flat_map(|v| {
                v.rationale
                    .iter()
                    .map(move |r| format!("[{}] {}", v.detector, r))
            })
            .collect()
    }
}

/// Trait for risk detectors
#[async_trait]
pub trait RiskDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect a read-only message and report a verdict
    async fn inspect(&self, message: &MessageRecord) -> Result<RiskVerdict>;
}

/// A validated message together with its sealed profile
#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub validation: ValidationOutcome,
    pub profile: RiskProfile,
}

impl ScoredMessage {
    pub fn message(&self) -> &Arc<MessageRecord> {
        &self.validation.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(delta: u32) -> RiskVerdict {
        RiskVerdict::new("test", delta, vec![])
    }

    #[test]
    fn test_classification_boundaries() {
        let config = RiskConfig::default();
        assert_eq!(RiskClassification::from_score(0, &config), RiskClassification::Clean);
        assert_eq!(RiskClassification::from_score(29, &config), RiskClassification::Clean);
        assert_eq!(RiskClassification::from_score(30, &config), RiskClassification::Review);
        assert_eq!(RiskClassification::from_score(50, &config), RiskClassification::Review);
        assert_eq!(RiskClassification::from_score(51, &config), RiskClassification::Fraudulent);
        assert_eq!(RiskClassification::from_score(100, &config), RiskClassification::Fraudulent);
    }

    #[test]
    fn test_seal_clamps_sum() {
        let profile = RiskProfile::seal(vec![verdict(70), verdict(70), verdict(30)], &RiskConfig::default());
        assert_eq!(profile.score(), 100);
        assert_eq!(profile.classification(), RiskClassification::Fraudulent);
        assert_eq!(profile.verdicts().len(), 3);
    }

    #[test]
    fn test_detector_delta_capped() {
        assert_eq!(verdict(250).delta, 100);
    }

    #[test]
    fn test_all_failed_is_clean() {
        let profile = RiskProfile::seal(
            vec![
                RiskVerdict::failure("a", "timed out"),
                RiskVerdict::failure("b", "panicked"),
            ],
            &RiskConfig::default(),
        );
        assert_eq!(profile.score(), 0);
        assert_eq!(profile.classification(), RiskClassification::Clean);
        assert_eq!(profile.failed_detectors().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_reasons_are_prefixed() {
        let profile = RiskProfile::seal(
            vec![RiskVerdict::new("geo", 30, vec!["offshore".to_string()])],
            &RiskConfig::default(),
        );
        assert_eq!(profile.reasons(), vec!["[geo] offshore"]);
    }
}
