//! Concurrent risk aggregator
//!
//! Fans every registered detector out as its own unit, waits for all of them
//! and folds the verdicts into a profile. Verdicts land in registry-index
//! slots, so completion order never changes the result.

use super::{
    AmountAnomalyDetector, BehavioralPatternDetector, GeographicRiskDetector, RiskDetector,
    RiskProfile, RiskVerdict, ScoredMessage,
};
use crate::concurrency::{run_bounded, UnitOutcome};
use crate::config::RiskConfig;
use crate::models::MessageRecord;
use crate::validation::ValidationOutcome;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RiskAggregator {
    config: RiskConfig,
    detectors: Vec<Arc<dyn RiskDetector>>,
}

impl RiskAggregator {
    /// Aggregator with no detectors registered
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            detectors: Vec::new(),
        }
    }

    /// Aggregator with the amount, pattern and geography detectors
    pub fn with_default_detectors(config: RiskConfig) -> Self {
        let mut aggregator = Self::new(config.clone());
        aggregator.register(Arc::new(AmountAnomalyDetector::new(config.amount)));
        aggregator.register(Arc::new(BehavioralPatternDetector::new(config.patterns)));
        aggregator.register(Arc::new(GeographicRiskDetector::new(config.geography)));
        aggregator
    }

    pub fn register(&mut self, detector: Arc<dyn RiskDetector>) {
        self.detectors.push(detector);
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Run every detector concurrently and seal the result
    pub async fn score_message(
        &self,
        message: Arc<MessageRecord>,
        cancel: &CancellationToken,
    ) -> RiskProfile {
        let names = self.detector_names();
        let timeout = self.config.detector_timeout();
        let timeout_ms = self.config.detector_timeout_ms;
        let shared = message.clone();

        let outcomes = run_bounded(
            self.detectors.clone(),
            self.config.max_concurrent_detectors,
            cancel,
            move |detector| {
                let message = shared.clone();
                async move {
                    match tokio::time::timeout(timeout, detector.inspect(&message)).await {
                        Ok(Ok(verdict)) => verdict,
                        Ok(Err(e)) => RiskVerdict::failure(detector.name(), format!("detector error: {}", e)),
                        Err(_) => RiskVerdict::failure(
                            detector.name(),
                            format!("detector timed out after {} ms", timeout_ms),
                        ),
                    }
                }
            },
        )
        .await;

        let verdicts: Vec<RiskVerdict> = outcomes
            .into_iter()
            .zip(names)
            .map(|(outcome, name)| match outcome {
                UnitOutcome::Completed(verdict) => verdict,
                UnitOutcome::Cancelled => RiskVerdict::failure(name, "detector cancelled"),
                UnitOutcome::Panicked(reason) => {
                    RiskVerdict::failure(name, format!("detector panicked: {}", reason))
                }
            })
            .collect();

        for verdict in verdicts.iter().filter(|v| v.failed) {
            warn!(
                message_id = %message.message_id,
                detector = %verdict.detector,
                reason = ?verdict.rationale,
                "Detector contributed nothing"
            );
        }

        let profile = RiskProfile::seal(verdicts, &self.config);

        debug!(
            message_id = %message.message_id,
            score = profile.score(),
            classification = %profile.classification(),
            "Risk profile sealed"
        );

        profile
    }

    /// Score a batch of validated messages under the message-level bound
    pub async fn score_batch(
        self: &Arc<Self>,
        outcomes: Vec<ValidationOutcome>,
        cancel: &CancellationToken,
    ) -> Vec<UnitOutcome<ScoredMessage>> {
        let total = outcomes.len();
        let this = self.clone();
        let token = cancel.clone();

        let scored = run_bounded(
            outcomes,
            self.config.max_concurrent_messages,
            cancel,
            move |validation| {
                let this = this.clone();
                let token = token.clone();
                async move {
                    let profile = this.score_message(validation.message.clone(), &token).await;
                    ScoredMessage {
                        validation,
                        profile,
                    }
                }
            },
        )
        .await;

        let flagged = scored
            .iter()
            .filter(|o| {
                matches!(o, UnitOutcome::Completed(s)
                    if s.profile.classification() != super::RiskClassification::Clean)
            })
            .count();
        info!(total, flagged, "Risk stage complete");

        scored
    }
}
