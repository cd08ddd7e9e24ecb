//! Analysis chain execution
//!
//! Strictly sequential inside one chain; chains for different messages run
//! concurrently under the bounded pool.

use super::{parse_disposition, AnalysisOutcome, AnalysisRole, AnalysisTurn};
use crate::capability::{generate_with_retry, ContextEntry, TextGenerator};
use crate::concurrency::{run_bounded, UnitOutcome};
use crate::config::{AnalysisConfig, RetryPolicy};
use crate::models::Disposition;
use crate::risk::ScoredMessage;
use crate::validation::ValidationStatus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A flagged message after the chain has ruled on it
#[derive(Debug, Clone)]
pub struct AnalyzedMessage {
    pub scored: ScoredMessage,
    pub analysis: AnalysisOutcome,
}

pub struct AnalysisChain {
    generator: Arc<dyn TextGenerator>,
    config: AnalysisConfig,
    retry: RetryPolicy,
}

impl AnalysisChain {
    pub fn new(generator: Arc<dyn TextGenerator>, config: AnalysisConfig, retry: RetryPolicy) -> Self {
        Self {
            generator,
            config,
            retry,
        }
    }

    pub fn roles(&self) -> &[AnalysisRole] {
        &self.config.roles
    }

    /// Run every role in order over one flagged message.
    ///
    /// When `cancel` fires the chain stops before the next turn; turns
    /// already completed are kept and the message is held.
    pub async fn analyze(&self, scored: &ScoredMessage, cancel: &CancellationToken) -> AnalysisOutcome {
        let message_id = scored.message().message_id.clone();
        let mut turns: Vec<AnalysisTurn> = Vec::with_capacity(self.config.roles.len());
        let mut history: Vec<ContextEntry> = Vec::with_capacity(self.config.roles.len());
        let mut annotations = Vec::new();

        for (index, role) in self.config.roles.iter().copied().enumerate() {
            let prompt = build_prompt(role, scored);
            let label = format!("analysis:{}", role);

            debug!(
                message_id = %message_id,
                role = %role,
                context_len = history.len(),
                "Running analysis turn"
            );

            let generated = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = generate_with_retry(self.generator.as_ref(), &self.retry, &label, &prompt, &history) => Some(result),
            };

            match generated {
                Some(Ok(output)) => {
                    let decision = parse_disposition(&output);
                    turns.push(AnalysisTurn {
                        role,
                        position: index + 1,
                        output: output.clone(),
                        context_len: history.len(),
                        failed: false,
                        decision,
                    });
                    history.push(ContextEntry::new(role.name(), output));
                }
                Some(Err(e)) => {
                    warn!(
                        message_id = %message_id,
                        role = %role,
                        error = %e,
                        "Analysis role failed, holding message"
                    );
                    turns.push(AnalysisTurn {
                        role,
                        position: index + 1,
                        output: e.to_string(),
                        context_len: history.len(),
                        failed: true,
                        decision: None,
                    });
                    annotations.push(format!("analysis halted at {}: {}", role, e));

                    return AnalysisOutcome {
                        message_id,
                        turns,
                        disposition: Disposition::HeldForReview,
                        failed_role: Some(role),
                        cancelled: false,
                        annotations,
                    };
                }
                None => {
                    warn!(
                        message_id = %message_id,
                        role = %role,
                        completed = turns.len(),
                        "Analysis cancelled, holding message"
                    );
                    annotations.push(format!(
                        "analysis cancelled before {} ({} of {} roles completed)",
                        role,
                        turns.len(),
                        self.config.roles.len()
                    ));

                    return AnalysisOutcome {
                        message_id,
                        turns,
                        disposition: Disposition::HeldForReview,
                        failed_role: None,
                        cancelled: true,
                        annotations,
                    };
                }
            }
        }

        let mut disposition = match turns.last().and_then(|t| t.decision) {
            Some(decision) => decision,
            None => {
                annotations.push("no clear decision from final role".to_string());
                Disposition::HeldForReview
            }
        };

        if disposition == Disposition::Approved
            && matches!(scored.validation.status, ValidationStatus::Uncorrected { .. })
        {
            annotations.push("approval withheld: message failed validation".to_string());
            disposition = Disposition::HeldForReview;
        }

        info!(
            message_id = %message_id,
            turns = turns.len(),
            disposition = %disposition,
            "Analysis chain complete"
        );

        AnalysisOutcome {
            message_id,
            turns,
            disposition,
            failed_role: None,
            cancelled: false,
            annotations,
        }
    }

    /// Run chains for a batch of flagged messages under the bounded pool
    pub async fn analyze_batch(
        self: &Arc<Self>,
        flagged: Vec<ScoredMessage>,
        cancel: &CancellationToken,
    ) -> Vec<UnitOutcome<AnalyzedMessage>> {
        let this = self.clone();
        let token = cancel.clone();

        // Chains watch `cancel` themselves so partial turns are kept; the pool
        // only bounds concurrency and isolates panics.
        run_bounded(
            flagged,
            self.config.max_concurrent_chains,
            &CancellationToken::new(),
            move |scored| {
                let this = this.clone();
                let token = token.clone();
                async move {
                    let analysis = this.analyze(&scored, &token).await;
                    AnalyzedMessage { scored, analysis }
                }
            },
        )
        .await
    }
}

fn build_prompt(role: AnalysisRole, scored: &ScoredMessage) -> String {
    let message = scored.message();
    let profile = &scored.profile;

    let reasons = profile.reasons();
    let reasons = if reasons.is_empty() {
        "none".to_string()
    } else {
        reasons.join("\n- ")
    };

    let validation = match &scored.validation.status {
        ValidationStatus::Valid if scored.validation.was_corrected => "valid (automatically corrected)".to_string(),
        ValidationStatus::Valid => "valid".to_string(),
        ValidationStatus::Uncorrected { violations } => format!(
            "INVALID, unresolved: {}",
            violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        ),
    };

    format!(
        r#"ROLE: {}

{}

MESSAGE:
{}
Narrative: {}

VALIDATION: {}

RISK SCORE: {}/100 ({})
FINDINGS:
- {}

Previous analyst notes are provided as context, oldest first."#,
        role,
        role.instructions(),
        message.summary_line(),
        message.remittance_info,
        validation,
        profile.score(),
        profile.classification(),
        reasons,
    )
}
