//! Validation-correction loop
//!
//! EVALUATE → (invalid) CORRECT → EVALUATE … bounded by a pass counter.
//! A message that is still invalid when the counter runs out is not dropped:
//! it leaves the loop as `Uncorrected` and is flagged for manual review.

use super::{CorrectionAgent, Evaluator, RuleViolation};
use crate::concurrency::{run_bounded, UnitOutcome};
use crate::error::PipelineError;
use crate::models::MessageRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether the message left the loop satisfying every rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Uncorrected { violations: Vec<RuleViolation> },
}

/// Finalized result of the loop for one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub message: Arc<MessageRecord>,
    pub was_corrected: bool,
    pub iterations_used: u32,
    pub status: ValidationStatus,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

/// One pass of the loop; never escapes it
#[derive(Debug, Clone)]
pub struct CorrectionAttempt {
    pub iteration: u32,
    pub valid: bool,
    pub errors: Vec<RuleViolation>,
    pub candidate: MessageRecord,
}

pub struct ValidationCorrectionLoop {
    evaluator: Evaluator,
    corrector: CorrectionAgent,
}

impl ValidationCorrectionLoop {
    pub fn new(evaluator: Evaluator, corrector: CorrectionAgent) -> Self {
        Self {
            evaluator,
            corrector,
        }
    }

    /// Evaluate `message`, correcting it up to the configured pass limit
    pub async fn validate_and_correct(&self, message: MessageRecord) -> ValidationOutcome {
        let max_iterations = self.evaluator.rules().max_iterations.max(1);
        let original = message.clone();
        let mut latest = CorrectionAttempt {
            iteration: 0,
            valid: false,
            errors: Vec::new(),
            candidate: message,
        };

        for iteration in 1..=max_iterations {
            let evaluation = self.evaluator.evaluate(&latest.candidate);
            latest.iteration = iteration;
            latest.valid = evaluation.is_valid();
            latest.errors = evaluation.violations;

            if latest.valid {
                let was_corrected = latest.candidate != original;
                debug!(
                    message_id = %original.message_id,
                    iteration,
                    was_corrected,
                    "Message valid"
                );
                return ValidationOutcome {
                    message: Arc::new(latest.candidate),
                    was_corrected,
                    iterations_used: iteration,
                    status: ValidationStatus::Valid,
                };
            }

            debug!(
                message_id = %original.message_id,
                iteration,
                errors = latest.errors.len(),
                "Validation failed"
            );

            if iteration == max_iterations {
                break;
            }

            match self.corrector.correct(&latest.candidate, &latest.errors).await {
                Ok(candidate) => latest.candidate = candidate,
                // An unusable reply spends the pass; the next one asks again
                Err(e @ (PipelineError::MalformedResponse(_) | PipelineError::InvalidMessage(_))) => {
                    warn!(
                        message_id = %original.message_id,
                        iteration,
                        error = %e,
                        "Correction reply unusable, keeping current candidate"
                    );
                }
                Err(e) => {
                    warn!(
                        message_id = %original.message_id,
                        iteration,
                        error = %e,
                        "Correction failed, leaving message uncorrected"
                    );
                    break;
                }
            }
        }

        warn!(
            message_id = %original.message_id,
            iterations = latest.iteration,
            remaining_errors = latest.errors.len(),
            "Message still invalid, flagged for manual review"
        );

        let was_corrected = latest.candidate != original;
        ValidationOutcome {
            message: Arc::new(latest.candidate),
            was_corrected,
            iterations_used: latest.iteration,
            status: ValidationStatus::Uncorrected {
                violations: latest.errors,
            },
        }
    }

    /// Run the loop over a batch under the bounded pool
    pub async fn validate_batch(
        self: &Arc<Self>,
        messages: Vec<MessageRecord>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Vec<UnitOutcome<ValidationOutcome>> {
        let total = messages.len();
        let this = self.clone();

        let outcomes = run_bounded(messages, limit, cancel, move |message| {
            let this = this.clone();
            async move { this.validate_and_correct(message).await }
        })
        .await;

        let valid = outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::Completed(v) if v.is_valid()))
            .count();
        info!(total, valid, invalid = total - valid, "Validation stage complete");

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ScriptedGenerator, TextGenerator};
    use crate::config::{RetryPolicy, ValidationRules};
    use crate::models::MessageType;
    use crate::validation::tests::valid_message;

    fn build_loop(generator: Arc<dyn TextGenerator>) -> ValidationCorrectionLoop {
        let rules = ValidationRules::default();
        let corrector = CorrectionAgent::new(
            generator,
            RetryPolicy {
                max_retries: 2,
                backoff_ms: 1,
                timeout_ms: 500,
            },
            rules.accepted_currencies.clone(),
        );
        ValidationCorrectionLoop::new(Evaluator::with_default_rules(rules), corrector)
    }

    #[tokio::test]
    async fn test_valid_message_returns_unchanged() {
        let generator = Arc::new(ScriptedGenerator::always("{}"));
        let lp = build_loop(generator.clone());
        let input = valid_message("M1");

        let outcome = lp.validate_and_correct(input.clone()).await;
        assert_eq!(*outcome.message, input);
        assert!(!outcome.was_corrected);
        assert_eq!(outcome.iterations_used, 1);
        assert!(outcome.is_valid());
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_sgd_is_corrected_in_one_pass() {
        let generator = Arc::new(ScriptedGenerator::always(r#"{"amount": "5000.50 USD"}"#));
        let lp = build_loop(generator);
        let mut input = valid_message("M1");
        input.amount.currency = "SGD".to_string();

        let outcome = lp.validate_and_correct(input).await;
        assert!(outcome.is_valid());
        assert!(outcome.was_corrected);
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(outcome.message.amount.currency, "USD");
    }

    #[tokio::test]
    async fn test_rerun_on_finalized_output_is_noop() {
        let generator = Arc::new(ScriptedGenerator::always(r#"{"amount": "5000.50 USD"}"#));
        let lp = build_loop(generator);
        let mut input = valid_message("M1");
        input.amount.currency = "SGD".to_string();

        let first = lp.validate_and_correct(input).await;
        let second = lp.validate_and_correct((*first.message).clone()).await;
        assert_eq!(second.message, first.message);
        assert!(!second.was_corrected);
        assert_eq!(second.iterations_used, 1);
    }

    #[tokio::test]
    async fn test_unfixable_message_stops_after_max_passes() {
        // The "fix" never addresses the message type
        let generator = Arc::new(ScriptedGenerator::always(r#"{"reference": "REF-FIXED"}"#));
        let lp = build_loop(generator.clone());
        let mut input = valid_message("M1");
        input.message_type = MessageType::Unknown("MT999".to_string());

        let outcome = lp.validate_and_correct(input).await;
        assert_eq!(outcome.iterations_used, 3);
        assert_eq!(generator.call_count(), 2);
        assert!(outcome.was_corrected);
        assert_eq!(outcome.message.reference, "REF-FIXED");
        match outcome.status {
            ValidationStatus::Uncorrected { violations } => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].rule, "message_type");
            }
            ValidationStatus::Valid => panic!("expected uncorrected"),
        }
    }

    #[tokio::test]
    async fn test_capability_failure_is_soft() {
        let generator = Arc::new(ScriptedGenerator::new(|_, _| {
            Err(PipelineError::FatalCapability("model unavailable".into()))
        }));
        let lp = build_loop(generator);
        let mut input = valid_message("M1");
        input.amount.currency = "SGD".to_string();

        let outcome = lp.validate_and_correct(input.clone()).await;
        assert!(!outcome.is_valid());
        assert!(!outcome.was_corrected);
        assert_eq!(outcome.iterations_used, 1);
        assert_eq!(*outcome.message, input);
    }

    #[tokio::test]
    async fn test_unusable_reply_uses_next_pass() {
        let generator = Arc::new(ScriptedGenerator::sequence(vec![
            Ok("Sure, here is the fix: currency should be USD".to_string()),
            Ok(r#"{"amount": "5000.50 USD"}"#.to_string()),
        ]));
        let lp = build_loop(generator.clone());
        let mut input = valid_message("M1");
        input.amount.currency = "SGD".to_string();

        let outcome = lp.validate_and_correct(input).await;
        assert!(outcome.is_valid());
        assert!(outcome.was_corrected);
        assert_eq!(outcome.iterations_used, 3);
        assert_eq!(generator.call_count(), 2);
        assert_eq!(outcome.message.amount.currency, "USD");
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let generator = Arc::new(ScriptedGenerator::always(r#"{"amount": "5000.50 USD"}"#));
        let lp = Arc::new(build_loop(generator));
        let mut second = valid_message("M2");
        second.amount.currency = "SGD".to_string();

        let outcomes = lp
            .validate_batch(
                vec![valid_message("M1"), second, valid_message("M3")],
                2,
                &CancellationToken::new(),
            )
            .await;

        let ids: Vec<String> = outcomes
            .into_iter()
            .filter_map(UnitOutcome::completed)
            .map(|o| o.message.message_id.clone())
            .collect();
        assert_eq!(ids, vec!["M1", "M2", "M3"]);
    }
}
