//! Message validation rules
//!
//! Rules-based evaluation of a transfer message. Deterministic: the same
//! message always yields the same violations, in rule registration order.

use crate::config::ValidationRules;
use crate::models::{AmountDefect, MessageRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub mod correction_loop;
pub mod corrector;

pub use correction_loop::{CorrectionAttempt, ValidationCorrectionLoop, ValidationOutcome, ValidationStatus};
pub use corrector::CorrectionAgent;

/// One failed rule, with enough detail to drive a correction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule: String,
    pub detail: String,
}

impl RuleViolation {
    fn new(rule: &str, detail: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.detail)
    }
}

/// Outcome of evaluating one message against every rule
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub violations: Vec<RuleViolation>,
}

impl Evaluation {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Trait for validation rules
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, message: &MessageRecord, rules: &ValidationRules) -> Vec<RuleViolation>;
}

/// Evaluator that applies every registered rule
pub struct Evaluator {
    rules: ValidationRules,
    checks: Vec<Box<dyn ValidationRule>>,
}

impl Evaluator {
    pub fn new(rules: ValidationRules) -> Self {
        Self {
            rules,
            checks: Vec::new(),
        }
    }

    /// Evaluator with the standard transfer-message rule set
    pub fn with_default_rules(rules: ValidationRules) -> Self {
        let mut evaluator = Self::new(rules);
        evaluator.add_rule(Box::new(RequiredFieldsRule));
        evaluator.add_rule(Box::new(MessageTypeRule));
        evaluator.add_rule(Box::new(ReferenceLengthRule));
        evaluator.add_rule(Box::new(AmountRangeRule));
        evaluator.add_rule(Box::new(CurrencyRule));
        evaluator.add_rule(Box::new(IdentifierFormatRule));
        evaluator
    }

    pub fn add_rule(&mut self, rule: Box<dyn ValidationRule>) {
        self.checks.push(rule);
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    pub fn evaluate(&self, message: &MessageRecord) -> Evaluation {
        let violations: Vec<RuleViolation> = self
            .checks
            .iter()
            .flat_map(|check| check.check(message, &self.rules))
            .collect();

        debug!(
            message_id = %message.message_id,
            rule_count = self.checks.len(),
            violations = violations.len(),
            "Evaluation completed"
        );

        Evaluation { violations }
    }
}

//
// ========== Rules ==========
//

/// Rule: reference and party identifiers must be present
pub struct RequiredFieldsRule;

impl ValidationRule for RequiredFieldsRule {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn check(&self, message: &MessageRecord, _rules: &ValidationRules) -> Vec<RuleViolation> {
        let amount_missing = matches!(message.amount_defect, Some(AmountDefect::Missing));

        [
            ("reference", message.reference.trim().is_empty()),
            ("amount", amount_missing),
            ("sender_bic", message.sender_bic.trim().is_empty()),
            ("receiver_bic", message.receiver_bic.trim().is_empty()),
        ]
        .iter()
        .filter(|(_, missing)| *missing)
        .map(|(field, _)| RuleViolation::new(self.name(), format!("missing required field: {}", field)))
        .collect()
    }
}

/// Rule: only supported transfer instruction kinds
pub struct MessageTypeRule;

impl ValidationRule for MessageTypeRule {
    fn name(&self) -> &'static str {
        "message_type"
    }

    fn check(&self, message: &MessageRecord, _rules: &ValidationRules) -> Vec<RuleViolation> {
        if message.message_type.is_supported() {
            Vec::new()
        } else {
            vec![RuleViolation::new(
                self.name(),
                format!("invalid message type: '{}' (expected MT103 or MT202)", message.message_type),
            )]
        }
    }
}

/// Rule: reference text within the length bound
pub struct ReferenceLengthRule;

impl ValidationRule for ReferenceLengthRule {
    fn name(&self) -> &'static str {
        "reference_length"
    }

    fn check(&self, message: &MessageRecord, rules: &ValidationRules) -> Vec<RuleViolation> {
        let length = message.reference.chars().count();
        if length > rules.max_reference_length {
            vec![RuleViolation::new(
                self.name(),
                format!(
                    "reference too long: {} chars (max {})",
                    length, rules.max_reference_length
                ),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Rule: amount inside the inclusive configured range
pub struct AmountRangeRule;

impl ValidationRule for AmountRangeRule {
    fn name(&self) -> &'static str {
        "amount_range"
    }

    fn check(&self, message: &MessageRecord, rules: &ValidationRules) -> Vec<RuleViolation> {
        match &message.amount_defect {
            // Reported by the required-fields rule
            Some(AmountDefect::Missing) => return Vec::new(),
            Some(AmountDefect::Unparseable { raw }) => {
                return vec![RuleViolation::new(
                    self.name(),
                    format!("invalid amount format: '{}'", raw),
                )]
            }
            None => {}
        }

        let value = message.amount.value;
        if value > rules.max_amount {
            vec![RuleViolation::new(
                self.name(),
                format!("amount {} exceeds maximum {}", value, rules.max_amount),
            )]
        } else if value < rules.min_amount {
            vec![RuleViolation::new(
                self.name(),
                format!("amount {} below minimum {}", value, rules.min_amount),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Rule: currency in the accepted set
pub struct CurrencyRule;

impl ValidationRule for CurrencyRule {
    fn name(&self) -> &'static str {
        "currency"
    }

    fn check(&self, message: &MessageRecord, rules: &ValidationRules) -> Vec<RuleViolation> {
        let currency = &message.amount.currency;
        if rules.accepted_currencies.iter().any(|c| c == currency) {
            Vec::new()
        } else {
            vec![RuleViolation::new(
                self.name(),
                format!(
                    "invalid currency: '{}' (accepted: {})",
                    currency,
                    rules.accepted_currencies.join(", ")
                ),
            )]
        }
    }
}

/// Rule: sender and receiver BIC structure
pub struct IdentifierFormatRule;

impl ValidationRule for IdentifierFormatRule {
    fn name(&self) -> &'static str {
        "identifier_format"
    }

    fn check(&self, message: &MessageRecord, _rules: &ValidationRules) -> Vec<RuleViolation> {
        [("sender", &message.sender_bic), ("receiver", &message.receiver_bic)]
            .iter()
            .filter(|(_, bic)| !is_valid_bic(bic))
            .map(|(party, bic)| RuleViolation::new(self.name(), format!("invalid {} BIC: '{}'", party, bic)))
            .collect()
    }
}

/// BIC: 4 letters bank, 2 letters country, 2 alphanumeric location,
/// optional 3 alphanumeric branch
pub fn is_valid_bic(bic: &str) -> bool {
    if !bic.is_ascii() || !(bic.len() == 8 || bic.len() == 11) {
        return false;
    }

    let bytes = bic.as_bytes();
    bytes[..6].iter().all(|b| b.is_ascii_alphabetic())
        && bytes[6..].iter().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Amount, AmountDefect, MessageType};
    use chrono::Utc;
    use rust_decimal::Decimal;

    pub(crate) fn valid_message(id: &str) -> MessageRecord {
        MessageRecord {
            message_id: id.to_string(),
            message_type: MessageType::Mt103,
            reference: "REF123456".to_string(),
            amount: Amount::new(Decimal::new(500050, 2), "USD"),
            amount_defect: None,
            sender_bic: "CHASUS33XXX".to_string(),
            receiver_bic: "DEUTDEFFXXX".to_string(),
            remittance_info: "Invoice payment".to_string(),
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    fn evaluator() -> Evaluator {
        Evaluator::with_default_rules(ValidationRules::default())
    }

    fn rules_hit(message: &MessageRecord) -> Vec<String> {
        evaluator()
            .evaluate(message)
            .violations
            .into_iter()
            .map(|v| v.rule)
            .collect()
    }

    #[test]
    fn test_valid_message_passes() {
        assert!(evaluator().evaluate(&valid_message("M1")).is_valid());
    }

    #[test]
    fn test_invalid_currency() {
        let mut message = valid_message("M1");
        message.amount.currency = "SGD".to_string();
        assert_eq!(rules_hit(&message), vec!["currency"]);
    }

    #[test]
    fn test_amount_bounds_are_inclusive() {
        let mut message = valid_message("M1");
        message.amount.value = Decimal::new(1, 2);
        assert!(evaluator().evaluate(&message).is_valid());

        message.amount.value = Decimal::new(99_999_999_999, 2);
        assert!(evaluator().evaluate(&message).is_valid());

        message.amount.value = Decimal::new(1, 3);
        assert_eq!(rules_hit(&message), vec!["amount_range"]);

        message.amount.value = Decimal::new(999_999_999_999, 2);
        assert_eq!(rules_hit(&message), vec!["amount_range"]);
    }

    #[test]
    fn test_reference_length_bound() {
        let mut message = valid_message("M1");
        message.reference = "A".repeat(16);
        assert!(evaluator().evaluate(&message).is_valid());

        message.reference = "THIS_REFERENCE_IS_WAY_TOO_LONG_12345".to_string();
        assert_eq!(rules_hit(&message), vec!["reference_length"]);
    }

    #[test]
    fn test_everything_wrong() {
        let mut message = valid_message("INVALID001");
        message.message_type = MessageType::Unknown("MT999".to_string());
        message.reference = String::new();
        message.sender_bic = "INVALID".to_string();

        let hits = rules_hit(&message);
        assert!(hits.contains(&"required_fields".to_string()));
        assert!(hits.contains(&"message_type".to_string()));
        assert!(hits.contains(&"identifier_format".to_string()));
    }

    #[test]
    fn test_missing_amount_is_a_violation() {
        let mut message = valid_message("M1");
        message.amount = Amount::new(Decimal::ZERO, "USD");
        message.amount_defect = Some(AmountDefect::Missing);

        let violations = evaluator().evaluate(&message).violations;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "required_fields");
        assert_eq!(violations[0].detail, "missing required field: amount");
    }

    #[test]
    fn test_unparseable_amount_is_a_violation() {
        let mut message = valid_message("M1");
        message.amount = Amount::new(Decimal::ZERO, "USD");
        message.amount_defect = Some(AmountDefect::Unparseable {
            raw: "lots".to_string(),
        });

        let violations = evaluator().evaluate(&message).violations;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].detail, "invalid amount format: 'lots'");
    }

    #[test]
    fn test_bic_format() {
        assert!(is_valid_bic("DEUTDEFF"));
        assert!(is_valid_bic("CHASUS33XXX"));
        assert!(!is_valid_bic("TEST1234"));
        assert!(!is_valid_bic("DEUTDEF"));
        assert!(!is_valid_bic("DEUTDEFF1"));
        assert!(!is_valid_bic("DEUTDEFF_XX"));
        assert!(!is_valid_bic("DÉUTDEFF"));
    }
}
