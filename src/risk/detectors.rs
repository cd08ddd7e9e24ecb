//! Built-in risk detectors
//!
//! Each detector is a pure function of the message and its rule table.

use super::{RiskDetector, RiskVerdict};
use crate::config::{AmountRules, PatternRules, RiskTierTable};
use crate::models::MessageRecord;
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Amount-based anomalies: high value, round sums, odd precision
pub struct AmountAnomalyDetector {
    rules: AmountRules,
}

impl AmountAnomalyDetector {
    pub fn new(rules: AmountRules) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RiskDetector for AmountAnomalyDetector {
    fn name(&self) -> &'static str {
        "amount_anomaly"
    }

    async fn inspect(&self, message: &MessageRecord) -> Result<RiskVerdict> {
        let value = message.amount.value;
        let mut delta = 0;
        let mut rationale = Vec::new();

        if value > self.rules.high_value_threshold {
            delta += self.rules.high_value_delta;
            rationale.push(format!("high amount transaction: {}", message.amount));
        }

        if value > Decimal::ZERO
            && !self.rules.round_unit.is_zero()
            && (value % self.rules.round_unit).is_zero()
        {
            delta += self.rules.round_delta;
            rationale.push(format!("suspiciously round amount: {}", message.amount));
        }

        let fractional_large =
            value > self.rules.precision_threshold && !value.fract().is_zero();
        let excess_places = value.normalize().scale() > self.rules.max_minor_units;
        if fractional_large || excess_places {
            delta += self.rules.precision_delta;
            rationale.push("unusual decimal precision".to_string());
        }

        Ok(RiskVerdict::new(self.name(), delta, rationale))
    }
}

/// Placeholder identifiers, self-transfers and narrative keywords
pub struct BehavioralPatternDetector {
    rules: PatternRules,
}

impl BehavioralPatternDetector {
    pub fn new(rules: PatternRules) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RiskDetector for BehavioralPatternDetector {
    fn name(&self) -> &'static str {
        "behavioral_pattern"
    }

    async fn inspect(&self, message: &MessageRecord) -> Result<RiskVerdict> {
        let sender = message.sender_bic.to_uppercase();
        let receiver = message.receiver_bic.to_uppercase();
        let mut delta = 0;
        let mut rationale = Vec::new();

        for pattern in &self.rules.placeholder_identifiers {
            let pattern = pattern.to_uppercase();
            if sender.contains(&pattern) || receiver.contains(&pattern) {
                delta += self.rules.placeholder_delta;
                rationale.push(format!("placeholder pattern in identifier: {}", pattern));
            }
        }

        if !message.sender_bic.is_empty() && message.sender_bic == message.receiver_bic {
            delta += self.rules.same_party_delta;
            rationale.push("same sender and receiver identifier".to_string());
        }

        let narrative = message.remittance_info.to_lowercase();
        for keyword in &self.rules.suspicious_keywords {
            if narrative.contains(&keyword.to_lowercase()) {
                delta += self.rules.keyword_delta;
                rationale.push(format!("suspicious keyword in narrative: {}", keyword));
            }
        }

        Ok(RiskVerdict::new(self.name(), delta, rationale))
    }
}

/// Jurisdiction risk from the country codes embedded in the BICs
pub struct GeographicRiskDetector {
    tiers: RiskTierTable,
}

impl GeographicRiskDetector {
    pub fn new(tiers: RiskTierTable) -> Self {
        Self { tiers }
    }

    fn in_tier(tier: &[String], country: Option<&str>) -> bool {
        country.is_some_and(|c| tier.iter().any(|t| t == c))
    }
}

#[async_trait]
impl RiskDetector for GeographicRiskDetector {
    fn name(&self) -> &'static str {
        "geographic_risk"
    }

    async fn inspect(&self, message: &MessageRecord) -> Result<RiskVerdict> {
        let sides = [
            ("from", message.sender_country()),
            ("to", message.receiver_country()),
        ];
        let mut delta = 0;
        let mut rationale = Vec::new();

        for (direction, country) in sides {
            if Self::in_tier(&self.tiers.high, country) {
                delta += self.tiers.high_delta;
                rationale.push(format!(
                    "transaction {} high-risk country: {}",
                    direction,
                    country.unwrap_or_default()
                ));
            }
            if Self::in_tier(&self.tiers.medium, country) {
                delta += self.tiers.medium_delta;
                rationale.push(format!(
                    "transaction {} medium-risk country: {}",
                    direction,
                    country.unwrap_or_default()
                ));
            }
        }

        if sides
            .iter()
            .any(|(_, country)| Self::in_tier(&self.tiers.offshore, *country))
        {
            delta += self.tiers.offshore_delta;
            rationale.push("transaction involves offshore jurisdiction".to_string());
        }

        let (sender, receiver) = (sides[0].1, sides[1].1);
        if sender.is_some() && sender == receiver && Self::in_tier(&self.tiers.high, sender) {
            delta += self.tiers.domestic_high_delta;
            rationale.push("domestic transaction in high-risk country".to_string());
        }

        Ok(RiskVerdict::new(self.name(), delta, rationale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::tests::valid_message;

    fn amount_detector() -> AmountAnomalyDetector {
        AmountAnomalyDetector::new(AmountRules::default())
    }

    #[tokio::test]
    async fn test_amount_high_and_round() {
        let mut message = valid_message("M1");
        message.amount.value = Decimal::from(50_000);

        let verdict = amount_detector().inspect(&message).await.unwrap();
        assert_eq!(verdict.delta, 50);
        assert_eq!(verdict.rationale.len(), 2);
    }

    #[tokio::test]
    async fn test_amount_unusual_precision() {
        let mut message = valid_message("M1");
        message.amount.value = Decimal::new(25_000_050, 2); // 250000.50
        let verdict = amount_detector().inspect(&message).await.unwrap();
        assert_eq!(verdict.delta, 40);

        message.amount.value = Decimal::new(12_345, 3); // 12.345
        let verdict = amount_detector().inspect(&message).await.unwrap();
        assert_eq!(verdict.delta, 10);
    }

    #[tokio::test]
    async fn test_amount_ordinary_value_scores_zero() {
        let verdict = amount_detector().inspect(&valid_message("M1")).await.unwrap();
        assert_eq!(verdict.delta, 0);
        assert!(verdict.rationale.is_empty());
    }

    #[tokio::test]
    async fn test_same_party_scores_fifty() {
        let mut message = valid_message("M1");
        message.receiver_bic = message.sender_bic.clone();

        let detector = BehavioralPatternDetector::new(PatternRules::default());
        let verdict = detector.inspect(&message).await.unwrap();
        assert_eq!(verdict.delta, 50);
    }

    #[tokio::test]
    async fn test_placeholders_and_keywords_accumulate_and_cap() {
        let mut message = valid_message("M1");
        message.sender_bic = "TESTUS33999".to_string();
        message.remittance_info = "URGENT and confidential".to_string();

        let detector = BehavioralPatternDetector::new(PatternRules::default());
        let verdict = detector.inspect(&message).await.unwrap();
        // 40 + 40 + 20 + 20 capped at 100
        assert_eq!(verdict.delta, 100);
        assert_eq!(verdict.rationale.len(), 4);
    }

    #[tokio::test]
    async fn test_geography_tiers() {
        let detector = GeographicRiskDetector::new(RiskTierTable::default());

        let mut message = valid_message("M1");
        message.receiver_bic = "BANKKYKYXXX".to_string();
        assert_eq!(detector.inspect(&message).await.unwrap().delta, 30);

        message.receiver_bic = "BANKPKKAXXX".to_string();
        assert_eq!(detector.inspect(&message).await.unwrap().delta, 40);

        message.sender_bic = "BANKIRTHXXX".to_string();
        message.receiver_bic = "BANKIRTHYYY".to_string();
        // 70 per side + 20 domestic, capped
        assert_eq!(detector.inspect(&message).await.unwrap().delta, 100);
    }

    #[tokio::test]
    async fn test_geography_clean_corridor() {
        let detector = GeographicRiskDetector::new(RiskTierTable::default());
        let verdict = detector.inspect(&valid_message("M1")).await.unwrap();
        assert_eq!(verdict.delta, 0);
    }
}
