//! Core data models for transfer messages

use crate::error::PipelineError;
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

//
// ================= Enums =================
//

/// Transfer instruction kind. Raw input may carry an unsupported kind,
/// which the validation loop reports and asks to have corrected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Single customer credit transfer
    Mt103,
    /// General financial institution transfer
    Mt202,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Mt103 => "MT103",
            MessageType::Mt202 => "MT202",
            MessageType::Unknown(raw) => raw,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }
}

impl From<String> for MessageType {
    fn from(raw: String) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "MT103" => MessageType::Mt103,
            "MT202" => MessageType::Mt202,
            _ => MessageType::Unknown(raw),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Final classification of a message in the report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Approved,
    #[serde(rename = "held")]
    HeldForReview,
    Rejected,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Disposition::Approved => "APPROVED",
            Disposition::HeldForReview => "HELD",
            Disposition::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Amount =================
//

/// Currency-tagged decimal amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    pub value: Decimal,
    pub currency: String,
}

impl Amount {
    pub fn new(value: Decimal, currency: impl Into<String>) -> Self {
        Self {
            value,
            currency: currency.into(),
        }
    }

    /// Parse the `"5000.00 USD"` form used by message sources
    pub fn parse_tagged(text: &str, fallback_currency: Option<&str>) -> Result<Self> {
        let mut tokens = text.split_whitespace();

        let numeric = tokens
            .next()
            .ok_or_else(|| PipelineError::InvalidMessage("empty amount".to_string()))?;

        let value = parse_decimal(numeric)?;

        let currency = tokens
            .last()
            .or(fallback_currency)
            .unwrap_or_default()
            .trim()
            .to_uppercase();

        Ok(Self { value, currency })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && *c != '_').collect();
    Decimal::from_str(&cleaned)
        .map_err(|e| PipelineError::InvalidMessage(format!("unparseable amount '{}': {}", raw, e)))
}

//
// ================= Message Record =================
//

/// Why a record's amount could not be read at intake.
///
/// The record still enters the validation loop with a zero amount; the
/// defect is reported as a violation and cleared by a successful correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AmountDefect {
    Missing,
    Unparseable { raw: String },
}

/// A transfer message as it flows through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub message_type: MessageType,
    pub reference: String,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_defect: Option<AmountDefect>,
    pub sender_bic: String,
    pub receiver_bic: String,
    #[serde(default)]
    pub remittance_info: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Loosely-typed shape accepted from message sources and correction replies
#[derive(Debug, Deserialize)]
struct RawMessage {
    message_id: Option<String>,
    message_type: Option<String>,
    reference: Option<String>,
    amount: Option<RawAmount>,
    currency: Option<String>,
    sender_bic: Option<String>,
    receiver_bic: Option<String>,
    #[serde(alias = "narrative")]
    remittance_info: Option<String>,
    created_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Number(serde_json::Number),
    Tagged { value: Decimal, currency: String },
    Other(serde_json::Value),
}

impl MessageRecord {
    /// Build a record from a raw source object.
    ///
    /// Missing text fields become empty strings and a missing or unreadable
    /// amount becomes a zero amount with an [`AmountDefect`], so the
    /// validation loop can report and correct them. Only input that is not
    /// a message object at all is rejected.
    pub fn from_raw(raw: &serde_json::Value, fallback_id: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_value(raw.clone())
            .map_err(|e| PipelineError::InvalidMessage(format!("malformed record: {}", e)))?;

        let currency = raw.currency.as_deref().unwrap_or_default().trim().to_uppercase();
        let unreadable = |text: String| {
            (
                Amount::new(Decimal::ZERO, currency.clone()),
                Some(AmountDefect::Unparseable { raw: text }),
            )
        };

        let (amount, amount_defect) = match raw.amount {
            Some(RawAmount::Text(text)) => match Amount::parse_tagged(&text, raw.currency.as_deref()) {
                Ok(amount) => (amount, None),
                Err(_) => unreadable(text),
            },
            Some(RawAmount::Number(number)) => match parse_decimal(&number.to_string()) {
                Ok(value) => (Amount::new(value, currency.clone()), None),
                Err(_) => unreadable(number.to_string()),
            },
            Some(RawAmount::Tagged { value, currency }) => {
                (Amount::new(value, currency.trim().to_uppercase()), None)
            }
            Some(RawAmount::Other(serde_json::Value::Null)) | None => (
                Amount::new(Decimal::ZERO, currency.clone()),
                Some(AmountDefect::Missing),
            ),
            Some(RawAmount::Other(other)) => unreadable(other.to_string()),
        };

        let message_id = raw
            .message_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| fallback_id.to_string());

        Ok(Self {
            message_id,
            message_type: MessageType::from(raw.message_type.unwrap_or_default()),
            reference: raw.reference.unwrap_or_default(),
            amount,
            amount_defect,
            sender_bic: raw.sender_bic.unwrap_or_default(),
            receiver_bic: raw.receiver_bic.unwrap_or_default(),
            remittance_info: raw.remittance_info.unwrap_or_default(),
            created_at: raw.created_at.unwrap_or_else(Utc::now),
            processed_at: raw.processed_at,
        })
    }

    /// ISO country code embedded in the sender BIC (characters 5-6)
    pub fn sender_country(&self) -> Option<&str> {
        bic_country(&self.sender_bic)
    }

    /// ISO country code embedded in the receiver BIC (characters 5-6)
    pub fn receiver_country(&self) -> Option<&str> {
        bic_country(&self.receiver_bic)
    }

    /// Bank code of the receiver BIC (first four characters)
    pub fn receiver_bank(&self) -> &str {
        self.receiver_bic.get(..4).unwrap_or(&self.receiver_bic)
    }

    /// Compact one-line description used in prompts and logs
    pub fn summary_line(&self) -> String {
        format!(
            "{} {} ref={} {} {} -> {}",
            self.message_id,
            self.message_type,
            self.reference,
            self.amount,
            self.sender_bic,
            self.receiver_bic
        )
    }
}

fn bic_country(bic: &str) -> Option<&str> {
    bic.get(4..6)
        .filter(|code| code.chars().all(|c| c.is_ascii_alphabetic()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_raw_tagged_amount_text() {
        let raw = json!({
            "message_id": "VALID001",
            "message_type": "MT103",
            "reference": "REF123456",
            "amount": "5000.00 USD",
            "sender_bic": "CHASUS33XXX",
            "receiver_bic": "DEUTDEFFXXX",
            "remittance_info": "Invoice payment"
        });

        let record = MessageRecord::from_raw(&raw, "MSG-0001").unwrap();
        assert_eq!(record.message_id, "VALID001");
        assert_eq!(record.message_type, MessageType::Mt103);
        assert_eq!(record.amount.value, Decimal::new(500000, 2));
        assert_eq!(record.amount.currency, "USD");
        assert_eq!(record.sender_country(), Some("US"));
        assert_eq!(record.receiver_country(), Some("DE"));
        assert_eq!(record.receiver_bank(), "DEUT");
    }

    #[test]
    fn test_from_raw_split_fields_and_fallback_id() {
        let raw = json!({
            "message_type": "mt202",
            "reference": "R1",
            "amount": 1250.5,
            "currency": "eur",
            "sender_bic": "BARCGB22",
            "receiver_bic": "BNPAFRPP",
            "narrative": "Treasury sweep"
        });

        let record = MessageRecord::from_raw(&raw, "MSG-0007").unwrap();
        assert_eq!(record.message_id, "MSG-0007");
        assert_eq!(record.message_type, MessageType::Mt202);
        assert_eq!(record.amount.currency, "EUR");
        assert_eq!(record.amount.value, Decimal::new(12505, 1));
        assert_eq!(record.remittance_info, "Treasury sweep");
    }

    #[test]
    fn test_unknown_message_type_is_preserved() {
        let raw = json!({ "message_type": "MT999", "amount": "10 USD" });
        let record = MessageRecord::from_raw(&raw, "MSG-1").unwrap();
        assert_eq!(record.message_type, MessageType::Unknown("MT999".to_string()));
        assert!(!record.message_type.is_supported());
    }

    #[test]
    fn test_missing_amount_is_recorded_as_defect() {
        let raw = json!({ "message_type": "MT103", "reference": "X" });
        let record = MessageRecord::from_raw(&raw, "MSG-1").unwrap();
        assert_eq!(record.amount.value, Decimal::ZERO);
        assert_eq!(record.amount_defect, Some(AmountDefect::Missing));
    }

    #[test]
    fn test_unparseable_amount_keeps_raw_text() {
        let raw = json!({ "amount": "five thousand USD", "currency": "usd" });
        let record = MessageRecord::from_raw(&raw, "MSG-1").unwrap();
        assert_eq!(
            record.amount_defect,
            Some(AmountDefect::Unparseable {
                raw: "five thousand USD".to_string()
            })
        );
        assert_eq!(record.amount.currency, "USD");
    }

    #[test]
    fn test_non_object_input_is_invalid_message() {
        let err = MessageRecord::from_raw(&json!(["MT103", "5000 USD"]), "MSG-1").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMessage(_)));
    }

    #[test]
    fn test_canonical_form_round_trips_through_from_raw() {
        let raw = json!({
            "message_id": "M1",
            "message_type": "MT103",
            "reference": "REF1",
            "amount": "42.10 GBP",
            "sender_bic": "BARCGB22",
            "receiver_bic": "DEUTDEFF",
        });
        let record = MessageRecord::from_raw(&raw, "unused").unwrap();
        let canonical = serde_json::to_value(&record).unwrap();
        let reparsed = MessageRecord::from_raw(&canonical, "unused").unwrap();
        assert_eq!(record, reparsed);
    }

    #[test]
    fn test_short_bic_has_no_country() {
        let raw = json!({ "amount": "1 USD", "sender_bic": "ABC" });
        let record = MessageRecord::from_raw(&raw, "M").unwrap();
        assert_eq!(record.sender_country(), None);
    }
}
