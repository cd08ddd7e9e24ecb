//! Correction agent
//!
//! Turns a list of rule violations into a correction request, sends it to the
//! text generation capability and parses the reply into a candidate record.

use super::RuleViolation;
use crate::capability::{generate_with_retry, strip_code_fences, TextGenerator};
use crate::config::RetryPolicy;
use crate::error::PipelineError;
use crate::models::{AmountDefect, MessageRecord};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct CorrectionAgent {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    accepted_currencies: Vec<String>,
}

impl CorrectionAgent {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        retry: RetryPolicy,
        accepted_currencies: Vec<String>,
    ) -> Self {
        Self {
            generator,
            retry,
            accepted_currencies,
        }
    }

    /// Ask the capability for a corrected version of `message`
    pub async fn correct(
        &self,
        message: &MessageRecord,
        violations: &[RuleViolation],
    ) -> Result<MessageRecord> {
        let prompt = self.build_prompt(message, violations)?;

        let response = generate_with_retry(
            self.generator.as_ref(),
            &self.retry,
            "correction",
            &prompt,
            &[],
        )
        .await?;

        debug!(
            message_id = %message.message_id,
            response_len = response.len(),
            "Correction response received"
        );

        parse_correction(&response, message)
    }

    fn build_prompt(&self, message: &MessageRecord, violations: &[RuleViolation]) -> Result<String> {
        let message_json = serde_json::to_string_pretty(message)?;
        let errors = violations
            .iter()
            .map(|v| format!("- {}", v))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(format!(
            r#"CORRECTION REQUEST

You are a SWIFT message correction expert.
Fix the validation errors while maintaining the business intent.

Original SWIFT message:
{}

Validation errors to fix:
{}

Constraints:
- message_type must be MT103 or MT202
- currency must be one of: {}
- reference at most 16 characters
- BIC: 4 letters bank, 2 letters country, 2 alphanumeric location, optional 3 alphanumeric branch
- Keep message_id unchanged

Return ONLY the complete corrected message as a JSON object with the same fields.
"#,
            message_json,
            errors,
            self.accepted_currencies.join(", "),
        ))
    }
}

/// Merge the model's JSON reply over the current candidate.
///
/// Fields the reply omits keep their current value; identity fields are
/// never taken from the reply.
fn parse_correction(response: &str, current: &MessageRecord) -> Result<MessageRecord> {
    let cleaned = strip_code_fences(response);

    let reply: Value = serde_json::from_str(cleaned).map_err(|e| {
        PipelineError::MalformedResponse(format!("correction reply is not JSON: {}", e))
    })?;

    let Value::Object(fields) = reply else {
        return Err(PipelineError::MalformedResponse(
            "correction reply is not a JSON object".to_string(),
        ));
    };

    let mut merged = serde_json::to_value(current)?;
    if let Value::Object(base) = &mut merged {
        // A defective amount is re-read from what intake saw, so it stays
        // defective unless the reply supplies a new one.
        match &current.amount_defect {
            Some(AmountDefect::Missing) => {
                base.remove("amount");
            }
            Some(AmountDefect::Unparseable { raw }) => {
                base.insert("amount".to_string(), Value::String(raw.clone()));
                base.insert("currency".to_string(), Value::String(current.amount.currency.clone()));
            }
            None => {}
        }

        // A reply may send the split `currency` form; drop the structured
        // amount so the two shapes do not conflict.
        if fields.contains_key("currency") && !fields.contains_key("amount") {
            if let Some(Value::Object(amount)) = base.get("amount").cloned() {
                if let Some(value) = amount.get("value") {
                    base.insert("amount".to_string(), value.clone());
                }
            }
        }

        for (key, value) in fields {
            if key == "message_id" || key == "created_at" {
                continue;
            }
            base.insert(key, value);
        }
    }

    let mut candidate = MessageRecord::from_raw(&merged, &current.message_id)?;
    candidate.message_id = current.message_id.clone();
    candidate.created_at = current.created_at;
    Ok(candidate)
}
