//! Sequential analysis of flagged messages
//!
//! A fixed sequence of roles reviews each flagged message in turn. Every turn
//! sees the complete history of the turns before it.

use crate::models::Disposition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub mod chain;

pub use chain::{AnalysisChain, AnalyzedMessage};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisRole {
    JuniorScreening,
    TechnicalReview,
    RiskAssessment,
    ComplianceReview,
    FinalDecision,
}

impl AnalysisRole {
    /// Default order of the chain
    pub const SEQUENCE: [AnalysisRole; 5] = [
        AnalysisRole::JuniorScreening,
        AnalysisRole::TechnicalReview,
        AnalysisRole::RiskAssessment,
        AnalysisRole::ComplianceReview,
        AnalysisRole::FinalDecision,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnalysisRole::JuniorScreening => "junior_screening",
            AnalysisRole::TechnicalReview => "technical_review",
            AnalysisRole::RiskAssessment => "risk_assessment",
            AnalysisRole::ComplianceReview => "compliance_review",
            AnalysisRole::FinalDecision => "final_decision",
        }
    }

    pub fn instructions(&self) -> &'static str {
        match self {
            AnalysisRole::JuniorScreening => {
                "You are a junior payments analyst. Perform an initial screening: \
                 summarise the transfer, note anything unusual and say what a senior \
                 reviewer should look at."
            }
            AnalysisRole::TechnicalReview => {
                "You are a technical reviewer. Check the message structure, identifiers \
                 and amounts for inconsistencies, building on the screening notes."
            }
            AnalysisRole::RiskAssessment => {
                "You are a financial crime risk assessor. Weigh the detector findings and \
                 the previous notes, and state how serious the risk is and why."
            }
            AnalysisRole::ComplianceReview => {
                "You are a compliance officer. Assess sanctions, AML and regulatory \
                 exposure given everything noted so far."
            }
            AnalysisRole::FinalDecision => {
                "You are the final decision maker. Considering every previous assessment, \
                 decide the outcome. End your answer with exactly one line of the form \
                 `DECISION: APPROVE`, `DECISION: HOLD` or `DECISION: REJECT`."
            }
        }
    }
}

impl fmt::Display for AnalysisRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One role's contribution to a chain
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisTurn {
    pub role: AnalysisRole,
    /// 1-based position in the chain
    pub position: usize,
    pub output: String,
    /// Number of prior turns handed to this one as context
    pub context_len: usize,
    pub failed: bool,
    pub decision: Option<Disposition>,
}

/// Result of running the chain on one message
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub message_id: String,
    pub turns: Vec<AnalysisTurn>,
    pub disposition: Disposition,
    pub failed_role: Option<AnalysisRole>,
    /// Stopped by batch cancellation; `turns` holds what completed
    pub cancelled: bool,
    pub annotations: Vec<String>,
}

/// Extract a disposition from free-form model output.
///
/// An explicit `DECISION:` (or `DISPOSITION:`) line wins. Without one, the
/// text must name exactly one outcome, and that outcome can only be hold or
/// reject. A negated outcome ("not approved", "cannot approve") makes the
/// answer ambiguous. Anything ambiguous is `None`.
pub fn parse_disposition(text: &str) -> Option<Disposition> {
    for line in text.lines() {
        let cleaned = line
            .trim()
            .trim_start_matches(['*', '#', '-', '>', ' '])
            .to_uppercase();

        let rest = cleaned
            .strip_prefix("DECISION")
            .or_else(|| cleaned.strip_prefix("DISPOSITION"))
            .map(|r| r.trim_start_matches(['*', ' ']))
            .and_then(|r| r.strip_prefix(':'));

        if let Some(rest) = rest {
            match read_keywords(rest, true) {
                Reading::Clear(decision) => return Some(decision),
                Reading::Ambiguous => return None,
                Reading::Silent => {}
            }
        }
    }

    // Free text never approves on its own
    match read_keywords(text, false) {
        Reading::Clear(Disposition::Approved) => None,
        Reading::Clear(decision) => Some(decision),
        Reading::Ambiguous | Reading::Silent => None,
    }
}

const NEGATIONS: [&str; 12] = [
    "NOT", "NO", "NOR", "NEVER", "CANNOT", "CANT", "DONT", "WONT", "WOULDNT", "SHOULDNT", "COULDNT",
    "UNABLE",
];

/// Words before a keyword that are checked for a negation
const NEGATION_WINDOW: usize = 3;

enum Reading {
    Clear(Disposition),
    Ambiguous,
    Silent,
}

fn read_keywords(text: &str, decision_line: bool) -> Reading {
    let normalized = text.replace(['\'', '\u{2019}'], "").to_uppercase();
    let words: Vec<&str> = normalized
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();

    let mut found = HashSet::new();
    for (index, word) in words.iter().enumerate() {
        let decision = match *word {
            "APPROVE" | "APPROVED" => Disposition::Approved,
            "HOLD" | "HELD" => Disposition::HeldForReview,
            "REVIEW" if decision_line => Disposition::HeldForReview,
            "REJECT" | "REJECTED" => Disposition::Rejected,
            _ => continue,
        };

        let negated = words[index.saturating_sub(NEGATION_WINDOW)..index]
            .iter()
            .any(|w| NEGATIONS.contains(w));
        if negated {
            return Reading::Ambiguous;
        }
        found.insert(decision);
    }

    match found.len() {
        0 => Reading::Silent,
        1 => found.into_iter().next().map_or(Reading::Silent, Reading::Clear),
        _ => Reading::Ambiguous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_order() {
        let names: Vec<&str> = AnalysisRole::SEQUENCE.iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec![
                "junior_screening",
                "technical_review",
                "risk_assessment",
                "compliance_review",
                "final_decision"
            ]
        );
    }

    #[test]
    fn test_decision_line_wins() {
        let text = "We could approve this, but the corridor is sensitive.\n**DECISION:** HOLD";
        assert_eq!(parse_disposition(text), Some(Disposition::HeldForReview));
        assert_eq!(parse_disposition("decision: reject"), Some(Disposition::Rejected));
        assert_eq!(parse_disposition("DISPOSITION: APPROVED"), Some(Disposition::Approved));
    }

    #[test]
    fn test_single_keyword_without_decision_line() {
        assert_eq!(
            parse_disposition("The transfer should be rejected outright."),
            Some(Disposition::Rejected)
        );
    }

    #[test]
    fn test_negated_approval_is_none() {
        assert_eq!(parse_disposition("DECISION: NOT APPROVED"), None);
        assert_eq!(parse_disposition("Decision: we cannot approve"), None);
        assert_eq!(parse_disposition("I cannot approve this transfer."), None);
        assert_eq!(parse_disposition("I don't approve of this corridor."), None);
        assert_eq!(
            parse_disposition("Documentation is missing; I would not approve this transfer."),
            None
        );
    }

    #[test]
    fn test_free_text_never_approves() {
        assert_eq!(parse_disposition("Looks fine, approve it."), None);
        assert_eq!(parse_disposition("Put it on hold."), Some(Disposition::HeldForReview));
    }

    #[test]
    fn test_ambiguous_or_missing_is_none() {
        assert_eq!(parse_disposition("Approve or reject, hard to say."), None);
        assert_eq!(parse_disposition("No opinion."), None);
        assert_eq!(parse_disposition(""), None);
    }

    #[test]
    fn test_roles_round_trip_through_config_names() {
        let json = serde_json::to_string(&AnalysisRole::ComplianceReview).unwrap();
        assert_eq!(json, "\"compliance_review\"");
    }
}
