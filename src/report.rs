//! Final batch report
//!
//! One entry per input message, in batch order, plus a summary and an
//! integrity digest over the entries.

use crate::analysis::{AnalysisOutcome, AnalysisRole};
use crate::models::Disposition;
use crate::risk::RiskClassification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Zero-based position of the message in the input batch
    pub position: usize,
    pub message_id: String,
    pub disposition: Disposition,
    pub classification: Option<RiskClassification>,
    pub risk_score: Option<u8>,
    pub was_corrected: bool,
    pub validation_iterations: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_reasons: Vec<String>,
    pub analysis_turns: usize,
    pub failed_role: Option<AnalysisRole>,
    /// Per-role outcome of the analysis chain, in chain order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analysis_trail: Vec<RoleSummary>,
    /// Text of the last completed analysis turn, shortened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_conclusion: Option<String>,
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub error: Option<String>,
}

impl ReportEntry {
    pub fn new(position: usize, message_id: impl Into<String>, disposition: Disposition) -> Self {
        Self {
            position,
            message_id: message_id.into(),
            disposition,
            classification: None,
            risk_score: None,
            was_corrected: false,
            validation_iterations: 0,
            validation_errors: Vec::new(),
            risk_reasons: Vec::new(),
            analysis_turns: 0,
            failed_role: None,
            analysis_trail: Vec::new(),
            analysis_conclusion: None,
            task_id: None,
            notes: Vec::new(),
            error: None,
        }
    }

    /// Copy the chain's per-role decisions and conclusion onto the entry
    pub fn record_analysis(&mut self, analysis: &AnalysisOutcome) {
        self.analysis_turns = analysis.turns.len();
        self.failed_role = analysis.failed_role;
        self.analysis_trail = analysis
            .turns
            .iter()
            .map(|turn| RoleSummary {
                role: turn.role,
                decision: turn.decision,
                failed: turn.failed,
            })
            .collect();
        self.analysis_conclusion = analysis
            .turns
            .iter()
            .rev()
            .find(|turn| !turn.failed)
            .map(|turn| shorten(turn.output.trim(), MAX_CONCLUSION_CHARS));
    }

    /// Held entry for a message that could not be processed
    pub fn held_with_error(position: usize, message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(position, message_id, Disposition::HeldForReview)
        }
    }
}

const MAX_CONCLUSION_CHARS: usize = 400;

fn shorten(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// One analysis role's verdict as shown in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role: AnalysisRole,
    pub decision: Option<Disposition>,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub approved: usize,
    pub held: usize,
    pub rejected: usize,
    pub corrected: usize,
    pub errors: usize,
    pub clean: usize,
    pub review: usize,
    pub fraudulent: usize,
    /// Share of messages approved without manual intervention, in percent
    pub stp_rate: f64,
}

impl ReportSummary {
    pub fn from_entries(entries: &[ReportEntry]) -> Self {
        let mut summary = ReportSummary {
            total: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            match entry.disposition {
                Disposition::Approved => summary.approved += 1,
                Disposition::HeldForReview => summary.held += 1,
                Disposition::Rejected => summary.rejected += 1,
            }
            match entry.classification {
                Some(RiskClassification::Clean) => summary.clean += 1,
                Some(RiskClassification::Review) => summary.review += 1,
                Some(RiskClassification::Fraudulent) => summary.fraudulent += 1,
                None => {}
            }
            if entry.was_corrected {
                summary.corrected += 1;
            }
            if entry.error.is_some() {
                summary.errors += 1;
            }
        }

        if summary.total > 0 {
            summary.stp_rate =
                ((summary.approved as f64 / summary.total as f64) * 10_000.0).round() / 100.0;
        }

        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub batch_id: Uuid,
    pub generated_at: DateTime<Utc>,
    /// Set when the batch was cancelled before every stage finished
    pub partial: bool,
    pub entries: Vec<ReportEntry>,
    pub summary: ReportSummary,
    /// SHA-256 over the serialized entries, hex encoded
    pub digest: String,
}

impl FinalReport {
    pub fn new(batch_id: Uuid, entries: Vec<ReportEntry>, partial: bool) -> Self {
        let summary = ReportSummary::from_entries(&entries);
        let digest = compute_entries_digest(&entries);
        Self {
            batch_id,
            generated_at: Utc::now(),
            partial,
            entries,
            summary,
            digest,
        }
    }

    /// Check the entries still match the digest they were sealed with
    pub fn verify_digest(&self) -> bool {
        !self.digest.is_empty() && compute_entries_digest(&self.entries) == self.digest
    }

    pub fn entry(&self, message_id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.message_id == message_id)
    }
}

/// Compute the SHA-256 of the entries.
/// JSON is streamed straight into the hasher.
pub fn compute_entries_digest(entries: &[ReportEntry]) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), entries).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
