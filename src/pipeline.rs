//! Batch pipeline
//!
//! VALIDATE/CORRECT → SCORE → (flagged) ANALYZE → (clean + approved) DISPATCH
//! → REPORT
//!
//! Each stage consumes the previous stage's owned collection. Whatever
//! happens to a message along the way, the report has exactly one entry for
//! it at its batch position.

use crate::analysis::{AnalysisChain, AnalysisOutcome, AnalyzedMessage};
use crate::capability::TextGenerator;
use crate::concurrency::UnitOutcome;
use crate::config::PipelineConfig;
use crate::execution::LlmTaskWorker;
use crate::models::{Disposition, MessageRecord};
use crate::orchestrator::TaskOrchestrator;
use crate::planner::{CleanMessage, LlmTaskPlanner};
use crate::report::{FinalReport, ReportEntry};
use crate::risk::{RiskAggregator, RiskClassification, ScoredMessage};
use crate::validation::{CorrectionAgent, Evaluator, ValidationCorrectionLoop, ValidationOutcome, ValidationStatus};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Pipeline {
    config: PipelineConfig,
    validation: Arc<ValidationCorrectionLoop>,
    risk: Arc<RiskAggregator>,
    analysis: Arc<AnalysisChain>,
    orchestrator: TaskOrchestrator,
}

impl Pipeline {
    /// Standard wiring: every stage backed by `generator`
    pub fn new(config: PipelineConfig, generator: Arc<dyn TextGenerator>) -> Self {
        let corrector = CorrectionAgent::new(
            generator.clone(),
            config.capability.clone(),
            config.validation.accepted_currencies.clone(),
        );
        let validation = ValidationCorrectionLoop::new(
            Evaluator::with_default_rules(config.validation.clone()),
            corrector,
        );
        let risk = RiskAggregator::with_default_detectors(config.risk.clone());
        let analysis = AnalysisChain::new(
            generator.clone(),
            config.analysis.clone(),
            config.capability.clone(),
        );
        let orchestrator = TaskOrchestrator::new(
            Arc::new(LlmTaskPlanner::new(
                generator.clone(),
                config.capability.clone(),
                config.tasks.clone(),
            )),
            Arc::new(LlmTaskWorker::new(generator)),
            config.tasks.clone(),
        );

        Self::with_stages(config, validation, risk, analysis, orchestrator)
    }

    pub fn with_stages(
        config: PipelineConfig,
        validation: ValidationCorrectionLoop,
        risk: RiskAggregator,
        analysis: AnalysisChain,
        orchestrator: TaskOrchestrator,
    ) -> Self {
        Self {
            config,
            validation: Arc::new(validation),
            risk: Arc::new(risk),
            analysis: Arc::new(analysis),
            orchestrator,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one batch of raw message objects to a final report
    pub async fn run(&self, batch: Vec<Value>, cancel: &CancellationToken) -> FinalReport {
        let batch_id = Uuid::new_v4();
        let total = batch.len();
        let mut slots: Vec<Option<ReportEntry>> = vec![None; total];

        info!(%batch_id, total, "Batch received");

        // Intake
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(total);
        let mut records: Vec<MessageRecord> = Vec::with_capacity(total);
        let mut seen: HashSet<String> = HashSet::with_capacity(total);

        for (position, raw) in batch.iter().enumerate() {
            let fallback_id = format!("MSG-{:04}", position + 1);
            match MessageRecord::from_raw(raw, &fallback_id) {
                Ok(record) if !seen.insert(record.message_id.clone()) => {
                    warn!(message_id = %record.message_id, position, "Duplicate message id");
                    slots[position] = Some(ReportEntry::held_with_error(
                        position,
                        record.message_id,
                        "duplicate message_id in batch",
                    ));
                }
                Ok(record) => {
                    positions.insert(record.message_id.clone(), position);
                    records.push(record);
                }
                Err(e) => {
                    let message_id = raw
                        .get("message_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or(fallback_id.as_str())
                        .to_string();
                    warn!(%message_id, position, error = %e, "Message rejected at intake");
                    slots[position] = Some(ReportEntry::held_with_error(position, message_id, e.to_string()));
                }
            }
        }

        // Stage 1
        let ids: Vec<String> = records.iter().map(|r| r.message_id.clone()).collect();
        let validated = self
            .validation
            .validate_batch(records, self.config.validation.max_concurrent_messages, cancel)
            .await;
        let validated: Vec<ValidationOutcome> = collect_stage(ids, validated, "validation", &positions, &mut slots);

        // Stage 2
        let ids: Vec<String> = validated.iter().map(|v| v.message.message_id.clone()).collect();
        let scored = self.risk.score_batch(validated, cancel).await;
        let scored: Vec<ScoredMessage> = collect_stage(ids, scored, "risk scoring", &positions, &mut slots);

        let mut context: HashMap<String, ScoredMessage> = HashMap::with_capacity(scored.len());
        let mut clean: Vec<CleanMessage> = Vec::new();
        let mut flagged: Vec<ScoredMessage> = Vec::new();

        for item in scored {
            let id = item.message().message_id.clone();
            let is_clean = item.profile.classification() == RiskClassification::Clean;

            if is_clean && !item.validation.is_valid() {
                let mut entry = base_entry(positions[&id], &item);
                entry.disposition = Disposition::HeldForReview;
                entry.notes.push("held: message failed validation".to_string());
                let position = entry.position;
                slots[position] = Some(entry);
            } else if is_clean {
                clean.push(clean_message(&item, Vec::new()));
            } else {
                flagged.push(item.clone());
            }
            context.insert(id, item);
        }

        // Stage 3
        let ids: Vec<String> = flagged.iter().map(|s| s.message().message_id.clone()).collect();
        let analyzed = self.analysis.analyze_batch(flagged, cancel).await;
        let analyzed: Vec<AnalyzedMessage> = collect_stage(ids, analyzed, "analysis", &positions, &mut slots);

        let mut analyses: HashMap<String, AnalysisOutcome> = HashMap::new();
        for item in analyzed {
            let id = item.analysis.message_id.clone();

            if item.analysis.disposition == Disposition::Approved {
                let mut notes = item.analysis.annotations.clone();
                notes.push("approved by analysis chain".to_string());
                clean.push(clean_message(&item.scored, notes));
                analyses.insert(id, item.analysis);
                continue;
            }

            let mut entry = base_entry(positions[&id], &item.scored);
            entry.disposition = item.analysis.disposition;
            entry.record_analysis(&item.analysis);
            if item.analysis.cancelled {
                entry.error = Some("not processed: batch cancelled during analysis".to_string());
            }
            entry.notes.extend(item.analysis.annotations);
            let position = entry.position;
            slots[position] = Some(entry);
        }

        // Stage 4
        let dispatched = self.orchestrator.process_clean(clean, cancel).await;
        for processed in dispatched.entries {
            let (Some(&position), Some(scored)) = (
                positions.get(&processed.message_id),
                context.get(&processed.message_id),
            ) else {
                warn!(message_id = %processed.message_id, "Report entry for unknown message ignored");
                continue;
            };

            let mut entry = base_entry(position, scored);
            entry.disposition = processed.disposition;
            entry.task_id = processed.task_id;
            if let Some(analysis) = analyses.get(&processed.message_id) {
                entry.record_analysis(analysis);
            }
            entry.notes.extend(processed.notes);
            entry.error = processed.error;
            slots[position] = Some(entry);
        }

        let partial = cancel.is_cancelled() || dispatched.partial;
        let entries: Vec<ReportEntry> = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                slot.unwrap_or_else(|| {
                    let message_id = batch[position]
                        .get("message_id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("MSG-{:04}", position + 1));
                    ReportEntry::held_with_error(position, message_id, "not processed: batch cancelled")
                })
            })
            .collect();

        let report = FinalReport::new(batch_id, entries, partial);

        info!(
            %batch_id,
            total = report.summary.total,
            approved = report.summary.approved,
            held = report.summary.held,
            rejected = report.summary.rejected,
            stp_rate = report.summary.stp_rate,
            partial,
            "Batch complete"
        );

        report
    }
}

/// Keep completed units; cancelled or panicked ones get a held entry
fn collect_stage<R>(
    ids: Vec<String>,
    outcomes: Vec<UnitOutcome<R>>,
    stage: &str,
    positions: &HashMap<String, usize>,
    slots: &mut [Option<ReportEntry>],
) -> Vec<R> {
    let mut kept = Vec::with_capacity(outcomes.len());

    for (id, outcome) in ids.into_iter().zip(outcomes) {
        let position = positions[&id];
        match outcome {
            UnitOutcome::Completed(value) => kept.push(value),
            UnitOutcome::Cancelled => {
                slots[position] = Some(ReportEntry::held_with_error(
                    position,
                    id,
                    format!("not processed: batch cancelled during {}", stage),
                ));
            }
            UnitOutcome::Panicked(reason) => {
                warn!(message_id = %id, stage, "Message processing panicked");
                slots[position] = Some(ReportEntry::held_with_error(
                    position,
                    id,
                    format!("internal error during {}: {}", stage, reason),
                ));
            }
        }
    }

    kept
}

fn base_entry(position: usize, scored: &ScoredMessage) -> ReportEntry {
    let mut entry = ReportEntry::new(position, scored.message().message_id.clone(), Disposition::HeldForReview);
    entry.classification = Some(scored.profile.classification());
    entry.risk_score = Some(scored.profile.score());
    entry.was_corrected = scored.validation.was_corrected;
    entry.validation_iterations = scored.validation.iterations_used;
    entry.risk_reasons = scored.profile.reasons();
    if let ValidationStatus::Uncorrected { violations } = &scored.validation.status {
        entry.validation_errors = violations.iter().map(|v| v.to_string()).collect();
    }
    entry
}

fn clean_message(scored: &ScoredMessage, annotations: Vec<String>) -> CleanMessage {
    CleanMessage {
        message: scored.message().clone(),
        classification: scored.profile.classification(),
        risk_score: scored.profile.score(),
        was_corrected: scored.validation.was_corrected,
        annotations,
    }
}
