//! SWIFT Message Pipeline Orchestrator
//!
//! Processes batches of interbank transfer messages:
//! - Validates each message and asks a text generator to correct failures
//! - Scores risk with independent detectors run in parallel
//! - Sends flagged messages through a sequential analysis chain
//! - Plans and dispatches settlement tasks for the clean subset
//! - Reports one disposition per message, with a tamper-evident digest
//!
//! FLOW:
//! INTAKE → VALIDATE/CORRECT → SCORE → ANALYZE? → PLAN → DISPATCH → REPORT

pub mod analysis;
pub mod api;
pub mod capability;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod execution;
pub mod gemini;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod risk;
pub mod validation;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use pipeline::Pipeline;
pub use report::FinalReport;
