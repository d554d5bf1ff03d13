//! Scenario harness for frankenrcu.
//!
//! This crate provides:
//! - Built-in end-to-end scenarios that drive an engine and check its state
//! - Structured JSONL logs of scenario runs, including the engine's trace
//! - Log validation for the JSONL schema

#![forbid(unsafe_code)]

pub mod runner;
pub mod scenario;
pub mod structured_log;

pub use runner::{RunSummary, layout_lines, run_logged};
pub use scenario::{ScenarioError, ScenarioOptions, ScenarioReport, run_all, run_scenario};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
