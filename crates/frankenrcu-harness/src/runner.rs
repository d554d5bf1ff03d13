//! Runs scenarios and writes their progress to a structured log.

use std::io::Write;
use std::ops::Range;

use frankenrcu_core::{CpuId, NodeStats, RcuState};

use crate::scenario::{self, ScenarioOptions, ScenarioReport};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// Reports of the scenarios that ran, and messages for those that failed.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<ScenarioReport>,
    pub failures: Vec<String>,
}

impl RunSummary {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn count(&self, outcome: Outcome) -> usize {
        self.reports.iter().filter(|r| r.outcome == outcome).count()
    }
}

/// Run `names` in order, logging a start record, the engine trace and an
/// end record for each.
pub fn run_logged<W: Write>(
    names: &[&str],
    opts: &ScenarioOptions,
    log: &mut LogEmitter<W>,
) -> std::io::Result<RunSummary> {
    let flavor = opts.flavor.as_str();
    let mut summary = RunSummary::default();
    for &name in names {
        log.set_scenario(name);
        log.emit_entry(
            LogEntry::new("", LogLevel::Info, "scenario_start")
                .with_flavor(flavor)
                .with_details(serde_json::json!({
                    "cpus": opts.cpus,
                    "fanout": opts.fanout,
                    "rounds": opts.rounds,
                })),
        )?;

        match scenario::run_scenario(name, opts) {
            Ok(report) => {
                log.emit_trace(&report.trace, flavor)?;
                log.emit_entry(
                    LogEntry::new("", LogLevel::Info, "scenario_end")
                        .with_flavor(flavor)
                        .with_outcome(report.outcome)
                        .with_duration_ms(report.duration_ms)
                        .with_details(serde_json::json!({
                            "checks": report.checks,
                            "skip_reason": report.skip_reason,
                            "trace_events": report.trace.len(),
                        })),
                )?;
                summary.reports.push(report);
            }
            Err(err) => {
                log.emit_entry(
                    LogEntry::new("", LogLevel::Error, "scenario_end")
                        .with_flavor(flavor)
                        .with_outcome(Outcome::Fail)
                        .with_details(serde_json::json!({ "error": err.to_string() })),
                )?;
                summary.failures.push(err.to_string());
            }
        }
    }
    log.flush()?;
    Ok(summary)
}

/// One line per node of `rsp`'s tree, root first.
#[must_use]
pub fn layout_lines(rsp: &RcuState) -> Vec<String> {
    rsp.stats().nodes.iter().map(layout_line).collect()
}

fn layout_line(node: &NodeStats) -> String {
    let parent = node
        .parent
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    format!(
        "level {} node {:>4} parent {:>4} cpus {}",
        node.level,
        node.node,
        parent,
        cpu_span(&node.cpus)
    )
}

fn cpu_span(cpus: &Range<CpuId>) -> String {
    match cpus.clone().last() {
        Some(last) => format!("{}..{last}", cpus.start),
        None => "none".to_string(),
    }
}
