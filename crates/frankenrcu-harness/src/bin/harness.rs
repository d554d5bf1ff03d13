//! CLI entrypoint for the frankenrcu scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use frankenrcu_core::{Flavor, RcuConfig, RcuState, flavor_from_env};
use frankenrcu_harness::structured_log::{self, LogEmitter};
use frankenrcu_harness::{Outcome, ScenarioOptions, layout_lines, run_logged, scenario};

/// Scenario tooling for frankenrcu.
#[derive(Debug, Parser)]
#[command(name = "frankenrcu-harness")]
#[command(about = "End-to-end scenarios for the frankenrcu grace-period engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List built-in scenarios.
    List,
    /// Run one scenario, or all of them.
    Run {
        /// Scenario name, or "all".
        #[arg(long, default_value = "all")]
        scenario: String,
        /// `preempt` or `classic` (defaults to FRANKENRCU_FLAVOR).
        #[arg(long)]
        flavor: Option<String>,
        #[arg(long, default_value_t = 4)]
        cpus: usize,
        #[arg(long, default_value_t = 2)]
        fanout: usize,
        /// Writer iterations for stress and callback scenarios.
        #[arg(long, default_value_t = 40)]
        rounds: u64,
        /// JSONL log output path (if omitted, logs go to stdout).
        #[arg(long)]
        log: Option<PathBuf>,
        /// JSON report output path.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Run identifier used as the trace id prefix.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Print the node layout of the tree configured by the FRANKENRCU_*
    /// environment, with optional overrides.
    Layout {
        #[arg(long)]
        cpus: Option<usize>,
        /// Fan-out for interior and leaf nodes.
        #[arg(long)]
        fanout: Option<usize>,
    },
    /// Validate a JSONL log against the schema.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for (name, summary) in scenario::list() {
                println!("{name:<20} {summary}");
            }
        }
        Command::Run {
            scenario: which,
            flavor,
            cpus,
            fanout,
            rounds,
            log,
            report,
            run_id,
        } => {
            let opts = ScenarioOptions {
                flavor: flavor
                    .as_deref()
                    .map_or_else(flavor_from_env, Flavor::from_str_loose),
                cpus,
                fanout,
                rounds,
            };
            let names: Vec<&str> = if which == "all" {
                scenario::list().map(|(name, _)| name).collect()
            } else {
                vec![which.as_str()]
            };
            eprintln!(
                "Running {} scenario(s): flavor={} cpus={cpus} fanout={fanout}",
                names.len(),
                opts.flavor
            );

            let summary = match &log {
                Some(path) => {
                    let mut emitter = LogEmitter::to_file(path, &run_id)?;
                    run_logged(&names, &opts, &mut emitter)?
                }
                None => {
                    let mut emitter = LogEmitter::new(std::io::stdout().lock(), &run_id);
                    run_logged(&names, &opts, &mut emitter)?
                }
            };

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&summary.reports)?)?;
                eprintln!("Wrote report to {}", path.display());
            }
            eprintln!(
                "pass={} skip={} fail={}",
                summary.count(Outcome::Pass),
                summary.count(Outcome::Skip),
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("FAIL {failure}");
            }
            if !summary.passed() {
                return Err(format!("{} scenario(s) failed", summary.failures.len()).into());
            }
        }
        Command::Layout { cpus, fanout } => {
            let mut config = RcuConfig::from_env()?;
            if let Some(cpus) = cpus {
                config.num_cpus = cpus;
            }
            if let Some(fanout) = fanout {
                config.fanout = fanout;
                config.leaf_fanout = fanout;
            }
            let (num_cpus, fanout, leaf_fanout) =
                (config.num_cpus, config.fanout, config.leaf_fanout);
            let rsp = RcuState::new(config)?;
            println!(
                "{num_cpus} cpus, fanout {fanout}, leaf fanout {leaf_fanout}: {} nodes in {} levels",
                rsp.num_nodes(),
                rsp.levels()
            );
            for line in layout_lines(&rsp) {
                println!("{line}");
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = structured_log::validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!("{} error(s) in {lines} line(s)", errors.len()).into());
            }
            println!("{}: {lines} valid line(s)", log.display());
        }
    }

    Ok(())
}
