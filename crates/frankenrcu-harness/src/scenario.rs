//! Built-in end-to-end scenarios.
//!
//! Each scenario builds a fresh engine, drives it through a fixed sequence
//! of reader, writer and hotplug events, and checks the engine's observable
//! state after each step. A failed check aborts the scenario with a
//! [`ScenarioError::Check`] describing what differed.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use frankenrcu_core::{
    ConfigError, Flavor, RcuConfig, RcuError, RcuState, RcuStats, TaskRef, TraceEvent,
};
use serde::Serialize;
use thiserror::Error;

use crate::structured_log::Outcome;

const TRACE_CAPACITY: usize = 16 * 1024;
const EXP_CALLERS: usize = 6;
/// Upper bound on any single wait for the engine to reach a state.
const WAIT_LIMIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("{scenario}: {what}: expected {expected}, got {actual}")]
    Check {
        scenario: &'static str,
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("{scenario}: timed out waiting for {what}")]
    Timeout {
        scenario: &'static str,
        what: &'static str,
    },
    #[error("engine configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("engine operation failed: {0}")]
    Rcu(#[from] RcuError),
    #[error("unknown scenario {0:?}")]
    UnknownScenario(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ScenarioOptions {
    pub flavor: Flavor,
    pub cpus: usize,
    pub fanout: usize,
    /// Writer iterations for the stress and callback scenarios.
    pub rounds: u64,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            flavor: Flavor::default(),
            cpus: 4,
            fanout: 2,
            rounds: 40,
        }
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub flavor: Flavor,
    pub outcome: Outcome,
    /// Checks that passed.
    pub checks: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RcuStats>,
    #[serde(skip)]
    pub trace: Vec<TraceEvent>,
}

struct Checker {
    scenario: &'static str,
    passed: usize,
}

impl Checker {
    fn eq<T: PartialEq + Debug>(
        &mut self,
        what: &'static str,
        expected: T,
        actual: T,
    ) -> Result<(), ScenarioError> {
        if expected != actual {
            return Err(ScenarioError::Check {
                scenario: self.scenario,
                what,
                expected: format!("{expected:?}"),
                actual: format!("{actual:?}"),
            });
        }
        self.passed += 1;
        Ok(())
    }

    fn ensure(&mut self, what: &'static str, cond: bool) -> Result<(), ScenarioError> {
        self.eq(what, true, cond)
    }

    /// Spin until `cond` holds or [`WAIT_LIMIT`] passes. Returns whether it held.
    fn wait_until(&self, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while !cond() {
            if start.elapsed() > WAIT_LIMIT {
                return false;
            }
            thread::yield_now();
        }
        true
    }
}

enum Ran {
    Done(RcuState),
    Skipped(&'static str),
}

type ScenarioFn = fn(&ScenarioOptions, &mut Checker) -> Result<Ran, ScenarioError>;

struct Scenario {
    name: &'static str,
    summary: &'static str,
    /// Scenario only makes sense when readers can be preempted.
    preempt_only: bool,
    run: ScenarioFn,
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "preempted-reader",
        summary: "a reader switched out mid-section holds the grace period until it unlocks",
        preempt_only: true,
        run: preempted_reader,
    },
    Scenario {
        name: "hotplug-migration",
        summary: "blocked readers move to the root when their leaf loses its last CPU",
        preempt_only: true,
        run: hotplug_migration,
    },
    Scenario {
        name: "expedited-shared",
        summary: "concurrent expedited callers share one forced grace period",
        preempt_only: false,
        run: expedited_shared,
    },
    Scenario {
        name: "reader-stress",
        summary: "threads run read-side sections while a writer reclaims old versions",
        preempt_only: false,
        run: reader_stress,
    },
    Scenario {
        name: "callbacks-barrier",
        summary: "queued callbacks all run by the time the barrier returns",
        preempt_only: false,
        run: callbacks_barrier,
    },
];

/// `(name, summary)` of every built-in scenario.
pub fn list() -> impl Iterator<Item = (&'static str, &'static str)> {
    SCENARIOS.iter().map(|s| (s.name, s.summary))
}

/// Run one scenario by name.
pub fn run_scenario(name: &str, opts: &ScenarioOptions) -> Result<ScenarioReport, ScenarioError> {
    let scenario = SCENARIOS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ScenarioError::UnknownScenario(name.to_string()))?;
    run_one(scenario, opts)
}

/// Run every scenario, continuing past failures.
pub fn run_all(opts: &ScenarioOptions) -> Vec<(&'static str, Result<ScenarioReport, ScenarioError>)> {
    SCENARIOS
        .iter()
        .map(|s| (s.name, run_one(s, opts)))
        .collect()
}

fn run_one(scenario: &Scenario, opts: &ScenarioOptions) -> Result<ScenarioReport, ScenarioError> {
    let start = Instant::now();
    let mut report = ScenarioReport {
        scenario: scenario.name,
        flavor: opts.flavor,
        outcome: Outcome::Skip,
        checks: 0,
        duration_ms: 0,
        skip_reason: None,
        stats: None,
        trace: Vec::new(),
    };
    if scenario.preempt_only && !opts.flavor.allows_preempted_readers() {
        report.skip_reason = Some("needs preemptible readers");
        return Ok(report);
    }

    let mut ck = Checker {
        scenario: scenario.name,
        passed: 0,
    };
    match (scenario.run)(opts, &mut ck)? {
        Ran::Done(rsp) => {
            report.outcome = Outcome::Pass;
            report.stats = Some(rsp.stats());
            report.trace = rsp.drain_trace();
        }
        Ran::Skipped(reason) => report.skip_reason = Some(reason),
    }
    report.checks = ck.passed;
    report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine(opts: &ScenarioOptions) -> Result<RcuState, ConfigError> {
    RcuState::new(
        RcuConfig::with_cpus(opts.cpus, opts.fanout)
            .flavor(opts.flavor)
            .scheduler_active(true)
            .trace_capacity(TRACE_CAPACITY)
            .fqs_interval(Duration::from_micros(200)),
    )
}

fn leaf_of(rsp: &RcuState, cpu: usize) -> Result<usize, RcuError> {
    rsp.leaf_of(cpu).ok_or(RcuError::NoSuchCpu {
        cpu,
        num_cpus: rsp.num_cpus(),
    })
}

/// Run a task on `cpu`, enter a section and switch it out.
fn preempt_in_section(rsp: &RcuState, cpu: usize) -> TaskRef {
    let t = rsp.spawn_task();
    rsp.switch_to(cpu, Some(t.clone()));
    rsp.read_lock(&t);
    rsp.switch_to(cpu, None);
    t
}

/// One tick plus core processing on each CPU.
fn quiesce(rsp: &RcuState, cpus: impl IntoIterator<Item = usize>) {
    for cpu in cpus {
        rsp.check_callbacks(cpu);
        rsp.process_callbacks(cpu);
    }
}

fn exp_blocked(rsp: &RcuState) -> usize {
    rsp.stats()
        .nodes
        .iter()
        .map(|n| n.blocked[2] + n.blocked[3])
        .sum()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

fn preempted_reader(opts: &ScenarioOptions, ck: &mut Checker) -> Result<Ran, ScenarioError> {
    let rsp = engine(opts)?;
    let cpu = opts.cpus - 1;
    let leaf = leaf_of(&rsp, cpu)?;

    let t = preempt_in_section(&rsp, cpu);
    ck.eq("reader parked on its leaf", Some(leaf), t.blocked_node())?;
    ck.ensure("grace period started", rsp.start_grace_period())?;
    quiesce(&rsp, 0..opts.cpus);
    ck.eq("grace periods completed with reader inside", 0, rsp.batches_completed())?;
    ck.eq(
        "stall report blames the reader",
        vec![(leaf, t.id())],
        rsp.stall_report().tasks,
    )?;

    rsp.switch_to(cpu, Some(t.clone()));
    rsp.read_unlock(&t);
    ck.eq("grace periods completed after unlock", 1, rsp.batches_completed())?;
    ck.eq("blocked tasks", 0, rsp.stats().blocked_tasks())?;
    Ok(Ran::Done(rsp))
}

fn hotplug_migration(opts: &ScenarioOptions, ck: &mut Checker) -> Result<Ran, ScenarioError> {
    let rsp = engine(opts)?;
    let leaf = leaf_of(&rsp, opts.cpus - 1)?;
    if leaf == 0 {
        return Ok(Ran::Skipped("single-node tree has no leaf to empty"));
    }
    let leaf_cpus = rsp.stats().nodes[leaf].cpus.clone();

    let readers: Vec<TaskRef> = leaf_cpus
        .clone()
        .map(|cpu| preempt_in_section(&rsp, cpu))
        .collect();
    ck.ensure("grace period started", rsp.start_grace_period())?;
    for cpu in leaf_cpus.clone() {
        rsp.cpu_offline(cpu)?;
    }

    let stats = rsp.stats();
    ck.eq("tasks migrated", readers.len() as u64, stats.tasks_migrated)?;
    ck.eq(
        "readers on the root",
        readers.len(),
        stats.nodes[0].blocked.iter().sum::<usize>(),
    )?;
    ck.eq("emptied leaf mask", 0, stats.nodes[leaf].qsmaskinit)?;

    quiesce(&rsp, (0..opts.cpus).filter(|c| !leaf_cpus.contains(c)));
    ck.eq("grace periods completed with readers inside", 0, rsp.batches_completed())?;
    for t in &readers {
        rsp.read_unlock(t);
    }
    ck.eq("grace periods completed after unlock", 1, rsp.batches_completed())?;

    for cpu in leaf_cpus {
        rsp.cpu_online(cpu)?;
    }
    rsp.synchronize();
    ck.eq("grace periods completed after rejoin", 2, rsp.batches_completed())?;
    ck.eq("online cpus", opts.cpus, rsp.online_cpus())?;
    Ok(Ran::Done(rsp))
}

fn expedited_shared(opts: &ScenarioOptions, ck: &mut Checker) -> Result<Ran, ScenarioError> {
    let rsp = engine(opts)?;
    let preempt = opts.flavor.allows_preempted_readers();
    let t = rsp.spawn_task();
    rsp.switch_to(0, Some(t.clone()));
    rsp.read_lock(&t);

    let (parked, panicked) = thread::scope(|s| {
        let callers: Vec<_> = (0..EXP_CALLERS)
            .map(|_| s.spawn(|| rsp.synchronize_expedited()))
            .collect();
        // The reader is only forced onto a list when it can be preempted.
        let parked = !preempt || ck.wait_until(|| exp_blocked(&rsp) > 0);
        thread::sleep(Duration::from_millis(2));
        rsp.read_unlock(&t);
        let panicked = callers
            .into_iter()
            .map(thread::ScopedJoinHandle::join)
            .filter(Result::is_err)
            .count();
        (parked, panicked)
    });
    if !parked {
        return Err(ScenarioError::Timeout {
            scenario: ck.scenario,
            what: "running reader to be forced onto a blocked list",
        });
    }
    ck.eq("panicked callers", 0, panicked)?;

    let stats = rsp.stats();
    if preempt {
        ck.eq(
            "callers that forced, piggybacked or fell back",
            EXP_CALLERS as u64,
            stats.exp_forced + stats.exp_done_by_others + stats.exp_fallbacks,
        )?;
        ck.eq(
            "expedited completions match forced runs",
            stats.exp_forced,
            stats.expedited_completed,
        )?;
        ck.ensure("at least one expedited grace period", stats.expedited_completed >= 1)?;
    } else {
        ck.eq(
            "expedited completions",
            EXP_CALLERS as u64,
            stats.expedited_completed,
        )?;
        ck.eq("forced expedited runs", 0, stats.exp_forced)?;
    }
    ck.eq("blocked tasks", 0, stats.blocked_tasks())?;
    Ok(Ran::Done(rsp))
}

/// Published version and the highest version already reclaimed.
struct Witness {
    current: AtomicU64,
    freed_upto: AtomicU64,
    violations: AtomicU64,
}

impl Witness {
    fn check(&self, held: u64) {
        if self.freed_upto.load(Ordering::SeqCst) >= held {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn stress_cpu(rsp: &RcuState, w: &Witness, stop: &AtomicBool, cpu: usize, preempt: bool) {
    let task = rsp.spawn_task();
    rsp.switch_to(cpu, Some(task.clone()));
    let mut i = 0u64;
    while !stop.load(Ordering::SeqCst) {
        i += 1;
        rsp.read_lock(&task);
        let held = w.current.load(Ordering::SeqCst);
        w.check(held);
        if preempt && i % 7 == 0 {
            rsp.note_context_switch(cpu);
        }
        if i % 5 == 0 {
            let _inner = rsp.read(&task);
            rsp.check_callbacks(cpu);
            thread::yield_now();
        }
        w.check(held);
        rsp.read_unlock(&task);
        rsp.check_callbacks(cpu);
        rsp.process_callbacks(cpu);
    }
    rsp.switch_to(cpu, None);
}

fn reader_stress(opts: &ScenarioOptions, ck: &mut Checker) -> Result<Ran, ScenarioError> {
    let rsp = engine(opts)?;
    let preempt = opts.flavor.allows_preempted_readers();
    let w = Witness {
        current: AtomicU64::new(1),
        freed_upto: AtomicU64::new(0),
        violations: AtomicU64::new(0),
    };
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for cpu in 0..opts.cpus {
            let (rsp, w, stop) = (&rsp, &w, &stop);
            s.spawn(move || stress_cpu(rsp, w, stop, cpu, preempt));
        }
        for round in 0..opts.rounds {
            let old = w.current.fetch_add(1, Ordering::SeqCst);
            if round % 4 == 3 {
                rsp.synchronize_expedited();
            } else {
                rsp.synchronize();
            }
            w.freed_upto.store(old, Ordering::SeqCst);
        }
        stop.store(true, Ordering::SeqCst);
    });

    ck.eq(
        "versions freed under a reader",
        0,
        w.violations.load(Ordering::SeqCst),
    )?;
    let stats = rsp.stats();
    let normal = (0..opts.rounds).filter(|r| r % 4 != 3).count() as u64;
    ck.ensure(
        "one grace period per synchronize",
        stats.completed >= normal,
    )?;
    ck.eq("blocked tasks", 0, stats.blocked_tasks())?;
    ck.eq("engine warnings", 0, stats.warnings)?;
    Ok(Ran::Done(rsp))
}

fn callbacks_barrier(opts: &ScenarioOptions, ck: &mut Checker) -> Result<Ran, ScenarioError> {
    let rsp = engine(opts)?;
    let ran = Arc::new(AtomicU64::new(0));
    for i in 0..opts.rounds {
        let ran = Arc::clone(&ran);
        let cpu = (i % opts.cpus as u64) as usize;
        rsp.call_rcu(cpu, move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    // Orphan the last CPU's queue so the barrier also covers adopted callbacks.
    if opts.cpus > 1 {
        rsp.cpu_offline(opts.cpus - 1)?;
    }
    rsp.barrier();

    ck.eq("callbacks run", opts.rounds, ran.load(Ordering::SeqCst))?;
    ck.ensure(
        "no cpu left holding callbacks",
        (0..opts.cpus).all(|cpu| !rsp.needs_cpu(cpu)),
    )?;
    let stats = rsp.stats();
    ck.eq(
        "callbacks invoked, barrier markers included",
        opts.rounds + stats.online_cpus as u64,
        stats.cpus.iter().map(|c| c.n_cbs_invoked).sum::<u64>(),
    )?;
    Ok(Ran::Done(rsp))
}
