//! Snapshots of engine state for tests, the harness and stall reports.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Flavor;
use crate::data::PendingCounters;
use crate::{CpuId, NodeIdx};

/// Engine-wide event counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub force_qs: AtomicU64,
    pub warnings: AtomicU64,
    pub stalls: AtomicU64,
    pub exp_forced: AtomicU64,
    pub exp_done_by_others: AtomicU64,
    pub exp_fallbacks: AtomicU64,
    pub tasks_migrated: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CpuStats {
    pub cpu: CpuId,
    pub online: bool,
    pub leaf: NodeIdx,
    pub current_task: Option<u64>,
    pub gpnum: u64,
    pub completed: u64,
    pub passed_quiesc: bool,
    pub qs_pending: bool,
    pub qlen: usize,
    pub n_cbs_invoked: u64,
    pub pending: PendingCounters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NodeStats {
    pub node: NodeIdx,
    pub level: usize,
    pub parent: Option<NodeIdx>,
    pub cpus: Range<CpuId>,
    pub qsmask: u64,
    pub qsmaskinit: u64,
    pub expmask: u64,
    pub gpnum: u64,
    pub completed: u64,
    /// Lengths of the four blocked lists: normal phase 0/1, expedited 0/1.
    pub blocked: [usize; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RcuStats {
    pub flavor: Flavor,
    pub gpnum: u64,
    pub completed: u64,
    pub expedited_completed: u64,
    pub force_qs_passes: u64,
    pub warnings: u64,
    pub stalls: u64,
    pub exp_forced: u64,
    pub exp_done_by_others: u64,
    pub exp_fallbacks: u64,
    pub tasks_migrated: u64,
    pub online_cpus: usize,
    pub cpus: Vec<CpuStats>,
    pub nodes: Vec<NodeStats>,
}

impl RcuStats {
    pub(crate) fn fill_counters(&mut self, c: &Counters) {
        self.force_qs_passes = Counters::get(&c.force_qs);
        self.warnings = Counters::get(&c.warnings);
        self.stalls = Counters::get(&c.stalls);
        self.exp_forced = Counters::get(&c.exp_forced);
        self.exp_done_by_others = Counters::get(&c.exp_done_by_others);
        self.exp_fallbacks = Counters::get(&c.exp_fallbacks);
        self.tasks_migrated = Counters::get(&c.tasks_migrated);
    }

    /// Total tasks on blocked lists anywhere in the tree.
    #[must_use]
    pub fn blocked_tasks(&self) -> usize {
        self.nodes.iter().map(|n| n.blocked.iter().sum::<usize>()).sum()
    }
}

/// Who is holding up the current grace period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StallReport {
    pub gpnum: u64,
    pub completed: u64,
    /// CPUs whose bit is still set in their leaf.
    pub cpus: Vec<CpuId>,
    /// `(node, task id)` for tasks blocking the current grace period.
    pub tasks: Vec<(NodeIdx, u64)>,
}

impl StallReport {
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.cpus.is_empty() && self.tasks.is_empty()
    }
}

impl std::fmt::Display for StallReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "grace period {} stalled on cpus {{", self.gpnum)?;
        for (i, cpu) in self.cpus.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{cpu}")?;
        }
        f.write_str("} tasks {")?;
        for (i, (node, task)) in self.tasks.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{task}@{node}")?;
        }
        write!(f, "}} (completed {})", self.completed)
    }
}
