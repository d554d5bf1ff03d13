//! The engine object.
//!
//! One [`RcuState`] is one flavor's grace-period state machine: the node
//! arena, the per-CPU records and the global counters. Every operation takes
//! it by reference; there is no process-wide singleton.
//!
//! Lock order, outermost first: hotplug, expedited mutex, one CPU record,
//! on/off lock, nodes (child before parent, a leaf before the root), then
//! the grace-period waiter mutex and the trace ring. The expedited waiter
//! mutex sits above the root: it is never taken with a node held.
//! Quiescent-state reports climbing the tree never hold a CPU lock, and
//! release each node before taking its parent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::config::{Flavor, RcuConfig};
use crate::data::RcuData;
use crate::error::{ConfigError, RcuError};
use crate::flavor::{self, RcuFlavor};
use crate::node::{RcuNode, build_tree};
use crate::stats::{Counters, CpuStats, NodeStats, RcuStats, StallReport};
use crate::task::{RcuTask, TaskRef};
use crate::trace::{TraceEvent, TraceKind, TraceRing};
use crate::{CpuId, NodeIdx};

/// Grace-period engine for one RCU flavor.
pub struct RcuState {
    pub(crate) config: RcuConfig,
    pub(crate) ops: &'static dyn RcuFlavor,
    pub(crate) nodes: Box<[RcuNode]>,
    pub(crate) cpus: Box<[RcuData]>,
    levels: usize,

    /// Latest grace period started.
    pub(crate) gpnum: AtomicU64,
    /// Latest grace period whose completion has been published.
    pub(crate) completed: AtomicU64,
    /// Highest grace period anyone is waiting for.
    pub(crate) gp_requested: AtomicU64,
    pub(crate) online_cpus: AtomicUsize,
    scheduler_active: AtomicBool,
    next_task_id: AtomicU64,

    /// Serializes grace-period start and cleanup with tree reshaping.
    pub(crate) onofflock: Mutex<()>,
    pub(crate) hotplug: Mutex<()>,
    pub(crate) gp_wait: Mutex<()>,
    pub(crate) gp_wq: Condvar,
    pub(crate) stall_warned_gp: AtomicU64,

    pub(crate) exp_mutex: Mutex<()>,
    pub(crate) exp_count: AtomicU64,
    pub(crate) exp_wait: Mutex<()>,
    pub(crate) exp_wq: Condvar,

    pub(crate) counters: Counters,
    trace: TraceRing,
}

impl RcuState {
    /// Build the tree with every CPU online and no grace period running.
    pub fn new(config: RcuConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tree = build_tree(config.num_cpus, config.fanout, config.leaf_fanout);
        let cpus: Box<[RcuData]> = tree
            .cpu_leaf
            .iter()
            .enumerate()
            .map(|(cpu, &(leaf, mask))| RcuData::new(cpu, leaf, mask))
            .collect();
        Ok(Self {
            ops: flavor::ops(config.flavor),
            nodes: tree.nodes,
            levels: tree.levels,
            online_cpus: AtomicUsize::new(cpus.len()),
            cpus,
            gpnum: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            gp_requested: AtomicU64::new(0),
            scheduler_active: AtomicBool::new(config.scheduler_active),
            next_task_id: AtomicU64::new(1),
            onofflock: Mutex::new(()),
            hotplug: Mutex::new(()),
            gp_wait: Mutex::new(()),
            gp_wq: Condvar::new(),
            stall_warned_gp: AtomicU64::new(0),
            exp_mutex: Mutex::new(()),
            exp_count: AtomicU64::new(0),
            exp_wait: Mutex::new(()),
            exp_wq: Condvar::new(),
            counters: Counters::default(),
            trace: TraceRing::new(config.trace_capacity),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RcuConfig {
        &self.config
    }

    #[must_use]
    pub fn flavor(&self) -> Flavor {
        self.ops.flavor()
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub fn online_cpus(&self) -> usize {
        self.online_cpus.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.cpus.get(cpu).is_some_and(RcuData::online)
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Leaf node a CPU reports to.
    #[must_use]
    pub fn leaf_of(&self, cpu: CpuId) -> Option<NodeIdx> {
        self.cpus.get(cpu).map(|rdp| rdp.mynode)
    }

    /// Leave the single-task boot phase; `synchronize` starts waiting.
    pub fn set_scheduler_active(&self) {
        self.scheduler_active.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn scheduler_active(&self) -> bool {
        self.scheduler_active.load(Ordering::SeqCst)
    }

    /// Create a task. It runs nowhere until passed to `switch_to`.
    pub fn spawn_task(&self) -> TaskRef {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(RcuTask::new(id))
    }

    /// Latest grace period started.
    #[must_use]
    pub fn gpnum(&self) -> u64 {
        self.gpnum.load(Ordering::SeqCst)
    }

    /// Number of completed grace periods.
    #[must_use]
    pub fn batches_completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of completed expedited grace periods.
    #[must_use]
    pub fn expedited_completed(&self) -> u64 {
        self.exp_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn gp_in_progress(&self) -> bool {
        self.gpnum() != self.batches_completed()
    }

    pub(crate) fn cpu_data(&self, cpu: CpuId) -> Result<&RcuData, RcuError> {
        self.cpus.get(cpu).ok_or(RcuError::NoSuchCpu {
            cpu,
            num_cpus: self.cpus.len(),
        })
    }

    /// Record for a CPU named by a scheduler hook. An unknown CPU there is a
    /// caller bug.
    pub(crate) fn rdp(&self, cpu: CpuId) -> &RcuData {
        match self.cpus.get(cpu) {
            Some(rdp) => rdp,
            None => panic!("cpu {cpu} out of range ({} CPUs)", self.cpus.len()),
        }
    }

    #[inline]
    pub(crate) fn trace(&self, event: TraceEvent) {
        if self.trace.enabled() {
            self.trace.record(event);
        }
    }

    #[inline]
    pub(crate) fn trace_enabled(&self) -> bool {
        self.trace.enabled()
    }

    /// A soft consistency check failed. Counted and traced, never fatal.
    pub(crate) fn warn(&self, detail: &'static str, cpu: Option<CpuId>, node: Option<NodeIdx>) {
        Counters::bump(&self.counters.warnings);
        let mut ev = TraceEvent::new(TraceKind::Warning, self.gpnum(), detail);
        ev.cpu = cpu;
        ev.node = node;
        self.trace(ev);
    }

    /// Retained trace events, oldest first.
    #[must_use]
    pub fn trace_snapshot(&self) -> Vec<TraceEvent> {
        self.trace.snapshot()
    }

    pub fn drain_trace(&self) -> Vec<TraceEvent> {
        self.trace.drain()
    }

    #[must_use]
    pub fn trace_dropped(&self) -> u64 {
        self.trace.dropped()
    }

    /// Point-in-time copy of every counter, CPU and node.
    ///
    /// Locks are taken one at a time, so the snapshot is not atomic across
    /// records.
    #[must_use]
    pub fn stats(&self) -> RcuStats {
        let cpus = self
            .cpus
            .iter()
            .map(|rdp| {
                let cs = rdp.lock();
                CpuStats {
                    cpu: rdp.cpu,
                    online: rdp.online(),
                    leaf: rdp.mynode,
                    current_task: cs.curr.as_ref().map(|t| t.id()),
                    gpnum: cs.gpnum,
                    completed: cs.completed,
                    passed_quiesc: cs.passed_quiesc,
                    qs_pending: cs.qs_pending,
                    qlen: cs.cblist.len(),
                    n_cbs_invoked: cs.n_cbs_invoked,
                    pending: cs.pending,
                }
            })
            .collect();
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                let st = node.lock();
                NodeStats {
                    node: idx,
                    level: node.level,
                    parent: node.parent,
                    cpus: node.cpus.clone(),
                    qsmask: st.qsmask,
                    qsmaskinit: st.qsmaskinit,
                    expmask: st.expmask,
                    gpnum: st.gpnum,
                    completed: st.completed,
                    blocked: st.blocked_counts(),
                }
            })
            .collect();
        let mut stats = RcuStats {
            flavor: self.flavor(),
            gpnum: self.gpnum(),
            completed: self.batches_completed(),
            expedited_completed: self.expedited_completed(),
            force_qs_passes: 0,
            warnings: 0,
            stalls: 0,
            exp_forced: 0,
            exp_done_by_others: 0,
            exp_fallbacks: 0,
            tasks_migrated: 0,
            online_cpus: self.online_cpus(),
            cpus,
            nodes,
        };
        stats.fill_counters(&self.counters);
        stats
    }

    /// CPUs and tasks the current grace period is still waiting on.
    #[must_use]
    pub fn stall_report(&self) -> StallReport {
        let mut report = StallReport {
            gpnum: self.gpnum(),
            completed: self.batches_completed(),
            ..StallReport::default()
        };
        if report.gpnum == report.completed {
            return report;
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            let st = node.lock();
            if !st.gp_in_progress() {
                continue;
            }
            if node.level + 1 == self.levels {
                report.cpus.extend(
                    node.cpus
                        .clone()
                        .filter(|&cpu| st.qsmask & self.cpus[cpu].grpmask != 0),
                );
            }
            let phase = (st.gpnum & 1) as usize;
            for list in [phase, phase + crate::node::EXP_OFFSET] {
                report
                    .tasks
                    .extend(st.blocked[list].iter().map(|t| (idx, t.id())));
            }
        }
        report
    }
}

impl std::fmt::Debug for RcuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcuState")
            .field("flavor", &self.flavor())
            .field("cpus", &self.cpus.len())
            .field("nodes", &self.nodes.len())
            .field("gpnum", &self.gpnum())
            .field("completed", &self.batches_completed())
            .field("expedited", &self.expedited_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_invalid_config() {
        assert_eq!(
            RcuState::new(RcuConfig::with_cpus(0, 2)).unwrap_err(),
            ConfigError::NoCpus
        );
    }

    #[test]
    fn fresh_state_is_idle() {
        let rsp = RcuState::new(RcuConfig::with_cpus(4, 2)).unwrap();
        assert_eq!(rsp.num_nodes(), 3);
        assert_eq!(rsp.levels(), 2);
        assert_eq!(rsp.online_cpus(), 4);
        assert_eq!(rsp.gpnum(), 0);
        assert_eq!(rsp.batches_completed(), 0);
        assert!(!rsp.gp_in_progress());
        assert!(!rsp.scheduler_active());
        assert_eq!(rsp.leaf_of(3), Some(2));
        assert_eq!(rsp.leaf_of(4), None);
        assert!(rsp.stall_report().is_clear());
    }

    #[test]
    fn stats_reflect_tree_shape() {
        let rsp = RcuState::new(RcuConfig::with_cpus(4, 2)).unwrap();
        let stats = rsp.stats();
        assert_eq!(stats.cpus.len(), 4);
        assert_eq!(stats.nodes.len(), 3);
        assert_eq!(stats.nodes[0].qsmaskinit, 0b11);
        assert_eq!(stats.nodes[1].cpus, 0..2);
        assert_eq!(stats.blocked_tasks(), 0);
        assert_eq!(stats.warnings, 0);
    }

    #[test]
    fn task_ids_are_unique() {
        let rsp = RcuState::new(RcuConfig::default()).unwrap();
        let a = rsp.spawn_task();
        let b = rsp.spawn_task();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.cpu(), None);
    }

    #[test]
    fn warnings_are_counted_and_traced() {
        let rsp = RcuState::new(RcuConfig::default().trace_capacity(16)).unwrap();
        rsp.warn("test warning", Some(1), None);
        assert_eq!(rsp.stats().warnings, 1);
        let events = rsp.drain_trace();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TraceKind::Warning);
        assert_eq!(events[0].cpu, Some(1));
    }
}
