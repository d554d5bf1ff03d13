//! Grace-period lifecycle and hierarchical quiescent-state reporting.

use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::MutexGuard;

use crate::data::{CpuState, RcuData};
use crate::node::NodeState;
use crate::stats::Counters;
use crate::state::RcuState;
use crate::task::QsRequest;
use crate::trace::{TraceEvent, TraceKind};
use crate::NodeIdx;

/// Result of handing a CPU's quiescent state to its leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QsReport {
    /// The state was recorded for a grace period that is no longer running.
    Stale,
    /// The CPU's bit was already clear.
    AlreadyReported,
    Reported,
}

// ---------------------------------------------------------------------------
// Start and end
// ---------------------------------------------------------------------------

impl RcuState {
    pub(crate) fn request_gp(&self, target: u64) {
        self.gp_requested.fetch_max(target, Ordering::SeqCst);
    }

    /// Ask for the grace period after the current one and start it if none
    /// is running. Returns true if this call started it.
    pub fn start_grace_period(&self) -> bool {
        self.request_gp(self.gpnum() + 1);
        self.start_gp()
    }

    /// Start the next grace period if none is in progress and one has been
    /// requested.
    pub(crate) fn start_gp(&self) -> bool {
        let _onoff = self.onofflock.lock();
        let gp = self.gpnum.load(Ordering::SeqCst);
        if self.completed.load(Ordering::SeqCst) != gp
            || self.gp_requested.load(Ordering::SeqCst) <= gp
        {
            return false;
        }
        let new = gp + 1;
        self.gpnum.store(new, Ordering::SeqCst);

        // Breadth-first, so a parent expects its children before any child
        // can report.
        for (idx, node) in self.nodes.iter().enumerate() {
            let mut st = node.lock();
            self.ops.check_blocked_tasks(idx, &st);
            assert!(
                st.qsmask == 0,
                "node {idx}: qsmask {:#x} still set when grace period {new} starts",
                st.qsmask
            );
            st.qsmask = st.qsmaskinit;
            st.gpnum = new;
        }
        self.trace(TraceEvent::new(TraceKind::GpStart, new, "grace period started"));
        true
    }

    /// The root has declared `gp` complete: publish it everywhere, wake the
    /// waiters and start the next one if anyone asked.
    fn finish_gp(&self, gp: u64) {
        {
            let _onoff = self.onofflock.lock();
            for node in self.nodes.iter() {
                node.lock().completed = gp;
            }
            self.completed.store(gp, Ordering::SeqCst);
        }
        self.trace(TraceEvent::new(TraceKind::GpEnd, gp, "grace period completed"));
        {
            let _w = self.gp_wait.lock();
            self.gp_wq.notify_all();
        }
        self.start_gp();
    }

    // -----------------------------------------------------------------------
    // Reporting up the tree
    // -----------------------------------------------------------------------

    /// Clear `mask` in node `idx` and, each time a node empties with no
    /// blocked readers, report it to its parent. One node lock is held at a
    /// time.
    pub(crate) fn report_qs_rnp<'a>(
        &'a self,
        mut mask: u64,
        mut idx: NodeIdx,
        mut st: MutexGuard<'a, NodeState>,
    ) {
        loop {
            if st.qsmask & mask == 0 {
                // Our contribution was already counted.
                return;
            }
            st.qsmask &= !mask;
            if st.qsmask != 0 || self.ops.preempted_readers(&st) {
                return;
            }
            let node = &self.nodes[idx];
            let Some(parent) = node.parent else {
                break;
            };
            if self.trace_enabled() {
                self.trace(
                    TraceEvent::new(TraceKind::NodeReport, st.gpnum, "node quiescent").node(idx),
                );
            }
            mask = node.grpmask;
            drop(st);
            idx = parent;
            st = self.nodes[idx].lock();
        }
        self.report_qs_rsp(st);
    }

    /// A blocked reader left node `idx`. If nothing else holds the node up,
    /// report it to its parent (or end the grace period at the root).
    /// A no-op when the node's contribution was already cleared.
    pub(crate) fn report_unblock_qs_rnp<'a>(
        &'a self,
        idx: NodeIdx,
        st: MutexGuard<'a, NodeState>,
    ) {
        if st.qsmask != 0 || self.ops.preempted_readers(&st) {
            return;
        }
        let node = &self.nodes[idx];
        match node.parent {
            None => self.report_qs_rsp(st),
            Some(parent) => {
                let mask = node.grpmask;
                drop(st);
                let pst = self.nodes[parent].lock();
                self.report_qs_rnp(mask, parent, pst);
            }
        }
    }

    /// Root has no outstanding children or readers.
    fn report_qs_rsp<'a>(&'a self, mut root: MutexGuard<'a, NodeState>) {
        if !root.gp_in_progress() {
            return;
        }
        let gp = root.gpnum;
        root.completed = gp;
        drop(root);
        self.finish_gp(gp);
    }

    /// Hand the CPU's quiescent state for `gp` to its leaf.
    fn report_cpu_qs(&self, rdp: &RcuData, gp: u64, detail: &'static str) -> QsReport {
        let leaf = self.nodes[rdp.mynode].lock();
        if leaf.gpnum != gp || !leaf.gp_in_progress() {
            return QsReport::Stale;
        }
        if leaf.qsmask & rdp.grpmask == 0 {
            return QsReport::AlreadyReported;
        }
        if self.trace_enabled() {
            self.trace(
                TraceEvent::new(TraceKind::CpuQs, gp, detail)
                    .cpu(rdp.cpu)
                    .node(rdp.mynode),
            );
        }
        self.report_qs_rnp(rdp.grpmask, rdp.mynode, leaf);
        QsReport::Reported
    }

    /// Report and update the CPU record to match. Caller holds no locks.
    pub(crate) fn report_qs_rdp(&self, rdp: &RcuData, gp: u64, detail: &'static str) -> QsReport {
        let outcome = self.report_cpu_qs(rdp, gp, detail);
        let mut cs = rdp.lock();
        match outcome {
            QsReport::Stale => {
                if cs.passed_quiesc_gp == gp {
                    cs.passed_quiesc = false;
                }
            }
            QsReport::AlreadyReported | QsReport::Reported => {
                if cs.gpnum == gp {
                    cs.qs_pending = false;
                }
            }
        }
        outcome
    }

    /// Catch the CPU up with its leaf's grace-period number. A quiescent
    /// state recorded before the CPU noticed the new grace period is
    /// discarded.
    pub(crate) fn note_gp_changes(&self, rdp: &RcuData, cs: &mut CpuState) {
        let leaf = self.nodes[rdp.mynode].lock();
        if cs.gpnum != leaf.gpnum {
            cs.gpnum = leaf.gpnum;
            cs.passed_quiesc = false;
            cs.qs_pending = leaf.gp_in_progress() && leaf.qsmask & rdp.grpmask != 0;
        }
    }

    /// Report the quiescent state this CPU has recorded, if its leaf is
    /// still waiting for one.
    pub(crate) fn check_quiescent_state(&self, rdp: &RcuData) {
        let gp = {
            let mut cs = rdp.lock();
            self.note_gp_changes(rdp, &mut cs);
            if !(cs.qs_pending && cs.passed_quiesc) {
                return;
            }
            cs.passed_quiesc_gp
        };
        self.report_qs_rdp(rdp, gp, "quiescent state");
    }

    // -----------------------------------------------------------------------
    // Forcing and waiting
    // -----------------------------------------------------------------------

    /// Report on behalf of every CPU that is provably quiescent now (offline,
    /// idle, or running a task outside any section), and ask the readers
    /// still inside a section to report when they leave.
    pub fn force_quiescent_state(&self) {
        let gp = self.gpnum();
        if self.batches_completed() == gp {
            return;
        }
        Counters::bump(&self.counters.force_qs);
        for rdp in self.cpus.iter() {
            let quiescent = {
                let mut cs = rdp.lock();
                let owed = {
                    let leaf = self.nodes[rdp.mynode].lock();
                    leaf.gpnum == gp && leaf.gp_in_progress() && leaf.qsmask & rdp.grpmask != 0
                };
                if !owed {
                    continue;
                }
                self.note_gp_changes(rdp, &mut cs);
                if !rdp.online() || (cs.passed_quiesc && cs.passed_quiesc_gp == gp) {
                    true
                } else {
                    match cs.curr.as_ref() {
                        None => true,
                        Some(task) => task.request_qs() == QsRequest::Quiescent,
                    }
                }
            };
            if quiescent {
                self.report_qs_rdp(rdp, gp, "forced quiescent state");
            }
        }
    }

    /// Wait for a full grace period. Every reader that was inside a section
    /// when this was called has left it by the time it returns.
    ///
    /// Before the scheduler is active there is only one task, so this
    /// returns immediately.
    pub fn synchronize(&self) {
        if !self.scheduler_active() {
            return;
        }
        // A grace period already running may have started before the
        // caller's update; only the next one is guaranteed to cover it.
        let target = self.gpnum() + 1;
        self.request_gp(target);
        self.wait_for_gp(target);
    }

    pub(crate) fn wait_for_gp(&self, target: u64) {
        let started = Instant::now();
        loop {
            if self.batches_completed() >= target {
                return;
            }
            self.start_gp();
            self.force_quiescent_state();
            let mut guard = self.gp_wait.lock();
            if self.batches_completed() >= target {
                return;
            }
            self.gp_wq.wait_for(&mut guard, self.config.fqs_interval);
            drop(guard);
            self.check_cpu_stall(started);
        }
    }

    /// Record a stall once per grace period when a waiter has been blocked
    /// longer than the stall timeout.
    fn check_cpu_stall(&self, started: Instant) {
        if started.elapsed() < self.config.stall_timeout {
            return;
        }
        let gp = self.gpnum();
        if self.batches_completed() == gp {
            return;
        }
        let prev = self.stall_warned_gp.load(Ordering::SeqCst);
        if prev >= gp
            || self
                .stall_warned_gp
                .compare_exchange(prev, gp, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }
        Counters::bump(&self.counters.stalls);
        self.trace(TraceEvent::new(TraceKind::Stall, gp, "grace period stalled"));
    }
}

#[cfg(test)]
mod tests {
    use crate::{RcuConfig, RcuState};

    fn engine(cpus: usize, fanout: usize) -> RcuState {
        RcuState::new(RcuConfig::with_cpus(cpus, fanout).trace_capacity(256)).unwrap()
    }

    #[test]
    fn start_requires_request_and_idle() {
        let rsp = engine(4, 2);
        assert!(!rsp.start_gp(), "nobody asked");
        assert!(rsp.start_grace_period());
        assert_eq!(rsp.gpnum(), 1);
        assert!(rsp.gp_in_progress());
        assert!(!rsp.start_grace_period(), "one already running");
        let stats = rsp.stats();
        assert_eq!(stats.nodes[0].qsmask, 0b11);
        assert_eq!(stats.nodes[1].qsmask, 0b11);
        assert_eq!(stats.nodes[2].gpnum, 1);
    }

    #[test]
    fn idle_cpus_are_forced_through() {
        let rsp = engine(4, 2);
        rsp.start_grace_period();
        rsp.force_quiescent_state();
        assert_eq!(rsp.batches_completed(), 1);
        assert!(!rsp.gp_in_progress());
        let stats = rsp.stats();
        assert!(stats.nodes.iter().all(|n| n.qsmask == 0 && n.completed == 1));
    }

    #[test]
    fn report_is_idempotent() {
        let rsp = engine(4, 2);
        rsp.start_grace_period();
        let rdp = &rsp.cpus[1];
        {
            let mut cs = rdp.lock();
            rsp.note_gp_changes(rdp, &mut cs);
            cs.preempt_qs();
        }
        assert_eq!(rsp.report_qs_rdp(rdp, 1, "test"), super::QsReport::Reported);
        assert_eq!(
            rsp.report_qs_rdp(rdp, 1, "test"),
            super::QsReport::AlreadyReported
        );
        assert_eq!(rsp.stats().nodes[1].qsmask, 0b01);
        assert_eq!(rsp.stats().nodes[0].qsmask, 0b11);
    }

    #[test]
    fn report_climbs_three_levels() {
        let rsp = engine(8, 2);
        assert_eq!(rsp.levels(), 3);
        rsp.start_grace_period();
        for cpu in 0..8 {
            let rdp = &rsp.cpus[cpu];
            {
                let mut cs = rdp.lock();
                rsp.note_gp_changes(rdp, &mut cs);
                cs.preempt_qs();
            }
            assert_eq!(rsp.report_qs_rdp(rdp, 1, "test"), super::QsReport::Reported);
            if cpu < 7 {
                assert!(rsp.gp_in_progress(), "cpu {cpu} ended it early");
            }
        }
        assert_eq!(rsp.batches_completed(), 1);
        let stats = rsp.stats();
        assert!(stats.nodes.iter().all(|n| n.qsmask == 0 && n.completed == 1));
    }

    #[test]
    fn stale_quiescent_state_is_discarded() {
        let rsp = engine(2, 2);
        let rdp = &rsp.cpus[0];
        rdp.lock().preempt_qs();
        rsp.start_grace_period();
        // The state above was recorded for grace period 0.
        assert_eq!(rsp.report_qs_rdp(rdp, 0, "test"), super::QsReport::Stale);
        assert!(!rdp.lock().passed_quiesc);
        assert_eq!(rsp.stats().nodes[0].qsmask, 0b11);
    }

    #[test]
    fn back_to_back_request_starts_next() {
        let rsp = engine(2, 2);
        rsp.start_grace_period();
        rsp.request_gp(2);
        rsp.force_quiescent_state();
        assert_eq!(rsp.batches_completed(), 1);
        assert_eq!(rsp.gpnum(), 2, "finishing 1 started the requested 2");
        rsp.force_quiescent_state();
        assert_eq!(rsp.batches_completed(), 2);
    }

    #[test]
    fn synchronize_is_noop_before_scheduler() {
        let rsp = engine(2, 2);
        rsp.synchronize();
        assert_eq!(rsp.gpnum(), 0);
        rsp.set_scheduler_active();
        rsp.synchronize();
        assert_eq!(rsp.batches_completed(), 1);
    }
}
