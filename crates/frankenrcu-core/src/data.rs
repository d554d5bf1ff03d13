//! Per-CPU engine record.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::cblist::SegCbList;
use crate::task::TaskRef;
use crate::{CpuId, NodeIdx};

/// Counters for the reasons `pending` answered the way it did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PendingCounters {
    pub n_rcu_pending: u64,
    pub n_rp_qs_pending: u64,
    pub n_rp_report_qs: u64,
    pub n_rp_cb_ready: u64,
    pub n_rp_cpu_needs_gp: u64,
    pub n_rp_gp_completed: u64,
    pub n_rp_gp_started: u64,
    pub n_rp_need_nothing: u64,
}

/// Lock-protected part of a CPU record.
#[derive(Debug, Default)]
pub(crate) struct CpuState {
    /// Task currently running here.
    pub curr: Option<TaskRef>,
    /// Latest grace period this CPU has noticed at its leaf.
    pub gpnum: u64,
    /// Latest completion this CPU has processed callbacks for.
    pub completed: u64,
    /// A quiescent state was recorded since `gpnum` was noticed.
    pub passed_quiesc: bool,
    /// Grace period `passed_quiesc` counts toward.
    pub passed_quiesc_gp: u64,
    /// The leaf still expects a report from this CPU.
    pub qs_pending: bool,
    pub cblist: SegCbList,
    pub n_cbs_invoked: u64,
    pub pending: PendingCounters,
}

impl CpuState {
    /// Record a quiescent state for the grace period this CPU knows about.
    pub fn preempt_qs(&mut self) {
        self.passed_quiesc = true;
        self.passed_quiesc_gp = self.gpnum;
    }
}

#[derive(Debug)]
pub(crate) struct RcuData {
    pub cpu: CpuId,
    /// Leaf this CPU reports to.
    pub mynode: NodeIdx,
    /// This CPU's bit in `mynode`'s masks.
    pub grpmask: u64,
    online: AtomicBool,
    state: Mutex<CpuState>,
}

impl RcuData {
    pub fn new(cpu: CpuId, mynode: NodeIdx, grpmask: u64) -> Self {
        Self {
            cpu,
            mynode,
            grpmask,
            online: AtomicBool::new(true),
            state: Mutex::new(CpuState::default()),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, CpuState> {
        self.state.lock()
    }

    #[inline]
    pub fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Caller holds the hotplug lock and this CPU's lock.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preempt_qs_remembers_observed_grace_period() {
        let rdp = RcuData::new(3, 1, 0b10);
        let mut cs = rdp.lock();
        cs.gpnum = 7;
        cs.preempt_qs();
        assert!(cs.passed_quiesc);
        assert_eq!(cs.passed_quiesc_gp, 7);
        drop(cs);
        assert!(rdp.online());
        rdp.set_online(false);
        assert!(!rdp.online());
    }
}
