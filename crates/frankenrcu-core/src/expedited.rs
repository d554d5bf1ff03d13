//! Expedited grace periods.
//!
//! An expedited caller forces every running reader onto the blocked lists,
//! moves all blocked readers onto the expedited lists and waits for those
//! lists (and the per-node `expmask` bits) to drain. Callers are serialized
//! by one mutex; a caller that finds a full expedited grace period has
//! completed since it arrived returns without doing any work.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::node::ROOT;
use crate::state::RcuState;
use crate::stats::Counters;
use crate::trace::{TraceEvent, TraceKind};
use crate::NodeIdx;

/// Sleep before expedited attempt `trycount + 1`: `unit * trycount * online`,
/// saturating at `Duration::MAX`.
fn exp_backoff(unit: Duration, trycount: u32, online: usize) -> Duration {
    let online = u32::try_from(online).unwrap_or(u32::MAX);
    unit.saturating_mul(trycount.saturating_mul(online))
}

impl RcuState {
    /// Low-latency grace period. Costs every online CPU a context switch.
    pub fn synchronize_expedited(&self) {
        self.ops.synchronize_expedited(self);
    }

    pub(crate) fn synchronize_expedited_tree(&self) {
        // One expedited grace period may already be running and have missed
        // our update; we need a whole one after it.
        let snap = self.exp_count.load(Ordering::SeqCst) + 1;
        self.expedited_from_snapshot(snap);
    }

    fn exp_done_since(&self, snap: u64) -> bool {
        self.exp_count.load(Ordering::SeqCst) > snap
    }

    fn exp_done_by_others(&self, snap: u64) {
        Counters::bump(&self.counters.exp_done_by_others);
        self.trace(TraceEvent::new(
            TraceKind::ExpDoneByOthers,
            snap,
            "expedited grace period completed by another caller",
        ));
    }

    pub(crate) fn expedited_from_snapshot(&self, snap: u64) {
        let mut trycount: u32 = 0;
        let _exp = loop {
            if let Some(guard) = self.exp_mutex.try_lock() {
                break guard;
            }
            trycount += 1;
            if trycount > self.config.exp_retry_limit {
                Counters::bump(&self.counters.exp_fallbacks);
                self.trace(TraceEvent::new(
                    TraceKind::ExpFallback,
                    snap,
                    "expedited mutex contended, falling back",
                ));
                self.synchronize();
                return;
            }
            std::thread::sleep(exp_backoff(
                self.config.exp_backoff_unit,
                trycount,
                self.online_cpus(),
            ));
            if self.exp_done_since(snap) {
                self.exp_done_by_others(snap);
                return;
            }
        };
        if self.exp_done_since(snap) {
            self.exp_done_by_others(snap);
            return;
        }

        self.trace(TraceEvent::new(TraceKind::ExpStart, snap, "expedited grace period"));
        Counters::bump(&self.counters.exp_forced);
        self.force_readers_blocked();

        {
            let _onoff = self.onofflock.lock();
            let leaf_level = self.levels() - 1;
            for node in self.nodes.iter().filter(|n| n.level < leaf_level) {
                let mut st = node.lock();
                st.expmask = st.qsmaskinit;
            }
            let leaves = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.level == leaf_level)
                .map(|(idx, _)| idx);
            for idx in leaves {
                self.exp_init(idx);
            }
            // Hotplug parks readers on the root.
            if self.nodes.len() > 1 {
                self.exp_init(ROOT);
            }
        }

        self.wait_exp_done();
        let n = self.exp_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.trace(TraceEvent::new(TraceKind::ExpEnd, n, "expedited grace period done"));
    }

    /// Turn every reader blocked on `idx` into one the expedited grace
    /// period waits for; report at once if there are none.
    fn exp_init(&self, idx: NodeIdx) {
        let must_wait = {
            let mut st = self.nodes[idx].lock();
            st.splice_for_expedited();
            st.exp_readers()
        };
        if !must_wait {
            self.report_exp_rnp(idx);
        }
    }

    /// Propagate expedited completion of `idx` upward as far as it goes, and
    /// wake the expedited waiter when the root is done.
    pub(crate) fn report_exp_rnp(&self, mut idx: NodeIdx) {
        let mut st = self.nodes[idx].lock();
        loop {
            if !st.exp_done() {
                return;
            }
            let node = &self.nodes[idx];
            let Some(parent) = node.parent else {
                drop(st);
                let _w = self.exp_wait.lock();
                self.exp_wq.notify_all();
                return;
            };
            let mask = node.grpmask;
            drop(st);
            idx = parent;
            st = self.nodes[idx].lock();
            st.expmask &= !mask;
        }
    }

    fn wait_exp_done(&self) {
        loop {
            let mut w = self.exp_wait.lock();
            if self.nodes[ROOT].lock().exp_done() {
                return;
            }
            self.exp_wq.wait_for(&mut w, self.config.fqs_interval);
        }
    }
}
