//! CPU hotplug.
//!
//! Taking a CPU offline removes it from every future grace period, reports
//! on its behalf for the current one and hands its callbacks to the lowest
//! online CPU. When a leaf loses its last CPU, the readers blocked there move
//! to the root so the grace periods they hold up keep waiting for them.

use std::sync::atomic::Ordering;

use crate::error::RcuError;
use crate::flavor::OfflineTasks;
use crate::state::RcuState;
use crate::trace::{TraceEvent, TraceKind};
use crate::{CpuId, NodeIdx};

impl RcuState {
    /// Take `cpu` out of the tree. The task running there is switched out
    /// first; under the classic flavor it must not be inside a read-side
    /// section.
    pub fn cpu_offline(&self, cpu: CpuId) -> Result<(), RcuError> {
        let rdp = self.cpu_data(cpu)?;
        let _hp = self.hotplug.lock();
        if !rdp.online() {
            return Err(RcuError::AlreadyOffline(cpu));
        }
        if self.online_cpus() == 1 {
            return Err(RcuError::LastCpu(cpu));
        }

        let orphans = {
            let mut cs = rdp.lock();
            if !self.flavor().allows_preempted_readers()
                && cs.curr.as_ref().is_some_and(|t| t.nesting() > 0)
            {
                return Err(RcuError::ReaderInSection(cpu));
            }
            // The outgoing task is switched out like any other.
            self.ops.note_context_switch(self, rdp, &mut cs);
            if let Some(prev) = cs.curr.take() {
                prev.set_cpu(None);
            }
            rdp.set_online(false);
            self.online_cpus.fetch_sub(1, Ordering::SeqCst);
            cs.qs_pending = false;
            cs.passed_quiesc = false;
            cs.cblist.take_all()
        };

        let mask = rdp.grpmask;
        let leaf_idx = rdp.mynode;
        let onoff = self.onofflock.lock();
        let mut leaf = self.nodes[leaf_idx].lock();
        leaf.qsmaskinit &= !mask;
        let mut moved = OfflineTasks::default();
        if leaf.qsmaskinit == 0 {
            moved = self.ops.offline_tasks(self, leaf_idx, &mut leaf);
            self.clear_qsmaskinit_upward(leaf_idx);
        }
        let gpnum = leaf.gpnum;
        drop(onoff);

        if leaf.qsmask & mask != 0 {
            self.report_qs_rnp(mask, leaf_idx, leaf);
        } else if moved.normal {
            self.report_unblock_qs_rnp(leaf_idx, leaf);
        } else {
            drop(leaf);
        }
        if moved.expedited {
            self.report_exp_rnp(leaf_idx);
        }

        if !orphans.is_empty()
            && let Some(heir) = self.cpus.iter().find(|r| r.online())
        {
            heir.lock().cblist.adopt(orphans);
        }

        self.trace(
            TraceEvent::new(TraceKind::CpuOffline, gpnum, "cpu offline")
                .cpu(cpu)
                .node(leaf_idx),
        );
        Ok(())
    }

    /// Bring `cpu` back. It takes part from the next grace period on.
    pub fn cpu_online(&self, cpu: CpuId) -> Result<(), RcuError> {
        let rdp = self.cpu_data(cpu)?;
        let _hp = self.hotplug.lock();
        if rdp.online() {
            return Err(RcuError::AlreadyOnline(cpu));
        }

        let mut cs = rdp.lock();
        let gpnum = {
            let _onoff = self.onofflock.lock();
            let mut idx = rdp.mynode;
            let mut mask = rdp.grpmask;
            loop {
                let node = &self.nodes[idx];
                let was_empty = {
                    let mut st = node.lock();
                    let was_empty = st.qsmaskinit == 0;
                    st.qsmaskinit |= mask;
                    was_empty
                };
                match node.parent {
                    Some(parent) if was_empty => {
                        mask = node.grpmask;
                        idx = parent;
                    }
                    _ => break,
                }
            }
            let leaf = self.nodes[rdp.mynode].lock();
            cs.gpnum = leaf.gpnum;
            cs.completed = leaf.completed;
            leaf.gpnum
        };
        cs.passed_quiesc = false;
        cs.qs_pending = false;
        rdp.set_online(true);
        self.online_cpus.fetch_add(1, Ordering::SeqCst);
        drop(cs);

        self.trace(
            TraceEvent::new(TraceKind::CpuOnline, gpnum, "cpu online")
                .cpu(cpu)
                .node(rdp.mynode),
        );
        Ok(())
    }

    /// Node `idx` has no online CPUs left: drop its bit from each ancestor,
    /// continuing while the ancestor empties too. Caller holds the on/off
    /// lock and `idx`'s lock.
    fn clear_qsmaskinit_upward(&self, idx: NodeIdx) {
        let mut child = &self.nodes[idx];
        while let Some(parent) = child.parent {
            let emptied = {
                let mut st = self.nodes[parent].lock();
                st.qsmaskinit &= !child.grpmask;
                st.qsmaskinit == 0
            };
            if !emptied {
                return;
            }
            child = &self.nodes[parent];
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{RcuConfig, RcuError, RcuState, TraceKind};

    fn engine() -> RcuState {
        RcuState::new(RcuConfig::with_cpus(4, 2).trace_capacity(64)).unwrap()
    }

    #[test]
    fn offline_rejects_bad_requests() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        assert_eq!(
            rsp.cpu_offline(7),
            Err(RcuError::NoSuchCpu { cpu: 7, num_cpus: 2 })
        );
        rsp.cpu_offline(1).unwrap();
        assert_eq!(rsp.cpu_offline(1), Err(RcuError::AlreadyOffline(1)));
        assert_eq!(rsp.cpu_offline(0), Err(RcuError::LastCpu(0)));
        assert_eq!(rsp.cpu_online(0), Err(RcuError::AlreadyOnline(0)));
        assert_eq!(rsp.online_cpus(), 1);
    }

    #[test]
    fn emptied_leaf_leaves_parent_mask() {
        let rsp = engine();
        rsp.cpu_offline(2).unwrap();
        assert_eq!(rsp.stats().nodes[0].qsmaskinit, 0b11);
        rsp.cpu_offline(3).unwrap();
        let stats = rsp.stats();
        assert_eq!(stats.nodes[2].qsmaskinit, 0);
        assert_eq!(stats.nodes[0].qsmaskinit, 0b01);

        rsp.start_grace_period();
        assert_eq!(rsp.stats().nodes[0].qsmask, 0b01, "empty leaf not waited on");

        rsp.cpu_online(3).unwrap();
        let stats = rsp.stats();
        assert_eq!(stats.nodes[2].qsmaskinit, 0b10);
        assert_eq!(stats.nodes[0].qsmaskinit, 0b11);
        assert_eq!(stats.cpus[3].gpnum, 1);
        assert!(!stats.cpus[3].qs_pending, "joins from the next grace period");
    }

    #[test]
    fn offline_reports_for_the_departing_cpu() {
        let rsp = engine();
        rsp.start_grace_period();
        for cpu in [0, 1, 2] {
            rsp.check_callbacks(cpu);
            rsp.process_callbacks(cpu);
        }
        assert!(rsp.gp_in_progress());
        rsp.cpu_offline(3).unwrap();
        assert_eq!(rsp.batches_completed(), 1);
        let kinds: Vec<_> = rsp.trace_snapshot().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&TraceKind::CpuOffline));
        assert!(kinds.contains(&TraceKind::GpEnd));
    }

    #[test]
    fn orphaned_callbacks_go_to_lowest_online_cpu() {
        let rsp = engine();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            rsp.call_rcu(2, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        rsp.cpu_offline(0).unwrap();
        rsp.cpu_offline(2).unwrap();
        let stats = rsp.stats();
        assert_eq!(stats.cpus[2].qlen, 0);
        assert_eq!(stats.cpus[1].qlen, 3);
        assert_eq!(rsp.call_rcu(2, || {}), Err(RcuError::CpuOffline(2)));

        assert!(rsp.start_grace_period());
        rsp.force_quiescent_state();
        assert_eq!(rsp.process_callbacks(1), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }
}
