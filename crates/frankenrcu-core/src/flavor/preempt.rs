//! Preemptible flavor: readers switched out mid-section are parked on
//! their leaf's blocked lists and hold up the grace period from there.

use std::sync::Arc;

use crate::config::Flavor;
use crate::data::{CpuState, RcuData};
use crate::flavor::{OfflineTasks, RcuFlavor};
use crate::node::{NodeState, ROOT};
use crate::state::RcuState;
use crate::stats::Counters;
use crate::task::{ExecContext, QsRequest, RcuTask, UnlockSpecial};
use crate::trace::{TraceEvent, TraceKind};
use crate::NodeIdx;

/// Times an unlocking task may find its blocked node changed under it.
/// Tasks only ever migrate from a leaf to the root, and the root never
/// migrates, so a second change means the lists are corrupt.
const MAX_REVALIDATE: u32 = 2;

#[derive(Debug)]
pub(crate) struct PreemptRcu;

impl RcuFlavor for PreemptRcu {
    fn flavor(&self) -> Flavor {
        Flavor::Preemptible
    }

    fn note_context_switch(&self, rsp: &RcuState, rdp: &RcuData, cs: &mut CpuState) {
        if let Some(task) = cs.curr.clone() {
            if task.nesting() > 0 && !task.special().is_blocked() {
                let mut leaf = rsp.nodes[rdp.mynode].lock();
                if leaf.qsmaskinit & rdp.grpmask == 0 {
                    rsp.warn(
                        "reader blocked on cpu missing from leaf qsmaskinit",
                        Some(rdp.cpu),
                        Some(rdp.mynode),
                    );
                }
                // The phase is fixed under the leaf lock, so the reader is
                // charged to exactly the grace periods that start before it
                // leaves.
                let phase = leaf.enqueue_phase(rdp.grpmask);
                if task.try_mark_blocked(rdp.mynode) {
                    leaf.enqueue(phase, Arc::clone(&task));
                    if rsp.trace_enabled() {
                        rsp.trace(
                            TraceEvent::new(TraceKind::TaskBlocked, leaf.gpnum, phase_detail(phase))
                                .cpu(rdp.cpu)
                                .node(rdp.mynode)
                                .task(task.id()),
                        );
                    }
                }
            }
            task.clear_need_qs();
        }
        cs.preempt_qs();
    }

    fn check_in_section(&self, cs: &mut CpuState, task: &RcuTask) {
        if cs.qs_pending && task.request_qs() == QsRequest::Quiescent {
            cs.preempt_qs();
        }
    }

    fn read_unlock_special(
        &self,
        rsp: &RcuState,
        task: &RcuTask,
        special: UnlockSpecial,
        ctx: ExecContext,
    ) {
        // Flags stay set; the next eligible unlock sees them.
        if ctx == ExecContext::Nmi {
            return;
        }
        if special.needs_qs() {
            rsp.unlock_need_qs(task);
        }
        if ctx == ExecContext::Irq || !special.is_blocked() {
            return;
        }
        task.clear_blocked();
        dequeue_blocked(rsp, task);
    }

    fn preempted_readers(&self, st: &NodeState) -> bool {
        st.preempted_readers()
    }

    fn check_blocked_tasks(&self, idx: NodeIdx, st: &NodeState) {
        assert!(
            !st.preempted_readers(),
            "node {idx}: grace period {} completed with blocked readers {:?}",
            st.gpnum,
            st.blocked_counts()
        );
    }

    fn offline_tasks(&self, rsp: &RcuState, idx: NodeIdx, st: &mut NodeState) -> OfflineTasks {
        if idx == ROOT {
            rsp.warn("last cpu of the root went offline", None, Some(ROOT));
            return OfflineTasks::default();
        }
        let flags = OfflineTasks {
            normal: st.preempted_readers(),
            expedited: st.exp_readers(),
        };
        let mut root = rsp.nodes[ROOT].lock();
        for (list, tasks) in st.blocked.iter_mut().enumerate() {
            for task in tasks.drain(..) {
                task.set_blocked_node(ROOT);
                Counters::bump(&rsp.counters.tasks_migrated);
                if rsp.trace_enabled() {
                    rsp.trace(
                        TraceEvent::new(TraceKind::TaskMigrated, st.gpnum, "moved to root")
                            .node(idx)
                            .task(task.id()),
                    );
                }
                root.blocked[list].push(task);
            }
        }
        flags
    }

    fn synchronize_expedited(&self, rsp: &RcuState) {
        rsp.synchronize_expedited_tree();
    }
}

fn phase_detail(phase: usize) -> &'static str {
    match phase {
        0 => "preempted in section, phase 0",
        _ => "preempted in section, phase 1",
    }
}

/// Unlink an unlocking task from whatever node holds it and let that node
/// report if the task was the last thing holding it up.
fn dequeue_blocked(rsp: &RcuState, task: &RcuTask) {
    // Hotplug may move the task to the root between reading its node and
    // locking it; re-check under the lock.
    let mut changes = 0;
    let (idx, mut st) = loop {
        let Some(idx) = task.blocked_node() else {
            rsp.warn("blocked task has no node", task.cpu(), None);
            return;
        };
        let st = rsp.nodes[idx].lock();
        if task.blocked_node() == Some(idx) {
            break (idx, st);
        }
        drop(st);
        changes += 1;
        assert!(
            changes <= MAX_REVALIDATE,
            "task {}: blocked node changed {changes} times during unlock",
            task.id()
        );
    };

    let empty = !st.preempted_readers();
    let empty_exp = !st.exp_readers();
    let removed = st.remove(task);
    assert!(
        removed.is_some(),
        "task {} not on node {idx}'s blocked lists",
        task.id()
    );
    task.clear_blocked_node();
    if rsp.trace_enabled() {
        rsp.trace(
            TraceEvent::new(TraceKind::TaskUnblocked, st.gpnum, "left section")
                .node(idx)
                .task(task.id()),
        );
    }

    if empty {
        drop(st);
    } else {
        rsp.report_unblock_qs_rnp(idx, st);
    }
    if !empty_exp {
        rsp.report_exp_rnp(idx);
    }
}
