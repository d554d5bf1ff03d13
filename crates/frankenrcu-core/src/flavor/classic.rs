//! Classic flavor: sections are never preempted, so a context switch is a
//! quiescent state and there are no blocked readers.

use std::sync::atomic::Ordering;

use crate::config::Flavor;
use crate::data::{CpuState, RcuData};
use crate::flavor::{OfflineTasks, RcuFlavor};
use crate::node::NodeState;
use crate::state::RcuState;
use crate::task::{ExecContext, RcuTask, UnlockSpecial};
use crate::trace::{TraceEvent, TraceKind};
use crate::NodeIdx;

#[derive(Debug)]
pub(crate) struct ClassicRcu;

impl RcuFlavor for ClassicRcu {
    fn flavor(&self) -> Flavor {
        Flavor::Classic
    }

    fn note_context_switch(&self, _rsp: &RcuState, rdp: &RcuData, cs: &mut CpuState) {
        if let Some(task) = &cs.curr {
            assert!(
                task.nesting() == 0,
                "task {} switched out of cpu {} inside a classic read-side section",
                task.id(),
                rdp.cpu
            );
            task.clear_need_qs();
        }
        cs.preempt_qs();
    }

    fn check_in_section(&self, _cs: &mut CpuState, _task: &RcuTask) {}

    fn read_unlock_special(
        &self,
        rsp: &RcuState,
        task: &RcuTask,
        special: UnlockSpecial,
        ctx: ExecContext,
    ) {
        if ctx == ExecContext::Nmi {
            return;
        }
        if special.needs_qs() {
            rsp.unlock_need_qs(task);
        }
        if special.is_blocked() {
            rsp.warn("classic reader marked blocked", task.cpu(), task.blocked_node());
            task.clear_blocked();
        }
    }

    fn preempted_readers(&self, _st: &NodeState) -> bool {
        false
    }

    fn check_blocked_tasks(&self, idx: NodeIdx, st: &NodeState) {
        debug_assert!(
            st.blocked.iter().all(Vec::is_empty),
            "node {idx}: classic flavor has blocked readers"
        );
    }

    fn offline_tasks(&self, _rsp: &RcuState, _idx: NodeIdx, _st: &mut NodeState) -> OfflineTasks {
        OfflineTasks::default()
    }

    fn synchronize_expedited(&self, rsp: &RcuState) {
        rsp.synchronize();
        rsp.exp_count.fetch_add(1, Ordering::SeqCst);
        rsp.trace(TraceEvent::new(
            TraceKind::ExpEnd,
            rsp.gpnum(),
            "classic expedited via forced grace period",
        ));
    }
}
