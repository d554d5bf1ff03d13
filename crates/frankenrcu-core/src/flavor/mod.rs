//! Flavor capability interface.
//!
//! The engine's tree walking, reporting and hotplug plumbing are shared.
//! What differs between flavors is what a context switch means, what the
//! outermost unlock must do, and whether nodes can hold blocked readers.

mod classic;
mod preempt;

use crate::config::Flavor;
use crate::data::{CpuState, RcuData};
use crate::node::NodeState;
use crate::state::RcuState;
use crate::task::{ExecContext, RcuTask, UnlockSpecial};
use crate::NodeIdx;

pub(crate) use classic::ClassicRcu;
pub(crate) use preempt::PreemptRcu;

/// Which grace periods tasks moved off an emptied leaf were still blocking.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OfflineTasks {
    pub normal: bool,
    pub expedited: bool,
}

pub(crate) trait RcuFlavor: Send + Sync {
    fn flavor(&self) -> Flavor;

    /// The CPU's current task is switched out. Called with the CPU's lock.
    fn note_context_switch(&self, rsp: &RcuState, rdp: &RcuData, cs: &mut CpuState);

    /// Tick while the current task is inside a section.
    fn check_in_section(&self, cs: &mut CpuState, task: &RcuTask);

    /// Outermost unlock found work flagged while the task was inside.
    fn read_unlock_special(
        &self,
        rsp: &RcuState,
        task: &RcuTask,
        special: UnlockSpecial,
        ctx: ExecContext,
    );

    /// Readers on this node blocking its current grace period.
    fn preempted_readers(&self, st: &NodeState) -> bool;

    /// A grace period is about to start on node `idx`; the previous one must
    /// have drained its readers.
    fn check_blocked_tasks(&self, idx: NodeIdx, st: &NodeState);

    /// Leaf `idx` lost its last online CPU. Called with the on/off lock and
    /// the leaf's lock held.
    fn offline_tasks(&self, rsp: &RcuState, idx: NodeIdx, st: &mut NodeState) -> OfflineTasks;

    fn synchronize_expedited(&self, rsp: &RcuState);
}

static PREEMPT: PreemptRcu = PreemptRcu;
static CLASSIC: ClassicRcu = ClassicRcu;

pub(crate) fn ops(flavor: Flavor) -> &'static dyn RcuFlavor {
    match flavor {
        Flavor::Preemptible => &PREEMPT,
        Flavor::Classic => &CLASSIC,
    }
}
