//! Read-side critical sections.
//!
//! The fast path touches only the task's own atomic word. Everything else
//! happens in the outermost unlock when the task was flagged while inside
//! its section.

use crate::state::RcuState;
use crate::task::{ExecContext, RcuTask, TaskRef};

/// Ends a read-side section when dropped.
#[must_use = "the read-side section ends when the guard is dropped"]
pub struct RcuReadGuard<'a> {
    rsp: &'a RcuState,
    task: &'a RcuTask,
}

impl Drop for RcuReadGuard<'_> {
    fn drop(&mut self) {
        self.rsp.read_unlock(self.task);
    }
}

impl RcuState {
    /// Enter a read-side section. Sections nest.
    ///
    /// # Panics
    ///
    /// Panics if `task` is not running on a CPU. Such a reader would be
    /// invisible to context switches and grace periods could end over it.
    #[inline]
    pub fn read_lock(&self, task: &RcuTask) {
        assert!(
            task.cpu().is_some(),
            "read_lock: task {} is not running on any cpu",
            task.id()
        );
        task.enter();
    }

    /// Leave a read-side section from task context.
    #[inline]
    pub fn read_unlock(&self, task: &RcuTask) {
        self.read_unlock_in(task, ExecContext::Task);
    }

    /// Leave a read-side section from the given context. An NMI handler
    /// never does the outermost-unlock work; an interrupt handler may report
    /// a quiescent state but never dequeues a blocked reader.
    #[inline]
    pub fn read_unlock_in(&self, task: &RcuTask, ctx: ExecContext) {
        if let Some(special) = task.exit() {
            self.ops.read_unlock_special(self, task, special, ctx);
        }
    }

    /// Scoped section: `let _g = rsp.read(&task);`.
    pub fn read<'a>(&'a self, task: &'a RcuTask) -> RcuReadGuard<'a> {
        self.read_lock(task);
        RcuReadGuard { rsp: self, task }
    }

    /// A task is exiting. If it still holds a section, close every level at
    /// once so it leaves no blocked-list entry behind.
    pub fn exit_task(&self, task: &TaskRef) {
        if task.collapse_nesting() {
            self.read_unlock_in(task, ExecContext::Task);
        }
    }

    /// Outermost unlock found `NeedQs`: record the quiescent state the CPU
    /// was asked for.
    pub(crate) fn unlock_need_qs(&self, task: &RcuTask) {
        task.clear_need_qs();
        if let Some(cpu) = task.cpu() {
            self.rdp(cpu).lock().preempt_qs();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{RcuConfig, RcuState};

    #[test]
    fn guard_closes_section() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        let t = rsp.spawn_task();
        rsp.switch_to(0, Some(t.clone()));
        {
            let _outer = rsp.read(&t);
            let _inner = rsp.read(&t);
            assert_eq!(t.nesting(), 2);
        }
        assert_eq!(t.nesting(), 0);
        assert!(t.special().is_clear());
    }

    #[test]
    #[should_panic(expected = "is not running on any cpu")]
    fn read_lock_on_unscheduled_task_panics() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        rsp.set_scheduler_active();
        let writer = rsp.spawn_task();
        rsp.switch_to(0, Some(writer));
        let stray = rsp.spawn_task();
        rsp.read_lock(&stray);
        // Unreachable: a grace period must never complete over `stray`.
        rsp.synchronize();
    }

    #[test]
    fn exit_task_outside_section_is_noop() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        let t = rsp.spawn_task();
        rsp.exit_task(&t);
        assert_eq!(t.nesting(), 0);
    }
}
