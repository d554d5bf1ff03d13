//! Scheduler hooks: context switches and the periodic tick.

use std::sync::Arc;

use crate::state::RcuState;
use crate::task::TaskRef;
use crate::CpuId;

impl RcuState {
    /// The task running on `cpu` is being switched out (or asked to yield).
    /// A preemptible reader inside a section is moved onto its leaf's
    /// blocked list; either way the CPU records a quiescent state.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range. Under the classic flavor, also panics
    /// if the running task is inside a read-side section.
    pub fn note_context_switch(&self, cpu: CpuId) {
        let rdp = self.rdp(cpu);
        let mut cs = rdp.lock();
        self.ops.note_context_switch(self, rdp, &mut cs);
    }

    /// Run `next` on `cpu`, switching out whatever ran there.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range or offline, or if `next` is already
    /// running on another CPU. Under the classic flavor, also panics if the
    /// outgoing task is inside a read-side section.
    pub fn switch_to(&self, cpu: CpuId, next: Option<TaskRef>) {
        let rdp = self.rdp(cpu);
        let mut cs = rdp.lock();
        assert!(rdp.online(), "switch_to on offline cpu {cpu}");
        if let Some(next) = &next
            && let Some(other) = next.cpu()
        {
            let already_here = cs.curr.as_ref().is_some_and(|c| Arc::ptr_eq(c, next));
            assert!(
                already_here,
                "task {} is already running on cpu {other}",
                next.id()
            );
        }
        self.ops.note_context_switch(self, rdp, &mut cs);
        if let Some(prev) = cs.curr.take() {
            prev.set_cpu(None);
        }
        if let Some(next) = &next {
            next.set_cpu(Some(cpu));
        }
        cs.curr = next;
    }

    /// Task currently running on `cpu`.
    #[must_use]
    pub fn current(&self, cpu: CpuId) -> Option<TaskRef> {
        self.cpus.get(cpu).and_then(|rdp| rdp.lock().curr.clone())
    }

    /// Scheduler tick on `cpu`. A CPU that is idle or running a task outside
    /// any section records a quiescent state; a task inside a section is
    /// asked to report at its outermost unlock if the CPU owes one.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    pub fn check_callbacks(&self, cpu: CpuId) {
        let rdp = self.rdp(cpu);
        let mut cs = rdp.lock();
        if !rdp.online() {
            return;
        }
        self.note_gp_changes(rdp, &mut cs);
        match cs.curr.clone() {
            None => cs.preempt_qs(),
            Some(task) if task.nesting() == 0 => {
                task.clear_need_qs();
                cs.preempt_qs();
            }
            Some(task) => self.ops.check_in_section(&mut cs, &task),
        }
    }

    /// Push every running reader onto the blocked lists by putting each
    /// online CPU through a context switch.
    pub(crate) fn force_readers_blocked(&self) {
        for rdp in self.cpus.iter() {
            let mut cs = rdp.lock();
            if rdp.online() {
                self.ops.note_context_switch(self, rdp, &mut cs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{RcuConfig, RcuState};

    #[test]
    fn switch_to_tracks_current_task() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        let a = rsp.spawn_task();
        let b = rsp.spawn_task();
        rsp.switch_to(0, Some(a.clone()));
        assert_eq!(a.cpu(), Some(0));
        rsp.switch_to(0, Some(b.clone()));
        assert_eq!(a.cpu(), None);
        assert_eq!(b.cpu(), Some(0));
        assert_eq!(rsp.current(0).map(|t| t.id()), Some(b.id()));
        rsp.switch_to(0, None);
        assert_eq!(b.cpu(), None);
        assert!(rsp.current(0).is_none());
    }

    #[test]
    #[should_panic(expected = "already running")]
    fn task_cannot_run_on_two_cpus() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        let a = rsp.spawn_task();
        rsp.switch_to(0, Some(a.clone()));
        rsp.switch_to(1, Some(a));
    }

    #[test]
    #[should_panic(expected = "cpu 9 out of range (2 CPUs)")]
    fn tick_on_unknown_cpu_panics() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        rsp.check_callbacks(9);
    }

    #[test]
    fn tick_records_quiescent_state_for_idle_cpu() {
        let rsp = RcuState::new(RcuConfig::with_cpus(2, 2)).unwrap();
        rsp.start_grace_period();
        rsp.check_callbacks(1);
        let cpu = &rsp.stats().cpus[1];
        assert!(cpu.passed_quiesc);
        assert!(cpu.qs_pending);
        assert_eq!(cpu.gpnum, 1);
    }
}
