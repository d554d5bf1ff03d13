//! Deferred callbacks and the per-CPU work the tick softirq would do.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::RcuError;
use crate::state::RcuState;
use crate::CpuId;

impl RcuState {
    /// Queue `f` on `cpu` to run after a full grace period.
    pub fn call_rcu<F>(&self, cpu: CpuId, f: F) -> Result<(), RcuError>
    where
        F: FnOnce() + Send + 'static,
    {
        let rdp = self.cpu_data(cpu)?;
        let need = {
            let mut cs = rdp.lock();
            if !rdp.online() {
                return Err(RcuError::CpuOffline(cpu));
            }
            // A grace period already running may predate the caller's
            // update, so wait for the next one.
            let need = self.gpnum() + 1;
            cs.cblist.enqueue(need, Box::new(f));
            need
        };
        self.request_gp(need);
        Ok(())
    }

    /// Core processing for `cpu`: report any quiescent state it owes, start
    /// a grace period if one is wanted and invoke callbacks whose grace
    /// period has ended. Callbacks run with no locks held. Returns how many
    /// ran.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    pub fn process_callbacks(&self, cpu: CpuId) -> usize {
        let rdp = self.rdp(cpu);
        if !rdp.online() {
            return 0;
        }
        self.check_quiescent_state(rdp);
        self.start_gp();

        let completed = self.batches_completed();
        let batch = {
            let mut cs = rdp.lock();
            cs.completed = cs.completed.max(completed);
            cs.cblist.advance(completed);
            let limit = if cs.cblist.len() > self.config.qhimark {
                usize::MAX
            } else {
                self.config.blimit
            };
            cs.cblist.take_done(limit)
        };
        let invoked = batch.len();
        for cb in batch {
            cb();
        }
        if invoked > 0 {
            rdp.lock().n_cbs_invoked += invoked as u64;
        }
        invoked
    }

    /// Does `cpu` have engine work to do? Each answer is counted by reason.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    pub fn pending(&self, cpu: CpuId) -> bool {
        let rdp = self.rdp(cpu);
        let completed = self.batches_completed();
        let gp_running = self.gp_in_progress();
        let mut guard = rdp.lock();
        let leaf_gpnum = self.nodes[rdp.mynode].lock().gpnum;
        let cs = &mut *guard;
        let p = &mut cs.pending;
        p.n_rcu_pending += 1;

        let (counter, busy) = if cs.qs_pending && !cs.passed_quiesc {
            (&mut p.n_rp_qs_pending, true)
        } else if cs.qs_pending && cs.passed_quiesc {
            (&mut p.n_rp_report_qs, true)
        } else if cs.cblist.has_ready(completed) {
            (&mut p.n_rp_cb_ready, true)
        } else if !gp_running && cs.cblist.first_pending().is_some() {
            (&mut p.n_rp_cpu_needs_gp, true)
        } else if cs.completed != completed {
            (&mut p.n_rp_gp_completed, true)
        } else if cs.gpnum != leaf_gpnum {
            (&mut p.n_rp_gp_started, true)
        } else {
            (&mut p.n_rp_need_nothing, false)
        };
        *counter += 1;
        busy
    }

    /// Does `cpu` hold callbacks that keep it from going idle?
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    #[must_use]
    pub fn needs_cpu(&self, cpu: CpuId) -> bool {
        !self.rdp(cpu).lock().cblist.is_empty()
    }

    /// Wait until every callback queued before this call has run.
    ///
    /// Queues a counting callback behind each online CPU's list and drives
    /// grace periods and callback processing until all of them have fired.
    pub fn barrier(&self) {
        let outstanding = Arc::new(AtomicUsize::new(0));
        for cpu in 0..self.num_cpus() {
            outstanding.fetch_add(1, Ordering::SeqCst);
            let count = Arc::clone(&outstanding);
            let queued = self.call_rcu(cpu, move || {
                count.fetch_sub(1, Ordering::SeqCst);
            });
            if queued.is_err() {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }

        while outstanding.load(Ordering::SeqCst) != 0 {
            self.start_gp();
            self.force_quiescent_state();
            for cpu in 0..self.num_cpus() {
                self.process_callbacks(cpu);
            }
            if outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            let mut guard = self.gp_wait.lock();
            self.gp_wq.wait_for(&mut guard, self.config.fqs_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{RcuConfig, RcuState};

    fn engine(cpus: usize) -> RcuState {
        RcuState::new(RcuConfig::with_cpus(cpus, 2)).unwrap()
    }

    fn counter(rsp: &RcuState, cpu: usize, n: usize) -> Arc<AtomicUsize> {
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..n {
            let ran = Arc::clone(&ran);
            rsp.call_rcu(cpu, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        ran
    }

    #[test]
    fn callback_waits_for_its_grace_period() {
        let rsp = engine(2);
        let ran = counter(&rsp, 0, 1);
        assert!(rsp.needs_cpu(0));
        assert!(!rsp.needs_cpu(1));

        assert_eq!(rsp.process_callbacks(0), 0, "starts grace period 1");
        assert_eq!(rsp.gpnum(), 1);
        rsp.check_callbacks(0);
        rsp.process_callbacks(0);
        assert_eq!(ran.load(Ordering::SeqCst), 0, "cpu 1 has not reported");

        rsp.check_callbacks(1);
        rsp.process_callbacks(1);
        assert_eq!(rsp.batches_completed(), 1);
        assert_eq!(rsp.process_callbacks(0), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!rsp.needs_cpu(0));
        assert_eq!(rsp.stats().cpus[0].n_cbs_invoked, 1);
    }

    #[test]
    fn callback_queued_mid_grace_period_needs_the_next_one() {
        let rsp = engine(2);
        rsp.start_grace_period();
        let ran = counter(&rsp, 0, 1);
        rsp.force_quiescent_state();
        assert_eq!(rsp.batches_completed(), 1);
        assert_eq!(rsp.process_callbacks(0), 0);
        assert_eq!(rsp.gpnum(), 2, "the callback's grace period was started");
        rsp.force_quiescent_state();
        assert_eq!(rsp.process_callbacks(0), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batches_are_limited_below_qhimark() {
        let rsp = engine(2);
        let ran = counter(&rsp, 0, 25);
        rsp.start_gp();
        rsp.force_quiescent_state();
        assert_eq!(rsp.process_callbacks(0), 10);
        assert_eq!(rsp.process_callbacks(0), 10);
        assert_eq!(rsp.process_callbacks(0), 5);
        assert_eq!(ran.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn long_queue_is_drained_in_one_pass() {
        let mut cfg = RcuConfig::with_cpus(2, 2);
        cfg.qhimark = 20;
        let rsp = RcuState::new(cfg).unwrap();
        counter(&rsp, 1, 25);
        rsp.start_gp();
        rsp.force_quiescent_state();
        assert_eq!(rsp.process_callbacks(1), 25);
    }

    #[test]
    fn pending_reports_reasons() {
        let rsp = engine(2);
        assert!(!rsp.pending(0));
        assert_eq!(rsp.stats().cpus[0].pending.n_rp_need_nothing, 1);

        counter(&rsp, 0, 1);
        assert!(rsp.pending(0));
        assert_eq!(rsp.stats().cpus[0].pending.n_rp_cpu_needs_gp, 1);

        rsp.start_gp();
        assert!(rsp.pending(0));
        assert_eq!(rsp.stats().cpus[0].pending.n_rp_gp_started, 1);

        rsp.check_callbacks(0);
        assert!(rsp.pending(0));
        assert_eq!(rsp.stats().cpus[0].pending.n_rp_report_qs, 1);
        assert_eq!(rsp.stats().cpus[0].pending.n_rcu_pending, 4);
    }

    #[test]
    fn barrier_runs_everything_queued_before_it() {
        let rsp = engine(4);
        let a = counter(&rsp, 0, 3);
        let b = counter(&rsp, 3, 2);
        rsp.cpu_offline(2).unwrap();
        rsp.barrier();
        assert_eq!(a.load(Ordering::SeqCst), 3);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert!((0..4).all(|cpu| !rsp.is_cpu_online(cpu) || !rsp.needs_cpu(cpu)));
    }
}
