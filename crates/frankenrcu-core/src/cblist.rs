//! Segmented per-CPU callback list.
//!
//! Every pending callback is tagged with the grace-period number that must
//! complete before it may run. Tags never decrease along the queue, so
//! advancing moves a prefix into the DONE segment.

use std::collections::VecDeque;

/// Deferred work queued by `call_rcu`.
pub type RcuCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub(crate) struct SegCbList {
    done: VecDeque<RcuCallback>,
    pending: VecDeque<(u64, RcuCallback)>,
}

impl SegCbList {
    /// Queue `cb` to run once grace period `need` has completed.
    pub fn enqueue(&mut self, need: u64, cb: RcuCallback) {
        // Two racing enqueues may read gpnum out of order; waiting for the
        // later grace period is always safe.
        let need = self.pending.back().map_or(need, |&(last, _)| need.max(last));
        self.pending.push_back((need, cb));
    }

    /// Move callbacks whose grace period is over into DONE. Returns how many
    /// moved.
    pub fn advance(&mut self, completed: u64) -> usize {
        let mut moved = 0;
        while let Some(&(need, _)) = self.pending.front() {
            if need > completed {
                break;
            }
            if let Some((_, cb)) = self.pending.pop_front() {
                self.done.push_back(cb);
                moved += 1;
            }
        }
        moved
    }

    /// Take up to `limit` ready callbacks in queue order.
    pub fn take_done(&mut self, limit: usize) -> Vec<RcuCallback> {
        let n = limit.min(self.done.len());
        self.done.drain(..n).collect()
    }

    /// True if something could run once `completed` is reached.
    pub fn has_ready(&self, completed: u64) -> bool {
        !self.done.is_empty() || self.pending.front().is_some_and(|&(need, _)| need <= completed)
    }

    /// Oldest grace period still awaited.
    pub fn first_pending(&self) -> Option<u64> {
        self.pending.front().map(|&(need, _)| need)
    }

    pub fn len(&self) -> usize {
        self.done.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn done_len(&self) -> usize {
        self.done.len()
    }

    /// Take everything, for adoption by another CPU.
    pub fn take_all(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Append an orphaned list. Ready callbacks stay ready; pending ones are
    /// merged by tag so the queue stays ordered.
    pub fn adopt(&mut self, mut orphan: Self) {
        self.done.append(&mut orphan.done);
        if orphan.pending.is_empty() {
            return;
        }
        let mine = std::mem::take(&mut self.pending);
        let mut a = mine.into_iter().peekable();
        let mut b = orphan.pending.into_iter().peekable();
        loop {
            let take_a = match (a.peek(), b.peek()) {
                (Some(x), Some(y)) => x.0 <= y.0,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_a { a.next() } else { b.next() };
            if let Some(entry) = next {
                self.pending.push_back(entry);
            }
        }
    }
}

impl std::fmt::Debug for SegCbList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegCbList")
            .field("done", &self.done.len())
            .field(
                "pending",
                &self.pending.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, v: u32) -> RcuCallback {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(v))
    }

    #[test]
    fn advance_moves_ready_prefix_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SegCbList::default();
        list.enqueue(1, recorder(&log, 1));
        list.enqueue(2, recorder(&log, 2));
        list.enqueue(2, recorder(&log, 3));
        assert_eq!(list.len(), 3);
        assert!(!list.has_ready(0));

        assert_eq!(list.advance(1), 1);
        assert_eq!(list.done_len(), 1);
        assert_eq!(list.first_pending(), Some(2));
        assert_eq!(list.advance(2), 2);
        for cb in list.take_done(usize::MAX) {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(list.is_empty());
    }

    #[test]
    fn late_enqueue_never_overtakes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SegCbList::default();
        list.enqueue(5, recorder(&log, 1));
        list.enqueue(4, recorder(&log, 2));
        assert_eq!(list.advance(4), 0);
        assert_eq!(list.advance(5), 2);
    }

    #[test]
    fn take_done_respects_limit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SegCbList::default();
        for v in 0..25 {
            list.enqueue(1, recorder(&log, v));
        }
        list.advance(1);
        assert_eq!(list.take_done(10).len(), 10);
        assert_eq!(list.done_len(), 15);
    }

    #[test]
    fn adopt_merges_by_grace_period() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mine = SegCbList::default();
        mine.enqueue(1, recorder(&log, 10));
        mine.enqueue(3, recorder(&log, 30));
        let mut orphan = SegCbList::default();
        orphan.enqueue(0, recorder(&log, 0));
        orphan.advance(0);
        orphan.enqueue(2, recorder(&log, 20));
        orphan.enqueue(4, recorder(&log, 40));

        mine.adopt(orphan.take_all());
        assert!(orphan.is_empty());
        assert_eq!(mine.len(), 5);
        assert_eq!(mine.done_len(), 1);
        mine.advance(4);
        for cb in mine.take_done(usize::MAX) {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 10, 20, 30, 40]);
    }
}
