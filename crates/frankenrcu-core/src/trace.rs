//! Bounded protocol trace.
//!
//! Protocol steps are appended to an overwrite-on-full ring so a test or the
//! harness can reconstruct what the engine did. Recording is off when the
//! capacity is zero; the check is a single relaxed load.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{CpuId, NodeIdx};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TraceKind {
    GpStart,
    GpEnd,
    /// A CPU's quiescent state was recorded in its leaf.
    CpuQs,
    /// A node's mask emptied and it reported to its parent.
    NodeReport,
    TaskBlocked,
    TaskUnblocked,
    /// A blocked task moved from an emptied leaf to the root.
    TaskMigrated,
    ExpStart,
    ExpEnd,
    ExpDoneByOthers,
    ExpFallback,
    CpuOffline,
    CpuOnline,
    Stall,
    Warning,
}

impl TraceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GpStart => "gp_start",
            Self::GpEnd => "gp_end",
            Self::CpuQs => "cpu_qs",
            Self::NodeReport => "node_report",
            Self::TaskBlocked => "task_blocked",
            Self::TaskUnblocked => "task_unblocked",
            Self::TaskMigrated => "task_migrated",
            Self::ExpStart => "exp_start",
            Self::ExpEnd => "exp_end",
            Self::ExpDoneByOthers => "exp_done_by_others",
            Self::ExpFallback => "exp_fallback",
            Self::CpuOffline => "cpu_offline",
            Self::CpuOnline => "cpu_online",
            Self::Stall => "stall",
            Self::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TraceEvent {
    pub seq: u64,
    pub kind: TraceKind,
    pub gpnum: u64,
    pub cpu: Option<CpuId>,
    pub node: Option<NodeIdx>,
    pub task: Option<u64>,
    pub detail: &'static str,
}

impl TraceEvent {
    #[must_use]
    pub fn new(kind: TraceKind, gpnum: u64, detail: &'static str) -> Self {
        Self {
            seq: 0,
            kind,
            gpnum,
            cpu: None,
            node: None,
            task: None,
            detail,
        }
    }

    #[must_use]
    pub fn cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    #[must_use]
    pub fn node(mut self, node: NodeIdx) -> Self {
        self.node = Some(node);
        self
    }

    #[must_use]
    pub fn task(mut self, task: u64) -> Self {
        self.task = Some(task);
        self
    }
}

/// Fixed-capacity event ring. The oldest event is dropped when full.
pub struct TraceRing {
    capacity: usize,
    next_seq: AtomicU64,
    dropped: AtomicU64,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl TraceRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    #[inline]
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.capacity != 0
    }

    /// Append `event`, assigning it the next sequence number.
    pub fn record(&self, mut event: TraceEvent) {
        if !self.enabled() {
            return;
        }
        let mut events = self.events.lock();
        event.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if events.len() == self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
    }

    /// Copy of the retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Remove and return the retained events, oldest first.
    pub fn drain(&self) -> Vec<TraceEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Events overwritten before anyone read them.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TraceRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRing")
            .field("capacity", &self.capacity)
            .field("len", &self.events.lock().len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
