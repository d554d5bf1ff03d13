//! Per-task reader state.
//!
//! A task's read-side nesting depth and its unlock-special flags share one
//! atomic word: nesting in the low 32 bits, flags above. The outermost
//! unlock therefore sees the flags in the same atomic step that drops the
//! nesting to zero, and a remote CPU can only set a flag while the task is
//! provably inside a section (its CAS fails once nesting is zero).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{CpuId, NodeIdx};

/// Shared handle to a task.
pub type TaskRef = Arc<RcuTask>;

pub(crate) const NO_NODE: NodeIdx = usize::MAX;
const NO_CPU: CpuId = usize::MAX;

const NESTING_MASK: u64 = 0xffff_ffff;
const SPECIAL_SHIFT: u32 = 32;
const NEED_QS_BIT: u64 = 1 << SPECIAL_SHIFT;
const BLOCKED_BIT: u64 = 2 << SPECIAL_SHIFT;
const SPECIAL_MASK: u64 = NEED_QS_BIT | BLOCKED_BIT;

/// Work left for the outermost unlock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnlockSpecial {
    #[default]
    Clear,
    /// The CPU owes a quiescent state; report it at unlock.
    NeedQs,
    /// The task sits on a node's blocked list.
    Blocked,
    BlockedNeedQs,
}

impl UnlockSpecial {
    const fn from_word(word: u64) -> Self {
        match (word & NEED_QS_BIT != 0, word & BLOCKED_BIT != 0) {
            (false, false) => Self::Clear,
            (true, false) => Self::NeedQs,
            (false, true) => Self::Blocked,
            (true, true) => Self::BlockedNeedQs,
        }
    }

    #[must_use]
    pub const fn needs_qs(self) -> bool {
        matches!(self, Self::NeedQs | Self::BlockedNeedQs)
    }

    #[must_use]
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked | Self::BlockedNeedQs)
    }

    #[must_use]
    pub const fn is_clear(self) -> bool {
        matches!(self, Self::Clear)
    }
}

/// Where an unlock runs. Only task context may dequeue a blocked reader.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecContext {
    #[default]
    Task,
    Irq,
    Nmi,
}

/// Outcome of asking a running task for a quiescent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QsRequest {
    /// The task is outside any section, or its section is already tracked
    /// on a blocked list. The CPU is quiescent now.
    Quiescent,
    /// `NeedQs` was set; the outermost unlock will record the state.
    Requested,
}

/// A schedulable entity that may hold read-side sections.
pub struct RcuTask {
    id: u64,
    word: AtomicU64,
    blocked_node: AtomicUsize,
    cpu: AtomicUsize,
}

impl RcuTask {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            word: AtomicU64::new(0),
            blocked_node: AtomicUsize::new(NO_NODE),
            cpu: AtomicUsize::new(NO_CPU),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current read-side nesting depth.
    #[must_use]
    pub fn nesting(&self) -> u32 {
        (self.word.load(Ordering::SeqCst) & NESTING_MASK) as u32
    }

    #[must_use]
    pub fn special(&self) -> UnlockSpecial {
        UnlockSpecial::from_word(self.word.load(Ordering::SeqCst))
    }

    /// Node whose blocked list holds this task.
    #[must_use]
    pub fn blocked_node(&self) -> Option<NodeIdx> {
        match self.blocked_node.load(Ordering::SeqCst) {
            NO_NODE => None,
            idx => Some(idx),
        }
    }

    /// CPU the task is running on.
    #[must_use]
    pub fn cpu(&self) -> Option<CpuId> {
        match self.cpu.load(Ordering::SeqCst) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_cpu(&self, cpu: Option<CpuId>) {
        self.cpu.store(cpu.unwrap_or(NO_CPU), Ordering::SeqCst);
    }

    pub(crate) fn set_blocked_node(&self, node: NodeIdx) {
        self.blocked_node.store(node, Ordering::SeqCst);
    }

    pub(crate) fn clear_blocked_node(&self) {
        self.blocked_node.store(NO_NODE, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn enter(&self) {
        let old = self.word.fetch_add(1, Ordering::SeqCst);
        if old & NESTING_MASK == NESTING_MASK {
            self.word.fetch_sub(1, Ordering::SeqCst);
            panic!("task {}: read-side nesting overflow", self.id);
        }
    }

    /// Leave one nesting level. Returns the flags when this was the
    /// outermost unlock and work is pending.
    #[inline]
    pub(crate) fn exit(&self) -> Option<UnlockSpecial> {
        let old = self.word.fetch_sub(1, Ordering::SeqCst);
        let nesting = old & NESTING_MASK;
        if nesting == 0 {
            self.word.fetch_add(1, Ordering::SeqCst);
            panic!("task {}: read_unlock without matching read_lock", self.id);
        }
        let special = UnlockSpecial::from_word(old);
        (nesting == 1 && !special.is_clear()).then_some(special)
    }

    /// Force nesting to one so a single unlock ends every open section.
    /// Returns false if the task held no section.
    pub(crate) fn collapse_nesting(&self) -> bool {
        self.word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w & NESTING_MASK != 0).then_some((w & SPECIAL_MASK) | 1)
            })
            .is_ok()
    }

    /// Ask a task running in a section to report when it leaves.
    pub(crate) fn request_qs(&self) -> QsRequest {
        let res = self
            .word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                if w & NESTING_MASK == 0 || w & BLOCKED_BIT != 0 {
                    None
                } else {
                    Some(w | NEED_QS_BIT)
                }
            });
        match res {
            Ok(_) => QsRequest::Requested,
            Err(_) => QsRequest::Quiescent,
        }
    }

    /// Mark the task blocked on `node`. Caller holds that node's lock and
    /// the lock of the CPU the task runs on. Fails if the task is outside
    /// any section or already blocked.
    pub(crate) fn try_mark_blocked(&self, node: NodeIdx) -> bool {
        let w = self.word.load(Ordering::SeqCst);
        if w & NESTING_MASK == 0 || w & BLOCKED_BIT != 0 {
            return false;
        }
        // Published before the flag: an unlocker that sees BLOCKED must find
        // the node.
        self.set_blocked_node(node);
        let res = self
            .word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                if w & NESTING_MASK == 0 || w & BLOCKED_BIT != 0 {
                    None
                } else {
                    Some(w | BLOCKED_BIT)
                }
            });
        if res.is_err() {
            self.clear_blocked_node();
            return false;
        }
        true
    }

    pub(crate) fn clear_need_qs(&self) {
        self.word.fetch_and(!NEED_QS_BIT, Ordering::SeqCst);
    }

    pub(crate) fn clear_blocked(&self) {
        self.word.fetch_and(!BLOCKED_BIT, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RcuTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcuTask")
            .field("id", &self.id)
            .field("nesting", &self.nesting())
            .field("special", &self.special())
            .field("blocked_node", &self.blocked_node())
            .field("cpu", &self.cpu())
            .finish()
    }
}
