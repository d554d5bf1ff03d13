//! Combining-tree nodes and tree geometry.
//!
//! Nodes live in one arena in breadth-first order: index 0 is the root and
//! the last level holds the leaves. A leaf's mask bits are its CPUs; an
//! interior node's bits are its children. Each node carries four blocked
//! lists indexed by grace-period phase (`gpnum & 1`), plus two for the
//! expedited protocol.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::task::{RcuTask, TaskRef};
use crate::{CpuId, NodeIdx};

pub(crate) const ROOT: NodeIdx = 0;

/// Offset from a normal blocked list to its expedited counterpart.
pub(crate) const EXP_OFFSET: usize = 2;

/// Lock-protected part of a node.
#[derive(Debug, Default)]
pub(crate) struct NodeState {
    /// Children (or CPUs) yet to report for the current grace period.
    pub qsmask: u64,
    /// Children (or CPUs) that are online; copied into `qsmask` at start.
    pub qsmaskinit: u64,
    /// Children yet to finish the current expedited grace period.
    pub expmask: u64,
    /// Latest grace period started at this node.
    pub gpnum: u64,
    /// Latest grace period finished at this node.
    pub completed: u64,
    pub blocked: [Vec<TaskRef>; 4],
}

impl NodeState {
    #[inline]
    fn phase(&self) -> usize {
        (self.gpnum & 1) as usize
    }

    pub fn gp_in_progress(&self) -> bool {
        self.gpnum != self.completed
    }

    /// Phase for a task blocking now on a CPU with bit `cpu_mask`. A CPU that
    /// still owes the current grace period blocks it; one that has reported
    /// (or no grace period running) blocks the next.
    pub fn enqueue_phase(&self, cpu_mask: u64) -> usize {
        let reported = u64::from(self.qsmask & cpu_mask == 0);
        ((self.gpnum + reported) & 1) as usize
    }

    /// Readers blocking the current grace period.
    pub fn preempted_readers(&self) -> bool {
        let p = self.phase();
        !self.blocked[p].is_empty() || !self.blocked[p + EXP_OFFSET].is_empty()
    }

    /// Readers blocking the current expedited grace period.
    pub fn exp_readers(&self) -> bool {
        !self.blocked[EXP_OFFSET].is_empty() || !self.blocked[EXP_OFFSET + 1].is_empty()
    }

    pub fn exp_done(&self) -> bool {
        !self.exp_readers() && self.expmask == 0
    }

    pub fn enqueue(&mut self, phase: usize, task: TaskRef) {
        debug_assert!(
            self.position(&task).is_none(),
            "task {} queued twice",
            task.id()
        );
        self.blocked[phase].push(task);
    }

    fn position(&self, task: &RcuTask) -> Option<(usize, usize)> {
        self.blocked.iter().enumerate().find_map(|(list, tasks)| {
            tasks
                .iter()
                .position(|t| std::ptr::eq(Arc::as_ptr(t), task))
                .map(|pos| (list, pos))
        })
    }

    /// Unlink `task`; returns the list it was on.
    pub fn remove(&mut self, task: &RcuTask) -> Option<usize> {
        let (list, pos) = self.position(task)?;
        self.blocked[list].remove(pos);
        debug_assert!(self.position(task).is_none(), "task {} on two lists", task.id());
        Some(list)
    }

    /// Move every currently blocked reader onto the expedited lists, keeping
    /// its phase.
    pub fn splice_for_expedited(&mut self) {
        for phase in 0..EXP_OFFSET {
            let moved = std::mem::take(&mut self.blocked[phase]);
            self.blocked[phase + EXP_OFFSET].extend(moved);
        }
    }

    pub fn blocked_counts(&self) -> [usize; 4] {
        [
            self.blocked[0].len(),
            self.blocked[1].len(),
            self.blocked[2].len(),
            self.blocked[3].len(),
        ]
    }
}

/// One node of the combining tree.
#[derive(Debug)]
pub(crate) struct RcuNode {
    pub level: usize,
    /// This node's bit in its parent's masks; 0 for the root.
    pub grpmask: u64,
    pub parent: Option<NodeIdx>,
    /// CPUs covered by this subtree.
    pub cpus: Range<CpuId>,
    state: Mutex<NodeState>,
}

impl RcuNode {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }
}

/// Node counts per level, root first.
pub(crate) fn level_counts(num_cpus: usize, fanout: usize, leaf_fanout: usize) -> Vec<usize> {
    let mut counts = vec![num_cpus.div_ceil(leaf_fanout)];
    while let Some(&last) = counts.last() {
        if last <= 1 {
            break;
        }
        counts.push(last.div_ceil(fanout));
    }
    counts.reverse();
    counts
}

/// Children (or CPUs for the last level) per node, balanced so every
/// level spreads its load evenly.
fn level_spread(num_cpus: usize, counts: &[usize]) -> Vec<usize> {
    let mut spread = vec![0; counts.len()];
    let mut ccur = num_cpus;
    for (i, &count) in counts.iter().enumerate().rev() {
        let cprv = ccur;
        ccur = count;
        spread[i] = cprv.div_ceil(ccur);
    }
    spread
}

/// The built arena plus the leaf and mask bit of every CPU.
pub(crate) struct Tree {
    pub nodes: Box<[RcuNode]>,
    pub cpu_leaf: Vec<(NodeIdx, u64)>,
    pub levels: usize,
}

/// Build the tree with every CPU online.
pub(crate) fn build_tree(num_cpus: usize, fanout: usize, leaf_fanout: usize) -> Tree {
    let counts = level_counts(num_cpus, fanout, leaf_fanout);
    let spread = level_spread(num_cpus, &counts);
    let levels = counts.len();

    let mut level_start = Vec::with_capacity(levels);
    let mut total = 0;
    for &c in &counts {
        level_start.push(total);
        total += c;
    }

    let mut nodes = Vec::with_capacity(total);
    for level in 0..levels {
        let stride: usize = spread[level..].iter().product();
        for j in 0..counts[level] {
            let lo = (j * stride).min(num_cpus);
            let hi = ((j + 1) * stride).min(num_cpus);
            let (grpnum, parent) = if level == 0 {
                (0, None)
            } else {
                let ps = spread[level - 1];
                ((j % ps) as u32, Some(level_start[level - 1] + j / ps))
            };
            nodes.push(RcuNode {
                level,
                grpmask: if level == 0 { 0 } else { 1u64 << grpnum },
                parent,
                cpus: lo..hi,
                state: Mutex::new(NodeState::default()),
            });
        }
    }

    let leaf_start = level_start[levels - 1];
    let leaf_spread = spread[levels - 1];
    let cpu_leaf: Vec<(NodeIdx, u64)> = (0..num_cpus)
        .map(|cpu| {
            let leaf = leaf_start + cpu / leaf_spread;
            (leaf, 1u64 << (cpu - nodes[leaf].cpus.start))
        })
        .collect();

    // Everything starts online: leaves get their CPUs' bits, interior nodes
    // the bits of children that cover at least one CPU.
    for &(leaf, mask) in &cpu_leaf {
        nodes[leaf].state.get_mut().qsmaskinit |= mask;
    }
    for idx in (1..nodes.len()).rev() {
        if nodes[idx].state.get_mut().qsmaskinit != 0
            && let Some(parent) = nodes[idx].parent
        {
            let bit = nodes[idx].grpmask;
            nodes[parent].state.get_mut().qsmaskinit |= bit;
        }
    }

    Tree {
        nodes: nodes.into_boxed_slice(),
        cpu_leaf,
        levels,
    }
}
