//! # frankenrcu-core
//!
//! Hierarchical, preemptible read-copy-update grace-period engine.
//!
//! CPUs report quiescent states into a combining tree of nodes; a grace
//! period ends when the root has heard from every online CPU and no reader
//! preempted inside a read-side section is still blocked on any node.
//! Readers pay one atomic add and subtract per section. Writers either wait
//! ([`RcuState::synchronize`], [`RcuState::synchronize_expedited`]) or queue
//! a callback ([`RcuState::call_rcu`]).
//!
//! The scheduler, interrupt and hotplug machinery of a real kernel are
//! modelled by explicit hooks on [`RcuState`]: `switch_to`,
//! `note_context_switch`, `check_callbacks`, `process_callbacks`,
//! `cpu_offline` and `cpu_online`.
//!
//! ```
//! use frankenrcu_core::{RcuConfig, RcuState};
//!
//! let rsp = RcuState::new(RcuConfig::with_cpus(4, 2).scheduler_active(true)).unwrap();
//! let reader = rsp.spawn_task();
//! rsp.switch_to(0, Some(reader.clone()));
//! {
//!     let _section = rsp.read(&reader);
//! }
//! rsp.synchronize();
//! assert_eq!(rsp.batches_completed(), 1);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod stats;
pub mod task;
pub mod trace;

mod callbacks;
mod cblist;
mod data;
mod expedited;
mod flavor;
mod gp;
mod hotplug;
mod node;
mod reader;
mod sched;
mod state;

/// Index of a CPU, `0..num_cpus`.
pub type CpuId = usize;
/// Index of a node in the tree, root first.
pub type NodeIdx = usize;

pub use cblist::RcuCallback;
pub use config::{Flavor, RcuConfig, flavor_from_env};
pub use data::PendingCounters;
pub use error::{ConfigError, RcuError};
pub use reader::RcuReadGuard;
pub use state::RcuState;
pub use stats::{CpuStats, NodeStats, RcuStats, StallReport};
pub use task::{ExecContext, RcuTask, TaskRef, UnlockSpecial};
pub use trace::{TraceEvent, TraceKind, TraceRing};
