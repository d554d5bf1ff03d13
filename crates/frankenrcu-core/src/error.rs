//! Error types.
//!
//! Only caller-input failures are reported as errors. A violated protocol
//! invariant (a grace period ending with blocked readers, a task on two
//! lists) is a bug in the engine or its caller and panics.

use thiserror::Error;

use crate::CpuId;

/// Rejected [`RcuConfig`](crate::RcuConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one CPU is required")]
    NoCpus,
    #[error("{requested} CPUs requested, at most {max} supported")]
    TooManyCpus { requested: usize, max: usize },
    #[error("{name} = {value} is outside 2..=64")]
    FanoutOutOfRange { name: &'static str, value: usize },
    #[error("{0} must be nonzero")]
    ZeroValue(&'static str),
    #[error("{var}: cannot parse {value:?}")]
    BadEnv { var: &'static str, value: String },
}

/// Failure of a hotplug or callback operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RcuError {
    #[error("cpu {cpu} out of range (engine has {num_cpus} CPUs)")]
    NoSuchCpu { cpu: CpuId, num_cpus: usize },
    #[error("cpu {0} is already offline")]
    AlreadyOffline(CpuId),
    #[error("cpu {0} is already online")]
    AlreadyOnline(CpuId),
    #[error("cpu {0} is the last online CPU")]
    LastCpu(CpuId),
    #[error("cpu {0} is offline")]
    CpuOffline(CpuId),
    #[error("cpu {0} is running a task inside a read-side section")]
    ReaderInSection(CpuId),
}
