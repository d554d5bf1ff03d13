//! Engine configuration.
//!
//! The tree shape and flavor are fixed when an [`RcuState`](crate::RcuState)
//! is constructed. Values may come from code or from the environment:
//! - `FRANKENRCU_CPUS`: number of simulated CPUs (default 4).
//! - `FRANKENRCU_FANOUT`: children per interior node (default 64).
//! - `FRANKENRCU_LEAF_FANOUT`: CPUs per leaf node (default 64).
//! - `FRANKENRCU_FLAVOR`: `preempt` (default with the `preempt` feature) or
//!   `classic`.
//! - `FRANKENRCU_TRACE`: capacity of the protocol trace ring (default 0, off).

use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ConfigError;

/// Largest supported CPU count.
pub const MAX_CPUS: usize = 4096;

/// Largest supported fan-out; node masks are 64-bit.
pub const MAX_FANOUT: usize = 64;

/// Which grace-period flavor an engine instance implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Flavor {
    /// Readers may be preempted; preempted readers are tracked on per-node
    /// blocked lists and hold up the grace period.
    Preemptible,
    /// Readers may not be preempted; a context switch is itself a quiescent
    /// state and no blocked lists exist.
    Classic,
}

impl Default for Flavor {
    fn default() -> Self {
        if cfg!(feature = "preempt") {
            Self::Preemptible
        } else {
            Self::Classic
        }
    }
}

impl Flavor {
    /// Parse from string (case-insensitive). Unknown names map to the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "preempt" | "preemptible" | "tree_preempt" => Self::Preemptible,
            "classic" | "sched" | "tree" => Self::Classic,
            _ => Self::default(),
        }
    }

    /// Returns true if readers may be switched out mid-section.
    #[must_use]
    pub const fn allows_preempted_readers(self) -> bool {
        matches!(self, Self::Preemptible)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preemptible => "preemptible",
            Self::Classic => "classic",
        }
    }
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static ENV_FLAVOR: OnceLock<Flavor> = OnceLock::new();

/// Process-wide flavor from `FRANKENRCU_FLAVOR`, read on first use and
/// cached. Unset or unknown values give the compiled-in default.
#[must_use]
pub fn flavor_from_env() -> Flavor {
    *ENV_FLAVOR.get_or_init(|| flavor_from_lookup(|key| std::env::var(key).ok()))
}

fn flavor_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Flavor {
    lookup("FRANKENRCU_FLAVOR").map_or_else(Flavor::default, |v| Flavor::from_str_loose(&v))
}

/// Shape and tuning of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcuConfig {
    pub num_cpus: usize,
    /// Children per interior node.
    pub fanout: usize,
    /// CPUs per leaf node.
    pub leaf_fanout: usize,
    pub flavor: Flavor,
    /// `try_lock` attempts on the expedited mutex before falling back to a
    /// normal grace period.
    pub exp_retry_limit: u32,
    /// Backoff unit between expedited attempts; the sleep is
    /// `unit * attempt * online_cpus`.
    pub exp_backoff_unit: Duration,
    /// How long a grace-period waiter sleeps between forcing passes.
    pub fqs_interval: Duration,
    /// Waiting longer than this on one grace period records a stall.
    pub stall_timeout: Duration,
    /// Trace ring capacity; 0 disables tracing.
    pub trace_capacity: usize,
    /// Callbacks invoked per `process_callbacks` batch.
    pub blimit: usize,
    /// Queue length above which a batch is unlimited.
    pub qhimark: usize,
    /// Before the scheduler runs there is one task and `synchronize` is a
    /// no-op.
    pub scheduler_active: bool,
}

impl Default for RcuConfig {
    fn default() -> Self {
        Self {
            num_cpus: 4,
            fanout: MAX_FANOUT,
            leaf_fanout: MAX_FANOUT,
            flavor: Flavor::default(),
            exp_retry_limit: 10,
            exp_backoff_unit: Duration::from_micros(1),
            fqs_interval: Duration::from_millis(1),
            stall_timeout: Duration::from_secs(10),
            trace_capacity: 0,
            blimit: 10,
            qhimark: 10_000,
            scheduler_active: false,
        }
    }
}

impl RcuConfig {
    /// Tree of `num_cpus` CPUs with the same fan-out at every level.
    #[must_use]
    pub fn with_cpus(num_cpus: usize, fanout: usize) -> Self {
        Self {
            num_cpus,
            fanout,
            leaf_fanout: fanout,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    #[must_use]
    pub fn scheduler_active(mut self, active: bool) -> Self {
        self.scheduler_active = active;
        self
    }

    #[must_use]
    pub fn trace_capacity(mut self, capacity: usize) -> Self {
        self.trace_capacity = capacity;
        self
    }

    #[must_use]
    pub fn fqs_interval(mut self, interval: Duration) -> Self {
        self.fqs_interval = interval;
        self
    }

    /// Defaults overridden by the `FRANKENRCU_*` environment variables.
    ///
    /// Missing variables keep their defaults; malformed numbers are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("FRANKENRCU_CPUS") {
            cfg.num_cpus = parse_usize("FRANKENRCU_CPUS", &v)?;
        }
        if let Some(v) = lookup("FRANKENRCU_FANOUT") {
            cfg.fanout = parse_usize("FRANKENRCU_FANOUT", &v)?;
        }
        if let Some(v) = lookup("FRANKENRCU_LEAF_FANOUT") {
            cfg.leaf_fanout = parse_usize("FRANKENRCU_LEAF_FANOUT", &v)?;
        }
        cfg.flavor = flavor_from_lookup(&lookup);
        if let Some(v) = lookup("FRANKENRCU_TRACE") {
            cfg.trace_capacity = parse_usize("FRANKENRCU_TRACE", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject shapes the tree cannot represent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.num_cpus > MAX_CPUS {
            return Err(ConfigError::TooManyCpus {
                requested: self.num_cpus,
                max: MAX_CPUS,
            });
        }
        for (name, value) in [("fanout", self.fanout), ("leaf_fanout", self.leaf_fanout)] {
            if !(2..=MAX_FANOUT).contains(&value) {
                return Err(ConfigError::FanoutOutOfRange { name, value });
            }
        }
        if self.fqs_interval.is_zero() {
            return Err(ConfigError::ZeroValue("fqs_interval"));
        }
        if self.blimit == 0 {
            return Err(ConfigError::ZeroValue("blimit"));
        }
        Ok(())
    }
}

fn parse_usize(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::BadEnv {
            var,
            value: raw.to_string(),
        })
}
