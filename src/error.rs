use std::io;

use thiserror::Error;

use crate::metric::Metric;

/// Description table for kpep error codes, same order as the codes
/// returned by kperfdata.
pub(crate) const KPEP_ERR_DESC: [&str; 16] = [
    "none",
    "invalid argument",
    "out of memory",
    "I/O",
    "buffer too small",
    "current system unknown",
    "database path invalid",
    "database not found",
    "database architecture unsupported",
    "database version unsupported",
    "database corrupt",
    "event not found",
    "conflicting events",
    "all counters must be forced",
    "event unavailable",
    "check errno",
];

pub(crate) fn kpep_desc(code: i32) -> &'static str {
    match usize::try_from(code) {
        Ok(n) if n < KPEP_ERR_DESC.len() => KPEP_ERR_DESC[n],
        _ => "unknown error",
    }
}

/// Library or symbol resolution failure.
///
/// The binding is all-or-nothing, so this error implies no function
/// pointer from either framework remains bound.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to load {path}: {source}")]
    LibraryOpen {
        path: &'static str,
        source: libloading::Error,
    },

    #[error("failed to resolve `{symbol}` in {library}")]
    MissingSymbol {
        library: &'static str,
        symbol: &'static str,
    },
}

/// Performance-event database failure.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// kperfdata has no database matching the running CPU.
    #[error("no event database for the current CPU")]
    NoDatabaseForCpu,

    /// The database exists but kperfdata refused to load it.
    #[error("event database rejected: {}", kpep_desc(*.0))]
    Rejected(i32),
}

/// Configuration derivation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Two events contend for the same physical counter. The bitmap
    /// holds the offending event indices, e.g. `1 << 2` means index 2.
    #[error("conflicting events, index bitmap {bitmap:#x}")]
    ConflictingEvents { bitmap: u32 },

    /// Register values were requested before forcing counter ownership.
    #[error("all counters must be forced before deriving registers")]
    CountersNotForced,

    /// The derived counter map addresses a slot outside the declared
    /// classes, or maps two distinct events to one slot.
    #[error("counter map entry {index} -> slot {slot} is inconsistent with {counters} counters")]
    InconsistentMap {
        index: usize,
        slot: usize,
        counters: usize,
    },

    #[error("kpep config call failed: {}", kpep_desc(*.0))]
    Kpep(i32),
}

/// The failing kernel call during a session transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    ProgramRegisters,
    EnableCounting,
    EnableThreadCounting,
    DisableCounting,
    DisableThreadCounting,
    AcquireOwnership,
    ReleaseOwnership,
    SnapshotBefore,
    SnapshotAfter,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::ProgramRegisters => "program registers",
            Stage::EnableCounting => "enable counting",
            Stage::EnableThreadCounting => "enable thread counting",
            Stage::DisableCounting => "disable counting",
            Stage::DisableThreadCounting => "disable thread counting",
            Stage::AcquireOwnership => "acquire counter ownership",
            Stage::ReleaseOwnership => "release counter ownership",
            Stage::SnapshotBefore => "read before-snapshot",
            Stage::SnapshotAfter => "read after-snapshot",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// No candidate event resolved for the named metric. Resolution of
    /// the remaining metrics was discarded.
    #[error("no event found for metric `{0}` in the current CPU database")]
    UnresolvedMetric(Metric),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The caller lacks the rights to claim the counters (xnu/kpc
    /// requires root or a blessed process). Distinguished from
    /// [`Config`][Self::Config]: this is not a configuration bug.
    #[error("permission denied, xnu/kpc requires root privileges")]
    PermissionDenied,

    /// Counter ownership is held by another configuration. The claim
    /// fails deterministically instead of blocking.
    #[error("hardware counters are already claimed elsewhere")]
    AlreadyOwned,

    /// A kernel call failed while moving the session between states.
    #[error("kernel call failed: {stage}")]
    Kernel { stage: Stage, source: io::Error },

    /// A counter snapshot read failed. The transition is aborted.
    #[error("counter read failed: {stage}")]
    Read { stage: Stage, source: io::Error },

    /// A counter went backwards between the before and after snapshots.
    /// Counters are monotonic within one session, so this indicates a
    /// reset outside the session's control.
    #[error("counter for `{metric}` went backwards ({before} -> {after})")]
    CounterRegression {
        metric: Metric,
        before: u64,
        after: u64,
    },

    /// The session was not in a state that allows the operation.
    #[error("cannot {op} a session in {state:?} state")]
    InvalidState {
        op: &'static str,
        state: crate::count::State,
    },

    /// The private frameworks only exist on macOS.
    #[error("kperf/kperfdata are not available on this platform")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, Error>;
