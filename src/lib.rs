//! High-level wrapper for the private xnu `kperf`/`kperfdata` frameworks.
//!
//! Counts hardware performance events (cycles, instructions, branches,
//! branch misses) for the current thread on macOS, the way
//! Instruments does internally. The frameworks are loaded at runtime,
//! the event database shipped with the OS picks the right events for
//! the running CPU, and the kernel counter state is driven through a
//! small session state machine.
//!
//! ## Example
//!
//! Count how many instructions the (inefficient) fibonacci calculation
//! retires. Requires root: xnu refuses counter ownership otherwise.
//!
//! ```rust,no_run
//! use xnu_kpc::count::Session;
//! use xnu_kpc::metric::Metric;
//!
//! let mut session = Session::init(&Metric::ALL).unwrap();
//!
//! fn fib(n: usize) -> usize {
//!     match n {
//!         0 => 0,
//!         1 => 1,
//!         n => fib(n - 1) + fib(n - 2),
//!     }
//! }
//!
//! let (_, stats) = session.run(|| std::hint::black_box(fib(30))).unwrap();
//! for stat in stats {
//!     println!("{}: {}", stat.metric, stat.count);
//! }
//! ```
//!
//! ## Platform compatibility
//!
//! The counting path only works on macOS (and jailbroken iOS); the
//! frameworks do not exist elsewhere and binding them returns
//! [`Error::Unsupported`]. The crate itself compiles on any platform,
//! and everything that does not touch the kernel (metric resolution,
//! configuration checks, delta accounting) works everywhere.

pub mod catalog;
pub mod config;
pub mod count;
mod error;
mod ffi;
pub mod metric;

pub use error::{BindError, CatalogError, ConfigError, Error, Result, Stage};
pub use ffi::library::Binding;
pub use ffi::{
    KpcConfig, KPC_CLASS_CONFIGURABLE_MASK, KPC_CLASS_FIXED_MASK, KPC_CLASS_POWER_MASK,
    KPC_CLASS_RAWPMU_MASK, MAX_COUNTERS,
};
