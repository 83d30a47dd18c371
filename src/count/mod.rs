//! The counting session: programs the derived configuration into the
//! kernel and snapshots/differences raw counter values per measurement
//! window.

#[cfg(test)]
mod test;

use std::io::Result as IoResult;
use std::sync::Arc;

use crate::catalog::EventCatalog;
use crate::config::{ConfigBuilder, CounterConfig};
use crate::error::{Error, Result, Stage};
use crate::ffi::library::Binding;
use crate::ffi::{KpcConfig, KPC_CLASS_CONFIGURABLE_MASK, MAX_COUNTERS};
use crate::metric::{self, Metric};

/// The kernel counter control surface.
///
/// One method per operation the session needs; the production
/// implementation is the runtime [`Binding`], tests use a double that
/// never touches the OS.
pub trait CounterControl {
    /// Claims process-wide exclusive ownership of all hardware counters.
    fn acquire_ownership(&self) -> IoResult<()>;

    /// Releases the claim.
    fn release_ownership(&self) -> IoResult<()>;

    /// Whether the ownership flag is currently set. Also doubles as the
    /// permission probe: unprivileged processes cannot even query it.
    fn ownership_held(&self) -> IoResult<bool>;

    /// Writes the register configuration for the given classes.
    fn program(&self, classes: u32, regs: &[KpcConfig]) -> IoResult<()>;

    /// Sets the globally counting classes. `0` disables counting.
    fn set_counting(&self, classes: u32) -> IoResult<()>;

    /// Sets the per-thread counting classes. `0` disables counting.
    fn set_thread_counting(&self, classes: u32) -> IoResult<()>;

    /// Reads the raw counter values for the current thread.
    fn read_thread_counters(&self, buf: &mut [u64]) -> IoResult<()>;
}

impl CounterControl for Binding {
    fn acquire_ownership(&self) -> IoResult<()> {
        self.force_all_ctrs(true)
    }

    fn release_ownership(&self) -> IoResult<()> {
        self.force_all_ctrs(false)
    }

    fn ownership_held(&self) -> IoResult<bool> {
        self.force_all_ctrs_held()
    }

    fn program(&self, classes: u32, regs: &[KpcConfig]) -> IoResult<()> {
        // The sysctl wrapper takes a mutable buffer but only reads it.
        let mut buf = [0 as KpcConfig; MAX_COUNTERS];
        let n = regs.len().min(MAX_COUNTERS);
        buf[..n].copy_from_slice(&regs[..n]);
        self.set_config(classes, &mut buf[..n])
    }

    fn set_counting(&self, classes: u32) -> IoResult<()> {
        Binding::set_counting(self, classes)
    }

    fn set_thread_counting(&self, classes: u32) -> IoResult<()> {
        Binding::set_thread_counting(self, classes)
    }

    fn read_thread_counters(&self, buf: &mut [u64]) -> IoResult<()> {
        self.thread_counters(buf)
    }
}

/// Raw counter values for the current thread at one instant.
#[derive(Clone, Copy)]
pub struct Snapshot(pub(crate) [u64; MAX_COUNTERS]);

impl Snapshot {
    fn zeroed() -> Self {
        Self([0; MAX_COUNTERS])
    }

    pub fn raw(&self) -> &[u64; MAX_COUNTERS] {
        &self.0
    }
}

/// One counted value for one logical metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stat {
    pub metric: Metric,
    pub count: u64,
}

/// Computes per-metric deltas between two snapshots through the counter
/// map: `delta[i] = after[map[i]] - before[map[i]]`.
///
/// Counters are monotonically non-decreasing within one session, so a
/// counter that went backwards is reported as a measurement anomaly
/// rather than silently wrapped or clamped.
pub fn delta(
    before: &Snapshot,
    after: &Snapshot,
    metrics: &[Metric],
    counter_map: &[usize],
) -> Result<Vec<Stat>> {
    metrics
        .iter()
        .zip(counter_map)
        .map(|(&metric, &slot)| {
            let (b, a) = (before.0[slot], after.0[slot]);
            match a.checked_sub(b) {
                Some(count) => Ok(Stat { metric, count }),
                None => Err(Error::CounterRegression {
                    metric,
                    before: b,
                    after: a,
                }),
            }
        })
        .collect()
}

/// Session lifecycle. Transitions are strictly linear; nothing reverts
/// to `Uninitialized` except full teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Configured,
    Counting,
    Stopped,
}

/// A counting session over one derived configuration.
///
/// Exactly one measurement window is open at a time and counting is
/// scoped to the calling thread. The configuration and counter map are
/// built once at [`init`][Session::init] and reused across every
/// start/stop cycle.
pub struct Session<C: CounterControl = Binding> {
    control: Arc<C>,
    config: CounterConfig,
    metrics: Vec<Metric>,
    catalog: Option<EventCatalog>,
    state: State,
    owned: bool,
    programmed: bool,
    retain_ownership: bool,
    before: Snapshot,
    after: Snapshot,
}

impl Session {
    /// Binds the frameworks, loads the catalog for the running CPU,
    /// resolves the metrics, and derives the counter configuration.
    ///
    /// On success the session is `Configured` and holds exclusive counter
    /// ownership. On failure nothing is left claimed.
    pub fn init(metrics: &[Metric]) -> Result<Self> {
        let binding = Binding::global()?;

        // Cheap permission probe before touching anything: unprivileged
        // processes cannot query the ownership flag.
        let held = binding.ownership_held().map_err(|_| Error::PermissionDenied)?;
        if held {
            return Err(Error::AlreadyOwned);
        }

        let catalog = EventCatalog::open_current_cpu()?;
        let resolved = metric::resolve(&catalog, metrics)?;

        let mut builder = ConfigBuilder::new(&catalog)?;
        builder.force_ownership()?;
        for event in &resolved {
            builder.add(event)?;
        }
        let config = builder.build()?;
        drop(resolved);

        // Last fallible step, so a failed init never leaves the claim
        // behind.
        binding.acquire_ownership().map_err(|source| Error::Kernel {
            stage: Stage::AcquireOwnership,
            source,
        })?;

        Ok(Session {
            control: binding,
            config,
            metrics: metrics.to_vec(),
            catalog: Some(catalog),
            state: State::Configured,
            owned: true,
            programmed: false,
            retain_ownership: false,
            before: Snapshot::zeroed(),
            after: Snapshot::zeroed(),
        })
    }

    /// Fully destructive teardown: disables counting, releases ownership,
    /// discards catalog and configuration, and drops the process-wide
    /// library binding.
    pub fn teardown(self) {
        drop(self);
        Binding::unbind();
    }
}

impl<C: CounterControl> Session<C> {
    /// Assembles a session in `Configured` state from already-derived
    /// parts. `owned` mirrors whether counter ownership is already held.
    pub(crate) fn from_parts(
        control: Arc<C>,
        config: CounterConfig,
        metrics: Vec<Metric>,
        owned: bool,
    ) -> Self {
        Self {
            control,
            config,
            metrics,
            catalog: None,
            state: State::Configured,
            owned,
            programmed: false,
            retain_ownership: false,
            before: Snapshot::zeroed(),
            after: Snapshot::zeroed(),
        }
    }

    /// Keep counter ownership across stop/start cycles instead of
    /// releasing it on every stop. Skips re-acquisition and register
    /// re-programming on restart.
    pub fn retain_ownership(&mut self, on: bool) {
        self.retain_ownership = on;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// The catalog the session resolved against, if it owns one.
    pub fn catalog(&self) -> Option<&EventCatalog> {
        self.catalog.as_ref()
    }

    fn snapshot(&self, stage: Stage) -> Result<Snapshot> {
        let mut snap = Snapshot::zeroed();
        self.control
            .read_thread_counters(&mut snap.0)
            .map_err(|source| Error::Read { stage, source })?;
        Ok(snap)
    }

    /// Opens a measurement window: re-acquires ownership if it was
    /// released, programs the registers if needed, enables global and
    /// per-thread counting, and takes the "before" snapshot.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            State::Configured | State::Stopped => {}
            state => {
                return Err(Error::InvalidState { op: "start", state });
            }
        }

        let classes = self.config.classes();

        if !self.owned {
            self.control
                .acquire_ownership()
                .map_err(|source| Error::Kernel {
                    stage: Stage::AcquireOwnership,
                    source,
                })?;
            self.owned = true;
            // The kernel may have reprogrammed the registers while the
            // claim was released.
            self.programmed = false;
        }

        if !self.programmed {
            let regs = self.config.registers();
            if classes & KPC_CLASS_CONFIGURABLE_MASK != 0 && !regs.is_empty() {
                self.control
                    .program(classes, regs)
                    .map_err(|source| Error::Kernel {
                        stage: Stage::ProgramRegisters,
                        source,
                    })?;
            }
            self.programmed = true;
        }

        self.control
            .set_counting(classes)
            .map_err(|source| Error::Kernel {
                stage: Stage::EnableCounting,
                source,
            })?;

        if let Err(source) = self.control.set_thread_counting(classes) {
            let _ = self.control.set_counting(0);
            return Err(Error::Kernel {
                stage: Stage::EnableThreadCounting,
                source,
            });
        }

        match self.snapshot(Stage::SnapshotBefore) {
            Ok(snap) => self.before = snap,
            Err(e) => {
                let _ = self.control.set_thread_counting(0);
                let _ = self.control.set_counting(0);
                return Err(e);
            }
        }

        self.state = State::Counting;
        Ok(())
    }

    /// Closes the measurement window and returns the per-metric deltas.
    ///
    /// The "after" snapshot is taken before counting is disabled, so the
    /// window never misses events to the disable path.
    pub fn stop(&mut self) -> Result<Vec<Stat>> {
        if self.state != State::Counting {
            return Err(Error::InvalidState {
                op: "stop",
                state: self.state,
            });
        }

        self.after = self.snapshot(Stage::SnapshotAfter)?;

        self.control
            .set_thread_counting(0)
            .map_err(|source| Error::Kernel {
                stage: Stage::DisableThreadCounting,
                source,
            })?;
        self.control
            .set_counting(0)
            .map_err(|source| Error::Kernel {
                stage: Stage::DisableCounting,
                source,
            })?;

        if !self.retain_ownership {
            self.control
                .release_ownership()
                .map_err(|source| Error::Kernel {
                    stage: Stage::ReleaseOwnership,
                    source,
                })?;
            self.owned = false;
            self.programmed = false;
        }

        self.state = State::Stopped;
        delta(
            &self.before,
            &self.after,
            &self.metrics,
            self.config.counter_map(),
        )
    }

    /// Sequences start, the caller-supplied work, and stop.
    pub fn run<T>(&mut self, work: impl FnOnce() -> T) -> Result<(T, Vec<Stat>)> {
        self.start()?;
        let value = work();
        let stats = self.stop()?;
        Ok((value, stats))
    }
}

impl<C: CounterControl> Drop for Session<C> {
    fn drop(&mut self) {
        // Never leave counting enabled or the claim held.
        if self.state == State::Counting {
            let _ = self.control.set_thread_counting(0);
            let _ = self.control.set_counting(0);
        }
        if self.owned {
            let _ = self.control.release_ownership();
            self.owned = false;
        }
    }
}
