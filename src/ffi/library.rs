//! Runtime binding of the two private frameworks.
//!
//! Every entry point is resolved by name into a typed function-pointer
//! table at open time. The binding is all-or-nothing: if either library
//! fails to open or any declared symbol is missing, the whole open fails
//! and no partially-filled table is ever observable.

use std::io::{Error as IoError, Result as IoResult};
use std::sync::{Arc, Mutex};

use libloading::Library;

use super::bindings as b;
use super::KpcConfig;
use crate::error::{BindError, Error, Result};

pub const KPERF_PATH: &str = "/System/Library/PrivateFrameworks/kperf.framework/kperf";
pub const KPERFDATA_PATH: &str =
    "/System/Library/PrivateFrameworks/kperfdata.framework/kperfdata";

macro_rules! symbols {
    ($vis:vis struct $table:ident from $lib_name:literal { $($sym:ident),* $(,)? }) => {
        $vis struct $table {
            $(pub $sym: b::$sym,)*
        }

        impl $table {
            fn load(lib: &Library) -> std::result::Result<Self, BindError> {
                Ok(Self {
                    $($sym: unsafe {
                        *lib.get::<b::$sym>(concat!(stringify!($sym), "\0").as_bytes())
                            .map_err(|_| BindError::MissingSymbol {
                                library: $lib_name,
                                symbol: stringify!($sym),
                            })?
                    },)*
                })
            }
        }
    };
}

symbols! {
    pub(crate) struct KperfFns from "kperf.framework" {
        kpc_cpu_string,
        kpc_pmu_version,
        kpc_get_counting,
        kpc_set_counting,
        kpc_get_thread_counting,
        kpc_set_thread_counting,
        kpc_get_config_count,
        kpc_get_config,
        kpc_set_config,
        kpc_get_counter_count,
        kpc_get_cpu_counters,
        kpc_get_thread_counters,
        kpc_force_all_ctrs_set,
        kpc_force_all_ctrs_get,
    }
}

symbols! {
    pub(crate) struct KpepFns from "kperfdata.framework" {
        kpep_config_create,
        kpep_config_free,
        kpep_config_add_event,
        kpep_config_force_counters,
        kpep_config_events_count,
        kpep_config_kpc,
        kpep_config_kpc_count,
        kpep_config_kpc_classes,
        kpep_config_kpc_map,
        kpep_db_create,
        kpep_db_free,
        kpep_db_name,
        kpep_db_aliases_count,
        kpep_db_aliases,
        kpep_db_counters_count,
        kpep_db_events_count,
        kpep_db_events,
        kpep_db_event,
        kpep_event_name,
        kpep_event_alias,
        kpep_event_description,
    }
}

fn open_lib(path: &'static str) -> std::result::Result<Library, BindError> {
    unsafe { Library::new(path) }.map_err(|source| BindError::LibraryOpen { path, source })
}

/// Ownership of the two opened frameworks plus their resolved function
/// tables. Constructed complete or not at all.
pub struct Binding {
    pub(crate) kperf: KperfFns,
    pub(crate) kpep: KpepFns,
    // The tables borrow from these handles; keep them open for the
    // lifetime of the binding.
    _kperf_lib: Library,
    _kperfdata_lib: Library,
}

static GLOBAL: Mutex<Option<Arc<Binding>>> = Mutex::new(None);

impl Binding {
    /// Opens both frameworks and resolves every declared symbol.
    pub fn open() -> Result<Self> {
        if !cfg!(any(target_os = "macos", target_os = "ios")) {
            return Err(Error::Unsupported);
        }

        let kperf_lib = open_lib(KPERF_PATH)?;
        let kperfdata_lib = open_lib(KPERFDATA_PATH)?;
        let kperf = KperfFns::load(&kperf_lib)?;
        let kpep = KpepFns::load(&kperfdata_lib)?;

        Ok(Self {
            kperf,
            kpep,
            _kperf_lib: kperf_lib,
            _kperfdata_lib: kperfdata_lib,
        })
    }

    /// The process-wide binding.
    ///
    /// A successful bind is cached and returned as-is on later calls; a
    /// failed bind caches nothing, so the next call retries from scratch.
    pub fn global() -> Result<Arc<Self>> {
        let mut slot = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(binding) = slot.as_ref() {
            return Ok(binding.clone());
        }
        let binding = Arc::new(Self::open()?);
        *slot = Some(binding.clone());
        Ok(binding)
    }

    /// Drops the process-wide binding. The libraries close once the last
    /// outstanding [`Arc`] reference (catalogs, sessions) is gone.
    pub fn unbind() {
        let mut slot = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    fn ret(code: libc::c_int) -> IoResult<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(IoError::last_os_error())
        }
    }

    /// PMU version the kernel is running. No root required.
    pub fn pmu_version(&self) -> u32 {
        unsafe { (self.kperf.kpc_pmu_version)() }
    }

    /// CPU identification string (e.g. "cpu_7_8_10b282dc_46"), the key
    /// used to locate the PMC database. No root required.
    pub fn cpu_string(&self) -> IoResult<String> {
        let mut buf = [0u8; 128];
        let len = unsafe { (self.kperf.kpc_cpu_string)(buf.as_mut_ptr() as _, buf.len()) };
        if len < 0 {
            return Err(IoError::last_os_error());
        }
        let bytes = &buf[..(len as usize).min(buf.len())];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// How many counters the given classes expose. No root required.
    pub fn counter_count(&self, classes: u32) -> u32 {
        unsafe { (self.kperf.kpc_get_counter_count)(classes) }
    }

    /// How many config registers the given classes expose. No root required.
    pub fn config_count(&self, classes: u32) -> u32 {
        unsafe { (self.kperf.kpc_get_config_count)(classes) }
    }

    /// Class mask currently counting globally, 0 when counting is off.
    pub fn counting(&self) -> u32 {
        unsafe { (self.kperf.kpc_get_counting)() }
    }

    /// Class mask currently counting for threads, 0 when counting is off.
    pub fn thread_counting(&self) -> u32 {
        unsafe { (self.kperf.kpc_get_thread_counting)() }
    }

    /// Reads back the programmed config registers for the given classes.
    /// `buf` must hold [`config_count`][Self::config_count] entries.
    pub fn config_registers(&self, classes: u32, buf: &mut [KpcConfig]) -> IoResult<()> {
        Self::ret(unsafe { (self.kperf.kpc_get_config)(classes, buf.as_mut_ptr()) })
    }

    /// Reads the per-CPU counter values and returns the CPU the call ran
    /// on. With `all_cpus`, `buf` must hold `cpu_count * counter_count`
    /// entries, otherwise `counter_count`.
    pub fn cpu_counters(&self, all_cpus: bool, classes: u32, buf: &mut [u64]) -> IoResult<i32> {
        let mut curcpu = 0;
        Self::ret(unsafe {
            (self.kperf.kpc_get_cpu_counters)(all_cpus, classes, &mut curcpu, buf.as_mut_ptr())
        })?;
        Ok(curcpu)
    }

    pub(crate) fn set_counting(&self, classes: u32) -> IoResult<()> {
        Self::ret(unsafe { (self.kperf.kpc_set_counting)(classes) })
    }

    pub(crate) fn set_thread_counting(&self, classes: u32) -> IoResult<()> {
        Self::ret(unsafe { (self.kperf.kpc_set_thread_counting)(classes) })
    }

    pub(crate) fn set_config(&self, classes: u32, regs: &mut [KpcConfig]) -> IoResult<()> {
        Self::ret(unsafe { (self.kperf.kpc_set_config)(classes, regs.as_mut_ptr()) })
    }

    pub(crate) fn thread_counters(&self, buf: &mut [u64]) -> IoResult<()> {
        let code =
            unsafe { (self.kperf.kpc_get_thread_counters)(0, buf.len() as _, buf.as_mut_ptr()) };
        Self::ret(code)
    }

    pub(crate) fn force_all_ctrs(&self, on: bool) -> IoResult<()> {
        Self::ret(unsafe { (self.kperf.kpc_force_all_ctrs_set)(on as _) })
    }

    /// Whether the process can query the global ownership flag at all.
    /// This is the cheapest permission probe: it fails for unprivileged
    /// processes without touching any counter state.
    pub(crate) fn force_all_ctrs_held(&self) -> IoResult<bool> {
        let mut val = 0;
        Self::ret(unsafe { (self.kperf.kpc_force_all_ctrs_get)(&mut val) })?;
        Ok(val != 0)
    }
}
