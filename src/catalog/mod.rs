//! The per-CPU performance-event database.
//!
//! kperfdata selects a plist under `/usr/share/kpep/` keyed by the CPU
//! identification string and exposes it as an event catalog. Loading the
//! catalog does not require root.

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

use libc::c_char;

use crate::error::{CatalogError, Result};
use crate::ffi::bindings as b;
use crate::ffi::library::Binding;

/// CPU architecture tag of a catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    I386,
    X86_64,
    Arm,
    Arm64,
    Unknown(u32),
}

impl From<u32> for Arch {
    fn from(value: u32) -> Self {
        match value {
            b::KPEP_ARCH_I386 => Arch::I386,
            b::KPEP_ARCH_X86_64 => Arch::X86_64,
            b::KPEP_ARCH_ARM => Arch::Arm,
            b::KPEP_ARCH_ARM64 => Arch::Arm64,
            other => Arch::Unknown(other),
        }
    }
}

// Lossy on purpose: the database strings are ASCII in practice.
unsafe fn opt_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// An immutable, read-only view of the event database loaded for the
/// running CPU.
///
/// The catalog keeps the framework binding alive and frees the underlying
/// database on drop.
pub struct EventCatalog {
    binding: Arc<Binding>,
    db: *mut b::kpep_db,
}

impl EventCatalog {
    /// Loads the catalog matching the running CPU.
    ///
    /// The database is selected by kperfdata itself (the NULL-name form of
    /// `kpep_db_create`); there is no caller-supplied selector.
    pub fn open_current_cpu() -> Result<Self> {
        let binding = Binding::global()?;
        let mut db = ptr::null_mut();
        let code = unsafe { (binding.kpep.kpep_db_create)(ptr::null(), &mut db) };
        match code {
            b::KPEP_OK => Ok(Self { binding, db }),
            b::KPEP_ERR_CUR_SYSTEM_UNKNOWN
            | b::KPEP_ERR_DB_PATH_INVALID
            | b::KPEP_ERR_DB_NOT_FOUND => Err(CatalogError::NoDatabaseForCpu.into()),
            code => Err(CatalogError::Rejected(code).into()),
        }
    }

    pub(crate) fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    pub(crate) fn db_ptr(&self) -> *mut b::kpep_db {
        self.db
    }

    /// Database name, such as "haswell" or "a14".
    pub fn name(&self) -> &str {
        let mut name = ptr::null();
        let code = unsafe { (self.binding.kpep.kpep_db_name)(self.db, &mut name) };
        if code != b::KPEP_OK {
            return "";
        }
        unsafe { opt_str(name) }.unwrap_or("")
    }

    /// Plist name, such as "cpu_7_8_10b282dc".
    pub fn cpu_id(&self) -> &str {
        unsafe { opt_str((*self.db).cpu_id) }.unwrap_or("")
    }

    /// Marketing name, such as "Intel Haswell".
    pub fn marketing_name(&self) -> &str {
        unsafe { opt_str((*self.db).marketing_name) }.unwrap_or("")
    }

    pub fn architecture(&self) -> Arch {
        unsafe { (*self.db).architecture }.into()
    }

    pub fn fixed_counter_count(&self) -> usize {
        unsafe { (*self.db).fixed_counter_count }
    }

    pub fn config_counter_count(&self) -> usize {
        unsafe { (*self.db).config_counter_count }
    }

    pub fn power_counter_count(&self) -> usize {
        unsafe { (*self.db).power_counter_count }
    }

    pub fn fixed_counter_bits(&self) -> u32 {
        unsafe { (*self.db).fixed_counter_bits }
    }

    pub fn config_counter_bits(&self) -> u32 {
        unsafe { (*self.db).config_counter_bits }
    }

    pub fn event_count(&self) -> usize {
        unsafe { (*self.db).event_count }
    }

    /// Counters available for the given class mask (1: fixed,
    /// 2: configurable), as reported by the database.
    pub fn counters_for_classes(&self, classes: u8) -> Result<usize> {
        let mut count = 0;
        let code =
            unsafe { (self.binding.kpep.kpep_db_counters_count)(self.db, classes, &mut count) };
        if code != b::KPEP_OK {
            return Err(CatalogError::Rejected(code).into());
        }
        Ok(count)
    }

    /// Looks an event up by its machine-specific name.
    pub fn find_by_name(&self, name: &str) -> Option<EventRef<'_>> {
        let name = CString::new(name).ok()?;
        let mut ev = ptr::null_mut();
        let code = unsafe { (self.binding.kpep.kpep_db_event)(self.db, name.as_ptr(), &mut ev) };
        (code == b::KPEP_OK && !ev.is_null()).then(|| EventRef {
            binding: &self.binding,
            ev,
            _catalog: PhantomData,
        })
    }

    /// Every event in the catalog. Diagnostic surface; counting sessions
    /// only need [`find_by_name`][Self::find_by_name].
    pub fn events(&self) -> Result<Vec<EventRef<'_>>> {
        let mut count = 0;
        let code = unsafe { (self.binding.kpep.kpep_db_events_count)(self.db, &mut count) };
        if code != b::KPEP_OK {
            return Err(CatalogError::Rejected(code).into());
        }

        let mut buf: Vec<*mut b::kpep_event> = vec![ptr::null_mut(); count];
        let size = count * size_of::<*mut b::kpep_event>();
        let code = unsafe { (self.binding.kpep.kpep_db_events)(self.db, buf.as_mut_ptr(), size) };
        if code != b::KPEP_OK {
            return Err(CatalogError::Rejected(code).into());
        }

        Ok(buf
            .into_iter()
            .filter(|ev| !ev.is_null())
            .map(|ev| EventRef {
                binding: &self.binding,
                ev,
                _catalog: PhantomData,
            })
            .collect())
    }

    /// Every alias name in the catalog. Diagnostic surface.
    pub fn aliases(&self) -> Result<Vec<String>> {
        let mut count = 0;
        let code = unsafe { (self.binding.kpep.kpep_db_aliases_count)(self.db, &mut count) };
        if code != b::KPEP_OK {
            return Err(CatalogError::Rejected(code).into());
        }

        let mut buf: Vec<*const c_char> = vec![ptr::null(); count];
        let size = count * size_of::<*const c_char>();
        let code = unsafe { (self.binding.kpep.kpep_db_aliases)(self.db, buf.as_mut_ptr(), size) };
        if code != b::KPEP_OK {
            return Err(CatalogError::Rejected(code).into());
        }

        Ok(buf
            .into_iter()
            .filter_map(|p| unsafe { opt_str(p) }.map(str::to_owned))
            .collect())
    }
}

impl Drop for EventCatalog {
    fn drop(&mut self) {
        unsafe { (self.binding.kpep.kpep_db_free)(self.db) };
    }
}

/// One event record inside a loaded catalog.
#[derive(Clone, Copy)]
pub struct EventRef<'a> {
    binding: &'a Binding,
    ev: *mut b::kpep_event,
    _catalog: PhantomData<&'a EventCatalog>,
}

impl EventRef<'_> {
    pub(crate) fn as_ptr(&self) -> *mut b::kpep_event {
        self.ev
    }

    /// Unique machine-specific name, such as "INST_RETIRED.ANY".
    pub fn name(&self) -> &str {
        let mut name = ptr::null();
        let code = unsafe { (self.binding.kpep.kpep_event_name)(self.ev, &mut name) };
        if code != b::KPEP_OK {
            return "";
        }
        unsafe { opt_str(name) }.unwrap_or("")
    }

    pub fn description(&self) -> Option<&str> {
        let mut desc = ptr::null();
        let code = unsafe { (self.binding.kpep.kpep_event_description)(self.ev, &mut desc) };
        if code != b::KPEP_OK {
            return None;
        }
        unsafe { opt_str(desc) }
    }

    /// Alias name, such as "Instructions" or "Cycles".
    pub fn alias(&self) -> Option<&str> {
        let mut alias = ptr::null();
        let code = unsafe { (self.binding.kpep.kpep_event_alias)(self.ev, &mut alias) };
        if code != b::KPEP_OK {
            return None;
        }
        unsafe { opt_str(alias) }
    }

    /// Fallback event name, used when a fixed counter has no
    /// general-purpose substitute.
    pub fn fallback(&self) -> Option<&str> {
        unsafe { opt_str((*self.ev).fallback) }
    }

    /// Whether the event is bound to a fixed (non-programmable) counter.
    pub fn is_fixed(&self) -> bool {
        unsafe { (*self.ev).is_fixed != 0 }
    }

    /// The raw mask/number/unit-mask triple programmed into hardware.
    pub fn selector(&self) -> (u32, u8, u8) {
        let ev = unsafe { &*self.ev };
        (ev.mask, ev.number, ev.umask)
    }
}
