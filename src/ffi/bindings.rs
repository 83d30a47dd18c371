//! Reverse-engineered ABI of the private kperf/kperfdata frameworks.
//!
//! There are no public headers for these frameworks, so the layouts
//! below are declared by hand. They have been stable since macOS 10.11
//! (kperf wraps `kpc.*` sysctls, kperfdata reads the plist databases
//! under `/usr/share/kpep/`).

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uint, c_void};

use super::KpcConfig;

// kpep error codes, returned by every kpep_config_* / kpep_db_* call.
pub const KPEP_OK: c_int = 0;
pub const KPEP_ERR_CUR_SYSTEM_UNKNOWN: c_int = 5;
pub const KPEP_ERR_DB_PATH_INVALID: c_int = 6;
pub const KPEP_ERR_DB_NOT_FOUND: c_int = 7;
pub const KPEP_ERR_CONFLICTING_EVENTS: c_int = 12;
pub const KPEP_ERR_COUNTERS_NOT_FORCED: c_int = 13;

// KPEP CPU architecture constants.
pub const KPEP_ARCH_I386: u32 = 0;
pub const KPEP_ARCH_X86_64: u32 = 1;
pub const KPEP_ARCH_ARM: u32 = 2;
pub const KPEP_ARCH_ARM64: u32 = 3;

/// KPEP event (size: 48/28 bytes on 64/32 bit OS).
#[repr(C)]
pub struct kpep_event {
    /// Unique name of the event, such as "INST_RETIRED.ANY".
    pub name: *const c_char,
    /// Description for this event.
    pub description: *const c_char,
    /// Errata, currently NULL.
    pub errata: *const c_char,
    /// Alias name, such as "Instructions", "Cycles".
    pub alias: *const c_char,
    /// Fallback event name for fixed counter.
    pub fallback: *const c_char,
    pub mask: u32,
    pub number: u8,
    pub umask: u8,
    pub reserved: u8,
    pub is_fixed: u8,
}

/// KPEP database (size: 144/80 bytes on 64/32 bit OS).
#[repr(C)]
pub struct kpep_db {
    /// Database name, such as "haswell".
    pub name: *const c_char,
    /// Plist name, such as "cpu_7_8_10b282dc".
    pub cpu_id: *const c_char,
    /// Marketing name, such as "Intel Haswell".
    pub marketing_name: *const c_char,
    /// Plist data (CFDataRef), currently NULL.
    pub plist_data: *mut c_void,
    /// All events (CFDict<CFSTR(event_name), kpep_event *>).
    pub event_map: *mut c_void,
    /// Event struct buffer (sizeof(kpep_event) * event_count).
    pub event_arr: *mut kpep_event,
    /// Fixed counter events (sizeof(kpep_event *) * fixed_counter_count).
    pub fixed_event_arr: *mut *mut kpep_event,
    /// All aliases (CFDict<CFSTR(event_name), kpep_event *>).
    pub alias_map: *mut c_void,
    pub reserved_1: usize,
    pub reserved_2: usize,
    pub reserved_3: usize,
    /// All events count.
    pub event_count: usize,
    pub alias_count: usize,
    pub fixed_counter_count: usize,
    pub config_counter_count: usize,
    pub power_counter_count: usize,
    /// See `KPEP_ARCH_*` above.
    pub architecture: u32,
    pub fixed_counter_bits: u32,
    pub config_counter_bits: u32,
    pub power_counter_bits: u32,
}

/// KPEP config (size: 80/44 bytes on 64/32 bit OS).
#[repr(C)]
pub struct kpep_config {
    pub db: *mut kpep_db,
    /// (sizeof(kpep_event *) * counter_count), init NULL.
    pub ev_arr: *mut *mut kpep_event,
    /// (sizeof(usize) * counter_count), init 0.
    pub ev_map: *mut usize,
    /// (sizeof(usize) * counter_count), init -1.
    pub ev_idx: *mut usize,
    /// (sizeof(u32) * counter_count), init 0.
    pub flags: *mut u32,
    /// (sizeof(u64) * counter_count), init 0.
    pub kpc_periods: *mut u64,
    /// kpep_config_events_count()
    pub event_count: usize,
    pub counter_count: usize,
    /// See `KPC_CLASS_*_MASK`.
    pub classes: u32,
    pub config_counter: u32,
    pub power_counter: u32,
    pub reserved: u32,
}

// <kperf.framework>
// Wraps the kpc.* sysctls that talk to the kernel counter machinery.
// Most calls require root privileges, or a "blessed" process.

/// sysctl get(hw.cputype, hw.cpusubtype, hw.cpufamily, machdep.cpu.model).
/// Fills `buf` with the CPU identification string (e.g. "cpu_7_8_10b282dc_46")
/// used to locate the PMC database in /usr/share/kpep. No root required.
pub type kpc_cpu_string = unsafe extern "C" fn(buf: *mut c_char, buf_size: usize) -> c_int;

/// sysctl get(kpc.pmu_version).
pub type kpc_pmu_version = unsafe extern "C" fn() -> u32;

/// sysctl get(kpc.counting). Returns the running class mask, 0 on error.
pub type kpc_get_counting = unsafe extern "C" fn() -> u32;

/// sysctl set(kpc.counting). Pass 0 to shut counting down. 0 on success.
pub type kpc_set_counting = unsafe extern "C" fn(classes: u32) -> c_int;

/// sysctl get(kpc.thread_counting).
pub type kpc_get_thread_counting = unsafe extern "C" fn() -> u32;

/// sysctl set(kpc.thread_counting). 0 on success.
pub type kpc_set_thread_counting = unsafe extern "C" fn(classes: u32) -> c_int;

/// sysctl get(kpc.config_count). No root required.
pub type kpc_get_config_count = unsafe extern "C" fn(classes: u32) -> u32;

/// sysctl get(kpc.config). `config` must hold kpc_get_config_count(classes)
/// entries. 0 on success.
pub type kpc_get_config = unsafe extern "C" fn(classes: u32, config: *mut KpcConfig) -> c_int;

/// sysctl set(kpc.config). 0 on success.
pub type kpc_set_config = unsafe extern "C" fn(classes: u32, config: *mut KpcConfig) -> c_int;

/// sysctl get(kpc.counter_count). No root required.
pub type kpc_get_counter_count = unsafe extern "C" fn(classes: u32) -> u32;

/// sysctl get(kpc.counters). `buf` must hold (cpu_count * counter_count)
/// entries if `all_cpus`, else counter_count. 0 on success.
pub type kpc_get_cpu_counters =
    unsafe extern "C" fn(all_cpus: bool, classes: u32, curcpu: *mut c_int, buf: *mut u64) -> c_int;

/// sysctl get(kpc.thread_counters). `tid` should be 0, `buf_count` is in
/// elements, not bytes. 0 on success.
pub type kpc_get_thread_counters =
    unsafe extern "C" fn(tid: c_uint, buf_count: c_uint, buf: *mut u64) -> c_int;

/// sysctl set(kpc.force_all_ctrs). 1 acquires the counters used by the
/// power manager, 0 releases them. 0 on success.
pub type kpc_force_all_ctrs_set = unsafe extern "C" fn(val: c_int) -> c_int;

/// sysctl get(kpc.force_all_ctrs). 0 on success.
pub type kpc_force_all_ctrs_get = unsafe extern "C" fn(val_out: *mut c_int) -> c_int;

// <kperfdata.framework>
// Access to the local CPU event database. No root required.

/// Create a config scoped to a db.
pub type kpep_config_create =
    unsafe extern "C" fn(db: *mut kpep_db, cfg_ptr: *mut *mut kpep_config) -> c_int;

pub type kpep_config_free = unsafe extern "C" fn(cfg: *mut kpep_config);

/// Add an event to the config. `flag` 0: all, 1: user space only. If the
/// return value is `KPEP_ERR_CONFLICTING_EVENTS`, `err` (nullable) receives
/// the conflicted event index bitmap.
pub type kpep_config_add_event = unsafe extern "C" fn(
    cfg: *mut kpep_config,
    ev_ptr: *mut *mut kpep_event,
    flag: u32,
    err: *mut u32,
) -> c_int;

/// Force all counters for this config.
pub type kpep_config_force_counters = unsafe extern "C" fn(cfg: *mut kpep_config) -> c_int;

pub type kpep_config_events_count =
    unsafe extern "C" fn(cfg: *mut kpep_config, count_ptr: *mut usize) -> c_int;

/// Get kpc register values. `buf_size` in bytes.
pub type kpep_config_kpc =
    unsafe extern "C" fn(cfg: *mut kpep_config, buf: *mut KpcConfig, buf_size: usize) -> c_int;

pub type kpep_config_kpc_count =
    unsafe extern "C" fn(cfg: *mut kpep_config, count_ptr: *mut usize) -> c_int;

pub type kpep_config_kpc_classes =
    unsafe extern "C" fn(cfg: *mut kpep_config, classes_ptr: *mut u32) -> c_int;

/// Get the index mapping from event to counter. `buf_size` in bytes.
pub type kpep_config_kpc_map =
    unsafe extern "C" fn(cfg: *mut kpep_config, buf: *mut usize, buf_size: usize) -> c_int;

/// Open a database in /usr/share/kpep/ or /usr/local/share/kpep/.
/// Pass NULL for the current CPU.
pub type kpep_db_create =
    unsafe extern "C" fn(name: *const c_char, db_ptr: *mut *mut kpep_db) -> c_int;

pub type kpep_db_free = unsafe extern "C" fn(db: *mut kpep_db);

pub type kpep_db_name = unsafe extern "C" fn(db: *mut kpep_db, name: *mut *const c_char) -> c_int;

pub type kpep_db_aliases_count =
    unsafe extern "C" fn(db: *mut kpep_db, count: *mut usize) -> c_int;

/// `buf_size` in bytes, at least aliases_count * size_of::<*const c_char>().
pub type kpep_db_aliases =
    unsafe extern "C" fn(db: *mut kpep_db, buf: *mut *const c_char, buf_size: usize) -> c_int;

/// Counters count for the given classes (1: fixed, 2: configurable).
pub type kpep_db_counters_count =
    unsafe extern "C" fn(db: *mut kpep_db, classes: u8, count: *mut usize) -> c_int;

pub type kpep_db_events_count =
    unsafe extern "C" fn(db: *mut kpep_db, count: *mut usize) -> c_int;

/// `buf_size` in bytes, at least events_count * size_of::<*mut kpep_event>().
pub type kpep_db_events =
    unsafe extern "C" fn(db: *mut kpep_db, buf: *mut *mut kpep_event, buf_size: usize) -> c_int;

/// Look an event up by name.
pub type kpep_db_event = unsafe extern "C" fn(
    db: *mut kpep_db,
    name: *const c_char,
    ev_ptr: *mut *mut kpep_event,
) -> c_int;

pub type kpep_event_name =
    unsafe extern "C" fn(ev: *mut kpep_event, name_ptr: *mut *const c_char) -> c_int;

pub type kpep_event_alias =
    unsafe extern "C" fn(ev: *mut kpep_event, alias_ptr: *mut *const c_char) -> c_int;

pub type kpep_event_description =
    unsafe extern "C" fn(ev: *mut kpep_event, str_ptr: *mut *const c_char) -> c_int;
