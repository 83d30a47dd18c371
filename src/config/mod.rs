//! Lowering resolved events into a hardware register configuration.

#[cfg(test)]
mod test;

use std::ptr;

use crate::catalog::EventCatalog;
use crate::error::{ConfigError, Result};
use crate::ffi::bindings as b;
use crate::ffi::{KpcConfig, MAX_COUNTERS};
use crate::metric::ResolvedEvent;

fn cfg_err(code: libc::c_int) -> ConfigError {
    match code {
        b::KPEP_ERR_COUNTERS_NOT_FORCED => ConfigError::CountersNotForced,
        code => ConfigError::Kpep(code),
    }
}

/// The derived hardware configuration for one session.
///
/// Immutable once built; a new configuration requires a fresh
/// [`ConfigBuilder`].
#[derive(Clone, Debug)]
pub struct CounterConfig {
    classes: u32,
    regs: Vec<KpcConfig>,
    counter_map: Vec<usize>,
    counter_count: usize,
}

impl CounterConfig {
    pub(crate) fn from_parts(
        classes: u32,
        regs: Vec<KpcConfig>,
        counter_map: Vec<usize>,
        counter_count: usize,
    ) -> Self {
        Self {
            classes,
            regs,
            counter_map,
            counter_count,
        }
    }

    /// Bitmask of counter classes in use (`KPC_CLASS_*_MASK`).
    pub fn classes(&self) -> u32 {
        self.classes
    }

    /// Register values to program, one per config register.
    pub fn registers(&self) -> &[KpcConfig] {
        &self.regs
    }

    /// `counter_map[logical_index] -> physical counter slot`.
    pub fn counter_map(&self) -> &[usize] {
        &self.counter_map
    }

    /// Total counters addressable by the declared classes.
    pub fn counter_count(&self) -> usize {
        self.counter_count
    }
}

// The derived map must be internally consistent with the class bitmask:
// every slot lies inside the counter range the classes declare (and
// inside the fixed snapshot width), and no two *different* events land
// on one slot (two metrics resolved to the same event legitimately
// share).
pub(crate) fn check_map<T: PartialEq>(
    map: &[usize],
    events: &[T],
    counters: usize,
) -> std::result::Result<(), ConfigError> {
    for (index, &slot) in map.iter().enumerate() {
        if slot >= counters.min(MAX_COUNTERS) {
            return Err(ConfigError::InconsistentMap {
                index,
                slot,
                counters,
            });
        }
        for prev in 0..index {
            if map[prev] == slot && events[prev] != events[index] {
                return Err(ConfigError::InconsistentMap {
                    index,
                    slot,
                    counters,
                });
            }
        }
    }
    Ok(())
}

/// Accumulates resolved events into a kpep config and derives the
/// register values, class bitmask, and counter map.
pub struct ConfigBuilder<'a> {
    catalog: &'a EventCatalog,
    cfg: *mut b::kpep_config,
    events: Vec<*mut b::kpep_event>,
    forced: bool,
}

impl<'a> ConfigBuilder<'a> {
    /// Creates a configuration scoped to the catalog.
    pub fn new(catalog: &'a EventCatalog) -> Result<Self> {
        let mut cfg = ptr::null_mut();
        let code =
            unsafe { (catalog.binding().kpep.kpep_config_create)(catalog.db_ptr(), &mut cfg) };
        if code != b::KPEP_OK {
            return Err(cfg_err(code).into());
        }
        Ok(Self {
            catalog,
            cfg,
            events: vec![],
            forced: false,
        })
    }

    /// Forces exclusive ownership of all hardware counters for this
    /// configuration. Required before any register values can be derived.
    pub fn force_ownership(&mut self) -> Result<()> {
        let code = unsafe { (self.catalog.binding().kpep.kpep_config_force_counters)(self.cfg) };
        if code != b::KPEP_OK {
            return Err(cfg_err(code).into());
        }
        self.forced = true;
        Ok(())
    }

    /// Adds one resolved event. Order is stable: the logical index of the
    /// event in the final counter map is its insertion order here.
    pub fn add(&mut self, resolved: &ResolvedEvent<'a>) -> Result<()> {
        let mut ev = resolved.event.as_ptr();
        let mut conflict = 0u32;
        let code = unsafe {
            (self.catalog.binding().kpep.kpep_config_add_event)(self.cfg, &mut ev, 0, &mut conflict)
        };
        match code {
            b::KPEP_OK => {
                self.events.push(resolved.event.as_ptr());
                Ok(())
            }
            b::KPEP_ERR_CONFLICTING_EVENTS => {
                Err(ConfigError::ConflictingEvents { bitmap: conflict }.into())
            }
            code => Err(cfg_err(code).into()),
        }
    }

    /// Derives the class bitmask, register values, and counter map, then
    /// cross-checks them before yielding the immutable configuration.
    pub fn build(self) -> Result<CounterConfig> {
        if !self.forced {
            return Err(ConfigError::CountersNotForced.into());
        }

        let kpep = &self.catalog.binding().kpep;

        let mut classes = 0u32;
        let code = unsafe { (kpep.kpep_config_kpc_classes)(self.cfg, &mut classes) };
        if code != b::KPEP_OK {
            return Err(cfg_err(code).into());
        }

        let mut reg_count = 0usize;
        let code = unsafe { (kpep.kpep_config_kpc_count)(self.cfg, &mut reg_count) };
        if code != b::KPEP_OK {
            return Err(cfg_err(code).into());
        }

        let mut regs = [0 as KpcConfig; MAX_COUNTERS];
        let code =
            unsafe { (kpep.kpep_config_kpc)(self.cfg, regs.as_mut_ptr(), size_of_val(&regs)) };
        if code != b::KPEP_OK {
            return Err(cfg_err(code).into());
        }

        let mut map = [0usize; MAX_COUNTERS];
        let code =
            unsafe { (kpep.kpep_config_kpc_map)(self.cfg, map.as_mut_ptr(), size_of_val(&map)) };
        if code != b::KPEP_OK {
            return Err(cfg_err(code).into());
        }

        let mut event_count = 0usize;
        let code = unsafe { (kpep.kpep_config_events_count)(self.cfg, &mut event_count) };
        if code != b::KPEP_OK {
            return Err(cfg_err(code).into());
        }

        let counter_count = self.catalog.binding().counter_count(classes) as usize;
        let map = map[..event_count.min(MAX_COUNTERS)].to_vec();
        check_map(&map, &self.events, counter_count)?;

        Ok(CounterConfig::from_parts(
            classes,
            regs[..reg_count.min(MAX_COUNTERS)].to_vec(),
            map,
            counter_count,
        ))
    }
}

impl Drop for ConfigBuilder<'_> {
    fn drop(&mut self) {
        unsafe { (self.catalog.binding().kpep.kpep_config_free)(self.cfg) };
    }
}
