use super::{check_map, CounterConfig};
use crate::error::ConfigError;
use crate::ffi::{KPC_CLASS_CONFIGURABLE_MASK, KPC_CLASS_FIXED_MASK, MAX_COUNTERS};

// Event identities for the map check; the builder uses raw kpep_event
// pointers the same way.
const A: u32 = 0;
const B: u32 = 1;
const C: u32 = 2;
const D: u32 = 3;

#[test]
fn test_identity_map_is_consistent() {
    check_map(&[0, 1, 2, 3], &[A, B, C, D], 4).unwrap();
}

#[test]
fn test_permuted_subset_is_consistent() {
    // Fixed counters first, then configurable: the logical order need not
    // match the physical order.
    check_map(&[2, 0, 3], &[A, B, C], 10).unwrap();
}

#[test]
fn test_out_of_range_slot_rejected() {
    let err = check_map(&[0, 1, 4, 3], &[A, B, C, D], 4).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InconsistentMap {
            index: 2,
            slot: 4,
            counters: 4,
        }
    ));
}

#[test]
fn test_slot_beyond_snapshot_width_rejected() {
    // Even if the kernel reported more counters than a snapshot holds,
    // no slot may address past the snapshot array.
    let err = check_map(&[0, MAX_COUNTERS], &[A, B], MAX_COUNTERS + 8).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InconsistentMap {
            index: 1,
            slot: 32,
            ..
        }
    ));
}

#[test]
fn test_distinct_events_sharing_slot_rejected() {
    let err = check_map(&[0, 1, 1, 2], &[A, B, C, D], 4).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InconsistentMap {
            index: 2,
            slot: 1,
            ..
        }
    ));
}

#[test]
fn test_same_event_may_share_slot() {
    // Old Intel resolves "branches" to the same event as "instructions";
    // both logical indices then read one physical counter.
    check_map(&[0, 1, 1, 2], &[A, B, B, C], 4).unwrap();
}

#[test]
fn test_empty_map_is_consistent() {
    check_map::<u32>(&[], &[], 0).unwrap();
}

#[test]
fn test_config_accessors() {
    let classes = KPC_CLASS_FIXED_MASK | KPC_CLASS_CONFIGURABLE_MASK;
    let config = CounterConfig::from_parts(classes, vec![0xAB, 0xCD], vec![2, 0, 3, 1], 10);
    assert_eq!(config.classes(), classes);
    assert_eq!(config.registers(), [0xAB, 0xCD]);
    assert_eq!(config.counter_map(), [2, 0, 3, 1]);
    assert_eq!(config.counter_count(), 10);
}
