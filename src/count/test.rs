use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::{Arc, Mutex};

use super::{delta, CounterControl, Session, Snapshot, Stat, State};
use crate::config::CounterConfig;
use crate::error::{Error, Stage};
use crate::ffi::{KpcConfig, KPC_CLASS_CONFIGURABLE_MASK, KPC_CLASS_FIXED_MASK, MAX_COUNTERS};
use crate::metric::Metric;

#[derive(Default)]
struct FakeState {
    owned: bool,
    counters: [u64; MAX_COUNTERS],
    calls: Vec<String>,
    fail_program: bool,
    fail_thread_counting: bool,
    fail_read: bool,
}

/// Counter control double with a call ledger; never touches the OS.
#[derive(Default)]
struct Fake(Mutex<FakeState>);

impl Fake {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_counters(&self, vals: &[u64]) {
        let mut st = self.0.lock().unwrap();
        st.counters[..vals.len()].copy_from_slice(vals);
    }

    fn owned(&self) -> bool {
        self.0.lock().unwrap().owned
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().calls.clone()
    }

    fn set<F: FnOnce(&mut FakeState)>(&self, f: F) {
        f(&mut self.0.lock().unwrap());
    }
}

impl CounterControl for Fake {
    fn acquire_ownership(&self) -> IoResult<()> {
        let mut st = self.0.lock().unwrap();
        st.calls.push("acquire".into());
        st.owned = true;
        Ok(())
    }

    fn release_ownership(&self) -> IoResult<()> {
        let mut st = self.0.lock().unwrap();
        st.calls.push("release".into());
        st.owned = false;
        Ok(())
    }

    fn ownership_held(&self) -> IoResult<bool> {
        Ok(self.0.lock().unwrap().owned)
    }

    fn program(&self, _classes: u32, _regs: &[KpcConfig]) -> IoResult<()> {
        let mut st = self.0.lock().unwrap();
        st.calls.push("program".into());
        if st.fail_program {
            return Err(IoError::from(ErrorKind::PermissionDenied));
        }
        Ok(())
    }

    fn set_counting(&self, classes: u32) -> IoResult<()> {
        let mut st = self.0.lock().unwrap();
        st.calls.push(format!("set_counting({classes})"));
        Ok(())
    }

    fn set_thread_counting(&self, classes: u32) -> IoResult<()> {
        let mut st = self.0.lock().unwrap();
        st.calls.push(format!("set_thread_counting({classes})"));
        if st.fail_thread_counting && classes != 0 {
            return Err(IoError::from(ErrorKind::PermissionDenied));
        }
        Ok(())
    }

    fn read_thread_counters(&self, buf: &mut [u64]) -> IoResult<()> {
        let mut st = self.0.lock().unwrap();
        st.calls.push("read".into());
        if st.fail_read {
            return Err(IoError::from(ErrorKind::Other));
        }
        let n = buf.len().min(MAX_COUNTERS);
        buf[..n].copy_from_slice(&st.counters[..n]);
        Ok(())
    }
}

const CLASSES: u32 = KPC_CLASS_FIXED_MASK | KPC_CLASS_CONFIGURABLE_MASK;

fn config() -> CounterConfig {
    CounterConfig::from_parts(CLASSES, vec![0x11, 0x22], vec![0, 1, 2, 3], 8)
}

fn session(fake: &Arc<Fake>, owned: bool) -> Session<Fake> {
    if owned {
        fake.set(|st| st.owned = true);
    }
    Session::from_parts(fake.clone(), config(), Metric::ALL.to_vec(), owned)
}

fn snap(vals: &[u64]) -> Snapshot {
    let mut raw = [0; MAX_COUNTERS];
    raw[..vals.len()].copy_from_slice(vals);
    Snapshot(raw)
}

#[test]
fn test_delta_exact() {
    let before = snap(&[10, 20, 30, 40]);
    let after = snap(&[15, 25, 31, 42]);
    let stats = delta(&before, &after, &Metric::ALL, &[0, 1, 2, 3]).unwrap();
    let counts: Vec<_> = stats.iter().map(|s| s.count).collect();
    assert_eq!(counts, [5, 5, 1, 2]);
    assert_eq!(stats[0].metric, Metric::Cycles);
    assert_eq!(stats[3].metric, Metric::BranchMisses);
}

#[test]
fn test_delta_follows_counter_map() {
    // Fixed counters land after the configurable ones here; the delta
    // must follow the map, not the metric order.
    let before = snap(&[10, 20, 30, 40]);
    let after = snap(&[11, 22, 33, 44]);
    let stats = delta(&before, &after, &Metric::ALL, &[2, 0, 3, 1]).unwrap();
    let counts: Vec<_> = stats.iter().map(|s| s.count).collect();
    assert_eq!(counts, [3, 1, 4, 2]);
}

#[test]
fn test_delta_regression_is_an_anomaly() {
    let before = snap(&[10, 20, 30, 40]);
    let after = snap(&[15, 19, 31, 42]);
    let err = delta(&before, &after, &Metric::ALL, &[0, 1, 2, 3]).unwrap_err();
    match err {
        Error::CounterRegression {
            metric,
            before,
            after,
        } => {
            assert_eq!(metric, Metric::Instructions);
            assert_eq!((before, after), (20, 19));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_stop_without_start_fails_fast() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    let err = s.stop().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            op: "stop",
            state: State::Configured,
        }
    ));
    // No snapshot was taken or mutated.
    assert!(!fake.calls().iter().any(|c| c == "read"));
    assert_eq!(s.after.0, [0; MAX_COUNTERS]);
}

#[test]
fn test_double_start_fails_fast() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    s.start().unwrap();
    let err = s.start().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            op: "start",
            state: State::Counting,
        }
    ));
}

#[test]
fn test_start_call_order() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    s.start().unwrap();
    assert_eq!(
        fake.calls(),
        ["program", "set_counting(3)", "set_thread_counting(3)", "read"]
    );
    assert_eq!(s.state(), State::Counting);
}

#[test]
fn test_stop_reads_before_disabling() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    s.start().unwrap();
    s.stop().unwrap();
    let calls = fake.calls();
    let tail = &calls[calls.len() - 4..];
    assert_eq!(
        tail,
        ["read", "set_thread_counting(0)", "set_counting(0)", "release"]
    );
    assert_eq!(s.state(), State::Stopped);
}

#[test]
fn test_windows_are_independent() {
    let fake = Fake::new();
    let mut s = session(&fake, true);

    fake.set_counters(&[100, 200, 300, 400]);
    s.start().unwrap();
    fake.set_counters(&[110, 220, 330, 440]);
    let w1 = s.stop().unwrap();
    let counts: Vec<_> = w1.iter().map(|s| s.count).collect();
    assert_eq!(counts, [10, 20, 30, 40]);

    // The second window must not accumulate the first.
    s.start().unwrap();
    fake.set_counters(&[115, 225, 335, 445]);
    let w2 = s.stop().unwrap();
    let counts: Vec<_> = w2.iter().map(|s| s.count).collect();
    assert_eq!(counts, [5, 5, 5, 5]);
}

#[test]
fn test_stop_releases_and_restart_reacquires() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    s.start().unwrap();
    s.stop().unwrap();
    assert!(!fake.owned());

    s.start().unwrap();
    let calls = fake.calls();
    // Ownership was released on stop, so the restart re-acquires and
    // re-programs the registers.
    assert_eq!(calls.iter().filter(|c| *c == "acquire").count(), 1);
    assert_eq!(calls.iter().filter(|c| *c == "program").count(), 2);
    assert!(fake.owned());
}

#[test]
fn test_retained_ownership_skips_reacquisition() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    s.retain_ownership(true);
    s.start().unwrap();
    s.stop().unwrap();
    assert!(fake.owned());

    s.start().unwrap();
    let calls = fake.calls();
    assert_eq!(calls.iter().filter(|c| *c == "acquire").count(), 0);
    assert_eq!(calls.iter().filter(|c| *c == "program").count(), 1);
}

#[test]
fn test_failed_enable_rolls_back() {
    let fake = Fake::new();
    fake.set(|st| st.fail_thread_counting = true);
    let mut s = session(&fake, true);

    let err = s.start().unwrap_err();
    assert!(matches!(
        err,
        Error::Kernel {
            stage: Stage::EnableThreadCounting,
            ..
        }
    ));
    assert_eq!(s.state(), State::Configured);
    assert_eq!(fake.calls().last().unwrap(), "set_counting(0)");

    fake.set(|st| st.fail_thread_counting = false);
    s.start().unwrap();
    assert_eq!(s.state(), State::Counting);
}

#[test]
fn test_failed_read_aborts_start() {
    let fake = Fake::new();
    fake.set(|st| st.fail_read = true);
    let mut s = session(&fake, true);

    let err = s.start().unwrap_err();
    assert!(matches!(
        err,
        Error::Read {
            stage: Stage::SnapshotBefore,
            ..
        }
    ));
    assert_eq!(s.state(), State::Configured);
    // Both enables were rolled back.
    let calls = fake.calls();
    let tail = &calls[calls.len() - 2..];
    assert_eq!(tail, ["set_thread_counting(0)", "set_counting(0)"]);
}

#[test]
fn test_failed_stop_read_keeps_counting() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    s.start().unwrap();

    fake.set(|st| st.fail_read = true);
    let err = s.stop().unwrap_err();
    assert!(matches!(
        err,
        Error::Read {
            stage: Stage::SnapshotAfter,
            ..
        }
    ));
    assert_eq!(s.state(), State::Counting);

    fake.set(|st| st.fail_read = false);
    s.stop().unwrap();
    assert_eq!(s.state(), State::Stopped);
}

#[test]
fn test_failed_start_does_not_leak_ownership() {
    let fake = Fake::new();
    fake.set(|st| st.fail_program = true);
    let mut s = session(&fake, false);

    let err = s.start().unwrap_err();
    assert!(matches!(
        err,
        Error::Kernel {
            stage: Stage::ProgramRegisters,
            ..
        }
    ));
    // The claim was acquired before programming failed; dropping the
    // session must release it.
    assert!(fake.owned());
    drop(s);
    assert!(!fake.owned());
}

#[test]
fn test_drop_while_counting_disables() {
    let fake = Fake::new();
    let mut s = session(&fake, true);
    s.start().unwrap();
    drop(s);
    let calls = fake.calls();
    let tail = &calls[calls.len() - 3..];
    assert_eq!(tail, ["set_thread_counting(0)", "set_counting(0)", "release"]);
    assert!(!fake.owned());
}

#[test]
fn test_run_sequences_start_work_stop() {
    let fake = Fake::new();
    let mut s = session(&fake, true);

    fake.set_counters(&[1, 2, 3, 4]);
    let (value, stats) = s
        .run(|| {
            fake.set_counters(&[2, 4, 6, 8]);
            "done"
        })
        .unwrap();
    assert_eq!(value, "done");
    assert_eq!(
        stats,
        [
            Stat { metric: Metric::Cycles, count: 1 },
            Stat { metric: Metric::Instructions, count: 2 },
            Stat { metric: Metric::Branches, count: 3 },
            Stat { metric: Metric::BranchMisses, count: 4 },
        ]
    );
    assert_eq!(s.state(), State::Stopped);
}
