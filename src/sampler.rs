use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use crate::counter::{CounterSource, EngineKind, Rdtsc, Rdtscp};
use crate::error::Error;
use crate::histogram::{classify, Histogram, Row};
use crate::topology::{Binder, CpuSet};

/// Runs one engine on every CPU in `set` and returns the filled histogram.
pub fn run(
    kind: EngineKind,
    set: &CpuSet,
    binder: &dyn Binder,
    reps: u64,
) -> Result<Histogram, Error> {
    kind.check_available()?;
    let (name, width) = (kind.name(), kind.bit_width());
    match kind {
        EngineKind::Rdtsc => run_engine(name, width, set, binder, reps, |_| Rdtsc),
        EngineKind::Rdtscp => run_engine(name, width, set, binder, reps, |_| Rdtscp::new()),
    }
}

/// Spawns one pinned worker per CPU in `set`, each owning its CPU's row.
///
/// Workers bind first and then wait at a start gate. Sampling only begins
/// once every worker has bound; a single bind or spawn failure releases the
/// gate with an abort and the whole phase fails.
pub fn run_engine<C, F>(
    name: &str,
    width: u32,
    set: &CpuSet,
    binder: &dyn Binder,
    reps: u64,
    make_source: F,
) -> Result<Histogram, Error>
where
    C: CounterSource,
    F: Fn(usize) -> C + Sync,
{
    let mut hist = Histogram::new();
    let gate = StartGate::new();
    let expected = set.len();
    let started = Instant::now();

    log::info!("{}: sampling {} reps on {} CPUs", name, reps, expected);

    let outcome = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(expected);
        let mut spawn_err = None;

        for (cpu, row) in hist.rows_mut().enumerate().filter(|(cpu, _)| set.contains(*cpu)) {
            let gate = &gate;
            let make_source = &make_source;
            let spawned = thread::Builder::new()
                .name(format!("{}-cpu{}", name, cpu))
                .spawn_scoped(scope, move || -> Result<(), Error> {
                    let arrival = gate.arrival();
                    let bound = binder.bind(cpu);
                    if !arrival.arrive(bound.is_ok()) {
                        return bound;
                    }
                    log::debug!("bound, sampling {} reps", reps);
                    let mut source = make_source(cpu);
                    sample(&mut source, row, reps, width);
                    Ok(())
                });
            match spawned {
                Ok(handle) => handles.push((cpu, handle)),
                Err(e) => {
                    spawn_err = Some(Error::Worker(format!(
                        "failed to spawn worker for cpu {}: {}",
                        cpu, e
                    )));
                    break;
                }
            }
        }

        gate.release(expected, spawn_err.is_none());

        let mut first_err = spawn_err;
        for (cpu, handle) in handles {
            let result = match handle.join() {
                Ok(r) => r,
                Err(_) => Err(Error::Worker(format!("worker for cpu {} panicked", cpu))),
            };
            if let Err(e) = result {
                log::debug!("{}: cpu {} failed: {}", name, cpu, e);
                first_err.get_or_insert(e);
            }
        }
        first_err
    });

    if let Some(e) = outcome {
        return Err(e);
    }

    log::info!("{}: done in {:.1}s", name, started.elapsed().as_secs_f64());
    Ok(hist)
}

/// The hot loop. No allocation, I/O or syscalls between reads.
#[inline(never)]
fn sample<C: CounterSource>(source: &mut C, row: &mut Row, reps: u64, width: u32) {
    for _ in 0..reps {
        let t1 = source.read();
        let t2 = source.read();
        row.record(classify(t2.wrapping_sub(t1), width));
        if t2 < t1 {
            row.record_backwards();
        }
    }
}

struct GateState {
    arrived: usize,
    failed: bool,
    decision: Option<bool>,
}

/// Holds workers between binding and sampling until the coordinator decides.
struct StartGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                arrived: 0,
                failed: false,
                decision: None,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a worker that must report before the gate can open.
    fn arrival(&self) -> Arrival<'_> {
        Arrival {
            gate: self,
            reported: false,
        }
    }

    fn arrive(&self, bound: bool) -> bool {
        let mut st = self.lock();
        st.arrived += 1;
        st.failed |= !bound;
        self.cv.notify_all();
        while st.decision.is_none() {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.decision == Some(true) && bound
    }

    /// Waits for `expected` arrivals (skipped when spawning already failed)
    /// and opens the gate.
    fn release(&self, expected: usize, spawned_all: bool) {
        let mut st = self.lock();
        if spawned_all {
            while st.arrived < expected && !st.failed {
                st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
            }
        }
        st.decision = Some(spawned_all && !st.failed);
        self.cv.notify_all();
    }

    /// Counts a worker that unwound before reporting as a failed arrival.
    fn abandon(&self) {
        let mut st = self.lock();
        st.arrived += 1;
        st.failed = true;
        self.cv.notify_all();
    }
}

/// A worker's pending report to the start gate. Dropping it unreported
/// (a panic during binding) marks the phase failed instead of leaving the
/// coordinator waiting.
struct Arrival<'a> {
    gate: &'a StartGate,
    reported: bool,
}

impl Arrival<'_> {
    /// Reports the bind result and blocks until released.
    /// Returns true if sampling should start.
    fn arrive(mut self, bound: bool) -> bool {
        self.reported = true;
        self.gate.arrive(bound)
    }
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.gate.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::BUCKETS;

    struct NoPin;

    impl Binder for NoPin {
        fn bind(&self, _cpu: usize) -> Result<(), Error> {
            Ok(())
        }
    }

    struct PanicOnCpu(usize);

    impl Binder for PanicOnCpu {
        fn bind(&self, cpu: usize) -> Result<(), Error> {
            if cpu == self.0 {
                panic!("binder fault on cpu {}", cpu);
            }
            Ok(())
        }
    }

    struct RejectCpu(usize);

    impl Binder for RejectCpu {
        fn bind(&self, cpu: usize) -> Result<(), Error> {
            if cpu == self.0 {
                Err(Error::Affinity(format!("cannot pin to cpu {}", cpu)))
            } else {
                Ok(())
            }
        }
    }

    /// Advances by a fixed step on every read.
    struct Step {
        now: u64,
        step: u64,
    }

    impl CounterSource for Step {
        fn read(&mut self) -> u64 {
            self.now = self.now.wrapping_add(self.step);
            self.now
        }
    }

    /// Repeats the previous value on every 2000th read, giving one zero
    /// delta per 1000 samples.
    struct StallEvery1000 {
        now: u64,
        reads: u64,
    }

    impl CounterSource for StallEvery1000 {
        fn read(&mut self) -> u64 {
            self.reads += 1;
            if self.reads % 2000 != 0 {
                self.now += 5;
            }
            self.now
        }
    }

    struct Broken;

    impl CounterSource for Broken {
        fn read(&mut self) -> u64 {
            panic!("counter fault")
        }
    }

    fn cpus(ids: &[usize]) -> CpuSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_constant_delta_two_cpus() {
        let set = cpus(&[0, 1]);
        let hist =
            run_engine("fake", 64, &set, &NoPin, 1000, |_| Step { now: 0, step: 2 }).unwrap();
        for cpu in [0, 1] {
            let row = hist.row(cpu);
            assert_eq!(row.count(62), 1000);
            assert_eq!(row.total(), 1000);
            for b in (0..BUCKETS).filter(|&b| b != 62) {
                assert_eq!(row.count(b), 0, "cpu {} bucket {}", cpu, b);
            }
        }
    }

    #[test]
    fn test_zero_delta_routed_to_top_bucket() {
        let set = cpus(&[0]);
        let hist = run_engine("fake", 64, &set, &NoPin, 1000, |_| StallEvery1000 {
            now: 0,
            reads: 0,
        })
        .unwrap();
        let row = hist.row(0);
        assert_eq!(row.count(64), 1);
        assert_eq!(row.count(61), 999);
        assert_eq!(row.total(), 1000);
    }

    #[test]
    fn test_narrow_width() {
        let set = cpus(&[0]);
        let hist = run_engine("fake", 32, &set, &NoPin, 500, |_| Step { now: 0, step: 2 }).unwrap();
        assert_eq!(hist.row(0).count(30), 500);
        assert_eq!(hist.row(0).count(62), 0);
    }

    #[test]
    fn test_backwards_reads_are_tallied() {
        let set = cpus(&[0]);
        let hist = run_engine("fake", 64, &set, &NoPin, 100, |_| Step {
            now: 1_000_000,
            step: u64::MAX,
        })
        .unwrap();
        let row = hist.row(0);
        assert_eq!(row.backwards(), 100);
        // Wrapped subtraction yields u64::MAX: no leading zeros.
        assert_eq!(row.count(0), 100);
        assert_eq!(row.total(), 100);
    }

    #[test]
    fn test_inactive_rows_untouched() {
        let set = cpus(&[3, 700]);
        let hist = run_engine("fake", 64, &set, &NoPin, 10, |_| Step { now: 0, step: 1 }).unwrap();
        assert_eq!(hist.row(3).total(), 10);
        assert_eq!(hist.row(700).total(), 10);
        assert_eq!(hist.row(0).total(), 0);
        assert_eq!(hist.row(4).total(), 0);
    }

    #[test]
    fn test_source_built_per_cpu() {
        let set = cpus(&[0, 5]);
        let hist = run_engine("fake", 64, &set, &NoPin, 50, |cpu| Step {
            now: 0,
            step: 1 << cpu,
        })
        .unwrap();
        assert_eq!(hist.row(0).count(63), 50);
        assert_eq!(hist.row(5).count(58), 50);
    }

    #[test]
    fn test_bind_failure_aborts_phase() {
        let set = cpus(&[0, 1, 2]);
        let result =
            run_engine("fake", 64, &set, &RejectCpu(1), 1000, |_| Step { now: 0, step: 2 });
        match result {
            Err(Error::Affinity(msg)) => assert!(msg.contains("cpu 1")),
            other => panic!("expected affinity error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_binder_panic_fails_phase() {
        let set = cpus(&[0, 1, 2]);
        let result = run_engine("fake", 64, &set, &PanicOnCpu(1), 1000, |_| Step {
            now: 0,
            step: 2,
        });
        match result {
            Err(Error::Worker(msg)) => assert!(msg.contains("cpu 1")),
            other => panic!("expected worker error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_worker_panic_is_error() {
        let set = cpus(&[0]);
        let result = run_engine("fake", 64, &set, &NoPin, 10, |_| Broken);
        assert!(matches!(result, Err(Error::Worker(_))));
    }

    #[test]
    fn test_many_workers_real_pinning() {
        let set = crate::topology::discover().unwrap();
        let hist = run_engine(
            "fake",
            64,
            &set,
            &crate::topology::ThreadAffinity,
            200,
            |_| Step { now: 0, step: 8 },
        )
        .unwrap();
        for cpu in set.iter() {
            assert_eq!(hist.row(cpu).count(60), 200);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_real_rdtsc_mass_sums_to_reps() {
        let set = cpus(&[0]);
        let hist = run(EngineKind::Rdtsc, &set, &NoPin, 10_000).unwrap();
        let row = hist.row(0);
        assert_eq!(row.total(), 10_000);
        // Back-to-back reads are close together: the bulk sits in the
        // small-delta buckets.
        let small: u64 = (40..BUCKETS).map(|b| row.count(b)).sum();
        assert!(small > 9_000);
    }

    #[cfg(target_arch = "x86_64")]
    fn modal_bucket(row: &Row) -> usize {
        (0..BUCKETS).max_by_key(|&b| row.count(b)).unwrap_or(0)
    }

    #[cfg(target_arch = "x86_64")]
    fn mass_within(row: &Row, lo: usize, hi: usize) -> u64 {
        (lo..=hi.min(BUCKETS - 1)).map(|b| row.count(b)).sum()
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_rdtsc_distribution_stable_across_runs() {
        let set = cpus(&[0]);
        let reps = 100_000;
        let first = run(EngineKind::Rdtsc, &set, &NoPin, reps).unwrap();
        let second = run(EngineKind::Rdtsc, &set, &NoPin, reps).unwrap();
        let (a, b) = (first.row(0), second.row(0));

        let (mode_a, mode_b) = (modal_bucket(a), modal_bucket(b));
        assert!(
            mode_a.abs_diff(mode_b) <= 1,
            "modal buckets drifted: {} vs {}",
            mode_a,
            mode_b
        );

        // Both runs keep most of their mass in the same narrow band.
        let lo = mode_a.min(mode_b).saturating_sub(3);
        let hi = mode_a.max(mode_b) + 3;
        for row in [a, b] {
            assert_eq!(row.total(), reps);
            assert!(mass_within(row, lo, hi) * 10 >= reps * 9);
        }
    }
}
