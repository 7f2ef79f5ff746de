//! Process-global profiler state: speedup rounds, virtual delays, and
//! sample attribution.
//!
//! A *round* virtually speeds up one source line: every sample taken inside
//! that line earns its thread a skipped delay, and every other thread must
//! pause to match the global delay count. Throughput counters observed across
//! rounds then reveal how much a real speedup of that line would matter.
//!
//! Everything here runs on application threads, frequently from the sample
//! signal handler; shared state is a handful of atomics plus the append-only
//! output sink.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::clock;
use crate::config::{Config, MIN_ROUND_SAMPLES, SAMPLE_PERIOD_NS, SPEEDUP_DIVISIONS};
use crate::output::Output;
use crate::perf::{Record, Sample};
use crate::symbols::{AddressMap, Line};
use crate::thread_state::ThreadState;

/// `selected_line` value meaning "no round in progress".
const NO_LINE: usize = 0;

static INSTANCE: OnceLock<Profiler> = OnceLock::new();

pub struct Profiler {
    map: AddressMap,
    out: Output,
    /// Dense line index + 1 of the line being sped up; 0 between rounds.
    selected_line: AtomicUsize,
    /// Nanoseconds per virtual delay; meaningful while a round is open.
    delay_size: AtomicU64,
    /// Monotonic count of virtual delays issued across the session.
    global_delays: AtomicU64,
    /// Samples accumulated into the current round.
    round_samples: AtomicU64,
    /// `global_delays` at the start of the current round.
    round_start_delays: AtomicU64,
    fixed_line: Option<Arc<Line>>,
    fixed_delay_size: Option<u64>,
    rng: Mutex<SmallRng>,
    start_time: u64,
    shutdown_run: AtomicBool,
}

impl Profiler {
    pub fn new(map: AddressMap, out: Output, config: &Config) -> Self {
        let fixed_line = if config.fixed_line_name.is_empty() {
            None
        } else {
            let found = map.find_line_named(&config.fixed_line_name).cloned();
            if found.is_none() {
                warn!(line = %config.fixed_line_name, "fixed line was not found");
            }
            found
        };

        Profiler {
            map,
            out,
            selected_line: AtomicUsize::new(NO_LINE),
            delay_size: AtomicU64::new(0),
            global_delays: AtomicU64::new(0),
            round_samples: AtomicU64::new(0),
            round_start_delays: AtomicU64::new(0),
            fixed_line,
            fixed_delay_size: config.fixed_delay_size(),
            rng: Mutex::new(SmallRng::seed_from_u64(clock::now_ns())),
            start_time: clock::now_ns(),
            shutdown_run: AtomicBool::new(false),
        }
    }

    /// Install the process-wide instance. Later calls keep the first one.
    pub fn install(profiler: Profiler) -> &'static Profiler {
        INSTANCE.get_or_init(|| profiler)
    }

    /// The installed instance, if startup has run.
    pub fn global() -> Option<&'static Profiler> {
        INSTANCE.get()
    }

    pub fn output(&self) -> &Output {
        &self.out
    }

    pub fn global_delays(&self) -> u64 {
        self.global_delays.load(Ordering::SeqCst)
    }

    pub fn delay_size(&self) -> u64 {
        self.delay_size.load(Ordering::SeqCst)
    }

    pub fn selected_line(&self) -> Option<&Arc<Line>> {
        match self.selected_line.load(Ordering::SeqCst) {
            NO_LINE => None,
            tagged => self.map.line_at(tagged - 1),
        }
    }

    /// Resolve a `"file:line"` progress spec and register a sampling counter
    /// for it. Unresolved names warn and register nothing.
    pub fn register_counter(&self, name: &str) {
        match self.map.find_line_named(name) {
            Some(line) => self.out.add_counter(name, Arc::clone(line)),
            None => warn!(line = name, "progress line was not found"),
        }
    }

    /// Drain and attribute this thread's buffered samples, then reconcile
    /// its delay state. Runs with the thread-state latch held, in either
    /// latch mode.
    pub fn process_samples(&self, state: &mut ThreadState) {
        let mut sampler = match state.sampler.take() {
            Some(sampler) => sampler,
            None => return,
        };

        sampler.stop();

        for record in sampler.drain() {
            if let Record::Sample(sample) = record {
                let line = self.find_containing_line(&sample);
                self.process_one(state, line);
            }
        }

        self.add_delays(state);

        sampler.start();
        state.sampler = Some(sampler);
    }

    /// Resolve a sample to a source line: the interrupted instruction
    /// pointer first, then each callchain frame.
    fn find_containing_line(&self, sample: &Sample) -> Option<&Arc<Line>> {
        if let Some(line) = self.map.find_line(sample.ip) {
            return Some(line);
        }
        for &pc in sample.callchain() {
            if let Some(line) = self.map.find_line(pc) {
                return Some(line);
            }
        }
        None
    }

    /// Account one sample that resolved to `line` (or to nothing).
    ///
    /// Drives the round state machine: an attributable sample outside a
    /// round opens one; the sample that brings the round to
    /// `MIN_ROUND_SAMPLES` closes it. Exactly one thread performs each
    /// transition (CAS on open, fetch_add sentinel on close).
    pub(crate) fn process_one(&self, state: &mut ThreadState, line: Option<&Arc<Line>>) {
        if let Some(line) = line {
            line.add_sample();
        }

        let mut line = line;
        let mut current = self.selected_line.load(Ordering::SeqCst);

        if current == NO_LINE {
            // No round in progress; pin to the fixed line when configured.
            if let Some(fixed) = &self.fixed_line {
                line = Some(fixed);
            }
            let candidate = match line {
                Some(candidate) => candidate,
                // Out-of-scope sample and nothing to pin to.
                None => return,
            };

            let tagged = candidate.index() + 1;
            match self.selected_line.compare_exchange(
                NO_LINE,
                tagged,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.round_samples.store(0, Ordering::SeqCst);
                    self.round_start_delays
                        .store(self.global_delays.load(Ordering::SeqCst), Ordering::SeqCst);

                    let delay_size = match self.fixed_delay_size {
                        Some(size) => size,
                        None => self.random_delay_size(),
                    };
                    self.delay_size.store(delay_size, Ordering::SeqCst);

                    self.out.start_round(candidate);
                    current = tagged;
                }
                Err(actual) => {
                    // Lost the race; fall through as a sample for the winner.
                    current = actual;
                }
            }
        }

        if current != NO_LINE {
            if let Some(line) = line {
                if line.index() + 1 == current {
                    // Sampled inside the selected line: this thread may skip
                    // one delay (and contributes it to the global count in
                    // add_delays).
                    state.delay_count += 1;
                }
            }

            if self.round_samples.fetch_add(1, Ordering::SeqCst) + 1 == MIN_ROUND_SAMPLES {
                let delays = self.global_delays.load(Ordering::SeqCst)
                    - self.round_start_delays.load(Ordering::SeqCst);
                self.out.end_round(delays, self.delay_size.load(Ordering::SeqCst));

                // Single writer: only the thread whose fetch_add hit the
                // threshold gets here, so a plain store suffices.
                self.selected_line.store(NO_LINE, Ordering::Relaxed);
            }
        }
    }

    fn random_delay_size(&self) -> u64 {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen_range(0..=SPEEDUP_DIVISIONS) * SAMPLE_PERIOD_NS / SPEEDUP_DIVISIONS
    }

    /// Reconcile this thread with the global delay count.
    ///
    /// A thread that skipped delays while being sampled in the selected line
    /// publishes them; a lagging thread pays its debt, first from banked
    /// excess-delay credit, then by pausing. Afterwards the thread's
    /// `delay_count` equals `global_delays` as observed at entry.
    pub(crate) fn add_delays(&self, state: &mut ThreadState) {
        let global_delay_count = self.global_delays.load(Ordering::SeqCst);
        let delay_size = self.delay_size.load(Ordering::SeqCst);

        if state.delay_count > global_delay_count {
            self.global_delays
                .fetch_add(state.delay_count - global_delay_count, Ordering::SeqCst);
        } else if state.delay_count < global_delay_count {
            let mut time_to_wait = (global_delay_count - state.delay_count) * delay_size;

            if state.excess_delay > time_to_wait {
                // Banked pause time covers the whole debt.
                state.excess_delay -= time_to_wait;
            } else {
                time_to_wait -= state.excess_delay;
                // Pause, and bank the oversleep for next time.
                state.excess_delay = clock::wait_ns(time_to_wait) - time_to_wait;
            }
            state.delay_count = global_delay_count;
        }
    }

    /// Stash the global and local delay counts ahead of a blocking region.
    pub(crate) fn snapshot_delays(&self, state: &mut ThreadState) {
        state.global_delay_snapshot = self.global_delays.load(Ordering::SeqCst);
        state.local_delay_snapshot = state.delay_count;
    }

    /// Acknowledge, without pausing, every delay issued since the snapshot.
    /// Used by threads that were blocked on external events and are exempt.
    pub(crate) fn skip_delays(&self, state: &mut ThreadState) {
        let missed_delays =
            self.global_delays.load(Ordering::SeqCst) - state.global_delay_snapshot;
        state.delay_count = state.local_delay_snapshot + missed_delays;
    }

    /// First `finish` call wins; later calls are no-ops.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutdown_run.swap(true, Ordering::SeqCst)
    }

    /// Emit the shutdown event and, in end-to-end mode, the
    /// `speedup_fraction<TAB>effective_time` line on stderr.
    pub(crate) fn finish(&self) {
        self.out.shutdown();

        if self.fixed_line.is_some() {
            if let Some(fixed_delay_size) = self.fixed_delay_size {
                let runtime = clock::now_ns() - self.start_time;
                let delay_count = self.global_delays.load(Ordering::SeqCst);
                let effective_time = runtime - delay_count * fixed_delay_size;
                eprintln!(
                    "{}\t{}",
                    fixed_delay_size as f64 / SAMPLE_PERIOD_NS as f64,
                    effective_time
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Writer handing everything written back through a shared buffer.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        fn count(&self, event: &str) -> usize {
            self.contents()
                .lines()
                .filter(|l| l.starts_with(event))
                .count()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn two_line_map() -> (AddressMap, Arc<Line>, Arc<Line>) {
        let mut map = AddressMap::empty();
        let a = map.intern("/app/src/hot.rs", 10);
        let b = map.intern("/app/src/cold.rs", 20);
        let a = Arc::clone(map.line_at(a).unwrap());
        let b = Arc::clone(map.line_at(b).unwrap());
        (map, a, b)
    }

    fn test_profiler(config: &Config) -> (Profiler, SharedBuf, Arc<Line>, Arc<Line>) {
        let (map, a, b) = two_line_map();
        let buf = SharedBuf::default();
        let out = Output::from_writer(Box::new(buf.clone()));
        (Profiler::new(map, out, config), buf, a, b)
    }

    #[test]
    fn ahead_thread_publishes_delays() {
        let (profiler, _, _, _) = test_profiler(&Config::default());
        let mut state = ThreadState::new();
        state.delay_count = 5;

        profiler.add_delays(&mut state);

        assert_eq!(profiler.global_delays(), 5);
        assert_eq!(state.delay_count, 5);
    }

    #[test]
    fn lagging_thread_pays_from_credit() {
        let (profiler, _, _, _) = test_profiler(&Config::default());
        profiler.global_delays.store(4, Ordering::SeqCst);
        profiler.delay_size.store(1_000, Ordering::SeqCst);

        let mut state = ThreadState::new();
        state.delay_count = 2;
        state.excess_delay = 5_000;

        profiler.add_delays(&mut state);

        // Debt was 2 × 1000 ns, covered entirely by credit.
        assert_eq!(state.excess_delay, 3_000);
        assert_eq!(state.delay_count, 4);
        assert_eq!(profiler.global_delays(), 4);
    }

    #[test]
    fn lagging_thread_pauses_and_banks_overshoot() {
        let (profiler, _, _, _) = test_profiler(&Config::default());
        profiler.global_delays.store(2, Ordering::SeqCst);
        profiler.delay_size.store(200_000, Ordering::SeqCst);

        let mut state = ThreadState::new();

        let before = clock::now_ns();
        profiler.add_delays(&mut state);
        let elapsed = clock::now_ns() - before;

        // Two delays of 0.2 ms each.
        assert!(elapsed >= 400_000);
        assert_eq!(state.delay_count, 2);
        // Oversleep became credit.
        assert!(state.excess_delay < elapsed);
    }

    #[test]
    fn reconciled_thread_is_a_noop() {
        let (profiler, _, _, _) = test_profiler(&Config::default());
        profiler.global_delays.store(3, Ordering::SeqCst);

        let mut state = ThreadState::new();
        state.delay_count = 3;
        state.excess_delay = 77;

        profiler.add_delays(&mut state);

        assert_eq!(profiler.global_delays(), 3);
        assert_eq!(state.excess_delay, 77);
    }

    #[test]
    fn round_opens_and_closes_after_min_samples() {
        let mut config = Config::default();
        config.fixed_speedup = 50;
        let (profiler, buf, a, _) = test_profiler(&config);
        let mut state = ThreadState::new();

        profiler.process_one(&mut state, Some(&a));
        assert_eq!(profiler.selected_line().unwrap().name(), a.name());
        assert_eq!(
            profiler.delay_size.load(Ordering::SeqCst),
            SAMPLE_PERIOD_NS / 2
        );

        for _ in 1..MIN_ROUND_SAMPLES {
            profiler.process_one(&mut state, Some(&a));
        }

        assert!(profiler.selected_line().is_none());
        assert_eq!(buf.count("start-round"), 1);
        assert_eq!(buf.count("end-round"), 1);
        // Every sample ran the selected line, so each one skipped a delay.
        assert_eq!(state.delay_count, MIN_ROUND_SAMPLES);
    }

    #[test]
    fn samples_outside_selected_line_earn_no_delays() {
        let (profiler, _, a, b) = test_profiler(&Config::default());
        let mut state = ThreadState::new();

        profiler.process_one(&mut state, Some(&a));
        profiler.process_one(&mut state, Some(&b));

        assert_eq!(state.delay_count, 1);
        assert_eq!(b.samples(), 1);
    }

    #[test]
    fn out_of_scope_samples_never_start_a_round() {
        let (profiler, buf, _, _) = test_profiler(&Config::default());
        let mut state = ThreadState::new();

        for _ in 0..MIN_ROUND_SAMPLES {
            profiler.process_one(&mut state, None);
        }

        assert!(profiler.selected_line().is_none());
        assert_eq!(profiler.global_delays(), 0);
        assert_eq!(buf.count("start-round"), 0);
        assert_eq!(state.delay_count, 0);
    }

    #[test]
    fn fixed_line_substitutes_for_unattributed_samples() {
        let mut config = Config::default();
        config.fixed_line_name = "hot.rs:10".to_string();
        config.fixed_speedup = 0;
        let (profiler, _, a, _) = test_profiler(&config);
        let mut state = ThreadState::new();

        profiler.process_one(&mut state, None);

        assert_eq!(profiler.selected_line().unwrap().name(), a.name());
        assert_eq!(profiler.delay_size.load(Ordering::SeqCst), 0);
        // The substituted sample counts as running the selected line.
        assert_eq!(state.delay_count, 1);
        // But the line's own sample counter only reflects real attributions.
        assert_eq!(a.samples(), 0);
    }

    #[test]
    fn round_end_race_closes_exactly_once() {
        let mut config = Config::default();
        config.fixed_speedup = 0;
        let (profiler, buf, a, _) = test_profiler(&config);
        let profiler = Arc::new(profiler);

        // Open the round, then let two threads deliver the remaining
        // samples concurrently.
        {
            let mut state = ThreadState::new();
            profiler.process_one(&mut state, Some(&a));
        }

        let remaining = MIN_ROUND_SAMPLES - 1;
        let first = remaining / 2;
        let second = remaining - first;

        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|n| {
                let profiler = Arc::clone(&profiler);
                let a = Arc::clone(&a);
                std::thread::spawn(move || {
                    let mut state = ThreadState::new();
                    for _ in 0..n {
                        profiler.process_one(&mut state, Some(&a));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(profiler.selected_line().is_none());
        assert_eq!(buf.count("start-round"), 1);
        assert_eq!(buf.count("end-round"), 1);
    }

    #[test]
    fn end_round_reports_delays_issued_during_round() {
        let mut config = Config::default();
        config.fixed_speedup = 0;
        let (profiler, buf, a, _) = test_profiler(&config);
        let mut state = ThreadState::new();

        // Delays issued before the round must not be charged to it.
        state.delay_count = 3;
        profiler.add_delays(&mut state);
        assert_eq!(profiler.global_delays(), 3);

        for _ in 0..MIN_ROUND_SAMPLES {
            profiler.process_one(&mut state, Some(&a));
        }
        profiler.add_delays(&mut state);

        let contents = buf.contents();
        let end = contents
            .lines()
            .find(|l| l.starts_with("end-round"))
            .unwrap();
        // All in-round samples hit the selected line, but their delays are
        // only published by add_delays after the round closed.
        assert_eq!(end, "end-round\tdelays=0\tdelay-size=0");
        assert_eq!(profiler.global_delays(), 3 + MIN_ROUND_SAMPLES);
    }

    #[test]
    fn snapshot_then_skip_acknowledges_missed_delays() {
        let (profiler, _, _, _) = test_profiler(&Config::default());
        let mut state = ThreadState::new();
        state.delay_count = 2;

        profiler.snapshot_delays(&mut state);
        // Ten delays land globally while the thread is "blocked".
        profiler.global_delays.fetch_add(10, Ordering::SeqCst);
        profiler.skip_delays(&mut state);

        assert_eq!(state.delay_count, 2 + 10);
    }

    #[test]
    fn snapshot_then_skip_without_activity_is_identity() {
        let (profiler, _, _, _) = test_profiler(&Config::default());
        let mut state = ThreadState::new();
        state.delay_count = 6;

        profiler.snapshot_delays(&mut state);
        profiler.skip_delays(&mut state);

        assert_eq!(state.delay_count, 6);
    }

    #[test]
    fn shutdown_runs_once() {
        let (profiler, buf, _, _) = test_profiler(&Config::default());

        assert!(profiler.begin_shutdown());
        profiler.finish();
        assert!(!profiler.begin_shutdown());
        assert!(!profiler.begin_shutdown());

        assert_eq!(buf.count("shutdown"), 1);
    }

    #[test]
    fn concurrent_shutdown_tears_down_once() {
        let (profiler, buf, _, _) = test_profiler(&Config::default());
        let profiler = Arc::new(profiler);

        // Several threads race the shutdown flag; only the winner may emit.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let profiler = Arc::clone(&profiler);
                std::thread::spawn(move || {
                    if profiler.begin_shutdown() {
                        profiler.finish();
                        true
                    } else {
                        false
                    }
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(buf.count("shutdown"), 1);
    }

    #[test]
    fn unresolved_counter_registers_nothing() {
        let (profiler, buf, _, _) = test_profiler(&Config::default());
        profiler.register_counter("missing.rs:1");
        assert_eq!(buf.count("counter"), 0);

        profiler.register_counter("hot.rs:10");
        assert_eq!(buf.count("counter"), 1);
    }
}
