//! In-process causal profiler for multithreaded Linux programs.
//!
//! causalprof estimates, for each source line, how much a real speedup of
//! that line would improve end-to-end throughput. It repeatedly picks a
//! candidate line, runs the program for a bounded *round*, and applies a
//! *virtual speedup*: every thread **not** sampled inside the chosen line is
//! delayed in proportion, so the chosen line becomes relatively faster.
//! Progress counters independent of wall-clock time expose the resulting
//! throughput change.
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! causalprof = "0.1"
//! ```
//!
//! Start a session early in `main`, spawn workers through the profiler so
//! they inherit delay state, and shut down before exit:
//! ```rust,ignore
//! causalprof::startup(causalprof::Config::from_env())?;
//!
//! let worker = causalprof::spawn(|| run_worker());
//!
//! worker.join().unwrap();
//! causalprof::shutdown();
//! ```
//!
//! Threads that block on external events bracket the blocked region with
//! [`snapshot_delays`]/[`skip_delays`], and call [`catch_up`] before waking
//! another thread so virtual time stays causally ordered.
//!
//! Build with debug info (`debug = true`) so samples resolve to lines, and
//! run with `kernel.perf_event_paranoid` permitting self-profiling.

mod clock;
mod config;
mod crash;
mod output;
mod perf;
mod profiler;
mod symbols;
mod thread_state;
mod timer;

pub mod error;

pub use config::Config;
pub use error::{Error, Result};
pub use symbols::Line;

use std::mem;
use std::ptr;

use tracing::warn;

use crate::config::{SAMPLE_PERIOD_NS, SAMPLE_SIGNAL, SAMPLE_WAKEUP_COUNT};
use crate::perf::PerfSampler;
use crate::profiler::Profiler;
use crate::thread_state::Context;
use crate::timer::SampleTimer;

/// Start a profiling session for this process.
///
/// Installs the sample and crash signal handlers, builds the address map
/// over the configured scope (defaulting to the current working directory),
/// opens the output sink, registers progress counters, and begins sampling
/// on the calling thread. A second call is a no-op.
pub fn startup(mut config: Config) -> Result<()> {
    if Profiler::global().is_some() {
        return Ok(());
    }

    install_sample_handler()?;
    crash::install()?;

    if config.scope.is_empty() {
        config.scope.push(std::env::current_dir()?);
    }

    let map = symbols::AddressMap::build(&config.scope)?;
    if map.is_empty() {
        warn!("no in-scope source lines found; no rounds will run");
    }
    let out = output::Output::create(&config.output_file)?;

    let profiler = Profiler::install(Profiler::new(map, out, &config));

    for name in &config.progress_names {
        profiler.register_counter(name);
    }

    profiler.output().startup(SAMPLE_PERIOD_NS);

    begin_sampling();
    Ok(())
}

/// Stop the session and flush the output.
///
/// Idempotent: the first caller drains its own samples, emits the shutdown
/// event, and (in end-to-end mode) prints the
/// `speedup_fraction<TAB>effective_time` line to stderr; later callers
/// return immediately.
pub fn shutdown() {
    let profiler = match Profiler::global() {
        Some(profiler) => profiler,
        None => return,
    };
    if !profiler.begin_shutdown() {
        return;
    }

    end_sampling();
    profiler.finish();
}

/// Set up this thread's sampler and sample timer.
///
/// Called automatically for the main thread by [`startup`] and for children
/// of [`spawn`]. A sampler failure leaves this thread unprofiled; the
/// session continues on other threads.
pub fn begin_sampling() {
    if Profiler::global().is_none() {
        return;
    }
    ensure_sigaltstack();

    thread_state::with_state(Context::Thread, |state| {
        if state.sampler.is_some() {
            return;
        }

        let sampler = match PerfSampler::open() {
            Ok(sampler) => sampler,
            Err(e) => {
                warn!(error = %e, "sampler setup failed; thread will not be sampled");
                return;
            }
        };
        let timer = match SampleTimer::new(SAMPLE_SIGNAL) {
            Ok(timer) => timer,
            Err(e) => {
                warn!(error = %e, "sample timer setup failed; thread will not be sampled");
                return;
            }
        };
        if let Err(e) = timer.start_interval(SAMPLE_PERIOD_NS * SAMPLE_WAKEUP_COUNT) {
            warn!(error = %e, "sample timer arm failed; thread will not be sampled");
            return;
        }

        sampler.start();
        state.sampler = Some(sampler);
        state.timer = Some(timer);
    });
}

/// Drain this thread's remaining samples, settle its delay debt, and release
/// its sampler and timer.
pub fn end_sampling() {
    let profiler = match Profiler::global() {
        Some(profiler) => profiler,
        None => return,
    };

    thread_state::with_state(Context::Thread, |state| {
        if let Some(timer) = state.timer.take() {
            timer.stop();
        }

        profiler.process_samples(state);
        profiler.add_delays(state);

        if let Some(sampler) = state.sampler.take() {
            sampler.stop();
        }
    });
}

/// Spawn a thread that participates in the profiling session.
///
/// The child inherits the parent's delay count and excess delay at spawn
/// time, begins sampling before `f` runs, and ends sampling when it
/// finishes, including on unwind.
pub fn spawn<F, T>(f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inherited = thread_state::with_state(Context::Thread, |state| {
        (state.delay_count, state.excess_delay)
    })
    .unwrap_or((0, 0));

    std::thread::spawn(move || {
        thread_state::with_state(Context::Thread, |state| {
            state.delay_count = inherited.0;
            state.excess_delay = inherited.1;
        });

        begin_sampling();
        let _guard = SamplingGuard;
        f()
    })
}

struct SamplingGuard;

impl Drop for SamplingGuard {
    fn drop(&mut self) {
        end_sampling();
    }
}

/// Register a progress counter for a `"file:line"` spec. Unresolved names
/// warn and register nothing.
pub fn register_counter(name: &str) {
    if let Some(profiler) = Profiler::global() {
        profiler.register_counter(name);
    }
}

/// Total virtual delays issued during this session so far.
pub fn global_delays() -> u64 {
    Profiler::global().map(Profiler::global_delays).unwrap_or(0)
}

/// Nanoseconds per virtual delay in the current round. Zero between rounds
/// or before startup.
pub fn delay_size() -> u64 {
    Profiler::global().map(Profiler::delay_size).unwrap_or(0)
}

/// The line currently receiving a virtual speedup, if a round is open.
pub fn selected_line() -> Option<std::sync::Arc<Line>> {
    Profiler::global().and_then(|p| p.selected_line().cloned())
}

/// Stash the global and local delay counts before a region where this
/// thread blocks on an external event.
pub fn snapshot_delays() {
    if let Some(profiler) = Profiler::global() {
        thread_state::with_state(Context::Thread, |state| profiler.snapshot_delays(state));
    }
}

/// Acknowledge, without pausing, the delays issued since [`snapshot_delays`].
/// A thread that was blocked is exempt from them.
pub fn skip_delays() {
    if let Some(profiler) = Profiler::global() {
        thread_state::with_state(Context::Thread, |state| profiler.skip_delays(state));
    }
}

/// Pay any outstanding delay debt immediately. Call before signalling or
/// releasing another thread so virtual time stays causally ordered.
pub fn catch_up() {
    if let Some(profiler) = Profiler::global() {
        thread_state::with_state(Context::Thread, |state| profiler.add_delays(state));
    }
}

fn install_sample_handler() -> Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = samples_ready as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        if libc::sigaction(SAMPLE_SIGNAL, &sa, ptr::null_mut()) != 0 {
            return Err(Error::Signal(format!(
                "sigaction({}) failed: {}",
                SAMPLE_SIGNAL,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Sample-signal entry point. Probes the thread-state latch and bails on
/// contention; the kernel keeps buffering and the next tick redelivers.
extern "C" fn samples_ready(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let saved_errno = std::io::Error::last_os_error().raw_os_error();

    if let Some(profiler) = Profiler::global() {
        thread_state::with_state(Context::Signal, |state| profiler.process_samples(state));
    }

    if let Some(errno) = saved_errno {
        unsafe {
            *libc::__errno_location() = errno;
        }
    }
}

/// Install an alternate signal stack if this thread has none, so sample
/// processing never runs on a nearly-full application stack. The stack
/// lives for the life of the thread.
fn ensure_sigaltstack() {
    unsafe {
        let mut current: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current) != 0 {
            return;
        }
        if (current.ss_flags & libc::SS_DISABLE) == 0 {
            return;
        }

        let size = libc::SIGSTKSZ.max(32 * 1024);
        let stack = Box::leak(vec![0u8; size].into_boxed_slice());
        let new_stack = libc::stack_t {
            ss_sp: stack.as_mut_ptr() as *mut libc::c_void,
            ss_flags: 0,
            ss_size: size,
        };
        libc::sigaltstack(&new_stack, ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_inherits_parent_delay_state() {
        thread_state::with_state(Context::Thread, |state| {
            state.delay_count = 11;
            state.excess_delay = 2_500;
        });

        let child = spawn(|| {
            thread_state::with_state(Context::Thread, |state| {
                (state.delay_count, state.excess_delay)
            })
            .unwrap()
        });

        assert_eq!(child.join().unwrap(), (11, 2_500));

        // Reset for other tests sharing this thread.
        thread_state::with_state(Context::Thread, |state| {
            state.delay_count = 0;
            state.excess_delay = 0;
        });
    }

    #[test]
    fn api_is_inert_without_a_session() {
        // No startup has run in this process; every entry point must be a
        // harmless no-op.
        begin_sampling();
        end_sampling();
        snapshot_delays();
        skip_delays();
        catch_up();
        register_counter("src/main.rs:1");
        shutdown();
    }
}
