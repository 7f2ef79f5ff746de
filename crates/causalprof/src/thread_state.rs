//! Per-thread profiler state and the latch that guards it.
//!
//! Each thread owns exactly one [`ThreadState`], reachable only through
//! [`with_state`]. The sample-signal handler and the thread itself are
//! mutually excluded by a two-mode latch:
//!
//! - **Thread mode** blocks the sample signal for the duration of the
//!   critical section, then takes the flag. The handler can therefore never
//!   observe the flag held by its own thread.
//! - **Signal mode** try-acquires the flag and gives up on contention. The
//!   dropped batch is not lost: the kernel keeps buffering samples and the
//!   next timer tick redelivers.
//!
//! An OS mutex would be unsound here; the flag plus signal masking is the
//! whole protocol.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::SAMPLE_SIGNAL;
use crate::perf::PerfSampler;
use crate::timer::SampleTimer;

/// Which side of the latch is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Thread,
    Signal,
}

/// Profiling state owned by one thread.
pub struct ThreadState {
    /// Kernel sampler for this thread; present between begin/end sampling.
    pub sampler: Option<PerfSampler>,
    /// Timer raising the sample signal on this thread.
    pub timer: Option<SampleTimer>,
    /// Virtual delays this thread has skipped by running the selected line.
    pub delay_count: u64,
    /// Time already paused in excess of what was required, in nanoseconds.
    pub excess_delay: u64,
    /// `global_delays` captured by `snapshot_delays`.
    pub global_delay_snapshot: u64,
    /// `delay_count` captured by `snapshot_delays`.
    pub local_delay_snapshot: u64,
}

impl ThreadState {
    pub const fn new() -> Self {
        ThreadState {
            sampler: None,
            timer: None,
            delay_count: 0,
            excess_delay: 0,
            global_delay_snapshot: 0,
            local_delay_snapshot: 0,
        }
    }
}

// The slot never leaves its thread; the signal handler that shares it runs
// on the same thread and is serialized by `locked`.
struct Slot {
    locked: AtomicBool,
    state: UnsafeCell<ThreadState>,
}

thread_local! {
    static SLOT: Slot = const {
        Slot {
            locked: AtomicBool::new(false),
            state: UnsafeCell::new(ThreadState::new()),
        }
    };
}

/// Run `f` with exclusive access to the calling thread's state.
///
/// Returns `None` when the latch cannot be taken: in signal mode on
/// contention, and in either mode while the thread's TLS is being torn down.
pub fn with_state<R>(context: Context, f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
    SLOT.try_with(|slot| {
        match context {
            Context::Signal => {
                if slot
                    .locked
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    return None;
                }
                // SAFETY: the flag grants exclusive access; the handler and
                // the thread cannot both be here.
                let result = f(unsafe { &mut *slot.state.get() });
                slot.locked.store(false, Ordering::Release);
                Some(result)
            }
            Context::Thread => {
                let old_mask = block_sample_signal();
                if slot
                    .locked
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    restore_mask(&old_mask);
                    return None;
                }
                // SAFETY: as above; additionally the sample signal is blocked
                // so the handler cannot preempt this section.
                let result = f(unsafe { &mut *slot.state.get() });
                slot.locked.store(false, Ordering::Release);
                restore_mask(&old_mask);
                Some(result)
            }
        }
    })
    .ok()
    .flatten()
}

fn block_sample_signal() -> libc::sigset_t {
    unsafe {
        let mut block: libc::sigset_t = mem::zeroed();
        let mut old: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut block);
        libc::sigaddset(&mut block, SAMPLE_SIGNAL);
        libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut old);
        old
    }
}

fn restore_mask(mask: &libc::sigset_t) {
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, mask, std::ptr::null_mut());
    }
}
