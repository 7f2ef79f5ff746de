//! Per-thread sample-signal timer.
//!
//! Each profiled thread arms one POSIX timer on its own CPU-time clock so
//! the sample signal fires on that thread, and only when it is actually
//! burning CPU. The interval is a multiple of the sample period: the kernel
//! buffers `SAMPLE_WAKEUP_COUNT` samples between wakeups.

use std::mem;
use std::ptr;

use crate::error::{Error, Result};

/// Periodic timer that raises `signo` on the creating thread.
pub struct SampleTimer {
    timer_id: libc::timer_t,
}

impl SampleTimer {
    /// Create a disarmed timer delivering `signo` to the calling thread.
    pub fn new(signo: libc::c_int) -> Result<Self> {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::c_int;

        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = signo;
        sev.sigev_notify_thread_id = tid;

        let mut timer_id: libc::timer_t = ptr::null_mut();
        let rc = unsafe {
            libc::timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut sev, &mut timer_id)
        };
        if rc != 0 {
            return Err(Error::Timer(format!(
                "timer_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(SampleTimer { timer_id })
    }

    /// Arm the timer to fire every `interval_ns` of thread CPU time.
    pub fn start_interval(&self, interval_ns: u64) -> Result<()> {
        let ts = libc::timespec {
            tv_sec: (interval_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (interval_ns % 1_000_000_000) as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };

        let rc = unsafe { libc::timer_settime(self.timer_id, 0, &spec, ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::Timer(format!(
                "timer_settime failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Disarm without destroying the timer.
    pub fn stop(&self) {
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let spec = libc::itimerspec {
            it_interval: zero,
            it_value: zero,
        };
        unsafe {
            libc::timer_settime(self.timer_id, 0, &spec, ptr::null_mut());
        }
    }
}

impl Drop for SampleTimer {
    fn drop(&mut self) {
        unsafe {
            libc::timer_delete(self.timer_id);
        }
    }
}
