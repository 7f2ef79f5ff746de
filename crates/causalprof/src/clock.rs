//! Monotonic time and the pause primitive used by the delay engine.

/// Current monotonic time in nanoseconds.
#[inline]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

/// Sleep for at least `duration_ns` nanoseconds and return the time actually
/// elapsed.
///
/// Sleeps against an absolute monotonic deadline and resumes after EINTR, so
/// an interrupting signal (including the sample signal) never shortens the
/// pause. The returned value is always >= `duration_ns`; the caller banks the
/// overshoot as excess-delay credit.
pub fn wait_ns(duration_ns: u64) -> u64 {
    let start = now_ns();
    if duration_ns == 0 {
        return 0;
    }

    let deadline = start + duration_ns;
    let ts = libc::timespec {
        tv_sec: (deadline / 1_000_000_000) as libc::time_t,
        tv_nsec: (deadline % 1_000_000_000) as libc::c_long,
    };

    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if rc != libc::EINTR {
            break;
        }
    }

    now_ns() - start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_at_least_requested() {
        let requested = 200_000; // 0.2 ms
        let actual = wait_ns(requested);
        assert!(actual >= requested);
    }

    #[test]
    fn zero_wait_is_free() {
        assert_eq!(wait_ns(0), 0);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
