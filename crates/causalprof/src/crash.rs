//! Fatal-signal reporting.
//!
//! When the instrumented application crashes, print the faulting address and
//! a symbolic backtrace to stderr and exit with status 2. The report path
//! formats into a fixed stack buffer and writes with raw `write(2)`; the only
//! allocation happens inside glibc's `backtrace_symbols`, after the process
//! is already doomed.

use std::fmt::{self, Write as _};
use std::mem;
use std::ptr;

use crate::error::{Error, Result};

// Not exposed by the libc crate; provided by glibc's execinfo.
extern "C" {
    fn backtrace(buffer: *mut *mut libc::c_void, size: libc::c_int) -> libc::c_int;
    fn backtrace_symbols(
        buffer: *const *mut libc::c_void,
        size: libc::c_int,
    ) -> *mut *mut libc::c_char;
}

const MAX_FRAMES: usize = 256;

/// Install the crash reporter for SIGSEGV and SIGABRT.
pub fn install() -> Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = on_error as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);

        for signo in [libc::SIGSEGV, libc::SIGABRT] {
            if libc::sigaction(signo, &sa, ptr::null_mut()) != 0 {
                return Err(Error::Signal(format!(
                    "sigaction({}) failed: {}",
                    signo,
                    std::io::Error::last_os_error()
                )));
            }
        }
    }
    Ok(())
}

extern "C" fn on_error(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let mut line = LineBuf::new();
    if signum == libc::SIGSEGV {
        let addr = unsafe { (*info).si_addr() };
        let _ = writeln!(line, "Segmentation fault at {:p}", addr);
    } else if signum == libc::SIGABRT {
        let _ = writeln!(line, "Aborted!");
    } else {
        let _ = writeln!(line, "Signal {}", signum);
    }
    write_stderr(line.bytes());

    unsafe {
        let mut frames = [ptr::null_mut::<libc::c_void>(); MAX_FRAMES];
        let count = backtrace(frames.as_mut_ptr(), MAX_FRAMES as libc::c_int);
        let symbols = backtrace_symbols(frames.as_ptr(), count);

        for i in 0..count {
            let mut line = LineBuf::new();
            if symbols.is_null() {
                let _ = writeln!(line, "  {}: {:p}", i, frames[i as usize]);
            } else {
                let symbol = std::ffi::CStr::from_ptr(*symbols.offset(i as isize));
                let _ = writeln!(line, "  {}: {}", i, symbol.to_string_lossy());
            }
            write_stderr(line.bytes());
        }

        libc::_exit(2);
    }
}

fn write_stderr(bytes: &[u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

/// Fixed-capacity line formatter; overlong output is truncated.
struct LineBuf {
    buf: [u8; 512],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        LineBuf {
            buf: [0; 512],
            len: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn line_buf_formats_and_truncates() {
        let mut line = LineBuf::new();
        write!(line, "Segmentation fault at 0x{:x}", 0xdeadbeefu64).unwrap();
        assert_eq!(line.bytes(), b"Segmentation fault at 0xdeadbeef");

        let mut line = LineBuf::new();
        let long = "x".repeat(1024);
        write!(line, "{}", long).unwrap();
        assert_eq!(line.bytes().len(), 512);
    }
}
