//! Per-thread CPU sampling via perf_event.
//!
//! Each profiled thread owns one task-clock sampler that records the
//! instruction pointer and callchain every `SAMPLE_PERIOD_NS` of consumed CPU
//! time. Records accumulate in a kernel ring buffer and are drained from the
//! sample-signal handler, so decoding never allocates: callchains are copied
//! into a fixed-size array.

use libc::{self, c_int, c_ulong, syscall, SYS_perf_event_open};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use crate::config::{SAMPLE_PERIOD_NS, SAMPLE_WAKEUP_COUNT};
use crate::error::{Error, Result};

// perf_event constants (from linux/perf_event.h)
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;

const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;

/// perf_event_attr structure
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl PerfEventAttr {
    // Flag bit positions
    const DISABLED_BIT: u64 = 1 << 0;
    const EXCLUDE_KERNEL_BIT: u64 = 1 << 5;
    const EXCLUDE_HV_BIT: u64 = 1 << 6;
    const EXCLUDE_IDLE_BIT: u64 = 1 << 7;

    pub fn new() -> Self {
        PerfEventAttr {
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            ..Default::default()
        }
    }

    pub fn set_disabled(&mut self, val: bool) {
        if val {
            self.flags |= Self::DISABLED_BIT;
        } else {
            self.flags &= !Self::DISABLED_BIT;
        }
    }

    pub fn set_exclude_kernel(&mut self, val: bool) {
        if val {
            self.flags |= Self::EXCLUDE_KERNEL_BIT;
        } else {
            self.flags &= !Self::EXCLUDE_KERNEL_BIT;
        }
    }

    pub fn set_exclude_hv(&mut self, val: bool) {
        if val {
            self.flags |= Self::EXCLUDE_HV_BIT;
        } else {
            self.flags &= !Self::EXCLUDE_HV_BIT;
        }
    }

    pub fn set_exclude_idle(&mut self, val: bool) {
        if val {
            self.flags |= Self::EXCLUDE_IDLE_BIT;
        } else {
            self.flags &= !Self::EXCLUDE_IDLE_BIT;
        }
    }
}

/// perf_event_mmap_page header structure
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// perf_event_header for records in the ring buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

// Record types
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Deepest callchain kept per sample.
pub const MAX_CALLCHAIN: usize = 64;

/// A decoded sample: interrupted instruction pointer plus return addresses.
#[derive(Clone, Copy)]
pub struct Sample {
    pub ip: u64,
    callchain: [u64; MAX_CALLCHAIN],
    callchain_len: usize,
}

impl Sample {
    pub fn callchain(&self) -> &[u64] {
        &self.callchain[..self.callchain_len]
    }
}

/// One ring-buffer record.
pub enum Record {
    Sample(Sample),
    /// Non-sample record kind (mmap, lost, throttle, ...); skipped.
    Other,
}

/// Kernel-backed sampler for the calling thread. Lives in the thread's own
/// state slot and never crosses a thread boundary; the signal handler that
/// shares it is serialized by the thread-state latch.
pub struct PerfSampler {
    fd: OwnedFd,
    mmap: *mut u8,
    mmap_size: usize,
    data_size: usize,
}

impl PerfSampler {
    /// Open a disabled task-clock sampler for the calling thread.
    pub fn open() -> Result<Self> {
        let mut attr = PerfEventAttr::new();
        attr.type_ = PERF_TYPE_SOFTWARE;
        attr.config = PERF_COUNT_SW_TASK_CLOCK;
        attr.sample_type = PERF_SAMPLE_IP | PERF_SAMPLE_CALLCHAIN;
        attr.sample_period_or_freq = SAMPLE_PERIOD_NS;
        attr.wakeup_events_or_watermark = SAMPLE_WAKEUP_COUNT as u32;
        attr.set_disabled(true);
        attr.set_exclude_kernel(true);
        attr.set_exclude_hv(true);
        attr.set_exclude_idle(true);

        let fd = unsafe {
            syscall(
                SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                0 as libc::pid_t, // calling thread
                -1 as c_int,      // any CPU
                -1 as c_int,      // no group
                0 as c_ulong,
            )
        };

        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EPERM) => Error::PerfEvent(format!(
                    "perf_event_open denied: {}. Try: sudo sysctl kernel.perf_event_paranoid=1",
                    err
                )),
                _ => Error::PerfEvent(format!("perf_event_open failed: {}", err)),
            });
        }

        let fd = unsafe { OwnedFd::from_raw_fd(fd as c_int) };

        // Memory map the ring buffer: 1 metadata page + data pages
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let data_pages = 64;
        let mmap_size = (1 + data_pages) * page_size;
        let data_size = data_pages * page_size;

        let mmap = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if mmap == libc::MAP_FAILED {
            return Err(Error::PerfEvent(format!(
                "failed to mmap perf buffer: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(PerfSampler {
            fd,
            mmap: mmap as *mut u8,
            mmap_size,
            data_size,
        })
    }

    /// Enable counting.
    pub fn start(&self) {
        unsafe {
            libc::ioctl(self.fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0);
        }
    }

    /// Disable counting. Buffered records remain readable.
    pub fn stop(&self) {
        unsafe {
            libc::ioctl(self.fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE, 0);
        }
    }

    /// Drain all currently buffered records.
    pub fn drain(&mut self) -> Drain<'_> {
        let header = unsafe { &*(self.mmap as *const PerfEventMmapPage) };

        // Read barrier pairs with the kernel's publication of data_head
        fence(Ordering::Acquire);
        let head = header.data_head;
        let tail = header.data_tail;

        Drain {
            sampler: self,
            tail,
            head,
        }
    }

    /// Copy `buf.len()` bytes out of the ring at `offset`, handling wrap.
    fn copy_bytes(&self, offset: u64, buf: &mut [u8]) {
        let header = unsafe { &*(self.mmap as *const PerfEventMmapPage) };
        let data_ptr = unsafe { self.mmap.add(header.data_offset as usize) };

        for (i, byte) in buf.iter_mut().enumerate() {
            let pos = ((offset + i as u64) % self.data_size as u64) as usize;
            *byte = unsafe { *data_ptr.add(pos) };
        }
    }

    fn read_u64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.copy_bytes(offset, &mut buf);
        u64::from_ne_bytes(buf)
    }

    fn commit_tail(&mut self, tail: u64) {
        // Write barrier before publishing the new tail to the kernel
        fence(Ordering::Release);
        unsafe {
            let header = &mut *(self.mmap as *mut PerfEventMmapPage);
            header.data_tail = tail;
        }
    }
}

impl Drop for PerfSampler {
    fn drop(&mut self) {
        unsafe {
            libc::ioctl(self.fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE, 0);
            libc::munmap(self.mmap as *mut libc::c_void, self.mmap_size);
        }
    }
}

/// Iterator over buffered records; consumed positions are released to the
/// kernel as the iterator advances.
pub struct Drain<'a> {
    sampler: &'a mut PerfSampler,
    tail: u64,
    head: u64,
}

impl Drain<'_> {
    fn parse_sample(&self, body: u64, body_len: u64) -> Option<Sample> {
        // Layout for PERF_SAMPLE_IP | PERF_SAMPLE_CALLCHAIN:
        //   u64 ip; u64 nr; u64 ips[nr];
        if body_len < 16 {
            return None;
        }
        let ip = self.sampler.read_u64(body);
        let nr = self.sampler.read_u64(body + 8);
        if 16 + nr.checked_mul(8)? > body_len {
            return None;
        }

        let mut callchain = [0u64; MAX_CALLCHAIN];
        let callchain_len = (nr as usize).min(MAX_CALLCHAIN);
        for (i, slot) in callchain[..callchain_len].iter_mut().enumerate() {
            *slot = self.sampler.read_u64(body + 16 + 8 * i as u64);
        }

        Some(Sample {
            ip,
            callchain,
            callchain_len,
        })
    }
}

impl Iterator for Drain<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        const HEADER_SIZE: usize = std::mem::size_of::<PerfEventHeader>();

        while self.tail < self.head {
            let mut header_buf = [0u8; HEADER_SIZE];
            self.sampler.copy_bytes(self.tail, &mut header_buf);
            // SAFETY: PerfEventHeader is a repr(C) POD of exactly this size.
            let header: PerfEventHeader = unsafe { std::mem::transmute(header_buf) };
            let size = header.size as u64;

            // An undersized record means the buffer is corrupt; abandon it.
            if size < HEADER_SIZE as u64 || self.tail + size > self.head {
                self.tail = self.head;
                break;
            }

            let body = self.tail + HEADER_SIZE as u64;
            let body_len = size - HEADER_SIZE as u64;
            self.tail += size;

            if header.type_ == PERF_RECORD_SAMPLE {
                match self.parse_sample(body, body_len) {
                    Some(sample) => return Some(Record::Sample(sample)),
                    // Malformed sample: skip it, keep draining.
                    None => continue,
                }
            }
            return Some(Record::Other);
        }
        None
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        let tail = self.tail;
        self.sampler.commit_tail(tail);
    }
}
