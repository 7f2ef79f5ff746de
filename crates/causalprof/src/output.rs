//! Event-log output sink.
//!
//! Every profiling event becomes one tab-separated line in the output file:
//!
//! ```text
//! startup	sample-period=1000000
//! counter	name=src/main.rs:10	line=src/main.rs:10
//! start-round	line=src/worker.rs:42
//! end-round	delays=17	delay-size=500000
//! progress	name=src/main.rs:10	samples=412
//! shutdown
//! ```
//!
//! The sink is append-only and shared by all threads. Writes happen from
//! sample processing, where the holder cannot be preempted by the sample
//! signal, so the mutex cannot self-deadlock. Write failures are swallowed:
//! the profiler is a side channel and must not perturb the application.

use crate::error::Result;
use crate::symbols::Line;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A progress counter that reports the sample count of a source line.
struct SamplingCounter {
    name: String,
    line: Arc<Line>,
}

/// Serializer for the profiling event stream.
pub struct Output {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
    counters: Mutex<Vec<SamplingCounter>>,
}

impl Output {
    /// Create the output file, truncating any previous profile.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(Box::new(file)))
    }

    /// Build a sink over an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Output {
            writer: Mutex::new(BufWriter::new(writer)),
            counters: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, record: &str) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", record);
            let _ = writer.flush();
        }
    }

    /// Register a sampling counter and log its registration.
    pub fn add_counter(&self, name: &str, line: Arc<Line>) {
        self.emit(&format!("counter\tname={}\tline={}", name, line.name()));
        if let Ok(mut counters) = self.counters.lock() {
            counters.push(SamplingCounter {
                name: name.to_string(),
                line,
            });
        }
    }

    pub fn startup(&self, sample_period_ns: u64) {
        self.emit(&format!("startup\tsample-period={}", sample_period_ns));
    }

    pub fn start_round(&self, line: &Line) {
        self.emit(&format!("start-round\tline={}", line.name()));
    }

    /// Log the end of a round, followed by the current value of every
    /// registered progress counter.
    pub fn end_round(&self, delays: u64, delay_size_ns: u64) {
        self.emit(&format!(
            "end-round\tdelays={}\tdelay-size={}",
            delays, delay_size_ns
        ));
        if let Ok(counters) = self.counters.lock() {
            for counter in counters.iter() {
                self.emit(&format!(
                    "progress\tname={}\tsamples={}",
                    counter.name,
                    counter.line.samples()
                ));
            }
        }
    }

    pub fn shutdown(&self) {
        self.emit("shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test writer that exposes everything written through a shared buffer.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
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

    fn test_line() -> Arc<Line> {
        Arc::new(Line::new("src/main.rs", 10, 0))
    }

    #[test]
    fn event_lines_are_tab_separated() {
        let buf = SharedBuf::default();
        let out = Output::from_writer(Box::new(buf.clone()));

        out.startup(1_000_000);
        out.start_round(&test_line());
        out.end_round(17, 500_000);
        out.shutdown();

        let text = buf.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "startup\tsample-period=1000000");
        assert_eq!(lines[1], "start-round\tline=src/main.rs:10");
        assert_eq!(lines[2], "end-round\tdelays=17\tdelay-size=500000");
        assert_eq!(lines[3], "shutdown");
    }

    #[test]
    fn counters_report_progress_at_round_end() {
        let buf = SharedBuf::default();
        let out = Output::from_writer(Box::new(buf.clone()));
        let line = test_line();

        out.add_counter("src/main.rs:10", Arc::clone(&line));
        line.add_sample();
        line.add_sample();
        out.end_round(0, 0);

        let text = buf.contents();
        assert!(text.contains("counter\tname=src/main.rs:10\tline=src/main.rs:10"));
        assert!(text.contains("progress\tname=src/main.rs:10\tsamples=2"));
    }

    #[test]
    fn create_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.causal");
        let out = Output::create(&path).unwrap();
        out.startup(1_000_000);
        drop(out);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("startup\t"));
    }
}
