//! Tunables and runtime configuration.
//!
//! The compile-time constants below control the sampling and round machinery.
//! Runtime settings come from `CAUSALPROF_*` environment variables (the usual
//! path when the profiler is linked into an application) or from a `Config`
//! built directly by an embedder.

use std::env;
use std::path::PathBuf;

/// Nanoseconds of task-clock time per CPU sample.
pub const SAMPLE_PERIOD_NS: u64 = 1_000_000;

/// Samples accumulated in the kernel buffer per timer wakeup.
pub const SAMPLE_WAKEUP_COUNT: u64 = 10;

/// Samples required to close a speedup round.
pub const MIN_ROUND_SAMPLES: u64 = 200;

/// Granularity of the random delay size: delay ∈ {0, 1/N, ..., 1} × period.
pub const SPEEDUP_DIVISIONS: u64 = 20;

/// Real-time signal used for sample delivery. Chosen above the glibc-reserved
/// range and away from SIGPROF so host-application tooling is unaffected.
pub const SAMPLE_SIGNAL: libc::c_int = 42;

/// Runtime configuration for a profiling session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the event-log output file.
    pub output_file: PathBuf,
    /// `"file:line"` specs to register as sampling progress counters.
    pub progress_names: Vec<String>,
    /// Source directory prefixes considered in scope. Empty means the
    /// current working directory.
    pub scope: Vec<PathBuf>,
    /// `"file:line"` spec every round is pinned to, if non-empty.
    pub fixed_line_name: String,
    /// Fixed speedup percentage; values outside 0..=100 mean unset.
    pub fixed_speedup: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_file: PathBuf::from("profile.causal"),
            progress_names: Vec::new(),
            scope: Vec::new(),
            fixed_line_name: String::new(),
            fixed_speedup: -1,
        }
    }
}

impl Config {
    /// Build a configuration from `CAUSALPROF_*` environment variables.
    ///
    /// - `CAUSALPROF_OUTPUT`: output file path
    /// - `CAUSALPROF_PROGRESS`: comma-separated `"file:line"` counter specs
    /// - `CAUSALPROF_SCOPE`: colon-separated source directory prefixes
    /// - `CAUSALPROF_FIXED_LINE`: `"file:line"` to pin every round to
    /// - `CAUSALPROF_FIXED_SPEEDUP`: integer percentage in 0..=100
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(path) = env::var_os("CAUSALPROF_OUTPUT") {
            config.output_file = PathBuf::from(path);
        }
        if let Ok(progress) = env::var("CAUSALPROF_PROGRESS") {
            config.progress_names = progress
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(scope) = env::var("CAUSALPROF_SCOPE") {
            config.scope = scope
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(line) = env::var("CAUSALPROF_FIXED_LINE") {
            config.fixed_line_name = line;
        }
        if let Ok(speedup) = env::var("CAUSALPROF_FIXED_SPEEDUP") {
            config.fixed_speedup = speedup.trim().parse().unwrap_or(-1);
        }

        config
    }

    /// Delay size in nanoseconds implied by `fixed_speedup`, or `None` when
    /// the speedup is unset or out of range.
    pub fn fixed_delay_size(&self) -> Option<u64> {
        if (0..=100).contains(&self.fixed_speedup) {
            Some(SAMPLE_PERIOD_NS * self.fixed_speedup as u64 / 100)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_size_bounds() {
        let mut config = Config::default();
        assert_eq!(config.fixed_delay_size(), None);

        config.fixed_speedup = 0;
        assert_eq!(config.fixed_delay_size(), Some(0));

        config.fixed_speedup = 50;
        assert_eq!(config.fixed_delay_size(), Some(SAMPLE_PERIOD_NS / 2));

        config.fixed_speedup = 100;
        assert_eq!(config.fixed_delay_size(), Some(SAMPLE_PERIOD_NS));

        config.fixed_speedup = 101;
        assert_eq!(config.fixed_delay_size(), None);
    }

    #[test]
    fn progress_list_splits_on_commas() {
        let spec = "src/main.rs:10, src/worker.rs:42 ,,";
        let names: Vec<String> = spec
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        assert_eq!(names, vec!["src/main.rs:10", "src/worker.rs:42"]);
    }
}
