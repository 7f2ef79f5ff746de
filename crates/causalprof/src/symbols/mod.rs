//! Address-to-source-line resolution.
//!
//! `AddressMap::build` walks the executable mappings of the running process,
//! extracts DWARF line tables, and interns one [`Line`] per (file, line)
//! inside the configured source scope. Lookups by instruction pointer and by
//! `"file:line"` name are answered from a sorted range table. The map is
//! read-only after startup.

mod dwarf;
mod maps;

pub use maps::MemoryMaps;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};

/// A source line with its monotonic counter of attributed samples.
///
/// Lines are interned by the [`AddressMap`]; the dense `index` lets the
/// profiler store "the currently selected line" in a single atomic without
/// touching the `Arc` reference count.
#[derive(Debug)]
pub struct Line {
    file: String,
    line: u32,
    index: usize,
    samples: AtomicU64,
}

impl Line {
    pub(crate) fn new(file: &str, line: u32, index: usize) -> Self {
        Line {
            file: file.to_string(),
            line,
            index,
            samples: AtomicU64::new(0),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Format as `file:line`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }

    pub fn add_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// Split a `"file:line"` spec into its parts.
pub fn parse_line_spec(spec: &str) -> Result<(&str, u32)> {
    let (file, line) = spec
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidLineSpec(spec.to_string()))?;
    let line: u32 = line
        .parse()
        .map_err(|_| Error::InvalidLineSpec(spec.to_string()))?;
    if file.is_empty() {
        return Err(Error::InvalidLineSpec(spec.to_string()));
    }
    Ok((file, line))
}

#[derive(Debug, Clone)]
struct AddrRange {
    start: u64,
    end: u64,
    line_index: usize,
}

/// Address-to-source-line resolver over all loaded binaries.
pub struct AddressMap {
    lines: Vec<Arc<Line>>,
    by_name: HashMap<(String, u32), usize>,
    ranges: Vec<AddrRange>,
}

impl AddressMap {
    pub(crate) fn empty() -> Self {
        AddressMap {
            lines: Vec::new(),
            by_name: HashMap::new(),
            ranges: Vec::new(),
        }
    }

    /// Build the map from the debug info of every executable file-backed
    /// mapping of this process whose source paths fall within `scope`.
    pub fn build(scope: &[PathBuf]) -> Result<Self> {
        let mut map = AddressMap::empty();
        let maps = MemoryMaps::current()?;

        for (path, bias) in maps.executable_objects() {
            let ranges = match dwarf::line_ranges(&path) {
                Ok(ranges) => ranges,
                Err(e) => {
                    debug!(object = %path.display(), error = %e, "skipping object");
                    continue;
                }
            };

            for range in ranges {
                if !in_scope(scope, &range.file) {
                    continue;
                }
                let index = map.intern(&range.file, range.line);
                map.add_range(range.start + bias, range.end + bias, index);
            }
        }

        map.ranges.sort_by_key(|r| r.start);
        debug!(
            lines = map.len(),
            ranges = map.ranges.len(),
            "address map built"
        );
        Ok(map)
    }

    pub(crate) fn intern(&mut self, file: &str, line: u32) -> usize {
        let key = (file.to_string(), line);
        if let Some(&index) = self.by_name.get(&key) {
            return index;
        }
        let index = self.lines.len();
        self.lines.push(Arc::new(Line::new(file, line, index)));
        self.by_name.insert(key, index);
        index
    }

    fn add_range(&mut self, start: u64, end: u64, line_index: usize) {
        self.ranges.push(AddrRange {
            start,
            end,
            line_index,
        });
    }

    /// Nearest enclosing source line for an instruction pointer.
    pub fn find_line(&self, addr: u64) -> Option<&Arc<Line>> {
        let idx = self
            .ranges
            .binary_search_by(|r| {
                if addr < r.start {
                    std::cmp::Ordering::Greater
                } else if addr >= r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()?;
        self.lines.get(self.ranges[idx].line_index)
    }

    /// Look up a line by `"file:line"`. The file component matches any line
    /// whose path ends with it, so `"worker.rs:42"` finds
    /// `/home/app/src/worker.rs:42`.
    pub fn find_line_named(&self, spec: &str) -> Option<&Arc<Line>> {
        let (file, line) = parse_line_spec(spec).ok()?;
        self.lines
            .iter()
            .find(|l| l.line == line && path_matches(&l.file, file))
    }

    /// Line for a dense index handed out by this map.
    pub fn line_at(&self, index: usize) -> Option<&Arc<Line>> {
        self.lines.get(index)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// A spec path matches when it equals the line's path or a trailing path
/// component sequence of it.
fn path_matches(full: &str, spec: &str) -> bool {
    if full == spec {
        return true;
    }
    full.ends_with(spec)
        && full.as_bytes()[full.len() - spec.len() - 1] == b'/'
}

fn in_scope(scope: &[PathBuf], file: &str) -> bool {
    let path = Path::new(file);
    scope.iter().any(|prefix| path.starts_with(prefix))
}
