use std::fs;
use std::path::PathBuf;

use crate::error::Result;

/// A parsed memory mapping from /proc/self/maps.
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }
}

/// Memory mappings of the running process.
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMaps {
    /// Parse /proc/self/maps.
    pub fn current() -> Result<Self> {
        let content = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::parse(&content))
    }

    fn parse(content: &str) -> Self {
        let mappings = content.lines().filter_map(Self::parse_line).collect();
        MemoryMaps { mappings }
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let perms = parts[1].to_string();
        let offset = u64::from_str_radix(parts[2], 16).ok()?;

        let pathname = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    /// File-backed objects with at least one executable mapping, paired with
    /// their load bias (runtime address minus file offset of the lowest
    /// mapping, which is the value to add to DWARF addresses of PIE objects).
    pub fn executable_objects(&self) -> Vec<(PathBuf, u64)> {
        let mut objects: Vec<(PathBuf, u64)> = Vec::new();

        for mapping in &self.mappings {
            let path = match &mapping.pathname {
                Some(p) if !p.starts_with('[') => p,
                _ => continue,
            };
            if !mapping.is_executable() {
                continue;
            }

            if !objects.iter().any(|(seen, _)| seen.as_os_str() == path.as_str()) {
                let bias = self.load_bias(path);
                objects.push((PathBuf::from(path), bias));
            }
        }

        objects
    }

    /// Load bias for one object: the first mapping of the file usually has
    /// offset 0 and gives the true base. Using an executable segment directly
    /// would be wrong because its file offset is non-zero.
    fn load_bias(&self, path: &str) -> u64 {
        self.mappings
            .iter()
            .filter(|m| m.pathname.as_deref() == Some(path) && m.end > m.start)
            .map(|m| m.start - m.offset)
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
555555554000-555555558000 r--p 00000000 08:01 1234 /opt/app/demo
555555558000-55555555c000 r-xp 00004000 08:01 1234 /opt/app/demo
7ffff7d80000-7ffff7da0000 r--p 00000000 08:01 5678 /usr/lib/libc.so.6
7ffff7da0000-7ffff7f00000 r-xp 00020000 08:01 5678 /usr/lib/libc.so.6
7ffff7fc0000-7ffff7fc4000 r-xp 00000000 00:00 0 [vdso]
7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0 [stack]";

    #[test]
    fn parses_mappings() {
        let maps = MemoryMaps::parse(SAMPLE);
        assert_eq!(maps.mappings.len(), 6);
        assert_eq!(maps.mappings[0].start, 0x555555554000);
        assert_eq!(maps.mappings[1].perms, "r-xp");
        assert_eq!(
            maps.mappings[0].pathname.as_deref(),
            Some("/opt/app/demo")
        );
    }

    #[test]
    fn executable_objects_dedupe_and_skip_pseudo() {
        let maps = MemoryMaps::parse(SAMPLE);
        let objects = maps.executable_objects();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].0, PathBuf::from("/opt/app/demo"));
        assert_eq!(objects[1].0, PathBuf::from("/usr/lib/libc.so.6"));
    }

    #[test]
    fn load_bias_uses_lowest_mapping() {
        let maps = MemoryMaps::parse(SAMPLE);
        let objects = maps.executable_objects();
        // First mapping has offset 0, so bias equals its start address.
        assert_eq!(objects[0].1, 0x555555554000);
    }

    #[test]
    fn short_lines_are_ignored() {
        let maps = MemoryMaps::parse("garbage\n");
        assert!(maps.mappings.is_empty());
    }
}
