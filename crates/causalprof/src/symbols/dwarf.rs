use gimli::{EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use std::fs::File;
use std::path::Path;

use crate::error::{Error, Result};

/// An address range attributed to one source line, in link-time addresses.
#[derive(Debug, Clone)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
    pub file: String,
    pub line: u32,
}

/// Extract line-table ranges from one ELF object.
///
/// Objects without DWARF line info (stripped system libraries) yield an empty
/// vector rather than an error; only unreadable or unparsable files fail.
pub fn line_ranges(path: &Path) -> Result<Vec<LineRange>> {
    let file = File::open(path).map_err(Error::Io)?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(Error::Io)?;

    let object = object::File::parse(&*mmap)
        .map_err(|e| Error::SymbolResolution(format!("failed to parse {}: {}", path.display(), e)))?;

    if object.section_by_name(".debug_line").is_none() {
        return Ok(Vec::new());
    }

    let endian = if object.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    // Helper to load a section's data
    let load_section = |name: &str| -> &[u8] {
        object
            .section_by_name(name)
            .and_then(|s| s.data().ok())
            .unwrap_or(&[])
    };

    let dwarf = gimli::Dwarf {
        debug_abbrev: gimli::DebugAbbrev::new(load_section(".debug_abbrev"), endian),
        debug_info: gimli::DebugInfo::new(load_section(".debug_info"), endian),
        debug_line: gimli::DebugLine::new(load_section(".debug_line"), endian),
        debug_str: gimli::DebugStr::new(load_section(".debug_str"), endian),
        debug_line_str: gimli::DebugLineStr::new(load_section(".debug_line_str"), endian),
        debug_str_offsets: gimli::DebugStrOffsets::from(gimli::EndianSlice::new(
            load_section(".debug_str_offsets"),
            endian,
        )),
        debug_addr: gimli::DebugAddr::from(gimli::EndianSlice::new(
            load_section(".debug_addr"),
            endian,
        )),
        ..Default::default()
    };

    parse_line_ranges(&dwarf)
}

fn parse_line_ranges(
    dwarf: &gimli::Dwarf<EndianSlice<'_, RunTimeEndian>>,
) -> Result<Vec<LineRange>> {
    let mut ranges = Vec::new();
    let mut units = dwarf.units();

    while let Ok(Some(header)) = units.next() {
        let unit = match dwarf.unit(header) {
            Ok(unit) => unit,
            Err(e) => {
                return Err(Error::SymbolResolution(format!(
                    "failed to parse unit: {}",
                    e
                )))
            }
        };

        let comp_dir = unit
            .comp_dir
            .and_then(|d| d.to_string().ok().map(String::from));

        let program = match unit.line_program.clone() {
            Some(program) => program,
            None => continue,
        };

        let mut rows = program.rows();
        let mut prev_row: Option<(u64, String, u32)> = None;

        while let Ok(Some((header, row))) = rows.next_row() {
            let addr = row.address();

            let file = row
                .file(header)
                .map(|f| {
                    let mut path = String::new();

                    if let Some(dir) = f.directory(header) {
                        if let Ok(dir_str) = dwarf.attr_string(&unit, dir) {
                            if let Ok(s) = dir_str.to_string() {
                                path.push_str(s);
                                if !path.ends_with('/') {
                                    path.push('/');
                                }
                            }
                        }
                    }

                    if let Ok(name) = dwarf.attr_string(&unit, f.path_name()) {
                        if let Ok(s) = name.to_string() {
                            path.push_str(s);
                        }
                    }

                    // DWARF directories may be relative to the compilation dir.
                    if !path.starts_with('/') {
                        if let Some(dir) = &comp_dir {
                            path = format!("{}/{}", dir.trim_end_matches('/'), path);
                        }
                    }

                    path
                })
                .unwrap_or_default();

            let line = row.line().map(|l| l.get() as u32).unwrap_or(0);

            // Close the range from the previous row to this one
            if let Some((prev_addr, prev_file, prev_line)) = prev_row.take() {
                if addr > prev_addr && !prev_file.is_empty() && prev_line > 0 {
                    ranges.push(LineRange {
                        start: prev_addr,
                        end: addr,
                        file: prev_file,
                        line: prev_line,
                    });
                }
            }

            if !row.end_sequence() {
                prev_row = Some((addr, file, line));
            }
        }
    }

    // Sort by start address for binary search
    ranges.sort_by_key(|r| r.start);
    Ok(ranges)
}
