//! Library discovery from /proc/<pid>/maps
//!
//! Each module's text segment is its executable mapping. The relocation bias
//! is the address the module's offset 0 is mapped at.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::task::{Library, LibraryKind};

/// One parsed line of a maps file
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    start: u64,
    end: u64,
    executable: bool,
    offset: u64,
    path: String,
}

fn parse_line(line: &str) -> Option<Mapping> {
    // "start-end perms offset dev inode pathname"
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.collect::<Vec<_>>().join(" ");

    let (start, end) = range.split_once('-')?;
    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

fn kind_of(path: &str, exe: Option<&Path>) -> LibraryKind {
    if path == "[vdso]" {
        return LibraryKind::Vdso;
    }
    if exe.is_some_and(|exe| exe == Path::new(path)) {
        return LibraryKind::Main;
    }
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if name.starts_with("ld-") || name.starts_with("ld.so") {
        LibraryKind::Loader
    } else {
        LibraryKind::Library
    }
}

/// Build the library list from the text of a maps file
pub fn parse_maps(text: &str, exe: Option<&Path>) -> Vec<Library> {
    let mappings: Vec<Mapping> = text.lines().filter_map(parse_line).collect();

    let mut bases: HashMap<&str, u64> = HashMap::new();
    for m in &mappings {
        let base = m.start.wrapping_sub(m.offset);
        bases
            .entry(m.path.as_str())
            .and_modify(|b| *b = (*b).min(base))
            .or_insert(base);
    }

    let mut libs: Vec<Library> = Vec::new();
    for m in &mappings {
        let named = m.path.starts_with('/') || m.path == "[vdso]";
        if !m.executable || !named {
            continue;
        }
        if libs.iter().any(|l| l.path == Path::new(&m.path)) {
            continue;
        }
        let Some(txt_size) = m.end.checked_sub(m.start) else {
            continue;
        };
        libs.push(Library {
            path: PathBuf::from(&m.path),
            txt_vaddr: m.start,
            txt_offset: m.offset,
            txt_size,
            bias: bases.get(m.path.as_str()).copied().unwrap_or(m.start),
            kind: kind_of(&m.path, exe),
        });
    }
    libs
}

/// Libraries currently mapped into process `pid`
pub fn read_libraries(pid: i32) -> Result<Vec<Library>> {
    let maps_path = format!("/proc/{pid}/maps");
    let text = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
    let exe = fs::read_link(format!("/proc/{pid}/exe")).ok();
    Ok(parse_maps(&text, exe.as_deref()))
}
