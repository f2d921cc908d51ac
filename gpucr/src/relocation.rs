//! Old-mapping → new-mapping table for device-file VMAs.
//!
//! Restore re-creates every buffer at a new mmap offset, possibly on a
//! different render node. The host later walks the process's stale mappings
//! and asks [`VmaRelocationTable::relocate`] where each one should point now.

use std::collections::HashMap;

use crate::error::{GpuCrError, Result};

const KFD_PATH: &str = "/dev/kfd";
const RENDER_PREFIX: &str = "/dev/dri/renderD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaRelocation {
    pub addr: u64,
    pub old_offset: u64,
    pub new_offset: u64,
    pub new_minor: u32,
}

/// Append-only entries plus an `(addr, old_offset)` index.
#[derive(Debug, Default)]
pub struct VmaRelocationTable {
    entries: Vec<VmaRelocation>,
    index: HashMap<(u64, u64), usize>,
}

impl VmaRelocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: VmaRelocation) -> Result<()> {
        let key = (entry.addr, entry.old_offset);
        if self.index.contains_key(&key) {
            return Err(GpuCrError::DuplicateRelocation {
                addr: entry.addr,
                offset: entry.old_offset,
            });
        }
        tracing::debug!(
            addr = format_args!("0x{:x}", entry.addr),
            old_offset = format_args!("0x{:x}", entry.old_offset),
            new_offset = format_args!("0x{:x}", entry.new_offset),
            new_minor = entry.new_minor,
            "recorded vma relocation"
        );
        self.index.insert(key, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub fn lookup(&self, addr: u64, old_offset: u64) -> Option<&VmaRelocation> {
        self.index
            .get(&(addr, old_offset))
            .map(|&i| &self.entries[i])
    }

    /// Where a stale mapping of `path` at `(addr, old_offset)` should now
    /// point. `None` when the path is not a compute device file or no entry
    /// matches.
    pub fn relocate(&self, path: &str, addr: u64, old_offset: u64) -> Option<(String, u64)> {
        let path = collapse_slashes(path);
        let is_render = path.starts_with(RENDER_PREFIX);
        if !is_render && path != KFD_PATH {
            tracing::debug!(path, "skipping mapping of unsupported path");
            return None;
        }

        let Some(entry) = self.lookup(addr, old_offset) else {
            tracing::debug!(
                path,
                addr = format_args!("0x{addr:x}"),
                old_offset = format_args!("0x{old_offset:x}"),
                "no relocation recorded"
            );
            return None;
        };
        let new_path = if is_render {
            format!("{RENDER_PREFIX}{}", entry.new_minor)
        } else {
            path
        };
        Some((new_path, entry.new_offset))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmaRelocation> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' && prev_slash {
            continue;
        }
        prev_slash = c == '/';
        out.push(c);
    }
    out
}
