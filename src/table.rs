//! The normalized decode result.
use crate::error::{ArcError, Result};
use crate::types::*;
use serde::Serialize;

/// Ordered entries of one archive.
///
/// Construction checks every entry against the size of the file holding its
/// bytes, so a table that exists satisfies the bounds property. Tables are never
/// mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceTable {
    pub format: ArchiveType,
    pub container_size: u64,
    entries: Vec<ArchiveEntry>,
}

fn source_size(entry: &ArchiveEntry, container_size: u64) -> u64 {
    match &entry.source {
        EntrySource::Container => container_size,
        EntrySource::Companion { size, .. } => *size,
    }
}

fn check_entry(index: usize, entry: &ArchiveEntry, container_size: u64) -> Result<()> {
    let size = source_size(entry, container_size);
    let out_of_bounds = |offset: u64, len: u64| {
        ArcError::corrupt(
            offset,
            "extent",
            format!(
                "entry {} ({}) spans {:#x}+{:#x} beyond its source of {:#x} bytes",
                index, entry.name, offset, len, size
            ),
        )
    };
    match entry.transform.chunks() {
        Some(chunks) => {
            for chunk in chunks {
                if !crate::validate::check_extent(chunk.offset, chunk.stored_length, size) {
                    return Err(out_of_bounds(chunk.offset, chunk.stored_length));
                }
            }
        }
        None => {
            if !crate::validate::check_extent(entry.source_offset, entry.stored_length, size) {
                return Err(out_of_bounds(entry.source_offset, entry.stored_length));
            }
        }
    }
    Ok(())
}

impl ResourceTable {
    pub fn new(format: ArchiveType, container_size: u64, entries: Vec<ArchiveEntry>) -> Result<Self> {
        for (i, entry) in entries.iter().enumerate() {
            check_entry(i, entry, container_size)?;
        }
        Ok(ResourceTable {
            format,
            container_size,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ArchiveEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ArchiveEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Index of the first entry called `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn total_stored(&self) -> u64 {
        self.entries.iter().map(|e| e.stored_length).sum()
    }

    pub fn total_decompressed(&self) -> u64 {
        self.entries.iter().map(|e| e.decompressed_length).sum()
    }
}

impl<'a> IntoIterator for &'a ResourceTable {
    type Item = &'a ArchiveEntry;
    type IntoIter = std::slice::Iter<'a, ArchiveEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
