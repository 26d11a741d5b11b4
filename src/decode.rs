//! Building blocks shared by the directory decoders.
//!
//! Every container decoder follows the same shape: parse the header, resolve and
//! validate the entry count, loop over the entries, then run an optional post-pass
//! (name stitching, length inference, tree flattening). The pieces of that shape
//! which are not format specific live here as free functions and small per-call
//! context structs.
use crate::error::{ArcError, Result};
use crate::reader::BinaryReader;
use crate::types::*;
use crate::validate::*;
use std::io::{Read, Seek};
use std::path::Path;

/// Everything a decoder knows about the archive besides its bytes.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// File name used for extension checks and synthesized names.
    pub filename: &'a str,
    /// Location on disk, when there is one. Split archives need it to find companions.
    pub path: Option<&'a Path>,
    pub container_size: u64,
    pub config: &'a ExtraConfig,
    /// Name encoding, already resolved against the format default.
    pub encoding: Encoding,
}

impl<'a> DecodeContext<'a> {
    pub fn new(filename: &'a str, container_size: u64, config: &'a ExtraConfig, encoding: Encoding) -> Self {
        DecodeContext {
            filename,
            path: None,
            container_size,
            config,
            encoding,
        }
    }

    pub fn with_path(mut self, path: &'a Path) -> Self {
        self.path = Some(path);
        self
    }

    /// File name without directories and without its final extension.
    pub fn stem(&self) -> &'a str {
        let name = self.filename.rsplit(['/', '\\']).next().unwrap_or(self.filename);
        match name.rfind('.') {
            Some(0) | None => name,
            Some(dot) => &name[..dot],
        }
    }
}

/// Bytes needed to move from `len` to the next multiple of `align`.
pub fn padding_for(len: u64, align: u64) -> u64 {
    if align <= 1 {
        return 0;
    }
    (align - len % align) % align
}

/// Name for an entry whose container stores none.
pub fn synth_name(index: usize, ext: &str) -> String {
    if ext.is_empty() {
        format!("entry_{}", index)
    } else {
        format!("entry_{}.{}", index, ext)
    }
}

/// Joins path components with `/`, skipping empty ones.
pub fn join_path<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for part in parts {
        let part = part.trim_matches(['/', '\\']);
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Computes lengths for entries whose directory stores offsets only.
///
/// Each entry extends to the next higher offset, the last one to the end of the
/// container. Offsets need not be sorted: the returned lengths are in the order of
/// `offsets`, so the caller keeps its name association.
pub fn infer_lengths(offsets: &[u64], container_size: u64) -> Result<Vec<u64>> {
    let mut order: Vec<usize> = (0..offsets.len()).collect();
    order.sort_by_key(|&i| offsets[i]);
    let mut lengths = vec![0u64; offsets.len()];
    for (rank, &i) in order.iter().enumerate() {
        let start = offsets[i];
        let end = match order.get(rank + 1) {
            Some(&next) => offsets[next],
            None => container_size,
        };
        if start > container_size {
            return Err(ArcError::corrupt(
                start,
                "offset",
                format!("entry {} starts beyond container size {:#x}", i, container_size),
            ));
        }
        lengths[i] = end - start;
    }
    Ok(lengths)
}

/// Drops sentinel entries after offset arithmetic is done.
pub fn retain_non_sentinel(
    entries: Vec<ArchiveEntry>,
    is_sentinel: impl Fn(&ArchiveEntry) -> bool,
) -> Vec<ArchiveEntry> {
    let before = entries.len();
    let kept: Vec<_> = entries.into_iter().filter(|e| !is_sentinel(e)).collect();
    if kept.len() != before {
        tracing::debug!("filtered {} sentinel entries", before - kept.len());
    }
    kept
}

/// Makes names unique, ignoring ASCII case, by appending `_<n>` to the stem of
/// repeated ones. Returns how many names changed.
pub fn dedupe_names(names: &mut [String]) -> usize {
    let mut seen = std::collections::HashSet::new();
    let mut renamed = 0;
    for name in names.iter_mut() {
        if seen.insert(name.to_ascii_lowercase()) {
            continue;
        }
        let (stem, ext) = match name.rfind('.') {
            Some(dot) if dot > name.rfind('/').map_or(0, |s| s + 1) => name.split_at(dot),
            _ => (name.as_str(), ""),
        };
        let mut n = 1;
        let candidate = loop {
            let candidate = format!("{}_{}{}", stem, n, ext);
            if !seen.contains(&candidate.to_ascii_lowercase()) {
                break candidate;
            }
            n += 1;
        };
        tracing::warn!("renaming duplicate entry {} to {}", name, candidate);
        seen.insert(candidate.to_ascii_lowercase());
        *name = candidate;
        renamed += 1;
    }
    renamed
}

/// Resolves names stored in a separate table at `table_start`.
///
/// `name_offsets` are relative to the table and each name is NUL terminated.
/// Entries keep their directory order; names are only filled in.
pub fn resolve_name_table<R: Read + Seek>(
    reader: &mut BinaryReader<R>,
    table_start: u64,
    table_len: u64,
    name_offsets: &[u64],
    encoding: Encoding,
) -> Result<Vec<String>> {
    let table_end = table_start
        .checked_add(table_len)
        .ok_or_else(|| ArcError::corrupt(table_start, "length", "name table overflows"))?;
    ensure_offset(table_end, reader.len(), table_start)?;
    let mut names = Vec::with_capacity(capacity_hint(name_offsets.len()));
    for &offset in name_offsets {
        let at = table_start + offset;
        if offset >= table_len {
            return Err(ArcError::corrupt(
                at,
                "offset",
                format!("name offset {:#x} outside table of {:#x} bytes", offset, table_len),
            ));
        }
        let max = (table_end - at - 1).min(MAX_NAME_LENGTH) as usize;
        let name = reader.with_position(at, |r| r.read_cstring(max, encoding))?;
        names.push(name);
    }
    Ok(names)
}

/// Folders nested deeper than this are taken as a corrupt tree.
pub const MAX_TREE_DEPTH: usize = 256;

/// Per-call state of a directory walk.
///
/// The walk is bounded by the entry total the header declares: visiting more
/// nodes than that, or nesting deeper than the number of nodes or
/// [MAX_TREE_DEPTH], means the tree refers back into itself.
#[derive(Debug)]
pub struct TreeWalk {
    pub nodes: Vec<DirectoryNode>,
    visited: u64,
    limit: u64,
}

impl TreeWalk {
    pub fn new(declared_total: u64) -> Self {
        TreeWalk {
            nodes: Vec::new(),
            visited: 0,
            limit: declared_total,
        }
    }

    pub fn visited(&self) -> u64 {
        self.visited
    }

    /// Counts one visited node; `at` is its offset for error reporting.
    pub fn visit(&mut self, at: u64) -> Result<()> {
        self.visited += 1;
        if self.visited > self.limit {
            return Err(ArcError::corrupt(
                at,
                "tree",
                format!("walk visited more than the {} declared entries", self.limit),
            ));
        }
        Ok(())
    }

    pub fn depth(&self, node: Option<usize>) -> usize {
        node.and_then(|i| self.nodes.get(i)).map_or(0, |n| n.depth)
    }

    /// Records a folder and returns its index.
    pub fn push_dir(&mut self, name: String, parent: Option<usize>, children: u64, at: u64) -> Result<usize> {
        let depth = self.depth(parent) + 1;
        if depth as u64 > self.limit.max(1) || depth > MAX_TREE_DEPTH {
            return Err(ArcError::corrupt(
                at,
                "tree",
                format!("folder nesting of {} exceeds the entry total or {}", depth, MAX_TREE_DEPTH),
            ));
        }
        self.nodes.push(DirectoryNode {
            name,
            parent,
            children,
            depth,
        });
        Ok(self.nodes.len() - 1)
    }

    /// Full path of `name` inside folder `node`.
    pub fn path_of(&self, node: Option<usize>, name: &str) -> String {
        let mut parts = vec![name];
        let mut cur = node;
        while let Some(i) = cur {
            match self.nodes.get(i) {
                Some(n) => {
                    parts.push(n.name.as_str());
                    cur = n.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        join_path(parts)
    }
}

/// A position dependent de-obfuscation applied to directory fields.
pub trait DirectoryCipher {
    fn decrypt_u32(&mut self, value: u32) -> u32;

    /// Decrypts a run of bytes, such as a name, in place.
    fn decrypt_bytes(&mut self, data: &mut [u8]);
}

/// Reads directory fields through a [DirectoryCipher].
///
/// Decoders of obfuscated directories read every field through this accessor, so
/// the cipher sees the fields in exactly the order they are stored.
pub struct CipherReader<'r, R, C> {
    pub reader: &'r mut BinaryReader<R>,
    pub cipher: C,
}

impl<'r, R: Read + Seek, C: DirectoryCipher> CipherReader<'r, R, C> {
    pub fn new(reader: &'r mut BinaryReader<R>, cipher: C) -> Self {
        CipherReader { reader, cipher }
    }

    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.reader.read_u32()?;
        Ok(self.cipher.decrypt_u32(raw))
    }

    pub fn read_bytes(&mut self, count: u64) -> Result<Vec<u8>> {
        let mut data = self.reader.read_bytes(count)?;
        self.cipher.decrypt_bytes(&mut data);
        Ok(data)
    }

    pub fn read_string(&mut self, len: u64, encoding: Encoding) -> Result<String> {
        let at = self.reader.position();
        let data = self.read_bytes(len)?;
        crate::utils::encoding::decode_to_string(encoding, &data, at)
    }
}
