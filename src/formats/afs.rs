//! CRI AFS archives.
//!
//! The directory holds offset and size pairs only. Names live in a separate
//! table after the data, found through a pointer stored behind the pairs.
use super::base::*;
use crate::decode::{DecodeContext, padding_for, synth_name};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::ext::io::*;
use crate::reader::SourceReader;
use crate::types::*;
use crate::utils::struct_pack::*;
use crate::validate::*;
use arc_tool_macro::{StructPack, StructUnpack};
use std::io::SeekFrom;

const MAGIC: &[u8; 4] = b"AFS\0";
const ALIGN: u64 = 0x800;
const NAME_RECORD_LEN: u64 = 48;

#[derive(Debug, Clone, Default, StructPack, StructUnpack)]
struct NameRecord {
    #[fstring = 32]
    name: String,
    #[fvec = 6]
    modified: Vec<u16>,
    size: u32,
}

#[derive(Debug)]
pub struct AfsArchiveBuilder {}

impl AfsArchiveBuilder {
    pub const fn new() -> Self {
        AfsArchiveBuilder {}
    }
}

/// Offset and size of the name table, if the pair at `at` describes one.
fn name_table(reader: &mut SourceReader, at: u64, count: u64) -> Result<Option<(u64, u64)>> {
    if !check_extent(at, 8, reader.len()) {
        return Ok(None);
    }
    let offset = reader.peek_u32_at(at)? as u64;
    let size = reader.peek_u32_at(at + 4)? as u64;
    if offset == 0 || size < count * NAME_RECORD_LEN || !check_extent(offset, size, reader.len()) {
        return Ok(None);
    }
    Ok(Some((offset, size)))
}

impl ArchiveBuilder for AfsArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Afs
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["afs"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Shenmue", "Sonic Adventure 2", "Phantasy Star Online"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(MAGIC) {
            return None;
        }
        let mut score = 40;
        let count = probe.u32_at(4)? as u64;
        if count > 0 && check_num_files(count as i64) && check_offset(16 + count * 8, probe.file_len) {
            score += 10;
            let offset = probe.u32_at(8)? as u64;
            let size = probe.u32_at(12)? as u64;
            if offset % ALIGN == 0 && check_extent(offset, size, probe.file_len) {
                score += 15;
            }
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<4>()?;
        ensure_magic(&magic, MAGIC, 0)?;
        let count = ensure_num_files(reader.read_u32()? as i64, 4)?;
        let mut entries = Vec::with_capacity(capacity_hint(count));
        for _ in 0..count {
            let at = reader.position();
            let offset = reader.read_u32()? as u64;
            let size = reader.read_u32()? as u64;
            ensure_extent(offset, size, reader.len(), at)?;
            entries.push(ArchiveEntry::stored(String::new(), offset, size));
        }
        let pointer = reader.position();
        let mut table = name_table(reader, pointer, count as u64)?;
        if table.is_none() {
            // older tools store the pointer right before the first file
            if let Some(first) = entries.iter().map(|e| e.source_offset).filter(|&o| o >= 8).min() {
                table = name_table(reader, first - 8, count as u64)?;
            }
        }
        if table.is_none() {
            let end = entries.iter().map(|e| e.source_offset + e.stored_length).max().unwrap_or(0);
            let start = end + padding_for(end, ALIGN);
            if check_extent(start, count as u64 * NAME_RECORD_LEN, reader.len()) && count > 0 {
                table = Some((start, count as u64 * NAME_RECORD_LEN));
            }
        }
        match table {
            Some((offset, _)) => {
                reader.seek(offset)?;
                for entry in entries.iter_mut() {
                    let record: NameRecord = reader.read_struct(false, ctx.encoding)?;
                    entry.name = record.name;
                }
            }
            None => {
                tracing::debug!("{}: no name table, synthesizing names", ctx.filename);
                for (i, entry) in entries.iter_mut().enumerate() {
                    entry.name = synth_name(i, "bin");
                }
            }
        }
        Ok(entries)
    }

    fn can_create(&self) -> bool {
        true
    }

    fn create_archive<'a>(
        &self,
        output: &'a mut dyn ReadWriteSeek,
        files: &[&str],
        options: &WriteOptions,
    ) -> Result<Box<dyn ArchiveWriter + 'a>> {
        Ok(Box::new(AfsArchiveWriter::new(output, files, options.encoding)?))
    }
}

pub struct AfsArchiveWriter<'w> {
    writer: &'w mut dyn ReadWriteSeek,
    slots: Slots,
    encoding: Encoding,
}

impl<'w> AfsArchiveWriter<'w> {
    pub fn new(writer: &'w mut dyn ReadWriteSeek, files: &[&str], encoding: Encoding) -> Result<Self> {
        writer.write_all(MAGIC)?;
        writer.write_u32(files.len() as u32)?;
        writer.write_fill(0, files.len() * 8 + 8)?;
        writer.pad_to(ALIGN)?;
        Ok(AfsArchiveWriter {
            writer,
            slots: Slots::new(files)?,
            encoding,
        })
    }
}

fn field(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| ArcError::InvalidInput("afs archives are limited to 4 GiB".into()))
}

impl ArchiveWriter for AfsArchiveWriter<'_> {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>> {
        let i = self.slots.claim(name)?;
        Ok(Box::new(self.slots.open_at_end(self.writer, i, ALIGN)?))
    }

    fn write_header(&mut self) -> Result<()> {
        self.writer.seek(SeekFrom::End(0))?;
        let table = self.writer.pad_to(ALIGN)?;
        for (name, _, size) in self.slots.iter() {
            NameRecord {
                name: name.to_string(),
                modified: vec![0; 6],
                size: field(size)?,
            }
            .pack(&mut self.writer, false, self.encoding)?;
        }
        self.writer.pad_to(ALIGN)?;
        let mut at = 8;
        for (_, offset, size) in self.slots.iter() {
            self.writer.patch_u32(at, field(offset)?)?;
            self.writer.patch_u32(at + 4, field(size)?)?;
            at += 8;
        }
        self.writer.patch_u32(at, field(table)?)?;
        self.writer.patch_u32(at + 4, field(self.slots.len() as u64 * NAME_RECORD_LEN)?)?;
        Ok(())
    }
}
