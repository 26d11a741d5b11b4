//! Doom WAD files.
use super::base::*;
use crate::decode::{DecodeContext, retain_non_sentinel};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::ext::io::*;
use crate::reader::SourceReader;
use crate::types::*;
use crate::utils::struct_pack::*;
use crate::validate::*;
use arc_tool_macro::{StructPack, StructUnpack};
use std::io::SeekFrom;

const IWAD: &[u8; 4] = b"IWAD";
const PWAD: &[u8; 4] = b"PWAD";
const LUMP_LEN: u64 = 16;

#[derive(Debug, Clone, StructPack, StructUnpack)]
struct Lump {
    offset: u32,
    size: u32,
    #[fstring = 8]
    name: String,
}

#[derive(Debug)]
pub struct WadArchiveBuilder {}

impl WadArchiveBuilder {
    pub const fn new() -> Self {
        WadArchiveBuilder {}
    }
}

impl ArchiveBuilder for WadArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Wad
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["wad"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Doom", "Doom II", "Heretic", "Hexen"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(IWAD) && !probe.starts_with(PWAD) {
            return None;
        }
        let mut score = 35;
        let count = probe.u32_at(4)? as i64;
        let table = probe.u32_at(8)? as u64;
        if check_num_files(count) && check_extent(table, count as u64 * LUMP_LEN, probe.file_len) {
            score += 25;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<4>()?;
        if &magic != IWAD && &magic != PWAD {
            ensure_magic(&magic, PWAD, 0)?;
        }
        let count = ensure_num_files(reader.read_u32()? as i64, 4)?;
        let table = reader.read_u32()? as u64;
        ensure_extent(table, count as u64 * LUMP_LEN, reader.len(), 8)?;
        reader.seek(table)?;
        let mut entries = Vec::with_capacity(capacity_hint(count));
        for _ in 0..count {
            let at = reader.position();
            let lump: Lump = reader.read_struct(false, ctx.encoding)?;
            ensure_extent(lump.offset as u64, lump.size as u64, reader.len(), at)?;
            entries.push(ArchiveEntry::stored(lump.name, lump.offset as u64, lump.size as u64));
        }
        // S_START, F_END and friends only mark namespaces
        Ok(retain_non_sentinel(entries, |e| e.stored_length == 0))
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
        let id = match options.preserved_header.as_deref() {
            Some(id) if id == IWAD => IWAD,
            _ => PWAD,
        };
        Ok(Box::new(WadArchiveWriter::new(output, id, files, options.encoding)?))
    }

    fn preserved_header(&self, reader: &mut SourceReader) -> Result<Option<Vec<u8>>> {
        Ok(Some(reader.read_at(0, 4)?))
    }
}

pub struct WadArchiveWriter<'w> {
    writer: &'w mut dyn ReadWriteSeek,
    slots: Slots,
    encoding: Encoding,
}

impl<'w> WadArchiveWriter<'w> {
    pub fn new(writer: &'w mut dyn ReadWriteSeek, id: &[u8; 4], files: &[&str], encoding: Encoding) -> Result<Self> {
        for name in files {
            if name.len() > 8 {
                return Err(ArcError::InvalidInput(format!("lump name '{}' is longer than 8 bytes", name)));
            }
        }
        writer.write_all(id)?;
        writer.write_u32(files.len() as u32)?;
        writer.write_u32(0)?;
        Ok(WadArchiveWriter {
            writer,
            slots: Slots::new(files)?,
            encoding,
        })
    }
}

impl ArchiveWriter for WadArchiveWriter<'_> {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>> {
        let i = self.slots.claim(name)?;
        Ok(Box::new(self.slots.open_at_end(self.writer, i, 4)?))
    }

    fn write_header(&mut self) -> Result<()> {
        self.writer.seek(SeekFrom::End(0))?;
        let table = self.writer.pad_to(4)?;
        for (name, offset, size) in self.slots.iter() {
            let field = |v: u64| {
                u32::try_from(v).map_err(|_| ArcError::InvalidInput(format!("lump '{}' lies beyond 4 GiB", name)))
            };
            Lump {
                offset: field(offset)?,
                size: field(size)?,
                name: name.to_string(),
            }
            .pack(&mut self.writer, false, self.encoding)?;
        }
        let table = u32::try_from(table).map_err(|_| ArcError::InvalidInput("wad larger than 4 GiB".into()))?;
        self.writer.patch_u32(8, table)?;
        Ok(())
    }
}
