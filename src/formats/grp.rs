//! Build engine GRP files (Duke Nukem 3D, Shadow Warrior, Blood).
use super::base::*;
use crate::decode::DecodeContext;
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::ext::io::*;
use crate::reader::SourceReader;
use crate::types::*;
use crate::utils::struct_pack::*;
use crate::validate::*;
use arc_tool_macro::{StructPack, StructUnpack};
use std::io::SeekFrom;

const MAGIC: &[u8; 12] = b"KenSilverman";
const RECORD_LEN: u64 = 16;

#[derive(Debug, Clone, StructPack, StructUnpack)]
struct GrpRecord {
    #[fstring = 12]
    name: String,
    size: u32,
}

#[derive(Debug)]
pub struct GrpArchiveBuilder {}

impl GrpArchiveBuilder {
    pub const fn new() -> Self {
        GrpArchiveBuilder {}
    }
}

impl ArchiveBuilder for GrpArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Grp
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["grp"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Duke Nukem 3D", "Shadow Warrior", "Blood"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(MAGIC) {
            return None;
        }
        let count = probe.u32_at(12)? as u64;
        let mut score = 50;
        if check_num_files(count as i64) && check_offset(RECORD_LEN * (count + 1), probe.file_len) {
            score += 20;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<12>()?;
        ensure_magic(&magic, MAGIC, 0)?;
        let count = ensure_num_files(reader.read_u32()? as i64, 12)?;
        let mut offset = RECORD_LEN * (count as u64 + 1);
        ensure_offset(offset, reader.len(), 12)?;
        let mut entries = Vec::with_capacity(capacity_hint(count));
        for _ in 0..count {
            let at = reader.position();
            let record: GrpRecord = reader.read_struct(false, ctx.encoding)?;
            ensure_extent(offset, record.size as u64, reader.len(), at + 12)?;
            entries.push(ArchiveEntry::stored(record.name, offset, record.size as u64));
            offset += record.size as u64;
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
        Ok(Box::new(GrpArchiveWriter::new(output, files, options.encoding)?))
    }
}

pub struct GrpArchiveWriter<'w> {
    writer: &'w mut dyn ReadWriteSeek,
    slots: Slots,
    encoding: Encoding,
}

impl<'w> GrpArchiveWriter<'w> {
    pub fn new(writer: &'w mut dyn ReadWriteSeek, files: &[&str], encoding: Encoding) -> Result<Self> {
        writer.write_all(MAGIC)?;
        writer.write_u32(files.len() as u32)?;
        writer.write_fill(0, files.len() * RECORD_LEN as usize)?;
        Ok(GrpArchiveWriter {
            writer,
            slots: Slots::new(files)?,
            encoding,
        })
    }
}

impl ArchiveWriter for GrpArchiveWriter<'_> {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>> {
        let i = self.slots.claim(name)?;
        Ok(Box::new(self.slots.open_at_end(self.writer, i, 1)?))
    }

    fn write_header(&mut self) -> Result<()> {
        // offsets are implied by the record order, so records follow the data order
        let mut records: Vec<_> = self.slots.iter().collect();
        records.sort_by_key(|(_, offset, _)| *offset);
        self.writer.seek(SeekFrom::Start(RECORD_LEN))?;
        for (name, _, size) in records {
            GrpRecord {
                name: name.to_string(),
                size: u32::try_from(size)
                    .map_err(|_| ArcError::InvalidInput(format!("'{}' is larger than 4 GiB", name)))?,
            }
            .pack(&mut self.writer, false, self.encoding)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;

    #[test]
    fn offsets_are_a_running_sum() {
        let items = vec![
            PackItem::bytes("GAME.CON", b"define".to_vec()),
            PackItem::bytes("TILES000.ART", vec![3u8; 40]),
            PackItem::bytes("E1L1.MAP", b"map".to_vec()),
        ];
        let data = serialize_to_vec(&GrpArchiveBuilder::new(), &items, &WriteOptions::default()).unwrap();
        let table = decode_bytes(&GrpArchiveBuilder::new(), "duke3d.grp", &data).unwrap();
        let layout: Vec<_> = table.iter().map(|e| (e.source_offset, e.stored_length)).collect();
        assert_eq!(layout, vec![(64, 6), (70, 40), (110, 3)]);
        assert_eq!(table.container_size, 113);
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[2], ("E1L1.MAP".to_string(), b"map".to_vec()));
        assert_eq!(score_of(&GrpArchiveBuilder::new(), "duke3d.grp", &data), 95);
    }

    #[test]
    fn sizes_past_the_end_are_corrupt() {
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(b"A.TXT\0\0\0\0\0\0\0");
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(b"short");
        let err = decode_bytes(&GrpArchiveBuilder::new(), "a.grp", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 28, check: "extent", .. }));
    }

    #[test]
    fn count_beyond_the_file_is_corrupt() {
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&1000u32.to_le_bytes());
        let err = decode_bytes(&GrpArchiveBuilder::new(), "a.grp", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 12, check: "offset", .. }));
        assert_eq!(score_of(&GrpArchiveBuilder::new(), "a.grp", &data), 75);
    }
}
