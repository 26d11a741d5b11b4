//! Quake PACK archives.
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

const MAGIC: &[u8; 4] = b"PACK";
const HEADER_LEN: u64 = 12;
const RECORD_LEN: u64 = 64;

#[derive(Debug, Clone, StructPack, StructUnpack)]
struct PakRecord {
    #[fstring = 56]
    name: String,
    offset: u32,
    size: u32,
}

#[derive(Debug)]
pub struct PakArchiveBuilder {}

impl PakArchiveBuilder {
    pub const fn new() -> Self {
        PakArchiveBuilder {}
    }
}

impl ArchiveBuilder for PakArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Pak
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pak"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Quake", "Quake II", "Half-Life"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(MAGIC) {
            return None;
        }
        let mut score = 40;
        let dir_offset = probe.u32_at(4)? as u64;
        let dir_len = probe.u32_at(8)? as u64;
        if dir_len % RECORD_LEN == 0 && check_extent(dir_offset, dir_len, probe.file_len) {
            score += 25;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<4>()?;
        ensure_magic(&magic, MAGIC, 0)?;
        let dir_offset = reader.read_u32()? as u64;
        let dir_len = reader.read_u32()? as u64;
        if dir_len % RECORD_LEN != 0 {
            return Err(ArcError::corrupt(
                8,
                "length",
                format!("directory length {} is not a multiple of {}", dir_len, RECORD_LEN),
            ));
        }
        ensure_extent(dir_offset, dir_len, reader.len(), 4)?;
        let count = ensure_num_files((dir_len / RECORD_LEN) as i64, 8)?;
        reader.seek(dir_offset)?;
        let mut entries = Vec::with_capacity(capacity_hint(count));
        for _ in 0..count {
            let at = reader.position();
            let record: PakRecord = reader.read_struct(false, ctx.encoding)?;
            ensure_extent(record.offset as u64, record.size as u64, reader.len(), at + 56)?;
            entries.push(ArchiveEntry::stored(record.name, record.offset as u64, record.size as u64));
        }
        tracing::debug!("pak directory at {:#x}: {} entries", dir_offset, count);
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
        Ok(Box::new(PakArchiveWriter::new(output, files, options.encoding)?))
    }
}

pub struct PakArchiveWriter<'w> {
    writer: &'w mut dyn ReadWriteSeek,
    slots: Slots,
    encoding: Encoding,
}

impl<'w> PakArchiveWriter<'w> {
    pub fn new(writer: &'w mut dyn ReadWriteSeek, files: &[&str], encoding: Encoding) -> Result<Self> {
        writer.write_all(MAGIC)?;
        // directory offset and length are patched in write_header
        writer.write_fill(0, 8)?;
        Ok(PakArchiveWriter {
            writer,
            slots: Slots::new(files)?,
            encoding,
        })
    }
}

impl ArchiveWriter for PakArchiveWriter<'_> {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>> {
        let i = self.slots.claim(name)?;
        Ok(Box::new(self.slots.open_at_end(self.writer, i, 1)?))
    }

    fn write_header(&mut self) -> Result<()> {
        let dir_offset = self.writer.seek(SeekFrom::End(0))?.max(HEADER_LEN);
        self.writer.seek(SeekFrom::Start(dir_offset))?;
        for (name, offset, size) in self.slots.iter() {
            PakRecord {
                name: name.to_string(),
                offset: to_u32(offset)?,
                size: to_u32(size)?,
            }
            .pack(&mut self.writer, false, self.encoding)?;
        }
        self.writer.patch_u32(4, to_u32(dir_offset)?)?;
        self.writer.patch_u32(8, to_u32(self.slots.len() as u64 * RECORD_LEN)?)?;
        Ok(())
    }
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| ArcError::InvalidInput(format!("{:#x} does not fit a 32-bit field", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;
    use proptest::prelude::*;

    fn sample() -> Vec<u8> {
        let items = vec![
            PackItem::bytes("maps/e1m1.bsp", b"bsp data".to_vec()),
            PackItem::bytes("progs.dat", vec![7u8; 300]),
            PackItem::bytes("empty.cfg", Vec::new()),
        ];
        serialize_to_vec(&PakArchiveBuilder::new(), &items, &WriteOptions::default()).unwrap()
    }

    #[test]
    fn written_archive_decodes() {
        let data = sample();
        assert_eq!(&data[..4], b"PACK");
        let table = decode_bytes(&PakArchiveBuilder::new(), "pak0.pak", &data).unwrap();
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0], ("maps/e1m1.bsp".to_string(), b"bsp data".to_vec()));
        assert_eq!(files[1].1, vec![7u8; 300]);
        assert_eq!(files[2].1, Vec::<u8>::new());
        assert_eq!(table.get(0).unwrap().source_offset, HEADER_LEN);
    }

    #[test]
    fn detection_needs_a_fitting_directory() {
        let data = sample();
        assert_eq!(score_of(&PakArchiveBuilder::new(), "pak0.pak", &data), 90);
        let mut cut = data.clone();
        cut.truncate(cut.len() - 1);
        assert_eq!(score_of(&PakArchiveBuilder::new(), "pak0.pak", &cut), 65);
    }

    #[test]
    fn entry_past_the_end_is_corrupt() {
        let mut data = sample();
        let dir = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        data[dir + 56..dir + 60].copy_from_slice(&0xFFFFu32.to_le_bytes());
        let err = decode_bytes(&PakArchiveBuilder::new(), "pak0.pak", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { check: "extent", .. }));
    }

    #[test]
    fn long_names_are_refused() {
        let name = "x".repeat(57);
        let items = vec![PackItem::bytes(name, vec![1])];
        assert!(serialize_to_vec(&PakArchiveBuilder::new(), &items, &WriteOptions::default()).is_err());
    }

    proptest! {
        #[test]
        fn pack_then_decode(files in proptest::collection::btree_map("[a-z]{1,12}", proptest::collection::vec(any::<u8>(), 0..200), 0..8)) {
            let items: Vec<_> = files.iter().map(|(n, d)| PackItem::bytes(n.clone(), d.clone())).collect();
            let data = serialize_to_vec(&PakArchiveBuilder::new(), &items, &WriteOptions::default()).unwrap();
            let table = decode_bytes(&PakArchiveBuilder::new(), "a.pak", &data).unwrap();
            let decoded = contents(&table, &data).unwrap();
            let expected: Vec<_> = files.into_iter().collect();
            prop_assert_eq!(decoded, expected);
        }

        #[test]
        fn trailing_garbage_does_not_raise_the_score(tail in proptest::collection::vec(any::<u8>(), 0..256)) {
            let data = sample();
            let before = score_of(&PakArchiveBuilder::new(), "pak0.pak", &data);
            let mut longer = data.clone();
            longer.extend_from_slice(&tail);
            prop_assert!(score_of(&PakArchiveBuilder::new(), "pak0.pak", &longer) <= before);
        }
    }
}
