//! KID LNK archives (PC ports of KID visual novels).
use super::base::*;
use crate::decode::DecodeContext;
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::reader::SourceReader;
use crate::types::*;
use crate::validate::*;
use arc_tool_macro::StructUnpack;

const MAGIC: &[u8; 4] = b"LNK\0";
const HEADER_LEN: u64 = 16;
const RECORD_LEN: u64 = 32;
/// Entry counts real archives never reach.
const MAX_ENTRIES: u64 = 0xFFFF;

#[derive(Debug, StructUnpack)]
struct LnkRecord {
    offset: u32,
    /// Size shifted left by one; bit 0 marks LZSS compression.
    packed_size: u32,
    #[fstring = 24]
    name: String,
}

#[derive(Debug)]
pub struct LnkArchiveBuilder {}

impl LnkArchiveBuilder {
    pub const fn new() -> Self {
        LnkArchiveBuilder {}
    }
}

impl ArchiveBuilder for LnkArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Lnk
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["lnk", "dat"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Ever17", "Never7", "Remember11"]
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::Cp932
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(MAGIC) {
            return None;
        }
        let count = probe.u32_at(4)? as u64;
        let mut score = 45;
        if count < MAX_ENTRIES && check_offset(HEADER_LEN + count * RECORD_LEN, probe.file_len) {
            score += 20;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<4>()?;
        ensure_magic(&magic, MAGIC, 0)?;
        let count = reader.read_u32()? as u64;
        ensure_range(count, 0, MAX_ENTRIES - 1, 4)?;
        let count = ensure_num_files(count as i64, 4)?;
        let data_start = HEADER_LEN + count as u64 * RECORD_LEN;
        ensure_offset(data_start, reader.len(), 4)?;
        reader.seek(HEADER_LEN)?;
        let mut entries = Vec::with_capacity(capacity_hint(count));
        let mut compressed = 0;
        for _ in 0..count {
            let at = reader.position();
            let record: LnkRecord = reader.read_struct(false, ctx.encoding)?;
            let offset = data_start + record.offset as u64;
            let size = (record.packed_size >> 1) as u64;
            ensure_extent(offset, size, reader.len(), at)?;
            let entry = if record.packed_size & 1 == 0 {
                ArchiveEntry::stored(record.name, offset, size)
            } else {
                if size < 4 {
                    return Err(ArcError::corrupt(at + 4, "length", "compressed entry without size prefix"));
                }
                compressed += 1;
                let unpacked = reader.peek_u32_at(offset)? as u64;
                ArchiveEntry::stored(record.name, offset + 4, size - 4).with_transform(Transform::Lzss, unpacked)
            };
            entries.push(entry);
        }
        tracing::debug!("lnk: {} entries, {} compressed", count, compressed);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;
    use crate::utils::lzss;

    fn record(out: &mut Vec<u8>, offset: u32, size: u32, compressed: bool, name: &str) {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(size << 1 | compressed as u32).to_le_bytes());
        let mut field = [0u8; 24];
        field[..name.len()].copy_from_slice(name.as_bytes());
        out.extend_from_slice(&field);
    }

    fn sample() -> Vec<u8> {
        let text = b"#scene 01\nhello from the script\n".to_vec();
        let mut packed = (text.len() as u32).to_le_bytes().to_vec();
        packed.extend_from_slice(&lzss::compress_literal(&text));
        let raw = b"RIFF....WAVE";

        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[0; 8]);
        record(&mut data, 0, raw.len() as u32, false, "bgm01.wav");
        record(&mut data, raw.len() as u32, packed.len() as u32, true, "script.txt");
        data.extend_from_slice(raw);
        data.extend_from_slice(&packed);
        data
    }

    #[test]
    fn compressed_entries_skip_their_size_prefix() {
        let data = sample();
        let table = decode_bytes(&LnkArchiveBuilder::new(), "bgm.dat", &data).unwrap();
        let script = table.get(1).unwrap();
        assert_eq!(script.transform, Transform::Lzss);
        assert_eq!(script.source_offset, 16 + 64 + 12 + 4);
        assert_eq!(script.decompressed_length, 32);
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0].1, b"RIFF....WAVE");
        assert_eq!(files[1].1, b"#scene 01\nhello from the script\n");
        assert_eq!(score_of(&LnkArchiveBuilder::new(), "bgm.dat", &data), 90);
    }

    #[test]
    fn implausible_count_is_corrupt() {
        let mut data = sample();
        data[4..8].copy_from_slice(&0x10000u32.to_le_bytes());
        let err = decode_bytes(&LnkArchiveBuilder::new(), "bgm.dat", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 4, check: "range", .. }));
    }
}
