//! Unreal Engine 3 texture file caches (`.tfc`).
//!
//! A cache is a run of compressed chunks, one per stored mip level. There is no
//! directory: entries are found by walking the chunk headers from the start of
//! the file, and get synthesized names.
use super::base::*;
use crate::decode::{DecodeContext, synth_name};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::reader::SourceReader;
use crate::types::*;
use crate::validate::*;

const PACKAGE_TAG: u32 = 0x9E2A_83C1;
const CHUNK_HEADER_LEN: u64 = 16;
const BLOCK_RECORD_LEN: u64 = 8;
/// First byte of a zlib stream with the default window. Anything else is LZO.
const ZLIB_CMF: u8 = 0x78;

/// Byte order of a chunk, decided by how its tag reads.
fn tag_order(tag: [u8; 4]) -> Option<bool> {
    if u32::from_le_bytes(tag) == PACKAGE_TAG {
        Some(false)
    } else if u32::from_be_bytes(tag) == PACKAGE_TAG {
        Some(true)
    } else {
        None
    }
}

fn read_u32(reader: &mut SourceReader, big: bool) -> Result<u32> {
    if big { reader.read_u32_be() } else { reader.read_u32() }
}

fn plausible_block_size(size: u32) -> bool {
    size.is_power_of_two() && (0x400..=0x10_0000).contains(&size)
}

#[derive(Debug)]
pub struct TfcArchiveBuilder {}

impl TfcArchiveBuilder {
    pub const fn new() -> Self {
        TfcArchiveBuilder {}
    }

    /// Reads the chunk at the reader's position and leaves the reader after its data.
    fn read_chunk(&self, reader: &mut SourceReader, big: bool, name: String) -> Result<ArchiveEntry> {
        let at = reader.position() - 4;
        let block_size = read_u32(reader, big)? as u64;
        let compressed = read_u32(reader, big)? as u64;
        let uncompressed = read_u32(reader, big)? as u64;
        if block_size == 0 {
            return Err(ArcError::corrupt(at + 4, "range", "block size of zero"));
        }
        let count = ensure_num_files(uncompressed.div_ceil(block_size) as i64, at + 12)?;
        let data_start = at + CHUNK_HEADER_LEN + count as u64 * BLOCK_RECORD_LEN;
        ensure_offset(data_start, reader.len(), at + 12)?;
        ensure_extent(data_start, compressed, reader.len(), at + 8)?;

        let mut blocks = Vec::with_capacity(capacity_hint(count));
        let mut offset = data_start;
        let mut total = (0u64, 0u64);
        for _ in 0..count {
            let packed = read_u32(reader, big)? as u64;
            let original = read_u32(reader, big)? as u64;
            ensure_extent(offset, packed, reader.len(), reader.position() - 8)?;
            let codec = match reader.read_at(offset, packed.min(1))?.first() {
                Some(&ZLIB_CMF) => Codec::Zlib,
                _ => Codec::Lzo,
            };
            blocks.push((codec, Chunk::new(offset, packed, original)));
            offset += packed;
            total = (total.0 + packed, total.1 + original);
        }
        if total != (compressed, uncompressed) {
            return Err(ArcError::corrupt(
                at + 8,
                "length",
                format!(
                    "blocks hold {}/{} bytes, chunk header says {}/{}",
                    total.0, total.1, compressed, uncompressed
                ),
            ));
        }
        reader.seek(data_start + compressed)?;

        let entry = ArchiveEntry::stored(name, data_start, compressed);
        let entry = match blocks.as_slice() {
            [] => entry,
            [(Codec::Zlib, _)] => entry.with_transform(Transform::Zlib, uncompressed),
            [(_, _)] => entry.with_transform(Transform::Lzo, uncompressed),
            [(first, _), ..] if blocks.iter().all(|(c, _)| c == first) => entry.with_transform(
                Transform::Chunked {
                    codec: *first,
                    chunks: blocks.iter().map(|(_, c)| *c).collect(),
                },
                uncompressed,
            ),
            _ => entry.with_transform(Transform::Variable { chunks: blocks }, uncompressed),
        };
        Ok(entry)
    }
}

impl ArchiveBuilder for TfcArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Tfc
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tfc"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Unreal Engine 3 titles"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        let big = tag_order(probe.bytes(0, 4)?.try_into().ok()?)?;
        let u32_at = |offset: u64| if big { probe.u32_be_at(offset) } else { probe.u32_at(offset) };
        let mut score = 35;
        let block_size = u32_at(4)?;
        if plausible_block_size(block_size) {
            score += 15;
            let compressed = u32_at(8)? as u64;
            let blocks = (u32_at(12)? as u64).div_ceil(block_size as u64);
            if check_extent(CHUNK_HEADER_LEN + blocks * BLOCK_RECORD_LEN, compressed, probe.file_len) {
                score += 15;
            }
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, _ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        while reader.remaining() > 0 {
            let at = reader.position();
            if reader.remaining() < CHUNK_HEADER_LEN {
                tracing::warn!("tfc: {} trailing bytes at {:#x} ignored", reader.remaining(), at);
                break;
            }
            let tag = reader.read_array::<4>()?;
            let Some(big) = tag_order(tag) else {
                if entries.is_empty() {
                    return Err(ArcError::corrupt(at, "magic", format!("found {:02x?}", tag)));
                }
                tracing::warn!("tfc: no chunk tag at {:#x}, stopping after {} chunks", at, entries.len());
                break;
            };
            entries.push(self.read_chunk(reader, big, synth_name(entries.len(), "bin"))?);
        }
        Ok(entries)
    }
}
