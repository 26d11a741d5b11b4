//! Kirikiri XP3 archives.
use super::base::*;
use crate::decode::DecodeContext;
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::ext::io::*;
use crate::reader::{BinaryReader, SourceReader};
use crate::transform::decode_block;
use crate::types::*;
use crate::utils::encoding::encode_string;
use crate::validate::*;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::{Cursor, SeekFrom, Write};

/// XP3 file header signature: `XP3\r\n \n\x1a\x8b\x67\x01`
pub const XP3_MAGIC: &[u8; 11] = b"XP3\r\n \n\x1a\x8b\x67\x01";

const CHUNK_FILE: &[u8; 4] = b"File";
const CHUNK_INFO: &[u8; 4] = b"info";
const CHUNK_SEGM: &[u8; 4] = b"segm";
const CHUNK_ADLR: &[u8; 4] = b"adlr";

const INDEX_ENCODE_METHOD_MASK: u8 = 0x07;
const INDEX_ENCODE_RAW: u8 = 0;
const INDEX_ENCODE_ZLIB: u8 = 1;
const INDEX_CONTINUE: u8 = 0x80;

const SEGM_ENCODE_METHOD_MASK: u32 = 0x07;
const SEGM_ENCODE_RAW: u32 = 0;
const SEGM_ENCODE_ZLIB: u32 = 1;
const SEGM_RECORD_LEN: u64 = 28;

/// Version 2 archives point the header at this block, which holds the real index offset.
const CUSHION_MINOR_VERSION: u32 = 1;
const PROTECTION_NOTICE: &str = "$$$ This is a protected archive. $$$";
const MDF_MAGIC: &[u8; 4] = b"mdf\0";

#[derive(Debug, Clone, Copy)]
struct Segment {
    codec: Codec,
    offset: u64,
    original: u64,
    packed: u64,
}

#[derive(Debug)]
pub struct Xp3ArchiveBuilder {}

impl Xp3ArchiveBuilder {
    pub const fn new() -> Self {
        Xp3ArchiveBuilder {}
    }
}

/// Follows the version 2 cushion to the real index offset.
fn index_offset(reader: &mut SourceReader) -> Result<u64> {
    let offset = reader.with_position(XP3_MAGIC.len() as u64, |r| r.read_u64())?;
    ensure_offset(offset, reader.len(), 11)?;
    if reader.len().saturating_sub(offset) >= 21 {
        let minor = reader.with_position(offset, |r| r.read_u32())?;
        let flag = reader.with_position(offset + 4, |r| r.read_u8())?;
        if minor == CUSHION_MINOR_VERSION && flag == INDEX_CONTINUE {
            let real = reader.with_position(offset + 13, |r| r.read_u64())?;
            ensure_offset(real, reader.len(), offset + 13)?;
            return Ok(real);
        }
    }
    Ok(offset)
}

/// Reads every index block starting at `offset` into one buffer.
fn read_index(reader: &mut SourceReader, offset: u64) -> Result<Vec<u8>> {
    reader.seek(offset)?;
    let mut index = Vec::new();
    loop {
        let at = reader.position();
        let flag = reader.read_u8()?;
        match flag & INDEX_ENCODE_METHOD_MASK {
            INDEX_ENCODE_ZLIB => {
                let packed = reader.read_u64()?;
                let unpacked = reader.read_u64()?;
                ensure_extent(reader.position(), packed, reader.len(), at + 1)?;
                let data = reader.read_bytes(packed)?;
                let out = decode_block(Codec::Zlib, data, unpacked)
                    .map_err(|e| ArcError::corrupt(at, "index", format!("index block does not inflate: {}", e)))?;
                if out.len() as u64 != unpacked {
                    return Err(ArcError::corrupt(
                        at + 9,
                        "length",
                        format!("index inflates to {} bytes, header says {}", out.len(), unpacked),
                    ));
                }
                index.extend_from_slice(&out);
            }
            INDEX_ENCODE_RAW => {
                let size = reader.read_u64()?;
                ensure_extent(reader.position(), size, reader.len(), at + 1)?;
                index.extend_from_slice(&reader.read_bytes(size)?);
            }
            method => {
                return Err(ArcError::UnsupportedVariant(format!("XP3 index encoding {}", method)));
            }
        }
        if flag & INDEX_CONTINUE == 0 {
            return Ok(index);
        }
    }
}

/// Walks the chunks of one `File` record. `at` is the index offset, used in errors.
fn read_file_chunk(
    chunk: &mut BinaryReader<MemReader<Vec<u8>>>,
    end: u64,
    at: u64,
) -> Result<(String, u64, Vec<Segment>)> {
    let mut info = None;
    let mut segments = Vec::new();
    while chunk.position() + 12 <= end {
        let tag = chunk.read_array::<4>()?;
        let size = chunk.read_u64()?;
        let body = chunk.position();
        if body.checked_add(size).is_none_or(|e| e > end) {
            return Err(ArcError::corrupt(at, "extent", format!("'{}' chunk overruns its File record", String::from_utf8_lossy(&tag))));
        }
        match &tag {
            CHUNK_INFO => {
                let _flags = chunk.read_u32()?;
                let original = chunk.read_u64()?;
                let _packed = chunk.read_u64()?;
                let name_len = chunk.read_u16()? as usize;
                info = Some((chunk.read_utf16_string(name_len, false)?, original));
            }
            CHUNK_SEGM => {
                for _ in 0..size / SEGM_RECORD_LEN {
                    let flags = chunk.read_u32()?;
                    let codec = match flags & SEGM_ENCODE_METHOD_MASK {
                        SEGM_ENCODE_RAW => Codec::Raw,
                        SEGM_ENCODE_ZLIB => Codec::Zlib,
                        other => {
                            return Err(ArcError::UnsupportedVariant(format!("XP3 segment encoding {}", other)));
                        }
                    };
                    segments.push(Segment {
                        codec,
                        offset: chunk.read_u64()?,
                        original: chunk.read_u64()?,
                        packed: chunk.read_u64()?,
                    });
                }
            }
            // adler32 of the content; extraction does not verify it
            CHUNK_ADLR => {}
            _ => {}
        }
        chunk.seek(body + size)?;
    }
    let (name, original) = info.ok_or_else(|| ArcError::corrupt(at, "index", "File record without info chunk"))?;
    Ok((name, original, segments))
}

/// Sums one size field over all segments, rejecting totals past `u64::MAX`.
fn checked_total(segments: &[Segment], field: impl Fn(&Segment) -> u64, name: &str, at: u64) -> Result<u64> {
    segments
        .iter()
        .try_fold(0u64, |total, s| total.checked_add(field(s)))
        .ok_or_else(|| ArcError::corrupt(at, "length", format!("segment sizes of '{}' overflow", name)))
}

fn entry_from_segments(
    reader: &mut SourceReader,
    name: String,
    original: u64,
    segments: Vec<Segment>,
    mdf: bool,
    at: u64,
) -> Result<ArchiveEntry> {
    let total = checked_total(&segments, |s| s.original, &name, at)?;
    if total != original {
        return Err(ArcError::corrupt(
            at,
            "length",
            format!("segments of '{}' hold {} bytes, info says {}", name, total, original),
        ));
    }
    for s in &segments {
        ensure_extent(s.offset, s.packed, reader.len(), at)?;
        if s.codec == Codec::Raw && s.packed != s.original {
            return Err(ArcError::corrupt(at, "length", format!("raw segment of '{}' changes size", name)));
        }
    }
    let entry = match segments.as_slice() {
        [] => ArchiveEntry::stored(name, 0, 0),
        [s] if s.codec == Codec::Raw => {
            if mdf && s.packed > 8 && reader.read_at(s.offset, 4)?.as_slice() == MDF_MAGIC {
                let hint = reader.peek_u32_at(s.offset + 4)? as u64;
                ArchiveEntry::stored(name, s.offset + 8, s.packed - 8).with_transform(Transform::ZlibUnknownSize, hint)
            } else {
                ArchiveEntry::stored(name, s.offset, s.packed)
            }
        }
        [s] => ArchiveEntry::stored(name, s.offset, s.packed).with_transform(Transform::Zlib, s.original),
        [first, ..] => {
            let stored = checked_total(&segments, |s| s.packed, &name, at)?;
            let chunks: Vec<_> = segments
                .iter()
                .map(|s| (s.codec, Chunk::new(s.offset, s.packed, s.original)))
                .collect();
            let transform = if chunks.iter().all(|(c, _)| *c == first.codec) {
                Transform::Chunked {
                    codec: first.codec,
                    chunks: chunks.into_iter().map(|(_, c)| c).collect(),
                }
            } else {
                Transform::Variable { chunks }
            };
            ArchiveEntry::stored(name, first.offset, stored).with_transform(transform, original)
        }
    };
    Ok(entry)
}

impl ArchiveBuilder for Xp3ArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Xp3
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["xp3"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Kirikiri2 / KirikiriZ titles"]
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::Utf16Le
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(XP3_MAGIC) {
            return None;
        }
        let mut score = 60;
        if probe.u64_at(11)? < probe.file_len {
            score += 15;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<11>()?;
        ensure_magic(&magic, XP3_MAGIC, 0)?;
        let at = index_offset(reader)?;
        let index = read_index(reader, at)?;
        let mut chunks = BinaryReader::from_bytes(index);
        let mut entries = Vec::new();
        let mut skipped = 0;
        while chunks.remaining() >= 12 {
            let tag = chunks.read_array::<4>()?;
            let size = chunks.read_u64()?;
            let body = chunks.position();
            let end = body
                .checked_add(size)
                .filter(|e| *e <= chunks.len())
                .ok_or_else(|| ArcError::corrupt(at, "extent", format!("index chunk at {:#x} overruns the index", body - 12)))?;
            if &tag == CHUNK_FILE {
                let (name, original, segments) = read_file_chunk(&mut chunks, end, at)?;
                if name.contains(PROTECTION_NOTICE) {
                    skipped += 1;
                } else {
                    entries.push(entry_from_segments(reader, name, original, segments, ctx.config.xp3_mdf_decompress, at)?);
                }
            }
            chunks.seek(end)?;
        }
        if skipped > 0 {
            tracing::debug!("xp3: skipped {} protection notice entries", skipped);
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
        Ok(Box::new(Xp3ArchiveWriter::new(output, files, &options.config)?))
    }
}

#[derive(Debug, Clone, Default)]
struct WrittenFile {
    adler: u32,
    segment: Option<Segment>,
}

/// Writes one segment per file, zlib compressed when that saves space.
pub struct Xp3ArchiveWriter<'w> {
    writer: &'w mut dyn ReadWriteSeek,
    slots: Slots,
    written: Vec<WrittenFile>,
    pending: Option<usize>,
    buffer: Cursor<Vec<u8>>,
    compress_files: bool,
    compress_index: bool,
    level: Compression,
}

impl<'w> Xp3ArchiveWriter<'w> {
    pub fn new(writer: &'w mut dyn ReadWriteSeek, files: &[&str], config: &ExtraConfig) -> Result<Self> {
        writer.write_all(XP3_MAGIC)?;
        writer.write_u64(0)?; // Placeholder for index offset
        Ok(Xp3ArchiveWriter {
            writer,
            slots: Slots::new(files)?,
            written: vec![WrittenFile::default(); files.len()],
            pending: None,
            buffer: Cursor::new(Vec::new()),
            compress_files: config.xp3_compress_files,
            compress_index: config.xp3_compress_index,
            level: Compression::new(config.zlib_compression_level.min(9)),
        })
    }

    fn zlib(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    /// Moves the buffered file into the archive.
    fn flush_pending(&mut self) -> Result<()> {
        let Some(i) = self.pending.take() else {
            return Ok(());
        };
        let data = std::mem::take(self.buffer.get_mut());
        self.buffer.set_position(0);
        let adler = adler::adler32_slice(&data);
        let packed = if self.compress_files && !data.is_empty() {
            Some(self.zlib(&data)?).filter(|p| p.len() < data.len())
        } else {
            None
        };
        let offset = self.writer.seek(SeekFrom::End(0))?;
        let (codec, stored) = match &packed {
            Some(p) => (Codec::Zlib, p.as_slice()),
            None => (Codec::Raw, data.as_slice()),
        };
        self.writer.write_all(stored)?;
        self.written[i] = WrittenFile {
            adler,
            segment: Some(Segment {
                codec,
                offset,
                original: data.len() as u64,
                packed: stored.len() as u64,
            }),
        };
        Ok(())
    }

    fn build_index(&self) -> Result<Vec<u8>> {
        let mut index = Vec::new();
        for (i, file) in self.written.iter().enumerate() {
            let name = encode_string(Encoding::Utf16Le, self.slots.name(i), true)?;
            let units = u16::try_from(name.len() / 2)
                .map_err(|_| ArcError::InvalidInput(format!("name '{}' is too long", self.slots.name(i))))?;
            let segment = file.segment.unwrap_or(Segment {
                codec: Codec::Raw,
                offset: 0,
                original: 0,
                packed: 0,
            });

            let mut body = Vec::new();
            body.write_all(CHUNK_INFO)?;
            body.write_u64(4 + 8 + 8 + 2 + name.len() as u64)?;
            body.write_u32(0)?;
            body.write_u64(segment.original)?;
            body.write_u64(segment.packed)?;
            body.write_u16(units)?;
            body.write_all(&name)?;

            body.write_all(CHUNK_SEGM)?;
            body.write_u64(SEGM_RECORD_LEN)?;
            body.write_u32(if segment.codec == Codec::Zlib { SEGM_ENCODE_ZLIB } else { SEGM_ENCODE_RAW })?;
            body.write_u64(segment.offset)?;
            body.write_u64(segment.original)?;
            body.write_u64(segment.packed)?;

            body.write_all(CHUNK_ADLR)?;
            body.write_u64(4)?;
            body.write_u32(file.adler)?;

            index.write_all(CHUNK_FILE)?;
            index.write_u64(body.len() as u64)?;
            index.write_all(&body)?;
        }
        Ok(index)
    }
}

impl ArchiveWriter for Xp3ArchiveWriter<'_> {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>> {
        self.flush_pending()?;
        self.pending = Some(self.slots.claim(name)?);
        Ok(Box::new(&mut self.buffer))
    }

    fn write_header(&mut self) -> Result<()> {
        self.flush_pending()?;
        let index = self.build_index()?;
        let index_offset = self.writer.seek(SeekFrom::End(0))?;
        if self.compress_index {
            let packed = self.zlib(&index)?;
            self.writer.write_u8(INDEX_ENCODE_ZLIB)?;
            self.writer.write_u64(packed.len() as u64)?;
            self.writer.write_u64(index.len() as u64)?;
            self.writer.write_all(&packed)?;
        } else {
            self.writer.write_u8(INDEX_ENCODE_RAW)?;
            self.writer.write_u64(index.len() as u64)?;
            self.writer.write_all(&index)?;
        }
        self.writer.seek(SeekFrom::Start(XP3_MAGIC.len() as u64))?;
        self.writer.write_u64(index_offset)?;
        tracing::debug!("xp3: index of {} bytes at {:#x}", index.len(), index_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;
    use proptest::prelude::*;

    fn items() -> Vec<PackItem> {
        vec![
            PackItem::bytes("scenario/first.ks", b"*start\n[wait time=200]\n".repeat(20)),
            PackItem::bytes("image/bg.tlg", vec![0x17, 0x42, 0x99, 0x03]),
            PackItem::bytes("empty.txt", Vec::new()),
        ]
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Builds a raw-index archive with one file made of `segments` (flags, stored bytes, original length).
    fn handmade(name: &str, segments: &[(u32, Vec<u8>, u64)]) -> Vec<u8> {
        let mut data = XP3_MAGIC.to_vec();
        data.extend_from_slice(&0u64.to_le_bytes());
        let mut segm = Vec::new();
        let mut original = 0;
        for (flags, stored, len) in segments {
            segm.extend_from_slice(&flags.to_le_bytes());
            segm.extend_from_slice(&(data.len() as u64).to_le_bytes());
            segm.extend_from_slice(&len.to_le_bytes());
            segm.extend_from_slice(&(stored.len() as u64).to_le_bytes());
            data.extend_from_slice(stored);
            original = u64::wrapping_add(original, *len);
        }
        let units: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut body = CHUNK_INFO.to_vec();
        body.extend_from_slice(&(22 + units.len() as u64).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&original.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes());
        body.extend_from_slice(&(units.len() as u16 / 2).to_le_bytes());
        body.extend_from_slice(&units);
        body.extend_from_slice(CHUNK_SEGM);
        body.extend_from_slice(&(segm.len() as u64).to_le_bytes());
        body.extend_from_slice(&segm);
        let mut index = CHUNK_FILE.to_vec();
        index.extend_from_slice(&(body.len() as u64).to_le_bytes());
        index.extend_from_slice(&body);

        let index_at = data.len() as u64;
        data[11..19].copy_from_slice(&index_at.to_le_bytes());
        data.push(INDEX_ENCODE_RAW);
        data.extend_from_slice(&(index.len() as u64).to_le_bytes());
        data.extend_from_slice(&index);
        data
    }

    #[test]
    fn written_archive_decodes() {
        let data = serialize_to_vec(&Xp3ArchiveBuilder::new(), &items(), &WriteOptions::default()).unwrap();
        let table = decode_bytes(&Xp3ArchiveBuilder::new(), "data.xp3", &data).unwrap();
        assert_eq!(table.get(0).unwrap().transform, Transform::Zlib);
        assert_eq!(table.get(1).unwrap().transform, Transform::None);
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0].1, b"*start\n[wait time=200]\n".repeat(20));
        assert_eq!(files[1], ("image/bg.tlg".to_string(), vec![0x17, 0x42, 0x99, 0x03]));
        assert_eq!(files[2], ("empty.txt".to_string(), Vec::new()));
        assert_eq!(score_of(&Xp3ArchiveBuilder::new(), "data.xp3", &data), 100);
    }

    #[test]
    fn uncompressed_index_and_files() {
        let mut config = ExtraConfig::default();
        config.xp3_compress_files = false;
        config.xp3_compress_index = false;
        let options = WriteOptions {
            config,
            ..Default::default()
        };
        let data = serialize_to_vec(&Xp3ArchiveBuilder::new(), &items(), &options).unwrap();
        let index_at = u64::from_le_bytes(data[11..19].try_into().unwrap()) as usize;
        assert_eq!(data[index_at], INDEX_ENCODE_RAW);
        let table = decode_bytes(&Xp3ArchiveBuilder::new(), "data.xp3", &data).unwrap();
        assert!(table.iter().all(|e| e.transform == Transform::None));
        assert_eq!(contents(&table, &data).unwrap()[0].1, b"*start\n[wait time=200]\n".repeat(20));
    }

    #[test]
    fn mixed_segments_become_variable_chunks() {
        let head = b"segment one, stored raw. ".to_vec();
        let tail = b"segment two is zlib zlib zlib zlib".to_vec();
        let data = handmade(
            "bgm/op.ogg",
            &[
                (SEGM_ENCODE_RAW, head.clone(), head.len() as u64),
                (SEGM_ENCODE_ZLIB, zlib(&tail), tail.len() as u64),
            ],
        );
        let table = decode_bytes(&Xp3ArchiveBuilder::new(), "bgm.xp3", &data).unwrap();
        let entry = table.get(0).unwrap();
        assert!(matches!(entry.transform, Transform::Variable { .. }));
        assert_eq!(entry.decompressed_length, (head.len() + tail.len()) as u64);
        let mut expected = head;
        expected.extend_from_slice(&tail);
        assert_eq!(contents(&table, &data).unwrap()[0], ("bgm/op.ogg".to_string(), expected));
    }

    #[test]
    fn uniform_segments_become_chunked() {
        let a = b"first half ".repeat(8);
        let b = b"second half ".repeat(8);
        let data = handmade(
            "a.txt",
            &[
                (SEGM_ENCODE_ZLIB, zlib(&a), a.len() as u64),
                (SEGM_ENCODE_ZLIB, zlib(&b), b.len() as u64),
            ],
        );
        let table = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap();
        assert!(matches!(table.get(0).unwrap().transform, Transform::Chunked { codec: Codec::Zlib, .. }));
        assert_eq!(contents(&table, &data).unwrap()[0].1, [a, b].concat());
    }

    #[test]
    fn mdf_payloads_are_unwrapped_on_request() {
        let text = b"mdf wrapped script text".to_vec();
        let mut payload = MDF_MAGIC.to_vec();
        payload.extend_from_slice(&(text.len() as u32).to_le_bytes());
        payload.extend_from_slice(&zlib(&text));
        let data = handmade("scn/a.scn", &[(SEGM_ENCODE_RAW, payload.clone(), payload.len() as u64)]);

        let plain = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap();
        assert_eq!(contents(&plain, &data).unwrap()[0].1, payload);

        let mut config = ExtraConfig::default();
        config.xp3_mdf_decompress = true;
        let table = decode_with(&Xp3ArchiveBuilder::new(), "a.xp3", &data, &config).unwrap();
        assert_eq!(table.get(0).unwrap().transform, Transform::ZlibUnknownSize);
        assert_eq!(contents(&table, &data).unwrap()[0].1, text);
    }

    #[test]
    fn protection_notice_is_skipped() {
        let data = handmade(PROTECTION_NOTICE, &[(SEGM_ENCODE_RAW, b"warning".to_vec(), 7)]);
        let table = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn segment_lengths_must_match_info() {
        let mut data = handmade("a.bin", &[(SEGM_ENCODE_RAW, b"abcd".to_vec(), 4)]);
        // info original size: index header (9) + File header (12) + info header (12) + flags (4)
        let index_at = u64::from_le_bytes(data[11..19].try_into().unwrap()) as usize;
        let original = index_at + 9 + 12 + 12 + 4;
        data[original..original + 8].copy_from_slice(&5u64.to_le_bytes());
        let err = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { check: "length", .. }));
    }

    #[test]
    fn segment_sizes_that_overflow_are_corrupt() {
        let huge = 1u64 << 63;
        let data = handmade(
            "a.bin",
            &[(SEGM_ENCODE_ZLIB, zlib(b"a"), huge), (SEGM_ENCODE_ZLIB, zlib(b"b"), huge)],
        );
        let err = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { check: "length", .. }));
    }

    #[test]
    fn broken_zlib_index_is_corrupt() {
        let mut data = handmade("a.bin", &[(SEGM_ENCODE_RAW, b"abcd".to_vec(), 4)]);
        let index_at = u64::from_le_bytes(data[11..19].try_into().unwrap());
        data.truncate(index_at as usize);
        data.push(INDEX_ENCODE_ZLIB);
        data.extend_from_slice(&8u64.to_le_bytes());
        data.extend_from_slice(&100u64.to_le_bytes());
        data.extend_from_slice(&[0xFF; 8]);
        let err = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset, check: "index", .. } if offset == index_at));
    }

    #[test]
    fn index_offset_beyond_the_file_is_corrupt() {
        let mut data = handmade("a.bin", &[(SEGM_ENCODE_RAW, b"abcd".to_vec(), 4)]);
        data[11..19].copy_from_slice(&0x10_0000u64.to_le_bytes());
        let err = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 11, check: "offset", .. }));
        assert_eq!(score_of(&Xp3ArchiveBuilder::new(), "a.xp3", &data), 85);
    }

    proptest! {
        #[test]
        fn pack_then_decode(files in proptest::collection::btree_map("[a-z/]{1,16}", proptest::collection::vec(0u8..4, 0..600), 0..6)) {
            let items: Vec<_> = files.iter().map(|(n, d)| PackItem::bytes(n.clone(), d.clone())).collect();
            let data = serialize_to_vec(&Xp3ArchiveBuilder::new(), &items, &WriteOptions::default()).unwrap();
            let table = decode_bytes(&Xp3ArchiveBuilder::new(), "a.xp3", &data).unwrap();
            let expected: Vec<_> = files.into_iter().collect();
            prop_assert_eq!(contents(&table, &data).unwrap(), expected);
        }
    }
}
