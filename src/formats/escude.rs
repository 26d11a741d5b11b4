//! Escude ESC-ARC2 archives.
//!
//! The directory after the magic is XORed with a key stream seeded by the u32 at
//! offset 8. Names live in a plain NUL terminated table after the directory.
use super::base::*;
use crate::decode::{CipherReader, DecodeContext, DirectoryCipher, resolve_name_table};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::ext::io::*;
use crate::reader::SourceReader;
use crate::types::*;
use crate::utils::encoding::encode_string;
use crate::utils::lzw;
use crate::validate::*;
use std::io::{Cursor, SeekFrom, Write};

const MAGIC: &[u8; 8] = b"ESC-ARC2";
const SEED_AT: u64 = 0x8;
const COUNT_AT: u64 = 0xC;
const DIRECTORY_AT: u64 = 0x14;
const RECORD_LEN: u64 = 12;

/// Key stream of the directory. Every u32 consumes one step.
#[derive(Debug, Clone, Copy)]
struct EscudeKey {
    key: u32,
}

impl EscudeKey {
    fn next(&mut self) -> u32 {
        let mut k = self.key ^ 0x65AC_9365;
        k ^= (((k >> 1) ^ k) >> 3) ^ (((k << 1) ^ k) << 3);
        self.key = k;
        k
    }
}

impl DirectoryCipher for EscudeKey {
    fn decrypt_u32(&mut self, value: u32) -> u32 {
        value ^ self.next()
    }

    fn decrypt_bytes(&mut self, data: &mut [u8]) {
        for word in data.chunks_exact_mut(4) {
            let k = self.next().to_le_bytes();
            for (b, k) in word.iter_mut().zip(k) {
                *b ^= k;
            }
        }
    }
}

struct Record {
    at: u64,
    name_offset: u64,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
pub struct EscudeArchiveBuilder {}

impl EscudeArchiveBuilder {
    pub const fn new() -> Self {
        EscudeArchiveBuilder {}
    }
}

impl ArchiveBuilder for EscudeArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Escude
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["bin"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Hanaou", "Pani Con", "Otome Renshin Prister"]
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::Cp932
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(MAGIC) {
            return None;
        }
        let mut score = 50;
        let mut key = EscudeKey {
            key: probe.u32_at(SEED_AT)?,
        };
        let count = key.decrypt_u32(probe.u32_at(COUNT_AT)?) as u64;
        if check_num_files(count as i64) && check_offset(DIRECTORY_AT + count * RECORD_LEN, probe.file_len) {
            score += 25;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<8>()?;
        ensure_magic(&magic, MAGIC, 0)?;
        let seed = reader.read_u32()?;
        let mut dir = CipherReader::new(reader, EscudeKey { key: seed });
        let count = ensure_num_files(dir.read_u32()? as i64, COUNT_AT)?;
        let name_tbl_len = dir.read_u32()? as u64;
        let table_start = DIRECTORY_AT + count as u64 * RECORD_LEN;
        ensure_offset(table_start, dir.reader.len(), COUNT_AT)?;
        let mut records = Vec::with_capacity(capacity_hint(count));
        for _ in 0..count {
            records.push(Record {
                at: dir.position(),
                name_offset: dir.read_u32()? as u64,
                offset: dir.read_u32()? as u64,
                size: dir.read_u32()? as u64,
            });
        }
        let offsets: Vec<u64> = records.iter().map(|r| r.name_offset).collect();
        let names = resolve_name_table(reader, table_start, name_tbl_len, &offsets, ctx.encoding)?;

        let mut entries = Vec::with_capacity(records.len());
        for (record, name) in records.into_iter().zip(names) {
            ensure_extent(record.offset, record.size, reader.len(), record.at + 4)?;
            let head = reader.read_at(record.offset, record.size.min(8))?;
            let entry = ArchiveEntry::stored(name, record.offset, record.size);
            let entry = match lzw::unpacked_size(&head).filter(|_| lzw::is_lzw(&head)) {
                Some(unpacked) => entry.with_transform(Transform::Lzw, unpacked as u64),
                None => entry,
            };
            entries.push(entry);
        }
        tracing::debug!("escude: {} entries, seed {:#010x}", entries.len(), seed);
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
        Ok(Box::new(EscudeArchiveWriter::new(output, files, options.encoding, &options.config)?))
    }
}

pub struct EscudeArchiveWriter<'w> {
    writer: &'w mut dyn ReadWriteSeek,
    slots: Slots,
    name_offsets: Vec<u32>,
    name_tbl_len: u32,
    seed: u32,
    fake: bool,
    pending: Option<usize>,
    buffer: Cursor<Vec<u8>>,
}

impl<'w> EscudeArchiveWriter<'w> {
    pub fn new(writer: &'w mut dyn ReadWriteSeek, files: &[&str], encoding: Encoding, config: &ExtraConfig) -> Result<Self> {
        writer.write_all(MAGIC)?;
        // seed, count, name table length and the directory, written last
        writer.write_fill(0, (DIRECTORY_AT - SEED_AT) as usize + files.len() * RECORD_LEN as usize)?;
        let mut table = Vec::new();
        let mut name_offsets = Vec::with_capacity(files.len());
        for file in files {
            let encoded = encode_string(encoding, file, true)?;
            if encoded.contains(&0) {
                return Err(ArcError::InvalidInput(format!("name '{}' contains NUL", file)));
            }
            name_offsets.push(table.len() as u32);
            table.extend_from_slice(&encoded);
            table.push(0);
        }
        writer.write_all(&table)?;
        let name_tbl_len = u32::try_from(table.len())
            .map_err(|_| ArcError::InvalidInput("name table larger than 4 GiB".into()))?;
        Ok(EscudeArchiveWriter {
            writer,
            slots: Slots::new(files)?,
            name_offsets,
            name_tbl_len,
            seed: config.escude_key.unwrap_or_else(|| crc32fast::hash(&table)),
            fake: config.escude_fake_compress,
            pending: None,
            buffer: Cursor::new(Vec::new()),
        })
    }

    fn flush_pending(&mut self) -> Result<()> {
        let Some(i) = self.pending.take() else {
            return Ok(());
        };
        let data = std::mem::take(self.buffer.get_mut());
        self.buffer.set_position(0);
        let payload = if self.fake { lzw::compress_literal(&data)? } else { data };
        let mut out = self.slots.open_at_end(self.writer, i, 1)?;
        out.write_all(&payload)?;
        Ok(())
    }
}

impl ArchiveWriter for EscudeArchiveWriter<'_> {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>> {
        self.flush_pending()?;
        self.pending = Some(self.slots.claim(name)?);
        Ok(Box::new(&mut self.buffer))
    }

    fn write_header(&mut self) -> Result<()> {
        self.flush_pending()?;
        let mut key = EscudeKey { key: self.seed };
        let mut directory = vec![self.slots.len() as u32, self.name_tbl_len];
        for (i, (name, offset, size)) in self.slots.iter().enumerate() {
            let field = |v: u64| {
                u32::try_from(v).map_err(|_| ArcError::InvalidInput(format!("'{}' lies beyond 4 GiB", name)))
            };
            directory.extend([self.name_offsets[i], field(offset)?, field(size)?]);
        }
        self.writer.seek(SeekFrom::Start(SEED_AT))?;
        self.writer.write_u32(self.seed)?;
        for value in directory {
            self.writer.write_u32(value ^ key.next())?;
        }
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
            PackItem::bytes("script/0001.bin", b"ESCR1_00 scene one".to_vec()),
            PackItem::bytes("db_data.bin", b"LIST database".to_vec()),
        ]
    }

    fn with_config(f: impl FnOnce(&mut ExtraConfig)) -> WriteOptions {
        let mut config = ExtraConfig::default();
        f(&mut config);
        WriteOptions {
            encoding: Encoding::Cp932,
            config,
            ..Default::default()
        }
    }

    #[test]
    fn key_stream_steps() {
        let mut key = EscudeKey { key: 0x1234_5678 };
        assert_eq!(key.next(), 0xBB58_28D7);
        assert_eq!(key.next(), 0xD02B_01CF);
        assert_eq!(key.next(), 0x5C2A_A625);
    }

    #[test]
    fn directory_is_encrypted_with_the_seed() {
        let options = with_config(|c| c.escude_key = Some(0x1234_5678));
        let data = serialize_to_vec(&EscudeArchiveBuilder::new(), &items(), &options).unwrap();
        assert_eq!(&data[8..12], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&data[12..16], &(2u32 ^ 0xBB58_28D7).to_le_bytes());
        let table = decode_bytes(&EscudeArchiveBuilder::new(), "data.bin", &data).unwrap();
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0], ("script/0001.bin".to_string(), b"ESCR1_00 scene one".to_vec()));
        assert_eq!(files[1], ("db_data.bin".to_string(), b"LIST database".to_vec()));
        assert_eq!(score_of(&EscudeArchiveBuilder::new(), "data.bin", &data), 100);
    }

    #[test]
    fn default_seed_is_the_name_table_crc() {
        let data = serialize_to_vec(&EscudeArchiveBuilder::new(), &items(), &with_config(|_| {})).unwrap();
        let table_start = 0x14 + 2 * 12;
        let table = b"script/0001.bin\0db_data.bin\0";
        assert_eq!(&data[table_start..table_start + table.len()], table);
        assert_eq!(&data[8..12], &crc32fast::hash(table).to_le_bytes());
    }

    #[test]
    fn fake_compression_round_trips_through_lzw() {
        let options = with_config(|c| c.escude_fake_compress = true);
        let data = serialize_to_vec(&EscudeArchiveBuilder::new(), &items(), &options).unwrap();
        let table = decode_bytes(&EscudeArchiveBuilder::new(), "data.bin", &data).unwrap();
        let entry = table.get(0).unwrap();
        assert_eq!(entry.transform, Transform::Lzw);
        assert_eq!(entry.decompressed_length, 18);
        assert_eq!(contents(&table, &data).unwrap()[0].1, b"ESCR1_00 scene one");
    }

    #[test]
    fn name_offset_outside_the_table_is_corrupt() {
        let options = with_config(|c| c.escude_key = Some(0x1234_5678));
        let mut data = serialize_to_vec(&EscudeArchiveBuilder::new(), &items(), &options).unwrap();
        // first record's name offset is the third key stream value
        data[0x14..0x18].copy_from_slice(&(0x400u32 ^ 0x5C2A_A625).to_le_bytes());
        let err = decode_bytes(&EscudeArchiveBuilder::new(), "data.bin", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { check: "offset", .. }));
    }

    #[test]
    fn wrong_seed_fails_cleanly() {
        let options = with_config(|c| c.escude_key = Some(0x1234_5678));
        let mut data = serialize_to_vec(&EscudeArchiveBuilder::new(), &items(), &options).unwrap();
        data[8] ^= 0x55;
        assert!(decode_bytes(&EscudeArchiveBuilder::new(), "data.bin", &data).is_err());
    }

    proptest! {
        #[test]
        fn pack_then_decode(files in proptest::collection::btree_map("[a-z_]{1,12}\\.bin", proptest::collection::vec(any::<u8>(), 0..200), 0..6), fake in any::<bool>()) {
            let items: Vec<_> = files.iter().map(|(n, d)| PackItem::bytes(n.clone(), d.clone())).collect();
            let options = with_config(|c| c.escude_fake_compress = fake);
            let data = serialize_to_vec(&EscudeArchiveBuilder::new(), &items, &options).unwrap();
            let table = decode_bytes(&EscudeArchiveBuilder::new(), "a.bin", &data).unwrap();
            let expected: Vec<_> = files.into_iter().collect();
            prop_assert_eq!(contents(&table, &data).unwrap(), expected);
        }
    }
}
