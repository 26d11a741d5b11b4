//! RPG Maker RGSSAD archives (`.rgssad`, `.rgss2a` and `.rgss3a`).
use super::base::*;
use crate::decode::{CipherReader, DecodeContext, DirectoryCipher};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::reader::SourceReader;
use crate::types::*;
use crate::utils::xored_stream::RollingXorStream;
use crate::validate::*;

const MAGIC: &[u8; 7] = b"RGSSAD\0";
const HEADER_LEN: u64 = 8;
const V1_KEY: u32 = 0xDEAD_CAFE;

/// Version 1: every field and every name byte advances the key.
struct RollingKey {
    key: u32,
}

impl DirectoryCipher for RollingKey {
    fn decrypt_u32(&mut self, value: u32) -> u32 {
        let plain = value ^ self.key;
        self.key = RollingXorStream::<()>::step(self.key);
        plain
    }

    fn decrypt_bytes(&mut self, data: &mut [u8]) {
        for b in data {
            *b ^= self.key as u8;
            self.key = RollingXorStream::<()>::step(self.key);
        }
    }
}

/// Version 3: one key for the whole directory.
struct FixedKey {
    key: u32,
}

impl DirectoryCipher for FixedKey {
    fn decrypt_u32(&mut self, value: u32) -> u32 {
        value ^ self.key
    }

    fn decrypt_bytes(&mut self, data: &mut [u8]) {
        let key = self.key.to_le_bytes();
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }
}

fn entry_name(raw: String) -> String {
    raw.replace('\\', "/")
}

#[derive(Debug)]
pub struct RgssadArchiveBuilder {}

impl RgssadArchiveBuilder {
    pub const fn new() -> Self {
        RgssadArchiveBuilder {}
    }

    fn decode_v1(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let mut dir = CipherReader::new(reader, RollingKey { key: V1_KEY });
        let mut entries = Vec::new();
        while dir.reader.remaining() > 0 {
            let at = dir.position();
            let name_len = dir.read_u32()? as u64;
            ensure_range(name_len, 1, MAX_NAME_LENGTH, at)?;
            let name = entry_name(dir.read_string(name_len, ctx.encoding)?);
            let size_at = dir.position();
            let size = dir.read_u32()? as u64;
            let offset = dir.position();
            ensure_extent(offset, size, dir.reader.len(), size_at)?;
            let seed = dir.cipher.key;
            entries.push(ArchiveEntry::stored(name, offset, size).with_transform(Transform::RollingXor { seed }, size));
            dir.reader.skip(size)?;
        }
        Ok(entries)
    }

    fn decode_v3(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let seed = reader.read_u32()?;
        let key = seed.wrapping_mul(9).wrapping_add(3);
        let mut dir = CipherReader::new(reader, FixedKey { key });
        let mut entries = Vec::new();
        loop {
            let at = dir.position();
            let offset = dir.read_u32()? as u64;
            if offset == 0 {
                break;
            }
            let size = dir.read_u32()? as u64;
            let file_key = dir.read_u32()?;
            let name_len = dir.read_u32()? as u64;
            ensure_range(name_len, 1, MAX_NAME_LENGTH, at + 12)?;
            let name = entry_name(dir.read_string(name_len, ctx.encoding)?);
            ensure_extent(offset, size, dir.reader.len(), at)?;
            entries.push(
                ArchiveEntry::stored(name, offset, size).with_transform(Transform::RollingXor { seed: file_key }, size),
            );
        }
        Ok(entries)
    }
}

impl ArchiveBuilder for RgssadArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Rgssad
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rgssad", "rgss2a", "rgss3a"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["RPG Maker XP", "RPG Maker VX", "RPG Maker VX Ace"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(MAGIC) {
            return None;
        }
        let mut score = 60;
        if matches!(probe.u8_at(7)?, 1 | 3) {
            score += 15;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<7>()?;
        ensure_magic(&magic, MAGIC, 0)?;
        let version = reader.read_u8()?;
        debug_assert_eq!(reader.position(), HEADER_LEN);
        let entries = match version {
            1 => self.decode_v1(reader, ctx)?,
            3 => self.decode_v3(reader, ctx)?,
            other => return Err(ArcError::UnsupportedVariant(format!("RGSSAD version {}", other))),
        };
        tracing::debug!("rgssad v{}: {} entries", version, entries.len());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;
    use std::io::Write;

    fn rolling(data: &[u8], seed: u32) -> Vec<u8> {
        let mut out = Vec::new();
        RollingXorStream::new(&mut out, seed).write_all(data).unwrap();
        out
    }

    /// Encrypts like RPG Maker XP: directory records interleaved with data.
    fn v1(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.push(1);
        let mut key = V1_KEY;
        let step = RollingXorStream::<()>::step;
        for (name, data) in files {
            out.extend_from_slice(&(name.len() as u32 ^ key).to_le_bytes());
            key = step(key);
            for b in name.bytes() {
                out.push(b ^ key as u8);
                key = step(key);
            }
            out.extend_from_slice(&(data.len() as u32 ^ key).to_le_bytes());
            key = step(key);
            out.extend_from_slice(&rolling(data, key));
        }
        out
    }

    fn v3(seed: u32, files: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let key = seed.wrapping_mul(9).wrapping_add(3);
        let mut out = MAGIC.to_vec();
        out.push(3);
        out.extend_from_slice(&seed.to_le_bytes());
        let dir_len: usize = files.iter().map(|(n, _, _)| 16 + n.len()).sum::<usize>() + 4;
        let mut offset = (out.len() + dir_len) as u32;
        let mut payload = Vec::new();
        for (name, data, file_key) in files {
            for v in [offset, data.len() as u32, *file_key, name.len() as u32] {
                out.extend_from_slice(&(v ^ key).to_le_bytes());
            }
            let key_bytes = key.to_le_bytes();
            out.extend(name.bytes().enumerate().map(|(i, b)| b ^ key_bytes[i % 4]));
            payload.extend_from_slice(&rolling(data, *file_key));
            offset += data.len() as u32;
        }
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn version_1_keys_follow_the_directory() {
        let data = v1(&[
            ("Data\\Scripts.rxdata", b"scripts scripts scripts".as_slice()),
            ("Graphics\\Titles\\title.png", b"\x89PNG\r\n\x1a\n".as_slice()),
        ]);
        let table = decode_bytes(&RgssadArchiveBuilder::new(), "Game.rgssad", &data).unwrap();
        // name_len, name (19 bytes), size: 21 steps from the initial key
        let mut key = V1_KEY;
        for _ in 0..21 {
            key = RollingXorStream::<()>::step(key);
        }
        assert_eq!(table.get(0).unwrap().transform, Transform::RollingXor { seed: key });
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0], ("Data/Scripts.rxdata".to_string(), b"scripts scripts scripts".to_vec()));
        assert_eq!(files[1].0, "Graphics/Titles/title.png");
        assert_eq!(files[1].1, b"\x89PNG\r\n\x1a\n");
        assert_eq!(score_of(&RgssadArchiveBuilder::new(), "Game.rgssad", &data), 100);
    }

    #[test]
    fn version_3_uses_per_file_keys() {
        let data = v3(
            0x1234_5678,
            &[
                ("Data\\Map001.rvdata2", b"map data here".as_slice(), 0xCAFE_0001),
                ("Audio\\SE\\Bell.ogg", b"OggS".as_slice(), 0x0BAD_F00D),
            ],
        );
        let table = decode_bytes(&RgssadArchiveBuilder::new(), "Game.rgss3a", &data).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).unwrap().transform, Transform::RollingXor { seed: 0x0BAD_F00D });
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0], ("Data/Map001.rvdata2".to_string(), b"map data here".to_vec()));
        assert_eq!(files[1], ("Audio/SE/Bell.ogg".to_string(), b"OggS".to_vec()));
    }

    #[test]
    fn truncated_version_1_data_is_corrupt() {
        let mut data = v1(&[("a.txt", b"0123456789".as_slice())]);
        data.truncate(data.len() - 3);
        let err = decode_bytes(&RgssadArchiveBuilder::new(), "Game.rgssad", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 17, check: "extent", .. }));
    }

    #[test]
    fn garbage_name_length_is_corrupt() {
        let mut data = v3(7, &[("a.txt", b"abc".as_slice(), 1)]);
        data[12 + 15] ^= 0xFF;
        let err = decode_bytes(&RgssadArchiveBuilder::new(), "Game.rgss3a", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 24, check: "range", .. }));
    }

    #[test]
    fn other_versions_are_unsupported() {
        let mut data = v1(&[("a.txt", b"abc".as_slice())]);
        data[7] = 2;
        assert!(matches!(
            decode_bytes(&RgssadArchiveBuilder::new(), "Game.rgss2a", &data),
            Err(ArcError::UnsupportedVariant(_))
        ));
        assert_eq!(score_of(&RgssadArchiveBuilder::new(), "Game.rgss2a", &data), 85);
    }
}
