//! Bethesda BSA archives, versions 103 (Oblivion), 104 (Fallout 3, Skyrim) and
//! 105 (Skyrim Special Edition).
use super::base::*;
use crate::decode::{DecodeContext, TreeWalk, synth_name};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::reader::SourceReader;
use crate::types::*;
use crate::validate::*;

const MAGIC: &[u8; 4] = b"BSA\0";
const HEADER_LEN: u32 = 36;

const HAS_FOLDER_NAMES: u32 = 0x1;
const HAS_FILE_NAMES: u32 = 0x2;
const COMPRESSED_BY_DEFAULT: u32 = 0x4;
const EMBEDDED_NAMES: u32 = 0x100;

const SIZE_TOGGLES_COMPRESSION: u32 = 0x4000_0000;
const SIZE_MASK: u32 = 0x3FFF_FFFF;

#[derive(Debug)]
struct FileRecord {
    at: u64,
    folder: usize,
    raw_size: u32,
    offset: u32,
}

#[derive(Debug)]
pub struct BsaArchiveBuilder {}

impl BsaArchiveBuilder {
    pub const fn new() -> Self {
        BsaArchiveBuilder {}
    }
}

impl ArchiveBuilder for BsaArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Bsa
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["bsa"]
    }

    fn games(&self) -> &'static [&'static str] {
        &[
            "The Elder Scrolls IV: Oblivion",
            "Fallout 3",
            "Fallout: New Vegas",
            "The Elder Scrolls V: Skyrim",
        ]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(MAGIC) {
            return None;
        }
        let mut score = 40;
        if matches!(probe.u32_at(4)?, 103..=105) {
            score += 20;
        }
        if probe.u32_at(8)? == HEADER_LEN {
            score += 15;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<4>()?;
        ensure_magic(&magic, MAGIC, 0)?;
        let version = reader.read_u32()?;
        if !matches!(version, 103..=105) {
            return Err(ArcError::UnsupportedVariant(format!("BSA version {}", version)));
        }
        let folder_offset = reader.read_u32()? as u64;
        let flags = reader.read_u32()?;
        let folder_count = ensure_num_files(reader.read_u32()? as i64, 16)?;
        let file_count = ensure_num_files(reader.read_u32()? as i64, 20)?;
        reader.skip(12)?;

        reader.seek(folder_offset)?;
        let mut folder_sizes = Vec::with_capacity(capacity_hint(folder_count));
        for _ in 0..folder_count {
            reader.skip(8)?;
            let at = reader.position();
            folder_sizes.push((at, reader.read_u32()? as u64));
            reader.skip(if version == 105 { 12 } else { 4 })?;
        }
        let declared: u64 = folder_sizes.iter().map(|(_, n)| n).sum();
        if declared != file_count as u64 {
            return Err(ArcError::corrupt(
                20,
                "num_files",
                format!("folders hold {} files, header declares {}", declared, file_count),
            ));
        }

        let mut tree = TreeWalk::new((folder_count + file_count) as u64);
        let mut records = Vec::with_capacity(capacity_hint(file_count));
        for (at, count) in folder_sizes {
            tree.visit(at)?;
            let name = if flags & HAS_FOLDER_NAMES != 0 {
                reader
                    .read_u8_prefixed_string(ctx.encoding)?
                    .trim_end_matches('\0')
                    .replace('\\', "/")
            } else {
                String::new()
            };
            let folder = tree.push_dir(name, None, count, at)?;
            for _ in 0..count {
                let at = reader.position();
                tree.visit(at)?;
                reader.skip(8)?;
                records.push(FileRecord {
                    at,
                    folder,
                    raw_size: reader.read_u32()?,
                    offset: reader.read_u32()?,
                });
            }
        }

        let mut names = Vec::with_capacity(records.len());
        for i in 0..records.len() {
            if flags & HAS_FILE_NAMES != 0 {
                names.push(reader.read_cstring(MAX_NAME_LENGTH as usize, ctx.encoding)?);
            } else {
                names.push(synth_name(i, "bin"));
            }
        }

        let mut entries = Vec::with_capacity(records.len());
        for (record, name) in records.into_iter().zip(names) {
            let mut offset = record.offset as u64;
            let mut size = (record.raw_size & SIZE_MASK) as u64;
            ensure_extent(offset, size, reader.len(), record.at + 12)?;
            if version >= 104 && flags & EMBEDDED_NAMES != 0 {
                let skip = reader.read_at(offset, 1)?[0] as u64 + 1;
                if skip > size {
                    return Err(ArcError::corrupt(offset, "length", "embedded name longer than the entry"));
                }
                offset += skip;
                size -= skip;
            }
            let compressed = (flags & COMPRESSED_BY_DEFAULT != 0) != (record.raw_size & SIZE_TOGGLES_COMPRESSION != 0);
            let path = tree.path_of(Some(record.folder), &name);
            let entry = if !compressed {
                ArchiveEntry::stored(path, offset, size)
            } else if version == 105 {
                return Err(ArcError::UnsupportedVariant(format!(
                    "LZ4 compressed entry {} in a version 105 archive",
                    path
                )));
            } else {
                if size < 4 {
                    return Err(ArcError::corrupt(record.at + 8, "length", "compressed entry without size prefix"));
                }
                let original = reader.peek_u32_at(offset)? as u64;
                ArchiveEntry::stored(path, offset + 4, size - 4).with_transform(Transform::Zlib, original)
            };
            entries.push(entry);
        }
        tracing::debug!("bsa v{}: {} folders, {} files", version, folder_count, entries.len());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    type Folder<'a> = (&'a str, Vec<(&'a str, &'a [u8], bool)>);

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn bsa(version: u32, flags: u32, folders: &[Folder]) -> Vec<u8> {
        let record_len = if version == 105 { 24 } else { 16 };
        let file_count: usize = folders.iter().map(|(_, f)| f.len()).sum();
        let blocks: usize = folders.iter().map(|(n, f)| n.len() + 2 + 16 * f.len()).sum();
        let names: usize = folders.iter().flat_map(|(_, f)| f.iter()).map(|(n, _, _)| n.len() + 1).sum();
        let mut offset = 36 + folders.len() * record_len + blocks + names;

        let mut out = MAGIC.to_vec();
        for v in [version, 36, flags, folders.len() as u32, file_count as u32, 0, names as u32, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for (_, files) in folders {
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&(files.len() as u32).to_le_bytes());
            out.extend_from_slice(&vec![0u8; record_len - 12]);
        }
        let mut payload = Vec::new();
        for (name, files) in folders {
            out.push(name.len() as u8 + 1);
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            for (_, data, compressed) in files {
                let stored = if *compressed {
                    let mut packed = (data.len() as u32).to_le_bytes().to_vec();
                    packed.extend_from_slice(&zlib(data));
                    packed
                } else {
                    data.to_vec()
                };
                let mut size = stored.len() as u32;
                if *compressed {
                    size |= SIZE_TOGGLES_COMPRESSION;
                }
                out.extend_from_slice(&0u64.to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&(offset as u32).to_le_bytes());
                offset += stored.len();
                payload.extend_from_slice(&stored);
            }
        }
        for (_, files) in folders {
            for (name, _, _) in files {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
        }
        out.extend_from_slice(&payload);
        out
    }

    fn sample(version: u32) -> Vec<u8> {
        bsa(
            version,
            HAS_FOLDER_NAMES | HAS_FILE_NAMES,
            &[
                ("meshes\\armor", vec![("cuirass.nif", b"nif data".as_slice(), false)]),
                (
                    "textures",
                    vec![
                        ("sky.dds", b"DDS sky sky sky sky sky".as_slice(), true),
                        ("grass.dds", b"DDS grass".as_slice(), false),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn folders_and_names_are_joined() {
        let data = sample(104);
        let table = decode_bytes(&BsaArchiveBuilder::new(), "Oblivion - Meshes.bsa", &data).unwrap();
        let files = contents(&table, &data).unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["meshes/armor/cuirass.nif", "textures/sky.dds", "textures/grass.dds"]);
        assert_eq!(files[1].1, b"DDS sky sky sky sky sky");
        assert_eq!(table.get(1).unwrap().transform, Transform::Zlib);
        assert_eq!(files[2].1, b"DDS grass");
        assert_eq!(score_of(&BsaArchiveBuilder::new(), "a.bsa", &data), 100);
    }

    #[test]
    fn compressed_entries_of_version_105_are_unsupported() {
        let data = sample(105);
        let err = decode_bytes(&BsaArchiveBuilder::new(), "a.bsa", &data).unwrap_err();
        assert!(matches!(err, ArcError::UnsupportedVariant(_)));
        let plain = bsa(105, HAS_FOLDER_NAMES | HAS_FILE_NAMES, &[("sound", vec![("a.wav", b"RIFF".as_slice(), false)])]);
        let table = decode_bytes(&BsaArchiveBuilder::new(), "a.bsa", &plain).unwrap();
        assert_eq!(table.get(0).unwrap().name, "sound/a.wav");
    }

    #[test]
    fn embedded_names_are_skipped() {
        let mut blob = vec![9u8];
        blob.extend_from_slice(b"sound/b.w");
        blob.extend_from_slice(b"WAVE");
        let data = bsa(
            104,
            HAS_FOLDER_NAMES | HAS_FILE_NAMES | EMBEDDED_NAMES,
            &[("sound", vec![("b.wav", blob.as_slice(), false)])],
        );
        let table = decode_bytes(&BsaArchiveBuilder::new(), "a.bsa", &data).unwrap();
        assert_eq!(contents(&table, &data).unwrap()[0].1, b"WAVE");
    }

    #[test]
    fn folder_counts_must_match_the_header() {
        let mut data = sample(104);
        data[20..24].copy_from_slice(&7u32.to_le_bytes());
        let err = decode_bytes(&BsaArchiveBuilder::new(), "a.bsa", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 20, check: "num_files", .. }));
    }

    #[test]
    fn unknown_versions_are_unsupported() {
        let mut data = sample(104);
        data[4..8].copy_from_slice(&0x100u32.to_le_bytes());
        assert!(matches!(
            decode_bytes(&BsaArchiveBuilder::new(), "a.bsa", &data),
            Err(ArcError::UnsupportedVariant(_))
        ));
    }
}
