//! Valve VPK packages, versions 1 and 2.
//!
//! A `*_dir.vpk` holds the directory tree and optionally data of its own. Most
//! data lives in numbered companions (`pak01_000.vpk`, `pak01_001.vpk`, ...)
//! next to it.
use super::base::*;
use crate::decode::{DecodeContext, join_path};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::reader::SourceReader;
use crate::types::*;
use crate::validate::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SIGNATURE: u32 = 0x55AA_1234;
const IN_DIRECTORY_FILE: u16 = 0x7FFF;
const TERMINATOR: u16 = 0xFFFF;

#[derive(Debug)]
pub struct VpkArchiveBuilder {}

impl VpkArchiveBuilder {
    pub const fn new() -> Self {
        VpkArchiveBuilder {}
    }
}

fn header_len(version: u32) -> Option<u64> {
    match version {
        1 => Some(12),
        2 => Some(28),
        _ => None,
    }
}

/// Path of companion archive `index` of the directory file `dir_file`.
pub fn companion_path(dir_file: &Path, index: u16) -> PathBuf {
    let stem = dir_file.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let base = stem.strip_suffix("_dir").unwrap_or(&stem);
    dir_file.with_file_name(format!("{}_{:03}.vpk", base, index))
}

/// Sizes of the companions seen during one decode.
struct Companions<'a> {
    dir_file: &'a Path,
    sizes: HashMap<u16, (PathBuf, u64)>,
}

impl Companions<'_> {
    fn get(&mut self, index: u16) -> Result<(PathBuf, u64)> {
        if let Some(found) = self.sizes.get(&index) {
            return Ok(found.clone());
        }
        let path = companion_path(self.dir_file, index);
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArcError::MissingCompanionFile(path));
            }
            Err(e) => return Err(e.into()),
        };
        self.sizes.insert(index, (path.clone(), size));
        Ok((path, size))
    }
}

impl ArchiveBuilder for VpkArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Vpk
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["vpk"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Left 4 Dead 2", "Portal 2", "Team Fortress 2", "Counter-Strike: Global Offensive"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if probe.u32_at(0)? != SIGNATURE {
            return None;
        }
        let mut score = 50;
        if let Some(header) = header_len(probe.u32_at(4)?) {
            score += 15;
            if check_offset(header + probe.u32_at(8)? as u64, probe.file_len) {
                score += 10;
            }
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let signature = reader.read_u32()?;
        ensure_magic(&signature.to_le_bytes(), &SIGNATURE.to_le_bytes(), 0)?;
        let version = reader.read_u32()?;
        let header = header_len(version)
            .ok_or_else(|| ArcError::UnsupportedVariant(format!("VPK version {}", version)))?;
        let tree_len = reader.read_u32()? as u64;
        let tree_end = header + tree_len;
        ensure_offset(tree_end, reader.len(), 8)?;
        reader.seek(header)?;

        let mut companions = Companions {
            dir_file: ctx.path.unwrap_or_else(|| Path::new(ctx.filename)),
            sizes: HashMap::new(),
        };
        let max = MAX_NAME_LENGTH as usize;
        let mut entries = Vec::new();
        loop {
            let ext = reader.read_cstring(max, ctx.encoding)?;
            if ext.is_empty() {
                break;
            }
            loop {
                let dir = reader.read_cstring(max, ctx.encoding)?;
                if dir.is_empty() {
                    break;
                }
                loop {
                    let name = reader.read_cstring(max, ctx.encoding)?;
                    if name.is_empty() {
                        break;
                    }
                    let at = reader.position();
                    let _crc = reader.read_u32()?;
                    let preload_len = reader.read_u16()? as u64;
                    let archive = reader.read_u16()?;
                    let offset = reader.read_u32()? as u64;
                    let length = reader.read_u32()? as u64;
                    let terminator = reader.read_u16()?;
                    if terminator != TERMINATOR {
                        return Err(ArcError::corrupt(
                            at + 16,
                            "magic",
                            format!("entry terminator {:#06x}", terminator),
                        ));
                    }
                    let preload = reader.read_bytes(preload_len)?;
                    if reader.position() > tree_end {
                        return Err(ArcError::corrupt(at, "extent", "directory entry crosses the end of the tree"));
                    }

                    let file_name = if ext.trim().is_empty() { name } else { format!("{}.{}", name, ext) };
                    let dir_part = if dir.trim().is_empty() { "" } else { dir.as_str() };
                    let mut entry = if archive == IN_DIRECTORY_FILE || length == 0 {
                        let offset = if length == 0 { 0 } else { tree_end + offset };
                        ensure_extent(offset, length, reader.len(), at + 8)?;
                        ArchiveEntry::stored(join_path([dir_part, file_name.as_str()]), offset, length)
                    } else {
                        let (path, size) = companions.get(archive)?;
                        ensure_extent(offset, length, size, at + 8)?;
                        let mut entry = ArchiveEntry::stored(join_path([dir_part, file_name.as_str()]), offset, length);
                        entry.source = EntrySource::Companion { path, size };
                        entry
                    };
                    if !preload.is_empty() {
                        entry = entry.with_transform(Transform::Preload { data: preload }, preload_len + length);
                    }
                    entries.push(entry);
                }
            }
        }
        tracing::debug!(
            "vpk v{}: {} entries across {} companions",
            version,
            entries.len(),
            companions.sizes.len()
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;

    struct File<'a> {
        ext: &'a str,
        dir: &'a str,
        name: &'a str,
        preload: &'a [u8],
        archive: u16,
        offset: u32,
        length: u32,
    }

    fn directory(version: u32, files: &[File], inline_data: &[u8]) -> Vec<u8> {
        let mut tree = Vec::new();
        for f in files {
            for s in [f.ext, f.dir, f.name] {
                tree.extend_from_slice(s.as_bytes());
                tree.push(0);
            }
            tree.extend_from_slice(&0u32.to_le_bytes());
            tree.extend_from_slice(&(f.preload.len() as u16).to_le_bytes());
            tree.extend_from_slice(&f.archive.to_le_bytes());
            tree.extend_from_slice(&f.offset.to_le_bytes());
            tree.extend_from_slice(&f.length.to_le_bytes());
            tree.extend_from_slice(&TERMINATOR.to_le_bytes());
            tree.extend_from_slice(f.preload);
            // close name, directory and extension levels
            tree.extend_from_slice(&[0, 0]);
        }
        tree.push(0);
        let mut out = SIGNATURE.to_le_bytes().to_vec();
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(&(tree.len() as u32).to_le_bytes());
        if version == 2 {
            out.extend_from_slice(&[0; 16]);
        }
        out.extend_from_slice(&tree);
        out.extend_from_slice(inline_data);
        out
    }

    #[test]
    fn companion_names_drop_the_dir_suffix() {
        assert_eq!(
            companion_path(Path::new("/game/pak01_dir.vpk"), 3),
            PathBuf::from("/game/pak01_003.vpk")
        );
    }

    #[test]
    fn preload_and_inline_data() {
        let data = directory(
            2,
            &[
                File {
                    ext: "txt",
                    dir: "scripts",
                    name: "readme",
                    preload: b"hello ",
                    archive: IN_DIRECTORY_FILE,
                    offset: 0,
                    length: 5,
                },
                File {
                    ext: "cfg",
                    dir: " ",
                    name: "autoexec",
                    preload: b"exec",
                    archive: 0,
                    offset: 0,
                    length: 0,
                },
            ],
            b"world",
        );
        let table = decode_bytes(&VpkArchiveBuilder::new(), "pak01_dir.vpk", &data).unwrap();
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0], ("scripts/readme.txt".to_string(), b"hello world".to_vec()));
        assert_eq!(files[1], ("autoexec.cfg".to_string(), b"exec".to_vec()));
        assert_eq!(score_of(&VpkArchiveBuilder::new(), "pak01_dir.vpk", &data), 100);
    }

    #[test]
    fn companion_files_are_resolved_next_to_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data = directory(
            1,
            &[File {
                ext: "vmt",
                dir: "materials/brick",
                name: "wall",
                preload: b"",
                archive: 1,
                offset: 4,
                length: 8,
            }],
            b"",
        );
        let dir_file = dir.path().join("pak01_dir.vpk");
        std::fs::write(&dir_file, &data).unwrap();
        let config = ExtraConfig::default();
        let err = Archive::open(&dir_file, None, &config).unwrap_err();
        assert!(matches!(err, ArcError::MissingCompanionFile(p) if p.ends_with("pak01_001.vpk")));

        std::fs::write(dir.path().join("pak01_001.vpk"), b"....LightmappedGeneric").unwrap();
        let archive = Archive::open(&dir_file, Some(ArchiveType::Vpk), &config).unwrap();
        assert_eq!(archive.entries()[0].name, "materials/brick/wall.vmt");
        assert_eq!(archive.read_entry(0).unwrap(), b"Lightmap");
    }

    #[test]
    fn bad_terminator_is_corrupt() {
        let mut data = directory(
            1,
            &[File {
                ext: "a",
                dir: "b",
                name: "c",
                preload: b"",
                archive: IN_DIRECTORY_FILE,
                offset: 0,
                length: 0,
            }],
            b"",
        );
        let term = 12 + 6 + 16;
        data[term] = 0;
        let err = decode_bytes(&VpkArchiveBuilder::new(), "a_dir.vpk", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { check: "magic", .. }));
    }
}
