//! GameCube disc images (GCM / ISO), read through the file system table.
use super::base::*;
use crate::decode::{DecodeContext, TreeWalk};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::reader::SourceReader;
use crate::types::*;
use crate::validate::*;

const DISC_MAGIC: u32 = 0xC233_9F3D;
const DISC_MAGIC_AT: u64 = 0x1C;
const FST_POINTER_AT: u64 = 0x424;
const RECORD_LEN: u64 = 12;

#[derive(Debug, Clone, Copy)]
struct FstRecord {
    is_dir: bool,
    name_offset: u32,
    /// File: data offset. Directory: parent index.
    a: u32,
    /// File: size. Directory: index one past its last descendant.
    b: u32,
}

/// The file system table of one disc.
struct Fst {
    at: u64,
    records: Vec<FstRecord>,
    strings_at: u64,
    strings_len: u64,
}

impl Fst {
    fn read(reader: &mut SourceReader) -> Result<Self> {
        let at = reader.with_position(FST_POINTER_AT, |r| r.read_u32_be())? as u64;
        let size = reader.with_position(FST_POINTER_AT + 4, |r| r.read_u32_be())? as u64;
        ensure_extent(at, size, reader.len(), FST_POINTER_AT)?;
        reader.seek(at)?;
        let root = reader.read_u32_be()?;
        if root >> 24 != 1 {
            return Err(ArcError::corrupt(at, "tree", "root entry is not a directory"));
        }
        reader.skip(4)?;
        let count = ensure_num_files(reader.read_u32_be()? as i64, at + 8)?;
        if count == 0 || count as u64 * RECORD_LEN > size {
            return Err(ArcError::corrupt(
                at + 8,
                "num_files",
                format!("{} entries do not fit a table of {:#x} bytes", count, size),
            ));
        }
        reader.seek(at)?;
        let mut records = Vec::with_capacity(capacity_hint(count));
        for _ in 0..count {
            let word = reader.read_u32_be()?;
            records.push(FstRecord {
                is_dir: word >> 24 != 0,
                name_offset: word & 0x00FF_FFFF,
                a: reader.read_u32_be()?,
                b: reader.read_u32_be()?,
            });
        }
        let strings_at = at + count as u64 * RECORD_LEN;
        Ok(Fst {
            at,
            records,
            strings_at,
            strings_len: size - count as u64 * RECORD_LEN,
        })
    }

    fn record_at(&self, index: usize) -> u64 {
        self.at + index as u64 * RECORD_LEN
    }

    fn name(&self, reader: &mut SourceReader, index: usize, encoding: Encoding) -> Result<String> {
        let offset = self.records[index].name_offset as u64;
        if offset >= self.strings_len {
            return Err(ArcError::corrupt(
                self.record_at(index),
                "offset",
                format!("name offset {:#x} outside string table of {:#x} bytes", offset, self.strings_len),
            ));
        }
        let max = (self.strings_len - offset - 1).min(MAX_NAME_LENGTH) as usize;
        reader.with_position(self.strings_at + offset, |r| r.read_cstring(max, encoding))
    }
}

/// Per-call state of one table walk.
struct Walker<'f> {
    fst: &'f Fst,
    tree: TreeWalk,
    encoding: Encoding,
    entries: Vec<ArchiveEntry>,
}

impl Walker<'_> {
    /// Walks records `1..count` in table order, keeping the open folders on a stack.
    fn walk(&mut self, reader: &mut SourceReader, count: usize) -> Result<()> {
        // (folder, index one past its last descendant)
        let mut open: Vec<(Option<usize>, usize)> = vec![(None, count)];
        let mut i = 1;
        loop {
            while open.last().is_some_and(|&(_, end)| i >= end) {
                open.pop();
            }
            let Some(&(parent, end)) = open.last() else {
                break;
            };
            let at = self.fst.record_at(i);
            self.tree.visit(at)?;
            let record = self.fst.records[i];
            let name = self.fst.name(reader, i, self.encoding)?;
            if record.is_dir {
                let next = record.b as usize;
                if next <= i || next > end {
                    return Err(ArcError::corrupt(
                        at + 8,
                        "tree",
                        format!("directory {} ends at entry {}, outside {}..{}", i, next, i + 1, end),
                    ));
                }
                let node = self.tree.push_dir(name, parent, (next - i - 1) as u64, at)?;
                open.push((Some(node), next));
            } else {
                let (offset, size) = (record.a as u64, record.b as u64);
                ensure_extent(offset, size, reader.len(), at + 4)?;
                self.entries.push(ArchiveEntry::stored(self.tree.path_of(parent, &name), offset, size));
            }
            i += 1;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct GcmArchiveBuilder {}

impl GcmArchiveBuilder {
    pub const fn new() -> Self {
        GcmArchiveBuilder {}
    }
}

impl ArchiveBuilder for GcmArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Gcm
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["gcm", "iso"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["GameCube titles"]
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::Cp932
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if probe.u32_be_at(DISC_MAGIC_AT)? != DISC_MAGIC {
            return None;
        }
        let mut score = 55;
        let fst = probe.u32_be_at(FST_POINTER_AT)? as u64;
        let size = probe.u32_be_at(FST_POINTER_AT + 4)? as u64;
        if size >= RECORD_LEN && check_extent(fst, size, probe.file_len) {
            score += 20;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.with_position(DISC_MAGIC_AT, |r| r.read_u32_be())?;
        ensure_magic(&magic.to_be_bytes(), &DISC_MAGIC.to_be_bytes(), DISC_MAGIC_AT)?;
        let fst = Fst::read(reader)?;
        let count = fst.records.len();
        let mut walker = Walker {
            fst: &fst,
            tree: TreeWalk::new(count as u64),
            encoding: ctx.encoding,
            entries: Vec::with_capacity(capacity_hint(count)),
        };
        walker.walk(reader, count)?;
        tracing::debug!(
            "gcm: {} files in {} folders",
            walker.entries.len(),
            walker.tree.nodes.len()
        );
        Ok(walker.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::MAX_TREE_DEPTH;
    use crate::formats::test_util::*;

    /// Table records after the root, in table order.
    enum Node {
        File(&'static str, &'static [u8]),
        Dir(&'static str, u32),
    }

    fn image(nodes: &[Node]) -> Vec<u8> {
        let fst_at = 0x440usize;
        let count = nodes.len() + 1;
        let mut strings = Vec::new();
        let mut records = Vec::new();
        let mut payload = Vec::new();
        let names_len: usize = nodes
            .iter()
            .map(|n| match n {
                Node::File(name, _) | Node::Dir(name, _) => name.len() + 1,
            })
            .sum();
        let data_at = (fst_at + count * 12 + names_len).max(0x800);
        records.extend_from_slice(&0x0100_0000u32.to_be_bytes());
        records.extend_from_slice(&0u32.to_be_bytes());
        records.extend_from_slice(&(count as u32).to_be_bytes());
        for node in nodes {
            let (name, word_type, a, b) = match node {
                Node::File(name, data) => {
                    let offset = data_at + payload.len();
                    payload.extend_from_slice(data);
                    (name, 0u32, offset as u32, data.len() as u32)
                }
                Node::Dir(name, end) => (name, 1u32, 0, *end),
            };
            records.extend_from_slice(&(word_type << 24 | strings.len() as u32).to_be_bytes());
            records.extend_from_slice(&a.to_be_bytes());
            records.extend_from_slice(&b.to_be_bytes());
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }
        let fst_len = records.len() + strings.len();
        let mut data = vec![0u8; data_at];
        data[0x1C..0x20].copy_from_slice(&DISC_MAGIC.to_be_bytes());
        data[0x424..0x428].copy_from_slice(&(fst_at as u32).to_be_bytes());
        data[0x428..0x42C].copy_from_slice(&(fst_len as u32).to_be_bytes());
        data[fst_at..fst_at + records.len()].copy_from_slice(&records);
        data[fst_at + records.len()..fst_at + fst_len].copy_from_slice(&strings);
        data.extend_from_slice(&payload);
        data
    }

    #[test]
    fn nested_folders_become_paths() {
        let data = image(&[
            Node::File("opening.bnr", b"BNR1"),
            Node::Dir("audio", 5),
            Node::Dir("bgm", 5),
            Node::File("title.adp", b"adpcm"),
            Node::File("boot.dol", b"dol"),
        ]);
        let table = decode_bytes(&GcmArchiveBuilder::new(), "game.iso", &data).unwrap();
        let files = contents(&table, &data).unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["opening.bnr", "audio/bgm/title.adp", "boot.dol"]);
        assert_eq!(files[1].1, b"adpcm");
        assert_eq!(score_of(&GcmArchiveBuilder::new(), "game.iso", &data), 100);
    }

    #[test]
    fn directory_pointing_backwards_is_corrupt() {
        let data = image(&[Node::Dir("loop", 1), Node::File("a.bin", b"a")]);
        let err = decode_bytes(&GcmArchiveBuilder::new(), "game.iso", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { check: "tree", .. }));
    }

    #[test]
    fn directory_past_its_parent_is_corrupt() {
        let data = image(&[Node::Dir("outer", 3), Node::Dir("inner", 9), Node::File("a.bin", b"a")]);
        let err = decode_bytes(&GcmArchiveBuilder::new(), "game.iso", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 0x460, check: "tree", .. }));
    }

    #[test]
    fn deeply_chained_folders_are_corrupt() {
        let depth = 20_000u32;
        let count = depth + 2;
        let mut nodes: Vec<Node> = (0..depth).map(|_| Node::Dir("d", count)).collect();
        nodes.push(Node::File("a.bin", b"a"));
        let data = image(&nodes);
        let err = decode_bytes(&GcmArchiveBuilder::new(), "game.iso", &data).unwrap_err();
        let deepest = 0x440 + (MAX_TREE_DEPTH as u64 + 1) * RECORD_LEN;
        assert!(matches!(err, ArcError::CorruptArchive { offset, check: "tree", .. } if offset == deepest));
    }

    #[test]
    fn name_offset_outside_the_string_table_is_corrupt() {
        let mut data = image(&[Node::File("a.bin", b"a")]);
        data[0x440 + 12 + 1..0x440 + 12 + 4].copy_from_slice(&[0, 0x40, 0]);
        let err = decode_bytes(&GcmArchiveBuilder::new(), "game.iso", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 0x44C, check: "offset", .. }));
    }
}
