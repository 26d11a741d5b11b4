//! Circus engine DAT archives.
//!
//! There is no magic. The file opens with a record count, followed by fixed
//! size records of a NUL padded name and a data offset. The last record is a
//! terminator. The name field width changed between engine versions, so each
//! known width is tried in turn.
use super::base::*;
use crate::decode::{DecodeContext, infer_lengths};
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::reader::SourceReader;
use crate::types::*;
use crate::validate::*;

/// Known name field widths, most common first.
const NAME_LENGTHS: [u64; 3] = [0x24, 0x30, 0x3C];
const COUNT_LEN: u64 = 4;
/// Counts above this are not taken as a hint during detection.
const MAX_PLAUSIBLE_COUNT: u64 = 1000;

fn index_end(name_len: u64, count: u64) -> u64 {
    COUNT_LEN + (name_len + 4) * count
}

/// Rates the records visible in the probe under one name width.
fn rate_layout(probe: &Probe, name_len: u64) -> Option<u8> {
    let count = probe.u32_at(0)? as u64;
    if !(2..MAX_PLAUSIBLE_COUNT).contains(&count) {
        return None;
    }
    let end = index_end(name_len, count);
    if end > probe.file_len {
        return None;
    }
    let record_len = name_len + 4;
    let visible = count.min((probe.head.len() as u64).saturating_sub(COUNT_LEN) / record_len);
    if visible == 0 {
        return None;
    }
    let mut prev = end;
    let mut terminated = false;
    for i in 0..visible {
        let at = COUNT_LEN + i * record_len;
        let offset = probe.u32_at(at + name_len)? as u64;
        if i + 1 == count {
            terminated = offset == probe.file_len;
            break;
        }
        if probe.u8_at(at)? == 0 || offset < prev || offset > probe.file_len {
            return None;
        }
        prev = offset;
    }
    Some(if terminated { 60 } else { 40 })
}

#[derive(Debug)]
pub struct CircusDatArchiveBuilder {}

impl CircusDatArchiveBuilder {
    pub const fn new() -> Self {
        CircusDatArchiveBuilder {}
    }

    fn read_index(&self, reader: &mut SourceReader, name_len: u64, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        reader.seek(0)?;
        let count = ensure_num_files(reader.read_u32()? as i64, 0)?;
        if count == 0 {
            return Err(ArcError::corrupt(0, "num_files", "missing terminator record"));
        }
        let end = index_end(name_len, count as u64);
        ensure_offset(end, reader.len(), 0)?;

        let mut names = Vec::with_capacity(capacity_hint(count));
        let mut offsets = Vec::with_capacity(capacity_hint(count));
        let mut prev = end;
        for _ in 1..count {
            let at = reader.position();
            let name = reader.read_fixed_string(name_len as usize, ctx.encoding)?;
            if name.is_empty() {
                return Err(ArcError::corrupt(at, "name", "empty entry name"));
            }
            let offset = reader.read_u32()? as u64;
            if offset < prev {
                return Err(ArcError::corrupt(
                    at + name_len,
                    "offset",
                    format!("entry data at {:#x} overlaps the index or the previous entry", offset),
                ));
            }
            ensure_offset(offset, reader.len(), at + name_len)?;
            prev = offset;
            names.push(name);
            offsets.push(offset);
        }
        reader.skip(name_len)?;
        let terminator = reader.read_u32()? as u64;
        if terminator != reader.len() {
            tracing::debug!("circus dat: terminator points at {:#x}, file ends at {:#x}", terminator, reader.len());
        }

        let lengths = infer_lengths(&offsets, reader.len())?;
        Ok(names
            .into_iter()
            .zip(offsets)
            .zip(lengths)
            .map(|((name, offset), length)| ArchiveEntry::stored(name, offset, length))
            .collect())
    }
}

impl ArchiveBuilder for CircusDatArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::CircusDat
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["dat"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["D.C.II ~Da Capo II~", "D.C. ~Da Capo~"]
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::Cp932
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        NAME_LENGTHS
            .iter()
            .filter_map(|&len| rate_layout(probe, len))
            .max()
            .map(|layout| layout + 10)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let mut failures = Vec::new();
        for name_len in NAME_LENGTHS {
            match self.read_index(reader, name_len, ctx) {
                Ok(entries) => {
                    tracing::debug!("circus dat: {} entries with {:#x} byte names", entries.len(), name_len);
                    return Ok(entries);
                }
                Err(e) => {
                    tracing::debug!("circus dat: {:#x} byte names rejected: {}", name_len, e);
                    failures.push(format!("{:#x}: {}", name_len, e));
                }
            }
        }
        Err(ArcError::corrupt(
            0,
            "layout",
            format!("no record layout fits ({})", failures.join("; ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::test_util::*;
    use proptest::prelude::*;

    fn build(name_len: usize, files: &[(&[u8], &[u8])]) -> Vec<u8> {
        let count = files.len() + 1;
        let mut out = (count as u32).to_le_bytes().to_vec();
        let mut offset = 4 + (name_len + 4) * count;
        for (name, data) in files {
            let mut field = name.to_vec();
            field.resize(name_len, 0);
            out.extend_from_slice(&field);
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += data.len();
        }
        out.extend_from_slice(&vec![0u8; name_len]);
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        for (_, data) in files {
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn short_names_decode_with_cp932() {
        let (bg, _, _) = encoding_rs::SHIFT_JIS.encode("背景01.png");
        let data = build(0x24, &[(bg.as_ref(), b"png data".as_slice()), (b"se_01.ogg".as_slice(), b"OggS....".as_slice())]);
        let table = decode_bytes(&CircusDatArchiveBuilder::new(), "Graphic.dat", &data).unwrap();
        let files = contents(&table, &data).unwrap();
        assert_eq!(files[0], ("背景01.png".to_string(), b"png data".to_vec()));
        assert_eq!(files[1], ("se_01.ogg".to_string(), b"OggS....".to_vec()));
        assert_eq!(score_of(&CircusDatArchiveBuilder::new(), "Graphic.dat", &data), 95);
    }

    #[test]
    fn wider_name_fields_are_found() {
        let long = b"event/chapter_three/scene_0042_b_alt.ogv";
        assert!(long.len() > 0x24 && long.len() < 0x30);
        let data = build(0x30, &[(long.as_slice(), b"movie".as_slice()), (b"a.txt".as_slice(), b"text".as_slice())]);
        let table = decode_bytes(&CircusDatArchiveBuilder::new(), "Movie.dat", &data).unwrap();
        assert_eq!(table.len(), 2);
        let entry = table.get(0).unwrap();
        assert_eq!(entry.name, "event/chapter_three/scene_0042_b_alt.ogv");
        assert_eq!(entry.stored_length, 5);
        assert_eq!(contents(&table, &data).unwrap()[1].1, b"text");
    }

    #[test]
    fn last_entry_runs_to_the_end_of_the_file() {
        let mut data = build(0x24, &[(b"a.txt".as_slice(), b"aaaa".as_slice()), (b"b.txt".as_slice(), b"bb".as_slice())]);
        // terminator offset left at zero, as some repacks write it
        let at = 4 + 0x28 * 2 + 0x24;
        data[at..at + 4].copy_from_slice(&0u32.to_le_bytes());
        let table = decode_bytes(&CircusDatArchiveBuilder::new(), "Script.dat", &data).unwrap();
        assert_eq!(table.get(1).unwrap().stored_length, 2);
        assert_eq!(score_of(&CircusDatArchiveBuilder::new(), "Script.dat", &data), 75);
    }

    #[test]
    fn offsets_running_backwards_fit_no_layout() {
        let mut data = build(0x24, &[(b"a.txt".as_slice(), b"aaaa".as_slice()), (b"b.txt".as_slice(), b"bb".as_slice())]);
        let second = 4 + 0x28 + 0x24;
        data[second..second + 4].copy_from_slice(&0x10u32.to_le_bytes());
        let err = decode_bytes(&CircusDatArchiveBuilder::new(), "Script.dat", &data).unwrap_err();
        assert!(matches!(err, ArcError::CorruptArchive { offset: 0, check: "layout", .. }));
        assert_eq!(score_of(&CircusDatArchiveBuilder::new(), "Script.dat", &data), 0);
    }

    #[test]
    fn empty_name_is_rejected() {
        let data = build(0x24, &[(b"".as_slice(), b"data".as_slice())]);
        assert!(decode_bytes(&CircusDatArchiveBuilder::new(), "x.dat", &data).is_err());
        assert_eq!(score_of(&CircusDatArchiveBuilder::new(), "x.dat", &data), 0);
    }

    proptest! {
        #[test]
        fn decoding_is_repeatable_and_lengths_match(
            files in proptest::collection::vec(("[a-z]{1,20}\\.bin", proptest::collection::vec(any::<u8>(), 0..64)), 1..8),
            tail in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let refs: Vec<(&[u8], &[u8])> = files.iter().map(|(n, d)| (n.as_bytes(), d.as_slice())).collect();
            let data = build(0x24, &refs);
            let builder = CircusDatArchiveBuilder::new();
            let first = decode_bytes(&builder, "a.dat", &data).unwrap();
            prop_assert_eq!(&first, &decode_bytes(&builder, "a.dat", &data).unwrap());
            let lengths: Vec<u64> = first.iter().map(|e| e.stored_length).collect();
            let expected: Vec<u64> = files.iter().map(|(_, d)| d.len() as u64).collect();
            prop_assert_eq!(lengths, expected);

            let mut padded = data.clone();
            padded.extend_from_slice(&tail);
            prop_assert!(score_of(&builder, "a.dat", &padded) <= score_of(&builder, "a.dat", &data));
        }
    }
}
