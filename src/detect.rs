//! Format detection by match rating.
//!
//! Every registered format rates a short prefix of the candidate file. The
//! format with the highest score wins; on equal scores the format registered
//! first wins. Detection never fails: whatever a format's check cannot read
//! simply does not count.
use crate::error::{ArcError, Result};
use crate::formats::{ArchiveBuilder, BUILDER};
use crate::reader::BinaryReader;
use crate::types::ArchiveType;
use crate::validate::check_extension;
use std::io::{Read, Seek};

/// Bytes of the file handed to detection.
pub const PROBE_LEN: usize = 0x800;
/// Score awarded for a matching file extension.
pub const EXTENSION_SCORE: u8 = 25;
/// Highest score a format's content checks may contribute.
pub const MAX_CONTENT_SCORE: u8 = 75;

/// The prefix of a candidate file plus what is known about the whole file.
#[derive(Debug, Clone)]
pub struct Probe {
    pub filename: String,
    pub head: Vec<u8>,
    pub file_len: u64,
}

macro_rules! probe_num {
    ($($name:ident, $name_be:ident => $ty:ty;)*) => {
        $(
            pub fn $name(&self, offset: u64) -> Option<$ty> {
                Some(<$ty>::from_le_bytes(self.bytes(offset, std::mem::size_of::<$ty>())?.try_into().ok()?))
            }
            pub fn $name_be(&self, offset: u64) -> Option<$ty> {
                Some(<$ty>::from_be_bytes(self.bytes(offset, std::mem::size_of::<$ty>())?.try_into().ok()?))
            }
        )*
    };
}

impl Probe {
    pub fn new(filename: impl Into<String>, head: &[u8], file_len: u64) -> Self {
        let len = head.len().min(PROBE_LEN);
        Probe {
            filename: filename.into(),
            head: head[..len].to_vec(),
            file_len,
        }
    }

    pub fn from_bytes(filename: impl Into<String>, data: &[u8]) -> Self {
        Self::new(filename, data, data.len() as u64)
    }

    /// Reads the probe prefix from `reader`, leaving its cursor untouched.
    pub fn from_reader<R: Read + Seek>(filename: impl Into<String>, reader: &mut BinaryReader<R>) -> Result<Self> {
        let len = reader.len().min(PROBE_LEN as u64);
        let head = reader.read_at(0, len)?;
        Ok(Probe {
            filename: filename.into(),
            head,
            file_len: reader.len(),
        })
    }

    /// `len` bytes at `offset`, if they are inside the probed prefix.
    pub fn bytes(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.head.get(start..start.checked_add(len)?)
    }

    pub fn starts_with(&self, magic: &[u8]) -> bool {
        self.head.starts_with(magic)
    }

    pub fn u8_at(&self, offset: u64) -> Option<u8> {
        self.bytes(offset, 1).map(|b| b[0])
    }

    probe_num! {
        u16_at, u16_be_at => u16;
        u32_at, u32_be_at => u32;
        u64_at, u64_be_at => u64;
    }

    pub fn has_extension(&self, extensions: &[&str]) -> bool {
        check_extension(&self.filename, extensions)
    }
}

/// Rates `probe` against one format. 0 means "not this format".
///
/// The extension adds [EXTENSION_SCORE] only when the format's content checks
/// accept the file at all.
pub fn score(builder: &dyn ArchiveBuilder, probe: &Probe) -> u8 {
    let Some(content) = builder.is_this_format(probe) else {
        return 0;
    };
    let ext = if probe.has_extension(builder.extensions()) {
        EXTENSION_SCORE
    } else {
        0
    };
    (content.min(MAX_CONTENT_SCORE) + ext).min(100)
}

/// Picks the best scoring builder out of `builders`.
///
/// Registration order breaks ties: a later format must score strictly higher to
/// replace an earlier one. Scores not above [EXTENSION_SCORE] never win.
pub fn select_from<'a>(builders: &'a [Box<dyn ArchiveBuilder>], probe: &Probe) -> Option<(&'a dyn ArchiveBuilder, u8)> {
    let mut best: Option<(&dyn ArchiveBuilder, u8)> = None;
    for builder in builders {
        let s = score(builder.as_ref(), probe);
        if s <= EXTENSION_SCORE {
            continue;
        }
        if best.is_none_or(|(_, top)| s > top) {
            best = Some((builder.as_ref(), s));
        }
    }
    best
}

/// Every registered format with its score, in registration order.
pub fn scores(probe: &Probe) -> Vec<(ArchiveType, u8)> {
    BUILDER
        .iter()
        .map(|b| (*b.archive_type(), score(b.as_ref(), probe)))
        .collect()
}

/// Selects the registered format for `probe`.
pub fn detect(probe: &Probe) -> Result<&'static dyn ArchiveBuilder> {
    match select_from(BUILDER.as_slice(), probe) {
        Some((builder, s)) => {
            tracing::debug!("{} detected as {} (score {})", probe.filename, builder.archive_type(), s);
            Ok(builder)
        }
        None => Err(ArcError::FormatMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeContext;
    use crate::reader::SourceReader;
    use crate::types::*;

    #[derive(Debug)]
    struct Fixed(ArchiveType, Option<u8>);

    impl ArchiveBuilder for Fixed {
        fn archive_type(&self) -> &'static ArchiveType {
            match self.0 {
                #[cfg(feature = "pak")]
                ArchiveType::Pak => &ArchiveType::Pak,
                #[cfg(feature = "grp")]
                ArchiveType::Grp => &ArchiveType::Grp,
                _ => unreachable!(),
            }
        }

        fn extensions(&self) -> &'static [&'static str] {
            &["dat"]
        }

        fn is_this_format(&self, _probe: &Probe) -> Option<u8> {
            self.1
        }

        fn decode(&self, _reader: &mut SourceReader, _ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
            Ok(Vec::new())
        }
    }

    fn boxed(b: Fixed) -> Box<dyn ArchiveBuilder> {
        Box::new(b)
    }

    #[test]
    fn probe_reads_never_fail() {
        let probe = Probe::from_bytes("x.bin", &[1, 2, 3]);
        assert_eq!(probe.u16_at(1), Some(0x0302));
        assert_eq!(probe.u32_at(0), None);
        assert_eq!(probe.u64_be_at(u64::MAX), None);
        assert_eq!(probe.bytes(2, usize::MAX), None);
    }

    #[test]
    fn extension_alone_is_not_enough() {
        let probe = Probe::from_bytes("a.dat", b"????");
        #[cfg(feature = "pak")]
        {
            let none = Fixed(ArchiveType::Pak, None);
            assert_eq!(score(&none, &probe), 0);
            let weak = Fixed(ArchiveType::Pak, Some(0));
            assert_eq!(score(&weak, &probe), EXTENSION_SCORE);
            assert!(select_from(&[boxed(weak)], &probe).is_none());
            let capped = Fixed(ArchiveType::Pak, Some(255));
            assert_eq!(score(&capped, &probe), 100);
        }
    }

    /// Two formats can reach the same score on crafted input. The earlier
    /// registration is kept in that case; this pins the behaviour.
    #[cfg(all(feature = "pak", feature = "grp"))]
    #[test]
    fn equal_scores_prefer_first_registered() {
        let probe = Probe::from_bytes("a.dat", b"????");
        let builders = [
            boxed(Fixed(ArchiveType::Pak, Some(40))),
            boxed(Fixed(ArchiveType::Grp, Some(40))),
        ];
        let (winner, s) = select_from(&builders, &probe).unwrap();
        assert_eq!(*winner.archive_type(), ArchiveType::Pak);
        assert_eq!(s, 65);

        let builders = [
            boxed(Fixed(ArchiveType::Pak, Some(40))),
            boxed(Fixed(ArchiveType::Grp, Some(41))),
        ];
        let (winner, _) = select_from(&builders, &probe).unwrap();
        assert_eq!(*winner.archive_type(), ArchiveType::Grp);
    }

    #[test]
    fn garbage_matches_nothing() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let probe = Probe::from_bytes("noise.bin", &data);
        assert!(matches!(detect(&probe), Err(ArcError::FormatMismatch)));
    }
}
