//! Error taxonomy shared by the reader, the directory decoders, the transforms and the writers.
use std::path::PathBuf;

/// Errors produced while detecting, decoding, materializing or writing an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArcError {
    /// The input does not look like the requested container format.
    #[error("input is not a recognized archive format")]
    FormatMismatch,
    /// A read would cross the end of the byte source.
    #[error("read of {wanted} bytes at offset {offset:#x} crosses the end of the source ({size:#x} bytes)")]
    OutOfBounds { offset: u64, wanted: u64, size: u64 },
    /// A string field holds bytes that do not fit its declared shape.
    #[error("invalid string encoding at offset {offset:#x}: {reason}")]
    InvalidEncoding { offset: u64, reason: String },
    /// A directory field failed a validator check while decoding.
    #[error("corrupt archive: {check} check failed at offset {offset:#x}: {detail}")]
    CorruptArchive {
        offset: u64,
        check: &'static str,
        detail: String,
    },
    /// The container family is recognized, but this sub-variant is not handled.
    #[error("unsupported variant: {0}")]
    UnsupportedVariant(String),
    /// A transform failed on its stored bytes.
    #[error("decompression failed: {0}")]
    DecompressionError(String),
    /// A split archive references a companion file that does not exist.
    #[error("missing companion file: {}", .0.display())]
    MissingCompanionFile(PathBuf),
    /// The caller supplied something a writer cannot represent.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArcError>;

impl ArcError {
    pub fn corrupt(offset: u64, check: &'static str, detail: impl Into<String>) -> Self {
        ArcError::CorruptArchive {
            offset,
            check,
            detail: detail.into(),
        }
    }

    pub fn decompression(detail: impl std::fmt::Display) -> Self {
        ArcError::DecompressionError(detail.to_string())
    }

    /// Re-labels reader failures as corrupt-archive failures.
    ///
    /// Decoders call this at their boundary so that every decode failure names
    /// the offending offset and the failed check.
    pub fn into_decode_error(self) -> Self {
        match self {
            ArcError::OutOfBounds {
                offset,
                wanted,
                size,
            } => ArcError::corrupt(
                offset,
                "bounded_read",
                format!("{wanted} bytes requested, source holds {size}"),
            ),
            ArcError::InvalidEncoding { offset, reason } => {
                ArcError::corrupt(offset, "encoding", reason)
            }
            ArcError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                ArcError::corrupt(0, "bounded_read", e.to_string())
            }
            other => other,
        }
    }

    /// Whether this error means "this is not the format" rather than a broken archive.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, ArcError::FormatMismatch)
    }
}

impl From<ArcError> for std::io::Error {
    fn from(e: ArcError) -> Self {
        match e {
            ArcError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[test]
fn test_out_of_bounds_becomes_corrupt_archive() {
    let err = ArcError::OutOfBounds {
        offset: 0x10,
        wanted: 4,
        size: 0x12,
    }
    .into_decode_error();
    match err {
        ArcError::CorruptArchive { offset, check, .. } => {
            assert_eq!(offset, 0x10);
            assert_eq!(check, "bounded_read");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_io_roundtrip_keeps_kind() {
    let err: std::io::Error = ArcError::decompression("bad block").into();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert!(err.to_string().contains("bad block"));
}
