//! Range and sanity checks for directory fields.
//!
//! Each check exists twice. The `check_*` form answers yes/no and is what
//! detection uses: a failed check only means "not this format". The `ensure_*`
//! form is what decoders use: a failed check aborts the decode with
//! [ArcError::CorruptArchive] naming the field offset and the check.
use crate::error::{ArcError, Result};

/// Hard upper bound on the number of entries a directory may declare.
pub const MAX_FILES: i64 = 10_000_000;
/// Longest name, in bytes, any directory may store.
pub const MAX_NAME_LENGTH: u64 = 4096;

/// `offset` is a valid position inside a source of `max` bytes.
pub fn check_offset(offset: u64, max: u64) -> bool {
    offset <= max
}

/// `length` fits in `max` bytes. Without a bound only the type range applies.
pub fn check_length(length: u64, max: Option<u64>) -> bool {
    max.is_none_or(|max| length <= max)
}

/// `[offset, offset + length)` lies inside a source of `max` bytes.
pub fn check_extent(offset: u64, length: u64, max: u64) -> bool {
    offset.checked_add(length).is_some_and(|end| end <= max)
}

/// Rejects negative and implausibly large counts.
pub fn check_num_files(count: i64) -> bool {
    (0..=MAX_FILES).contains(&count)
}

pub fn check_filename_length(length: u64) -> bool {
    (1..=MAX_NAME_LENGTH).contains(&length)
}

pub fn check_range<T: PartialOrd>(value: T, min: T, max: T) -> bool {
    value >= min && value <= max
}

/// Case-insensitive match of the final extension of `path` against `allowed`.
///
/// Entries of `allowed` are given without the leading dot.
pub fn check_extension(path: &str, allowed: &[&str]) -> bool {
    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let lower = file_name.to_ascii_lowercase();
    allowed.iter().any(|ext| {
        let ext = ext.to_ascii_lowercase();
        lower
            .strip_suffix(ext.as_str())
            .is_some_and(|stem| stem.ends_with('.'))
    })
}

pub fn ensure_offset(offset: u64, max: u64, at: u64) -> Result<()> {
    if check_offset(offset, max) {
        Ok(())
    } else {
        Err(ArcError::corrupt(
            at,
            "offset",
            format!("offset {:#x} beyond container size {:#x}", offset, max),
        ))
    }
}

pub fn ensure_length(length: u64, max: Option<u64>, at: u64) -> Result<()> {
    if check_length(length, max) {
        Ok(())
    } else {
        Err(ArcError::corrupt(
            at,
            "length",
            format!("length {:#x} exceeds {:#x}", length, max.unwrap_or(u64::MAX)),
        ))
    }
}

pub fn ensure_extent(offset: u64, length: u64, max: u64, at: u64) -> Result<()> {
    if check_extent(offset, length, max) {
        Ok(())
    } else {
        Err(ArcError::corrupt(
            at,
            "extent",
            format!(
                "entry {:#x}+{:#x} ends beyond container size {:#x}",
                offset, length, max
            ),
        ))
    }
}

/// Validates a declared entry count and returns it as a `usize`.
pub fn ensure_num_files(count: i64, at: u64) -> Result<usize> {
    if check_num_files(count) {
        Ok(count as usize)
    } else {
        Err(ArcError::corrupt(
            at,
            "num_files",
            format!("implausible entry count {}", count),
        ))
    }
}

pub fn ensure_filename_length(length: u64, at: u64) -> Result<()> {
    if check_filename_length(length) {
        Ok(())
    } else {
        Err(ArcError::corrupt(
            at,
            "filename_length",
            format!("name length {} outside 1..={}", length, MAX_NAME_LENGTH),
        ))
    }
}

pub fn ensure_range<T: PartialOrd + std::fmt::Display>(value: T, min: T, max: T, at: u64) -> Result<()> {
    if check_range(&value, &min, &max) {
        Ok(())
    } else {
        Err(ArcError::corrupt(
            at,
            "range",
            format!("{} outside {}..={}", value, min, max),
        ))
    }
}

pub fn ensure_magic(found: &[u8], expected: &[u8], at: u64) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(ArcError::corrupt(
            at,
            "magic",
            format!("expected {:02x?}, found {:02x?}", expected, found),
        ))
    }
}

/// Capacity to reserve for an untrusted count.
pub fn capacity_hint(count: usize) -> usize {
    count.min(4096)
}
