//! Bounded binary reader used by every directory decoder.
//!
//! All reads are checked against the length of the source before any byte is
//! consumed or any buffer is allocated, so a corrupt length field can neither
//! read past the end nor trigger a huge allocation. A read-ahead cache makes
//! the many small field reads of a directory walk cheap; it is a pure cache and
//! never changes what a read returns.
use crate::error::{ArcError, Result};
use crate::ext::io::{MemReader, ReadSeek};
use crate::types::Encoding;
use crate::utils::encoding::decode_to_string;
use crate::utils::struct_pack::StructUnpack;
use std::io::{Read, Seek, SeekFrom};

/// Default size of the read-ahead cache.
pub const DEFAULT_READ_AHEAD: usize = 0x1000;

/// The reader type handed to directory decoders.
pub type SourceReader = BinaryReader<Box<dyn ReadSeek>>;

pub struct BinaryReader<R> {
    inner: R,
    len: u64,
    pos: u64,
    cache: Vec<u8>,
    cache_start: u64,
    cache_cap: usize,
}

impl<R> std::fmt::Debug for BinaryReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryReader")
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("cache_cap", &self.cache_cap)
            .finish_non_exhaustive()
    }
}

impl BinaryReader<MemReader<Vec<u8>>> {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        BinaryReader {
            inner: MemReader::new(data),
            len,
            pos: 0,
            cache: Vec::new(),
            cache_start: 0,
            // the data already lives in memory
            cache_cap: 0,
        }
    }
}

impl SourceReader {
    pub fn boxed<T: ReadSeek + 'static>(inner: T, read_ahead: usize) -> Result<Self> {
        BinaryReader::with_read_ahead(Box::new(inner) as Box<dyn ReadSeek>, read_ahead)
    }
}

impl<R: Read + Seek> BinaryReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        Self::with_read_ahead(inner, DEFAULT_READ_AHEAD)
    }

    /// Wraps `inner`, caching up to `read_ahead` bytes per refill. 0 disables the cache.
    pub fn with_read_ahead(mut inner: R, read_ahead: usize) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(BinaryReader {
            inner,
            len,
            pos: 0,
            cache: Vec::new(),
            cache_start: 0,
            cache_cap: read_ahead,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.len - self.pos
    }

    fn out_of_bounds(&self, offset: u64, wanted: u64) -> ArcError {
        ArcError::OutOfBounds {
            offset,
            wanted,
            size: self.len,
        }
    }

    fn ensure(&self, wanted: u64) -> Result<()> {
        match self.pos.checked_add(wanted) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(self.out_of_bounds(self.pos, wanted)),
        }
    }

    /// Moves to an absolute offset. The end of the source is a valid position.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.len {
            return Err(self.out_of_bounds(offset, 0));
        }
        self.pos = offset;
        Ok(())
    }

    pub fn skip(&mut self, count: u64) -> Result<()> {
        self.ensure(count)?;
        self.pos += count;
        Ok(())
    }

    /// Skips padding up to the next multiple of `boundary`, returning the bytes skipped.
    pub fn align(&mut self, boundary: u64) -> Result<u64> {
        let pad = crate::decode::padding_for(self.pos, boundary);
        self.skip(pad)?;
        Ok(pad)
    }

    fn cached(&self, len: usize) -> Option<&[u8]> {
        let start = self.pos.checked_sub(self.cache_start)? as usize;
        self.cache.get(start..start + len)
    }

    /// Fills `buf` from the current position.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len() as u64;
        self.ensure(wanted)?;
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(hit) = self.cached(buf.len()) {
            buf.copy_from_slice(hit);
        } else if buf.len() >= self.cache_cap {
            self.inner.seek(SeekFrom::Start(self.pos))?;
            self.inner.read_exact(buf)?;
        } else {
            let fill = (self.cache_cap as u64).min(self.len - self.pos) as usize;
            self.cache.resize(fill, 0);
            self.inner.seek(SeekFrom::Start(self.pos))?;
            if let Err(e) = self.inner.read_exact(&mut self.cache) {
                self.cache.clear();
                return Err(e.into());
            }
            self.cache_start = self.pos;
            buf.copy_from_slice(&self.cache[..buf.len()]);
        }
        self.pos += wanted;
        Ok(())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Reads `count` bytes. The count is checked against the source before allocating.
    pub fn read_bytes(&mut self, count: u64) -> Result<Vec<u8>> {
        self.ensure(count)?;
        let mut buf = vec![0u8; count as usize];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Reads a `len` byte string field. With `trim`, the value ends at the first NUL.
    pub fn read_fstring(&mut self, len: usize, encoding: Encoding, trim: bool) -> Result<String> {
        let offset = self.pos;
        let mut buf = self.read_bytes(len as u64)?;
        if trim {
            let end = match encoding {
                Encoding::Utf16Le => buf
                    .chunks_exact(2)
                    .position(|c| c == [0, 0])
                    .map(|p| p * 2),
                _ => buf.iter().position(|&b| b == 0),
            };
            if let Some(end) = end {
                buf.truncate(end);
            }
        }
        decode_to_string(encoding, &buf, offset)
    }

    pub fn read_fixed_string(&mut self, len: usize, encoding: Encoding) -> Result<String> {
        self.read_fstring(len, encoding, true)
    }

    /// Reads a NUL terminated string of at most `max_len` bytes before the terminator.
    ///
    /// The terminator is consumed. A missing terminator within `max_len` bytes
    /// is an encoding error rather than a silent truncation.
    pub fn read_cstring(&mut self, max_len: usize, encoding: Encoding) -> Result<String> {
        let offset = self.pos;
        let mut buf = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 {
                break;
            }
            if buf.len() == max_len {
                return Err(ArcError::InvalidEncoding {
                    offset,
                    reason: format!("no terminator within {} bytes", max_len),
                });
            }
            buf.push(b);
        }
        decode_to_string(encoding, &buf, offset)
    }

    /// Reads `char_count` UTF-16LE code units.
    ///
    /// With `terminated`, a NUL code unit must follow the declared characters and
    /// is consumed; any other value there is an encoding error.
    pub fn read_utf16_string(&mut self, char_count: usize, terminated: bool) -> Result<String> {
        let offset = self.pos;
        let byte_len = (char_count as u64)
            .checked_mul(2)
            .ok_or_else(|| self.out_of_bounds(offset, u64::MAX))?;
        let buf = self.read_bytes(byte_len)?;
        if terminated {
            let at = self.pos;
            let terminator = self.read_u16()?;
            if terminator != 0 {
                return Err(ArcError::InvalidEncoding {
                    offset: at,
                    reason: format!("expected NUL after {} characters, found {:#06x}", char_count, terminator),
                });
            }
        }
        decode_to_string(Encoding::Utf16Le, &buf, offset)
    }

    /// Reads a string whose byte length precedes it in a `width` byte integer.
    pub fn read_prefixed_string(&mut self, width: usize, big: bool, encoding: Encoding) -> Result<String> {
        let len = match (width, big) {
            (1, _) => self.read_u8()? as u64,
            (2, false) => self.read_u16()? as u64,
            (2, true) => self.read_u16_be()? as u64,
            (4, false) => self.read_u32()? as u64,
            (4, true) => self.read_u32_be()? as u64,
            (8, false) => self.read_u64()?,
            (8, true) => self.read_u64_be()?,
            _ => {
                return Err(ArcError::InvalidInput(format!(
                    "unsupported length prefix width {}",
                    width
                )));
            }
        };
        let offset = self.pos;
        let buf = self.read_bytes(len)?;
        decode_to_string(encoding, &buf, offset)
    }

    pub fn read_u8_prefixed_string(&mut self, encoding: Encoding) -> Result<String> {
        self.read_prefixed_string(1, false, encoding)
    }

    pub fn read_u32_prefixed_string(&mut self, encoding: Encoding) -> Result<String> {
        self.read_prefixed_string(4, false, encoding)
    }

    /// Reads `count` bytes at `offset` without moving the cursor.
    pub fn read_at(&mut self, offset: u64, count: u64) -> Result<Vec<u8>> {
        let saved = self.pos;
        self.seek(offset)?;
        let result = self.read_bytes(count);
        self.pos = saved;
        result
    }

    pub fn peek_u32_at(&mut self, offset: u64) -> Result<u32> {
        let bytes = self.read_at(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Runs `f` at `offset`, then restores the cursor whether `f` succeeded or not.
    pub fn with_position<T>(&mut self, offset: u64, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = self.pos;
        self.seek(offset)?;
        let result = f(self);
        self.pos = saved;
        result
    }

    pub fn read_struct<T: StructUnpack>(&mut self, big: bool, encoding: Encoding) -> Result<T> {
        T::unpack(self, big, encoding)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
