//! Extensions for [std::io] readers and writers.
use std::io::*;

/// A seekable reader that can be moved to a worker thread.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek> WriteSeek for T {}

/// Output of archive writers. Some formats post-process their payloads in place.
pub trait ReadWriteSeek: Read + Write + Seek {}

impl<T: Read + Write + Seek> ReadWriteSeek for T {}

macro_rules! read_num {
    ($($name:ident, $name_be:ident => $ty:ty;)*) => {
        $(
            fn $name(&mut self) -> Result<$ty> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
            fn $name_be(&mut self) -> Result<$ty> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.read_exact(&mut buf)?;
                Ok(<$ty>::from_be_bytes(buf))
            }
        )*
    };
}

macro_rules! write_num {
    ($($name:ident, $name_be:ident => $ty:ty;)*) => {
        $(
            fn $name(&mut self, value: $ty) -> Result<()> {
                self.write_all(&value.to_le_bytes())
            }
            fn $name_be(&mut self, value: $ty) -> Result<()> {
                self.write_all(&value.to_be_bytes())
            }
        )*
    };
}

/// Typed reads for any [Read].
///
/// Used by codecs and writers that work on plain streams. Directory decoding goes
/// through [crate::reader::BinaryReader] instead, which bounds every read.
pub trait ReadExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }
    read_num! {
        read_u16, read_u16_be => u16;
        read_u32, read_u32_be => u32;
        read_u64, read_u64_be => u64;
        read_i32, read_i32_be => i32;
    }
    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Read + ?Sized> ReadExt for T {}

pub trait WriteExt: Write {
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])
    }
    write_num! {
        write_u16, write_u16_be => u16;
        write_u32, write_u32_be => u32;
        write_u64, write_u64_be => u64;
        write_i32, write_i32_be => i32;
    }
    /// Writes `count` copies of `byte`.
    fn write_fill(&mut self, byte: u8, count: usize) -> Result<()> {
        const BLOCK: [u8; 256] = [0; 256];
        if byte == 0 {
            let mut left = count;
            while left > 0 {
                let n = left.min(BLOCK.len());
                self.write_all(&BLOCK[..n])?;
                left -= n;
            }
            Ok(())
        } else {
            self.write_all(&vec![byte; count])
        }
    }
}

impl<T: Write + ?Sized> WriteExt for T {}

/// Patch helpers for writers that emit a placeholder header first.
pub trait PatchExt: Write + Seek {
    /// Overwrites a little-endian u32 at `offset` and restores the position.
    fn patch_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        let current = self.stream_position()?;
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(&value.to_le_bytes())?;
        self.seek(SeekFrom::Start(current))?;
        Ok(())
    }

    /// Pads with zeros up to the next multiple of `align`.
    fn pad_to(&mut self, align: u64) -> Result<u64> {
        let pos = self.stream_position()?;
        let pad = crate::decode::padding_for(pos, align);
        self.write_fill(0, pad as usize)?;
        Ok(pos + pad)
    }
}

impl<T: Write + Seek + ?Sized> PatchExt for T {}

/// An in-memory reader over any byte container.
///
/// Seeking past the end is rejected.
pub struct MemReader<D: AsRef<[u8]> = Vec<u8>> {
    pub data: D,
    pub pos: usize,
}

pub type MemReaderRef<'a> = MemReader<&'a [u8]>;

impl<D: AsRef<[u8]>> std::fmt::Debug for MemReader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemReader")
            .field("pos", &self.pos)
            .field("data_length", &self.data.as_ref().len())
            .finish_non_exhaustive()
    }
}

impl<D: AsRef<[u8]>> MemReader<D> {
    pub fn new(data: D) -> Self {
        MemReader { data, pos: 0 }
    }

    pub fn to_ref(&self) -> MemReaderRef<'_> {
        MemReader {
            data: self.data.as_ref(),
            pos: self.pos,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.as_ref().len()
    }
}

impl<D: AsRef<[u8]>> Read for MemReader<D> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.as_ref();
        if self.pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - self.pos);
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<D: AsRef<[u8]>> Seek for MemReader<D> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.data.as_ref().len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => len + offset as i128,
            SeekFrom::Current(offset) => self.pos as i128 + offset as i128,
        };
        if target < 0 || target > len {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("seek to {} outside of {} bytes", target, len),
            ));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }

    fn stream_position(&mut self) -> Result<u64> {
        Ok(self.pos as u64)
    }
}

/// A read-only window `[start, start + len)` over another seekable reader.
#[derive(Debug)]
pub struct StreamRegion<R: Read + Seek> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> StreamRegion<R> {
    pub fn new(mut inner: R, start: u64, len: u64) -> Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(StreamRegion {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R: Read + Seek> Read for StreamRegion<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let left = self.len - self.pos;
        if left == 0 {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(left) as usize;
        let read = self.inner.read(&mut buf[..n])?;
        if read == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "region ends {} bytes past the end of its source",
                    left
                ),
            ));
        }
        self.pos += read as u64;
        Ok(read)
    }
}

impl<R: Read + Seek> Seek for StreamRegion<R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => self.len as i128 + offset as i128,
            SeekFrom::Current(offset) => self.pos as i128 + offset as i128,
        };
        if target < 0 || target > self.len as i128 {
            return Err(Error::new(ErrorKind::InvalidInput, "seek outside of region"));
        }
        self.pos = target as u64;
        self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> Result<u64> {
        Ok(self.pos)
    }
}

#[test]
fn test_mem_reader_rejects_seek_past_end() {
    let mut reader = MemReader::new(vec![1u8, 2, 3, 4]);
    assert_eq!(reader.read_u16().unwrap(), 0x0201);
    assert_eq!(reader.read_u16_be().unwrap(), 0x0304);
    assert!(reader.is_eof());
    assert!(reader.seek(SeekFrom::Start(5)).is_err());
    assert_eq!(reader.seek(SeekFrom::End(-1)).unwrap(), 3);
}

#[test]
fn test_stream_region_is_a_window() {
    let data: Vec<u8> = (0u8..32).collect();
    let mut region = StreamRegion::new(MemReader::new(&data[..]), 8, 4).unwrap();
    let mut out = Vec::new();
    region.read_to_end(&mut out).unwrap();
    assert_eq!(out, vec![8, 9, 10, 11]);
    region.seek(SeekFrom::Start(2)).unwrap();
    assert_eq!(region.read_u8().unwrap(), 10);
    assert!(region.seek(SeekFrom::Start(5)).is_err());
}

#[test]
fn test_stream_region_past_source_end_fails() {
    let data = [0u8; 4];
    let mut region = StreamRegion::new(MemReader::new(&data[..]), 2, 8).unwrap();
    let mut out = Vec::new();
    assert!(region.read_to_end(&mut out).is_err());
}

#[test]
fn test_patch_u32_restores_position() {
    let mut cursor = Cursor::new(Vec::new());
    cursor.write_u32(0).unwrap();
    cursor.write_u8(0xAA).unwrap();
    cursor.patch_u32(0, 0xDEADBEEF).unwrap();
    cursor.write_u8(0xBB).unwrap();
    assert_eq!(cursor.into_inner(), vec![0xEF, 0xBE, 0xAD, 0xDE, 0xAA, 0xBB]);
}
