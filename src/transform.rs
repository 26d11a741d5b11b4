//! Materializing entry content.
//!
//! A [Transform] is plain data carried by its entry. Opening it against a
//! source yields an [EntryStream], a pull based reader that only touches the
//! source once it is read. Streams are independent: each owns its source
//! handle, so different entries can be materialized on different threads.
use crate::error::{ArcError, Result};
use crate::ext::io::{MemReader, ReadSeek, StreamRegion};
use crate::types::{ArchiveEntry, Chunk, Codec, Transform};
use crate::utils::xored_stream::{RollingXorStream, XoredKeyStream};
use crate::utils::{lzo, lzss};
use flate2::read::ZlibDecoder;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

type Source = Box<dyn ReadSeek>;
type BlockDecoder = Box<dyn FnOnce(Vec<u8>) -> Result<Vec<u8>> + Send>;

/// Largest buffer reserved up front from a length taken out of a directory.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

fn stream_error(e: std::io::Error) -> ArcError {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
            let msg = e.to_string();
            match e.into_inner().map(|inner| inner.downcast::<ArcError>()) {
                Some(Ok(inner)) => *inner,
                _ => ArcError::DecompressionError(msg),
            }
        }
        _ => ArcError::Io(e),
    }
}

fn read_stored(source: &mut Source, offset: u64, len: u64) -> Result<Vec<u8>> {
    source.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
    source.by_ref().take(len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(ArcError::decompression(format!(
            "stored data at {:#x} ends after {} of {} bytes",
            offset,
            data.len(),
            len
        )));
    }
    Ok(data)
}

/// Decodes one whole block with `codec`.
pub fn decode_block(codec: Codec, data: Vec<u8>, expected: u64) -> Result<Vec<u8>> {
    match codec {
        Codec::Raw => Ok(data),
        Codec::Zlib => {
            let mut out = Vec::with_capacity(expected.min(MAX_PREALLOC) as usize);
            ZlibDecoder::new(&data[..])
                .read_to_end(&mut out)
                .map_err(ArcError::decompression)?;
            Ok(out)
        }
        Codec::Lzss => lzss::decompress(&data, expected as usize),
        Codec::Lzo => lzo::decompress(&data, expected as usize),
    }
}

/// Reads and decodes the stored bytes on the first pull.
struct LazyBlock {
    pending: Option<(Source, u64, u64, BlockDecoder)>,
    out: MemReader,
}

impl LazyBlock {
    fn new(source: Source, offset: u64, len: u64, decode: BlockDecoder) -> Self {
        LazyBlock {
            pending: Some((source, offset, len, decode)),
            out: MemReader::new(Vec::new()),
        }
    }
}

impl Read for LazyBlock {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some((mut source, offset, len, decode)) = self.pending.take() {
            let data = read_stored(&mut source, offset, len)?;
            self.out = MemReader::new(decode(data)?);
        }
        self.out.read(buf)
    }
}

/// Concatenates independently stored chunks, decoding one at a time.
struct ChunkStream {
    source: Source,
    chunks: VecDeque<(Codec, Chunk)>,
    current: MemReader,
}

impl Read for ChunkStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            let Some((codec, chunk)) = self.chunks.pop_front() else {
                return Ok(0);
            };
            let data = read_stored(&mut self.source, chunk.offset, chunk.stored_length)?;
            let out = decode_block(codec, data, chunk.decompressed_length)?;
            if out.len() as u64 != chunk.decompressed_length {
                return Err(ArcError::decompression(format!(
                    "chunk at {:#x} decodes to {} bytes, expected {}",
                    chunk.offset,
                    out.len(),
                    chunk.decompressed_length
                ))
                .into());
            }
            self.current = MemReader::new(out);
        }
    }
}

/// Decoded content of one entry.
///
/// Pull based: nothing is read from the source until the first read. Once a read
/// fails the stream is poisoned and every later read fails too. A stream must be
/// driven by one caller at a time; independent streams share nothing.
pub struct EntryStream {
    body: Box<dyn Read + Send>,
    expected: Option<u64>,
    produced: u64,
    poisoned: bool,
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStream")
            .field("expected", &self.expected)
            .field("produced", &self.produced)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl EntryStream {
    fn new(body: Box<dyn Read + Send>, expected: Option<u64>) -> Self {
        EntryStream {
            body,
            expected,
            produced: 0,
            poisoned: false,
        }
    }

    fn pull(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.poisoned {
            return Err(ArcError::decompression("stream failed earlier"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.body.read(buf).map_err(stream_error)?;
        self.produced += n as u64;
        if let Some(expected) = self.expected {
            if self.produced > expected {
                return Err(ArcError::decompression(format!(
                    "stream produces more than the declared {} bytes",
                    expected
                )));
            }
            if n == 0 && self.produced != expected {
                return Err(ArcError::decompression(format!(
                    "stream ends after {} of {} bytes",
                    self.produced, expected
                )));
            }
        }
        Ok(n)
    }

    fn read_checked(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.pull(buf);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Pulls one byte; `None` at the end of the content.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.read_checked(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    /// Bytes still to come, when the decoded length is known.
    pub fn available(&self) -> Option<u64> {
        self.expected.map(|e| e - self.produced)
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Reads the whole content. On failure no partial output is returned.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let hint = self.expected.unwrap_or(0).min(MAX_PREALLOC);
        let mut out = Vec::with_capacity(hint as usize);
        let mut buf = [0u8; 0x4000];
        loop {
            let n = self.read_checked(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.read_checked(buf)?)
    }
}

impl Transform {
    /// Opens the content stored at `offset` in `source`.
    ///
    /// `compressed_len` bytes are stored there; `decompressed_len` is the size of
    /// the result. It is authoritative for every transform except
    /// [Transform::ZlibUnknownSize], which decodes until the compressed stream is
    /// exhausted. Chunked transforms carry absolute chunk offsets and ignore
    /// `offset` and `compressed_len`.
    pub fn open(
        &self,
        source: Box<dyn ReadSeek>,
        offset: u64,
        compressed_len: u64,
        decompressed_len: u64,
    ) -> Result<EntryStream> {
        let exact = Some(decompressed_len);
        let stream = match self {
            Transform::None => {
                EntryStream::new(Box::new(StreamRegion::new(source, offset, compressed_len)?), exact)
            }
            Transform::Zlib => EntryStream::new(
                Box::new(ZlibDecoder::new(StreamRegion::new(source, offset, compressed_len)?)),
                exact,
            ),
            Transform::ZlibUnknownSize => EntryStream::new(
                Box::new(ZlibDecoder::new(StreamRegion::new(source, offset, compressed_len)?)),
                None,
            ),
            Transform::Lzss => {
                let decode: BlockDecoder =
                    Box::new(move |data| lzss::decompress(&data, decompressed_len as usize));
                EntryStream::new(
                    Box::new(LazyBlock::new(source, offset, compressed_len, decode)),
                    exact,
                )
            }
            Transform::Lzo => {
                let decode: BlockDecoder =
                    Box::new(move |data| lzo::decompress(&data, decompressed_len as usize));
                EntryStream::new(
                    Box::new(LazyBlock::new(source, offset, compressed_len, decode)),
                    exact,
                )
            }
            #[cfg(feature = "utils-bit-stream")]
            Transform::Lzw => {
                let decode: BlockDecoder = Box::new(|data| crate::utils::lzw::decompress(&data));
                EntryStream::new(
                    Box::new(LazyBlock::new(source, offset, compressed_len, decode)),
                    exact,
                )
            }
            #[cfg(not(feature = "utils-bit-stream"))]
            Transform::Lzw => {
                return Err(ArcError::UnsupportedVariant(
                    "LZW support is not compiled in".into(),
                ));
            }
            Transform::Xor { key } => {
                let region = StreamRegion::new(source, offset, compressed_len)?;
                EntryStream::new(Box::new(XoredKeyStream::new(region, key.clone(), 0)), exact)
            }
            Transform::RollingXor { seed } => {
                let region = StreamRegion::new(source, offset, compressed_len)?;
                EntryStream::new(Box::new(RollingXorStream::new(region, *seed)), exact)
            }
            Transform::Preload { data } => {
                let region = StreamRegion::new(source, offset, compressed_len)?;
                EntryStream::new(Box::new(MemReader::new(data.clone()).chain(region)), exact)
            }
            Transform::Chunked { codec, chunks } => {
                let chunks = chunks.iter().map(|c| (*codec, *c)).collect();
                EntryStream::new(Box::new(chunk_stream(source, chunks)), exact)
            }
            Transform::Variable { chunks } => {
                let chunks = chunks.iter().copied().collect();
                EntryStream::new(Box::new(chunk_stream(source, chunks)), exact)
            }
        };
        Ok(stream)
    }
}

fn chunk_stream(source: Source, chunks: VecDeque<(Codec, Chunk)>) -> ChunkStream {
    ChunkStream {
        source,
        chunks,
        current: MemReader::new(Vec::new()),
    }
}

impl ArchiveEntry {
    /// Opens this entry's content in `source`, the file named by its [crate::types::EntrySource].
    pub fn open(&self, source: Box<dyn ReadSeek>) -> Result<EntryStream> {
        self.transform.open(
            source,
            self.source_offset,
            self.stored_length,
            self.decompressed_length,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn source(data: Vec<u8>) -> Box<dyn ReadSeek> {
        Box::new(MemReader::new(data))
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn passthrough_reads_only_its_extent() {
        let data = b"xxhello worldyy".to_vec();
        let out = Transform::None.open(source(data), 2, 11, 11).unwrap().read_all().unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn zlib_length_is_checked() {
        let mut data = vec![0u8; 3];
        let packed = zlib(b"some zlib payload");
        data.extend_from_slice(&packed);
        let len = packed.len() as u64;
        let out = Transform::Zlib
            .open(source(data.clone()), 3, len, 17)
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(out, b"some zlib payload");
        let err = Transform::Zlib.open(source(data), 3, len, 20).unwrap().read_all();
        assert!(matches!(err, Err(ArcError::DecompressionError(_))));
    }

    #[test]
    fn unknown_size_zlib_runs_until_exhausted() {
        let payload = pattern(5000, 7);
        let packed = zlib(&payload);
        let len = packed.len() as u64;
        let mut stream = Transform::ZlibUnknownSize.open(source(packed), 0, len, 0).unwrap();
        assert_eq!(stream.available(), None);
        assert_eq!(stream.read_byte().unwrap(), Some(payload[0]));
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, &payload[1..]);
        assert_eq!(stream.produced(), 5000);
    }

    #[test]
    fn malformed_zlib_fails_atomically() {
        let mut packed = zlib(&pattern(4096, 1));
        let mid = packed.len() / 2;
        packed[mid..].iter_mut().for_each(|b| *b = 0xFF);
        let len = packed.len() as u64;
        let result = Transform::Zlib.open(source(packed.clone()), 0, len, 4096).unwrap().read_all();
        assert!(matches!(result, Err(ArcError::DecompressionError(_))));

        let mut stream = Transform::Zlib.open(source(packed), 0, len, 4096).unwrap();
        let mut sink = Vec::new();
        assert!(stream.read_to_end(&mut sink).is_err());
        assert!(stream.read_byte().is_err());
    }

    #[test]
    fn chunk_boundaries_are_invisible() {
        let parts = [pattern(4096, 1), pattern(4096, 2), pattern(1024, 3)];
        let mut data = Vec::new();
        let mut chunks = Vec::new();
        for part in &parts {
            let packed = zlib(part);
            chunks.push(Chunk::new(data.len() as u64, packed.len() as u64, part.len() as u64));
            data.extend_from_slice(&packed);
        }
        let total: u64 = chunks.iter().map(|c| c.decompressed_length).sum();
        assert_eq!(total, 9216);
        let transform = Transform::Chunked {
            codec: Codec::Zlib,
            chunks,
        };
        let out = transform.open(source(data), 0, 0, total).unwrap().read_all().unwrap();
        assert_eq!(out.len(), 9216);
        assert_eq!(out, parts.concat());
    }

    #[test]
    fn variable_chunks_mix_raw_and_compressed() {
        let raw = pattern(100, 9);
        let packed_src = pattern(300, 4);
        let packed = zlib(&packed_src);
        let mut data = raw.clone();
        data.extend_from_slice(&packed);
        let transform = Transform::Variable {
            chunks: vec![
                (Codec::Raw, Chunk::new(0, 100, 100)),
                (Codec::Zlib, Chunk::new(100, packed.len() as u64, 300)),
            ],
        };
        let out = transform.open(source(data), 0, 0, 400).unwrap().read_all().unwrap();
        assert_eq!(&out[..100], &raw[..]);
        assert_eq!(&out[100..], &packed_src[..]);
    }

    #[test]
    fn chunk_with_wrong_size_is_rejected() {
        let packed = zlib(&pattern(64, 0));
        let transform = Transform::Chunked {
            codec: Codec::Zlib,
            chunks: vec![Chunk::new(0, packed.len() as u64, 65)],
        };
        let result = transform.open(source(packed), 0, 0, 65).unwrap().read_all();
        assert!(matches!(result, Err(ArcError::DecompressionError(_))));
    }

    #[test]
    fn xor_key_starts_at_entry() {
        let key = vec![0x10, 0x20, 0x30];
        let plain = b"abcdefg";
        let mut data = vec![0xAA; 5];
        data.extend(plain.iter().enumerate().map(|(i, b)| b ^ key[i % 3]));
        let out = Transform::Xor { key }
            .open(source(data), 5, 7, 7)
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn rolling_xor_matches_writer() {
        let plain = pattern(37, 5);
        let mut stored = Vec::new();
        RollingXorStream::new(&mut stored, 0x1234_5678)
            .write_all(&plain)
            .unwrap();
        let out = Transform::RollingXor { seed: 0x1234_5678 }
            .open(source(stored), 0, 37, 37)
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn preload_bytes_come_first() {
        let transform = Transform::Preload {
            data: b"head:".to_vec(),
        };
        let mut stream = transform.open(source(b"__tail".to_vec()), 2, 4, 9).unwrap();
        assert_eq!(stream.available(), Some(9));
        assert_eq!(stream.read_byte().unwrap(), Some(b'h'));
        assert_eq!(stream.available(), Some(8));
        assert_eq!(stream.read_all().unwrap(), b"ead:tail");
    }

    #[test]
    fn lzss_block_is_decoded_lazily() {
        let stored = lzss::compress_literal(b"lazy lzss");
        let len = stored.len() as u64;
        let out = Transform::Lzss.open(source(stored), 0, len, 9).unwrap().read_all().unwrap();
        assert_eq!(out, b"lazy lzss");
    }

    #[test]
    fn truncated_source_is_a_decompression_error() {
        let result = Transform::None.open(source(vec![1, 2, 3]), 0, 8, 8).unwrap().read_all();
        assert!(matches!(result, Err(ArcError::DecompressionError(_))));
    }
}
