//! XOR obfuscation streams.
use std::io::{Read, Seek, SeekFrom, Write};

/// XORs data with a repeating key. Key position follows the inner stream position
/// plus `base_position`, so seeking keeps the key aligned.
pub struct XoredKeyStream<T> {
    inner: T,
    key: Vec<u8>,
    base_position: u64,
}

impl<T> XoredKeyStream<T> {
    pub fn new(inner: T, key: Vec<u8>, base_position: u64) -> Self {
        XoredKeyStream {
            inner,
            key,
            base_position,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn apply(&self, start: u64, buf: &mut [u8]) {
        if self.key.is_empty() {
            return;
        }
        let len = self.key.len() as u64;
        let mut k = ((start + self.base_position) % len) as usize;
        for b in buf {
            *b ^= self.key[k];
            k += 1;
            if k == self.key.len() {
                k = 0;
            }
        }
    }
}

impl<T: Read + Seek> Read for XoredKeyStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let start = self.inner.stream_position()?;
        let n = self.inner.read(buf)?;
        self.apply(start, &mut buf[..n]);
        Ok(n)
    }
}

impl<T: Seek> Seek for XoredKeyStream<T> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        self.inner.stream_position()
    }
}

impl<T: Write + Seek> Write for XoredKeyStream<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let start = self.inner.stream_position()?;
        let mut encrypted = buf.to_vec();
        self.apply(start, &mut encrypted);
        self.inner.write(&encrypted)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for XoredKeyStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XoredKeyStream")
            .field("inner", &self.inner)
            .field("base_position", &self.base_position)
            .finish()
    }
}

/// XORs data with a 32-bit key that advances to `key * 7 + 3` after every 4 bytes.
///
/// Forward only. Used for RGSSAD payloads.
#[derive(Debug)]
pub struct RollingXorStream<T> {
    inner: T,
    key: u32,
    pos: u64,
}

impl<T> RollingXorStream<T> {
    pub fn new(inner: T, seed: u32) -> Self {
        RollingXorStream {
            inner,
            key: seed,
            pos: 0,
        }
    }

    pub fn step(key: u32) -> u32 {
        key.wrapping_mul(7).wrapping_add(3)
    }

    fn apply(&mut self, buf: &mut [u8]) {
        for b in buf {
            let lane = (self.pos % 4) as usize;
            *b ^= self.key.to_le_bytes()[lane];
            self.pos += 1;
            if lane == 3 {
                self.key = Self::step(self.key);
            }
        }
    }
}

impl<T: Read> Read for RollingXorStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.apply(&mut buf[..n]);
        Ok(n)
    }
}

impl<T: Write> Write for RollingXorStream<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut encrypted = buf.to_vec();
        self.apply(&mut encrypted);
        self.inner.write_all(&encrypted)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::io::MemReader;

    #[test]
    fn key_stream_follows_position() {
        let plain = b"hello world".to_vec();
        let key = vec![0x11, 0x22, 0x33];
        let mut out = std::io::Cursor::new(Vec::new());
        XoredKeyStream::new(&mut out, key.clone(), 0)
            .write_all(&plain)
            .unwrap();
        let encrypted = out.into_inner();
        assert_eq!(encrypted[0], b'h' ^ 0x11);
        assert_eq!(encrypted[3], b'l' ^ 0x11);

        let mut reader = XoredKeyStream::new(MemReader::new(encrypted), key, 0);
        reader.seek(SeekFrom::Start(6)).unwrap();
        let mut tail = String::new();
        reader.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "world");
    }

    #[test]
    fn rolling_key_steps_every_four_bytes() {
        let seed = 0xDEADCAFEu32;
        let mut stream = RollingXorStream::new(MemReader::new(vec![0u8; 8]), seed);
        let mut out = [0u8; 8];
        stream.read_exact(&mut out).unwrap();
        assert_eq!(&out[..4], &seed.to_le_bytes());
        assert_eq!(&out[4..], &RollingXorStream::<()>::step(seed).to_le_bytes());
        assert_eq!(RollingXorStream::<()>::step(seed), 0x16C0_8CF5);
    }
}
