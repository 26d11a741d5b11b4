//! Most significant bit first bit streams.
use crate::ext::io::*;
use std::io::{Read, Write};

/// Reads big-endian bit fields from a byte stream.
pub struct MsbBitStream<T: Read> {
    input: T,
    bits: u32,
    cached: u32,
}

impl<T: Read> MsbBitStream<T> {
    pub fn new(input: T) -> Self {
        MsbBitStream {
            input,
            bits: 0,
            cached: 0,
        }
    }

    /// Reads `count` bits, at most 24.
    pub fn get_bits(&mut self, count: u32) -> std::io::Result<u32> {
        while self.cached < count {
            let byte = self.input.read_u8()?;
            self.bits = (self.bits << 8) | byte as u32;
            self.cached += 8;
        }
        self.cached -= count;
        Ok((self.bits >> self.cached) & ((1 << count) - 1))
    }
}

/// Writes big-endian bit fields. Call [MsbBitWriter::flush] to emit the last partial byte.
pub struct MsbBitWriter<'a, T: Write> {
    writer: &'a mut T,
    buffer: u32,
    buffered: u32,
}

impl<'a, T: Write> MsbBitWriter<'a, T> {
    pub fn new(writer: &'a mut T) -> Self {
        MsbBitWriter {
            writer,
            buffer: 0,
            buffered: 0,
        }
    }

    pub fn put_bits(&mut self, value: u32, width: u32) -> std::io::Result<()> {
        for i in (0..width).rev() {
            self.buffer = (self.buffer << 1) | ((value >> i) & 1);
            self.buffered += 1;
            if self.buffered == 8 {
                self.writer.write_u8(self.buffer as u8)?;
                self.buffer = 0;
                self.buffered = 0;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        if self.buffered > 0 {
            self.writer.write_u8((self.buffer << (8 - self.buffered)) as u8)?;
            self.buffer = 0;
            self.buffered = 0;
        }
        Ok(())
    }
}

#[test]
fn test_bit_fields_roundtrip() {
    let mut out = Vec::new();
    {
        let mut w = MsbBitWriter::new(&mut out);
        w.put_bits(0x1FF, 9).unwrap();
        w.put_bits(0x5, 3).unwrap();
        w.flush().unwrap();
    }
    assert_eq!(out, vec![0xFF, 0xD0]);
    let mut r = MsbBitStream::new(MemReader::new(out));
    assert_eq!(r.get_bits(9).unwrap(), 0x1FF);
    assert_eq!(r.get_bits(3).unwrap(), 0x5);
}
