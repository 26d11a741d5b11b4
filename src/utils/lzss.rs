//! Okumura style LZSS (4 KiB window, 18 byte look-ahead, zero-filled history).
use crate::error::{ArcError, Result};

const N: usize = 4096;
const F: usize = 18;
const THRESHOLD: usize = 2;

/// Decompresses `input` into exactly `expected` bytes.
///
/// Producing fewer or more bytes than expected is a decompression error.
pub fn decompress(input: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected.min(input.len().saturating_mul(9)));
    let mut src = input.iter().copied();
    let mut history = [0u8; N];
    let mut r = N - F;
    let mut flags: u32 = 0;
    let push = |out: &mut Vec<u8>, history: &mut [u8; N], r: &mut usize, c: u8| -> Result<()> {
        if out.len() >= expected {
            return Err(ArcError::decompression(format!(
                "LZSS stream produces more than {} bytes",
                expected
            )));
        }
        out.push(c);
        history[*r] = c;
        *r = (*r + 1) & (N - 1);
        Ok(())
    };
    loop {
        flags >>= 1;
        if flags & 0x100 == 0 {
            match src.next() {
                // the high byte counts the eight flag bits
                Some(c) => flags = c as u32 | 0xFF00,
                None => break,
            }
        }
        if flags & 1 != 0 {
            match src.next() {
                Some(c) => push(&mut out, &mut history, &mut r, c)?,
                None => break,
            }
        } else {
            let (Some(lo), Some(hi)) = (src.next(), src.next()) else {
                break;
            };
            let pos = lo as usize | ((hi as usize & 0xF0) << 4);
            let len = (hi as usize & 0x0F) + THRESHOLD;
            for k in 0..=len {
                let c = history[(pos + k) & (N - 1)];
                push(&mut out, &mut history, &mut r, c)?;
            }
        }
    }
    if out.len() != expected {
        return Err(ArcError::decompression(format!(
            "LZSS stream ended after {} of {} bytes",
            out.len(),
            expected
        )));
    }
    Ok(out)
}

/// Encodes `data` as literal runs only. Valid input for [decompress].
pub fn compress_literal(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 1);
    for block in data.chunks(8) {
        out.push(((1u16 << block.len()) - 1) as u8);
        out.extend_from_slice(block);
    }
    out
}

#[test]
fn test_lzss_back_reference() {
    // three literals, then a 3 byte match at window position 0xFEE
    let stream = [0x07, b'a', b'b', b'c', 0xEE, 0xF0];
    assert_eq!(decompress(&stream, 6).unwrap(), b"abcabc");
}

#[test]
fn test_lzss_zero_filled_window() {
    // a match before anything was written reads the initial window
    let stream = [0x00, 0x00, 0x00];
    assert_eq!(decompress(&stream, 3).unwrap(), vec![0, 0, 0]);
}

#[test]
fn test_lzss_length_mismatch() {
    let stream = [0x07, b'a', b'b', b'c', 0xEE, 0xF0];
    assert!(decompress(&stream, 5).is_err());
    assert!(decompress(&stream, 7).is_err());
}

#[test]
fn test_lzss_literal_encoding() {
    let data = b"literal runs of any length".to_vec();
    assert_eq!(decompress(&compress_literal(&data), data.len()).unwrap(), data);
}
