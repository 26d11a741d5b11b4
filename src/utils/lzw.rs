//! Escude "acp" LZW blocks.
//!
//! Layout: `acp\0`, the decompressed size as a big-endian u32, then MSB-first
//! tokens starting 9 bits wide. Token 0x100 ends the stream, 0x101 widens tokens
//! by one bit, 0x102 resets the dictionary. Dictionary entries record output
//! positions; token `0x103 + n` repeats the bytes from entry `n` through the
//! start of entry `n + 1`.
use crate::error::{ArcError, Result};
use crate::ext::io::MemReaderRef;
use crate::utils::bit_stream::{MsbBitStream, MsbBitWriter};

pub const MAGIC: &[u8; 4] = b"acp\0";
const DICT_SIZE: usize = 0x8900;
const TOKEN_END: u32 = 0x100;
const TOKEN_WIDEN: u32 = 0x101;
const TOKEN_RESET: u32 = 0x102;
const TOKEN_FIRST: u32 = 0x103;
/// Upper bound on the up-front allocation, as a multiple of the block length.
const MAX_RATIO: usize = 8;

pub fn is_lzw(data: &[u8]) -> bool {
    data.len() >= 8 && data.starts_with(&MAGIC[..3])
}

/// Decompressed size recorded in the block header.
pub fn unpacked_size(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(4..8)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let size = unpacked_size(data)
        .ok_or_else(|| ArcError::decompression("LZW block shorter than its header"))?
        as usize;
    let mut bits = MsbBitStream::new(MemReaderRef::new(&data[8..]));
    // the header size is only trusted as far as the stored bytes can plausibly expand
    let mut output = Vec::with_capacity(size.min(data.len().saturating_mul(MAX_RATIO)));
    let mut dict = vec![0usize; DICT_SIZE];
    let mut width = 9;
    let mut dict_pos = 0;
    while output.len() < size {
        let token = bits
            .get_bits(width)
            .map_err(|_| ArcError::decompression("LZW stream truncated"))?;
        match token {
            TOKEN_END => break,
            TOKEN_WIDEN => {
                width += 1;
                if width > 24 {
                    return Err(ArcError::decompression("LZW token width above 24 bits"));
                }
            }
            TOKEN_RESET => {
                width = 9;
                dict_pos = 0;
            }
            _ => {
                if dict_pos >= DICT_SIZE {
                    return Err(ArcError::decompression("LZW dictionary overflow"));
                }
                let dst = output.len();
                dict[dict_pos] = dst;
                dict_pos += 1;
                if token < 0x100 {
                    output.push(token as u8);
                } else {
                    let n = (token - TOKEN_FIRST) as usize;
                    // an entry ends where the next one starts, so it must be complete
                    if n + 1 >= dict_pos {
                        return Err(ArcError::decompression(format!(
                            "LZW token {:#x} references an incomplete entry",
                            token
                        )));
                    }
                    let src = dict[n];
                    let span = dict[n + 1] - src + 1;
                    let count = span.min(size - dst);
                    // the copy may overlap its own output
                    for i in 0..count {
                        let b = output[src + i];
                        output.push(b);
                    }
                }
            }
        }
    }
    if output.len() != size {
        return Err(ArcError::decompression(format!(
            "LZW stream ended after {} of {} bytes",
            output.len(),
            size
        )));
    }
    Ok(output)
}

/// Wraps `data` in an LZW block made of literal tokens only.
pub fn compress_literal(data: &[u8]) -> Result<Vec<u8>> {
    let size = u32::try_from(data.len())
        .map_err(|_| ArcError::InvalidInput("LZW block larger than 4 GiB".into()))?;
    let mut out = Vec::with_capacity(8 + data.len() * 9 / 8 + 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&size.to_be_bytes());
    let mut bits = MsbBitWriter::new(&mut out);
    for (i, &b) in data.iter().enumerate() {
        if i > 0 && i % (DICT_SIZE - 1) == 0 {
            bits.put_bits(TOKEN_RESET, 9)?;
        }
        bits.put_bits(b as u32, 9)?;
    }
    bits.put_bits(TOKEN_END, 9)?;
    bits.flush()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(size: u32, tokens: &[(u32, u32)]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&size.to_be_bytes());
        let mut bits = MsbBitWriter::new(&mut out);
        for &(token, width) in tokens {
            bits.put_bits(token, width).unwrap();
        }
        bits.flush().unwrap();
        out
    }

    #[test]
    fn repeats_dictionary_entry() {
        let data = block(4, &[(b'a' as u32, 9), (b'b' as u32, 9), (0x103, 9), (0x100, 9)]);
        assert_eq!(decompress(&data).unwrap(), b"abab");
    }

    #[test]
    fn widen_token() {
        let data = block(2, &[(b'x' as u32, 9), (0x101, 9), (b'y' as u32, 10)]);
        assert_eq!(decompress(&data).unwrap(), b"xy");
    }

    #[test]
    fn incomplete_entry_is_rejected() {
        let data = block(4, &[(b'a' as u32, 9), (0x104, 9)]);
        assert!(decompress(&data).is_err());
        let short = block(8, &[(b'a' as u32, 9), (0x100, 9)]);
        assert!(decompress(&short).is_err());
    }

    #[test]
    fn oversized_header_fails_without_filling_it() {
        let data = block(u32::MAX, &[(b'a' as u32, 9), (b'b' as u32, 9), (0x103, 9), (0x100, 9)]);
        let err = decompress(&data).unwrap_err();
        assert!(err.to_string().contains("after 4 of"));
    }

    #[test]
    fn literal_blocks_reset_before_overflow() {
        let data: Vec<u8> = (0..DICT_SIZE * 2 + 17).map(|i| (i * 31) as u8).collect();
        let packed = compress_literal(&data).unwrap();
        assert!(is_lzw(&packed));
        assert_eq!(unpacked_size(&packed), Some(data.len() as u32));
        assert_eq!(decompress(&packed).unwrap(), data);
    }
}
