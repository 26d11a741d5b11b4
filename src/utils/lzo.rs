//! LZO1X block decompression.
//!
//! Every input read and back reference is bounds checked, so a corrupt block fails
//! with a decompression error instead of reading outside its buffers.
use crate::error::{ArcError, Result};

/// Longest run of zero bytes allowed in an extended length.
const MAX_255_COUNT: usize = usize::MAX / 255 - 2;
const M2_MAX_OFFSET: usize = 0x0800;

struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn byte(&mut self) -> Result<usize> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ArcError::decompression("LZO input overrun"))?;
        self.pos += 1;
        Ok(b as usize)
    }

    fn le16(&mut self) -> Result<usize> {
        Ok(self.byte()? | (self.byte()? << 8))
    }

    /// Extended length: a run of zero bytes, each worth 255, then a final byte.
    fn extended(&mut self, base: usize) -> Result<usize> {
        let start = self.pos;
        while self.data.get(self.pos) == Some(&0) {
            self.pos += 1;
        }
        let zeros = self.pos - start;
        if zeros > MAX_255_COUNT {
            return Err(ArcError::decompression("LZO length overflow"));
        }
        Ok(zeros * 255 + base + self.byte()?)
    }
}

struct Output {
    data: Vec<u8>,
    limit: usize,
}

impl Output {
    fn literals(&mut self, input: &mut Input, count: usize) -> Result<()> {
        let end = input
            .pos
            .checked_add(count)
            .filter(|&e| e <= input.data.len())
            .ok_or_else(|| ArcError::decompression("LZO input overrun"))?;
        if self.data.len() + count > self.limit {
            return Err(ArcError::decompression("LZO output overrun"));
        }
        self.data.extend_from_slice(&input.data[input.pos..end]);
        input.pos = end;
        Ok(())
    }

    /// Copies `len` bytes starting `distance` bytes back. Overlap repeats the pattern.
    fn back_ref(&mut self, distance: usize, len: usize) -> Result<()> {
        if distance == 0 || distance > self.data.len() {
            return Err(ArcError::decompression("LZO look-behind overrun"));
        }
        if self.data.len() + len > self.limit {
            return Err(ArcError::decompression("LZO output overrun"));
        }
        let start = self.data.len() - distance;
        for i in 0..len {
            let b = self.data[start + i];
            self.data.push(b);
        }
        Ok(())
    }
}

/// Decompresses one LZO1X block producing at most `limit` bytes.
pub fn decompress(input: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut ip = Input { data: input, pos: 0 };
    let mut op = Output {
        data: Vec::with_capacity(limit.min(input.len().saturating_mul(4))),
        limit,
    };
    let mut state: usize = 0;

    if input.first().is_some_and(|&b| b > 17) {
        let t = ip.byte()? - 17;
        op.literals(&mut ip, t)?;
        state = if t < 4 { t } else { 4 };
    }

    loop {
        let t = ip.byte()?;
        let (distance, len, next) = if t < 16 {
            if state == 0 {
                let count = if t == 0 { ip.extended(15)? } else { t } + 3;
                op.literals(&mut ip, count)?;
                state = 4;
                continue;
            } else if state != 4 {
                let next = t & 3;
                let distance = 1 + (t >> 2) + (ip.byte()? << 2);
                (distance, 2, next)
            } else {
                let next = t & 3;
                let distance = 1 + M2_MAX_OFFSET + (t >> 2) + (ip.byte()? << 2);
                (distance, 3, next)
            }
        } else if t >= 64 {
            let next = t & 3;
            let distance = 1 + ((t >> 2) & 7) + (ip.byte()? << 3);
            (distance, (t >> 5) + 1, next)
        } else if t >= 32 {
            let mut len = (t & 31) + 2;
            if len == 2 {
                len = ip.extended(31)? + 2;
            }
            let word = ip.le16()?;
            (1 + (word >> 2), len, word & 3)
        } else {
            let high = (t & 8) << 11;
            let mut len = (t & 7) + 2;
            if len == 2 {
                len = ip.extended(7)? + 2;
            }
            let word = ip.le16()?;
            let distance = high + (word >> 2);
            if distance == 0 {
                // end of stream marker
                if len != 3 {
                    return Err(ArcError::decompression("malformed LZO end marker"));
                }
                break;
            }
            (distance + 0x4000, len, word & 3)
        };
        op.back_ref(distance, len)?;
        state = next;
        op.literals(&mut ip, next)?;
    }
    if ip.pos != input.len() {
        tracing::debug!("{} bytes after LZO end marker", input.len() - ip.pos);
    }
    Ok(op.data)
}

#[test]
fn test_lzo_literal_block() {
    let block = [17 + 3, b'a', b'b', b'c', 0x11, 0, 0];
    assert_eq!(decompress(&block, 16).unwrap(), b"abc");
}

#[test]
fn test_lzo_overlapping_match() {
    // three literals, then an M3 match of 6 bytes at distance 3
    let block = [17 + 3, b'a', b'b', b'c', 0x24, 0x08, 0x00, 0x11, 0, 0];
    assert_eq!(decompress(&block, 16).unwrap(), b"abcabcabc");
}

#[test]
fn test_lzo_rejects_bad_input() {
    // match reaching before the start of the output
    assert!(decompress(&[17 + 1, b'a', 0x24, 0x40, 0x00, 0x11, 0, 0], 16).is_err());
    // truncated block
    assert!(decompress(&[17 + 3, b'a'], 16).is_err());
    // output limit
    assert!(decompress(&[17 + 3, b'a', b'b', b'c', 0x11, 0, 0], 2).is_err());
}
