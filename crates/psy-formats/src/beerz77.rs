//! BEERZ77: the LZ77 variant used for pattern payloads.
//!
//! Layout: one type byte (`0x01`), the decoded size as `u32`, then tokens.
//! Each token starts with an `i16` count. A negative count is followed by
//! `-count` literal bytes. A positive count is followed by a `u16`
//! distance and copies `count` bytes starting `distance` bytes back in the
//! output; source and destination may overlap.

/// Type byte of the only supported variant.
pub const BEERZ77_TYPE: u8 = 0x01;

const HEADER_LEN: usize = 5;
const MIN_MATCH: usize = 6;
const MAX_RUN: usize = i16::MAX as usize;
const WINDOW: usize = u16::MAX as usize;
const HASH_BITS: u32 = 15;
const MAX_CHAIN: usize = 64;
const NONE: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    #[error("unknown compression type {0:#04x}")]
    UnknownType(u8),
    #[error("compressed stream is truncated")]
    Truncated,
    #[error("zero-length token at byte {0}")]
    ZeroToken(usize),
    #[error("back reference of {distance} bytes with only {available} decoded")]
    BadOffset { distance: usize, available: usize },
    #[error("decoded data overruns the declared {0} bytes")]
    Overrun(usize),
    #[error("decoded {actual} bytes, header declares {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

fn hash(data: &[u8], pos: usize) -> usize {
    let v = u32::from(data[pos]) | u32::from(data[pos + 1]) << 8 | u32::from(data[pos + 2]) << 16;
    (v.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

struct Chains {
    head: Vec<usize>,
    prev: Vec<usize>,
}

impl Chains {
    fn new(len: usize) -> Self {
        Self { head: vec![NONE; 1 << HASH_BITS], prev: vec![NONE; len] }
    }

    fn insert(&mut self, data: &[u8], pos: usize) {
        if pos + 3 > data.len() {
            return;
        }
        let h = hash(data, pos);
        self.prev[pos] = self.head[h];
        self.head[h] = pos;
    }

    /// Longest earlier match for `pos` as (length, distance).
    fn longest(&self, data: &[u8], pos: usize) -> (usize, usize) {
        if pos + MIN_MATCH > data.len() {
            return (0, 0);
        }
        let limit = (data.len() - pos).min(MAX_RUN);
        let mut best = (0, 0);
        let mut candidate = self.head[hash(data, pos)];
        let mut steps = 0;
        while candidate != NONE && steps < MAX_CHAIN {
            let distance = pos - candidate;
            if distance > WINDOW {
                break;
            }
            let len = (0..limit).take_while(|&k| data[candidate + k] == data[pos + k]).count();
            if len > best.0 {
                best = (len, distance);
                if len == limit {
                    break;
                }
            }
            candidate = self.prev[candidate];
            steps += 1;
        }
        best
    }
}

fn push_literals(out: &mut Vec<u8>, mut literals: &[u8]) {
    while !literals.is_empty() {
        let n = literals.len().min(MAX_RUN);
        out.extend_from_slice(&(-(n as i16)).to_le_bytes());
        out.extend_from_slice(&literals[..n]);
        literals = &literals[n..];
    }
}

/// Compress `src`. Never fails; incompressible input grows by the header
/// plus two bytes per literal run.
pub fn compress(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 2 + HEADER_LEN + 2);
    out.push(BEERZ77_TYPE);
    out.extend_from_slice(&(src.len() as u32).to_le_bytes());

    let mut chains = Chains::new(src.len());
    let mut literal_start = 0;
    let mut pos = 0;
    while pos < src.len() {
        let (len, distance) = chains.longest(src, pos);
        if len >= MIN_MATCH {
            push_literals(&mut out, &src[literal_start..pos]);
            out.extend_from_slice(&(len as i16).to_le_bytes());
            out.extend_from_slice(&(distance as u16).to_le_bytes());
            for p in pos..pos + len {
                chains.insert(src, p);
            }
            pos += len;
            literal_start = pos;
        } else {
            chains.insert(src, pos);
            pos += 1;
        }
    }
    push_literals(&mut out, &src[literal_start..]);
    out
}

/// Decode a BEERZ77 stream. The result always has the declared size.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if data.len() < HEADER_LEN {
        return Err(CompressionError::Truncated);
    }
    if data[0] != BEERZ77_TYPE {
        return Err(CompressionError::UnknownType(data[0]));
    }
    let expected = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let mut out: Vec<u8> = Vec::with_capacity(expected.min(1 << 24));
    let mut pos = HEADER_LEN;

    while pos < data.len() {
        let token_at = pos;
        let count = data
            .get(pos..pos + 2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .ok_or(CompressionError::Truncated)?;
        pos += 2;
        if count == 0 {
            return Err(CompressionError::ZeroToken(token_at));
        }
        if count < 0 {
            let n = usize::from(count.unsigned_abs());
            let run = data.get(pos..pos + n).ok_or(CompressionError::Truncated)?;
            if out.len() + n > expected {
                return Err(CompressionError::Overrun(expected));
            }
            out.extend_from_slice(run);
            pos += n;
        } else {
            let n = count as usize;
            let distance = data
                .get(pos..pos + 2)
                .map(|b| usize::from(u16::from_le_bytes([b[0], b[1]])))
                .ok_or(CompressionError::Truncated)?;
            pos += 2;
            if distance == 0 || distance > out.len() {
                return Err(CompressionError::BadOffset { distance, available: out.len() });
            }
            if out.len() + n > expected {
                return Err(CompressionError::Overrun(expected));
            }
            let start = out.len() - distance;
            for k in 0..n {
                let b = out[start + k];
                out.push(b);
            }
        }
    }

    if out.len() != expected {
        return Err(CompressionError::SizeMismatch { expected, actual: out.len() });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_pattern_compresses_well() {
        let src: Vec<u8> = [255u8, 255, 255, 0, 0].repeat(64 * 16);
        let packed = compress(&src);
        assert!(packed.len() < 64, "packed to {} bytes", packed.len());
        assert_eq!(decompress(&packed).unwrap(), src);
    }

    #[test]
    fn empty_input() {
        let packed = compress(&[]);
        assert_eq!(packed, vec![BEERZ77_TYPE, 0, 0, 0, 0]);
        assert!(decompress(&packed).unwrap().is_empty());
    }

    #[test]
    fn overlapping_copy() {
        // "ab" then copy 6 bytes from 2 back
        let stream = [1, 8, 0, 0, 0, 0xfe, 0xff, b'a', b'b', 6, 0, 2, 0];
        assert_eq!(decompress(&stream).unwrap(), b"abababab");
    }

    #[test]
    fn rejects_malformed_streams() {
        assert_eq!(decompress(&[2, 0, 0, 0, 0]), Err(CompressionError::UnknownType(2)));
        assert_eq!(decompress(&[1, 1, 0, 0, 0, 0, 0]), Err(CompressionError::ZeroToken(5)));
        assert_eq!(
            decompress(&[1, 4, 0, 0, 0, 4, 0, 1, 0]),
            Err(CompressionError::BadOffset { distance: 1, available: 0 })
        );
        assert_eq!(
            decompress(&[1, 1, 0, 0, 0, 0xfe, 0xff, 1, 2]),
            Err(CompressionError::Overrun(1))
        );
        assert_eq!(
            decompress(&[1, 3, 0, 0, 0, 0xff, 0xff, 9]),
            Err(CompressionError::SizeMismatch { expected: 3, actual: 1 })
        );
        assert_eq!(decompress(&[1, 3, 0, 0, 0, 0xfd, 0xff, 9]), Err(CompressionError::Truncated));
    }
}
