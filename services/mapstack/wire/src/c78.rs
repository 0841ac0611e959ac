//! Code78 codec.
//!
//! Two related encodings share the same byte convention: bit 7 set means
//! "more bytes follow", bit 7 clear marks the last byte.
//!
//! - Integer fields: 7-bit groups, most significant first. Used for MAP
//!   next-protocol and address fields.
//! - Byte-stream escaping ([`C78Encoder`]/[`C78Decoder`]): every 7 raw bytes
//!   become 8 encoded bytes, so arbitrary data never carries a clear MSB
//!   until the terminating byte.

use crate::error::C78Error;
use bytes::BufMut;

/// Longest encoding of a `u32` field
pub const C78_MAX_LEN: usize = 5;

const CONTINUATION: u8 = 0x80;
const GROUP_MASK: u8 = 0x7F;

/// Whether an encoded byte terminates its field
#[inline]
pub const fn is_last_byte(byte: u8) -> bool {
    byte & CONTINUATION == 0
}

/// Inline encoding of one integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct C78Bytes {
    buf: [u8; C78_MAX_LEN],
    len: u8,
}

impl C78Bytes {
    /// Encode an unsigned value with the minimal group count
    pub fn unsigned(value: u32) -> Self {
        let mut groups = 1;
        while groups < C78_MAX_LEN && value >> (7 * groups) != 0 {
            groups += 1;
        }

        let mut buf = [0u8; C78_MAX_LEN];
        for (i, slot) in buf.iter_mut().take(groups).enumerate() {
            let shift = 7 * (groups - 1 - i);
            let mut byte = ((value >> shift) as u8) & GROUP_MASK;
            if i + 1 < groups {
                byte |= CONTINUATION;
            }
            *slot = byte;
        }

        Self {
            buf,
            len: groups as u8,
        }
    }

    /// Encode a signed value via the zig-zag mapping
    pub fn signed(value: i32) -> Self {
        Self::unsigned(zigzag(value))
    }

    /// Encoded bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Encoded length
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Always false; zero encodes as one byte
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn zigzag(value: i32) -> u32 {
    if value < 0 {
        (!(value as u32) << 1) | 1
    } else {
        (value as u32) << 1
    }
}

fn unzigzag(value: u32) -> i32 {
    if value & 1 != 0 {
        !(value >> 1) as i32
    } else {
        (value >> 1) as i32
    }
}

/// Write an unsigned field
pub fn sink_c78<B: BufMut>(out: &mut B, value: u32) {
    out.put_slice(C78Bytes::unsigned(value).as_slice());
}

/// Write a signed field
pub fn sink_c78_signed<B: BufMut>(out: &mut B, value: i32) {
    out.put_slice(C78Bytes::signed(value).as_slice());
}

/// Read an unsigned field starting at `cursor`.
///
/// Returns the value and the cursor just past the terminating byte.
pub fn source_c78(bytes: &[u8], cursor: usize) -> Result<(u32, usize), C78Error> {
    let mut value: u32 = 0;
    let mut pos = cursor;
    loop {
        let byte = *bytes.get(pos).ok_or(C78Error::Truncated)?;
        if value >> 25 != 0 {
            return Err(C78Error::Overflow);
        }
        value = (value << 7) | (byte & GROUP_MASK) as u32;
        pos += 1;
        if is_last_byte(byte) {
            return Ok((value, pos));
        }
    }
}

/// Read a signed field starting at `cursor`
pub fn source_c78_signed(bytes: &[u8], cursor: usize) -> Result<(i32, usize), C78Error> {
    let (value, next) = source_c78(bytes, cursor)?;
    Ok((unzigzag(value), next))
}

/// Position just past the field starting at `cursor`, if it terminates in bounds
pub fn skip_c78(bytes: &[u8], cursor: usize) -> Option<usize> {
    let rest = bytes.get(cursor..)?;
    rest.iter()
        .position(|&b| is_last_byte(b))
        .map(|i| cursor + i + 1)
}

const FIRST_BYTE: u8 = 0x80;

/// Streaming byte escaper.
///
/// Holds one byte of look-behind, since a byte cannot be emitted until it is
/// known whether another follows.
#[derive(Debug, Clone)]
pub struct C78Encoder {
    bit_pos: u8,
    older: u8,
    newer: u8,
}

impl C78Encoder {
    /// Create an encoder awaiting its first byte
    pub fn new() -> Self {
        Self {
            bit_pos: FIRST_BYTE,
            older: 0,
            newer: 0,
        }
    }

    /// Drop any pending state
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Escape one byte
    pub fn sink_data<B: BufMut>(&mut self, byte: u8, out: &mut B) {
        if self.bit_pos == FIRST_BYTE {
            self.older = 0;
            self.newer = byte;
            self.bit_pos = 0;
            return;
        }

        self.bit_pos += 1;
        let mask = 0xFFu8 >> self.bit_pos;
        out.put_u8(CONTINUATION | self.older | (self.newer & mask));

        if self.bit_pos == 7 {
            out.put_u8(CONTINUATION | (self.newer >> 1));
            self.older = 0;
            self.bit_pos = 0;
        } else {
            self.older = (self.newer & !mask) >> 1;
        }
        self.newer = byte;
    }

    /// Escape a slice; the stream stays open
    pub fn sink_array<B: BufMut>(&mut self, bytes: &[u8], out: &mut B) {
        for &byte in bytes {
            self.sink_data(byte, out);
        }
    }

    /// Escape the minimal little-endian bytes of `value`; the stream stays open
    pub fn sink_u32<B: BufMut>(&mut self, mut value: u32, out: &mut B) {
        while value > 0 {
            self.sink_data((value & 0xFF) as u8, out);
            value >>= 8;
        }
    }

    /// Flush pending bytes and terminate the stream
    pub fn end_of_data<B: BufMut>(&mut self, out: &mut B) {
        match self.bit_pos {
            FIRST_BYTE => out.put_u8(0x00),
            0 => {
                if self.newer > 0 && self.newer < 0x80 {
                    out.put_u8(self.newer);
                } else {
                    out.put_u8(CONTINUATION | (self.newer & GROUP_MASK));
                    out.put_u8((self.newer & 0x80) >> 1);
                }
            }
            bit_pos => {
                let mask = GROUP_MASK >> bit_pos;
                let low = self.newer & mask;
                if low > 0 && low == self.newer {
                    out.put_u8(self.older | low);
                } else {
                    out.put_u8(CONTINUATION | self.older | low);
                    out.put_u8((self.newer & !mask) >> 1);
                }
            }
        }
        self.reset();
    }

    /// Escape a complete byte string
    pub fn encode(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 7 + 2);
        let mut encoder = Self::new();
        encoder.sink_array(bytes, &mut out);
        encoder.end_of_data(&mut out);
        out
    }
}

impl Default for C78Encoder {
    fn default() -> Self {
        Self::new()
    }
}

const DATA_MASK_INITIAL: u8 = 0x7F;

/// Streaming inverse of [`C78Encoder`]
#[derive(Debug, Clone)]
pub struct C78Decoder {
    data_mask: u8,
    pending: u8,
}

impl C78Decoder {
    /// Create a decoder at a stream boundary
    pub fn new() -> Self {
        Self {
            data_mask: DATA_MASK_INITIAL,
            pending: 0,
        }
    }

    /// Drop any pending state
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consume one encoded byte; returns true when it terminated the stream
    pub fn sink_data<B: BufMut>(&mut self, byte: u8, out: &mut B) -> bool {
        if self.data_mask < DATA_MASK_INITIAL {
            self.pending |= (byte & !self.data_mask) << 1;
            out.put_u8(self.pending);
        }

        if is_last_byte(byte) {
            let low = byte & self.data_mask;
            if low != 0 {
                out.put_u8(low);
            }
            self.reset();
            return true;
        }

        self.pending = byte & self.data_mask;
        self.data_mask = if self.data_mask == 0 {
            DATA_MASK_INITIAL
        } else {
            self.data_mask >> 1
        };
        false
    }

    /// Decode one complete stream, ignoring anything after its terminator
    pub fn decode(encoded: &[u8]) -> Result<Vec<u8>, C78Error> {
        let mut out = Vec::with_capacity(encoded.len());
        let mut decoder = Self::new();
        for &byte in encoded {
            if decoder.sink_data(byte, &mut out) {
                return Ok(out);
            }
        }
        Err(C78Error::Truncated)
    }
}

impl Default for C78Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_u32(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        sink_c78(&mut out, value);
        out
    }

    #[test]
    fn test_unsigned_encoding() {
        assert_eq!(encode_u32(0), vec![0x00]);
        assert_eq!(encode_u32(5), vec![0x05]);
        assert_eq!(encode_u32(0x7F), vec![0x7F]);
        assert_eq!(encode_u32(0x80), vec![0x81, 0x00]);
        assert_eq!(encode_u32(0x3FFF), vec![0xFF, 0x7F]);
        assert_eq!(encode_u32(u32::MAX), vec![0x8F, 0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_unsigned_round_trip() {
        let values = [
            0u32,
            1,
            127,
            128,
            255,
            16_383,
            16_384,
            2_097_151,
            2_097_152,
            0x0FFF_FFFF,
            0x1000_0000,
            u32::MAX - 1,
            u32::MAX,
        ];
        for value in values {
            let encoded = encode_u32(value);
            assert_eq!(source_c78(&encoded, 0), Ok((value, encoded.len())));
        }
    }

    #[test]
    fn test_signed_round_trip() {
        for value in [0i32, 1, -1, 63, -64, 64, -65, i32::MAX, i32::MIN] {
            let mut out = Vec::new();
            sink_c78_signed(&mut out, value);
            assert_eq!(source_c78_signed(&out, 0), Ok((value, out.len())));
        }
        assert_eq!(C78Bytes::signed(-1).as_slice(), &[0x01]);
        assert_eq!(C78Bytes::signed(0).as_slice(), &[0x00]);
        assert_eq!(C78Bytes::signed(1).as_slice(), &[0x02]);
    }

    #[test]
    fn test_source_errors() {
        assert_eq!(source_c78(&[], 0), Err(C78Error::Truncated));
        assert_eq!(source_c78(&[0x81, 0x82], 0), Err(C78Error::Truncated));
        assert_eq!(source_c78(&[0x05], 1), Err(C78Error::Truncated));
        assert_eq!(
            source_c78(&[0x9F, 0xFF, 0xFF, 0xFF, 0x7F], 0),
            Err(C78Error::Overflow)
        );
        assert_eq!(
            source_c78(&[0x81, 0x80, 0x80, 0x80, 0x80, 0x00], 0),
            Err(C78Error::Overflow)
        );
    }

    #[test]
    fn test_source_at_cursor() {
        let bytes = [0xAA, 0x81, 0x00, 0x07];
        assert_eq!(source_c78(&bytes, 1), Ok((0x80, 3)));
        assert_eq!(source_c78(&bytes, 3), Ok((7, 4)));
    }

    #[test]
    fn test_skip() {
        assert_eq!(skip_c78(&[0x81, 0x82, 0x03, 0x04], 0), Some(3));
        assert_eq!(skip_c78(&[0x81, 0x82], 0), None);
        assert_eq!(skip_c78(&[0x01], 1), None);
        assert_eq!(skip_c78(&[0x01], 5), None);
    }

    #[test]
    fn test_stream_known_encodings() {
        assert_eq!(C78Encoder::encode(&[]), vec![0x00]);
        assert_eq!(C78Encoder::encode(&[0x41]), vec![0x41]);
        assert_eq!(C78Encoder::encode(&[0x00]), vec![0x80, 0x00]);
        assert_eq!(C78Encoder::encode(&[0xFF]), vec![0xFF, 0x40]);
        // 7 input bytes fill 8 output bytes before the tail
        let encoded = C78Encoder::encode(&[0xFF; 8]);
        assert_eq!(encoded.len(), 10);
        assert!(encoded[..9].iter().all(|&b| !is_last_byte(b)));
        assert!(is_last_byte(encoded[9]));
    }

    #[test]
    fn test_stream_round_trip() {
        let mut inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x80],
            vec![0x01, 0x00],
            vec![0x7F; 7],
            vec![0x00; 14],
        ];
        inputs.push((0..=255u8).collect());
        for len in 1..=16usize {
            inputs.push((0..len).map(|i| (i as u8).wrapping_mul(37) ^ 0x5A).collect());
            inputs.push((0..len).map(|i| if i == len - 1 { 1 } else { 0x80 }).collect());
        }

        for input in inputs {
            let encoded = C78Encoder::encode(&input);
            assert!(is_last_byte(*encoded.last().unwrap()));
            assert_eq!(
                encoded.iter().filter(|&&b| is_last_byte(b)).count(),
                1,
                "input {:?}",
                input
            );
            assert_eq!(C78Decoder::decode(&encoded).unwrap(), input);
        }
    }

    #[test]
    fn test_stream_compression() {
        // low-valued final byte folds into the terminator
        for len in 1..=7usize {
            let mut input = vec![0xC3; len - 1];
            input.push(0x01);
            let compressed = C78Encoder::encode(&input);
            let mut uncompressed_input = input.clone();
            *uncompressed_input.last_mut().unwrap() = 0xFE;
            let uncompressed = C78Encoder::encode(&uncompressed_input);
            assert_eq!(compressed.len() + 1, uncompressed.len());
        }
    }

    #[test]
    fn test_sink_u32() {
        let mut out = Vec::new();
        let mut encoder = C78Encoder::new();
        encoder.sink_u32(0x0102, &mut out);
        encoder.end_of_data(&mut out);
        assert_eq!(C78Decoder::decode(&out).unwrap(), vec![0x02, 0x01]);

        let mut zero = Vec::new();
        encoder.sink_u32(0, &mut zero);
        encoder.end_of_data(&mut zero);
        assert_eq!(zero, vec![0x00]);
    }

    #[test]
    fn test_decoder_truncated() {
        assert_eq!(C78Decoder::decode(&[0x81, 0x82]), Err(C78Error::Truncated));
    }
}
