//! Pluggable size-prefix codecs for entry encoding
//!
//! Every entry begins with a size prefix followed immediately by the key
//! bytes. The codec used for that prefix is supplied through the table
//! configuration; the storage core never assumes a particular encoding
//! beyond "decodable from the entry's first bytes".

use crate::error::{Result, SegMapError};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Encoder/decoder for the variable-length size prefix of an entry.
pub trait SizeCodec: fmt::Debug + Send + Sync {
    /// Upper bound on the encoded length of any value.
    fn max_encoded_len(&self) -> usize;

    /// Encoded length of a specific value.
    fn encoded_len(&self, value: u64) -> usize;

    /// Encode `value` into the front of `buf`, returning the bytes written.
    ///
    /// `buf` must be at least `encoded_len(value)` bytes.
    fn write(&self, buf: &mut [u8], value: u64) -> usize;

    /// Decode a value from the front of `buf`, returning `(value, bytes consumed)`.
    fn read(&self, buf: &[u8]) -> Result<(u64, usize)>;
}

/// Stop-bit encoding: 7 bits per byte, high bit set while more bytes follow.
///
/// Small keys pay a single prefix byte; the encoding caps at 10 bytes for
/// the full `u64` range.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopBitCodec;

impl SizeCodec for StopBitCodec {
    fn max_encoded_len(&self) -> usize {
        10
    }

    fn encoded_len(&self, value: u64) -> usize {
        let mut len = 1;
        let mut v = value;
        while v >= 0x80 {
            v >>= 7;
            len += 1;
        }
        len
    }

    fn write(&self, buf: &mut [u8], value: u64) -> usize {
        let mut v = value;
        let mut i = 0;
        while v >= 0x80 {
            buf[i] = (v as u8 & 0x7f) | 0x80;
            v >>= 7;
            i += 1;
        }
        buf[i] = v as u8;
        i + 1
    }

    fn read(&self, buf: &[u8]) -> Result<(u64, usize)> {
        let mut value = 0u64;
        let mut shift = 0u32;
        for (i, &b) in buf.iter().enumerate() {
            if i >= self.max_encoded_len() {
                break;
            }
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok((value, i + 1));
            }
            shift += 7;
        }
        Err(SegMapError::InvalidFormat(
            "unterminated stop-bit size prefix".into(),
        ))
    }
}

/// Fixed-width 4-byte little-endian prefix.
///
/// Wastes a few bytes per entry but keeps the key offset constant, which
/// simplifies external tooling that inspects the entry space directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedU32Codec;

impl SizeCodec for FixedU32Codec {
    fn max_encoded_len(&self) -> usize {
        4
    }

    fn encoded_len(&self, _value: u64) -> usize {
        4
    }

    fn write(&self, buf: &mut [u8], value: u64) -> usize {
        debug_assert!(value <= u64::from(u32::MAX));
        LittleEndian::write_u32(buf, value as u32);
        4
    }

    fn read(&self, buf: &[u8]) -> Result<(u64, usize)> {
        if buf.len() < 4 {
            return Err(SegMapError::InvalidFormat(
                "truncated fixed-width size prefix".into(),
            ));
        }
        Ok((u64::from(LittleEndian::read_u32(buf)), 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_bit_round_trip() {
        let codec = StopBitCodec;
        let mut buf = [0u8; 10];
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let written = codec.write(&mut buf, value);
            assert_eq!(written, codec.encoded_len(value));
            let (decoded, consumed) = codec.read(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_stop_bit_single_byte_for_small_values() {
        let codec = StopBitCodec;
        assert_eq!(codec.encoded_len(0), 1);
        assert_eq!(codec.encoded_len(127), 1);
        assert_eq!(codec.encoded_len(128), 2);
    }

    #[test]
    fn test_stop_bit_unterminated() {
        let codec = StopBitCodec;
        let buf = [0x80u8; 3];
        assert!(codec.read(&buf).is_err());
    }

    #[test]
    fn test_fixed_u32_round_trip() {
        let codec = FixedU32Codec;
        let mut buf = [0u8; 4];
        codec.write(&mut buf, 0xdead);
        let (decoded, consumed) = codec.read(&buf).unwrap();
        assert_eq!(decoded, 0xdead);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_fixed_u32_truncated() {
        let codec = FixedU32Codec;
        assert!(codec.read(&[1, 2]).is_err());
    }
}
