//! Shared primitives for token and request encoding.
//!
//! TDS strings come in two length-prefixed shapes: B_VARCHAR (u8 character
//! count) and US_VARCHAR (u16 character count), both UTF-16LE.

use bytes::{Buf, BufMut};

use crate::error::WireError;

/// Write a string as UTF-16LE code units, no length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, value: &str) {
    for unit in value.encode_utf16() {
        dst.put_u16_le(unit);
    }
}

/// Write a B_VARCHAR: u8 character count followed by UTF-16LE text.
///
/// The caller is responsible for keeping the value under 256 characters.
pub fn write_b_varchar(dst: &mut impl BufMut, value: &str) {
    let count = value.encode_utf16().count();
    debug_assert!(count <= u8::MAX as usize);
    dst.put_u8(count as u8);
    write_utf16_string(dst, value);
}

/// Read `char_count` UTF-16LE code units into a `String`.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, WireError> {
    if src.remaining() < char_count * 2 {
        return Err(WireError::Incomplete {
            expected: char_count * 2,
            actual: src.remaining(),
        });
    }
    let mut units = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        units.push(src.get_u16_le());
    }
    String::from_utf16(&units).map_err(|_| WireError::InvalidUtf16)
}

/// Read a B_VARCHAR: u8 character count followed by UTF-16LE text.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, WireError> {
    if src.remaining() < 1 {
        return Err(WireError::Incomplete {
            expected: 1,
            actual: 0,
        });
    }
    let count = src.get_u8() as usize;
    read_utf16_string(src, count)
}

/// Read a US_VARCHAR: u16 character count followed by UTF-16LE text.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, WireError> {
    if src.remaining() < 2 {
        return Err(WireError::Incomplete {
            expected: 2,
            actual: src.remaining(),
        });
    }
    let count = src.get_u16_le() as usize;
    read_utf16_string(src, count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_b_varchar_roundtrip() {
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, "us_english");

        let mut cursor = buf.as_ref();
        assert_eq!(read_b_varchar(&mut cursor).unwrap(), "us_english");
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_utf16_is_little_endian() {
        let mut buf = BytesMut::new();
        write_utf16_string(&mut buf, "S");
        assert_eq!(&buf[..], &[b'S', 0]);
    }

    #[test]
    fn test_read_us_varchar_short_input() {
        let raw = [5u8, 0, b'a', 0]; // claims 5 chars, carries 1
        let mut cursor = &raw[..];
        assert!(matches!(
            read_us_varchar(&mut cursor),
            Err(WireError::Incomplete { .. })
        ));
    }
}
