//! ALL_HEADERS request prefix and SQL batch payload encoding.
//!
//! Per MS-TDS, every TDS 7.2+ request payload opens with an ALL_HEADERS
//! section. The transaction descriptor header carries the descriptor issued
//! by the server's BeginTransaction environment change (0 in auto-commit)
//! and the session's outstanding request count, which is how a MARS session
//! rides its transaction identity on every request packet.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;

/// Encoded length of the ALL_HEADERS section with one transaction header.
pub const ALL_HEADERS_LEN: usize = 22;

/// Write the ALL_HEADERS section to `dst`.
///
/// Layout: u32 total length, then the transaction descriptor header
/// (u32 header length = 18, u16 header type = 0x0002, u64 descriptor,
/// u32 outstanding request count). All fields little-endian.
pub fn write_all_headers(dst: &mut BytesMut, transaction_descriptor: u64, request_count: u32) {
    let start = dst.len();
    dst.put_u32_le(0); // total length backfilled below

    dst.put_u32_le(18);
    dst.put_u16_le(0x0002);
    dst.put_u64_le(transaction_descriptor);
    dst.put_u32_le(request_count);

    let total = (dst.len() - start) as u32;
    dst[start..start + 4].copy_from_slice(&total.to_le_bytes());
}

/// Encode a SQL batch request payload.
///
/// The payload is the ALL_HEADERS section followed by the SQL text in
/// UTF-16LE. `transaction_descriptor` must be the value issued by the
/// server's BeginTransaction environment change, or 0 for auto-commit.
#[must_use]
pub fn encode_sql_batch(sql: &str, transaction_descriptor: u64, request_count: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + sql.len() * 2);
    write_all_headers(&mut buf, transaction_descriptor, request_count);
    write_utf16_string(&mut buf, sql);
    buf.freeze()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_all_headers_layout() {
        let mut buf = BytesMut::new();
        write_all_headers(&mut buf, 0x00000000000000AB, 1);

        assert_eq!(buf.len(), ALL_HEADERS_LEN);
        assert_eq!(&buf[0..4], &[22, 0, 0, 0]); // total length
        assert_eq!(&buf[4..8], &[18, 0, 0, 0]); // header length
        assert_eq!(&buf[8..10], &[0x02, 0x00]); // transaction descriptor type
        assert_eq!(&buf[10..18], &[0xAB, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[18..22], &[1, 0, 0, 0]); // request count
    }

    #[test]
    fn test_encode_sql_batch() {
        let payload = encode_sql_batch("SELECT 1", 0, 1);

        // ALL_HEADERS + 8 UTF-16 code units
        assert_eq!(payload.len(), ALL_HEADERS_LEN + 16);
        assert_eq!(payload[ALL_HEADERS_LEN], b'S');
        assert_eq!(payload[ALL_HEADERS_LEN + 1], 0);
        assert_eq!(payload[ALL_HEADERS_LEN + 2], b'E');
    }

    #[test]
    fn test_empty_batch_still_carries_headers() {
        let payload = encode_sql_batch("", 0, 1);
        assert_eq!(payload.len(), ALL_HEADERS_LEN);
    }
}
