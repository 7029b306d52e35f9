//! Transaction manager request encoding.
//!
//! Transaction control rides on packet type 0x0E. The payload is the
//! ALL_HEADERS section, a u16 request type, then a request-specific body
//! (MS-TDS 2.2.6.9).

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_b_varchar;
use crate::headers::write_all_headers;

/// Transaction manager request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TmRequestKind {
    /// TM_BEGIN_XACT.
    Begin = 5,
    /// TM_PROMOTE_XACT.
    Promote = 6,
    /// TM_COMMIT_XACT.
    Commit = 7,
    /// TM_ROLLBACK_XACT.
    Rollback = 8,
    /// TM_SAVE_XACT.
    Save = 9,
}

impl TmRequestKind {
    /// Create a request kind from the raw wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            5 => Some(Self::Begin),
            6 => Some(Self::Promote),
            7 => Some(Self::Commit),
            8 => Some(Self::Rollback),
            9 => Some(Self::Save),
            _ => None,
        }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (dirty reads allowed).
    ReadUncommitted,
    /// Read committed (SQL Server default).
    #[default]
    ReadCommitted,
    /// Repeatable read.
    RepeatableRead,
    /// Serializable (highest isolation).
    Serializable,
    /// Snapshot isolation (row versioning).
    Snapshot,
}

impl IsolationLevel {
    /// Wire value used in the TM_BEGIN_XACT body.
    #[must_use]
    pub fn wire_value(self) -> u8 {
        match self {
            Self::ReadUncommitted => 1,
            Self::ReadCommitted => 2,
            Self::RepeatableRead => 3,
            Self::Serializable => 4,
            Self::Snapshot => 5,
        }
    }

    /// Isolation level name as used by SQL Server.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

fn tm_payload(
    descriptor: u64,
    request_count: u32,
    kind: TmRequestKind,
    body: impl FnOnce(&mut BytesMut),
) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    write_all_headers(&mut buf, descriptor, request_count);
    buf.put_u16_le(kind as u16);
    body(&mut buf);
    buf.freeze()
}

/// Encode a TM_BEGIN_XACT request payload.
#[must_use]
pub fn encode_begin_request(
    descriptor: u64,
    request_count: u32,
    isolation: IsolationLevel,
) -> Bytes {
    tm_payload(descriptor, request_count, TmRequestKind::Begin, |buf| {
        buf.put_u8(isolation.wire_value());
        buf.put_u8(0); // unnamed transaction
    })
}

/// Encode a TM_COMMIT_XACT request payload.
#[must_use]
pub fn encode_commit_request(descriptor: u64, request_count: u32) -> Bytes {
    tm_payload(descriptor, request_count, TmRequestKind::Commit, |buf| {
        buf.put_u8(0); // unnamed transaction
        buf.put_u8(0); // no nested begin
    })
}

/// Encode a TM_ROLLBACK_XACT request payload.
///
/// With `name`, rolls back to the named savepoint; without, rolls back the
/// whole transaction. Name validation (non-empty) is the caller's business.
#[must_use]
pub fn encode_rollback_request(descriptor: u64, request_count: u32, name: Option<&str>) -> Bytes {
    tm_payload(descriptor, request_count, TmRequestKind::Rollback, |buf| {
        write_b_varchar(buf, name.unwrap_or(""));
        buf.put_u8(0); // no nested begin
    })
}

/// Encode a TM_SAVE_XACT request payload.
#[must_use]
pub fn encode_save_request(descriptor: u64, request_count: u32, name: &str) -> Bytes {
    tm_payload(descriptor, request_count, TmRequestKind::Save, |buf| {
        write_b_varchar(buf, name);
    })
}

/// Read the request kind back out of an encoded TM payload.
///
/// Used by test tooling to dispatch scripted responses.
#[must_use]
pub fn peek_request_kind(payload: &[u8]) -> Option<TmRequestKind> {
    // ALL_HEADERS total length is the first u32
    let headers_len = u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?) as usize;
    let raw = u16::from_le_bytes(
        payload
            .get(headers_len..headers_len + 2)?
            .try_into()
            .ok()?,
    );
    TmRequestKind::from_u16(raw)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::headers::ALL_HEADERS_LEN;

    #[test]
    fn test_begin_request_layout() {
        let payload = encode_begin_request(0, 1, IsolationLevel::Serializable);
        assert_eq!(
            &payload[ALL_HEADERS_LEN..ALL_HEADERS_LEN + 2],
            &[5, 0] // TM_BEGIN_XACT
        );
        assert_eq!(payload[ALL_HEADERS_LEN + 2], 4); // serializable
        assert_eq!(payload[ALL_HEADERS_LEN + 3], 0); // unnamed
    }

    #[test]
    fn test_commit_carries_descriptor() {
        let payload = encode_commit_request(0xAB, 1);
        assert_eq!(&payload[10..18], &[0xAB, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(peek_request_kind(&payload), Some(TmRequestKind::Commit));
    }

    #[test]
    fn test_save_request_name() {
        let payload = encode_save_request(0xAB, 1, "sp1");
        assert_eq!(peek_request_kind(&payload), Some(TmRequestKind::Save));
        // name begins right after the u16 request type
        let name_at = ALL_HEADERS_LEN + 2;
        assert_eq!(payload[name_at], 3); // char count
        assert_eq!(payload[name_at + 1], b's');
    }

    #[test]
    fn test_peek_request_kind_rejects_garbage() {
        assert_eq!(peek_request_kind(&[1, 2]), None);
    }

    #[test]
    fn test_isolation_wire_values() {
        assert_eq!(IsolationLevel::ReadUncommitted.wire_value(), 1);
        assert_eq!(IsolationLevel::Snapshot.wire_value(), 5);
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}
