//! Raw token stream builders.
//!
//! These helpers assemble the byte-exact token streams a real server
//! would emit, without any session machinery, so tests can script
//! responses down to the bit level.

use bytes::{BufMut, Bytes, BytesMut};
use tds_wire::token::{Done, DoneStatus, EnvChange, EnvChangeKind, EnvValue, LoginAck, ServerError};
use tds_wire::{TokenType, PLP_TERMINATOR, PLP_UNKNOWN_LEN};

/// TDS type id for a 4-byte integer column.
const INT4_TYPE: u8 = 0x38;

/// Builder for a server token stream.
#[derive(Debug, Default)]
pub struct TokenStreamBuilder {
    buf: BytesMut,
}

impl TokenStreamBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish and take the accumulated bytes.
    #[must_use]
    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }

    /// Append raw pre-encoded bytes.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Append a BeginTransaction env-change carrying `descriptor`.
    #[must_use]
    pub fn env_begin_transaction(mut self, descriptor: u64) -> Self {
        EnvChange {
            kind: EnvChangeKind::BeginTransaction,
            new_value: EnvValue::Binary(Bytes::copy_from_slice(&descriptor.to_le_bytes())),
            old_value: EnvValue::Binary(Bytes::new()),
        }
        .encode(&mut self.buf);
        self
    }

    /// Append a CommitTransaction env-change.
    #[must_use]
    pub fn env_commit_transaction(mut self) -> Self {
        EnvChange {
            kind: EnvChangeKind::CommitTransaction,
            new_value: EnvValue::Binary(Bytes::new()),
            old_value: EnvValue::Binary(Bytes::new()),
        }
        .encode(&mut self.buf);
        self
    }

    /// Append a RollbackTransaction env-change.
    #[must_use]
    pub fn env_rollback_transaction(mut self) -> Self {
        EnvChange {
            kind: EnvChangeKind::RollbackTransaction,
            new_value: EnvValue::Binary(Bytes::new()),
            old_value: EnvValue::Binary(Bytes::new()),
        }
        .encode(&mut self.buf);
        self
    }

    /// Append a PacketSize env-change.
    #[must_use]
    pub fn env_packet_size(mut self, size: usize) -> Self {
        let text = size.to_string();
        EnvChange {
            kind: EnvChangeKind::PacketSize,
            new_value: EnvValue::String(text.clone()),
            old_value: EnvValue::String(text),
        }
        .encode(&mut self.buf);
        self
    }

    /// Append a Language env-change.
    #[must_use]
    pub fn env_language(mut self, language: &str) -> Self {
        EnvChange {
            kind: EnvChangeKind::Language,
            new_value: EnvValue::String(language.to_string()),
            old_value: EnvValue::String(String::new()),
        }
        .encode(&mut self.buf);
        self
    }

    /// Append a LOGINACK token.
    #[must_use]
    pub fn login_ack(mut self) -> Self {
        LoginAck {
            interface: 1,
            tds_version: 0x7400_0004,
            prog_name: "Microsoft SQL Server".to_string(),
            prog_version: 0x1000_0000,
        }
        .encode(&mut self.buf);
        self
    }

    /// Append a COLMETADATA token describing one INT4 column.
    #[must_use]
    pub fn colmetadata_int(mut self, name: &str) -> Self {
        self.buf.put_u8(TokenType::ColMetaData as u8);
        self.buf.put_u16_le(1); // column count
        self.buf.put_u32_le(0); // user type
        self.buf.put_u16_le(0); // flags
        self.buf.put_u8(INT4_TYPE);
        let chars: Vec<u16> = name.encode_utf16().collect();
        self.buf.put_u8(chars.len() as u8);
        for unit in chars {
            self.buf.put_u16_le(unit);
        }
        self
    }

    /// Append a ROW token with one INT4 value.
    #[must_use]
    pub fn row_int(mut self, value: i32) -> Self {
        self.buf.put_u8(TokenType::Row as u8);
        self.buf.put_i32_le(value);
        self
    }

    /// Append a DONE token with a valid row count.
    #[must_use]
    pub fn done(mut self, row_count: u64) -> Self {
        Done {
            status: DoneStatus {
                count: true,
                ..DoneStatus::default()
            },
            cur_cmd: 0,
            row_count,
        }
        .encode(&mut self.buf);
        self
    }

    /// Append a DONE token with the attention-acknowledgment bit.
    #[must_use]
    pub fn done_attention(mut self) -> Self {
        Done {
            status: DoneStatus {
                attn: true,
                ..DoneStatus::default()
            },
            cur_cmd: 0,
            row_count: 0,
        }
        .encode(&mut self.buf);
        self
    }

    /// Append an ERROR token.
    #[must_use]
    pub fn error(mut self, number: i32, class: u8, message: &str) -> Self {
        ServerError {
            number,
            state: 1,
            class,
            message: message.to_string(),
            server: "mock".to_string(),
            procedure: String::new(),
            line: 1,
        }
        .encode(&mut self.buf);
        self
    }

    /// Append the 8-byte PLP header declaring an unknown total length.
    #[must_use]
    pub fn plp_unknown_header(mut self) -> Self {
        self.buf.put_u64_le(PLP_UNKNOWN_LEN);
        self
    }

    /// Append the 8-byte PLP header declaring a known total length.
    #[must_use]
    pub fn plp_known_header(mut self, total: u64) -> Self {
        self.buf.put_u64_le(total);
        self
    }

    /// Append one PLP chunk (length prefix plus data).
    #[must_use]
    pub fn plp_chunk(mut self, data: &[u8]) -> Self {
        self.buf.put_u32_le(data.len() as u32);
        self.buf.put_slice(data);
        self
    }

    /// Append the PLP stream terminator.
    #[must_use]
    pub fn plp_terminator(mut self) -> Self {
        self.buf.put_u32_le(PLP_TERMINATOR);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_row_int_layout() {
        let stream = TokenStreamBuilder::new().row_int(1).build();
        assert_eq!(&stream[..], &[0xD1, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_done_layout() {
        let stream = TokenStreamBuilder::new().done(1).build();
        assert_eq!(stream[0], 0xFD);
        assert_eq!(u16::from_le_bytes([stream[1], stream[2]]), 0x0010); // DONE_COUNT
        assert_eq!(u64::from_le_bytes(stream[5..13].try_into().unwrap()), 1);
    }

    #[test]
    fn test_begin_transaction_descriptor_roundtrip() {
        let stream = TokenStreamBuilder::new()
            .env_begin_transaction(0xAB)
            .build();
        assert_eq!(stream[0], 0xE3);
        let mut cursor = &stream[3..];
        let env = EnvChange::decode_body(&mut cursor).unwrap();
        assert_eq!(env.transaction_descriptor(), Some(0xAB));
    }
}
