//! The token subset consumed by the session core.
//!
//! The full token vocabulary (column metadata, row decoding, return values)
//! belongs to the response parser that sits above the session engine. The
//! engine itself only interprets the tokens that change session state:
//! completion tokens (DONE family), environment changes, server errors and
//! informational messages, and the login acknowledgment.

use bytes::{Buf, BufMut, Bytes};

use crate::codec::{read_b_varchar, read_us_varchar, write_b_varchar, write_utf16_string};
use crate::error::WireError;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Column ordering (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x81 => Some(Self::ColMetaData),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAD => Some(Self::LoginAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }
}

/// Done token status flag bit positions.
mod done_status_bits {
    pub const DONE_MORE: u16 = 0x0001;
    pub const DONE_ERROR: u16 = 0x0002;
    pub const DONE_INXACT: u16 = 0x0004;
    pub const DONE_COUNT: u16 = 0x0010;
    pub const DONE_ATTN: u16 = 0x0020;
    pub const DONE_SRVERROR: u16 = 0x0100;
}

/// Done status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneStatus {
    /// More results follow.
    pub more: bool,
    /// Error occurred.
    pub error: bool,
    /// Transaction in progress.
    pub in_xact: bool,
    /// Row count is valid.
    pub count: bool,
    /// Attention acknowledgment.
    pub attn: bool,
    /// Server error caused statement termination.
    pub srverror: bool,
}

impl DoneStatus {
    /// Parse done status from raw bits.
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        use done_status_bits::*;
        Self {
            more: (bits & DONE_MORE) != 0,
            error: (bits & DONE_ERROR) != 0,
            in_xact: (bits & DONE_INXACT) != 0,
            count: (bits & DONE_COUNT) != 0,
            attn: (bits & DONE_ATTN) != 0,
            srverror: (bits & DONE_SRVERROR) != 0,
        }
    }

    /// Convert to raw bits.
    #[must_use]
    pub fn to_bits(&self) -> u16 {
        use done_status_bits::*;
        let mut bits = 0u16;
        if self.more {
            bits |= DONE_MORE;
        }
        if self.error {
            bits |= DONE_ERROR;
        }
        if self.in_xact {
            bits |= DONE_INXACT;
        }
        if self.count {
            bits |= DONE_COUNT;
        }
        if self.attn {
            bits |= DONE_ATTN;
        }
        if self.srverror {
            bits |= DONE_SRVERROR;
        }
        bits
    }
}

/// Done token indicating statement completion.
#[derive(Debug, Clone, Copy)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count (valid when `status.count` is set).
    pub row_count: u64,
}

impl Done {
    /// Size of the DONE token body in bytes (excluding the token type byte).
    pub const SIZE: usize = 12;

    /// Decode a DONE token body from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < Self::SIZE {
            return Err(WireError::Incomplete {
                expected: Self::SIZE,
                actual: src.remaining(),
            });
        }

        let status = DoneStatus::from_bits(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = src.get_u64_le();

        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode the DONE token (including the token type byte).
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::Done as u8);
        dst.put_u16_le(self.status.to_bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Check if this DONE acknowledges an attention request.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.attn
    }

    /// Check if more results follow this DONE token.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.more
    }
}

/// Environment change sub-code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvChangeKind {
    /// Database context changed.
    Database = 1,
    /// Language changed.
    Language = 2,
    /// Negotiated packet size changed.
    PacketSize = 4,
    /// Local transaction begun; new value carries the descriptor.
    BeginTransaction = 8,
    /// Local transaction committed.
    CommitTransaction = 9,
    /// Local transaction rolled back.
    RollbackTransaction = 10,
    /// Distributed transaction begun (DTC enlistment).
    DistributedTransactionBegin = 11,
    /// Transaction defected from DTC.
    DefectTransaction = 12,
    /// Local transaction promoted to distributed.
    PromoteTransaction = 15,
}

impl EnvChangeKind {
    /// Create an environment change kind from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Database),
            2 => Some(Self::Language),
            4 => Some(Self::PacketSize),
            8 => Some(Self::BeginTransaction),
            9 => Some(Self::CommitTransaction),
            10 => Some(Self::RollbackTransaction),
            11 => Some(Self::DistributedTransactionBegin),
            12 => Some(Self::DefectTransaction),
            15 => Some(Self::PromoteTransaction),
            _ => None,
        }
    }

    /// Check if this kind carries binary (descriptor) values.
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::BeginTransaction
                | Self::CommitTransaction
                | Self::RollbackTransaction
                | Self::DistributedTransactionBegin
                | Self::DefectTransaction
                | Self::PromoteTransaction
        )
    }
}

/// Environment change value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// Length-prefixed binary value (transaction descriptors).
    Binary(Bytes),
    /// B_VARCHAR string value.
    String(String),
}

/// Environment change token.
#[derive(Debug, Clone)]
pub struct EnvChange {
    /// Sub-code of the change.
    pub kind: EnvChangeKind,
    /// New value.
    pub new_value: EnvValue,
    /// Old value.
    pub old_value: EnvValue,
}

impl EnvChange {
    /// Decode an ENVCHANGE token body (length prefix already consumed).
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < 1 {
            return Err(WireError::Incomplete {
                expected: 1,
                actual: 0,
            });
        }
        let kind_byte = src.get_u8();
        let kind = EnvChangeKind::from_u8(kind_byte)
            .ok_or(WireError::CorruptedStream("unknown env-change sub-code"))?;

        let (new_value, old_value) = if kind.is_binary() {
            (Self::read_b_varbyte(src)?, Self::read_b_varbyte(src)?)
        } else {
            (
                EnvValue::String(read_b_varchar(src)?),
                EnvValue::String(read_b_varchar(src)?),
            )
        };

        Ok(Self {
            kind,
            new_value,
            old_value,
        })
    }

    fn read_b_varbyte(src: &mut impl Buf) -> Result<EnvValue, WireError> {
        if src.remaining() < 1 {
            return Err(WireError::Incomplete {
                expected: 1,
                actual: 0,
            });
        }
        let len = src.get_u8() as usize;
        if src.remaining() < len {
            return Err(WireError::Incomplete {
                expected: len,
                actual: src.remaining(),
            });
        }
        Ok(EnvValue::Binary(src.copy_to_bytes(len)))
    }

    /// Encode the token including the type byte and u16 length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = bytes::BytesMut::new();
        body.put_u8(self.kind as u8);
        for value in [&self.new_value, &self.old_value] {
            match value {
                EnvValue::Binary(data) => {
                    body.put_u8(data.len() as u8);
                    body.put_slice(data);
                }
                EnvValue::String(text) => write_b_varchar(&mut body, text),
            }
        }
        dst.put_u8(TokenType::EnvChange as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    /// Extract the 8-byte transaction descriptor from a transaction change.
    ///
    /// Returns `None` when the value is not an 8-byte binary payload.
    #[must_use]
    pub fn transaction_descriptor(&self) -> Option<u64> {
        match &self.new_value {
            EnvValue::Binary(data) if data.len() >= 8 => Some(u64::from_le_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ])),
            _ => None,
        }
    }

    /// Extract the new packet size from a `PacketSize` change.
    #[must_use]
    pub fn packet_size(&self) -> Option<usize> {
        if self.kind != EnvChangeKind::PacketSize {
            return None;
        }
        match &self.new_value {
            EnvValue::String(text) => text.parse().ok(),
            EnvValue::Binary(_) => None,
        }
    }
}

/// Server error message (ERROR token).
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Error severity class.
    pub class: u8,
    /// Error message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: u32,
}

impl ServerError {
    /// Decode an ERROR token body (length prefix already consumed).
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < 6 {
            return Err(WireError::Incomplete {
                expected: 6,
                actual: src.remaining(),
            });
        }
        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();
        let message = read_us_varchar(src)?;
        let server = read_b_varchar(src)?;
        let procedure = read_b_varchar(src)?;
        if src.remaining() < 4 {
            return Err(WireError::Incomplete {
                expected: 4,
                actual: src.remaining(),
            });
        }
        let line = src.get_u32_le();

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode the token including the type byte and u16 length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = bytes::BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        let chars = self.message.encode_utf16().count();
        body.put_u16_le(chars as u16);
        write_utf16_string(&mut body, &self.message);
        write_b_varchar(&mut body, &self.server);
        write_b_varchar(&mut body, &self.procedure);
        body.put_u32_le(self.line);

        dst.put_u8(TokenType::Error as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }
}

/// Server informational message (INFO token). Same wire shape as ERROR.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Info number.
    pub number: i32,
    /// Info state.
    pub state: u8,
    /// Info class (severity, always below the error threshold).
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: u32,
}

impl ServerInfo {
    /// Decode an INFO token body (length prefix already consumed).
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, WireError> {
        let err = ServerError::decode_body(src)?;
        Ok(Self {
            number: err.number,
            state: err.state,
            class: err.class,
            message: err.message,
            server: err.server,
            procedure: err.procedure,
            line: err.line,
        })
    }
}

/// Login acknowledgment token.
#[derive(Debug, Clone)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// Negotiated TDS version (big-endian on the wire).
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode a LOGINACK token body (length prefix already consumed).
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < 5 {
            return Err(WireError::Incomplete {
                expected: 5,
                actual: src.remaining(),
            });
        }
        let interface = src.get_u8();
        let tds_version = src.get_u32();
        let prog_name = read_b_varchar(src)?;
        if src.remaining() < 4 {
            return Err(WireError::Incomplete {
                expected: 4,
                actual: src.remaining(),
            });
        }
        let prog_version = src.get_u32();

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode the token including the type byte and u16 length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = bytes::BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version);
        write_b_varchar(&mut body, &self.prog_name);
        body.put_u32(self.prog_version);

        dst.put_u8(TokenType::LoginAck as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }
}
