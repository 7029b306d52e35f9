//! # tds-wire
//!
//! IO-agnostic wire definitions for the TDS session core.
//!
//! This crate owns the byte-level shapes the session engine manipulates:
//! the 8-byte packet header and its status bits, the token subset that
//! changes session state (DONE family, ENVCHANGE, ERROR/INFO, LOGINACK),
//! PLP stream framing, and the ALL_HEADERS / transaction manager request
//! encodings that carry a session's transaction identity to the server.
//!
//! It contains no networking logic and makes no assumptions about the
//! async runtime; the `mssql-session` crate layers framed I/O on top.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod headers;
pub mod packet;
pub mod plp;
pub mod tm;
pub mod token;

pub use error::WireError;
pub use headers::{encode_sql_batch, write_all_headers, ALL_HEADERS_LEN};
pub use packet::{
    attention_frame, PacketHeader, PacketStatus, PacketType, DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE,
    MIN_PACKET_SIZE, PACKET_HEADER_SIZE,
};
pub use plp::{PlpLength, PLP_NULL, PLP_TERMINATOR, PLP_UNKNOWN_LEN};
pub use tm::{
    encode_begin_request, encode_commit_request, encode_rollback_request, encode_save_request,
    peek_request_kind, IsolationLevel, TmRequestKind,
};
pub use token::{
    Done, DoneStatus, EnvChange, EnvChangeKind, EnvValue, LoginAck, ServerError, ServerInfo,
    TokenType,
};
