//! # mssql-session
//!
//! Per-session TDS protocol engine.
//!
//! This crate owns the framed byte stream to one SQL Server session and
//! everything that rides on it: the packetised read/write pipelines, the
//! replayable read snapshot, attention-based cancellation, timeout
//! supervision, the session diagnostics collections, and the client-side
//! transaction lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! Transport (tokio) → PacketDecoder (framing) → ReadPipeline → token parser
//!                                   ↘ ReadSnapshot (replay)
//! request bytes → WritePipeline → OutputBuffer → PacketWriter → Transport
//! ```
//!
//! The transport is split into read and write halves so an Attention
//! packet can be sent while a read is blocked on results. The read side
//! is single-consumer by construction; everything a cancel handle or a
//! timer needs lives behind the session's shared half.
//!
//! Higher layers (command surface, row decoding, pooling, authentication)
//! are deliberately out of scope; they consume the seams exposed here.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_session::{Session, FlushMode};
//! use tds_wire::{encode_sql_batch, IsolationLevel, PacketType};
//!
//! let mut session = Session::new(Box::new(tcp_stream));
//! session.shared().set_logged_in(true);
//!
//! let tx = session.begin_transaction(IsolationLevel::ReadCommitted).await?;
//! let sql = encode_sql_batch("UPDATE t SET x = 1", session.transaction_descriptor(), 1);
//! session.send_request(PacketType::SqlBatch, &sql, 1).await?;
//! // ... consume the response through the read pipeline ...
//! tx.commit(&mut session).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod error;
pub mod events;
pub mod reader;
pub mod session;
pub mod snapshot;
pub mod timeout;
pub mod transaction;
pub mod transport;
pub mod writer;

pub use buffer::{InputBuffer, OutputBuffer};
pub use error::{
    Result, SessionError, FATAL_ERROR_CLASS, SNI_WAIT_TIMEOUT, TIMEOUT_EXPIRED_NUMBER,
    UNASSOCIATED_OPERATION,
};
pub use events::{register_event_sink, unregister_event_sink, SessionEventSink};
pub use reader::{NullBitmapCache, ReadOutcome, ReadPipeline};
pub use session::{
    CancelHandle, Diagnostics, ResponseSummary, Session, SessionOwner, SessionShared,
    SessionStatus,
};
pub use snapshot::ReadSnapshot;
pub use timeout::{TimeoutSupervisor, TimerState, DEFAULT_ATTENTION_GRACE};
pub use transaction::{
    HandleShell, InternalTransaction, Transaction, TransactionEvent, TransactionRegistry,
    TransactionState, TransactionType,
};
pub use transport::{BoxedTransport, Packet, PacketDecoder, PacketReader, PacketWriter, Transport};
pub use writer::{FlushMode, PendingWrites, WriteSecret, MAX_SECRETS_IN_FLIGHT};
