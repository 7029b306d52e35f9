//! # mssql-mock
//!
//! Scripted in-process TDS server for testing the session engine without
//! a real database. A script is an ordered sequence of expectations and
//! responses; the server plays it against a single connection and
//! reports any violation when awaited.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_mock::{MockTdsServer, ScriptStep, TokenStreamBuilder};
//! use tds_wire::PacketType;
//!
//! let response = TokenStreamBuilder::new()
//!     .colmetadata_int("value")
//!     .row_int(1)
//!     .done(1)
//!     .build();
//!
//! let server = MockTdsServer::start(vec![
//!     ScriptStep::ExpectMessage(PacketType::SqlBatch),
//!     ScriptStep::SendTokens(response),
//!     ScriptStep::WaitDisconnect,
//! ])
//! .await?;
//! // connect a session to server.addr() ...
//! server.finished().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod server;
pub mod tokens;

pub use server::{MockServerError, MockTdsServer, ScriptStep};
pub use tokens::TokenStreamBuilder;
