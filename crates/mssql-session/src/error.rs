//! Session error types.

use std::sync::Arc;

use thiserror::Error;

/// Error number reported when a command timeout expires.
pub const TIMEOUT_EXPIRED_NUMBER: i32 = -2;

/// Native error code for a wait timeout at the network interface layer.
pub const SNI_WAIT_TIMEOUT: i32 = 258;

/// Server error class at or above which the session is broken.
pub const FATAL_ERROR_CLASS: u8 = 20;

/// Sentinel operation id meaning "not associated with any operation".
/// A cancel request carrying or matching this value is never honoured.
pub const UNASSOCIATED_OPERATION: i64 = -1;

/// Errors that can occur during session operations.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// The inbound byte stream violates TDS framing. Fatal to the session.
    #[error("corrupted TDS stream: {0}")]
    CorruptedStream(&'static str),

    /// Wire-level encode/decode failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] tds_wire::WireError),

    /// IO error (wrapped in `Arc` for `Clone` support).
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The current operation exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// A wait on the transport timed out at the network interface layer.
    ///
    /// Carries the SNI wait-timeout native code; the session must be
    /// aborted rather than returned to a pool.
    #[error("wait operation timed out (native error {SNI_WAIT_TIMEOUT})")]
    WaitTimeout,

    /// The operation was cancelled by an attention request.
    #[error("operation cancelled")]
    OperationCancelled,

    /// Server-reported error record.
    #[error("server error {number} (class {class}): {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Severity class (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Message text.
        message: String,
        /// Reporting server name.
        server: String,
        /// Stored procedure name, empty when not applicable.
        procedure: String,
        /// Line number in the batch or procedure.
        line: u32,
    },

    /// A result set was closed more times than it was opened.
    #[error("open result count underflow")]
    OpenResultCountExceeded,

    /// Requested packet size is outside the negotiable range, or the
    /// buffers were not empty at resize time.
    #[error("invalid packet size: {0}")]
    InvalidPacketSize(usize),

    /// Transaction or savepoint name was null or empty.
    #[error("transaction or savepoint name must not be empty")]
    NullEmptyTransactionName,

    /// Operation attempted on a completed transaction.
    #[error("transaction has completed and is no longer usable")]
    TransactionZombied,

    /// More write secrets placed than the pipeline supports.
    #[error("too many write secrets in flight")]
    TooManySecrets,

    /// The session state machine does not allow the requested operation.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// The session has been broken by a prior fatal error.
    #[error("session is broken")]
    SessionBroken,

    /// The transport closed mid-message.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl SessionError {
    /// Build the error record enqueued when a command timeout expires.
    #[must_use]
    pub fn timeout_expired() -> Self {
        Self::Server {
            number: TIMEOUT_EXPIRED_NUMBER,
            class: 11,
            state: 0,
            message: "Timeout expired. The timeout period elapsed prior to \
                      completion of the operation."
                .to_string(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        }
    }

    /// Check if this error breaks the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::CorruptedStream(_)
            | Self::ConnectionClosed
            | Self::SessionBroken
            | Self::WaitTimeout => true,
            Self::Io(_) => true,
            Self::Server { class, .. } => *class >= FATAL_ERROR_CLASS,
            _ => false,
        }
    }

    /// Check if this is a server error with the given number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }

    /// Severity class of a server-reported error.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
