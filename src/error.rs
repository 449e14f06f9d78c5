//! Error types for hyperarrow-rs.
//!
//! This module defines domain-specific error types organized by functional area.
//! Every error can be reduced to an [`ErrorKind`] and a SQLSTATE so callers can
//! branch on the failure category without matching concrete variants.

use std::fmt;
use thiserror::Error;

/// Queries longer than this are truncated when attached to error messages.
pub const MAX_QUERY_LENGTH_IN_ERRORS: usize = 16 * 1024;

/// Top-level error type encompassing all possible errors.
#[derive(Error, Debug, Clone)]
pub enum HyperError {
    /// Connection and session errors
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Authentication errors
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Query execution errors
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Data conversion errors
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Transport errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An error raised while a query execution was in progress, tagged with
    /// where the execution stood when it failed.
    #[error("Failed to execute query: {source}\nSQLSTATE: {}{context}", .source.sql_state())]
    Execution {
        context: ExecutionContext,
        source: Box<HyperError>,
    },
}

/// Errors related to connection parameters and session lifecycle.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Invalid connection parameters
    #[error("Invalid connection parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Connection string parsing error
    #[error("Failed to parse connection string: {0}")]
    ParseError(String),

    /// The session has been closed
    #[error("Session is closed")]
    SessionClosed,
}

/// Errors related to obtaining or using bearer tokens.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// The identity provider rejected the credentials
    #[error("Credential exchange rejected: {code}: {description}")]
    Rejected { code: String, description: String },

    /// The query service rejected the bearer token
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// The exchange could not be completed (network, 5xx)
    #[error("Credential exchange failed: {0}")]
    ExchangeFailed(String),

    /// The identity provider answered with something unreadable
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// Required credentials are missing
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
}

/// Errors related to query execution.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// A caller-supplied argument is invalid
    #[error("Invalid argument '{parameter}': {message}")]
    InvalidArgument { parameter: String, message: String },

    /// The server violated the streaming protocol
    #[error("Protocol error: {0}")]
    ProtocolViolation(String),

    /// The query deadline passed on the client side
    #[error("Query timeout after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },

    /// The execution was cancelled by the caller
    #[error("Query was cancelled")]
    Cancelled,

    /// The execution was cancelled because its session closed
    #[error("Query was cancelled: session closed")]
    SessionClosed,

    /// Operation not valid in the current state
    #[error("Invalid query state: {0}")]
    InvalidState(String),

    /// The cursor has been closed
    #[error("Cursor is closed")]
    CursorClosed,
}

/// Errors related to data type conversion.
#[derive(Error, Debug, Clone)]
pub enum ConversionError {
    /// Requested SQL type cannot be produced from the column's physical type
    #[error("Cannot read column {column} of type {physical} as {requested}")]
    TypeMismatch {
        column: usize,
        physical: String,
        requested: String,
    },

    /// Arrow type without a SQL mapping
    #[error("Unsupported Arrow type: {data_type}")]
    UnsupportedType { data_type: String },

    /// Value does not fit into the requested type
    #[error("Numeric overflow at row {row}, column {column} converting to {target}")]
    NumericOverflow {
        row: usize,
        column: usize,
        target: String,
    },

    /// Column index outside of the row
    #[error("Column index {column} out of range (row has {count} columns)")]
    ColumnOutOfRange { column: usize, count: usize },

    /// No row is current
    #[error("No current row: call next() first")]
    NoCurrentRow,

    /// Invalid data format
    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    /// Arrow error
    #[error("Arrow error: {0}")]
    ArrowError(String),
}

/// Errors related to the transport layer.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The endpoint is not a valid network address
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Nothing accepted the connection
    #[error("Connection refused by {endpoint}: {message}")]
    ConnectionRefused { endpoint: String, message: String },

    /// TLS negotiation or certificate verification failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// A network call did not finish in time
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The service is temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The service rejected the bearer token
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The channel has been closed locally
    #[error("Channel is closed")]
    ChannelClosed,

    /// The service cancelled the call
    #[error("Call cancelled: {0}")]
    Cancelled(String),

    /// The service reported a query failure
    #[error("Server error ({code}): {message}")]
    Server {
        code: String,
        sql_state: Option<String>,
        message: String,
    },

    /// Unexpected HTTP status from the fallback transport
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Invalid response from server
    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Submissions are being rejected after repeated failures
    #[error("Circuit open: retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },
}

/// Failure category shared by every error in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Authentication,
    Protocol,
    TypeConversion,
    DeadlineExceeded,
    Cancelled,
    InvalidArgument,
    SessionClosed,
    /// The service rejected or failed the query itself
    Query,
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "CONNECTION",
            ErrorKind::Authentication => "AUTHENTICATION",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::TypeConversion => "TYPE_CONVERSION",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::SessionClosed => "SESSION_CLOSED",
            ErrorKind::Query => "QUERY",
            ErrorKind::InvalidState => "INVALID_STATE",
        };
        f.write_str(name)
    }
}

impl ErrorKind {
    /// Default SQLSTATE for this category.
    pub fn sql_state(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "08001",
            ErrorKind::Authentication => "28000",
            ErrorKind::Protocol => "08P01",
            ErrorKind::TypeConversion => "22018",
            ErrorKind::DeadlineExceeded => "57014",
            ErrorKind::Cancelled => "57014",
            ErrorKind::InvalidArgument => "22023",
            ErrorKind::SessionClosed => "08003",
            ErrorKind::Query => "HY000",
            ErrorKind::InvalidState => "HY010",
        }
    }
}

/// Where an execution stood when an error was raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub execution_id: u64,
    pub query_id: Option<String>,
    /// Sequence number of the last batch handed to the consumer
    pub last_sequence: Option<u64>,
    /// SQL text, already truncated
    pub sql: Option<String>,
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\nEXECUTION: {}", self.execution_id)?;
        if let Some(query_id) = &self.query_id {
            write!(f, "\nQUERY-ID: {}", query_id)?;
        }
        if let Some(sequence) = self.last_sequence {
            write!(f, "\nSEQUENCE: {}", sequence)?;
        }
        if let Some(sql) = &self.sql {
            write!(f, "\nQUERY: {}", sql)?;
        }
        Ok(())
    }
}

/// Truncate SQL text for inclusion in error messages.
pub fn truncate_query(sql: &str) -> String {
    if sql.len() <= MAX_QUERY_LENGTH_IN_ERRORS {
        return sql.to_string();
    }
    let mut end = MAX_QUERY_LENGTH_IN_ERRORS;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}<truncated>", &sql[..end])
}

impl HyperError {
    /// Failure category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HyperError::Connection(e) => e.kind(),
            HyperError::Auth(_) => ErrorKind::Authentication,
            HyperError::Query(e) => e.kind(),
            HyperError::Conversion(_) => ErrorKind::TypeConversion,
            HyperError::Transport(e) => e.kind(),
            HyperError::Execution { source, .. } => source.kind(),
        }
    }

    /// SQLSTATE for this error, preferring one reported by the server.
    pub fn sql_state(&self) -> &str {
        match self {
            HyperError::Transport(TransportError::Server {
                sql_state: Some(state),
                ..
            }) => state,
            HyperError::Execution { source, .. } => source.sql_state(),
            other => other.kind().sql_state(),
        }
    }

    /// Execution context, if the error was raised by an execution.
    pub fn context(&self) -> Option<&ExecutionContext> {
        match self {
            HyperError::Execution { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The untagged error.
    pub fn root(&self) -> &HyperError {
        match self {
            HyperError::Execution { source, .. } => source.root(),
            other => other,
        }
    }

    /// Attach execution context. Already tagged errors are returned unchanged.
    pub fn with_context(self, context: ExecutionContext) -> HyperError {
        match self {
            tagged @ HyperError::Execution { .. } => tagged,
            other => HyperError::Execution {
                context,
                source: Box::new(other),
            },
        }
    }
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::InvalidParameter { .. } | ConnectionError::ParseError(_) => {
                ErrorKind::InvalidArgument
            }
            ConnectionError::SessionClosed => ErrorKind::SessionClosed,
        }
    }
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            QueryError::ProtocolViolation(_) => ErrorKind::Protocol,
            QueryError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            QueryError::Cancelled => ErrorKind::Cancelled,
            QueryError::SessionClosed => ErrorKind::SessionClosed,
            QueryError::InvalidState(_) | QueryError::CursorClosed => ErrorKind::InvalidState,
        }
    }
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::InvalidEndpoint(_) => ErrorKind::InvalidArgument,
            TransportError::ConnectionRefused { .. }
            | TransportError::TlsHandshake(_)
            | TransportError::Unavailable(_)
            | TransportError::CircuitOpen { .. } => ErrorKind::Connection,
            TransportError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            TransportError::Unauthenticated(_) => ErrorKind::Authentication,
            TransportError::ChannelClosed => ErrorKind::SessionClosed,
            TransportError::Cancelled(_) => ErrorKind::Cancelled,
            TransportError::Server { .. } => ErrorKind::Query,
            TransportError::Http { status, .. } if *status >= 500 => ErrorKind::Connection,
            TransportError::Http { .. } => ErrorKind::Query,
            TransportError::InvalidResponse(_) | TransportError::Decode(_) => ErrorKind::Protocol,
        }
    }
}

// Conversions from external error types
impl From<arrow::error::ArrowError> for ConversionError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ConversionError::ArrowError(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for TransportError {
    fn from(err: arrow::error::ArrowError) -> Self {
        TransportError::Decode(err.to_string())
    }
}

impl From<prost::DecodeError> for TransportError {
    fn from(err: prost::DecodeError) -> Self {
        TransportError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::InvalidResponse(err.to_string())
    }
}
