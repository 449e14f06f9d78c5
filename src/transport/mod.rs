//! Transport layer for query service communication.
//!
//! This module provides the transport abstraction and its implementations.
//! Queries normally travel over server-streaming gRPC; an HTTP
//! submit/poll/fetch-page transport is available behind the same traits.
//!
//! # Architecture
//!
//! The transport layer is organized into:
//! - `protocol` - Transport traits, endpoint and option types
//! - `messages` - Wire message types
//! - `deserialize` - Arrow IPC decoding of result payloads
//! - `grpc` - gRPC streaming transport
//! - `http` - HTTP fallback transport
//!
//! # Example
//!
//! ```no_run
//! use hyperarrow_rs::connection::auth::Token;
//! use hyperarrow_rs::transport::{
//!     open, Endpoint, QueryOptions, QueryRequest, TransportConfig, TransportKind,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransportConfig::new(Endpoint::new("hyper.example.com", 7484));
//! let transport = open(TransportKind::Grpc, config).await?;
//!
//! let token = Token::bearer("eyJ...", chrono::Utc::now() + chrono::Duration::hours(1));
//! let request = QueryRequest::new("SELECT 1", QueryOptions::default());
//! let mut stream = transport.execute_query(&request, &token).await?;
//! while let Some(frame) = stream.next_frame().await? {
//!     println!("frame {}", frame.sequence_number);
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod deserialize;
pub mod grpc;
pub mod http;
pub mod messages;
pub mod protocol;

use crate::error::TransportError;
use std::sync::Arc;

// Re-export commonly used types
pub use grpc::GrpcTransport;
pub use http::HttpTransport;
pub use protocol::{
    CompletionStatus, Endpoint, FrameStream, QueryFrame, QueryOptions, QueryRequest, QueryStatus,
    QueryTransport, TlsMode, TokenSource, TransportConfig, TransportKind,
};

/// Open a transport of the given kind.
pub async fn open(
    kind: TransportKind,
    config: TransportConfig,
) -> Result<Arc<dyn QueryTransport>, TransportError> {
    match kind {
        TransportKind::Grpc => Ok(Arc::new(GrpcTransport::open(config).await?)),
        TransportKind::Http => Ok(Arc::new(HttpTransport::open(config)?)),
    }
}

/// Render an error with all of its sources.
pub(crate) fn describe_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}

/// Sort a failed connection attempt into TLS, timeout or refused.
///
/// Walks the source chain of `err` and decides on the first typed cause it
/// recognizes. Anything else counts as refused.
pub(crate) fn classify_connect_failure(
    endpoint: &Endpoint,
    err: &(dyn std::error::Error + 'static),
) -> TransportError {
    let message = describe_error_chain(err);
    let mut cause = Some(err);
    while let Some(current) = cause {
        if current.is::<rustls::Error>() {
            return TransportError::TlsHandshake(message);
        }
        if current.is::<tonic::TimeoutExpired>() || current.is::<tokio::time::error::Elapsed>() {
            return TransportError::DeadlineExceeded(message);
        }
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            // TLS stacks report handshake failures as I/O errors wrapping the
            // rustls error, which `source()` does not expose.
            if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
                return TransportError::TlsHandshake(message);
            }
            if io.kind() == std::io::ErrorKind::TimedOut {
                return TransportError::DeadlineExceeded(message);
            }
        }
        cause = current.source();
    }
    TransportError::ConnectionRefused {
        endpoint: endpoint.to_string(),
        message,
    }
}
