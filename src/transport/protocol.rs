//! Transport protocol abstraction traits.
//!
//! This module defines the `QueryTransport` and `FrameStream` traits that
//! abstract how a query reaches the service and how its result frames come
//! back. gRPC streaming is the primary implementation, with an HTTP
//! submit/poll fallback behind the same traits.

use crate::connection::auth::Token;
use crate::error::TransportError;
use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Network address of the query service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Service host
    pub host: String,
    /// Service port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Check that the endpoint is a usable network address.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.trim().is_empty() {
            return Err(TransportError::InvalidEndpoint("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(TransportError::InvalidEndpoint(
                "port must be greater than 0".to_string(),
            ));
        }
        self.authority()
            .parse::<tonic::codegen::http::uri::Authority>()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", self.authority(), e)))?;
        Ok(())
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URI for the given TLS mode.
    pub fn uri(&self, tls: &TlsMode) -> String {
        let scheme = if tls.is_enabled() { "https" } else { "http" };
        format!("{}://{}", scheme, self.authority())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.authority())
    }
}

/// TLS settings for a channel.
///
/// Certificate verification cannot be switched off while TLS is enabled;
/// plaintext has to be asked for explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// TLS with server certificate verification against the system roots or
    /// the given PEM-encoded CA certificate
    Verified { ca_certificate: Option<Vec<u8>> },
    /// Plaintext, for test servers only
    Disabled,
}

impl TlsMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, TlsMode::Verified { .. })
    }
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::Verified {
            ca_certificate: None,
        }
    }
}

/// Which transport carries queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Server-streaming gRPC
    #[default]
    Grpc,
    /// HTTP submit/poll/fetch-page
    Http,
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grpc" => Ok(TransportKind::Grpc),
            "http" | "https" => Ok(TransportKind::Http),
            other => Err(TransportError::InvalidEndpoint(format!(
                "unknown transport '{}'",
                other
            ))),
        }
    }
}

/// Everything needed to open a channel.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: Endpoint,
    pub tls: TlsMode,
    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
    /// Timeout for individual unary calls (cancel, status, page fetch)
    pub request_timeout: Duration,
    /// Extra metadata sent with every call
    pub headers: Vec<(String, String)>,
    /// Largest accepted message in bytes
    pub max_message_size: usize,
    /// Status poll interval of the HTTP transport
    pub poll_interval: Duration,
    /// Attempts for idempotent HTTP calls
    pub max_request_attempts: u32,
}

impl TransportConfig {
    /// Create a configuration with defaults for everything but the endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            tls: TlsMode::default(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            headers: Vec::new(),
            max_message_size: 64 * 1024 * 1024,
            poll_interval: Duration::from_millis(200),
            max_request_attempts: 3,
        }
    }

    /// Set the TLS mode.
    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add a metadata header sent with every call.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the HTTP status poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Per-execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Upper bound on rows buffered ahead of the consumer
    pub fetch_size: usize,
    /// Query deadline, zero means none
    pub timeout: Duration,
    /// Catalog (database) the query resolves names against
    pub catalog: Option<String>,
    /// Server-side query settings
    pub settings: BTreeMap<String, String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            fetch_size: 1000,
            timeout: Duration::ZERO,
            catalog: None,
            settings: BTreeMap::new(),
        }
    }
}

impl QueryOptions {
    /// Set the fetch size.
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    /// Set the query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the catalog.
    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Add a server-side query setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// A query submission.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub sql: String,
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>, options: QueryOptions) -> Self {
        Self {
            sql: sql.into(),
            options,
        }
    }
}

/// One decoded message of a result stream.
///
/// Frames are numbered from 0 and the numbers are contiguous. A frame may
/// carry the schema, a batch of rows, the end-of-stream marker, or a mix.
#[derive(Debug, Clone, Default)]
pub struct QueryFrame {
    pub sequence_number: u64,
    /// Server-assigned query id, at least on the first frame
    pub query_id: Option<String>,
    pub schema: Option<SchemaRef>,
    pub batch: Option<RecordBatch>,
    /// Row count the server declared for `batch`
    pub row_count: i64,
    pub end_of_stream: bool,
}

impl QueryFrame {
    /// A frame carrying a batch of rows.
    pub fn batch(sequence_number: u64, batch: RecordBatch) -> Self {
        Self {
            sequence_number,
            row_count: batch.num_rows() as i64,
            schema: Some(batch.schema()),
            batch: Some(batch),
            ..Default::default()
        }
    }

    /// A frame that only marks the end of the stream.
    pub fn end(sequence_number: u64) -> Self {
        Self {
            sequence_number,
            end_of_stream: true,
            ..Default::default()
        }
    }

    /// Set the query id.
    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    /// Mark this frame as the last one.
    pub fn with_end_of_stream(mut self) -> Self {
        self.end_of_stream = true;
        self
    }
}

/// How far a query has progressed on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Running,
    /// Every result row exists; the query is still being finalized
    ResultsProduced,
    Finished,
}

/// Server-side status of a submitted query.
///
/// Failed and cancelled queries are reported as errors by
/// [`QueryTransport::query_status`], never as a status.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStatus {
    pub query_id: String,
    pub completion: CompletionStatus,
    /// Result chunks produced so far
    pub chunk_count: u64,
    /// Result rows produced so far
    pub row_count: u64,
    /// Progress in `[0, 1]`
    pub progress: f64,
}

impl QueryStatus {
    pub fn new(query_id: impl Into<String>, completion: CompletionStatus) -> Self {
        Self {
            query_id: query_id.into(),
            completion,
            chunk_count: 0,
            row_count: 0,
            progress: 0.0,
        }
    }

    pub fn with_counts(mut self, chunk_count: u64, row_count: u64) -> Self {
        self.chunk_count = chunk_count;
        self.row_count = row_count;
        self
    }

    /// Whether every result row is available.
    pub fn all_results_produced(&self) -> bool {
        matches!(
            self.completion,
            CompletionStatus::ResultsProduced | CompletionStatus::Finished
        )
    }

    pub fn is_finished(&self) -> bool {
        self.completion == CompletionStatus::Finished
    }
}

/// Supplies bearer tokens to calls a transport makes on its own, such as
/// status polls and page fetches of a running query.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A token that is valid right now.
    async fn token(&self) -> Result<Arc<Token>, TransportError>;

    /// Report that the service rejected `token`.
    fn reject(&self, token: &Arc<Token>);
}

/// Pull side of an open result stream.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// # Returns
    ///
    /// `None` when the server closed the stream.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ChannelClosed` once the transport was closed,
    /// or the classified failure of the underlying call.
    async fn next_frame(&mut self) -> Result<Option<QueryFrame>, TransportError>;
}

/// Transport trait for query service communication.
///
/// Implementations own the connection lifecycle, TLS, and low-level retries
/// of individual calls.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Submit a query and open its result stream.
    ///
    /// # Arguments
    ///
    /// * `request` - SQL text and execution options
    /// * `token` - Bearer token attached to the call
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the call cannot be started.
    async fn execute_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError>;

    /// Submit a query without reading its results.
    ///
    /// Returns as soon as the service assigned a query id. The results stay
    /// on the server for [`fetch_rows`](Self::fetch_rows) and
    /// [`fetch_chunk`](Self::fetch_chunk).
    async fn submit_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<QueryStatus, TransportError>;

    /// Current status of a submitted query.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Server` for a failed query and
    /// `TransportError::Cancelled` for a cancelled one.
    async fn query_status(&self, query_id: &str, token: &Token) -> Result<QueryStatus, TransportError>;

    /// Stream `limit` result rows starting at row `offset`.
    ///
    /// The frames are numbered from 0 and end with an end-of-stream frame,
    /// like the stream of [`execute_query`](Self::execute_query).
    async fn fetch_rows(
        &self,
        query_id: &str,
        offset: u64,
        limit: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError>;

    /// Stream one result chunk.
    async fn fetch_chunk(
        &self,
        query_id: &str,
        chunk: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError>;

    /// Ask the service to cancel a running query.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the request fails.
    async fn cancel_query(&self, query_id: &str, token: &Token) -> Result<(), TransportError>;

    /// Give the transport a token source for calls it makes after
    /// `execute_query` returned. Transports that only call the service from
    /// within the trait methods ignore it.
    fn attach_token_source(&self, _source: Arc<dyn TokenSource>) {}

    /// Close the channel. Pending and later operations fail with
    /// `TransportError::ChannelClosed`.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the channel has been closed.
    fn is_closed(&self) -> bool;
}
