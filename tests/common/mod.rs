//! Common test utilities for hyperarrow-rs tests.
//!
//! Two kinds of helpers live here:
//!
//! * An in-memory [`ScriptedTransport`] and a [`CountingExchange`] that let
//!   tests drive `QuerySession` through exact frame sequences and failures.
//! * Configuration helpers for the live-service integration tests.
//!
//! # Live service configuration
//!
//! | Environment Variable   | Default Value           |
//! |------------------------|-------------------------|
//! | `HYPER_HOST`           | "localhost"             |
//! | `HYPER_PORT`           | 7484                    |
//! | `HYPER_CLIENT_ID`      | "test-client"           |
//! | `HYPER_CLIENT_SECRET`  | ""                      |
//! | `HYPER_LOGIN_URL`      | "http://localhost:8080" |
//! | `HYPER_TRANSPORT`      | "grpc"                  |
//!
//! ```bash
//! HYPER_HOST=hyper.local cargo test --test integration_tests -- --ignored
//! ```

#![allow(dead_code)]

use arrow::array::{Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use async_trait::async_trait;
use chrono::Utc;
use hyperarrow_rs::connection::auth::{CredentialExchange, Credentials, Token, TokenProvider};
use hyperarrow_rs::connection::{QuerySession, SessionConfig};
use hyperarrow_rs::error::{AuthError, TransportError};
use hyperarrow_rs::resilience::RetryPolicy;
use hyperarrow_rs::transport::{
    FrameStream, QueryFrame, QueryRequest, QueryStatus, QueryTransport,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::env;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Scripted transport
// ============================================================================

/// One step of a scripted result stream.
#[derive(Debug, Clone)]
pub enum Step {
    Frame(QueryFrame),
    Fail(TransportError),
    /// Never produce anything
    Hang,
}

/// What one submission of a query does.
#[derive(Debug, Clone)]
pub enum Attempt {
    Reject(TransportError),
    /// Frames in order; the stream closes after the last step
    Stream(Vec<Step>),
}

#[derive(Default)]
struct Shared {
    pulls: AtomicUsize,
    closed: AtomicBool,
}

/// Transport that plays back one [`Attempt`] per submission or fetch.
///
/// Status calls replay the scripted statuses in order and keep repeating the
/// last one.
#[derive(Default)]
pub struct ScriptedTransport {
    attempts: Mutex<VecDeque<Attempt>>,
    statuses: Mutex<VecDeque<Result<QueryStatus, TransportError>>>,
    submissions: AtomicUsize,
    status_polls: AtomicUsize,
    authorizations: Mutex<Vec<String>>,
    requests: Mutex<Vec<QueryRequest>>,
    fetches: Mutex<Vec<String>>,
    cancels: Mutex<Vec<String>>,
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            ..Default::default()
        }
    }

    /// Answers for `submit_query` and `query_status`, in order.
    pub fn with_statuses(self, statuses: Vec<Result<QueryStatus, TransportError>>) -> Self {
        *self.statuses.lock() = statuses.into();
        self
    }

    /// Status calls received so far.
    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }

    /// Range reads as `rows:<id>:<offset>:<limit>` or `chunk:<id>:<chunk>`.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().clone()
    }

    /// Submissions received so far.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Frames, failures and hangs handed out across all streams.
    pub fn pulls(&self) -> usize {
        self.shared.pulls.load(Ordering::SeqCst)
    }

    /// Authorization header of every submission.
    pub fn authorizations(&self) -> Vec<String> {
        self.authorizations.lock().clone()
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    /// Query ids the client asked to cancel.
    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }
}

#[async_trait]
impl QueryTransport for ScriptedTransport {
    async fn execute_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.authorizations.lock().push(token.authorization_header());
        self.requests.lock().push(request.clone());
        self.next_stream()
    }

    async fn submit_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<QueryStatus, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.authorizations.lock().push(token.authorization_header());
        self.requests.lock().push(request.clone());
        self.next_status()
    }

    async fn query_status(
        &self,
        _query_id: &str,
        token: &Token,
    ) -> Result<QueryStatus, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        self.authorizations.lock().push(token.authorization_header());
        self.next_status()
    }

    async fn fetch_rows(
        &self,
        query_id: &str,
        offset: u64,
        limit: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.authorizations.lock().push(token.authorization_header());
        self.fetches
            .lock()
            .push(format!("rows:{}:{}:{}", query_id, offset, limit));
        self.next_stream()
    }

    async fn fetch_chunk(
        &self,
        query_id: &str,
        chunk: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.authorizations.lock().push(token.authorization_header());
        self.fetches.lock().push(format!("chunk:{}:{}", query_id, chunk));
        self.next_stream()
    }

    async fn cancel_query(&self, query_id: &str, _token: &Token) -> Result<(), TransportError> {
        self.cancels.lock().push(query_id.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl ScriptedTransport {
    fn next_stream(&self) -> Result<Box<dyn FrameStream>, TransportError> {
        let attempt = self.attempts.lock().pop_front();
        match attempt {
            Some(Attempt::Reject(error)) => Err(error),
            Some(Attempt::Stream(steps)) => Ok(Box::new(ScriptedStream {
                steps: steps.into(),
                shared: Arc::clone(&self.shared),
            })),
            None => Err(TransportError::Unavailable("no scripted attempt left".to_string())),
        }
    }

    fn next_status(&self) -> Result<QueryStatus, TransportError> {
        let mut statuses = self.statuses.lock();
        match statuses.len() {
            0 => Err(TransportError::Unavailable("no scripted status left".to_string())),
            1 => statuses[0].clone(),
            _ => statuses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::ChannelClosed)),
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> Result<Option<QueryFrame>, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let Some(step) = self.steps.pop_front() else {
            return Ok(None);
        };
        self.shared.pulls.fetch_add(1, Ordering::SeqCst);
        match step {
            Step::Frame(frame) => Ok(Some(frame)),
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// Credential exchange
// ============================================================================

/// Issues `token-1`, `token-2`, ... and counts exchanges.
#[derive(Debug, Default)]
pub struct CountingExchange {
    issued: AtomicUsize,
    delay: Duration,
}

impl CountingExchange {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialExchange for CountingExchange {
    async fn exchange(&self, _credentials: &Credentials) -> Result<Token, AuthError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token::bearer(
            format!("token-{}", n),
            Utc::now() + chrono::Duration::hours(1),
        ))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Retry policy without waiting between attempts.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_jitter(0.0)
}

/// Session config with fast retries and a short cancel grace.
pub fn test_config() -> SessionConfig {
    SessionConfig::default()
        .with_retry_policy(fast_retry())
        .with_cancel_grace(Duration::from_millis(200))
}

/// A session over a scripted transport.
pub fn scripted_session(
    attempts: Vec<Attempt>,
    config: SessionConfig,
) -> (QuerySession, Arc<ScriptedTransport>, Arc<CountingExchange>) {
    session_over(ScriptedTransport::new(attempts), config)
}

/// A session over an already scripted transport.
pub fn session_over(
    transport: ScriptedTransport,
    config: SessionConfig,
) -> (QuerySession, Arc<ScriptedTransport>, Arc<CountingExchange>) {
    let transport = Arc::new(transport);
    let exchange = Arc::new(CountingExchange::default());
    let tokens = TokenProvider::new(exchange.clone(), Credentials::new("client", "secret"));
    let session = QuerySession::new(transport.clone(), Arc::new(tokens), config);
    (session, transport, exchange)
}

/// A single nullable BIGINT column named `n`.
pub fn int_batch(values: &[Option<i64>]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, true)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
        .expect("valid batch")
}

/// A frame carrying `values` as batch `sequence`.
pub fn frame(sequence: u64, values: &[i64]) -> Step {
    let values: Vec<Option<i64>> = values.iter().copied().map(Some).collect();
    Step::Frame(QueryFrame::batch(sequence, int_batch(&values)))
}

pub fn end(sequence: u64) -> Step {
    Step::Frame(QueryFrame::end(sequence))
}

// ============================================================================
// Live service configuration
// ============================================================================

/// Default host of the query service.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port of the query service.
pub const DEFAULT_PORT: u16 = 7484;

/// Default OAuth client id.
pub const DEFAULT_CLIENT_ID: &str = "test-client";

/// Default credential exchange URL.
pub const DEFAULT_LOGIN_URL: &str = "http://localhost:8080";

pub fn get_host() -> String {
    env::var("HYPER_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string())
}

/// Port from `HYPER_PORT`; invalid values fall back to the default.
pub fn get_port() -> u16 {
    env::var("HYPER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub fn get_client_id() -> String {
    env::var("HYPER_CLIENT_ID").unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_string())
}

pub fn get_client_secret() -> String {
    env::var("HYPER_CLIENT_SECRET").unwrap_or_default()
}

pub fn get_login_url() -> String {
    env::var("HYPER_LOGIN_URL").unwrap_or_else(|_| DEFAULT_LOGIN_URL.to_string())
}

pub fn get_transport() -> String {
    env::var("HYPER_TRANSPORT").unwrap_or_else(|_| "grpc".to_string())
}

/// Connection string for the live service.
///
/// TLS is off: local test servers run plaintext.
pub fn get_test_connection_string() -> String {
    format!(
        "hyper://{}:{}@{}:{}?tls=false&transport={}&login_url={}",
        urlencoding::encode(&get_client_id()),
        urlencoding::encode(&get_client_secret()),
        get_host(),
        get_port(),
        get_transport(),
        urlencoding::encode(&get_login_url())
    )
}

/// Open a session against the live service.
pub async fn get_test_session() -> Result<QuerySession, hyperarrow_rs::HyperError> {
    let params = get_test_connection_string().parse()?;
    QuerySession::connect(params).await
}

/// Check if the query service accepts TCP connections.
pub fn is_hyper_available() -> bool {
    let addr = format!("{}:{}", get_host(), get_port());
    let socket_addrs: Vec<_> = match addr.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(_) => return false,
    };
    socket_addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, Duration::from_secs(2)).is_ok())
}

/// Skip a test if the query service is not reachable.
#[macro_export]
macro_rules! skip_if_no_hyper {
    () => {
        if !$crate::common::is_hyper_available() {
            eprintln!(
                "Skipping test: query service not available at {}:{}",
                $crate::common::get_host(),
                $crate::common::get_port()
            );
            return;
        }
    };
}
