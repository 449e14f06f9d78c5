//! HTTP fallback transport.
//!
//! Used where gRPC streaming is not reachable. A query is submitted once,
//! its status is polled, and result pages are fetched one by one as Arrow
//! IPC streams. Pages are turned into frames with the same numbering and
//! end-of-stream rules as the gRPC stream.
//!
//! Polls and page fetches happen long after submission, so they ask the
//! attached [`TokenSource`] for a token on every request instead of reusing
//! the submission token.

use super::deserialize::decode_batch;
use super::messages::{CompletionState, HttpQueryStatus, QueryStatusResponse, SubmitQueryBody};
use super::protocol::{
    CompletionStatus, Endpoint, FrameStream, QueryFrame, QueryRequest, QueryStatus, QueryTransport,
    TlsMode, TokenSource, TransportConfig,
};
use super::{classify_connect_failure, describe_error_chain};
use crate::connection::auth::Token;
use crate::error::TransportError;
use crate::resilience::{is_transient, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// HTTP transport implementation.
pub struct HttpTransport {
    inner: Arc<HttpClient>,
    closed: AtomicBool,
}

/// State shared between the transport and its open frame streams.
struct HttpClient {
    client: Client,
    endpoint: Endpoint,
    base_url: String,
    poll_interval: Duration,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    tokens: OnceLock<Arc<dyn TokenSource>>,
}

impl HttpTransport {
    /// Build an HTTP client for the configured endpoint.
    ///
    /// No request is sent here; connection failures surface on the first call.
    pub fn open(config: TransportConfig) -> Result<Self, TransportError> {
        config.endpoint.validate()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                TransportError::InvalidEndpoint(format!("invalid header name '{}'", name))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                TransportError::InvalidEndpoint(format!("invalid header value for '{}'", name))
            })?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .default_headers(headers);

        if let TlsMode::Verified {
            ca_certificate: Some(pem),
        } = &config.tls
        {
            let certificate = reqwest::Certificate::from_pem(pem)
                .map_err(|e| TransportError::TlsHandshake(describe_error_chain(&e)))?;
            builder = builder.add_root_certificate(certificate);
        }
        if config.tls.is_enabled() {
            builder = builder.https_only(true);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::TlsHandshake(describe_error_chain(&e)))?;

        let base_url = format!("{}/v1/queries", config.endpoint.uri(&config.tls));
        info!(endpoint = %config.endpoint, tls = config.tls.is_enabled(), "Opened HTTP transport");

        Ok(Self {
            inner: Arc::new(HttpClient {
                client,
                endpoint: config.endpoint,
                base_url,
                poll_interval: config.poll_interval,
                retry: RetryPolicy::default()
                    .with_max_attempts(config.max_request_attempts)
                    .with_backoff(Duration::from_millis(100), Duration::from_secs(2)),
                shutdown: CancellationToken::new(),
                tokens: OnceLock::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }
}

impl HttpClient {
    /// Send a request, racing it against transport shutdown.
    async fn send(&self, request: RequestBuilder, token: &Token) -> Result<Response, TransportError> {
        let request = request.header(AUTHORIZATION, token.authorization_header());
        let response = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
            response = request.send() => response.map_err(|e| self.map_error(&e))?,
        };
        check_status(response).await
    }

    /// Send an idempotent request, retrying transient failures.
    async fn send_idempotent<F>(&self, build: F, token: &Token) -> Result<Response, TransportError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            match self.send(build(), token).await {
                Ok(response) => return Ok(response),
                Err(e) if is_transient(&e) && self.retry.can_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, ?delay, error = %e, "Retrying HTTP request");
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `call` with a current token from the attached source.
    ///
    /// `held` is replaced by every token used. A rejected token is reported
    /// to the source and the call is repeated once with a fresh one. Without
    /// a source `held` is used as is.
    async fn with_token<T, F, Fut>(&self, held: &mut Arc<Token>, call: F) -> Result<T, TransportError>
    where
        F: Fn(Arc<Token>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let Some(source) = self.tokens.get() else {
            return call(Arc::clone(held)).await;
        };

        *held = source.token().await?;
        match call(Arc::clone(held)).await {
            Err(TransportError::Unauthenticated(message)) => {
                debug!(error = %message, "Token rejected while reading results, renewing");
                source.reject(held);
                *held = source.token().await?;
                call(Arc::clone(held)).await
            }
            other => other,
        }
    }

    async fn submit(&self, request: &QueryRequest, token: &Token) -> Result<QueryStatusResponse, TransportError> {
        let body = SubmitQueryBody::from(request);
        let response = self
            .send(self.client.post(&self.base_url).json(&body), token)
            .await?;
        parse_json(response).await
    }

    fn query_url(&self, query_id: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(query_id))
    }

    async fn status(&self, query_id: &str, token: &Token) -> Result<QueryStatusResponse, TransportError> {
        let url = self.query_url(query_id);
        let response = self.send_idempotent(|| self.client.get(&url), token).await?;
        parse_json(response).await
    }

    async fn fetch(&self, url: &str, token: &Token) -> Result<Bytes, TransportError> {
        let response = self.send_idempotent(|| self.client.get(url), token).await?;
        response
            .bytes()
            .await
            .map_err(|e| TransportError::InvalidResponse(describe_error_chain(&e)))
    }

    fn page_url(&self, query_id: &str, page: u64) -> String {
        format!("{}/pages/{}", self.query_url(query_id), page)
    }

    fn rows_url(&self, query_id: &str, offset: u64, limit: u64) -> String {
        format!(
            "{}/rows?offset={}&limit={}",
            self.query_url(query_id),
            offset,
            limit
        )
    }

    async fn cancel(&self, query_id: &str, token: &Token) -> Result<(), TransportError> {
        let url = self.query_url(query_id);
        self.send(self.client.delete(&url), token).await.map(|_| ())
    }

    fn map_error(&self, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::DeadlineExceeded(describe_error_chain(err))
        } else if err.is_connect() {
            classify_connect_failure(&self.endpoint, err)
        } else if err.is_decode() || err.is_body() {
            TransportError::InvalidResponse(describe_error_chain(err))
        } else {
            TransportError::Unavailable(describe_error_chain(err))
        }
    }
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => TransportError::Unauthenticated(body),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => {
            TransportError::Unavailable(format!("HTTP {}: {}", status.as_u16(), body))
        }
        _ => TransportError::Http {
            status: status.as_u16(),
            message: body,
        },
    })
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| TransportError::InvalidResponse(describe_error_chain(&e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Fail for queries the server reports as failed or cancelled.
fn check_failure(query_id: &str, status: &HttpQueryStatus) -> Result<(), TransportError> {
    match status.state {
        CompletionState::Failed => {
            let (message, sql_state) = match &status.error {
                Some(error) => (error.message.clone(), error.sql_state.clone()),
                None => ("query failed".to_string(), None),
            };
            Err(TransportError::Server {
                code: "FAILED".to_string(),
                sql_state,
                message,
            })
        }
        CompletionState::Cancelled => Err(TransportError::Cancelled(format!(
            "query {} was cancelled",
            query_id
        ))),
        _ => Ok(()),
    }
}

fn to_query_status(response: QueryStatusResponse) -> Result<QueryStatus, TransportError> {
    check_failure(&response.query_id, &response.status)?;
    let completion = match response.status.state {
        CompletionState::ResultsProduced => CompletionStatus::ResultsProduced,
        CompletionState::Finished => CompletionStatus::Finished,
        _ => CompletionStatus::Running,
    };
    Ok(QueryStatus {
        query_id: response.query_id,
        completion,
        chunk_count: response.status.page_count,
        row_count: response.status.row_count,
        progress: response.status.progress,
    })
}

#[async_trait]
impl QueryTransport for HttpTransport {
    async fn execute_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        self.ensure_open()?;
        let submitted = self.inner.submit(request, token).await?;
        debug!(query_id = %submitted.query_id, "Submitted query over HTTP");

        let mut stream = HttpFrameStream {
            client: Arc::clone(&self.inner),
            token: Arc::new(token.clone()),
            query_id: submitted.query_id,
            page_count: 0,
            next_page: 0,
            next_sequence: 0,
            all_produced: false,
            done: false,
            polled_without_progress: false,
        };
        stream.apply(submitted.status)?;
        Ok(Box::new(stream))
    }

    async fn submit_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<QueryStatus, TransportError> {
        self.ensure_open()?;
        let submitted = self.inner.submit(request, token).await?;
        debug!(query_id = %submitted.query_id, "Submitted async query over HTTP");
        to_query_status(submitted)
    }

    async fn query_status(&self, query_id: &str, token: &Token) -> Result<QueryStatus, TransportError> {
        self.ensure_open()?;
        to_query_status(self.inner.status(query_id, token).await?)
    }

    async fn fetch_rows(
        &self,
        query_id: &str,
        offset: u64,
        limit: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        self.ensure_open()?;
        Ok(Box::new(SinglePageStream {
            client: Arc::clone(&self.inner),
            token: Arc::new(token.clone()),
            url: self.inner.rows_url(query_id, offset, limit),
            query_id: query_id.to_string(),
            done: false,
        }))
    }

    async fn fetch_chunk(
        &self,
        query_id: &str,
        chunk: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        self.ensure_open()?;
        Ok(Box::new(SinglePageStream {
            client: Arc::clone(&self.inner),
            token: Arc::new(token.clone()),
            url: self.inner.page_url(query_id, chunk),
            query_id: query_id.to_string(),
            done: false,
        }))
    }

    async fn cancel_query(&self, query_id: &str, token: &Token) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.cancel(query_id, token).await
    }

    fn attach_token_source(&self, source: Arc<dyn TokenSource>) {
        if self.inner.tokens.set(source).is_err() {
            warn!("HTTP transport already has a token source");
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.cancel();
            info!(endpoint = %self.inner.endpoint, "Closed HTTP transport");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Pages of one submitted query, presented as frames.
struct HttpFrameStream {
    client: Arc<HttpClient>,
    /// Token of the latest request
    token: Arc<Token>,
    query_id: String,
    page_count: u64,
    next_page: u64,
    next_sequence: u64,
    all_produced: bool,
    done: bool,
    polled_without_progress: bool,
}

impl HttpFrameStream {
    fn apply(&mut self, status: HttpQueryStatus) -> Result<(), TransportError> {
        check_failure(&self.query_id, &status)?;

        self.polled_without_progress =
            status.page_count <= self.page_count && !status.state.all_results_produced();
        self.page_count = self.page_count.max(status.page_count);
        self.all_produced = status.state.all_results_produced();
        Ok(())
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

#[async_trait]
impl FrameStream for HttpFrameStream {
    async fn next_frame(&mut self) -> Result<Option<QueryFrame>, TransportError> {
        loop {
            if self.client.shutdown.is_cancelled() {
                return Err(TransportError::ChannelClosed);
            }
            if self.done {
                return Ok(None);
            }

            let client = &self.client;
            let query_id = self.query_id.as_str();

            if self.next_page < self.page_count {
                let url = client.page_url(query_id, self.next_page);
                let url = url.as_str();
                let bytes = client
                    .with_token(&mut self.token, |token| async move {
                        client.fetch(url, &token).await
                    })
                    .await?;
                let batch = decode_batch(&bytes)?;
                self.next_page += 1;

                let end_of_stream = self.all_produced && self.next_page == self.page_count;
                self.done = end_of_stream;
                let row_count = batch.as_ref().map_or(0, |b| b.num_rows() as i64);
                return Ok(Some(QueryFrame {
                    sequence_number: self.take_sequence(),
                    query_id: Some(self.query_id.clone()),
                    schema: batch.as_ref().map(|b| b.schema()),
                    batch,
                    row_count,
                    end_of_stream,
                }));
            }

            if self.all_produced {
                self.done = true;
                let sequence = self.take_sequence();
                return Ok(Some(
                    QueryFrame::end(sequence).with_query_id(self.query_id.clone()),
                ));
            }

            if self.polled_without_progress {
                tokio::select! {
                    biased;
                    _ = client.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
                    _ = tokio::time::sleep(client.poll_interval) => {}
                }
            }
            let status = client
                .with_token(&mut self.token, |token| async move {
                    client.status(query_id, &token).await
                })
                .await?;
            self.apply(status.status)?;
        }
    }
}

/// One result page fetched on demand: a single frame that ends the stream.
struct SinglePageStream {
    client: Arc<HttpClient>,
    token: Arc<Token>,
    url: String,
    query_id: String,
    done: bool,
}

#[async_trait]
impl FrameStream for SinglePageStream {
    async fn next_frame(&mut self) -> Result<Option<QueryFrame>, TransportError> {
        if self.client.shutdown.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }
        if self.done {
            return Ok(None);
        }

        let client = &self.client;
        let url = self.url.as_str();
        let bytes = client
            .with_token(&mut self.token, |token| async move {
                client.fetch(url, &token).await
            })
            .await?;
        let batch = decode_batch(&bytes)?;
        self.done = true;

        let row_count = batch.as_ref().map_or(0, |b| b.num_rows() as i64);
        Ok(Some(QueryFrame {
            sequence_number: 0,
            query_id: Some(self.query_id.clone()),
            schema: batch.as_ref().map(|b| b.schema()),
            batch,
            row_count,
            end_of_stream: true,
        }))
    }
}
