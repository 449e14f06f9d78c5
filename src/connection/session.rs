//! Query sessions.
//!
//! A [`QuerySession`] binds a transport and a token provider, holds the
//! session-scoped defaults, and issues query executions. Closing it cancels
//! every execution it started and releases the transport.

use super::auth::{Token, TokenProvider};
use super::exchange::HttpCredentialExchange;
use super::params::ConnectionParams;
use crate::error::{HyperError, QueryError, TransportError};
use crate::logging::init_logging;
use crate::query::execution::{
    cancel_on_server, CancelHandle, CancelReason, ExecutionEnv, ResultSource,
};
use crate::query::{QueryExecution, RowCursor};
use crate::resilience::{CircuitBreaker, CircuitState, RetryPolicy};
use crate::transport::{self, QueryOptions, QueryRequest, QueryStatus, QueryTransport, TokenSource};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Options for executions that do not bring their own
    pub default_options: QueryOptions,

    /// Largest fetch size a caller may request
    pub max_fetch_size: usize,

    /// Largest query timeout a caller may request, zero means unbounded
    pub max_query_timeout: Duration,

    /// Retry policy for query submissions
    pub retry: RetryPolicy,

    /// Consecutive transient failures that open the circuit, zero disables it
    pub breaker_threshold: u32,

    /// How long an open circuit rejects submissions
    pub breaker_open_duration: Duration,

    /// Upper bound on a best-effort server cancel
    pub cancel_grace: Duration,

    /// Pause between status polls while waiting on a submitted query
    pub status_poll_interval: Duration,
}

impl SessionConfig {
    pub const DEFAULT_MAX_FETCH_SIZE: usize = 100_000;

    /// Set the default execution options.
    pub fn with_default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Set the largest fetch size a caller may request.
    pub fn with_max_fetch_size(mut self, max_fetch_size: usize) -> Self {
        self.max_fetch_size = max_fetch_size;
        self
    }

    /// Set the largest query timeout a caller may request.
    pub fn with_max_query_timeout(mut self, timeout: Duration) -> Self {
        self.max_query_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Configure the circuit breaker.
    pub fn with_circuit_breaker(mut self, threshold: u32, open_duration: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_open_duration = open_duration;
        self
    }

    /// Set the grace period for server cancels.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_options: QueryOptions::default(),
            max_fetch_size: Self::DEFAULT_MAX_FETCH_SIZE,
            max_query_timeout: Duration::ZERO,
            retry: RetryPolicy::default(),
            breaker_threshold: 5,
            breaker_open_duration: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
            status_poll_interval: Duration::from_millis(100),
        }
    }
}

/// One logical connection to the query service.
pub struct QuerySession {
    transport: Arc<dyn QueryTransport>,
    tokens: Arc<TokenProvider>,
    config: SessionConfig,
    breaker: Arc<CircuitBreaker>,
    /// Defaults that session-scoped setters change
    defaults: RwLock<QueryOptions>,
    executions: Mutex<HashMap<u64, CancelHandle>>,
    next_execution: AtomicU64,
    closed: AtomicBool,
}

impl QuerySession {
    /// Open a session from connection parameters.
    ///
    /// Opens the configured transport and exchanges the credentials for a
    /// first token, so bad credentials fail here rather than on the first
    /// query.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the service cannot be reached and
    /// `AuthError` if the credentials are refused.
    pub async fn connect(params: ConnectionParams) -> Result<Self, HyperError> {
        init_logging(&params.log_config());
        info!(
            endpoint = %params.endpoint(),
            transport = ?params.transport,
            client_id = %params.client_id,
            "Opening query session"
        );

        let transport = transport::open(params.transport, params.transport_config()).await?;
        let exchange = HttpCredentialExchange::new(&params.login_url(), params.connection_timeout)?;
        let tokens = TokenProvider::new(Arc::new(exchange), params.credentials())
            .with_skew(params.token_skew);

        let session = Self::new(transport, Arc::new(tokens), params.session_config());
        if let Err(e) = session.tokens.get_token().await {
            if let Err(close_error) = session.transport.close().await {
                debug!(error = %close_error, "Failed to close transport after auth failure");
            }
            return Err(e.into());
        }
        Ok(session)
    }

    /// Create a session over already opened collaborators.
    pub fn new(
        transport: Arc<dyn QueryTransport>,
        tokens: Arc<TokenProvider>,
        config: SessionConfig,
    ) -> Self {
        transport.attach_token_source(Arc::clone(&tokens) as Arc<dyn TokenSource>);
        let breaker = if config.breaker_threshold == 0 {
            CircuitBreaker::disabled()
        } else {
            CircuitBreaker::new(config.breaker_threshold, config.breaker_open_duration)
        };
        Self {
            transport,
            tokens,
            defaults: RwLock::new(config.default_options.clone()),
            config,
            breaker: Arc::new(breaker),
            executions: Mutex::new(HashMap::new()),
            next_execution: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Get session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn token_provider(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Submit a query.
    ///
    /// `options` of `None` uses the session defaults. Explicit options
    /// inherit the session catalog and settings they do not override. A zero
    /// timeout becomes the configured maximum.
    ///
    /// # Returns
    ///
    /// The execution, positioned after its first batch or its empty result.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::InvalidArgument` for empty SQL or out-of-bounds
    /// options, `QueryError::SessionClosed` after `close()`, and otherwise
    /// the classified error of the submission.
    pub async fn execute(
        &self,
        sql: &str,
        options: Option<QueryOptions>,
    ) -> Result<QueryExecution, HyperError> {
        self.ensure_open()?;
        check_sql(sql)?;
        let options = self.resolve_options(options).await;
        self.validate_options(&options)?;
        self.start(QueryRequest::new(sql, options), ResultSource::Submit)
            .await
    }

    /// Submit a query and return without waiting for results.
    ///
    /// The query keeps running on the service. Follow it with
    /// [`QuerySession::wait_for_status`] and read its results with
    /// [`QuerySession::fetch_rows`] or [`QuerySession::fetch_chunk`]. Closing
    /// the session does not cancel it; use [`QuerySession::cancel_query`].
    ///
    /// # Returns
    ///
    /// The first status the service reported, carrying the query id.
    pub async fn execute_async(
        &self,
        sql: &str,
        options: Option<QueryOptions>,
    ) -> Result<QueryStatus, HyperError> {
        self.ensure_open()?;
        check_sql(sql)?;
        let options = self.resolve_options(options).await;
        self.validate_options(&options)?;

        let request = QueryRequest::new(sql, options);
        let request = &request;
        let status = self
            .with_token(move |transport, token| async move {
                transport.submit_query(request, &token).await
            })
            .await?;
        info!(query_id = %status.query_id, completion = ?status.completion, "Query submitted");
        Ok(status)
    }

    /// Current status of a submitted query.
    ///
    /// # Errors
    ///
    /// A query that failed or was cancelled on the service is reported as an
    /// error.
    pub async fn query_status(&self, query_id: &str) -> Result<QueryStatus, HyperError> {
        self.ensure_open()?;
        check_query_id(query_id)?;
        self.with_token(move |transport, token| async move {
            transport.query_status(query_id, &token).await
        })
        .await
    }

    /// Poll the status of a submitted query until `predicate` holds.
    ///
    /// Polling also stops once the query finished, since its status cannot
    /// change after that.
    ///
    /// # Returns
    ///
    /// The first status that satisfies `predicate`, otherwise the last status
    /// seen when the query finished or `timeout` elapsed.
    ///
    /// # Errors
    ///
    /// Fails if no status could be read at all. Transient failures after the
    /// first status are retried until the deadline.
    pub async fn wait_for_status<P>(
        &self,
        query_id: &str,
        timeout: Duration,
        predicate: P,
    ) -> Result<QueryStatus, HyperError>
    where
        P: Fn(&QueryStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut last: Option<QueryStatus> = None;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.query_status(query_id).await {
                Ok(status) => {
                    if predicate(&status) || status.is_finished() {
                        return Ok(status);
                    }
                    last = Some(status);
                }
                Err(e) => match &last {
                    Some(status)
                        if Instant::now() < deadline && is_transient_error(&e) =>
                    {
                        warn!(
                            query_id,
                            polls,
                            last_status = ?status.completion,
                            error = %e,
                            "Failed to read query status, polling again"
                        );
                    }
                    _ => return Err(e),
                },
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline.min(now + self.config.status_poll_interval)).await;
        }

        match last {
            Some(status) => {
                debug!(query_id, polls, "Reached deadline waiting for query status");
                Ok(status)
            }
            None => Err(QueryError::DeadlineExceeded {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    /// Wait until rows `offset..offset + limit` of a submitted query exist.
    ///
    /// With `allow_less` any row past `offset` is enough.
    pub async fn wait_for_rows(
        &self,
        query_id: &str,
        offset: u64,
        limit: u64,
        timeout: Duration,
        allow_less: bool,
    ) -> Result<QueryStatus, HyperError> {
        self.wait_for_status(query_id, timeout, |status| {
            if allow_less {
                status.row_count > offset
            } else {
                status.row_count >= offset.saturating_add(limit)
            }
        })
        .await
    }

    /// Wait until a submitted query has produced all of its results.
    pub async fn wait_for_results_produced(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<QueryStatus, HyperError> {
        self.wait_for_status(query_id, timeout, QueryStatus::all_results_produced)
            .await
    }

    /// Read rows `offset..offset + limit` of a submitted query.
    ///
    /// Cancelling the returned cursor stops the read; the query itself keeps
    /// running.
    pub async fn fetch_rows(
        &self,
        query_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<RowCursor, HyperError> {
        self.ensure_open()?;
        check_query_id(query_id)?;
        if limit == 0 {
            return Err(QueryError::InvalidArgument {
                parameter: "limit".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }
        let source = ResultSource::Rows {
            query_id: query_id.to_string(),
            offset,
            limit,
        };
        self.fetch(source).await
    }

    /// Read one result chunk of a submitted query.
    pub async fn fetch_chunk(&self, query_id: &str, chunk: u64) -> Result<RowCursor, HyperError> {
        self.ensure_open()?;
        check_query_id(query_id)?;
        let source = ResultSource::Chunk {
            query_id: query_id.to_string(),
            chunk,
        };
        self.fetch(source).await
    }

    /// Ask the service to stop a submitted query.
    pub async fn cancel_query(&self, query_id: &str) -> Result<(), HyperError> {
        self.ensure_open()?;
        check_query_id(query_id)?;
        self.with_token(move |transport, token| async move {
            transport.cancel_query(query_id, &token).await
        })
        .await?;
        info!(query_id, "Query cancelled");
        Ok(())
    }

    async fn fetch(&self, source: ResultSource) -> Result<RowCursor, HyperError> {
        let mut options = self.resolve_options(None).await;
        options.settings.clear();
        let execution = self.start(QueryRequest::new("", options), source).await?;
        Ok(execution.into_cursor())
    }

    /// Register an execution and drive it to its first batch.
    async fn start(
        &self,
        request: QueryRequest,
        source: ResultSource,
    ) -> Result<QueryExecution, HyperError> {
        let execution_id = self.next_execution.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = CancelHandle::new(execution_id);
        {
            let mut executions = self.executions.lock();
            executions.retain(|_, handle| !handle.is_finished());
            executions.insert(execution_id, handle.clone());
        }
        // close() may have drained the registry before the insert.
        if self.is_closed() {
            handle.cancel_with(CancelReason::SessionClosed);
        }

        debug!(execution_id, catalog = ?request.options.catalog, "Executing query");
        QueryExecution::start(self.env(), request, source, handle).await
    }

    /// Run a unary call with a valid token, renewing a rejected one.
    async fn with_token<T, F, Fut>(&self, call: F) -> Result<T, HyperError>
    where
        F: Fn(Arc<dyn QueryTransport>, Arc<Token>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut refreshes = 0u32;
        loop {
            let token = self.tokens.get_token().await?;
            match call(Arc::clone(&self.transport), Arc::clone(&token)).await {
                Err(TransportError::Unauthenticated(message))
                    if refreshes < self.config.retry.auth_refresh_attempts =>
                {
                    refreshes += 1;
                    self.tokens.invalidate_token(&token);
                    warn!(message = %message, "Call rejected as unauthenticated, retrying with a fresh token");
                }
                result => return result.map_err(HyperError::from),
            }
        }
    }

    /// Submit a query with the session defaults and return a row cursor.
    pub async fn query(&self, sql: &str) -> Result<RowCursor, HyperError> {
        Ok(self.execute(sql, None).await?.into_cursor())
    }

    /// Current catalog.
    pub async fn catalog(&self) -> Option<String> {
        self.defaults.read().await.catalog.clone()
    }

    /// Set the catalog used by later executions.
    pub async fn set_catalog(&self, catalog: Option<String>) {
        self.defaults.write().await.catalog = catalog;
    }

    /// Set a server-side query setting for later executions.
    pub async fn set_query_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        self.defaults
            .write()
            .await
            .settings
            .insert(key.into(), value.into());
    }

    /// Current default options.
    pub async fn default_options(&self) -> QueryOptions {
        self.defaults.read().await.clone()
    }

    /// Executions that have not finished yet.
    pub fn open_executions(&self) -> usize {
        self.executions
            .lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Close the session.
    ///
    /// Cancels every open execution, asks the service to stop their queries,
    /// and closes the transport. Calling it again does nothing.
    pub async fn close(&self) -> Result<(), HyperError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let open: Vec<CancelHandle> = self
            .executions
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .filter(|handle| !handle.is_finished())
            .collect();
        info!(open_executions = open.len(), "Closing query session");

        for handle in &open {
            handle.cancel_with(CancelReason::SessionClosed);
        }
        let env = self.env();
        for handle in &open {
            cancel_on_server(&env, handle).await;
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to close transport");
            return Err(e.into());
        }
        Ok(())
    }

    /// Check if session is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), HyperError> {
        if self.is_closed() || self.transport.is_closed() {
            return Err(QueryError::SessionClosed.into());
        }
        Ok(())
    }

    async fn resolve_options(&self, options: Option<QueryOptions>) -> QueryOptions {
        let defaults = self.defaults.read().await;
        let mut options = match options {
            None => defaults.clone(),
            Some(mut options) => {
                if options.catalog.is_none() {
                    options.catalog = defaults.catalog.clone();
                }
                for (key, value) in &defaults.settings {
                    options
                        .settings
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                options
            }
        };
        if options.timeout.is_zero() {
            options.timeout = self.config.max_query_timeout;
        }
        options
    }

    fn validate_options(&self, options: &QueryOptions) -> Result<(), QueryError> {
        if options.fetch_size == 0 || options.fetch_size > self.config.max_fetch_size {
            return Err(QueryError::InvalidArgument {
                parameter: "fetch_size".to_string(),
                message: format!(
                    "must be between 1 and {}, got {}",
                    self.config.max_fetch_size, options.fetch_size
                ),
            });
        }
        let max_timeout = self.config.max_query_timeout;
        if !max_timeout.is_zero() && options.timeout > max_timeout {
            return Err(QueryError::InvalidArgument {
                parameter: "timeout".to_string(),
                message: format!(
                    "must not exceed {} ms, got {} ms",
                    max_timeout.as_millis(),
                    options.timeout.as_millis()
                ),
            });
        }
        Ok(())
    }

    fn env(&self) -> ExecutionEnv {
        ExecutionEnv {
            transport: Arc::clone(&self.transport),
            tokens: Arc::clone(&self.tokens),
            retry: self.config.retry.clone(),
            breaker: Arc::clone(&self.breaker),
            cancel_grace: self.config.cancel_grace,
        }
    }
}

fn check_sql(sql: &str) -> Result<(), QueryError> {
    if sql.trim().is_empty() {
        return Err(QueryError::InvalidArgument {
            parameter: "sql".to_string(),
            message: "SQL text is empty".to_string(),
        });
    }
    Ok(())
}

fn check_query_id(query_id: &str) -> Result<(), QueryError> {
    if query_id.is_empty() {
        return Err(QueryError::InvalidArgument {
            parameter: "query_id".to_string(),
            message: "query id is empty".to_string(),
        });
    }
    Ok(())
}

fn is_transient_error(error: &HyperError) -> bool {
    match error.root() {
        HyperError::Transport(e) => crate::resilience::is_transient(e),
        _ => false,
    }
}

impl std::fmt::Debug for QuerySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySession")
            .field("tokens", &self.tokens)
            .field("config", &self.config)
            .field("open_executions", &self.open_executions())
            .field("closed", &self.is_closed())
            .finish()
    }
}
