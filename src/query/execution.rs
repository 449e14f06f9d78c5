//! Streaming query execution.
//!
//! A [`QueryExecution`] drives one SQL submission through
//! `Submitting -> AwaitingFirstBatch -> Streaming -> Draining -> Complete`,
//! with `Failed` and `Cancelled` reachable from every non-terminal state.
//!
//! The result stream is pull-driven: frames are only requested from the
//! transport once the consumer has taken every buffered batch, and then only
//! until `fetch_size` rows are buffered again. Submissions are retried while
//! no batch has been observed; after that a failure ends the execution.

use crate::connection::auth::{Token, TokenProvider};
use crate::error::{truncate_query, ExecutionContext, HyperError, QueryError};
use crate::query::results::RowCursor;
use crate::resilience::{
    is_auth_rejection, proves_reachable, Admission, CircuitBreaker, ErrorClass, RetryPolicy,
};
use crate::transport::{FrameStream, QueryFrame, QueryRequest, QueryTransport};
use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Protocol state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// The query is being sent, possibly for the second or third time
    Submitting,
    /// The stream is open and no batch has arrived yet
    AwaitingFirstBatch,
    /// Batches are arriving
    Streaming,
    /// The server ended the stream; buffered batches remain readable
    Draining,
    /// Every batch was consumed
    Complete,
    Failed,
    Cancelled,
}

/// Coarse lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Complete | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self {
            ExecutionState::Submitting | ExecutionState::AwaitingFirstBatch => Lifecycle::Pending,
            ExecutionState::Streaming | ExecutionState::Draining => Lifecycle::Streaming,
            ExecutionState::Complete => Lifecycle::Complete,
            ExecutionState::Failed => Lifecycle::Failed,
            ExecutionState::Cancelled => Lifecycle::Cancelled,
        }
    }
}

/// A received batch of rows. Never modified after arrival.
#[derive(Debug, Clone)]
pub struct Batch {
    pub sequence_number: u64,
    pub data: RecordBatch,
}

impl Batch {
    pub fn num_rows(&self) -> usize {
        self.data.num_rows()
    }
}

/// Why an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for it
    Caller,
    /// The owning session was closed
    SessionClosed,
}

#[derive(Debug)]
struct ExecutionControl {
    execution_id: u64,
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
    /// Id of the current submission; replaced when the query is resubmitted
    query_id: Mutex<Option<String>>,
    server_cancel_sent: AtomicBool,
    finished: AtomicBool,
}

/// Cancels an execution from any task.
///
/// Cancellation is cooperative: a pull in flight is aborted and the
/// execution moves to `Cancelled` the next time it is driven.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    control: Arc<ExecutionControl>,
}

impl CancelHandle {
    pub(crate) fn new(execution_id: u64) -> Self {
        Self {
            control: Arc::new(ExecutionControl {
                execution_id,
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                query_id: Mutex::new(None),
                server_cancel_sent: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Caller);
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        let _ = self.control.reason.set(reason);
        self.control.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.token.is_cancelled()
    }

    pub fn execution_id(&self) -> u64 {
        self.control.execution_id
    }

    /// Query id the service assigned to the current submission, once known.
    pub fn query_id(&self) -> Option<String> {
        self.control.query_id.lock().clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.control.finished.load(Ordering::SeqCst)
    }

    fn set_query_id(&self, query_id: &str) {
        let mut current = self.control.query_id.lock();
        if current.as_deref() != Some(query_id) {
            *current = Some(query_id.to_string());
        }
    }

    fn clear_query_id(&self) {
        *self.control.query_id.lock() = None;
    }

    fn mark_finished(&self) {
        self.control.finished.store(true, Ordering::SeqCst);
    }

    /// Error reported once cancellation has been observed.
    fn error(&self) -> HyperError {
        match self.control.reason.get() {
            Some(CancelReason::SessionClosed) => QueryError::SessionClosed.into(),
            _ => QueryError::Cancelled.into(),
        }
    }

    async fn cancelled(&self) {
        self.control.token.cancelled().await
    }
}

/// Collaborators an execution borrows from its session.
#[derive(Clone)]
pub(crate) struct ExecutionEnv {
    pub transport: Arc<dyn QueryTransport>,
    pub tokens: Arc<TokenProvider>,
    pub retry: RetryPolicy,
    pub breaker: Arc<CircuitBreaker>,
    /// Upper bound on a best-effort server cancel
    pub cancel_grace: Duration,
}

/// Ask the service to stop the query behind `handle`, at most once.
///
/// Failures are logged and otherwise ignored.
pub(crate) async fn cancel_on_server(env: &ExecutionEnv, handle: &CancelHandle) {
    let Some(query_id) = handle.query_id() else {
        return;
    };
    if handle.control.server_cancel_sent.swap(true, Ordering::SeqCst) {
        return;
    }

    let request = async {
        let token = env.tokens.get_token().await?;
        env.transport.cancel_query(&query_id, &token).await?;
        Ok::<_, HyperError>(())
    };
    match tokio::time::timeout(env.cancel_grace, request).await {
        Ok(Ok(())) => debug!(
            execution_id = handle.execution_id(),
            query_id = %query_id,
            "Query cancelled on server"
        ),
        Ok(Err(e)) => warn!(query_id = %query_id, error = %e, "Failed to cancel query on server"),
        Err(_) => warn!(
            query_id = %query_id,
            grace = ?env.cancel_grace,
            "Timed out cancelling query on server"
        ),
    }
}

/// Run `future` unless the execution is cancelled or its deadline passes.
async fn bounded<T, E>(
    handle: &CancelHandle,
    deadline: Option<Instant>,
    timeout: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, HyperError>
where
    HyperError: From<E>,
{
    let work = async {
        match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, future).await {
                Ok(result) => result.map_err(HyperError::from),
                Err(_) => Err(QueryError::DeadlineExceeded {
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into()),
            },
            None => future.await.map_err(HyperError::from),
        }
    };

    tokio::select! {
        biased;
        _ = handle.cancelled() => Err(handle.error()),
        result = work => result,
    }
}

/// Where an execution's frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResultSource {
    /// Submit the SQL and stream its result
    Submit,
    /// A row range of a query submitted earlier
    Rows {
        query_id: String,
        offset: u64,
        limit: u64,
    },
    /// One result chunk of a query submitted earlier
    Chunk { query_id: String, chunk: u64 },
}

impl ResultSource {
    fn query_id(&self) -> Option<&str> {
        match self {
            ResultSource::Submit => None,
            ResultSource::Rows { query_id, .. } | ResultSource::Chunk { query_id, .. } => {
                Some(query_id)
            }
        }
    }
}

/// Frames accepted by [`FrameTracker::accept`].
#[derive(Debug)]
pub(crate) struct Accepted {
    pub batch: Option<Batch>,
    pub end_of_stream: bool,
}

/// Checks the ordering and shape of incoming frames.
#[derive(Debug, Default)]
pub(crate) struct FrameTracker {
    next_sequence: u64,
    schema: Option<SchemaRef>,
    finished: bool,
}

impl FrameTracker {
    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    /// Validate a frame against everything received before it.
    pub fn accept(&mut self, frame: QueryFrame) -> Result<Accepted, QueryError> {
        let sequence = frame.sequence_number;
        if self.finished {
            return Err(violation(format!(
                "frame {} received after end of stream",
                sequence
            )));
        }
        if sequence != self.next_sequence {
            return Err(violation(format!(
                "expected sequence number {}, received {}",
                self.next_sequence, sequence
            )));
        }
        self.next_sequence += 1;

        if frame.row_count < 0 {
            return Err(violation(format!(
                "frame {} declares negative row count {}",
                sequence, frame.row_count
            )));
        }

        if let Some(schema) = frame.schema {
            match &self.schema {
                Some(established) if established.fields() != schema.fields() => {
                    return Err(violation(format!(
                        "frame {} changes the result schema",
                        sequence
                    )));
                }
                Some(_) => {}
                None => self.schema = Some(schema),
            }
        }

        let batch = match frame.batch {
            Some(data) => {
                if data.num_rows() as i64 != frame.row_count {
                    return Err(violation(format!(
                        "frame {} declares {} rows but carries {}",
                        sequence,
                        frame.row_count,
                        data.num_rows()
                    )));
                }
                let schema = self.schema.get_or_insert_with(|| data.schema());
                if data.num_columns() != schema.fields().len() {
                    return Err(violation(format!(
                        "frame {} has {} columns, schema declares {}",
                        sequence,
                        data.num_columns(),
                        schema.fields().len()
                    )));
                }
                for (index, (field, column)) in
                    schema.fields().iter().zip(data.columns()).enumerate()
                {
                    if field.data_type() != column.data_type() {
                        return Err(violation(format!(
                            "frame {} column {} is {}, schema declares {}",
                            sequence,
                            index,
                            column.data_type(),
                            field.data_type()
                        )));
                    }
                }
                Some(Batch {
                    sequence_number: sequence,
                    data,
                })
            }
            None if frame.row_count > 0 => {
                return Err(violation(format!(
                    "frame {} declares {} rows but has no payload",
                    sequence, frame.row_count
                )));
            }
            None => None,
        };

        self.finished = frame.end_of_stream;
        Ok(Accepted {
            batch,
            end_of_stream: frame.end_of_stream,
        })
    }
}

fn violation(message: String) -> QueryError {
    QueryError::ProtocolViolation(message)
}

/// One SQL submission and its result stream.
///
/// Driven by a single consumer. Use [`QueryExecution::cancel_handle`] to
/// cancel from elsewhere.
pub struct QueryExecution {
    env: ExecutionEnv,
    request: QueryRequest,
    source: ResultSource,
    handle: CancelHandle,
    state: ExecutionState,
    stream: Option<Box<dyn FrameStream>>,
    tracker: FrameTracker,
    buffer: VecDeque<Batch>,
    buffered_rows: usize,
    deadline: Option<Instant>,
    /// Token of the most recent submission
    submitted_with: Option<Arc<Token>>,
    /// Holds the circuit breaker's half-open trial
    trial: bool,
    last_consumed: Option<u64>,
    rows_delivered: u64,
    failure: Option<HyperError>,
}

impl QueryExecution {
    /// Submit the query and wait for its first batch or an empty result.
    ///
    /// # Errors
    ///
    /// Returns the classified error once retries are exhausted. No rows are
    /// exposed in that case.
    ///
    /// A fetch source reads a range of a query submitted earlier. Cancelling
    /// such an execution stops the read but leaves the query running.
    pub(crate) async fn start(
        env: ExecutionEnv,
        request: QueryRequest,
        source: ResultSource,
        handle: CancelHandle,
    ) -> Result<Self, HyperError> {
        let timeout = request.options.timeout;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        let mut execution = Self {
            env,
            request,
            source,
            handle,
            state: ExecutionState::Submitting,
            stream: None,
            tracker: FrameTracker::default(),
            buffer: VecDeque::new(),
            buffered_rows: 0,
            deadline,
            submitted_with: None,
            trial: false,
            last_consumed: None,
            rows_delivered: 0,
            failure: None,
        };

        match execution.submit().await {
            Ok(()) => Ok(execution),
            Err(e) => {
                execution.abandon(e).await;
                Err(execution.replay())
            }
        }
    }

    pub fn execution_id(&self) -> u64 {
        self.handle.execution_id()
    }

    pub fn query_id(&self) -> Option<String> {
        match self.source.query_id() {
            Some(query_id) => Some(query_id.to_string()),
            None => self.handle.query_id(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.request.sql
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Result schema, once declared by the server.
    pub fn schema(&self) -> Option<SchemaRef> {
        self.tracker.schema().cloned()
    }

    /// Rows handed to the consumer so far.
    pub fn rows_delivered(&self) -> u64 {
        self.rows_delivered
    }

    /// Rows received but not yet consumed.
    pub fn buffered_rows(&self) -> usize {
        self.buffered_rows
    }

    /// Sequence number of the last batch handed to the consumer.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_consumed
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Wrap the execution in a row cursor.
    pub fn into_cursor(self) -> RowCursor {
        RowCursor::new(self)
    }

    /// Take the next batch in sequence order.
    ///
    /// # Returns
    ///
    /// `None` once the stream ended and every batch was consumed.
    ///
    /// # Errors
    ///
    /// Buffered batches are always returned first. After that the error that
    /// ended the execution is returned on every call.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>, HyperError> {
        loop {
            if let Some(batch) = self.buffer.pop_front() {
                self.buffered_rows -= batch.num_rows();
                self.rows_delivered += batch.num_rows() as u64;
                self.last_consumed = Some(batch.sequence_number);
                return Ok(Some(batch));
            }

            if !self.state.is_terminal() && self.handle.is_cancelled() {
                let error = self.handle.error();
                self.abandon(error).await;
            }

            match self.state {
                ExecutionState::Streaming => self.fill().await,
                ExecutionState::Draining => self.finish(ExecutionState::Complete),
                ExecutionState::Complete => return Ok(None),
                ExecutionState::Failed | ExecutionState::Cancelled => return Err(self.replay()),
                ExecutionState::Submitting | ExecutionState::AwaitingFirstBatch => {
                    return Err(self.tag(
                        QueryError::InvalidState(format!(
                            "execution is still {:?}",
                            self.state
                        ))
                        .into(),
                    ));
                }
            }
        }
    }

    /// Cancel the execution.
    ///
    /// Sends a best-effort cancel to the service and stops reading the
    /// stream. Batches already buffered stay readable.
    pub async fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.handle.cancel();
        let error = self.handle.error();
        self.abandon(error).await;
    }

    /// Submit with retries, then settle the circuit breaker.
    async fn submit(&mut self) -> Result<(), HyperError> {
        let result = self.submit_with_retries().await;
        match &result {
            Ok(()) => self.breaker_success(),
            Err(e) if proves_reachable(e) => self.breaker_success(),
            Err(_) => self.breaker_release(),
        }
        result
    }

    async fn submit_with_retries(&mut self) -> Result<(), HyperError> {
        let mut failures = 0u32;
        let mut auth_refreshes = 0u32;
        let mut auth_retry = false;

        loop {
            let attempt = failures + auth_refreshes + 1;
            // An auth retry resubmits under the admission it already has.
            let admit = !auth_retry;
            auth_retry = false;
            let error = match self.attempt(attempt, admit).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match self.env.retry.classify(&error, auth_refreshes) {
                ErrorClass::Retryable if is_auth_rejection(&error) => {
                    auth_retry = true;
                    auth_refreshes += 1;
                    match &self.submitted_with {
                        Some(token) => self.env.tokens.invalidate_token(token),
                        None => self.env.tokens.invalidate(),
                    }
                    warn!(
                        execution_id = self.execution_id(),
                        attempt,
                        "Query rejected as unauthenticated, retrying with a fresh token"
                    );
                }
                ErrorClass::Retryable => {
                    if matches!(error.root(), HyperError::Transport(_)) {
                        self.breaker_failure();
                    }
                    failures += 1;
                    if !self.env.retry.can_retry(failures) {
                        return Err(error);
                    }
                    let delay = self.env.retry.backoff(failures);
                    warn!(
                        execution_id = self.execution_id(),
                        attempt,
                        ?delay,
                        error = %error,
                        "Query submission failed, retrying"
                    );
                    let pause = async {
                        tokio::time::sleep(delay).await;
                        Ok::<_, HyperError>(())
                    };
                    bounded(&self.handle, self.deadline, self.request.options.timeout, pause)
                        .await?;
                }
                ErrorClass::NonRetryable | ErrorClass::Fatal => return Err(error),
            }
        }
    }

    /// One submission, up to the first batch or an empty result.
    ///
    /// `admit` asks the circuit breaker for admission first, unless this
    /// execution already holds the half-open trial.
    async fn attempt(&mut self, attempt: u32, admit: bool) -> Result<(), HyperError> {
        self.state = ExecutionState::Submitting;
        self.stream = None;
        self.tracker = FrameTracker::default();
        self.handle.clear_query_id();

        if self.handle.is_cancelled() {
            return Err(self.handle.error());
        }
        if admit && !self.trial {
            self.trial = self.env.breaker.check()? == Admission::Trial;
        }

        let timeout = self.request.options.timeout;
        let token = bounded(
            &self.handle,
            self.deadline,
            timeout,
            self.env.tokens.get_token(),
        )
        .await?;
        self.submitted_with = Some(Arc::clone(&token));

        debug!(
            execution_id = self.execution_id(),
            attempt,
            source = ?self.source,
            fetch_size = self.request.options.fetch_size,
            "Submitting query"
        );
        let transport = &self.env.transport;
        let open = match &self.source {
            ResultSource::Submit => transport.execute_query(&self.request, &token),
            ResultSource::Rows {
                query_id,
                offset,
                limit,
            } => transport.fetch_rows(query_id, *offset, *limit, &token),
            ResultSource::Chunk { query_id, chunk } => {
                transport.fetch_chunk(query_id, *chunk, &token)
            }
        };
        let stream = bounded(&self.handle, self.deadline, timeout, open).await?;
        self.stream = Some(stream);
        self.state = ExecutionState::AwaitingFirstBatch;

        while self.state == ExecutionState::AwaitingFirstBatch {
            let frame = self.pull_frame().await?;
            self.accept(frame)?;
        }
        debug!(
            execution_id = self.execution_id(),
            query_id = self.query_id().as_deref(),
            state = ?self.state,
            "First result received"
        );
        Ok(())
    }

    async fn pull_frame(&mut self) -> Result<QueryFrame, HyperError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            HyperError::from(QueryError::InvalidState("result stream is not open".to_string()))
        })?;
        let frame = bounded(
            &self.handle,
            self.deadline,
            self.request.options.timeout,
            stream.next_frame(),
        )
        .await?;
        frame.ok_or_else(|| {
            violation("stream closed before end of stream".to_string()).into()
        })
    }

    fn accept(&mut self, frame: QueryFrame) -> Result<(), HyperError> {
        if let (ResultSource::Submit, Some(query_id)) = (&self.source, &frame.query_id) {
            self.handle.set_query_id(query_id);
        }

        let accepted = self.tracker.accept(frame)?;
        if let Some(batch) = accepted.batch {
            if batch.num_rows() > 0 {
                self.buffered_rows += batch.num_rows();
                self.buffer.push_back(batch);
                if self.state == ExecutionState::AwaitingFirstBatch {
                    self.state = ExecutionState::Streaming;
                }
            }
        }
        if accepted.end_of_stream {
            self.stream = None;
            self.state = ExecutionState::Draining;
        }
        Ok(())
    }

    /// Pull frames until `fetch_size` rows are buffered or the stream stops.
    async fn fill(&mut self) {
        let fetch_size = self.request.options.fetch_size.max(1);
        while self.state == ExecutionState::Streaming && self.buffered_rows < fetch_size {
            let result = match self.pull_frame().await {
                Ok(frame) => self.accept(frame),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.abandon(e).await;
            }
        }
    }

    /// Stop the execution because of `error`.
    async fn abandon(&mut self, error: HyperError) {
        if self.state.is_terminal() {
            return;
        }
        let stream_open = self.stream.take().is_some();

        let state = match error.root() {
            HyperError::Query(QueryError::Cancelled | QueryError::SessionClosed) => {
                ExecutionState::Cancelled
            }
            _ => ExecutionState::Failed,
        };
        // Session close cancels its queries itself.
        let server_may_run = stream_open
            && matches!(
                error.root(),
                HyperError::Query(
                    QueryError::Cancelled
                        | QueryError::DeadlineExceeded { .. }
                        | QueryError::ProtocolViolation(_)
                )
            );

        if state == ExecutionState::Failed {
            warn!(
                execution_id = self.execution_id(),
                query_id = self.query_id().as_deref(),
                last_sequence = self.last_consumed,
                error = %error,
                "Query execution failed"
            );
        } else {
            debug!(execution_id = self.execution_id(), "Query execution cancelled");
        }

        self.failure = Some(self.tag(error));
        self.finish(state);

        if server_may_run {
            cancel_on_server(&self.env, &self.handle).await;
        }
    }

    fn finish(&mut self, state: ExecutionState) {
        self.state = state;
        if state.is_terminal() {
            self.handle.mark_finished();
            if state == ExecutionState::Complete {
                debug!(
                    execution_id = self.execution_id(),
                    rows = self.rows_delivered,
                    "Query execution complete"
                );
            }
        }
    }

    fn replay(&self) -> HyperError {
        match &self.failure {
            Some(error) => error.clone(),
            None => self.tag(QueryError::InvalidState("execution has not failed".to_string()).into()),
        }
    }

    fn tag(&self, error: HyperError) -> HyperError {
        error.with_context(ExecutionContext {
            execution_id: self.execution_id(),
            query_id: self.query_id(),
            last_sequence: self.last_consumed,
            sql: (!self.request.sql.is_empty()).then(|| truncate_query(&self.request.sql)),
        })
    }
}

impl QueryExecution {
    fn breaker_success(&mut self) {
        self.trial = false;
        self.env.breaker.record_success();
    }

    fn breaker_failure(&mut self) {
        self.trial = false;
        self.env.breaker.record_failure();
    }

    fn breaker_release(&mut self) {
        if std::mem::take(&mut self.trial) {
            self.env.breaker.release();
        }
    }
}

impl Drop for QueryExecution {
    fn drop(&mut self) {
        self.breaker_release();
        self.handle.mark_finished();
    }
}

impl std::fmt::Debug for QueryExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecution")
            .field("execution_id", &self.execution_id())
            .field("query_id", &self.query_id())
            .field("state", &self.state)
            .field("buffered_rows", &self.buffered_rows)
            .field("rows_delivered", &self.rows_delivered)
            .field("last_sequence", &self.last_consumed)
            .finish()
    }
}
