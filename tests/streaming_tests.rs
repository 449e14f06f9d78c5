//! End-to-end tests of query execution over a scripted transport.
//!
//! Each test scripts what the service does for every submission and then
//! drives `QuerySession` through its public API.

mod common;

use common::{
    end, fast_retry, frame, int_batch, scripted_session, session_over, test_config, Attempt,
    CountingExchange, ScriptedTransport, Step,
};
use futures_util::future::join_all;
use hyperarrow_rs::connection::auth::{Credentials, TokenProvider};
use hyperarrow_rs::connection::QuerySession;
use hyperarrow_rs::error::{ErrorKind, HyperError, QueryError, TransportError};
use hyperarrow_rs::query::ExecutionState;
use hyperarrow_rs::resilience::CircuitState;
use hyperarrow_rs::transport::{CompletionStatus, QueryFrame, QueryOptions, QueryStatus};
use hyperarrow_rs::types::{SqlType, TypedValue};
use std::sync::Arc;
use std::time::Duration;

fn unavailable() -> TransportError {
    TransportError::Unavailable("service restarting".to_string())
}

fn unauthenticated() -> TransportError {
    TransportError::Unauthenticated("token expired".to_string())
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_select_one_yields_single_row() {
    let first = QueryFrame::batch(0, int_batch(&[Some(1)]))
        .with_query_id("q-1")
        .with_end_of_stream();
    let (session, transport, _) =
        scripted_session(vec![Attempt::Stream(vec![Step::Frame(first)])], test_config());

    let mut cursor = session.query("SELECT 1").await.unwrap();
    let row = cursor.next().await.unwrap().expect("one row");
    assert_eq!(row.get(0, SqlType::BigInt).unwrap(), TypedValue::BigInt(1));
    assert_eq!(row.row_number(), 1);

    assert!(cursor.next().await.unwrap().is_none());
    assert_eq!(cursor.state(), ExecutionState::Complete);
    assert!(cursor.next().await.unwrap().is_none());
    assert_eq!(transport.submissions(), 1);
}

#[tokio::test]
async fn test_rows_across_batches_in_sequence_order() {
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![
            frame(0, &[1, 2]),
            frame(1, &[3]),
            frame(2, &[4, 5]),
            end(3),
        ])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    let mut seen = Vec::new();
    while let Some(row) = cursor.next().await.unwrap() {
        match row.value(0).unwrap() {
            TypedValue::BigInt(n) => seen.push(n),
            other => panic!("unexpected value {:?}", other),
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(cursor.row_number(), 5);
    assert_eq!(cursor.execution().last_sequence(), Some(2));
}

#[tokio::test]
async fn test_null_bitmap_is_checked_per_cell() {
    let batch = int_batch(&[Some(10), None, Some(30)]);
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![
            Step::Frame(QueryFrame::batch(0, batch)),
            end(1),
        ])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();

    cursor.next().await.unwrap().unwrap();
    assert_eq!(
        cursor.column_value(0, SqlType::BigInt).unwrap(),
        TypedValue::BigInt(10)
    );

    cursor.next().await.unwrap().unwrap();
    assert_eq!(cursor.column_value(0, SqlType::BigInt).unwrap(), TypedValue::Null);
    assert_eq!(cursor.column_value(0, SqlType::Varchar).unwrap(), TypedValue::Null);

    cursor.next().await.unwrap().unwrap();
    assert_eq!(
        cursor.column_value(0, SqlType::Integer).unwrap(),
        TypedValue::Integer(30)
    );
}

#[tokio::test]
async fn test_type_conversion_error_on_access() {
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![frame(0, &[1]), end(1)])],
        test_config(),
    );

    let mut cursor = session.query("SELECT 1").await.unwrap();
    cursor.next().await.unwrap().unwrap();
    let err = cursor.column_value(0, SqlType::Date).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeConversion);

    // A failed read leaves the cursor usable.
    assert!(cursor.column_value(0, SqlType::BigInt).is_ok());
}

#[tokio::test]
async fn test_empty_result() {
    let schema = int_batch(&[]).schema();
    let schema_frame = QueryFrame {
        sequence_number: 0,
        schema: Some(schema),
        ..Default::default()
    };
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![Step::Frame(schema_frame), end(1)])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t WHERE false").await.unwrap();
    let columns = cursor.columns().unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(columns[0].name, "n");
    assert_eq!(columns[0].sql_type, SqlType::BigInt);

    assert!(cursor.next().await.unwrap().is_none());
    assert_eq!(cursor.state(), ExecutionState::Complete);
}

// ============================================================================
// Protocol violations
// ============================================================================

#[tokio::test]
async fn test_sequence_gap_fails_execution() {
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![frame(0, &[1]), frame(2, &[2]), end(3)])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    assert!(cursor.next().await.unwrap().is_some());

    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(cursor.state(), ExecutionState::Failed);

    // The failure is replayed on every later pull.
    let again = cursor.next().await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_duplicate_sequence_fails_execution() {
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![frame(0, &[1]), frame(0, &[1])])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    cursor.next().await.unwrap();
    let err = cursor.next().await.unwrap_err();
    assert!(matches!(
        err.root(),
        HyperError::Query(QueryError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_out_of_order_first_frame_is_not_retried() {
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Stream(vec![frame(1, &[1])]),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        test_config(),
    );

    let err = session.execute("SELECT 1", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(transport.submissions(), 1);
}

#[tokio::test]
async fn test_stream_closed_without_end_is_protocol_error() {
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![frame(0, &[1])])],
        test_config(),
    );

    let mut cursor = session.query("SELECT 1").await.unwrap();
    cursor.next().await.unwrap();
    assert_eq!(cursor.next().await.unwrap_err().kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_error_is_tagged_with_last_sequence() {
    let first = QueryFrame::batch(0, int_batch(&[Some(1)])).with_query_id("q-77");
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![
            Step::Frame(first),
            Step::Fail(TransportError::Server {
                code: "Internal".to_string(),
                sql_state: Some("XX000".to_string()),
                message: "worker lost".to_string(),
            }),
        ])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM big").await.unwrap();
    cursor.next().await.unwrap();
    let err = cursor.next().await.unwrap_err();

    let context = err.context().expect("tagged error");
    assert_eq!(context.query_id.as_deref(), Some("q-77"));
    assert_eq!(context.last_sequence, Some(0));
    assert_eq!(err.sql_state(), "XX000");
    let message = err.to_string();
    assert!(message.contains("QUERY-ID: q-77"));
    assert!(message.contains("SEQUENCE: 0"));
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn test_pulls_are_driven_by_consumption() {
    let (session, transport, _) = scripted_session(
        vec![Attempt::Stream(vec![
            frame(0, &[1]),
            frame(1, &[2]),
            frame(2, &[3]),
            frame(3, &[4]),
            frame(4, &[5]),
            end(5),
        ])],
        test_config(),
    );

    let options = QueryOptions::default().with_fetch_size(2);
    let mut cursor = session
        .execute("SELECT n FROM t", Some(options))
        .await
        .unwrap()
        .into_cursor();
    assert_eq!(transport.pulls(), 1);

    cursor.next().await.unwrap();
    assert_eq!(transport.pulls(), 1);

    // The first batch is used up: refill until two rows are buffered.
    cursor.next().await.unwrap();
    assert_eq!(transport.pulls(), 3);
    assert_eq!(cursor.execution().buffered_rows(), 1);

    cursor.next().await.unwrap();
    assert_eq!(transport.pulls(), 3);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_keeps_buffered_rows_readable() {
    let first = QueryFrame::batch(0, int_batch(&[Some(1), Some(2)])).with_query_id("q-9");
    let (session, transport, _) = scripted_session(
        vec![Attempt::Stream(vec![Step::Frame(first), frame(1, &[3]), Step::Hang])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    assert!(cursor.next().await.unwrap().is_some());

    cursor.cancel().await;
    assert_eq!(cursor.state(), ExecutionState::Cancelled);
    assert_eq!(transport.cancels(), vec!["q-9".to_string()]);

    // Row 2 was already received.
    let row = cursor.next().await.unwrap().expect("buffered row");
    assert_eq!(row.value(0).unwrap(), TypedValue::BigInt(2));

    let err = cursor.next().await.unwrap_err();
    assert!(matches!(err.root(), HyperError::Query(QueryError::Cancelled)));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_cancel_handle_aborts_pending_pull() {
    let first = QueryFrame::batch(0, int_batch(&[Some(1)])).with_query_id("q-3");
    let (session, transport, _) = scripted_session(
        vec![Attempt::Stream(vec![Step::Frame(first), Step::Hang])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    cursor.next().await.unwrap();

    let handle = cursor.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), cursor.next())
        .await
        .expect("pull aborted within the grace period")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(cursor.state(), ExecutionState::Cancelled);
    assert_eq!(transport.cancels(), vec!["q-3".to_string()]);
}

#[tokio::test]
async fn test_closed_cursor_rejects_reads() {
    let (session, _, _) = scripted_session(
        vec![Attempt::Stream(vec![frame(0, &[1]), Step::Hang])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    cursor.close().await;
    assert!(cursor.is_closed());
    assert!(matches!(
        cursor.next().await.unwrap_err(),
        HyperError::Query(QueryError::CursorClosed)
    ));
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_transport_timeouts_exhaust_retries() {
    let timeout = || {
        Attempt::Stream(vec![Step::Fail(TransportError::DeadlineExceeded(
            "no response within 30s".to_string(),
        ))])
    };
    let (session, transport, _) =
        scripted_session(vec![timeout(), timeout(), timeout()], test_config());

    let err = session.execute("SELECT 1", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert_eq!(transport.submissions(), 3);
    assert_eq!(session.open_executions(), 0);
}

#[tokio::test]
async fn test_query_deadline_while_awaiting_first_batch() {
    let (session, transport, _) = scripted_session(
        vec![Attempt::Stream(vec![Step::Hang])],
        test_config(),
    );

    let options = QueryOptions::default().with_timeout(Duration::from_millis(50));
    let err = session.execute("SELECT pg_sleep(60)", Some(options)).await.unwrap_err();
    assert!(matches!(
        err.root(),
        HyperError::Query(QueryError::DeadlineExceeded { timeout_ms: 50 })
    ));
    assert_eq!(transport.submissions(), 1);
}

// ============================================================================
// Retries and authentication
// ============================================================================

#[tokio::test]
async fn test_expired_token_is_refreshed_transparently() {
    let (session, transport, exchange) = scripted_session(
        vec![
            Attempt::Reject(unauthenticated()),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        test_config(),
    );

    let mut cursor = session.query("SELECT 1").await.unwrap();
    assert!(cursor.next().await.unwrap().is_some());

    assert_eq!(exchange.issued(), 2);
    assert_eq!(
        transport.authorizations(),
        vec!["Bearer token-1".to_string(), "Bearer token-2".to_string()]
    );
}

#[tokio::test]
async fn test_repeated_auth_rejection_surfaces() {
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Reject(unauthenticated()),
            Attempt::Reject(unauthenticated()),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        test_config(),
    );

    let err = session.execute("SELECT 1", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(transport.submissions(), 2);
}

#[tokio::test]
async fn test_auth_refresh_budget_is_configurable() {
    let config = test_config().with_retry_policy(fast_retry().with_auth_refresh_attempts(2));
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Reject(unauthenticated()),
            Attempt::Reject(unauthenticated()),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        config,
    );

    assert!(session.execute("SELECT 1", None).await.is_ok());
    assert_eq!(transport.submissions(), 3);
}

#[tokio::test]
async fn test_transient_failure_before_first_batch_is_retried() {
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Reject(unavailable()),
            Attempt::Stream(vec![Step::Fail(unavailable())]),
            Attempt::Stream(vec![frame(0, &[42]), end(1)]),
        ],
        test_config(),
    );

    let mut cursor = session.query("SELECT 42").await.unwrap();
    let row = cursor.next().await.unwrap().unwrap();
    assert_eq!(row.value(0).unwrap(), TypedValue::BigInt(42));
    assert_eq!(transport.submissions(), 3);
}

#[tokio::test]
async fn test_no_retry_after_first_batch() {
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Stream(vec![frame(0, &[1]), Step::Fail(unavailable())]),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    assert!(cursor.next().await.unwrap().is_some());

    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(transport.submissions(), 1);
    assert_eq!(cursor.row_number(), 1);
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let (session, transport, _) = scripted_session(
        vec![Attempt::Reject(TransportError::Server {
            code: "InvalidArgument".to_string(),
            sql_state: Some("42601".to_string()),
            message: "syntax error at or near \"SELEC\"".to_string(),
        })],
        test_config(),
    );

    let err = session.execute("SELEC 1", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert_eq!(err.sql_state(), "42601");
    assert_eq!(transport.submissions(), 1);
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures() {
    let config = test_config()
        .with_retry_policy(fast_retry().with_max_attempts(1))
        .with_circuit_breaker(2, Duration::from_secs(60));
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Reject(unavailable()),
            Attempt::Reject(unavailable()),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        config,
    );

    assert!(session.execute("SELECT 1", None).await.is_err());
    assert!(session.execute("SELECT 1", None).await.is_err());
    assert_eq!(session.circuit_state(), CircuitState::Open);

    let err = session.execute("SELECT 1", None).await.unwrap_err();
    assert!(matches!(
        err.root(),
        HyperError::Transport(TransportError::CircuitOpen { .. })
    ));
    assert_eq!(transport.submissions(), 2);
}

#[tokio::test]
async fn test_half_open_trial_with_server_error_closes_circuit() {
    let config = test_config()
        .with_retry_policy(fast_retry().with_max_attempts(1))
        .with_circuit_breaker(1, Duration::from_millis(10));
    let syntax_error = TransportError::Server {
        code: "InvalidArgument".to_string(),
        sql_state: Some("42601".to_string()),
        message: "syntax error at or near \"SELEC\"".to_string(),
    };
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Reject(unavailable()),
            Attempt::Reject(syntax_error),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        config,
    );

    assert!(session.execute("SELECT 1", None).await.is_err());
    assert_eq!(session.circuit_state(), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The service answered, so the trial proves it reachable.
    let err = session.execute("SELEC 1", None).await.unwrap_err();
    assert_eq!(err.sql_state(), "42601");
    assert_eq!(session.circuit_state(), CircuitState::Closed);

    session.execute("SELECT 1", None).await.unwrap();
    assert_eq!(transport.submissions(), 3);
}

#[tokio::test]
async fn test_half_open_trial_survives_token_refresh() {
    let config = test_config()
        .with_retry_policy(fast_retry().with_max_attempts(1))
        .with_circuit_breaker(1, Duration::from_millis(10));
    let (session, transport, exchange) = scripted_session(
        vec![
            Attempt::Reject(unavailable()),
            Attempt::Reject(unauthenticated()),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        config,
    );

    assert!(session.execute("SELECT 1", None).await.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.execute("SELECT 1", None).await.unwrap();
    assert_eq!(session.circuit_state(), CircuitState::Closed);
    assert_eq!(transport.submissions(), 3);
    assert_eq!(exchange.issued(), 2);
}

#[tokio::test]
async fn test_abandoned_trial_admits_the_next_one() {
    let config = test_config()
        .with_retry_policy(fast_retry().with_max_attempts(1))
        .with_circuit_breaker(1, Duration::from_millis(10));
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Reject(unavailable()),
            Attempt::Stream(vec![Step::Hang]),
            Attempt::Stream(vec![frame(0, &[1]), end(1)]),
        ],
        config,
    );

    assert!(session.execute("SELECT 1", None).await.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let options = QueryOptions::default().with_timeout(Duration::from_millis(50));
    let err = session.execute("SELECT 1", Some(options)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert_eq!(session.circuit_state(), CircuitState::HalfOpen);

    session.execute("SELECT 1", None).await.unwrap();
    assert_eq!(session.circuit_state(), CircuitState::Closed);
    assert_eq!(transport.submissions(), 3);
}

#[tokio::test]
async fn test_resubmission_replaces_query_id() {
    let announced = QueryFrame {
        query_id: Some("q-dead".to_string()),
        ..Default::default()
    };
    let first = QueryFrame::batch(0, int_batch(&[Some(1)])).with_query_id("q-live");
    let (session, transport, _) = scripted_session(
        vec![
            Attempt::Stream(vec![Step::Frame(announced), Step::Fail(unavailable())]),
            Attempt::Stream(vec![Step::Frame(first), Step::Hang]),
        ],
        test_config(),
    );

    let mut execution = session.execute("SELECT n FROM t", None).await.unwrap();
    assert_eq!(transport.submissions(), 2);
    assert_eq!(execution.query_id().as_deref(), Some("q-live"));
    assert_eq!(execution.cancel_handle().query_id().as_deref(), Some("q-live"));

    execution.cancel().await;
    assert_eq!(transport.cancels(), vec!["q-live".to_string()]);
}

#[tokio::test]
async fn test_concurrent_executions_share_one_token_exchange() {
    let attempts = (0..8)
        .map(|_| Attempt::Stream(vec![frame(0, &[1]), end(1)]))
        .collect();
    let transport = Arc::new(ScriptedTransport::new(attempts));
    let exchange = Arc::new(CountingExchange::with_delay(Duration::from_millis(50)));
    let tokens = TokenProvider::new(exchange.clone(), Credentials::new("client", "secret"));
    let session = QuerySession::new(transport.clone(), Arc::new(tokens), test_config());

    let results = join_all((0..8).map(|_| session.execute("SELECT 1", None))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(exchange.issued(), 1);
    assert!(transport
        .authorizations()
        .iter()
        .all(|header| header == "Bearer token-1"));
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_session_close_cancels_open_executions() {
    let first = QueryFrame::batch(0, int_batch(&[Some(1)])).with_query_id("q-open");
    let (session, transport, _) = scripted_session(
        vec![Attempt::Stream(vec![Step::Frame(first), Step::Hang])],
        test_config(),
    );

    let mut cursor = session.query("SELECT n FROM t").await.unwrap();
    assert_eq!(session.open_executions(), 1);

    session.close().await.unwrap();
    assert!(session.is_closed());
    assert_eq!(transport.cancels(), vec!["q-open".to_string()]);

    // The received row is still there; the next pull reports the close.
    assert!(cursor.next().await.unwrap().is_some());
    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
    assert_eq!(cursor.state(), ExecutionState::Cancelled);

    let err = session.execute("SELECT 1", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
}

#[tokio::test]
async fn test_session_catalog_is_sent_with_queries() {
    let (session, transport, _) = scripted_session(
        vec![Attempt::Stream(vec![frame(0, &[1]), end(1)])],
        test_config(),
    );

    session.set_catalog(Some("lakehouse".to_string())).await;
    session.execute("SELECT 1", None).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests[0].options.catalog.as_deref(), Some("lakehouse"));
    assert_eq!(requests[0].sql, "SELECT 1");
}

// ============================================================================
// Submitted queries
// ============================================================================

fn running(query_id: &str, rows: u64) -> Result<QueryStatus, TransportError> {
    Ok(QueryStatus::new(query_id, CompletionStatus::Running).with_counts(0, rows))
}

#[tokio::test]
async fn test_execute_async_wait_then_fetch_rows() {
    let transport = ScriptedTransport::new(vec![Attempt::Stream(vec![
        frame(0, &[1, 2, 3]),
        end(1),
    ])])
    .with_statuses(vec![
        running("q-a", 0),
        running("q-a", 2),
        Ok(QueryStatus::new("q-a", CompletionStatus::ResultsProduced).with_counts(1, 5)),
    ]);
    let config = test_config().with_status_poll_interval(Duration::from_millis(5));
    let (session, transport, _) = session_over(transport, config);

    let status = session
        .execute_async("SELECT n FROM t", None)
        .await
        .unwrap();
    assert_eq!(status.query_id, "q-a");
    assert_eq!(status.completion, CompletionStatus::Running);
    assert_eq!(transport.requests()[0].sql, "SELECT n FROM t");

    let status = session
        .wait_for_rows("q-a", 0, 5, Duration::from_secs(5), false)
        .await
        .unwrap();
    assert_eq!(status.row_count, 5);
    assert!(status.all_results_produced());
    assert_eq!(transport.status_polls(), 2);

    let mut cursor = session.fetch_rows("q-a", 0, 3).await.unwrap();
    let mut values = Vec::new();
    while let Some(row) = cursor.next().await.unwrap() {
        values.push(row.value(0).unwrap());
    }
    assert_eq!(
        values,
        vec![TypedValue::BigInt(1), TypedValue::BigInt(2), TypedValue::BigInt(3)]
    );
    assert_eq!(transport.fetches(), vec!["rows:q-a:0:3".to_string()]);
    assert_eq!(transport.submissions(), 1);
}

#[tokio::test]
async fn test_wait_allowing_fewer_rows() {
    let transport = ScriptedTransport::default().with_statuses(vec![running("q-a", 0), running("q-a", 11)]);
    let config = test_config().with_status_poll_interval(Duration::from_millis(5));
    let (session, transport, _) = session_over(transport, config);

    let status = session
        .wait_for_rows("q-a", 10, 100, Duration::from_secs(5), true)
        .await
        .unwrap();
    assert_eq!(status.row_count, 11);
    assert_eq!(transport.status_polls(), 2);
}

#[tokio::test]
async fn test_wait_stops_when_query_finished() {
    let transport = ScriptedTransport::default().with_statuses(vec![
        running("q-a", 1),
        Ok(QueryStatus::new("q-a", CompletionStatus::Finished).with_counts(1, 3)),
    ]);
    let config = test_config().with_status_poll_interval(Duration::from_millis(5));
    let (session, _, _) = session_over(transport, config);

    // Ten rows will never exist; the finished status is returned as is.
    let status = session
        .wait_for_rows("q-a", 0, 10, Duration::from_secs(5), false)
        .await
        .unwrap();
    assert!(status.is_finished());
    assert_eq!(status.row_count, 3);
}

#[tokio::test]
async fn test_wait_retries_transient_failures_after_first_status() {
    let transport = ScriptedTransport::default().with_statuses(vec![
        running("q-a", 0),
        Err(unavailable()),
        Ok(QueryStatus::new("q-a", CompletionStatus::ResultsProduced)),
    ]);
    let config = test_config().with_status_poll_interval(Duration::from_millis(5));
    let (session, transport, _) = session_over(transport, config);

    let status = session
        .wait_for_results_produced("q-a", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.completion, CompletionStatus::ResultsProduced);
    assert_eq!(transport.status_polls(), 3);
}

#[tokio::test]
async fn test_wait_without_any_status_fails() {
    let transport = ScriptedTransport::default().with_statuses(vec![Err(unavailable())]);
    let config = test_config().with_status_poll_interval(Duration::from_millis(5));
    let (session, transport, _) = session_over(transport, config);

    let err = session
        .wait_for_results_produced("q-a", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err.root(),
        HyperError::Transport(TransportError::Unavailable(_))
    ));
    assert_eq!(transport.status_polls(), 1);
}

#[tokio::test]
async fn test_wait_returns_last_status_at_deadline() {
    let transport = ScriptedTransport::default().with_statuses(vec![running("q-a", 4)]);
    let config = test_config().with_status_poll_interval(Duration::from_millis(10));
    let (session, transport, _) = session_over(transport, config);

    let status = session
        .wait_for_status("q-a", Duration::from_millis(50), |status| status.row_count > 100)
        .await
        .unwrap();
    assert_eq!(status.row_count, 4);
    assert!(transport.status_polls() >= 2);
}

#[tokio::test]
async fn test_execute_async_renews_rejected_token() {
    let transport =
        ScriptedTransport::default().with_statuses(vec![Err(unauthenticated()), running("q-c", 0)]);
    let (session, transport, exchange) = session_over(transport, test_config());

    let status = session.execute_async("SELECT 1", None).await.unwrap();
    assert_eq!(status.query_id, "q-c");
    assert_eq!(exchange.issued(), 2);
    assert_eq!(
        transport.authorizations(),
        vec!["Bearer token-1".to_string(), "Bearer token-2".to_string()]
    );
}

#[tokio::test]
async fn test_chunk_cursor_cancel_leaves_query_running() {
    let first = QueryFrame::batch(0, int_batch(&[Some(7)])).with_query_id("q-b");
    let transport = ScriptedTransport::new(vec![Attempt::Stream(vec![
        Step::Frame(first),
        Step::Hang,
    ])]);
    let (session, transport, _) = session_over(transport, test_config());

    let mut cursor = session.fetch_chunk("q-b", 2).await.unwrap();
    assert_eq!(transport.fetches(), vec!["chunk:q-b:2".to_string()]);
    let row = cursor.next().await.unwrap().expect("one row");
    assert_eq!(row.value(0).unwrap(), TypedValue::BigInt(7));

    cursor.cancel().await;
    assert_eq!(cursor.state(), ExecutionState::Cancelled);
    assert!(transport.cancels().is_empty());

    session.cancel_query("q-b").await.unwrap();
    assert_eq!(transport.cancels(), vec!["q-b".to_string()]);
}

#[tokio::test]
async fn test_status_of_failed_query_is_an_error() {
    let failed = TransportError::Server {
        code: "Failed".to_string(),
        sql_state: Some("57014".to_string()),
        message: "query was canceled".to_string(),
    };
    let transport = ScriptedTransport::default().with_statuses(vec![Err(failed)]);
    let (session, _, _) = session_over(transport, test_config());

    let err = session.query_status("q-x").await.unwrap_err();
    assert_eq!(err.sql_state(), "57014");
}
