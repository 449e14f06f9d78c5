//! Wire messages of the `hyperdb.v1.HyperService` gRPC service.
//!
//! The HTTP fallback reuses the same option shape in JSON form, defined here
//! as well.

use super::protocol::QueryRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Query submission
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryParam {
    /// SQL text
    #[prost(string, tag = "1")]
    pub sql: String,

    /// Execution options
    #[prost(message, optional, tag = "2")]
    pub options: Option<QueryParamOptions>,
}

/// Execution options sent with a query
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryParamOptions {
    #[prost(uint64, tag = "1")]
    pub fetch_size: u64,

    /// Server-side query timeout, zero for none
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,

    #[prost(string, tag = "3")]
    pub catalog: String,

    /// Query settings applied for this query only
    #[prost(map = "string, string", tag = "4")]
    pub settings: HashMap<String, String>,

    #[prost(enumeration = "TransferMode", tag = "5")]
    pub transfer_mode: i32,
}

/// How results of a submitted query are delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TransferMode {
    /// Results follow on the submission stream
    Streaming = 0,
    /// The submission stream only reports the query id; results are
    /// fetched later
    Async = 1,
}

/// One message of the result stream
#[derive(Clone, PartialEq, prost::Message)]
pub struct ExecuteQueryResponse {
    #[prost(uint64, tag = "1")]
    pub sequence_number: u64,

    /// Server-assigned query id, empty when not repeated
    #[prost(string, tag = "2")]
    pub query_id: String,

    #[prost(message, optional, tag = "3")]
    pub schema: Option<ResultSchema>,

    #[prost(message, optional, tag = "4")]
    pub rows: Option<ResultChunk>,

    #[prost(bool, tag = "5")]
    pub end_of_stream: bool,

    /// Present on the only message of an async submission
    #[prost(message, optional, tag = "6")]
    pub query_info: Option<QueryInfo>,
}

/// Result schema as a schema-only Arrow IPC stream
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResultSchema {
    #[prost(bytes = "vec", tag = "1")]
    pub arrow_schema: Vec<u8>,
}

/// Rows as an Arrow IPC stream
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResultChunk {
    /// Declared number of rows in `arrow_ipc`
    #[prost(int64, tag = "1")]
    pub row_count: i64,

    #[prost(bytes = "vec", tag = "2")]
    pub arrow_ipc: Vec<u8>,
}

/// Completion of a query as reported by `GetQueryInfo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum QueryCompletion {
    Running = 0,
    ResultsProduced = 1,
    Finished = 2,
}

/// Status request
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryInfoParam {
    #[prost(string, tag = "1")]
    pub query_id: String,
}

/// Status of a query
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryInfo {
    #[prost(string, tag = "1")]
    pub query_id: String,

    #[prost(enumeration = "QueryCompletion", tag = "2")]
    pub completion: i32,

    #[prost(uint64, tag = "3")]
    pub chunk_count: u64,

    #[prost(uint64, tag = "4")]
    pub row_count: u64,

    #[prost(double, tag = "5")]
    pub progress: f64,
}

/// Request for part of the results of a submitted query
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryResultParam {
    #[prost(string, tag = "1")]
    pub query_id: String,

    #[prost(oneof = "ResultRange", tags = "2, 3")]
    pub range: Option<ResultRange>,
}

/// Which results a [`QueryResultParam`] asks for
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum ResultRange {
    #[prost(uint64, tag = "2")]
    ChunkId(u64),

    #[prost(message, tag = "3")]
    Rows(RowRange),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RowRange {
    #[prost(uint64, tag = "1")]
    pub offset: u64,

    #[prost(uint64, tag = "2")]
    pub row_limit: u64,
}

/// Cancellation request
#[derive(Clone, PartialEq, prost::Message)]
pub struct CancelQueryParam {
    #[prost(string, tag = "1")]
    pub query_id: String,
}

/// Cancellation acknowledgement
#[derive(Clone, PartialEq, prost::Message)]
pub struct CancelQueryResult {}

impl From<&QueryRequest> for QueryParam {
    fn from(request: &QueryRequest) -> Self {
        let options = &request.options;
        QueryParam {
            sql: request.sql.clone(),
            options: Some(QueryParamOptions {
                fetch_size: options.fetch_size as u64,
                timeout_ms: options.timeout.as_millis() as u64,
                catalog: options.catalog.clone().unwrap_or_default(),
                settings: options
                    .settings
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                transfer_mode: TransferMode::Streaming as i32,
            }),
        }
    }
}

/// HTTP submission body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQueryBody {
    pub sql: String,
    pub options: SubmitQueryOptions,
}

/// HTTP execution options
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQueryOptions {
    pub fetch_size: u64,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub settings: HashMap<String, String>,
}

impl From<&QueryRequest> for SubmitQueryBody {
    fn from(request: &QueryRequest) -> Self {
        let options = &request.options;
        SubmitQueryBody {
            sql: request.sql.clone(),
            options: SubmitQueryOptions {
                fetch_size: options.fetch_size as u64,
                timeout_ms: options.timeout.as_millis() as u64,
                catalog: options.catalog.clone(),
                settings: options
                    .settings
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        }
    }
}

/// Progress of a query as reported by the HTTP status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionState {
    Running,
    /// All results exist, the query is still being finalized
    ResultsProduced,
    Finished,
    Failed,
    Cancelled,
}

impl CompletionState {
    /// Whether every result page has been produced.
    pub fn all_results_produced(&self) -> bool {
        matches!(
            self,
            CompletionState::ResultsProduced | CompletionState::Finished
        )
    }
}

/// HTTP status of a query
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpQueryStatus {
    pub state: CompletionState,
    #[serde(default)]
    pub page_count: u64,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<StatusError>,
}

/// Failure details in a query status
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    pub message: String,
    #[serde(default)]
    pub sql_state: Option<String>,
}

/// HTTP submission and status response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatusResponse {
    pub query_id: String,
    pub status: HttpQueryStatus,
}
