//! gRPC streaming transport.
//!
//! Queries are submitted with the server-streaming `ExecuteQuery` call and
//! result frames are read from the response stream one message at a time,
//! so flow control on the HTTP/2 stream follows the consumer.
//!
//! Asynchronous submissions use the same call in async transfer mode, which
//! answers with the query id only. Their status comes from `GetQueryInfo`
//! and their results from `GetQueryResult`.

use super::deserialize::decode_response;
use super::messages::{
    CancelQueryParam, ExecuteQueryResponse, QueryCompletion, QueryInfo, QueryInfoParam, QueryParam,
    QueryResultParam, ResultRange, RowRange, TransferMode,
};
use super::protocol::{
    CompletionStatus, Endpoint, FrameStream, QueryFrame, QueryRequest, QueryStatus, QueryTransport,
    TlsMode, TransportConfig,
};
use super::{classify_connect_failure, describe_error_chain};
use crate::connection::auth::Token;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::{Code, Status};
use tracing::{debug, info};

/// Trailer carrying the SQLSTATE of a failed query.
pub const SQLSTATE_METADATA_KEY: &str = "x-hyperdb-sqlstate";

/// Hand-written client for `hyperdb.v1.HyperService`.
pub mod hyper_service_client {
    use super::*;
    use tonic::codegen::*;

    /// Query service client
    #[derive(Debug, Clone)]
    pub struct HyperServiceClient {
        inner: tonic::client::Grpc<Channel>,
    }

    impl HyperServiceClient {
        /// Create a new client from a channel
        pub fn new(channel: Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }

        /// Limit the size of decoded messages
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }

        /// Submit a query and stream its results
        pub async fn execute_query(
            &mut self,
            request: impl tonic::IntoRequest<QueryParam>,
        ) -> std::result::Result<tonic::Response<tonic::codec::Streaming<ExecuteQueryResponse>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unavailable, format!("Service not ready: {}", e))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hyperdb.v1.HyperService/ExecuteQuery");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("hyperdb.v1.HyperService", "ExecuteQuery"));
            self.inner.server_streaming(req, path, codec).await
        }

        /// Current status of a query
        pub async fn get_query_info(
            &mut self,
            request: impl tonic::IntoRequest<QueryInfoParam>,
        ) -> std::result::Result<tonic::Response<QueryInfo>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unavailable, format!("Service not ready: {}", e))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hyperdb.v1.HyperService/GetQueryInfo");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("hyperdb.v1.HyperService", "GetQueryInfo"));
            self.inner.unary(req, path, codec).await
        }

        /// Stream part of the results of a submitted query
        pub async fn get_query_result(
            &mut self,
            request: impl tonic::IntoRequest<QueryResultParam>,
        ) -> std::result::Result<tonic::Response<tonic::codec::Streaming<ExecuteQueryResponse>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unavailable, format!("Service not ready: {}", e))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hyperdb.v1.HyperService/GetQueryResult");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("hyperdb.v1.HyperService", "GetQueryResult"));
            self.inner.server_streaming(req, path, codec).await
        }

        /// Cancel a running query
        pub async fn cancel_query(
            &mut self,
            request: impl tonic::IntoRequest<CancelQueryParam>,
        ) -> std::result::Result<tonic::Response<super::super::messages::CancelQueryResult>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unavailable, format!("Service not ready: {}", e))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hyperdb.v1.HyperService/CancelQuery");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("hyperdb.v1.HyperService", "CancelQuery"));
            self.inner.unary(req, path, codec).await
        }
    }
}

use hyper_service_client::HyperServiceClient;

/// gRPC transport implementation.
pub struct GrpcTransport {
    client: HyperServiceClient,
    endpoint: Endpoint,
    /// Metadata sent with every call, without the bearer token
    metadata: MetadataMap,
    request_timeout: Duration,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl GrpcTransport {
    /// Open a channel to the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidEndpoint` for unusable addresses,
    /// `TransportError::TlsHandshake` when TLS cannot be negotiated, and
    /// `TransportError::ConnectionRefused` or `TransportError::DeadlineExceeded`
    /// when the connection cannot be established.
    pub async fn open(config: TransportConfig) -> Result<Self, TransportError> {
        config.endpoint.validate()?;
        let uri = config.endpoint.uri(&config.tls);

        let mut endpoint = tonic::transport::Endpoint::from_shared(uri.clone())
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", uri, e)))?
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_while_idle(true);

        if let TlsMode::Verified { ca_certificate } = &config.tls {
            let tls_config = ClientTlsConfig::new().domain_name(config.endpoint.host.clone());
            let tls_config = match ca_certificate {
                Some(pem) => tls_config.ca_certificate(Certificate::from_pem(pem)),
                None => tls_config.with_native_roots(),
            };
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| TransportError::TlsHandshake(describe_error_chain(&e)))?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| classify_connect_failure(&config.endpoint, &e))?;

        info!(endpoint = %config.endpoint, tls = config.tls.is_enabled(), "Opened gRPC channel");

        Self::from_channel(channel, config)
    }

    /// Wrap an already connected channel.
    pub fn from_channel(channel: Channel, config: TransportConfig) -> Result<Self, TransportError> {
        let metadata = build_metadata(&config.headers)?;
        let client = HyperServiceClient::new(channel).max_decoding_message_size(config.max_message_size);

        Ok(Self {
            client,
            endpoint: config.endpoint,
            metadata,
            request_timeout: config.request_timeout,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn request<T>(&self, message: T, token: &Token) -> Result<tonic::Request<T>, TransportError> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.metadata.clone();

        let authorization: AsciiMetadataValue = token
            .authorization_header()
            .parse()
            .map_err(|_| TransportError::Unauthenticated("token is not a valid header value".to_string()))?;
        request.metadata_mut().insert("authorization", authorization);
        Ok(request)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    async fn open_results(
        &self,
        query_id: &str,
        range: ResultRange,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        self.ensure_open()?;
        let request = self.request(
            QueryResultParam {
                query_id: query_id.to_string(),
                range: Some(range),
            },
            token,
        )?;
        let mut client = self.client.clone();

        let response = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
            response = client.get_query_result(request) => response.map_err(|s| status_to_error(&s))?,
        };

        Ok(Box::new(GrpcFrameStream {
            inner: response.into_inner(),
            shutdown: self.shutdown.child_token(),
        }))
    }
}

#[async_trait]
impl QueryTransport for GrpcTransport {
    async fn execute_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        self.ensure_open()?;
        let request = self.request(QueryParam::from(request), token)?;
        let mut client = self.client.clone();

        debug!(endpoint = %self.endpoint, "Submitting query over gRPC");

        let response = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
            response = client.execute_query(request) => response.map_err(|s| status_to_error(&s))?,
        };

        Ok(Box::new(GrpcFrameStream {
            inner: response.into_inner(),
            shutdown: self.shutdown.child_token(),
        }))
    }

    async fn submit_query(
        &self,
        request: &QueryRequest,
        token: &Token,
    ) -> Result<QueryStatus, TransportError> {
        self.ensure_open()?;
        let mut param = QueryParam::from(request);
        if let Some(options) = param.options.as_mut() {
            options.transfer_mode = TransferMode::Async as i32;
        }
        let request = self.request(param, token)?;
        let mut client = self.client.clone();

        let response = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
            response = client.execute_query(request) => response.map_err(|s| status_to_error(&s))?,
        };
        let mut stream = response.into_inner();

        let first = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
            message = stream.message() => message.map_err(|s| status_to_error(&s))?,
        };
        let status = match first {
            Some(ExecuteQueryResponse {
                query_info: Some(info),
                ..
            }) => info_to_status(info)?,
            Some(response) if !response.query_id.is_empty() => {
                QueryStatus::new(response.query_id, CompletionStatus::Running)
            }
            _ => {
                return Err(TransportError::InvalidResponse(
                    "async submission returned no query id".to_string(),
                ))
            }
        };
        debug!(query_id = %status.query_id, "Submitted async query over gRPC");
        Ok(status)
    }

    async fn query_status(&self, query_id: &str, token: &Token) -> Result<QueryStatus, TransportError> {
        self.ensure_open()?;
        let mut request = self.request(
            QueryInfoParam {
                query_id: query_id.to_string(),
            },
            token,
        )?;
        request.set_timeout(self.request_timeout);
        let mut client = self.client.clone();

        let info = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::ChannelClosed),
            response = client.get_query_info(request) => response.map_err(|s| status_to_error(&s))?,
        };
        info_to_status(info.into_inner())
    }

    async fn fetch_rows(
        &self,
        query_id: &str,
        offset: u64,
        limit: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        let range = ResultRange::Rows(RowRange {
            offset,
            row_limit: limit,
        });
        self.open_results(query_id, range, token).await
    }

    async fn fetch_chunk(
        &self,
        query_id: &str,
        chunk: u64,
        token: &Token,
    ) -> Result<Box<dyn FrameStream>, TransportError> {
        self.open_results(query_id, ResultRange::ChunkId(chunk), token)
            .await
    }

    async fn cancel_query(&self, query_id: &str, token: &Token) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut request = self.request(
            CancelQueryParam {
                query_id: query_id.to_string(),
            },
            token,
        )?;
        request.set_timeout(self.request_timeout);
        let mut client = self.client.clone();

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::ChannelClosed),
            response = client.cancel_query(request) => response
                .map(|_| ())
                .map_err(|s| status_to_error(&s)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
            info!(endpoint = %self.endpoint, "Closed gRPC channel");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Result stream of one `ExecuteQuery` call.
struct GrpcFrameStream {
    inner: tonic::codec::Streaming<ExecuteQueryResponse>,
    shutdown: CancellationToken,
}

#[async_trait]
impl FrameStream for GrpcFrameStream {
    async fn next_frame(&mut self) -> Result<Option<QueryFrame>, TransportError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::ChannelClosed),
            message = self.inner.message() => match message {
                Ok(Some(response)) => decode_response(response).map(Some),
                Ok(None) => Ok(None),
                Err(status) => Err(status_to_error(&status)),
            },
        }
    }
}

fn build_metadata(headers: &[(String, String)]) -> Result<MetadataMap, TransportError> {
    let mut metadata = MetadataMap::new();
    for (name, value) in headers {
        let key = AsciiMetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes()).map_err(|_| {
            TransportError::InvalidEndpoint(format!("invalid metadata key '{}'", name))
        })?;
        let value: AsciiMetadataValue = value.parse().map_err(|_| {
            TransportError::InvalidEndpoint(format!("invalid metadata value for '{}'", name))
        })?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn info_to_status(info: QueryInfo) -> Result<QueryStatus, TransportError> {
    let completion = match QueryCompletion::try_from(info.completion) {
        Ok(QueryCompletion::Running) => CompletionStatus::Running,
        Ok(QueryCompletion::ResultsProduced) => CompletionStatus::ResultsProduced,
        Ok(QueryCompletion::Finished) => CompletionStatus::Finished,
        Err(_) => {
            return Err(TransportError::InvalidResponse(format!(
                "unknown completion status {}",
                info.completion
            )))
        }
    };
    Ok(QueryStatus {
        query_id: info.query_id,
        completion,
        chunk_count: info.chunk_count,
        row_count: info.row_count,
        progress: info.progress,
    })
}

/// Map a gRPC status onto the transport error kinds.
pub fn status_to_error(status: &Status) -> TransportError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unavailable | Code::ResourceExhausted | Code::Aborted => {
            TransportError::Unavailable(message)
        }
        Code::DeadlineExceeded => TransportError::DeadlineExceeded(message),
        Code::Unauthenticated => TransportError::Unauthenticated(message),
        Code::Cancelled => TransportError::Cancelled(message),
        code => TransportError::Server {
            code: format!("{:?}", code),
            sql_state: status
                .metadata()
                .get(SQLSTATE_METADATA_KEY)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            message,
        },
    }
}
