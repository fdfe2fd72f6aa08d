//! Streaming log search against the diagnostics service of each node.

use crate::model::{LogLevel, LogMessage, SearchLogRequest, Target};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::time::Duration;
use topology::types::NodeKind;

const SEARCH_LOG_PATH: &str = "/diagnosticspb.Diagnostics/search_log";

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String, #[source] tonic::transport::Error),
    #[error("could not connect to {0}")]
    Connect(String, #[source] tonic::transport::Error),
    #[error("diagnostics service is not ready")]
    NotReady(#[source] tonic::transport::Error),
    #[error("log search failed")]
    Status(#[from] tonic::Status),
}

/// Batches of log lines in the order the node sends them. The stream ends when
/// the node has no more lines.
pub type LogStream = BoxStream<'static, Result<Vec<LogMessage>, RpcError>>;

#[async_trait]
pub trait LogStreamClient: Send + Sync {
    async fn search(
        &self,
        target: &Target,
        request: &SearchLogRequest,
    ) -> Result<LogStream, RpcError>;
}

mod pb {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SearchLogRequest {
        #[prost(int64, tag = "1")]
        pub start_time: i64,
        #[prost(int64, tag = "2")]
        pub end_time: i64,
        #[prost(int32, repeated, tag = "3")]
        pub levels: Vec<i32>,
        #[prost(string, repeated, tag = "4")]
        pub patterns: Vec<String>,
        /// 0 for the normal log, 1 for the slow query log.
        #[prost(int32, tag = "5")]
        pub target: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LogMessage {
        #[prost(int64, tag = "1")]
        pub time: i64,
        #[prost(int32, tag = "2")]
        pub level: i32,
        #[prost(string, tag = "3")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SearchLogResponse {
        #[prost(message, repeated, tag = "1")]
        pub messages: Vec<LogMessage>,
    }
}

impl From<&SearchLogRequest> for pb::SearchLogRequest {
    fn from(request: &SearchLogRequest) -> Self {
        pb::SearchLogRequest {
            start_time: request.start_time,
            end_time: request.end_time,
            levels: LogLevel::at_least(request.min_level)
                .into_iter()
                .map(|l| i32::from(l.as_u8()))
                .collect(),
            patterns: request.patterns.clone(),
            target: 0,
        }
    }
}

impl From<pb::LogMessage> for LogMessage {
    fn from(message: pb::LogMessage) -> Self {
        LogMessage {
            time: message.time,
            level: LogLevel::from_u8(u8::try_from(message.level).unwrap_or(0)),
            message: message.message,
        }
    }
}

/// Address of the diagnostics service. SQL nodes serve it on their status port.
pub fn diagnostics_address(target: &Target) -> String {
    match target.kind {
        NodeKind::Sql => format!("{}:{}", target.ip, target.status_port),
        NodeKind::Kv | NodeKind::Coordinator => target.address(),
    }
}

/// gRPC client for the diagnostics service.
pub struct GrpcLogStreamClient {
    connect_timeout: Duration,
}

impl GrpcLogStreamClient {
    pub fn new(connect_timeout: Duration) -> Self {
        GrpcLogStreamClient { connect_timeout }
    }
}

#[async_trait]
impl LogStreamClient for GrpcLogStreamClient {
    async fn search(
        &self,
        target: &Target,
        request: &SearchLogRequest,
    ) -> Result<LogStream, RpcError> {
        let address = diagnostics_address(target);
        let channel = tonic::transport::Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| RpcError::InvalidEndpoint(address.clone(), e))?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .map_err(|e| RpcError::Connect(address.clone(), e))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.map_err(RpcError::NotReady)?;

        let codec =
            tonic::codec::ProstCodec::<pb::SearchLogRequest, pb::SearchLogResponse>::default();
        let path = http::uri::PathAndQuery::from_static(SEARCH_LOG_PATH);
        let response = grpc
            .server_streaming(tonic::Request::new(request.into()), path, codec)
            .await?;

        tracing::debug!(%address, "log search stream opened");
        let stream = response.into_inner().map(|item| {
            item.map(|batch| {
                batch
                    .messages
                    .into_iter()
                    .map(LogMessage::from)
                    .collect::<Vec<_>>()
            })
            .map_err(RpcError::from)
        });
        Ok(stream.boxed())
    }
}
