//! tonic-backed transport for the tablet query service.
//!
//! [`tablet_service_client`] follows the shape of tonic-generated client
//! code so it can be regenerated from the protobuf definitions when they
//! change; [`GrpcDialer`] adapts it to the [`TabletDialer`] seam the health
//! check consumes. Connections are established lazily in the background:
//! each dialled tablet gets one [`Channel`] connector that lives for the
//! whole subscription.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use super::client::{HealthStream, QueryResultStream, TabletDialer, TabletQueryService};
use super::wire;
use crate::types::TabletRecord;

/// How often the connector retries the initial connection attempt.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Hand-maintained rendering of the tonic-generated tablet service client.
pub mod tablet_service_client {
    #![allow(missing_docs)]

    use tonic::codegen::*;

    use crate::healthcheck::wire;

    /// The gRPC client of the per-tablet query service.
    #[derive(Debug, Clone)]
    pub struct TabletServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl TabletServiceClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> TabletServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub async fn stream_health(
            &mut self,
            request: impl tonic::IntoRequest<wire::StreamHealthRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<wire::StreamHealthResponse>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/tabletservice.TabletService/StreamHealth");
            self.inner
                .server_streaming(request.into_request(), path, codec)
                .await
        }

        pub async fn execute(
            &mut self,
            request: impl tonic::IntoRequest<wire::ExecuteRequest>,
        ) -> std::result::Result<tonic::Response<wire::QueryResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/tabletservice.TabletService/Execute");
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn stream_execute(
            &mut self,
            request: impl tonic::IntoRequest<wire::ExecuteRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<wire::QueryResult>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/tabletservice.TabletService/StreamExecute");
            self.inner
                .server_streaming(request.into_request(), path, codec)
                .await
        }

        pub async fn begin(
            &mut self,
            request: impl tonic::IntoRequest<wire::BeginRequest>,
        ) -> std::result::Result<tonic::Response<wire::BeginResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/tabletservice.TabletService/Begin");
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn commit(
            &mut self,
            request: impl tonic::IntoRequest<wire::CommitRequest>,
        ) -> std::result::Result<tonic::Response<wire::CommitResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/tabletservice.TabletService/Commit");
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn reserve_execute(
            &mut self,
            request: impl tonic::IntoRequest<wire::ReserveExecuteRequest>,
        ) -> std::result::Result<tonic::Response<wire::ReserveExecuteResponse>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/tabletservice.TabletService/ReserveExecute",
            );
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}

use tablet_service_client::TabletServiceClient;

/// Lazy [`Channel`] connector for one tablet.
///
/// Connections are attempted in a background task every
/// [`CONNECT_RETRY_INTERVAL`]; once a connection has been established, the
/// [`Channel`] internally handles reconnections as needed.
///
/// RPCs issued before the first connection succeeds fail with
/// `UNAVAILABLE`.
#[derive(Debug)]
struct LazyConnector {
    uri: String,
    connection: Arc<Mutex<Option<Channel>>>,
    connection_task: JoinHandle<()>,
}

impl LazyConnector {
    /// Lazily connect to `endpoint`.
    fn new(uri: String, endpoint: Endpoint) -> Self {
        let connection = Arc::new(Mutex::new(None));
        Self {
            connection: Arc::clone(&connection),
            connection_task: tokio::spawn(try_connect(uri.clone(), endpoint, connection)),
            uri,
        }
    }

    /// The channel, if a connection was established at some point in the
    /// past.
    fn channel(&self) -> Result<Channel, Status> {
        self.connection.lock().clone().ok_or_else(|| {
            Status::unavailable(format!("tablet not yet connected: {}", self.uri))
        })
    }
}

impl Drop for LazyConnector {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

async fn try_connect(uri: String, endpoint: Endpoint, connection: Arc<Mutex<Option<Channel>>>) {
    loop {
        match endpoint.connect().await {
            Ok(channel) => {
                info!(endpoint = %uri, "connected to tablet");
                *connection.lock() = Some(channel);
                return;
            }
            Err(error) => warn!(endpoint = %uri, %error, "failed to connect to tablet"),
        }
        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

/// A [`TabletQueryService`] backed by a lazily-connected tonic channel.
#[derive(Debug)]
struct GrpcTabletClient {
    connector: LazyConnector,
}

impl GrpcTabletClient {
    fn client(&self) -> Result<TabletServiceClient<Channel>, Status> {
        Ok(TabletServiceClient::new(self.connector.channel()?))
    }
}

#[async_trait]
impl TabletQueryService for GrpcTabletClient {
    async fn stream_health(&self) -> Result<HealthStream, Status> {
        let mut client = self.client()?;
        let response = client.stream_health(wire::StreamHealthRequest {}).await?;
        Ok(response.into_inner().boxed())
    }

    async fn execute(&self, req: wire::ExecuteRequest) -> Result<wire::QueryResult, Status> {
        Ok(self.client()?.execute(req).await?.into_inner())
    }

    async fn stream_execute(&self, req: wire::ExecuteRequest) -> Result<QueryResultStream, Status> {
        let mut client = self.client()?;
        let response = client.stream_execute(req).await?;
        Ok(response.into_inner().boxed())
    }

    async fn begin(&self, req: wire::BeginRequest) -> Result<wire::BeginResponse, Status> {
        Ok(self.client()?.begin(req).await?.into_inner())
    }

    async fn commit(&self, req: wire::CommitRequest) -> Result<wire::CommitResponse, Status> {
        Ok(self.client()?.commit(req).await?.into_inner())
    }

    async fn reserve_execute(
        &self,
        req: wire::ReserveExecuteRequest,
    ) -> Result<wire::ReserveExecuteResponse, Status> {
        Ok(self.client()?.reserve_execute(req).await?.into_inner())
    }
}

/// A [`TabletDialer`] handing out one lazily-connecting channel per tablet
/// subscription.
///
/// `dial` never waits on the network: the returned client owns a
/// [`LazyConnector`] that establishes the connection in the background and
/// is reused for the lifetime of the subscription. RPCs issued before the
/// first connection succeeds fail with `UNAVAILABLE` and are retried by the
/// health check's stream backoff loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcDialer {}

#[async_trait]
impl TabletDialer for GrpcDialer {
    async fn dial(&self, rec: &TabletRecord) -> Result<Arc<dyn TabletQueryService>, Status> {
        let uri = format!("http://{}", rec.addr());
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Status::invalid_argument(format!("invalid tablet address {uri}: {e}")))?;

        debug!(tablet = %rec.alias, addr = %rec.addr(), "dialling tablet");

        Ok(Arc::new(GrpcTabletClient {
            connector: LazyConnector::new(uri, endpoint),
        }) as _)
    }
}
