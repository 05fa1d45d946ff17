//! Abstractions over the per-tablet RPC surface.
//!
//! The health check (and the gateway's action closures) never name a
//! transport directly: tablets are reached through [`TabletQueryService`]
//! handles produced by an injected [`TabletDialer`]. Production wires these
//! to tonic in [`grpc`](super::grpc); tests substitute the mocks below.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tonic::Status;

use super::wire;
use crate::types::TabletRecord;

/// The messages of one tablet's streaming health subscription.
pub type HealthStream = BoxStream<'static, Result<wire::StreamHealthResponse, Status>>;

/// A stream of partial query results.
pub type QueryResultStream = BoxStream<'static, Result<wire::QueryResult, Status>>;

/// An open client to a single tablet's query service.
#[async_trait]
pub trait TabletQueryService: Send + Sync + Debug {
    /// Open the streaming health subscription.
    async fn stream_health(&self) -> Result<HealthStream, Status>;

    /// Execute a query and wait for the full result.
    async fn execute(&self, req: wire::ExecuteRequest) -> Result<wire::QueryResult, Status>;

    /// Execute a query, streaming partial results.
    async fn stream_execute(&self, req: wire::ExecuteRequest) -> Result<QueryResultStream, Status>;

    /// Open a transaction, returning its id.
    async fn begin(&self, req: wire::BeginRequest) -> Result<wire::BeginResponse, Status>;

    /// Commit a transaction.
    async fn commit(&self, req: wire::CommitRequest) -> Result<wire::CommitResponse, Status>;

    /// Reserve a connection and execute a first statement on it.
    async fn reserve_execute(
        &self,
        req: wire::ReserveExecuteRequest,
    ) -> Result<wire::ReserveExecuteResponse, Status>;
}

/// Produces [`TabletQueryService`] clients from tablet records.
///
/// Injected into the health check so it owns no transport details.
#[async_trait]
pub trait TabletDialer: Send + Sync + Debug {
    /// Connect to the tablet described by `rec`.
    async fn dial(&self, rec: &TabletRecord) -> Result<Arc<dyn TabletQueryService>, Status>;
}

/// Mocks for testing.
pub mod mock {
    use std::collections::VecDeque;

    use futures::StreamExt;
    use hashbrown::{HashMap, HashSet};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::types::{TabletAlias, TabletRole, Target};

    type HealthSender = mpsc::UnboundedSender<Result<wire::StreamHealthResponse, Status>>;

    #[derive(Debug, Default)]
    struct State {
        /// The send side of every health stream opened so far, oldest first.
        streams: Vec<HealthSender>,
        /// Scripted errors returned by the next `stream_health` calls.
        stream_errors: VecDeque<Status>,
        /// Captured execute requests.
        executes: Vec<wire::ExecuteRequest>,
        /// Scripted execute results; exhausted entries succeed with an empty
        /// result.
        execute_returns: VecDeque<Result<wire::QueryResult, Status>>,
    }

    /// A scriptable [`TabletQueryService`] capturing the requests it
    /// receives.
    #[derive(Debug, Default)]
    pub struct MockTabletClient {
        state: Mutex<State>,
    }

    impl MockTabletClient {
        /// Script the outcome of upcoming `execute` calls.
        pub fn with_execute_returns(
            self,
            returns: impl Into<VecDeque<Result<wire::QueryResult, Status>>>,
        ) -> Self {
            self.state.lock().execute_returns = returns.into();
            self
        }

        /// Script errors for upcoming `stream_health` calls.
        pub fn enqueue_stream_error(&self, status: Status) {
            self.state.lock().stream_errors.push_back(status);
        }

        /// The execute requests received so far.
        pub fn executes(&self) -> Vec<wire::ExecuteRequest> {
            self.state.lock().executes.clone()
        }

        /// The number of health streams opened against this client.
        pub fn stream_count(&self) -> usize {
            self.state.lock().streams.len()
        }

        /// Push a message onto the most recently opened health stream.
        ///
        /// Returns `false` if no stream is open (or the subscriber is gone).
        pub fn push_health(&self, resp: wire::StreamHealthResponse) -> bool {
            self.state
                .lock()
                .streams
                .last()
                .is_some_and(|tx| tx.send(Ok(resp)).is_ok())
        }

        /// Terminate the most recently opened health stream with `status`.
        pub fn fail_stream(&self, status: Status) {
            if let Some(tx) = self.state.lock().streams.last() {
                tx.send(Err(status)).ok();
            }
        }

        /// Close every open health stream (clean EOF).
        pub fn close_streams(&self) {
            self.state.lock().streams.clear();
        }
    }

    #[async_trait]
    impl TabletQueryService for Arc<MockTabletClient> {
        async fn stream_health(&self) -> Result<HealthStream, Status> {
            let mut state = self.state.lock();
            if let Some(status) = state.stream_errors.pop_front() {
                return Err(status);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.streams.push(tx);
            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|msg| (msg, rx))
            })
            .boxed())
        }

        async fn execute(&self, req: wire::ExecuteRequest) -> Result<wire::QueryResult, Status> {
            let mut state = self.state.lock();
            state.executes.push(req);
            state
                .execute_returns
                .pop_front()
                .unwrap_or_else(|| Ok(wire::QueryResult::default()))
        }

        async fn stream_execute(
            &self,
            req: wire::ExecuteRequest,
        ) -> Result<QueryResultStream, Status> {
            let result = self.execute(req).await?;
            Ok(futures::stream::iter([Ok(result)]).boxed())
        }

        async fn begin(&self, _req: wire::BeginRequest) -> Result<wire::BeginResponse, Status> {
            Ok(wire::BeginResponse { transaction_id: 1 })
        }

        async fn commit(&self, _req: wire::CommitRequest) -> Result<wire::CommitResponse, Status> {
            Ok(wire::CommitResponse {})
        }

        async fn reserve_execute(
            &self,
            req: wire::ReserveExecuteRequest,
        ) -> Result<wire::ReserveExecuteResponse, Status> {
            let result = self
                .execute(req.request.unwrap_or_default())
                .await?;
            Ok(wire::ReserveExecuteResponse {
                reserved_id: 1,
                result: Some(result),
            })
        }
    }

    /// A [`TabletDialer`] handing out one [`MockTabletClient`] per tablet
    /// alias.
    #[derive(Debug, Default)]
    pub struct MockDialer {
        clients: Mutex<HashMap<TabletAlias, Arc<MockTabletClient>>>,
        failing: Mutex<HashSet<TabletAlias>>,
    }

    impl MockDialer {
        /// The client that is (or will be) handed out for `alias`.
        pub fn client(&self, alias: &TabletAlias) -> Arc<MockTabletClient> {
            Arc::clone(
                self.clients
                    .lock()
                    .entry(alias.clone())
                    .or_default(),
            )
        }

        /// Make dials of `alias` fail until re-enabled.
        pub fn set_unreachable(&self, alias: TabletAlias, unreachable: bool) {
            if unreachable {
                self.failing.lock().insert(alias);
            } else {
                self.failing.lock().remove(&alias);
            }
        }

        /// Push a healthy (serving) message for `alias` on its latest
        /// stream.
        pub fn push_serving(&self, alias: &TabletAlias, target: Target, lag: u32) -> bool {
            self.client(alias).push_health(healthy_response(
                alias.clone(),
                target,
                lag,
            ))
        }

        /// Push a not-serving message for `alias` on its latest stream.
        pub fn push_not_serving(&self, alias: &TabletAlias, target: Target) -> bool {
            let mut resp = healthy_response(alias.clone(), target, 0);
            resp.serving = false;
            self.client(alias).push_health(resp)
        }
    }

    #[async_trait]
    impl TabletDialer for MockDialer {
        async fn dial(&self, rec: &TabletRecord) -> Result<Arc<dyn TabletQueryService>, Status> {
            if self.failing.lock().contains(&rec.alias) {
                return Err(Status::unavailable(format!(
                    "connection refused: {}",
                    rec.addr()
                )));
            }
            Ok(Arc::new(self.client(&rec.alias)) as _)
        }
    }

    /// A serving health message for `alias` declaring `target`.
    pub fn healthy_response(
        alias: TabletAlias,
        target: Target,
        lag_seconds: u32,
    ) -> wire::StreamHealthResponse {
        let primary_term_start_timestamp = match target.tablet_type {
            TabletRole::Primary => 1,
            _ => 0,
        };
        wire::StreamHealthResponse {
            target: Some(wire::Target::from(target)),
            serving: true,
            realtime_stats: Some(wire::RealtimeStats {
                health_error: String::new(),
                replication_lag_seconds: lag_seconds,
                cpu_usage: 0.0,
            }),
            tablet_alias: Some(wire::TabletAlias::from(alias)),
            primary_term_start_timestamp,
        }
    }
}
