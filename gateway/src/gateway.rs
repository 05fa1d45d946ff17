//! The tablet discovery gateway.
//!
//! Composition root of the subsystem: per-cell topology watchers feed the
//! health check, whose events maintain the healthy-tablet cache and drive
//! the failover buffer; [`TabletGateway::execute`] binds them together with
//! the retry/selection loop.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use observability_deps::tracing::info;
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::buffer::{Buffer, BufferConfig, RetryDone};
use crate::cache::{TabletStats, TabletStatsCache};
use crate::config::{ConfigError, GatewayConfig};
use crate::error::{ActionError, GatewayError};
use crate::healthcheck::client::{TabletDialer, TabletQueryService};
use crate::healthcheck::{HealthCheck, HealthCheckListener, HealthEvent};
use crate::status::{StatusMetrics, TabletCacheStatus, TabletStatusAggregator};
use crate::topo::filter::{FilterByKeyspace, FilterByShard};
use crate::topo::watcher::CellTabletsWatcher;
use crate::topo::{self, TabletRecorder, TopoServer};
use crate::types::{TabletAlias, TabletRole, Target};

/// Forwards health events to the stats cache and (for primaries) the
/// failover buffer.
///
/// Holds only the two sinks, so neither the health check nor the sinks ever
/// reference their owner.
#[derive(Debug)]
struct GatewayEventForwarder {
    tsc: Arc<TabletStatsCache>,
    buffer: Arc<Buffer>,
}

impl HealthCheckListener for GatewayEventForwarder {
    fn stats_update(&self, event: &HealthEvent) {
        self.tsc.on_event(event);
        if event.new.target.tablet_type == TabletRole::Primary {
            self.buffer.stats_update(event);
        }
    }
}

/// The query routing gateway.
///
/// Stateless across restarts: everything it knows is rebuilt from the
/// topology server and the tablets' health streams.
#[derive(Debug)]
pub struct TabletGateway {
    topo: Arc<dyn TopoServer>,
    hc: HealthCheck,
    tsc: Arc<TabletStatsCache>,
    buffer: Arc<Buffer>,
    watchers: Vec<CellTabletsWatcher>,

    local_cell: String,
    retry_count: usize,
    allowed_tablet_types: Vec<TabletRole>,
    route_replica_to_rdonly: bool,
    keyspaces_to_watch: Vec<String>,

    status_metrics: StatusMetrics,
    aggregators: RwLock<HashMap<Target, Arc<TabletStatusAggregator>>>,
}

impl TabletGateway {
    /// Construct the gateway and start watching the configured cells.
    ///
    /// Must be called within a tokio runtime: the watchers and health
    /// subscriptions spawn background tasks immediately.
    pub fn new(
        topo: Arc<dyn TopoServer>,
        dialer: Arc<dyn TabletDialer>,
        config: GatewayConfig,
        registry: &metric::Registry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let tsc = Arc::new(TabletStatsCache::new(config.lag_threshold));
        let buffer = Arc::new(Buffer::new(
            BufferConfig {
                enabled: config.buffer_enabled,
                max_per_shard: config.buffer_size_per_shard,
                max_total: config.buffer_max_total,
                window: config.buffer_max_failover_duration,
            },
            registry,
        ));

        let hc = HealthCheck::new(dialer, config.stream_backoff_max);
        // The cache needs to see tablets leaving service, so down events are
        // always requested.
        hc.set_listener(
            Arc::new(GatewayEventForwarder {
                tsc: Arc::clone(&tsc),
                buffer: Arc::clone(&buffer),
            }),
            true,
        );

        let mut watchers = Vec::new();
        for cell in config.cells() {
            let mut recorder: Arc<dyn TabletRecorder> = Arc::new(hc.clone());
            if !config.tablet_filters.is_empty() {
                recorder = Arc::new(FilterByShard::new(recorder, &config.tablet_filters)?);
            } else if !config.keyspaces_to_watch.is_empty() {
                recorder = Arc::new(FilterByKeyspace::new(
                    recorder,
                    config.keyspaces_to_watch.iter().cloned(),
                ));
            }

            let watcher = CellTabletsWatcher::new(
                Arc::clone(&topo),
                recorder,
                cell,
                config.refresh_interval,
                config.refresh_known_tablets,
                config.topo_read_concurrency,
                registry,
            );
            watcher.start();
            watchers.push(watcher);
        }

        info!(
            local_cell = %config.local_cell,
            cells = ?watchers.iter().map(CellTabletsWatcher::cell).collect::<Vec<_>>(),
            "tablet gateway started"
        );

        Ok(Self {
            topo,
            hc,
            tsc,
            buffer,
            watchers,
            local_cell: config.local_cell,
            retry_count: config.retry_count,
            allowed_tablet_types: config.allowed_tablet_types,
            route_replica_to_rdonly: config.route_replica_to_rdonly,
            keyspaces_to_watch: config.keyspaces_to_watch,
            status_metrics: StatusMetrics::new(registry),
            aggregators: Default::default(),
        })
    }

    /// Select a healthy tablet for `target`, run `action` against it, and
    /// retry (on another tablet) up to `retry_count` times when the action
    /// reports a retryable failure.
    ///
    /// The action receives the *tablet's* declared target (which tracks
    /// reparents ahead of the topology) and the tablet's RPC client. Whether
    /// an error is retryable is the action's call; the loop never interprets
    /// status codes.
    ///
    /// Non-transactional primary requests consult the failover buffer at
    /// most once: a request that failed because its shard lost its primary
    /// parks until the new primary is visible, then retries there.
    pub async fn execute<T, F, Fut>(
        &self,
        target: &Target,
        in_transaction: bool,
        action: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(Target, Arc<dyn TabletQueryService>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ActionError>> + Send,
        T: Send,
    {
        if !self.allowed_tablet_types.is_empty()
            && !self.allowed_tablet_types.contains(&target.tablet_type)
        {
            return Err(GatewayError::TabletTypeNotAllowed {
                requested: target.tablet_type,
                allowed: self.allowed_tablet_types.clone(),
            });
        }

        let mut invalid: HashSet<TabletAlias> = HashSet::new();
        let mut last_err: Option<GatewayError> = None;
        let mut buffered_once = false;
        // Held until the request completes so the buffer can account the
        // drained retry.
        let mut _retry_done: Option<RetryDone> = None;

        for _ in 0..self.retry_count + 1 {
            // A request is buffered at most once, and only when no
            // transaction is pinned to the failed primary.
            if !buffered_once && !in_transaction && target.tablet_type == TabletRole::Primary {
                match self
                    .buffer
                    .wait_for_failover_end(&target.keyspace, &target.shard, last_err.as_ref())
                    .await
                {
                    Ok(None) => {}
                    Ok(Some(retry_done)) => {
                        _retry_done = Some(retry_done);
                        buffered_once = true;
                    }
                    Err(source) => {
                        last_err = Some(GatewayError::Buffer {
                            source,
                            original: last_err.take().map(Box::new),
                        });
                        break;
                    }
                }
            }

            let mut tablets = self.tsc.get_healthy(target);
            if self.route_replica_to_rdonly && target.tablet_type == TabletRole::Replica {
                let rdonly = Target::new(&*target.keyspace, &*target.shard, TabletRole::ReadOnly);
                tablets.extend(self.tsc.get_healthy(&rdonly));
            }

            if tablets.is_empty() {
                // Fail fast: more attempts cannot conjure up tablets.
                last_err = Some(GatewayError::NoHealthyTablet {
                    target: target.clone(),
                });
                break;
            }

            shuffle_tablets(&self.local_cell, &mut tablets);

            // Skip tablets already tried by this request.
            let Some(stats) = tablets.into_iter().find(|t| !invalid.contains(t.alias())) else {
                if last_err.is_none() {
                    last_err = Some(GatewayError::NoConnection);
                }
                break;
            };
            let alias = stats.alias().clone();

            let Some(conn) = self.hc.get_connection(&alias) else {
                last_err = Some(GatewayError::TabletUnreachable {
                    alias: alias.clone(),
                });
                invalid.insert(alias);
                continue;
            };

            let started_at = Instant::now();
            let result = action(stats.target.clone(), conn).await;
            self.aggregator(target)
                .record(started_at.elapsed(), result.is_err());

            match result {
                Ok(value) => return Ok(value),
                Err(action_err) => {
                    let retryable = action_err.retryable;
                    last_err = Some(action_err.into());
                    if retryable {
                        invalid.insert(alias);
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err
            .unwrap_or(GatewayError::NoConnection)
            .wrap_with_target(target))
    }

    /// Block until at least one healthy tablet serves every
    /// keyspace/shard in the topology for each of `tablet_types_to_wait`.
    ///
    /// A no-op for an empty role list. Callers bound the wait with a timeout
    /// (or by dropping the future).
    pub async fn wait_for_tablets(
        &self,
        tablet_types_to_wait: &[TabletRole],
    ) -> Result<(), GatewayError> {
        if tablet_types_to_wait.is_empty() {
            return Ok(());
        }

        let mut targets = topo::find_all_targets(self.topo.as_ref(), tablet_types_to_wait).await?;
        if !self.keyspaces_to_watch.is_empty() {
            targets.retain(|t| self.keyspaces_to_watch.contains(&t.keyspace));
        }

        self.tsc.wait_for_all_serving(&targets).await;
        Ok(())
    }

    /// Per-target query statistics, sorted by keyspace/shard/role.
    pub fn cache_status(&self) -> Vec<TabletCacheStatus> {
        let mut rows: Vec<_> = self
            .aggregators
            .read()
            .values()
            .map(|aggregator| aggregator.status())
            .collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        rows
    }

    /// The largest refresh lag across the cell watchers.
    pub fn topology_watcher_max_refresh_lag(&self) -> Duration {
        self.watchers
            .iter()
            .map(CellTabletsWatcher::refresh_lag)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// The xor of the cell watchers' topology checksums.
    pub fn topology_watcher_checksum(&self) -> u32 {
        self.watchers
            .iter()
            .map(CellTabletsWatcher::topo_checksum)
            .fold(0, |acc, checksum| acc ^ checksum)
    }

    /// The health check owned by this gateway.
    pub fn health_check(&self) -> &HealthCheck {
        &self.hc
    }

    /// The number of requests currently parked in the failover buffer.
    pub fn buffered_requests(&self) -> usize {
        self.buffer.buffered_requests()
    }

    /// Shut down: wake buffered requests, stop the watchers, close every
    /// health subscription.
    pub async fn close(&self) -> Result<(), GatewayError> {
        self.buffer.shutdown();
        for watcher in &self.watchers {
            watcher.stop().await;
        }
        self.hc.close().await;
        info!("tablet gateway closed");
        Ok(())
    }

    /// Get (or lazily create) the status aggregator of `target`.
    fn aggregator(&self, target: &Target) -> Arc<TabletStatusAggregator> {
        if let Some(aggregator) = self.aggregators.read().get(target) {
            return Arc::clone(aggregator);
        }

        // Double-checked: take the write lock and re-probe before inserting.
        let mut aggregators = self.aggregators.write();
        Arc::clone(aggregators.entry(target.clone()).or_insert_with(|| {
            Arc::new(TabletStatusAggregator::new(
                target.clone(),
                &self.status_metrics,
            ))
        }))
    }
}

/// Order `tablets` so every same-cell tablet precedes every remote one, with
/// each partition independently shuffled.
///
/// Every retry therefore considers an unbiased same-cell candidate before
/// any remote-cell candidate.
fn shuffle_tablets(local_cell: &str, tablets: &mut Vec<TabletStats>) {
    let mut rng = rand::thread_rng();
    let (mut same_cell, mut diff_cell): (Vec<_>, Vec<_>) = tablets
        .drain(..)
        .partition(|t| t.alias().cell == local_cell);

    same_cell.shuffle(&mut rng);
    diff_cell.shuffle(&mut rng);

    tablets.append(&mut same_cell);
    tablets.append(&mut diff_cell);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TabletRecord;

    fn stats(cell: &str, uid: u32) -> TabletStats {
        let record = TabletRecord {
            alias: TabletAlias::new(cell, uid),
            hostname: format!("db-{uid}.{cell}"),
            port: 15991,
            keyspace: "commerce".to_string(),
            shard: "0".to_string(),
            tablet_type: TabletRole::Replica,
            key_range: None,
        };
        TabletStats {
            target: record.target(),
            record,
            replication_lag: Duration::ZERO,
        }
    }

    #[test]
    fn test_shuffle_keeps_same_cell_prefix() {
        let mut tablets = vec![
            stats("zone2", 10),
            stats("zone1", 1),
            stats("zone2", 11),
            stats("zone1", 2),
            stats("zone2", 12),
        ];

        for _ in 0..100 {
            shuffle_tablets("zone1", &mut tablets);
            assert_eq!(tablets.len(), 5);
            assert!(tablets[..2].iter().all(|t| t.alias().cell == "zone1"));
            assert!(tablets[2..].iter().all(|t| t.alias().cell == "zone2"));
        }
    }

    #[test]
    fn test_shuffle_without_local_tablets() {
        let mut tablets = vec![stats("zone2", 10), stats("zone3", 11)];
        shuffle_tablets("zone1", &mut tablets);
        assert_eq!(tablets.len(), 2);
    }
}
