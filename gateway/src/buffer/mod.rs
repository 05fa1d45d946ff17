//! The failover buffer.
//!
//! While a shard's primary is known to be in transition, incoming
//! primary-role requests are parked here briefly instead of failing, then
//! released once the new primary is visible (or the failover window
//! expires). Capacity is bounded per shard and globally; memory-resident
//! only, nothing survives a restart.
//!
//! A shard enters buffering either *explicitly* (a health event shows its
//! serving primary going away) or *implicitly* (a primary request failed
//! with an error that looks like a failover, and a serving primary has been
//! seen since the last episode ended).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use metric::{U64Counter, U64Gauge};
use observability_deps::tracing::info;
use parking_lot::RwLock;
use thiserror::Error;

mod shard_buffer;

pub use shard_buffer::RetryDone;
use shard_buffer::ShardBuffer;

use crate::error::GatewayError;
use crate::healthcheck::HealthEvent;
use crate::types::TabletRole;

/// Admission errors. Callers must not retry after receiving one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The per-shard or global buffered-request budget is exhausted.
    #[error("failover buffer full for shard {keyspace}/{shard}")]
    Full {
        /// The keyspace of the full shard buffer.
        keyspace: String,
        /// The shard whose buffer is full.
        shard: String,
    },

    /// The buffer was shut down while the request was parked (or before it
    /// could be admitted).
    #[error("failover buffer is shut down")]
    Shutdown,
}

/// Failover buffer sizing and behaviour.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Buffer at all? A disabled buffer admits nothing and never blocks.
    pub enabled: bool,
    /// Maximum parked requests per shard.
    pub max_per_shard: usize,
    /// Maximum parked requests across all shards.
    pub max_total: usize,
    /// How long one failover may keep a shard buffering before all waiters
    /// are released regardless.
    pub window: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_per_shard: 10,
            max_total: 1000,
            window: Duration::from_secs(20),
        }
    }
}

#[derive(Debug)]
pub(crate) struct BufferMetrics {
    pub(crate) buffered: metric::Metric<U64Gauge>,
    pub(crate) buffered_total: metric::Metric<U64Counter>,
    pub(crate) evicted_total: metric::Metric<U64Counter>,
    pub(crate) releases: metric::Metric<U64Counter>,
}

impl BufferMetrics {
    fn new(registry: &metric::Registry) -> Self {
        Self {
            buffered: registry.register_metric(
                "buffer_requests_buffered",
                "requests currently parked in the failover buffer",
            ),
            buffered_total: registry.register_metric(
                "buffer_requests_buffered_total",
                "requests ever admitted to the failover buffer",
            ),
            evicted_total: registry.register_metric(
                "buffer_requests_evicted_total",
                "requests refused because the failover buffer was full",
            ),
            releases: registry.register_metric(
                "buffer_releases_total",
                "buffered-request releases by reason",
            ),
        }
    }
}

/// The failover buffer across all shards.
#[derive(Debug)]
pub struct Buffer {
    config: BufferConfig,
    global_count: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    shards: RwLock<HashMap<(String, String), Arc<ShardBuffer>>>,
    metrics: BufferMetrics,
}

impl Buffer {
    /// Initialise a buffer with the provided sizing.
    pub fn new(config: BufferConfig, registry: &metric::Registry) -> Self {
        Self {
            config,
            global_count: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            shards: Default::default(),
            metrics: BufferMetrics::new(registry),
        }
    }

    /// Ask the buffer whether (and until when) the calling primary request
    /// should wait out a failover of `keyspace/shard`.
    ///
    /// - `Ok(None)`: not buffered; proceed immediately.
    /// - `Ok(Some(retry_done))`: the request was parked and has now been
    ///   released; retry, then drop the handle.
    /// - `Err(_)`: admission refused; surface the error, do not retry.
    ///
    /// `last_error` is the error that sent the request here, if any; it is
    /// only consulted when the shard is not already buffering.
    ///
    /// A parked request that is abandoned (its future dropped, e.g. on the
    /// caller's deadline) releases its slot immediately.
    pub async fn wait_for_failover_end(
        &self,
        keyspace: &str,
        shard: &str,
        last_error: Option<&GatewayError>,
    ) -> Result<Option<RetryDone>, BufferError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let failover_signal = last_error.is_some_and(GatewayError::is_failover_signal);

        let existing = self
            .shards
            .read()
            .get(&(keyspace.to_string(), shard.to_string()))
            .map(Arc::clone);
        let shard_buffer = match existing {
            Some(shard_buffer) => shard_buffer,
            // Nothing known about the shard and nothing suggesting a
            // failover: skip creating state for it.
            None if !failover_signal => return Ok(None),
            None => self.shard(keyspace, shard),
        };

        shard_buffer.wait_for_failover_end(failover_signal).await
    }

    /// Observe a health event. Only primary-role events are relevant: they
    /// start buffering (serving primary lost) and release it (new serving
    /// primary).
    pub(crate) fn stats_update(&self, event: &HealthEvent) {
        if !self.config.enabled {
            return;
        }
        if event.new.target.tablet_type != TabletRole::Primary {
            return;
        }
        let target = &event.new.target;
        self.shard(&target.keyspace, &target.shard)
            .on_primary_health(event);
    }

    /// Wake every parked request with [`BufferError::Shutdown`] and refuse
    /// all further admission.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let shards: Vec<_> = self.shards.read().values().map(Arc::clone).collect();
        if !shards.is_empty() {
            info!(shards = shards.len(), "shutting down failover buffer");
        }
        for shard in shards {
            shard.shutdown();
        }
    }

    /// The number of requests currently parked, across all shards.
    pub fn buffered_requests(&self) -> usize {
        self.global_count.load(Ordering::SeqCst)
    }

    fn shard(&self, keyspace: &str, shard: &str) -> Arc<ShardBuffer> {
        let key = (keyspace.to_string(), shard.to_string());
        if let Some(shard_buffer) = self.shards.read().get(&key) {
            return Arc::clone(shard_buffer);
        }

        let mut shards = self.shards.write();
        Arc::clone(shards.entry(key).or_insert_with(|| {
            Arc::new(ShardBuffer::new(
                keyspace.to_string(),
                shard.to_string(),
                self.config.clone(),
                Arc::clone(&self.global_count),
                Arc::clone(&self.shutdown),
                &self.metrics,
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use assert_matches::assert_matches;
    use tonic::Status;

    use super::*;
    use crate::error::ActionError;
    use crate::types::{TabletAlias, TabletHealth, TabletRecord, Target};

    fn enabled_config() -> BufferConfig {
        BufferConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn primary_event(uid: u32, serving: bool) -> HealthEvent {
        let alias = TabletAlias::new("zone1", uid);
        HealthEvent {
            record: TabletRecord {
                alias: alias.clone(),
                hostname: format!("db-{uid}.zone1"),
                port: 15991,
                keyspace: "commerce".to_string(),
                shard: "0".to_string(),
                tablet_type: TabletRole::Primary,
                key_range: None,
            },
            old: None,
            new: TabletHealth {
                target: Target::new("commerce", "0", TabletRole::Primary),
                serving,
                up: true,
                replication_lag: Duration::ZERO,
                last_error: None,
                last_update: Instant::now(),
            },
        }
    }

    fn failover_error() -> GatewayError {
        ActionError::retryable(Status::unavailable("operation not allowed: primary is not serving")).into()
    }

    #[tokio::test]
    async fn test_disabled_buffer_never_parks() {
        let buffer = Buffer::new(BufferConfig::default(), &metric::Registry::new());
        buffer.stats_update(&primary_event(1, false));

        let got = buffer
            .wait_for_failover_end("commerce", "0", Some(&failover_error()))
            .await;
        assert_matches!(got, Ok(None));
    }

    #[tokio::test]
    async fn test_idle_without_failover_signal_is_a_no_op() {
        let buffer = Buffer::new(enabled_config(), &metric::Registry::new());

        let got = buffer.wait_for_failover_end("commerce", "0", None).await;
        assert_matches!(got, Ok(None));

        let plain: GatewayError =
            ActionError::retryable(Status::unavailable("connection refused")).into();
        let got = buffer
            .wait_for_failover_end("commerce", "0", Some(&plain))
            .await;
        assert_matches!(got, Ok(None));

        assert_eq!(buffer.buffered_requests(), 0);
    }

    #[tokio::test]
    async fn test_explicit_failover_parks_and_releases_on_new_primary() {
        let buffer = Arc::new(Buffer::new(enabled_config(), &metric::Registry::new()));

        // Primary 1 serving, then gone: buffering begins.
        buffer.stats_update(&primary_event(1, true));
        buffer.stats_update(&primary_event(1, false));

        let parked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!parked.is_finished());
        assert_eq!(buffer.buffered_requests(), 1);

        // The same primary reappearing does not release the buffer.
        buffer.stats_update(&primary_event(1, true));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!parked.is_finished());

        // A different serving primary does.
        buffer.stats_update(&primary_event(2, true));
        let got = tokio::time::timeout(Duration::from_secs(5), parked)
            .await
            .expect("waiter should be released")
            .expect("waiter should not panic");
        let retry_done = assert_matches!(got, Ok(Some(r)) => r);

        // The slot is freed once the retry completes.
        assert_eq!(buffer.buffered_requests(), 1);
        retry_done.done();
        assert_eq!(buffer.buffered_requests(), 0);
    }

    #[tokio::test]
    async fn test_implicit_failover_signal_starts_buffering() {
        let buffer = Arc::new(Buffer::new(enabled_config(), &metric::Registry::new()));

        let parked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer
                    .wait_for_failover_end("commerce", "0", Some(&failover_error()))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!parked.is_finished());

        buffer.stats_update(&primary_event(2, true));
        let got = tokio::time::timeout(Duration::from_secs(5), parked)
            .await
            .expect("waiter should be released")
            .expect("waiter should not panic");
        assert_matches!(got, Ok(Some(_)));
    }

    #[tokio::test]
    async fn test_per_shard_capacity() {
        let config = BufferConfig {
            enabled: true,
            max_per_shard: 3,
            ..Default::default()
        };
        let buffer = Arc::new(Buffer::new(config, &metric::Registry::new()));

        buffer.stats_update(&primary_event(1, true));
        buffer.stats_update(&primary_event(1, false));

        let mut parked = vec![];
        for _ in 0..3 {
            let buffer = Arc::clone(&buffer);
            parked.push(tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.buffered_requests(), 3);

        // The fourth is refused immediately.
        let got = buffer.wait_for_failover_end("commerce", "0", None).await;
        assert_matches!(got, Err(BufferError::Full { keyspace, shard }) => {
            assert_eq!(keyspace, "commerce");
            assert_eq!(shard, "0");
        });

        // After release the three parked requests complete.
        buffer.stats_update(&primary_event(2, true));
        for handle in parked {
            let got = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("waiter should be released")
                .expect("waiter should not panic");
            assert_matches!(got, Ok(Some(_)));
        }
    }

    #[tokio::test]
    async fn test_global_capacity() {
        let config = BufferConfig {
            enabled: true,
            max_per_shard: 10,
            max_total: 1,
            ..Default::default()
        };
        let buffer = Arc::new(Buffer::new(config, &metric::Registry::new()));

        // Two shards failing over.
        buffer.stats_update(&primary_event(1, true));
        buffer.stats_update(&primary_event(1, false));

        let parked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.buffered_requests(), 1);

        // The global budget refuses the second, despite per-shard headroom.
        let got = buffer.wait_for_failover_end("commerce", "0", None).await;
        assert_matches!(got, Err(BufferError::Full { .. }));

        buffer.stats_update(&primary_event(2, true));
        parked.await.expect("waiter should not panic").expect("release");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_releases_and_rearms_only_after_primary_seen() {
        let buffer = Arc::new(Buffer::new(enabled_config(), &metric::Registry::new()));

        buffer.stats_update(&primary_event(1, true));
        buffer.stats_update(&primary_event(1, false));

        let parked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            })
        };

        // No new primary arrives; the 20s window expires and the waiter is
        // released back to its retry loop.
        let got = tokio::time::timeout(Duration::from_secs(60), parked)
            .await
            .expect("window expiry should release the waiter")
            .expect("waiter should not panic");
        let retry_done = assert_matches!(got, Ok(Some(r)) => r);
        retry_done.done();

        // Until a serving primary is seen again, stale failover errors do
        // not re-enter the buffer.
        let got = buffer
            .wait_for_failover_end("commerce", "0", Some(&failover_error()))
            .await;
        assert_matches!(got, Ok(None));

        // Once a serving primary is seen, a fresh failover buffers again.
        buffer.stats_update(&primary_event(2, true));
        buffer.stats_update(&primary_event(2, false));

        let parked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!parked.is_finished());

        buffer.stats_update(&primary_event(3, true));
        let got = parked.await.expect("waiter should not panic");
        assert_matches!(got, Ok(Some(_)));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_and_blocks_admission() {
        let buffer = Arc::new(Buffer::new(enabled_config(), &metric::Registry::new()));

        buffer.stats_update(&primary_event(1, true));
        buffer.stats_update(&primary_event(1, false));

        let parked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        buffer.shutdown();

        let got = tokio::time::timeout(Duration::from_secs(5), parked)
            .await
            .expect("shutdown should wake the waiter")
            .expect("waiter should not panic");
        assert_matches!(got, Err(BufferError::Shutdown));
        assert_eq!(buffer.buffered_requests(), 0);

        // Nothing is admitted any more.
        let got = buffer
            .wait_for_failover_end("commerce", "0", Some(&failover_error()))
            .await;
        assert_matches!(got, Ok(None));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_frees_its_slot() {
        let config = BufferConfig {
            enabled: true,
            max_per_shard: 1,
            ..Default::default()
        };
        let buffer = Arc::new(Buffer::new(config, &metric::Registry::new()));

        buffer.stats_update(&primary_event(1, true));
        buffer.stats_update(&primary_event(1, false));

        let parked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.buffered_requests(), 1);

        // The caller gives up (deadline): dropping the future frees the
        // slot for another request.
        parked.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.buffered_requests(), 0);

        let reparked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                buffer.wait_for_failover_end("commerce", "0", None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.buffered_requests(), 1);

        buffer.stats_update(&primary_event(2, true));
        assert_matches!(
            reparked.await.expect("waiter should not panic"),
            Ok(Some(_))
        );
    }
}
