//! Per-target query statistics for ops surfaces.

use std::borrow::Cow;
use std::time::Duration;

use metric::{DurationHistogram, U64Counter};

use crate::types::Target;

/// The registry instruments the per-target aggregators record through.
#[derive(Debug)]
pub(crate) struct StatusMetrics {
    queries: metric::Metric<U64Counter>,
    errors: metric::Metric<U64Counter>,
    duration: metric::Metric<DurationHistogram>,
}

impl StatusMetrics {
    pub(crate) fn new(registry: &metric::Registry) -> Self {
        Self {
            queries: registry.register_metric(
                "gateway_queries_total",
                "queries executed, by keyspace/shard/tablet type",
            ),
            errors: registry.register_metric(
                "gateway_query_errors_total",
                "queries that returned an error, by keyspace/shard/tablet type",
            ),
            duration: registry.register_metric(
                "gateway_query_duration",
                "distribution of per-attempt query latency",
            ),
        }
    }
}

/// Success/error counts and a latency distribution for one target.
///
/// Created lazily per target; writes happen on every query attempt, reads
/// only from ops dashboards.
#[derive(Debug)]
pub struct TabletStatusAggregator {
    target: Target,
    queries: U64Counter,
    errors: U64Counter,
    duration: DurationHistogram,
}

impl TabletStatusAggregator {
    pub(crate) fn new(target: Target, metrics: &StatusMetrics) -> Self {
        let attributes = [
            ("keyspace", Cow::from(target.keyspace.clone())),
            ("shard", Cow::from(target.shard.clone())),
            ("tablet_type", Cow::from(target.tablet_type.as_str())),
        ];
        Self {
            queries: metrics.queries.recorder(attributes.clone()),
            errors: metrics.errors.recorder(attributes.clone()),
            duration: metrics.duration.recorder(attributes),
            target,
        }
    }

    /// Record one query attempt.
    pub(crate) fn record(&self, elapsed: Duration, is_error: bool) {
        self.queries.inc(1);
        if is_error {
            self.errors.inc(1);
        }
        self.duration.record(elapsed);
    }

    /// Snapshot this aggregator for `cache_status`.
    pub(crate) fn status(&self) -> TabletCacheStatus {
        TabletCacheStatus {
            target: self.target.clone(),
            query_count: self.queries.fetch(),
            error_count: self.errors.fetch(),
            latencies: self.duration.fetch(),
        }
    }
}

/// One row of [`TabletGateway::cache_status`](crate::gateway::TabletGateway::cache_status).
#[derive(Debug, Clone)]
pub struct TabletCacheStatus {
    /// The target the row aggregates.
    pub target: Target,
    /// Queries attempted against the target.
    pub query_count: u64,
    /// Attempts that returned an error.
    pub error_count: u64,
    /// The per-attempt latency distribution.
    pub latencies: metric::HistogramObservation<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TabletRole;

    #[test]
    fn test_aggregator_counts() {
        let registry = metric::Registry::new();
        let metrics = StatusMetrics::new(&registry);
        let aggregator = TabletStatusAggregator::new(
            Target::new("commerce", "0", TabletRole::Replica),
            &metrics,
        );

        aggregator.record(Duration::from_millis(3), false);
        aggregator.record(Duration::from_millis(7), true);
        aggregator.record(Duration::from_millis(2), false);

        let status = aggregator.status();
        assert_eq!(status.query_count, 3);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.latencies.sample_count(), 3);
        assert_eq!(status.latencies.total, Duration::from_millis(12));
    }
}
