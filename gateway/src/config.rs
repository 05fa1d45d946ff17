//! Gateway configuration.
//!
//! All knobs live in a single [`GatewayConfig`] value built once at startup
//! and threaded through the constructors - nothing on the hot path consults
//! process globals.

use std::num::ParseIntError;
use std::time::Duration;

use thiserror::Error;

use crate::types::TabletRole;

/// Startup configuration errors. Fatal: the gateway refuses to construct.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `tablet_filters` and `keyspaces_to_watch` cannot be combined.
    #[error("only one of --tablet-filters and --keyspaces-to-watch may be specified at a time")]
    MutuallyExclusiveFilters,

    /// A `tablet_filters` entry is not of the form `keyspace|shard`.
    #[error("invalid tablet filter {0:?}, expected \"keyspace|shard\"")]
    InvalidTabletFilter(String),
}

/// CLI config for the tablet discovery gateway.
#[derive(Debug, Clone, clap::Parser)]
pub struct GatewayConfig {
    /// The cell this gateway runs in. Same-cell tablets are preferred for
    /// REPLICA/RDONLY routing.
    #[clap(long = "cell", env = "GATEWAY_CELL", default_value = "", action)]
    pub local_cell: String,

    /// Comma-separated list of cells whose tablets this gateway watches and
    /// routes to. Empty entries are skipped.
    #[clap(
        long = "cells-to-watch",
        env = "GATEWAY_CELLS_TO_WATCH",
        value_delimiter = ','
    )]
    pub cells_to_watch: Vec<String>,

    /// Number of retries after the initial attempt of a query.
    #[clap(
        long = "gateway-retry-count",
        env = "GATEWAY_RETRY_COUNT",
        default_value = "2",
        action
    )]
    pub retry_count: usize,

    /// Route REPLICA queries to RDONLY tablets as well as REPLICA tablets.
    #[clap(
        long = "gateway-route-replica-to-rdonly",
        env = "GATEWAY_ROUTE_REPLICA_TO_RDONLY",
        default_value = "false",
        action
    )]
    pub route_replica_to_rdonly: bool,

    /// Tablet roles this gateway is willing to route to. Empty means all
    /// roles are allowed.
    #[clap(
        long = "allowed-tablet-types",
        env = "GATEWAY_ALLOWED_TABLET_TYPES",
        value_delimiter = ','
    )]
    pub allowed_tablet_types: Vec<TabletRole>,

    /// Watch only tablets matching these `keyspace|shard` entries.
    /// Mutually exclusive with `--keyspaces-to-watch`.
    #[clap(
        long = "tablet-filters",
        env = "GATEWAY_TABLET_FILTERS",
        value_delimiter = ','
    )]
    pub tablet_filters: Vec<String>,

    /// Watch only tablets belonging to these keyspaces. Mutually exclusive
    /// with `--tablet-filters`.
    #[clap(
        long = "keyspaces-to-watch",
        env = "GATEWAY_KEYSPACES_TO_WATCH",
        value_delimiter = ','
    )]
    pub keyspaces_to_watch: Vec<String>,

    /// Seconds between topology refreshes of each watched cell.
    #[clap(
        long = "topo-refresh-interval-seconds",
        env = "GATEWAY_TOPO_REFRESH_INTERVAL_SECONDS",
        default_value = "60",
        value_parser = parse_duration
    )]
    pub refresh_interval: Duration,

    /// Re-read the record of every known tablet on each refresh, rather than
    /// only diffing the alias listing.
    #[clap(
        long = "topo-refresh-known-tablets",
        env = "GATEWAY_TOPO_REFRESH_KNOWN_TABLETS",
        default_value = "true",
        action
    )]
    pub refresh_known_tablets: bool,

    /// Maximum outstanding tablet record reads per topology refresh.
    #[clap(
        long = "topo-read-concurrency",
        env = "GATEWAY_TOPO_READ_CONCURRENCY",
        default_value = "32",
        action
    )]
    pub topo_read_concurrency: usize,

    /// Maximum replication lag before a REPLICA/RDONLY tablet is considered
    /// unhealthy, in seconds.
    #[clap(
        long = "discovery-low-replication-lag-seconds",
        env = "GATEWAY_DISCOVERY_LOW_REPLICATION_LAG_SECONDS",
        default_value = "30",
        value_parser = parse_duration
    )]
    pub lag_threshold: Duration,

    /// Upper bound of the exponential retry backoff of a tablet health
    /// stream, in seconds.
    #[clap(
        long = "health-check-stream-backoff-max-seconds",
        env = "GATEWAY_HEALTH_CHECK_STREAM_BACKOFF_MAX_SECONDS",
        default_value = "30",
        value_parser = parse_duration
    )]
    pub stream_backoff_max: Duration,

    /// Buffer (rather than fail) primary requests while a shard's primary is
    /// failing over.
    #[clap(
        long = "buffer-enabled",
        env = "GATEWAY_BUFFER_ENABLED",
        default_value = "false",
        action
    )]
    pub buffer_enabled: bool,

    /// Maximum buffered requests per shard.
    #[clap(
        long = "buffer-size-per-shard",
        env = "GATEWAY_BUFFER_SIZE_PER_SHARD",
        default_value = "10",
        action
    )]
    pub buffer_size_per_shard: usize,

    /// Maximum buffered requests across all shards.
    #[clap(
        long = "buffer-max-total",
        env = "GATEWAY_BUFFER_MAX_TOTAL",
        default_value = "1000",
        action
    )]
    pub buffer_max_total: usize,

    /// Maximum seconds a shard is buffered for during one failover before
    /// all waiters are released.
    #[clap(
        long = "buffer-max-failover-duration-seconds",
        env = "GATEWAY_BUFFER_MAX_FAILOVER_DURATION_SECONDS",
        default_value = "20",
        value_parser = parse_duration
    )]
    pub buffer_max_failover_duration: Duration,
}

impl GatewayConfig {
    /// Check cross-field constraints not expressible per-flag.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tablet_filters.is_empty() && !self.keyspaces_to_watch.is_empty() {
            return Err(ConfigError::MutuallyExclusiveFilters);
        }
        Ok(())
    }

    /// The configured cells, with empty entries skipped.
    pub fn cells(&self) -> impl Iterator<Item = &str> {
        self.cells_to_watch
            .iter()
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            local_cell: String::new(),
            cells_to_watch: vec![],
            retry_count: 2,
            route_replica_to_rdonly: false,
            allowed_tablet_types: vec![],
            tablet_filters: vec![],
            keyspaces_to_watch: vec![],
            refresh_interval: Duration::from_secs(60),
            refresh_known_tablets: true,
            topo_read_concurrency: 32,
            lag_threshold: Duration::from_secs(30),
            stream_backoff_max: Duration::from_secs(30),
            buffer_enabled: false,
            buffer_size_per_shard: 10,
            buffer_max_total: 1000,
            buffer_max_failover_duration: Duration::from_secs(20),
        }
    }
}

/// Map a string containing an integer number of seconds into a [`Duration`].
fn parse_duration(input: &str) -> Result<Duration, ParseIntError> {
    input.parse().map(Duration::from_secs)
}
