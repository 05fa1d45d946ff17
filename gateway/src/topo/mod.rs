//! The topology server contract and the machinery consuming it.
//!
//! The topology server is an external, strongly-consistent metadata store.
//! The gateway only ever reads from it: cells are enumerated into tablet
//! sets by the per-cell [`watcher`], and `wait_for_tablets` enumerates the
//! keyspace/shard universe through it.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{TabletAlias, TabletRecord, TabletRole, Target};

pub mod filter;
pub mod memory;
pub mod watcher;

/// Errors returned by a [`TopoServer`].
///
/// Transient errors never reach the query path: watcher refreshes log them
/// and retry on the next tick.
#[derive(Debug, Error)]
pub enum TopoError {
    /// The requested node does not exist.
    #[error("topology node not found: {0}")]
    NotFound(String),

    /// The topology server could not be reached or answered with a transient
    /// failure.
    #[error("topology server unavailable: {0}")]
    Unavailable(String),
}

/// A shard as described by the topology server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRecord {
    /// The owning keyspace.
    pub keyspace: String,
    /// The shard name.
    pub shard: String,
    /// The alias of the tablet currently elected primary, if any.
    pub primary_alias: Option<TabletAlias>,
}

/// Read access to the topology server.
///
/// Implementations must be cheap to share (`Arc`) and safe to call
/// concurrently.
#[async_trait]
pub trait TopoServer: Send + Sync + std::fmt::Debug {
    /// Enumerate the aliases of every tablet in `cell`.
    async fn list_tablets(&self, cell: &str) -> Result<Vec<TabletAlias>, TopoError>;

    /// Read the record of a single tablet.
    async fn get_tablet(&self, alias: &TabletAlias) -> Result<TabletRecord, TopoError>;

    /// Read the record of a single shard, including its primary election.
    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardRecord, TopoError>;

    /// Enumerate all keyspaces.
    async fn list_keyspaces(&self) -> Result<Vec<String>, TopoError>;

    /// Enumerate the shards of `keyspace`.
    async fn list_shards(&self, keyspace: &str) -> Result<Vec<String>, TopoError>;
}

/// The sink of topology watcher observations.
///
/// The health check implements this; [`filter`] decorators narrow what
/// reaches it.
pub trait TabletRecorder: Send + Sync + std::fmt::Debug {
    /// A tablet appeared in the topology.
    fn add_tablet(&self, rec: TabletRecord);

    /// A tablet disappeared from the topology.
    fn remove_tablet(&self, alias: &TabletAlias);

    /// A known tablet's record changed. Logically remove+add, but
    /// implementations may reuse resources when the endpoint is unchanged.
    fn replace_tablet(&self, old: &TabletAlias, rec: TabletRecord);
}

/// Enumerate every `(keyspace, shard)` in the topology crossed with `roles`.
pub async fn find_all_targets(
    topo: &dyn TopoServer,
    roles: &[TabletRole],
) -> Result<Vec<Target>, TopoError> {
    let mut targets = vec![];
    for keyspace in topo.list_keyspaces().await? {
        for shard in topo.list_shards(&keyspace).await? {
            for role in roles {
                targets.push(Target::new(&*keyspace, &*shard, *role));
            }
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::memory::MemoryTopoServer;
    use super::*;
    use crate::types::TabletAlias;

    fn tablet(cell: &str, uid: u32, keyspace: &str, shard: &str) -> TabletRecord {
        TabletRecord {
            alias: TabletAlias::new(cell, uid),
            hostname: format!("db-{uid}.{cell}"),
            port: 15991,
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            tablet_type: TabletRole::Replica,
            key_range: None,
        }
    }

    #[tokio::test]
    async fn test_find_all_targets() {
        let topo = Arc::new(MemoryTopoServer::default());
        topo.upsert_tablet(tablet("zone1", 1, "commerce", "-80"));
        topo.upsert_tablet(tablet("zone1", 2, "commerce", "80-"));
        topo.upsert_tablet(tablet("zone2", 3, "customer", "0"));

        let mut got = find_all_targets(topo.as_ref(), &[TabletRole::Primary, TabletRole::Replica])
            .await
            .unwrap();
        got.sort();

        assert_eq!(
            got,
            vec![
                Target::new("commerce", "-80", TabletRole::Primary),
                Target::new("commerce", "-80", TabletRole::Replica),
                Target::new("commerce", "80-", TabletRole::Primary),
                Target::new("commerce", "80-", TabletRole::Replica),
                Target::new("customer", "0", TabletRole::Primary),
                Target::new("customer", "0", TabletRole::Replica),
            ]
        );
    }
}
