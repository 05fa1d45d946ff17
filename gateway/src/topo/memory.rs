//! An in-memory [`TopoServer`] for tests and embedded deployments.

use std::collections::BTreeSet;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{ShardRecord, TopoError, TopoServer};
use crate::types::{TabletAlias, TabletRecord};

/// A [`TopoServer`] backed by hashmaps protected with a read-write mutex.
///
/// Mutation methods exist so tests (and embedded single-process deployments)
/// can drive topology changes directly.
#[derive(Debug, Default)]
pub struct MemoryTopoServer {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    tablets: HashMap<TabletAlias, TabletRecord>,
    shards: HashMap<(String, String), ShardRecord>,
}

impl MemoryTopoServer {
    /// Insert or overwrite a tablet record.
    pub fn upsert_tablet(&self, rec: TabletRecord) {
        self.state.write().tablets.insert(rec.alias.clone(), rec);
    }

    /// Delete a tablet record. Deleting an unknown alias is a no-op.
    pub fn delete_tablet(&self, alias: &TabletAlias) {
        self.state.write().tablets.remove(alias);
    }

    /// Record the primary election of a shard.
    pub fn set_shard_primary(
        &self,
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        primary_alias: Option<TabletAlias>,
    ) {
        let keyspace = keyspace.into();
        let shard = shard.into();
        self.state.write().shards.insert(
            (keyspace.clone(), shard.clone()),
            ShardRecord {
                keyspace,
                shard,
                primary_alias,
            },
        );
    }
}

#[async_trait]
impl TopoServer for MemoryTopoServer {
    async fn list_tablets(&self, cell: &str) -> Result<Vec<TabletAlias>, TopoError> {
        Ok(self
            .state
            .read()
            .tablets
            .keys()
            .filter(|alias| alias.cell == cell)
            .cloned()
            .collect())
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> Result<TabletRecord, TopoError> {
        self.state
            .read()
            .tablets
            .get(alias)
            .cloned()
            .ok_or_else(|| TopoError::NotFound(alias.to_string()))
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardRecord, TopoError> {
        self.state
            .read()
            .shards
            .get(&(keyspace.to_string(), shard.to_string()))
            .cloned()
            .ok_or_else(|| TopoError::NotFound(format!("{keyspace}/{shard}")))
    }

    async fn list_keyspaces(&self) -> Result<Vec<String>, TopoError> {
        let state = self.state.read();
        let keyspaces: BTreeSet<String> = state
            .tablets
            .values()
            .map(|t| t.keyspace.clone())
            .chain(state.shards.keys().map(|(keyspace, _)| keyspace.clone()))
            .collect();
        Ok(keyspaces.into_iter().collect())
    }

    async fn list_shards(&self, keyspace: &str) -> Result<Vec<String>, TopoError> {
        let state = self.state.read();
        let shards: BTreeSet<String> = state
            .tablets
            .values()
            .filter(|t| t.keyspace == keyspace)
            .map(|t| t.shard.clone())
            .chain(
                state
                    .shards
                    .keys()
                    .filter(|(ks, _)| ks == keyspace)
                    .map(|(_, shard)| shard.clone()),
            )
            .collect();
        Ok(shards.into_iter().collect())
    }
}
