//! [`TabletRecorder`] decorators narrowing which tablets reach the health
//! check.
//!
//! Filtering happens at the recorder seam (per cell, not per subscription):
//! filtered-out tablets are simply never handed to the inner recorder. A
//! record change that moves a tablet across the filter boundary is turned
//! into the corresponding add or remove.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use super::TabletRecorder;
use crate::config::ConfigError;
use crate::types::{TabletAlias, TabletRecord};

/// Forwards only tablets belonging to an allow-list of keyspaces.
#[derive(Debug)]
pub struct FilterByKeyspace {
    inner: Arc<dyn TabletRecorder>,
    keyspaces: HashSet<String>,
}

impl FilterByKeyspace {
    /// Wrap `inner`, forwarding only tablets in `keyspaces`.
    pub fn new(
        inner: Arc<dyn TabletRecorder>,
        keyspaces: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            inner,
            keyspaces: keyspaces.into_iter().collect(),
        }
    }

    fn matches(&self, rec: &TabletRecord) -> bool {
        self.keyspaces.contains(&rec.keyspace)
    }
}

impl TabletRecorder for FilterByKeyspace {
    fn add_tablet(&self, rec: TabletRecord) {
        if self.matches(&rec) {
            self.inner.add_tablet(rec);
        }
    }

    fn remove_tablet(&self, alias: &TabletAlias) {
        // The inner recorder ignores aliases it never saw, so removals are
        // forwarded unconditionally.
        self.inner.remove_tablet(alias);
    }

    fn replace_tablet(&self, old: &TabletAlias, rec: TabletRecord) {
        if self.matches(&rec) {
            self.inner.replace_tablet(old, rec);
        } else {
            self.inner.remove_tablet(old);
        }
    }
}

/// Forwards only tablets matching an allow-list of `keyspace|shard` entries.
#[derive(Debug)]
pub struct FilterByShard {
    inner: Arc<dyn TabletRecorder>,
    /// keyspace -> allowed shard names.
    shards: HashMap<String, HashSet<String>>,
}

impl FilterByShard {
    /// Wrap `inner`, forwarding only tablets matching one of the
    /// `keyspace|shard` entries in `filters`.
    pub fn new(inner: Arc<dyn TabletRecorder>, filters: &[String]) -> Result<Self, ConfigError> {
        let mut shards: HashMap<String, HashSet<String>> = HashMap::new();
        for filter in filters {
            let (keyspace, shard) = filter
                .split_once('|')
                .filter(|(keyspace, shard)| !keyspace.is_empty() && !shard.is_empty())
                .ok_or_else(|| ConfigError::InvalidTabletFilter(filter.clone()))?;
            shards
                .entry(keyspace.to_string())
                .or_default()
                .insert(shard.to_string());
        }
        Ok(Self { inner, shards })
    }

    fn matches(&self, rec: &TabletRecord) -> bool {
        self.shards
            .get(&rec.keyspace)
            .is_some_and(|shards| shards.contains(&rec.shard))
    }
}

impl TabletRecorder for FilterByShard {
    fn add_tablet(&self, rec: TabletRecord) {
        if self.matches(&rec) {
            self.inner.add_tablet(rec);
        }
    }

    fn remove_tablet(&self, alias: &TabletAlias) {
        self.inner.remove_tablet(alias);
    }

    fn replace_tablet(&self, old: &TabletAlias, rec: TabletRecord) {
        if self.matches(&rec) {
            self.inner.replace_tablet(old, rec);
        } else {
            self.inner.remove_tablet(old);
        }
    }
}


#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::mock::{Observation, RecordingRecorder};
    use super::*;
    use crate::types::TabletRole;

    fn tablet(uid: u32, keyspace: &str, shard: &str) -> TabletRecord {
        TabletRecord {
            alias: TabletAlias::new("zone1", uid),
            hostname: format!("db-{uid}"),
            port: 15991,
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            tablet_type: TabletRole::Replica,
            key_range: None,
        }
    }

    #[test]
    fn test_filter_by_keyspace() {
        let recording = Arc::new(RecordingRecorder::default());
        let filter = FilterByKeyspace::new(
            Arc::clone(&recording) as _,
            ["commerce".to_string()],
        );

        let wanted = tablet(1, "commerce", "0");
        let unwanted = tablet(2, "internal", "0");

        filter.add_tablet(wanted.clone());
        filter.add_tablet(unwanted.clone());

        assert_eq!(
            recording.take(),
            vec![Observation::Add(wanted.clone())]
        );

        // A record change that leaves the allow-list becomes a removal.
        let mut moved = wanted.clone();
        moved.keyspace = "internal".to_string();
        filter.replace_tablet(&wanted.alias, moved);

        assert_eq!(
            recording.take(),
            vec![Observation::Remove(wanted.alias)]
        );
    }

    #[test]
    fn test_filter_by_shard() {
        let recording = Arc::new(RecordingRecorder::default());
        let filter = FilterByShard::new(
            Arc::clone(&recording) as _,
            &["commerce|-80".to_string(), "commerce|80-".to_string()],
        )
        .unwrap();

        filter.add_tablet(tablet(1, "commerce", "-80"));
        filter.add_tablet(tablet(2, "commerce", "0"));
        filter.add_tablet(tablet(3, "customer", "-80"));

        assert_matches!(recording.take().as_slice(), [Observation::Add(rec)] => {
            assert_eq!(rec.alias.uid, 1);
        });
    }

    #[test]
    fn test_invalid_shard_filter() {
        let recording = Arc::new(RecordingRecorder::default());

        assert_matches!(
            FilterByShard::new(Arc::clone(&recording) as _, &["commerce".to_string()]),
            Err(ConfigError::InvalidTabletFilter(f)) => {
                assert_eq!(f, "commerce");
            }
        );
    }
}
