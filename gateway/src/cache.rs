//! The healthy-tablet index.
//!
//! Derived entirely from health-check events, the cache maps each
//! `(keyspace, shard, role)` target to the tablets currently fit to serve
//! it. Lookup is the hot path of every query: a single reader-writer lock
//! protects the index, readers snapshot-copy the bucket so they can shuffle
//! without holding the lock, and a watch-channel generation counter lets
//! `wait_for_all_serving` park until the index changes.

use std::time::Duration;

use hashbrown::HashMap;
use observability_deps::tracing::debug;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::healthcheck::HealthEvent;
use crate::types::{TabletAlias, TabletRecord, TabletRole, Target};

/// One healthy tablet as stored in (and returned from) the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletStats {
    /// The topology record of the tablet.
    pub record: TabletRecord,
    /// The target the tablet declared over its health stream.
    pub target: Target,
    /// The lag reported with the tablet's most recent health sample.
    pub replication_lag: Duration,
}

impl TabletStats {
    /// The tablet identity.
    pub fn alias(&self) -> &TabletAlias {
        &self.record.alias
    }
}

/// The healthy-tablet index.
#[derive(Debug)]
pub struct TabletStatsCache {
    lag_threshold: Duration,
    inner: RwLock<CacheInner>,
    /// Bumped on every index mutation; `wait_for_all_serving` parks on it.
    generation: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct CacheInner {
    buckets: HashMap<Target, Vec<TabletStats>>,
    /// The bucket each alias currently occupies. Guarantees an alias is in
    /// at most one bucket and makes cross-bucket moves a single critical
    /// section.
    by_alias: HashMap<TabletAlias, Target>,
}

impl TabletStatsCache {
    /// Initialise an empty cache.
    ///
    /// Replicas lagging more than `lag_threshold` are excluded from the
    /// index; primaries are never lag-filtered.
    pub fn new(lag_threshold: Duration) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            lag_threshold,
            inner: Default::default(),
            generation,
        }
    }

    /// Whether the event's health sample qualifies the tablet for the index.
    fn is_healthy(&self, event: &HealthEvent) -> bool {
        let health = &event.new;
        health.serving
            && health.up
            && health.last_error.is_none()
            && (health.target.tablet_type == TabletRole::Primary
                || health.replication_lag <= self.lag_threshold)
    }

    /// Apply one health-check event to the index.
    ///
    /// Insert, update or remove the tablet in its target bucket; a role (or
    /// keyspace/shard) change moves the entry between buckets atomically
    /// from the reader's perspective.
    pub fn on_event(&self, event: &HealthEvent) {
        let alias = event.record.alias.clone();
        let target = event.new.target.clone();
        let healthy = self.is_healthy(event);

        {
            let mut inner = self.inner.write();

            if let Some(old_target) = inner.by_alias.get(&alias).cloned() {
                if old_target == target && healthy {
                    // Same bucket: update the stored stats in place.
                    if let Some(bucket) = inner.buckets.get_mut(&old_target) {
                        if let Some(entry) = bucket.iter_mut().find(|t| *t.alias() == alias) {
                            entry.record = event.record.clone();
                            entry.replication_lag = event.new.replication_lag;
                        }
                    }
                    drop(inner);
                    self.generation.send_modify(|g| *g += 1);
                    return;
                }

                // Leaving the old bucket, either for another one or for
                // none at all.
                let now_empty = match inner.buckets.get_mut(&old_target) {
                    Some(bucket) => {
                        bucket.retain(|t| *t.alias() != alias);
                        bucket.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    inner.buckets.remove(&old_target);
                }
                inner.by_alias.remove(&alias);
            }

            if healthy {
                debug!(tablet = %alias, target = %target, "tablet serving for target");
                inner.buckets.entry(target.clone()).or_default().push(TabletStats {
                    record: event.record.clone(),
                    target: target.clone(),
                    replication_lag: event.new.replication_lag,
                });
                inner.by_alias.insert(alias, target);
            }
        }

        self.generation.send_modify(|g| *g += 1);
    }

    /// A snapshot copy of the tablets currently healthy for `target`.
    ///
    /// The order is unspecified; callers shuffle. The returned vector is
    /// owned, so callers never mutate shared state.
    pub fn get_healthy(&self, target: &Target) -> Vec<TabletStats> {
        self.inner
            .read()
            .buckets
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// Block until every target in `targets` has at least one healthy
    /// tablet.
    ///
    /// Callers bound the wait by wrapping the future in a timeout (or
    /// dropping it).
    pub async fn wait_for_all_serving(&self, targets: &[Target]) {
        let mut generation = self.generation.subscribe();
        loop {
            {
                let inner = self.inner.read();
                if targets
                    .iter()
                    .all(|t| inner.buckets.get(t).is_some_and(|b| !b.is_empty()))
                {
                    return;
                }
            }
            // The sender lives inside `self`, so `changed` only fails while
            // the cache is being torn down, at which point waiting is moot.
            if generation.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use assert_matches::assert_matches;

    use super::*;
    use crate::types::TabletHealth;

    fn tablet(cell: &str, uid: u32, role: TabletRole) -> TabletRecord {
        TabletRecord {
            alias: TabletAlias::new(cell, uid),
            hostname: format!("db-{uid}.{cell}"),
            port: 15991,
            keyspace: "commerce".to_string(),
            shard: "0".to_string(),
            tablet_type: role,
            key_range: None,
        }
    }

    fn event(rec: &TabletRecord, role: TabletRole, serving: bool, lag: Duration) -> HealthEvent {
        HealthEvent {
            record: rec.clone(),
            old: None,
            new: TabletHealth {
                target: Target::new(&*rec.keyspace, &*rec.shard, role),
                serving,
                up: true,
                replication_lag: lag,
                last_error: None,
                last_update: Instant::now(),
            },
        }
    }

    #[test]
    fn test_insert_update_remove() {
        let cache = TabletStatsCache::new(Duration::from_secs(30));
        let rec = tablet("zone1", 1, TabletRole::Replica);
        let target = rec.target();

        cache.on_event(&event(&rec, TabletRole::Replica, true, Duration::from_secs(1)));
        assert_matches!(cache.get_healthy(&target).as_slice(), [stats] => {
            assert_eq!(*stats.alias(), rec.alias);
            assert_eq!(stats.replication_lag, Duration::from_secs(1));
        });

        // Update in place.
        cache.on_event(&event(&rec, TabletRole::Replica, true, Duration::from_secs(3)));
        assert_matches!(cache.get_healthy(&target).as_slice(), [stats] => {
            assert_eq!(stats.replication_lag, Duration::from_secs(3));
        });

        // Not serving: removed.
        cache.on_event(&event(&rec, TabletRole::Replica, false, Duration::ZERO));
        assert!(cache.get_healthy(&target).is_empty());
    }

    #[test]
    fn test_role_change_moves_bucket_atomically() {
        let cache = TabletStatsCache::new(Duration::from_secs(30));
        let rec = tablet("zone1", 1, TabletRole::Replica);
        let replica = Target::new("commerce", "0", TabletRole::Replica);
        let primary = Target::new("commerce", "0", TabletRole::Primary);

        cache.on_event(&event(&rec, TabletRole::Replica, true, Duration::ZERO));
        assert_eq!(cache.get_healthy(&replica).len(), 1);
        assert_eq!(cache.get_healthy(&primary).len(), 0);

        // Promotion: the declared role moves the tablet between buckets; at
        // no point is it in both.
        cache.on_event(&event(&rec, TabletRole::Primary, true, Duration::ZERO));
        assert_eq!(cache.get_healthy(&replica).len(), 0);
        assert_eq!(cache.get_healthy(&primary).len(), 1);
    }

    #[test]
    fn test_lag_threshold_excludes_replicas_not_primaries() {
        let cache = TabletStatsCache::new(Duration::from_secs(30));
        let replica = tablet("zone1", 1, TabletRole::Replica);
        let primary = tablet("zone1", 2, TabletRole::Primary);

        cache.on_event(&event(&replica, TabletRole::Replica, true, Duration::from_secs(999)));
        assert!(cache
            .get_healthy(&Target::new("commerce", "0", TabletRole::Replica))
            .is_empty());

        // A primary is never lag-filtered.
        cache.on_event(&event(&primary, TabletRole::Primary, true, Duration::from_secs(999)));
        assert_eq!(
            cache
                .get_healthy(&Target::new("commerce", "0", TabletRole::Primary))
                .len(),
            1
        );
    }

    #[test]
    fn test_unhealthy_error_excluded() {
        let cache = TabletStatsCache::new(Duration::from_secs(30));
        let rec = tablet("zone1", 1, TabletRole::Replica);

        let mut ev = event(&rec, TabletRole::Replica, true, Duration::ZERO);
        ev.new.last_error = Some("disk full".to_string());
        cache.on_event(&ev);

        assert!(cache.get_healthy(&rec.target()).is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_all_serving() {
        let cache = std::sync::Arc::new(TabletStatsCache::new(Duration::from_secs(30)));
        let targets = vec![
            Target::new("commerce", "0", TabletRole::Primary),
            Target::new("commerce", "0", TabletRole::Replica),
        ];

        let waiter = {
            let cache = std::sync::Arc::clone(&cache);
            let targets = targets.clone();
            tokio::spawn(async move { cache.wait_for_all_serving(&targets).await })
        };

        // One of two targets: still waiting.
        cache.on_event(&event(
            &tablet("zone1", 1, TabletRole::Primary),
            TabletRole::Primary,
            true,
            Duration::ZERO,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        cache.on_event(&event(
            &tablet("zone1", 2, TabletRole::Replica),
            TabletRole::Replica,
            true,
            Duration::ZERO,
        ));

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should complete")
            .expect("waiter should not panic");
    }
}
