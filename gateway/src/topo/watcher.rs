//! The per-cell topology watcher.
//!
//! One watcher periodically lists the tablets of a single cell, diffs the
//! result against its previous snapshot and emits add/replace/remove events
//! to a [`TabletRecorder`]. Watchers share nothing; the gateway runs one per
//! configured cell.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use hashbrown::{HashMap, HashSet};
use metric::U64Gauge;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{TabletRecorder, TopoServer};
use crate::types::{TabletAlias, TabletRecord};

/// Watches the tablets of one cell and feeds the deltas to a
/// [`TabletRecorder`].
#[derive(Debug)]
pub struct CellTabletsWatcher {
    inner: Arc<WatcherInner>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct WatcherInner {
    topo: Arc<dyn TopoServer>,
    recorder: Arc<dyn TabletRecorder>,
    cell: String,

    refresh_interval: Duration,
    refresh_known_tablets: bool,
    concurrency: usize,

    started_at: Instant,
    state: Mutex<WatcherState>,

    lag_gauge: U64Gauge,
    checksum_gauge: U64Gauge,
}

#[derive(Debug, Default)]
struct WatcherState {
    known: HashMap<TabletAlias, TabletRecord>,
    last_refresh: Option<Instant>,
    checksum: u32,
}

impl CellTabletsWatcher {
    /// Initialise a watcher for `cell`, reporting observations to `recorder`.
    ///
    /// No background work happens until [`CellTabletsWatcher::start`] is
    /// called.
    pub fn new(
        topo: Arc<dyn TopoServer>,
        recorder: Arc<dyn TabletRecorder>,
        cell: impl Into<String>,
        refresh_interval: Duration,
        refresh_known_tablets: bool,
        concurrency: usize,
        metrics: &metric::Registry,
    ) -> Self {
        let cell = cell.into();

        let lag_gauge = metrics
            .register_metric::<U64Gauge>(
                "topology_watcher_refresh_lag_seconds",
                "time since the last successful topology refresh of a cell",
            )
            .recorder([("cell", Cow::from(cell.clone()))]);
        let checksum_gauge = metrics
            .register_metric::<U64Gauge>(
                "topology_watcher_checksum",
                "crc32 checksum of the topology watcher tablet set",
            )
            .recorder([("cell", Cow::from(cell.clone()))]);

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(WatcherInner {
                topo,
                recorder,
                cell,
                refresh_interval,
                refresh_known_tablets,
                concurrency: concurrency.max(1),
                started_at: Instant::now(),
                state: Default::default(),
                lag_gauge,
                checksum_gauge,
            }),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawn the periodic refresh loop. Idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            info!(cell = %inner.cell, "topology watcher started");

            let mut ticker = tokio::time::interval(inner.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    // The first tick completes immediately, so the initial
                    // tablet load happens at startup rather than one interval
                    // later.
                    _ = ticker.tick() => inner.refresh().await,
                }
            }

            info!(cell = %inner.cell, "topology watcher stopped");
        }));
    }

    /// Run one refresh immediately, outside the periodic schedule.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Cancel the background refresh loop and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            self.shutdown_tx.send(true).ok();
            task.await.ok();
        }
    }

    /// The duration since the last successful refresh completed (or since
    /// construction if none succeeded yet). Monotonically grows while the
    /// topology server is unreachable.
    pub fn refresh_lag(&self) -> Duration {
        self.inner.refresh_lag()
    }

    /// A crc32 checksum over the sorted canonical encoding of the current
    /// tablet set. Operators compare this across gateway instances to spot
    /// divergence.
    pub fn topo_checksum(&self) -> u32 {
        self.inner.state.lock().checksum
    }

    /// The cell this watcher observes.
    pub fn cell(&self) -> &str {
        &self.inner.cell
    }
}

impl WatcherInner {
    fn refresh_lag(&self) -> Duration {
        self.state
            .lock()
            .last_refresh
            .map(|at| at.elapsed())
            .unwrap_or_else(|| self.started_at.elapsed())
    }

    async fn refresh(&self) {
        self.lag_gauge.set(self.refresh_lag().as_secs());

        let aliases = match self.topo.list_tablets(&self.cell).await {
            Ok(aliases) => aliases,
            Err(error) => {
                // The snapshot stays untouched; refresh_lag keeps growing
                // until a listing succeeds.
                warn!(cell = %self.cell, %error, "failed to list tablets in cell");
                return;
            }
        };
        let current: HashSet<TabletAlias> = aliases.into_iter().collect();

        let known = self.state.lock().known.clone();

        // Read the records of new tablets (and, if configured, re-read every
        // known one) with bounded parallelism.
        let to_read: Vec<TabletAlias> = current
            .iter()
            .filter(|alias| self.refresh_known_tablets || !known.contains_key(*alias))
            .cloned()
            .collect();

        let reads: Vec<(TabletAlias, Result<TabletRecord, super::TopoError>)> =
            stream::iter(to_read)
                .map(|alias| {
                    let topo = Arc::clone(&self.topo);
                    async move {
                        let result = topo.get_tablet(&alias).await;
                        (alias, result)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut next: HashMap<TabletAlias, TabletRecord> = HashMap::with_capacity(current.len());
        for (alias, result) in reads {
            match result {
                Ok(rec) => {
                    next.insert(alias, rec);
                }
                Err(error) => {
                    warn!(cell = %self.cell, tablet = %alias, %error, "failed to read tablet record");
                    // A known tablet keeps its previous record; an unknown
                    // one is picked up on the next refresh.
                    if let Some(old) = known.get(&alias) {
                        next.insert(alias, old.clone());
                    }
                }
            }
        }
        // Known tablets that were not re-read carry their record forward.
        for alias in &current {
            if !next.contains_key(alias) {
                if let Some(old) = known.get(alias) {
                    next.insert(alias.clone(), old.clone());
                }
            }
        }

        for (alias, rec) in &next {
            match known.get(alias) {
                None => {
                    debug!(cell = %self.cell, tablet = %alias, "tablet added");
                    self.recorder.add_tablet(rec.clone());
                }
                Some(old) if old != rec => {
                    debug!(cell = %self.cell, tablet = %alias, "tablet record changed");
                    self.recorder.replace_tablet(alias, rec.clone());
                }
                Some(_) => {}
            }
        }
        for alias in known.keys() {
            if !current.contains(alias) {
                debug!(cell = %self.cell, tablet = %alias, "tablet removed");
                self.recorder.remove_tablet(alias);
            }
        }

        let checksum = checksum(&next);
        {
            let mut state = self.state.lock();
            state.known = next;
            state.last_refresh = Some(Instant::now());
            state.checksum = checksum;
        }
        self.lag_gauge.set(0);
        self.checksum_gauge.set(checksum as u64);
    }
}

/// crc32 over the sorted canonical encoding of `records`.
fn checksum(records: &HashMap<TabletAlias, TabletRecord>) -> u32 {
    let mut lines: Vec<String> = records
        .values()
        .map(|rec| {
            format!(
                "{}|{}|{}|{}|{}",
                rec.alias,
                rec.addr(),
                rec.keyspace,
                rec.shard,
                rec.tablet_type
            )
        })
        .collect();
    lines.sort_unstable();

    let mut hasher = crc32fast::Hasher::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::super::filter::mock::{Observation, RecordingRecorder};
    use super::super::memory::MemoryTopoServer;
    use super::super::{ShardRecord, TopoError};
    use super::*;
    use crate::types::TabletRole;

    /// Delegates to a [`MemoryTopoServer`], optionally failing list calls.
    #[derive(Debug, Default)]
    struct FlakyTopo {
        inner: MemoryTopoServer,
        fail_lists: AtomicBool,
    }

    #[async_trait]
    impl TopoServer for FlakyTopo {
        async fn list_tablets(&self, cell: &str) -> Result<Vec<TabletAlias>, TopoError> {
            if self.fail_lists.load(Ordering::SeqCst) {
                return Err(TopoError::Unavailable("injected".to_string()));
            }
            self.inner.list_tablets(cell).await
        }

        async fn get_tablet(&self, alias: &TabletAlias) -> Result<TabletRecord, TopoError> {
            self.inner.get_tablet(alias).await
        }

        async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardRecord, TopoError> {
            self.inner.get_shard(keyspace, shard).await
        }

        async fn list_keyspaces(&self) -> Result<Vec<String>, TopoError> {
            self.inner.list_keyspaces().await
        }

        async fn list_shards(&self, keyspace: &str) -> Result<Vec<String>, TopoError> {
            self.inner.list_shards(keyspace).await
        }
    }

    fn tablet(uid: u32) -> TabletRecord {
        TabletRecord {
            alias: TabletAlias::new("zone1", uid),
            hostname: format!("db-{uid}.zone1"),
            port: 15991,
            keyspace: "commerce".to_string(),
            shard: "0".to_string(),
            tablet_type: TabletRole::Replica,
            key_range: None,
        }
    }

    fn watcher(
        topo: Arc<dyn TopoServer>,
        recorder: Arc<dyn TabletRecorder>,
        refresh_known_tablets: bool,
    ) -> CellTabletsWatcher {
        CellTabletsWatcher::new(
            topo,
            recorder,
            "zone1",
            Duration::from_secs(60),
            refresh_known_tablets,
            32,
            &metric::Registry::new(),
        )
    }

    #[tokio::test]
    async fn test_add_replace_remove() {
        let topo = Arc::new(MemoryTopoServer::default());
        let recording = Arc::new(RecordingRecorder::default());
        let w = watcher(Arc::clone(&topo) as _, Arc::clone(&recording) as _, true);

        let rec = tablet(1);
        topo.upsert_tablet(rec.clone());
        w.refresh().await;
        assert_eq!(recording.take(), vec![Observation::Add(rec.clone())]);

        // No change: no events.
        w.refresh().await;
        assert!(recording.take().is_empty());

        // Port change: replace.
        let mut changed = rec.clone();
        changed.port = 16991;
        topo.upsert_tablet(changed.clone());
        w.refresh().await;
        assert_eq!(
            recording.take(),
            vec![Observation::Replace(rec.alias.clone(), changed)]
        );

        // Disappearance: remove.
        topo.delete_tablet(&rec.alias);
        w.refresh().await;
        assert_eq!(recording.take(), vec![Observation::Remove(rec.alias)]);
    }

    #[tokio::test]
    async fn test_list_failure_leaves_snapshot_untouched() {
        let topo = Arc::new(FlakyTopo::default());
        let recording = Arc::new(RecordingRecorder::default());
        let w = watcher(Arc::clone(&topo) as _, Arc::clone(&recording) as _, true);

        topo.inner.upsert_tablet(tablet(1));
        w.refresh().await;
        assert_matches!(recording.take().as_slice(), [Observation::Add(_)]);
        let checksum = w.topo_checksum();

        topo.fail_lists.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.refresh().await;

        // No events, same checksum, growing lag.
        assert!(recording.take().is_empty());
        assert_eq!(w.topo_checksum(), checksum);
        assert!(w.refresh_lag() >= Duration::from_millis(20));

        // Recovery resets the lag.
        topo.fail_lists.store(false, Ordering::SeqCst);
        w.refresh().await;
        assert!(w.refresh_lag() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_checksum_tracks_tablet_set() {
        let topo = Arc::new(MemoryTopoServer::default());
        let recording = Arc::new(RecordingRecorder::default());
        let w = watcher(Arc::clone(&topo) as _, Arc::clone(&recording) as _, true);

        w.refresh().await;
        let empty = w.topo_checksum();

        topo.upsert_tablet(tablet(1));
        w.refresh().await;
        let one = w.topo_checksum();
        assert_ne!(empty, one);

        // The same set hashes to the same value.
        w.refresh().await;
        assert_eq!(w.topo_checksum(), one);
    }

    #[tokio::test]
    async fn test_refresh_known_tablets_disabled() {
        let topo = Arc::new(MemoryTopoServer::default());
        let recording = Arc::new(RecordingRecorder::default());
        let w = watcher(Arc::clone(&topo) as _, Arc::clone(&recording) as _, false);

        let rec = tablet(1);
        topo.upsert_tablet(rec.clone());
        w.refresh().await;
        assert_matches!(recording.take().as_slice(), [Observation::Add(_)]);

        // With refresh_known_tablets disabled a record change on a known
        // tablet goes unnoticed.
        let mut changed = rec.clone();
        changed.port = 16991;
        topo.upsert_tablet(changed);
        w.refresh().await;
        assert!(recording.take().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let topo = Arc::new(MemoryTopoServer::default());
        let recording = Arc::new(RecordingRecorder::default());
        topo.upsert_tablet(tablet(1));

        let w = CellTabletsWatcher::new(
            Arc::clone(&topo) as _,
            Arc::clone(&recording) as _,
            "zone1",
            Duration::from_millis(10),
            true,
            32,
            &metric::Registry::new(),
        );

        w.start();
        // Second start is a no-op.
        w.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !recording.observations().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watcher should observe the tablet");

        w.stop().await;
    }
}
