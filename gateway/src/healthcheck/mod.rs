//! Streaming health subscriptions, one per known tablet.
//!
//! The health check implements [`TabletRecorder`]: the topology watchers
//! feed it tablet add/replace/remove events, and it maintains one streaming
//! health RPC per tablet. Every stream message updates the tablet's health
//! entry and is published to the installed [`HealthCheckListener`] as a
//! delta. Each subscription dials its tablet once and keeps that client for
//! its whole lifetime; a dead stream is re-established over it with
//! exponential backoff until the tablet is removed.
//!
//! For a single tablet, events are delivered in stream order. Across tablets
//! no ordering is guaranteed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use hashbrown::HashMap;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod client;
pub mod grpc;
pub mod wire;

use self::client::{TabletDialer, TabletQueryService};

use crate::topo::TabletRecorder;
use crate::types::{TabletAlias, TabletHealth, TabletRecord};

/// The first retry delay after a stream terminates; doubles up to the
/// configured maximum and resets once a message is received.
const INITIAL_STREAM_BACKOFF: Duration = Duration::from_secs(1);

/// How long [`HealthCheck::close`] waits for subscription tasks to exit.
const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

/// A health state change of one tablet: the previous entry (if any) and the
/// entry replacing it.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    /// The topology record of the tablet.
    pub record: TabletRecord,
    /// The health entry before this event.
    pub old: Option<TabletHealth>,
    /// The health entry after this event.
    pub new: TabletHealth,
}

impl HealthEvent {
    /// `true` when this event took the tablet out of service (serving+up to
    /// anything less).
    pub fn is_down(&self) -> bool {
        self.old.as_ref().is_some_and(|old| old.serving && old.up)
            && !(self.new.serving && self.new.up)
    }
}

/// The sole consumer of health events, installed via
/// [`HealthCheck::set_listener`] before any tablet is added.
pub trait HealthCheckListener: Send + Sync + std::fmt::Debug {
    /// Observe one health state change. Called from subscription tasks;
    /// implementations must not block.
    fn stats_update(&self, event: &HealthEvent);
}

/// Maintains one streaming health subscription per known tablet and a cached
/// RPC client for each.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    inner: Arc<HcInner>,
}

#[derive(Debug)]
struct HcInner {
    dialer: Arc<dyn TabletDialer>,
    backoff_max: Duration,
    table: RwLock<HashMap<TabletAlias, TableEntry>>,
    listener: RwLock<Option<ListenerEntry>>,
}

#[derive(Debug)]
struct ListenerEntry {
    listener: Arc<dyn HealthCheckListener>,
    send_down_events: bool,
}

#[derive(Debug)]
struct TableEntry {
    record: TabletRecord,
    health: TabletHealth,
    conn: Option<Arc<dyn TabletQueryService>>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl HealthCheck {
    /// Initialise a health check dialling tablets through `dialer`.
    pub fn new(dialer: Arc<dyn TabletDialer>, backoff_max: Duration) -> Self {
        Self {
            inner: Arc::new(HcInner {
                dialer,
                backoff_max,
                table: Default::default(),
                listener: Default::default(),
            }),
        }
    }

    /// Install the sole event listener.
    ///
    /// If `send_down_events` is false, events that take a tablet out of
    /// service are suppressed. The healthy-tablet cache requires them, so the
    /// gateway always installs its listener with `send_down_events = true`.
    ///
    /// # Panics
    ///
    /// Panics if any tablet was already added: events would have been lost.
    pub fn set_listener(&self, listener: Arc<dyn HealthCheckListener>, send_down_events: bool) {
        assert!(
            self.inner.table.read().is_empty(),
            "health check listener must be installed before tablets are added"
        );
        *self.inner.listener.write() = Some(ListenerEntry {
            listener,
            send_down_events,
        });
    }

    /// The cached RPC client of `alias`, if a live subscription holds one.
    pub fn get_connection(&self, alias: &TabletAlias) -> Option<Arc<dyn TabletQueryService>> {
        self.inner
            .table
            .read()
            .get(alias)
            .and_then(|entry| entry.conn.clone())
    }

    /// Snapshot the health entry of every watched tablet.
    pub fn healths(&self) -> Vec<(TabletRecord, TabletHealth)> {
        self.inner
            .table
            .read()
            .values()
            .map(|entry| (entry.record.clone(), entry.health.clone()))
            .collect()
    }

    /// Cancel every subscription concurrently and wait (with a bounded
    /// deadline) for the tasks to exit. Afterwards `get_connection` returns
    /// `None` for every alias.
    pub async fn close(&self) {
        let entries: Vec<TableEntry> = {
            let mut table = self.inner.table.write();
            table.drain().map(|(_, entry)| entry).collect()
        };

        let mut tasks = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.cancel.send(true).ok();
            if let Some(task) = entry.task.take() {
                tasks.push(task);
            }
        }

        if tokio::time::timeout(CLOSE_DEADLINE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("timed out waiting for health subscriptions to exit");
        }
    }
}

impl TabletRecorder for HealthCheck {
    fn add_tablet(&self, rec: TabletRecord) {
        add(&self.inner, rec);
    }

    fn remove_tablet(&self, alias: &TabletAlias) {
        remove(&self.inner, alias);
    }

    fn replace_tablet(&self, old: &TabletAlias, rec: TabletRecord) {
        // The subscription is reused when the endpoint (and identity) is
        // unchanged: only the record is swapped.
        let reused = {
            let mut table = self.inner.table.write();
            match table.get_mut(old) {
                Some(entry)
                    if *old == rec.alias
                        && entry.record.hostname == rec.hostname
                        && entry.record.port == rec.port =>
                {
                    debug!(tablet = %rec.alias, "tablet record updated in place");
                    entry.record = rec.clone();
                    true
                }
                Some(_) => false,
                // Replace of an unknown tablet degenerates to an add.
                None => false,
            }
        };

        if !reused {
            remove(&self.inner, old);
            add(&self.inner, rec);
        }
    }
}

/// Start watching a tablet. Idempotent on alias.
fn add(inner: &Arc<HcInner>, rec: TabletRecord) {
    let mut table = inner.table.write();
    if table.contains_key(&rec.alias) {
        debug!(tablet = %rec.alias, "tablet already watched");
        return;
    }

    info!(tablet = %rec.alias, addr = %rec.addr(), "adding tablet to health check");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let health = TabletHealth {
        target: rec.target(),
        serving: false,
        up: true,
        replication_lag: Duration::ZERO,
        last_error: None,
        last_update: Instant::now(),
    };
    // The task's first table read blocks on the write guard held here, so it
    // cannot observe the map before the entry below is inserted.
    let task = tokio::spawn(subscription_task(
        Arc::clone(inner),
        rec.alias.clone(),
        cancel_rx,
    ));
    table.insert(
        rec.alias.clone(),
        TableEntry {
            record: rec,
            health,
            conn: None,
            cancel: cancel_tx,
            task: Some(task),
        },
    );
}

/// Stop watching a tablet and emit its final down event.
fn remove(inner: &Arc<HcInner>, alias: &TabletAlias) {
    let entry = inner.table.write().remove(alias);
    let Some(entry) = entry else { return };

    info!(tablet = %alias, "removing tablet from health check");
    entry.cancel.send(true).ok();

    let old = entry.health.clone();
    let mut new = old.clone();
    new.serving = false;
    new.up = false;
    new.last_update = Instant::now();
    emit(inner, &entry.record, Some(old), new);
}

/// Publish a health delta to the listener, honouring down-event
/// suppression.
fn emit(inner: &HcInner, record: &TabletRecord, old: Option<TabletHealth>, new: TabletHealth) {
    let guard = inner.listener.read();
    let Some(entry) = guard.as_ref() else { return };

    let event = HealthEvent {
        record: record.clone(),
        old,
        new,
    };
    if event.is_down() && !entry.send_down_events {
        return;
    }
    entry.listener.stats_update(&event);
}

/// Store (or clear) the cached connection of `alias`. Returns `false` if
/// the tablet is no longer watched.
fn set_connection(
    inner: &HcInner,
    alias: &TabletAlias,
    conn: Option<Arc<dyn TabletQueryService>>,
) -> bool {
    match inner.table.write().get_mut(alias) {
        Some(entry) => {
            entry.conn = conn;
            true
        }
        None => false,
    }
}

/// Note a dial error on the health entry without changing serving state.
fn record_dial_error(inner: &HcInner, alias: &TabletAlias, status: &tonic::Status) {
    if let Some(entry) = inner.table.write().get_mut(alias) {
        entry.health.last_error = Some(status.to_string());
        entry.health.last_update = Instant::now();
    }
}

/// Transition a tablet to not-serving/not-up after its stream terminated,
/// emitting the down event.
fn mark_down(inner: &HcInner, alias: &TabletAlias, error: Option<String>) {
    let update = {
        let mut table = inner.table.write();
        let Some(entry) = table.get_mut(alias) else {
            return;
        };
        let old = entry.health.clone();
        let mut new = old.clone();
        new.serving = false;
        new.up = false;
        new.last_error = error.or_else(|| old.last_error.clone());
        new.last_update = Instant::now();
        entry.health = new.clone();
        entry.conn = None;
        (entry.record.clone(), old, new)
    };
    let (record, old, new) = update;
    emit(inner, &record, Some(old), new);
}

/// Apply one stream message to the tablet's health entry and publish the
/// delta. Returns `false` if the tablet is no longer watched.
fn apply_update(inner: &HcInner, alias: &TabletAlias, resp: wire::StreamHealthResponse) -> bool {
    let stats = resp.realtime_stats.clone().unwrap_or_default();

    let update = {
        let mut table = inner.table.write();
        let Some(entry) = table.get_mut(alias) else {
            return false;
        };

        // The target the tablet itself declares wins over the topology
        // record: a reparent is visible here first.
        let target = resp
            .target
            .as_ref()
            .and_then(wire::Target::to_target)
            .unwrap_or_else(|| entry.record.target());

        let new = TabletHealth {
            target,
            serving: resp.serving,
            up: true,
            replication_lag: Duration::from_secs(u64::from(stats.replication_lag_seconds)),
            last_error: (!stats.health_error.is_empty()).then(|| stats.health_error.clone()),
            last_update: Instant::now(),
        };
        let old = std::mem::replace(&mut entry.health, new.clone());
        (entry.record.clone(), old, new)
    };

    let (record, old, new) = update;
    emit(inner, &record, Some(old), new);
    true
}

/// Sleep for the current backoff (doubling it, capped), unless cancelled.
/// Returns `false` when cancelled.
async fn sleep_backoff(
    backoff: &mut Duration,
    max: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    let delay = *backoff;
    *backoff = (*backoff * 2).min(max);
    tokio::select! {
        _ = cancel.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// The per-tablet subscription loop.
///
/// Dials the tablet once (the connector maintains the underlying channel for
/// the lifetime of the subscription), then repeatedly opens the health
/// stream and publishes its messages, backing off between stream attempts.
/// Exits when cancelled or when the tablet leaves the table.
async fn subscription_task(
    inner: Arc<HcInner>,
    alias: TabletAlias,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_STREAM_BACKOFF;

    let conn = loop {
        if *cancel.borrow() {
            return;
        }
        let record = match inner.table.read().get(&alias) {
            Some(entry) => entry.record.clone(),
            None => return,
        };

        let result = tokio::select! {
            _ = cancel.changed() => return,
            result = inner.dialer.dial(&record) => result,
        };
        match result {
            Ok(conn) => break conn,
            Err(status) => {
                debug!(tablet = %alias, error = %status, "failed to dial tablet");
                record_dial_error(&inner, &alias, &status);
                if !sleep_backoff(&mut backoff, inner.backoff_max, &mut cancel).await {
                    return;
                }
            }
        }
    };

    'outer: loop {
        if *cancel.borrow() {
            break;
        }

        let mut stream = tokio::select! {
            _ = cancel.changed() => break,
            result = conn.stream_health() => match result {
                Ok(stream) => stream,
                Err(status) => {
                    warn!(tablet = %alias, error = %status, "failed to open health stream");
                    mark_down(&inner, &alias, Some(status.to_string()));
                    if !sleep_backoff(&mut backoff, inner.backoff_max, &mut cancel).await {
                        break;
                    }
                    continue;
                }
            },
        };

        if !set_connection(&inner, &alias, Some(Arc::clone(&conn))) {
            break;
        }

        debug!(tablet = %alias, "health stream established");

        loop {
            let message = tokio::select! {
                _ = cancel.changed() => break 'outer,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(resp)) => {
                    backoff = INITIAL_STREAM_BACKOFF;
                    if !apply_update(&inner, &alias, resp) {
                        break 'outer;
                    }
                }
                Some(Err(status)) => {
                    warn!(tablet = %alias, error = %status, "tablet health stream failed");
                    mark_down(&inner, &alias, Some(status.to_string()));
                    break;
                }
                None => {
                    debug!(tablet = %alias, "tablet health stream closed");
                    mark_down(&inner, &alias, None);
                    break;
                }
            }
        }

        if !sleep_backoff(&mut backoff, inner.backoff_max, &mut cancel).await {
            break;
        }
    }

    debug!(tablet = %alias, "health subscription exited");
}
