//! Per-shard failover buffering state.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metric::{U64Counter, U64Gauge};
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{BufferConfig, BufferError};
use crate::healthcheck::HealthEvent;
use crate::types::TabletAlias;

/// Why a shard's buffered requests were released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// A serving primary under a new alias became visible.
    NewPrimary,
    /// The per-failover window elapsed without a new primary.
    WindowExpired,
    /// The buffer was shut down.
    Shutdown,
}

impl ReleaseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NewPrimary => "new_primary",
            Self::WindowExpired => "window_expired",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Release {
    reason: ReleaseReason,
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort()
    }
}

#[derive(Debug)]
enum Mode {
    /// No failover in progress.
    Idle,
    /// A failover is in progress; new primary requests park here.
    ///
    /// Dropping this mode (on any transition) aborts the window timer.
    Buffering {
        since: Instant,
        _window_timer: AbortOnDrop,
    },
    /// Released, but drained requests have not all completed their retry
    /// yet. No new entries are admitted.
    Draining,
}

#[derive(Debug)]
struct State {
    mode: Mode,
    /// Parked or draining entries currently alive.
    entries: usize,
    /// The alias last observed serving as primary for this shard.
    current_primary: Option<TabletAlias>,
    /// A serving primary has been seen since the last buffering episode
    /// ended. Gates implicitly-triggered episodes so a drained or expired
    /// window is not immediately re-entered on stale errors.
    primary_seen_since_end: bool,
}

/// The buffering state of one `(keyspace, shard)`.
#[derive(Debug)]
pub(super) struct ShardBuffer {
    keyspace: String,
    shard: String,
    config: BufferConfig,
    global_count: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    state: Mutex<State>,
    release_tx: watch::Sender<Option<Release>>,

    buffered_gauge: U64Gauge,
    buffered_total: U64Counter,
    evicted_total: U64Counter,
    releases: metric::Metric<U64Counter>,
}

/// Handed to a released request; dropping it tells the buffer the retry
/// completed, allowing the shard to finish draining.
#[derive(Debug)]
pub struct RetryDone {
    _entry: BufferedEntry,
}

impl RetryDone {
    /// Explicitly signal retry completion (equivalent to dropping).
    pub fn done(self) {}
}

/// A live buffered entry; its existence accounts for per-shard and global
/// capacity.
#[derive(Debug)]
struct BufferedEntry {
    shard: Arc<ShardBuffer>,
}

impl Drop for BufferedEntry {
    fn drop(&mut self) {
        self.shard.entry_done();
    }
}

impl ShardBuffer {
    pub(super) fn new(
        keyspace: String,
        shard: String,
        config: BufferConfig,
        global_count: Arc<AtomicUsize>,
        shutdown: Arc<AtomicBool>,
        metrics: &super::BufferMetrics,
    ) -> Self {
        let attributes = [
            ("keyspace", Cow::from(keyspace.clone())),
            ("shard", Cow::from(shard.clone())),
        ];
        let (release_tx, _) = watch::channel(None);
        Self {
            keyspace,
            shard,
            config,
            global_count,
            shutdown,
            state: Mutex::new(State {
                mode: Mode::Idle,
                entries: 0,
                current_primary: None,
                primary_seen_since_end: true,
            }),
            release_tx,
            buffered_gauge: metrics.buffered.recorder(attributes.clone()),
            buffered_total: metrics.buffered_total.recorder(attributes.clone()),
            evicted_total: metrics.evicted_total.recorder(attributes),
            releases: metrics.releases.clone(),
        }
    }

    /// Park the calling request if this shard is failing over.
    ///
    /// See [`Buffer::wait_for_failover_end`](super::Buffer::wait_for_failover_end)
    /// for the admission contract; `failover_signal` tells whether the
    /// caller's last error looked like a failover.
    pub(super) async fn wait_for_failover_end(
        self: &Arc<Self>,
        failover_signal: bool,
    ) -> Result<Option<RetryDone>, BufferError> {
        let mut release_rx;
        {
            let mut state = self.state.lock();

            match state.mode {
                Mode::Buffering { .. } => {}
                Mode::Idle => {
                    if !failover_signal
                        || !state.primary_seen_since_end
                        || self.shutdown.load(Ordering::SeqCst)
                    {
                        return Ok(None);
                    }
                    self.start_buffering(&mut state);
                }
                // A draining shard admits nothing until a fresh failover is
                // observed.
                Mode::Draining => return Ok(None),
            }

            if state.entries >= self.config.max_per_shard {
                self.evicted_total.inc(1);
                return Err(BufferError::Full {
                    keyspace: self.keyspace.clone(),
                    shard: self.shard.clone(),
                });
            }
            let admitted = self
                .global_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                    (count < self.config.max_total).then_some(count + 1)
                })
                .is_ok();
            if !admitted {
                self.evicted_total.inc(1);
                return Err(BufferError::Full {
                    keyspace: self.keyspace.clone(),
                    shard: self.shard.clone(),
                });
            }

            state.entries += 1;
            self.buffered_gauge.inc(1);
            self.buffered_total.inc(1);

            // Subscribing under the state lock guarantees this waiter sees
            // exactly the first release after its admission.
            release_rx = self.release_tx.subscribe();
        }

        debug!(
            keyspace = %self.keyspace,
            shard = %self.shard,
            "buffering primary request during failover"
        );

        let entry = BufferedEntry {
            shard: Arc::clone(self),
        };

        let reason = match release_rx.changed().await {
            Ok(()) => (*release_rx.borrow())
                .map(|release| release.reason)
                .unwrap_or(ReleaseReason::Shutdown),
            // The buffer itself was dropped.
            Err(_) => ReleaseReason::Shutdown,
        };

        match reason {
            ReleaseReason::Shutdown => {
                drop(entry);
                Err(BufferError::Shutdown)
            }
            // Window expiry also releases the waiters back to the retry
            // loop: if the shard still has no primary the retry surfaces the
            // original error.
            ReleaseReason::NewPrimary | ReleaseReason::WindowExpired => {
                Ok(Some(RetryDone { _entry: entry }))
            }
        }
    }

    /// Observe a primary-role health event for this shard.
    pub(super) fn on_primary_health(self: &Arc<Self>, event: &HealthEvent) {
        let serving = event.new.serving && event.new.up;
        let alias = event.record.alias.clone();

        let mut state = self.state.lock();
        if serving {
            state.primary_seen_since_end = true;
            let changed = state.current_primary.as_ref() != Some(&alias);
            state.current_primary = Some(alias);
            if changed && matches!(state.mode, Mode::Buffering { .. }) {
                drop(state);
                self.stop_buffering(ReleaseReason::NewPrimary);
            }
        } else if state.current_primary.as_ref() == Some(&alias)
            && matches!(state.mode, Mode::Idle)
            && state.primary_seen_since_end
            && !self.shutdown.load(Ordering::SeqCst)
        {
            // The shard's serving primary went away: a failover has begun.
            self.start_buffering(&mut state);
        }
    }

    /// Wake all waiters with [`BufferError::Shutdown`] and refuse further
    /// admission.
    pub(super) fn shutdown(&self) {
        self.stop_buffering(ReleaseReason::Shutdown);
    }

    fn start_buffering(self: &Arc<Self>, state: &mut State) {
        info!(
            keyspace = %self.keyspace,
            shard = %self.shard,
            window = ?self.config.window,
            "failover detected, buffering primary requests"
        );

        state.primary_seen_since_end = false;

        let this = Arc::clone(self);
        let window = self.config.window;
        let window_timer = AbortOnDrop(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.stop_buffering(ReleaseReason::WindowExpired);
        }));

        state.mode = Mode::Buffering {
            since: Instant::now(),
            _window_timer: window_timer,
        };
    }

    fn stop_buffering(&self, reason: ReleaseReason) {
        let mut state = self.state.lock();
        let since = match &state.mode {
            Mode::Buffering { since, .. } => *since,
            _ => return,
        };

        // Replacing the mode drops the Buffering value, aborting the window
        // timer.
        state.mode = if state.entries == 0 {
            Mode::Idle
        } else {
            Mode::Draining
        };

        info!(
            keyspace = %self.keyspace,
            shard = %self.shard,
            reason = reason.as_str(),
            waiters = state.entries,
            buffered_for = ?since.elapsed(),
            "releasing buffered requests"
        );

        self.releases
            .recorder([
                ("keyspace", Cow::from(self.keyspace.clone())),
                ("shard", Cow::from(self.shard.clone())),
                ("reason", Cow::from(reason.as_str())),
            ])
            .inc(1);

        self.release_tx.send_replace(Some(Release { reason }));
    }

    /// A buffered entry completed (its retry finished, or its caller went
    /// away).
    fn entry_done(&self) {
        let mut state = self.state.lock();
        state.entries -= 1;
        self.global_count.fetch_sub(1, Ordering::SeqCst);
        self.buffered_gauge.dec(1);

        if state.entries == 0 && matches!(state.mode, Mode::Draining) {
            debug!(keyspace = %self.keyspace, shard = %self.shard, "buffer drain complete");
            state.mode = Mode::Idle;
        }
    }
}
