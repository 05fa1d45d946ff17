use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    HistogramObservation, MakeMetricObserver, MetricKind, MetricObserver, Observation,
    ObservationBucket,
};

/// A monotonic counter of `u64` values.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MakeMetricObserver for U64Counter {
    type Options = ();

    fn create(_options: &()) -> Self {
        Self::default()
    }
}

impl MetricObserver for U64Counter {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Counter
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Counter(self.fetch())
    }
}

/// An instantaneous `u64` value.
///
/// If the same attribute set is recorded to from multiple locations the
/// reported value oscillates between them.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the value of the gauge.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Increase the gauge by `delta`, wrapping on overflow.
    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrease the gauge by `delta`, wrapping on underflow.
    pub fn dec(&self, delta: u64) {
        self.state.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MakeMetricObserver for U64Gauge {
    type Options = ();

    fn create(_options: &()) -> Self {
        Self::default()
    }
}

impl MetricObserver for U64Gauge {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Gauge
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Gauge(self.fetch())
    }
}

/// Bucket thresholds for a [`U64Histogram`].
#[derive(Debug, Clone)]
pub struct U64HistogramOptions {
    buckets: Vec<u64>,
}

impl U64HistogramOptions {
    /// Create bucket thresholds from `thresholds`, sorted ascending.
    pub fn new(thresholds: impl IntoIterator<Item = u64>) -> Self {
        let mut buckets: Vec<_> = thresholds.into_iter().collect();
        buckets.sort_unstable();
        Self { buckets }
    }
}

/// Bucketed observations of `u64` values.
///
/// A value larger than the greatest bucket threshold is silently dropped, so
/// options should always include a catch-all upper bound.
#[derive(Debug, Clone)]
pub struct U64Histogram {
    shared: Arc<Mutex<HistogramObservation<u64>>>,
}

impl U64Histogram {
    fn new(sorted_buckets: impl Iterator<Item = u64>) -> Self {
        let buckets = sorted_buckets
            .map(|le| ObservationBucket {
                le,
                count: Default::default(),
            })
            .collect();

        Self {
            shared: Arc::new(Mutex::new(HistogramObservation {
                total: Default::default(),
                buckets,
            })),
        }
    }

    /// Record a single value.
    pub fn record(&self, value: u64) {
        let mut state = self.shared.lock();
        if let Some(bucket) = state.buckets.iter_mut().find(|bucket| value <= bucket.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.total = state.total.wrapping_add(value);
        }
    }

    /// Snapshot the current distribution.
    pub fn fetch(&self) -> HistogramObservation<u64> {
        self.shared.lock().clone()
    }
}

impl MakeMetricObserver for U64Histogram {
    type Options = U64HistogramOptions;

    fn create(options: &U64HistogramOptions) -> Self {
        Self::new(options.buckets.iter().cloned())
    }
}

impl MetricObserver for U64Histogram {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Histogram
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Histogram(self.fetch())
    }
}

/// Bucket thresholds for a [`DurationHistogram`].
#[derive(Debug, Clone)]
pub struct DurationHistogramOptions {
    buckets: Vec<Duration>,
}

impl DurationHistogramOptions {
    /// Create bucket thresholds from `thresholds`, sorted ascending.
    pub fn new(thresholds: impl IntoIterator<Item = Duration>) -> Self {
        let mut buckets: Vec<_> = thresholds.into_iter().collect();
        buckets.sort_unstable();
        Self { buckets }
    }
}

impl Default for DurationHistogramOptions {
    fn default() -> Self {
        Self::new([
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_millis(10),
            Duration::from_millis(25),
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(250),
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_millis(2_500),
            Duration::from_secs(5),
            Duration::from_secs(10),
            // A catch-all bucket so no observation is ever dropped.
            Duration::from_nanos(u64::MAX),
        ])
    }
}

/// Bucketed observations of [`Duration`] values, recorded with nanosecond
/// granularity.
#[derive(Debug, Clone)]
pub struct DurationHistogram {
    inner: U64Histogram,
}

impl DurationHistogram {
    /// Record a single duration.
    pub fn record(&self, value: Duration) {
        // Durations exceeding u64 nanoseconds (~584 years) saturate into the
        // top bucket.
        self.inner
            .record(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Snapshot the current distribution.
    pub fn fetch(&self) -> HistogramObservation<Duration> {
        let inner = self.inner.fetch();
        HistogramObservation {
            total: Duration::from_nanos(inner.total),
            buckets: inner
                .buckets
                .into_iter()
                .map(|b| ObservationBucket {
                    le: Duration::from_nanos(b.le),
                    count: b.count,
                })
                .collect(),
        }
    }
}

impl MakeMetricObserver for DurationHistogram {
    type Options = DurationHistogramOptions;

    fn create(options: &DurationHistogramOptions) -> Self {
        Self {
            inner: U64Histogram::new(options.buckets.iter().map(|le| {
                u64::try_from(le.as_nanos()).expect("duration histogram bucket overflows u64")
            })),
        }
    }
}

impl MetricObserver for DurationHistogram {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::DurationHistogram
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::DurationHistogram(self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = U64Counter::default();
        assert_eq!(counter.observe(), Observation::U64Counter(0));

        counter.inc(2);
        counter.inc(40);
        assert_eq!(counter.fetch(), 42);
    }

    #[test]
    fn test_gauge() {
        let gauge = U64Gauge::default();

        gauge.set(345);
        assert_eq!(gauge.fetch(), 345);

        gauge.inc(5);
        gauge.dec(100);
        assert_eq!(gauge.fetch(), 250);
    }

    #[test]
    fn test_histogram_bucketing() {
        let histogram = U64Histogram::create(&U64HistogramOptions::new([20, 40, 50]));

        histogram.record(30);
        histogram.record(50);
        // Exceeds the largest bucket - dropped.
        histogram.record(51);

        let got = histogram.fetch();
        assert_eq!(got.total, 80);
        assert_eq!(got.sample_count(), 2);
        assert_eq!(got.buckets[0].count, 0);
        assert_eq!(got.buckets[1].count, 1);
        assert_eq!(got.buckets[2].count, 1);
    }

    #[test]
    fn test_duration_histogram() {
        let histogram = DurationHistogram::create(&DurationHistogramOptions::default());

        histogram.record(Duration::from_millis(2));
        histogram.record(Duration::from_secs(4));
        // Far beyond the explicit ladder - lands in the catch-all bucket.
        histogram.record(Duration::from_secs(60 * 60));

        let got = histogram.fetch();
        assert_eq!(got.sample_count(), 3);
        assert_eq!(
            got.total,
            Duration::from_millis(2) + Duration::from_secs(4) + Duration::from_secs(60 * 60)
        );
    }
}
