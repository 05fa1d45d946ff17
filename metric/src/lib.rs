//! A small metric abstraction for this workspace.
//!
//! The design goals, in order:
//!
//! 1. Metric recording is decoupled from metric export - code that records
//!    never depends on an exporter.
//! 2. Metric names are `&'static str` so they can be grepped for in the
//!    codebase.
//! 3. Attribute manipulation is amortised: a caller obtains a recorder for a
//!    fixed attribute set once and then records through it cheaply.
//! 4. Instrumentation is directly testable: a [`RawReporter`] dumps every
//!    observation for assertions, without any export pipeline.
//!
//! A [`Registry`] holds named [`Instrument`]s. The common instrument shape is
//! [`Metric<T>`], which keeps one observer of type `T` per unique
//! [`Attributes`] set. Concrete observers ([`U64Counter`], [`U64Gauge`],
//! [`U64Histogram`], [`DurationHistogram`]) expose plain member functions for
//! recording; reporting walks the trait topology.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs
)]

use std::any::Any;
use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;

mod instruments;
mod metric;

pub use crate::instruments::*;
pub use crate::metric::*;

/// A map of metric names to [`Instrument`]s, allowing registration, lookup and
/// report generation.
#[derive(Debug, Default)]
pub struct Registry {
    /// Instruments indexed by metric name.
    ///
    /// A `BTreeMap` keeps report output deterministically ordered.
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    /// Initialise an empty [`Registry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) a [`Metric`] with the provided name and
    /// description.
    ///
    /// # Panics
    ///
    /// Panics if `name` was previously registered with a different instrument
    /// type, or if `name` is not `[0-9a-z_]+`.
    pub fn register_metric<T>(&self, name: &'static str, description: &'static str) -> Metric<T>
    where
        T: MetricObserver,
        T::Options: Default,
    {
        self.register_metric_with_options(name, description, Default::default)
    }

    /// As [`Registry::register_metric`], constructing the observer options
    /// with `options` if (and only if) the metric does not already exist.
    pub fn register_metric_with_options<T, F>(
        &self,
        name: &'static str,
        description: &'static str,
        options: F,
    ) -> Metric<T>
    where
        T: MetricObserver,
        F: FnOnce() -> T::Options,
    {
        assert_legal_key(name);

        let mut instruments = self.instruments.lock();
        match instruments.entry(name) {
            Entry::Occupied(o) => match o.get().as_any().downcast_ref::<Metric<T>>() {
                Some(metric) => metric.clone(),
                None => panic!("instrument {name} registered with two different types"),
            },
            Entry::Vacant(v) => {
                let metric = Metric::new(name, description, options());
                v.insert(Box::new(metric.clone()));
                metric
            }
        }
    }

    /// Return the already-registered instrument named `name`, if any.
    ///
    /// Primarily useful for tests asserting on recorded values.
    ///
    /// # Panics
    ///
    /// Panics if `name` is registered with a different instrument type.
    pub fn get_instrument<I>(&self, name: &'static str) -> Option<I>
    where
        I: Instrument + Clone + 'static,
    {
        self.instruments
            .lock()
            .get(name)
            .map(|i| match i.as_any().downcast_ref::<I>() {
                Some(i) => i.clone(),
                None => panic!("instrument {name} registered with two different types"),
            })
    }

    /// Stream the state of every registered instrument into `reporter`, in
    /// alphabetical name order.
    pub fn report(&self, reporter: &mut dyn Reporter) {
        let instruments = self.instruments.lock();
        for instrument in instruments.values() {
            instrument.report(reporter);
        }
    }
}

/// A type that knows how to write its observations to a [`Reporter`].
pub trait Instrument: std::fmt::Debug + Send + Sync {
    /// Write the current state of this instrument to `reporter`: one
    /// `start_metric`, one `report_observation` per attribute set, one
    /// `finish_metric`.
    fn report(&self, reporter: &mut dyn Reporter);

    /// Returns `self` as [`Any`] for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// A sink for the observations of a [`Registry`].
pub trait Reporter {
    /// Begin the observations of a single metric.
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    );

    /// Record one observation of the metric begun by the last `start_metric`.
    fn report_observation(&mut self, attributes: &Attributes, observation: Observation);

    /// Complete the metric begun by the last `start_metric`.
    fn finish_metric(&mut self);
}

/// The type of [`Observation`] a metric reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum MetricKind {
    U64Counter,
    U64Gauge,
    U64Histogram,
    DurationHistogram,
}

/// A single recorded value.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Observation {
    U64Counter(u64),
    U64Gauge(u64),
    U64Histogram(HistogramObservation<u64>),
    DurationHistogram(HistogramObservation<Duration>),
}

/// A bucketed distribution: the sum of all recorded values plus per-bucket
/// counts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HistogramObservation<T> {
    /// The sum of all recorded values.
    pub total: T,
    /// The buckets, ordered by ascending `le`.
    pub buckets: Vec<ObservationBucket<T>>,
}

impl<T> HistogramObservation<T> {
    /// The number of values recorded across all buckets.
    pub fn sample_count(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }
}

/// The count of values that were `<= le` and strictly greater than the `le`
/// of the previous bucket.
///
/// Unlike prometheus bins, counts are not cumulative.
#[derive(Debug, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub struct ObservationBucket<T> {
    pub le: T,
    pub count: u64,
}

/// A set of key-value pairs with unique keys, identifying one recorder within
/// a [`Metric`].
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Iterate over the key-value pairs in key order.
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, &'static str, Cow<'static, str>> {
        self.0.iter()
    }
}

impl<'a, const N: usize> From<&'a [(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &'a [(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(key, value)| {
                    assert_legal_key(key);
                    (*key, Cow::Borrowed(*value))
                })
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(pairs: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(key, value)| {
                    assert_legal_key(key);
                    (key, value)
                })
                .collect(),
        )
    }
}

/// A [`Reporter`] that buffers the raw observations, for tests.
#[derive(Debug, Clone, Default)]
pub struct RawReporter {
    completed: Vec<ObservationSet>,
    in_progress: Option<ObservationSet>,
}

/// The observations of one metric, buffered by [`RawReporter`].
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct ObservationSet {
    pub metric_name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub observations: Vec<(Attributes, Observation)>,
}

impl Reporter for RawReporter {
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    ) {
        assert!(self.in_progress.is_none(), "metric already in progress");
        self.in_progress = Some(ObservationSet {
            metric_name,
            description,
            kind,
            observations: Default::default(),
        })
    }

    fn report_observation(&mut self, attributes: &Attributes, observation: Observation) {
        self.in_progress
            .as_mut()
            .expect("metric should be in progress")
            .observations
            .push((attributes.clone(), observation))
    }

    fn finish_metric(&mut self) {
        let metric = self
            .in_progress
            .take()
            .expect("metric should be in progress");
        self.completed.push(metric)
    }
}

impl RawReporter {
    /// The buffered [`ObservationSet`] of every reported metric.
    pub fn observations(&self) -> &Vec<ObservationSet> {
        assert!(self.in_progress.is_none(), "metric observation in progress");
        &self.completed
    }
}

/// Panics unless `s` matches `[0-9a-z_]+`.
pub fn assert_legal_key(s: &str) {
    assert!(!s.is_empty(), "string must not be empty");
    assert!(
        s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='z' | '_')),
        "string must be [0-9a-z_]+ got: \"{s}\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip() {
        let registry = Registry::new();
        let counter: Metric<U64Counter> = registry.register_metric("requests", "request count");
        let gauge: Metric<U64Gauge> = registry.register_metric("connections", "open connections");

        counter.recorder(&[("result", "ok")]).inc(3);
        counter.recorder(&[("result", "error")]).inc(1);
        gauge.recorder(&[("cell", "zone_a")]).set(7);

        let mut reporter = RawReporter::default();
        registry.report(&mut reporter);

        let observations = reporter.observations();
        assert_eq!(observations.len(), 2);

        // Alphabetical by metric name: "connections" first.
        assert_eq!(observations[0].metric_name, "connections");
        assert_eq!(observations[0].kind, MetricKind::U64Gauge);
        assert_eq!(
            observations[0].observations,
            vec![(
                Attributes::from(&[("cell", "zone_a")]),
                Observation::U64Gauge(7)
            )]
        );

        assert_eq!(observations[1].metric_name, "requests");
        assert_eq!(observations[1].observations.len(), 2);

        // Re-registration returns the same instrument.
        let counter2: Metric<U64Counter> = registry.register_metric("requests", "request count");
        assert_eq!(
            counter2
                .get_observer(&Attributes::from(&[("result", "ok")]))
                .expect("observer should exist")
                .fetch(),
            3
        );
    }

    #[test]
    #[should_panic(expected = "instrument requests registered with two different types")]
    fn test_type_mismatch() {
        let registry = Registry::new();
        registry.register_metric::<U64Gauge>("requests", "");
        registry.register_metric::<U64Counter>("requests", "");
    }

    #[test]
    #[should_panic(expected = "string must be [0-9a-z_]+")]
    fn test_illegal_name() {
        let registry = Registry::new();
        registry.register_metric::<U64Gauge>("no spaces allowed", "");
    }
}
