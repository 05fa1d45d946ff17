use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Attributes, Instrument, MetricKind, Observation, Reporter};

/// Types that can be constructed from a per-metric options value.
pub trait MakeMetricObserver {
    /// The configuration shared by every observer of one [`Metric`],
    /// e.g. histogram bucket boundaries.
    type Options: Sized + Send + Sync + std::fmt::Debug + 'static;

    /// Create a new observer from `options`.
    fn create(options: &Self::Options) -> Self;
}

/// An object that records values for a single attribute set and can report a
/// single [`Observation`].
pub trait MetricObserver: MakeMetricObserver + std::fmt::Debug + Send + Sync + 'static {
    /// The type callers record through. Normally a cheap clone of `Self`.
    type Recorder;

    /// The kind of observation this observer reports.
    fn kind() -> MetricKind;

    /// Return a recorder for this observer.
    fn recorder(&self) -> Self::Recorder;

    /// Report the current value.
    fn observe(&self) -> Observation;
}

/// A named instrument maintaining one observer of type `T` per unique
/// [`Attributes`] set.
#[derive(Debug)]
pub struct Metric<T>
where
    T: MetricObserver,
{
    name: &'static str,
    description: &'static str,
    shared: Arc<MetricShared<T>>,
}

#[derive(Debug)]
struct MetricShared<T>
where
    T: MetricObserver,
{
    options: T::Options,
    observers: Mutex<BTreeMap<Attributes, T>>,
}

impl<T> Clone for Metric<T>
where
    T: MetricObserver,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Metric<T>
where
    T: MetricObserver,
{
    pub(crate) fn new(name: &'static str, description: &'static str, options: T::Options) -> Self {
        Self {
            name,
            description,
            shared: Arc::new(MetricShared {
                options,
                observers: Default::default(),
            }),
        }
    }

    /// Return the recorder for the provided attribute set, creating the
    /// underlying observer on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T::Recorder {
        let attributes = attributes.into();
        self.shared
            .observers
            .lock()
            .entry(attributes)
            .or_insert_with(|| T::create(&self.shared.options))
            .recorder()
    }

    /// Return the observer for the provided attribute set, if any values were
    /// recorded against it.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T>
    where
        T: Clone,
    {
        self.shared.observers.lock().get(attributes).cloned()
    }
}

impl<T> Instrument for Metric<T>
where
    T: MetricObserver,
{
    fn report(&self, reporter: &mut dyn Reporter) {
        reporter.start_metric(self.name, self.description, T::kind());

        let observers = self.shared.observers.lock();
        for (attributes, observer) in observers.iter() {
            reporter.report_observation(attributes, observer.observe());
        }

        reporter.finish_metric();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
