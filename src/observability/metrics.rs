//! Metrics recorders.
//!
//! # Responsibilities
//! - Keep recent metrics in memory, one aggregate per collection interval
//! - Fan every recorded value out to each configured sink
//! - Apply prefix filters and the optional `host` label before fan-out
//!
//! # Metrics
//! - `agent.join.attempts` (counter): join attempts by role
//! - `agent.join.exhausted` (counter): coordinators that gave up
//! - `agent.reloads` (counter): configuration reloads applied
//! - `agent.state` (gauge): lifecycle state ordinal
//!
//! # Design Decisions
//! - Everything implements `metrics::Recorder`; sinks compose by wrapping
//! - Metric handles are cheap `Arc`s; updates take one short lock
//! - Filtering and host labelling happen once, in front of the fan-out

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Label, Metadata,
    Recorder, SharedString, Unit,
};
use serde::Serialize;

/// Flattens a key into `name;label=value` form.
pub fn flat_name(key: &Key) -> String {
    let mut name = key.name().to_string();
    for label in key.labels() {
        name.push(';');
        name.push_str(label.key());
        name.push('=');
        name.push_str(label.value());
    }
    name
}

/// Summary of the samples recorded for one histogram in one interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl SampleSummary {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Aggregates for one collection interval.
#[derive(Debug, Clone, Serialize)]
pub struct IntervalMetrics {
    pub timestamp: SystemTime,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub samples: BTreeMap<String, SampleSummary>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl IntervalMetrics {
    fn new(now: Instant) -> Self {
        Self {
            timestamp: SystemTime::now(),
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
            samples: BTreeMap::new(),
            started: Some(now),
        }
    }
}

struct InmemInner {
    interval: Duration,
    max_intervals: usize,
    intervals: Mutex<VecDeque<IntervalMetrics>>,
}

impl InmemInner {
    fn lock(&self) -> MutexGuard<'_, VecDeque<IntervalMetrics>> {
        self.intervals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` against the interval that is current right now.
    fn with_current(&self, f: impl FnOnce(&mut IntervalMetrics)) {
        let now = Instant::now();
        let mut intervals = self.lock();
        let rotate = match intervals.back() {
            Some(last) => last
                .started
                .map_or(true, |start| now.duration_since(start) >= self.interval),
            None => true,
        };
        if rotate {
            intervals.push_back(IntervalMetrics::new(now));
            while intervals.len() > self.max_intervals {
                intervals.pop_front();
            }
        }
        if let Some(current) = intervals.back_mut() {
            f(current);
        }
    }
}

/// Upper bound on retained intervals, whatever the retention period says.
pub const MAX_INMEM_INTERVALS: usize = 8640;

/// Ring buffer of per-interval aggregates.
#[derive(Clone)]
pub struct InmemSink {
    inner: Arc<InmemInner>,
}

impl InmemSink {
    pub fn new(interval: Duration, retention: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let max_intervals = (retention.as_nanos() / interval.as_nanos())
            .clamp(1, MAX_INMEM_INTERVALS as u128) as usize;
        Self {
            inner: Arc::new(InmemInner {
                interval,
                max_intervals,
                intervals: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Intervals kept before the oldest is dropped.
    pub fn max_intervals(&self) -> usize {
        self.inner.max_intervals
    }

    /// Retained intervals, oldest first.
    pub fn snapshot(&self) -> Vec<IntervalMetrics> {
        self.inner.lock().iter().cloned().collect()
    }

    /// The most recent interval, if anything has been recorded.
    pub fn latest(&self) -> Option<IntervalMetrics> {
        self.inner.lock().back().cloned()
    }

    fn handle(&self, key: &Key) -> Arc<InmemHandle> {
        Arc::new(InmemHandle {
            inner: Arc::clone(&self.inner),
            name: flat_name(key),
        })
    }
}

struct InmemHandle {
    inner: Arc<InmemInner>,
    name: String,
}

impl CounterFn for InmemHandle {
    fn increment(&self, value: u64) {
        self.inner.with_current(|m| {
            *m.counters.entry(self.name.clone()).or_default() += value;
        });
    }

    fn absolute(&self, value: u64) {
        self.inner.with_current(|m| {
            m.counters.insert(self.name.clone(), value);
        });
    }
}

impl GaugeFn for InmemHandle {
    fn increment(&self, value: f64) {
        self.inner.with_current(|m| {
            *m.gauges.entry(self.name.clone()).or_default() += value;
        });
    }

    fn decrement(&self, value: f64) {
        self.inner.with_current(|m| {
            *m.gauges.entry(self.name.clone()).or_default() -= value;
        });
    }

    fn set(&self, value: f64) {
        self.inner.with_current(|m| {
            m.gauges.insert(self.name.clone(), value);
        });
    }
}

impl HistogramFn for InmemHandle {
    fn record(&self, value: f64) {
        self.inner.with_current(|m| {
            m.samples
                .entry(self.name.clone())
                .and_modify(|s| s.add(value))
                .or_insert_with(|| SampleSummary::new(value));
        });
    }
}

impl Recorder for InmemSink {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.handle(key))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.handle(key))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.handle(key))
    }
}

/// Sends every metric to all wrapped recorders.
pub struct FanoutRecorder {
    sinks: Vec<Box<dyn Recorder + Send + Sync>>,
}

impl FanoutRecorder {
    pub fn new(sinks: Vec<Box<dyn Recorder + Send + Sync>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

struct FanoutCounter(Vec<Counter>);
struct FanoutGauge(Vec<Gauge>);
struct FanoutHistogram(Vec<Histogram>);

impl CounterFn for FanoutCounter {
    fn increment(&self, value: u64) {
        self.0.iter().for_each(|c| c.increment(value));
    }

    fn absolute(&self, value: u64) {
        self.0.iter().for_each(|c| c.absolute(value));
    }
}

impl GaugeFn for FanoutGauge {
    fn increment(&self, value: f64) {
        self.0.iter().for_each(|g| g.increment(value));
    }

    fn decrement(&self, value: f64) {
        self.0.iter().for_each(|g| g.decrement(value));
    }

    fn set(&self, value: f64) {
        self.0.iter().for_each(|g| g.set(value));
    }
}

impl HistogramFn for FanoutHistogram {
    fn record(&self, value: f64) {
        self.0.iter().for_each(|h| h.record(value));
    }
}

impl Recorder for FanoutRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        for sink in &self.sinks {
            sink.describe_counter(key.clone(), unit, description.clone());
        }
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        for sink in &self.sinks {
            sink.describe_gauge(key.clone(), unit, description.clone());
        }
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        for sink in &self.sinks {
            sink.describe_histogram(key.clone(), unit, description.clone());
        }
    }

    fn register_counter(&self, key: &Key, metadata: &Metadata<'_>) -> Counter {
        let counters = self
            .sinks
            .iter()
            .map(|s| s.register_counter(key, metadata))
            .collect();
        Counter::from_arc(Arc::new(FanoutCounter(counters)))
    }

    fn register_gauge(&self, key: &Key, metadata: &Metadata<'_>) -> Gauge {
        let gauges = self
            .sinks
            .iter()
            .map(|s| s.register_gauge(key, metadata))
            .collect();
        Gauge::from_arc(Arc::new(FanoutGauge(gauges)))
    }

    fn register_histogram(&self, key: &Key, metadata: &Metadata<'_>) -> Histogram {
        let histograms = self
            .sinks
            .iter()
            .map(|s| s.register_histogram(key, metadata))
            .collect();
        Histogram::from_arc(Arc::new(FanoutHistogram(histograms)))
    }
}

/// Allow and block prefixes with a default for unmatched names.
///
/// The longest matching prefix decides; ties go to the block list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixFilter {
    allowed: Vec<String>,
    blocked: Vec<String>,
    default_allow: bool,
}

impl PrefixFilter {
    /// Build from `+prefix` / `-prefix` entries. Malformed entries are skipped;
    /// validation rejects them earlier.
    pub fn new(entries: &[String], default_allow: bool) -> Self {
        let mut filter = Self {
            default_allow,
            ..Self::default()
        };
        for entry in entries {
            if let Some(prefix) = entry.strip_prefix('+') {
                filter.allowed.push(prefix.to_string());
            } else if let Some(prefix) = entry.strip_prefix('-') {
                filter.blocked.push(prefix.to_string());
            }
        }
        filter
    }

    pub fn allows(&self, name: &str) -> bool {
        let longest = |prefixes: &[String]| {
            prefixes
                .iter()
                .filter(|p| name.starts_with(p.as_str()))
                .map(String::len)
                .max()
        };
        match (longest(&self.allowed), longest(&self.blocked)) {
            (None, None) => self.default_allow,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(allow), Some(block)) => allow > block,
        }
    }
}

/// Filters metric names and adds the optional `host` label.
pub struct FilteredRecorder<R> {
    inner: R,
    filter: PrefixFilter,
    host: Option<String>,
}

impl<R: Recorder> FilteredRecorder<R> {
    pub fn new(inner: R, filter: PrefixFilter, host: Option<String>) -> Self {
        Self {
            inner,
            filter,
            host,
        }
    }

    fn key(&self, key: &Key) -> Option<Key> {
        if !self.filter.allows(key.name()) {
            return None;
        }
        Some(match &self.host {
            Some(host) => key.with_extra_labels(vec![Label::new("host", host.clone())]),
            None => key.clone(),
        })
    }
}

impl<R: Recorder> Recorder for FilteredRecorder<R> {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.inner.describe_counter(key, unit, description);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.inner.describe_gauge(key, unit, description);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.inner.describe_histogram(key, unit, description);
    }

    fn register_counter(&self, key: &Key, metadata: &Metadata<'_>) -> Counter {
        match self.key(key) {
            Some(key) => self.inner.register_counter(&key, metadata),
            None => Counter::noop(),
        }
    }

    fn register_gauge(&self, key: &Key, metadata: &Metadata<'_>) -> Gauge {
        match self.key(key) {
            Some(key) => self.inner.register_gauge(&key, metadata),
            None => Gauge::noop(),
        }
    }

    fn register_histogram(&self, key: &Key, metadata: &Metadata<'_>) -> Histogram {
        match self.key(key) {
            Some(key) => self.inner.register_histogram(&key, metadata),
            None => Histogram::noop(),
        }
    }
}
