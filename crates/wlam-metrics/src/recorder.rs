//! In-memory metrics recorder.
//!
//! Implements [`metrics::Recorder`] and keeps every series in memory so the
//! runner can export a snapshot at the end of a simulation. Tests install it
//! with [`metrics::with_local_recorder`] to assert on emitted signals.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Snapshot Types
// ============================================================================

/// Metrics of a single node, keyed by metric name.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct NodeMetrics {
    /// Counter totals.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Last gauge values.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    /// Histogram summaries.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Everything recorded during a run, ready to export.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Counter metrics aggregated across all label sets.
    pub counters: BTreeMap<String, u64>,
    /// Gauge metrics (last value written for each name).
    pub gauges: BTreeMap<String, f64>,
    /// Histogram metrics aggregated across all label sets.
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Counter values keyed by the full series key (`name|label=value,...`).
    pub series: BTreeMap<String, u64>,
    /// The same values split by the `node` label.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
}

/// Distribution of the samples recorded into one histogram.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HistogramSummary {
    /// Samples seen.
    pub count: u64,
    /// Total of the samples.
    pub sum: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Median.
    pub p50: f64,
    /// p90, nearest rank.
    pub p90: f64,
    /// p99, nearest rank.
    pub p99: f64,
}

impl HistogramSummary {
    fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return HistogramSummary {
                count: 0,
                sum: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                p50: 0.0,
                p90: 0.0,
                p99: 0.0,
            };
        }

        let mut ordered = samples.to_vec();
        ordered.sort_by(f64::total_cmp);
        let last = ordered.len() - 1;
        let sum: f64 = ordered.iter().sum();
        let percentile = |q: f64| ordered[((q / 100.0) * last as f64).round().min(last as f64) as usize];

        HistogramSummary {
            count: ordered.len() as u64,
            sum,
            min: ordered[0],
            max: ordered[last],
            mean: sum / ordered.len() as f64,
            p50: percentile(50.0),
            p90: percentile(90.0),
            p99: percentile(99.0),
        }
    }
}

// ============================================================================
// Series Storage
// ============================================================================

#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

/// Stores f64 bits.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = f(f64::from_bits(current)).to_bits();
            match self
                .value
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct HistogramState {
    samples: RwLock<Vec<f64>>,
}

/// Name and labels of a registered series.
#[derive(Debug, Clone)]
struct SeriesMeta {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesMeta {
    fn from_key(key: &Key) -> Self {
        let mut labels: Vec<(String, String)> = key
            .labels()
            .map(|l| (l.key().to_string(), l.value().to_string()))
            .collect();
        labels.sort();
        SeriesMeta {
            name: key.name().to_string(),
            labels,
        }
    }

    fn series_key(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}|{}", self.name, labels.join(","))
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<String, (SeriesMeta, Arc<CounterState>)>>,
    gauges: RwLock<BTreeMap<String, (SeriesMeta, Arc<GaugeState>)>>,
    histograms: RwLock<BTreeMap<String, (SeriesMeta, Arc<HistogramState>)>>,
}

fn get_or_create<T: Default>(
    map: &RwLock<BTreeMap<String, (SeriesMeta, Arc<T>)>>,
    key: &Key,
) -> Arc<T> {
    let meta = SeriesMeta::from_key(key);
    let series_key = meta.series_key();
    if let Some((_, state)) = map.read().get(&series_key) {
        return state.clone();
    }
    map.write()
        .entry(series_key)
        .or_insert_with(|| (meta, Arc::new(T::default())))
        .1
        .clone()
}

impl RecorderState {
    fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut gauges: BTreeMap<String, f64> = BTreeMap::new();
        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut series: BTreeMap<String, u64> = BTreeMap::new();
        let mut nodes: BTreeMap<String, NodeMetrics> = BTreeMap::new();

        for (series_key, (meta, state)) in self.counters.read().iter() {
            let value = state.value.load(Ordering::Relaxed);
            *counters.entry(meta.name.clone()).or_default() += value;
            series.insert(series_key.clone(), value);
            if let Some(node) = meta.label("node") {
                let per_node = &mut nodes.entry(node.to_string()).or_default().counters;
                *per_node.entry(meta.name.clone()).or_default() += value;
            }
        }

        for (meta, state) in self.gauges.read().values() {
            let value = state.get();
            gauges.insert(meta.name.clone(), value);
            if let Some(node) = meta.label("node") {
                nodes
                    .entry(node.to_string())
                    .or_default()
                    .gauges
                    .insert(meta.name.clone(), value);
            }
        }

        let mut node_samples: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
        for (meta, state) in self.histograms.read().values() {
            let values = state.samples.read().clone();
            if let Some(node) = meta.label("node") {
                node_samples
                    .entry((node.to_string(), meta.name.clone()))
                    .or_default()
                    .extend(values.iter().copied());
            }
            samples.entry(meta.name.clone()).or_default().extend(values);
        }
        for ((node, name), values) in node_samples {
            nodes
                .entry(node)
                .or_default()
                .histograms
                .insert(name, HistogramSummary::from_samples(&values));
        }

        MetricsSnapshot {
            counters,
            gauges,
            histograms: samples
                .into_iter()
                .map(|(name, values)| (name, HistogramSummary::from_samples(&values)))
                .collect(),
            series,
            nodes,
        }
    }
}

// ============================================================================
// In-Memory Recorder
// ============================================================================

/// A `metrics` recorder that keeps every series in memory until the run ends.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.snapshot()
    }

    /// Sum of a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.state
            .counters
            .read()
            .values()
            .filter(|(meta, _)| meta.name == name)
            .map(|(_, state)| state.value.load(Ordering::Relaxed))
            .sum()
    }

    /// Sum of a counter across the series carrying `label=value`.
    pub fn counter_with_label(&self, name: &str, label: &str, value: &str) -> u64 {
        self.state
            .counters
            .read()
            .values()
            .filter(|(meta, _)| meta.name == name && meta.label(label) == Some(value))
            .map(|(_, state)| state.value.load(Ordering::Relaxed))
            .sum()
    }

    /// Last value of a gauge for a node.
    pub fn gauge_for_node(&self, name: &str, node: &str) -> Option<f64> {
        self.state
            .gauges
            .read()
            .values()
            .find(|(meta, _)| meta.name == name && meta.label("node") == Some(node))
            .map(|(_, state)| state.get())
    }

    /// All samples recorded for a histogram, across label sets, in series order.
    pub fn histogram_samples(&self, name: &str) -> Vec<f64> {
        self.state
            .histograms
            .read()
            .values()
            .filter(|(meta, _)| meta.name == name)
            .flat_map(|(_, state)| state.samples.read().clone())
            .collect()
    }

    /// Total number of samples and increments recorded across every series.
    pub fn total_activity(&self) -> u64 {
        let counters: u64 = self
            .state
            .counters
            .read()
            .values()
            .map(|(_, s)| s.value.load(Ordering::Relaxed))
            .sum();
        let histograms: u64 = self
            .state
            .histograms
            .read()
            .values()
            .map(|(_, s)| s.samples.read().len() as u64)
            .sum();
        counters + histograms + self.state.gauges.read().len() as u64
    }
}

struct InMemoryCounter {
    state: Arc<CounterState>,
}

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.state.value.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.state.value.fetch_max(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge {
    state: Arc<GaugeState>,
}

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.state.update(|v| v + value);
    }

    fn decrement(&self, value: f64) {
        self.state.update(|v| v - value);
    }

    fn set(&self, value: f64) {
        self.state.value.store(value.to_bits(), Ordering::Relaxed);
    }
}

struct InMemoryHistogram {
    state: Arc<HistogramState>,
}

impl metrics::HistogramFn for InMemoryHistogram {
    fn record(&self, value: f64) {
        self.state.samples.write().push(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let state = get_or_create(&self.state.counters, key);
        Counter::from_arc(Arc::new(InMemoryCounter { state }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let state = get_or_create(&self.state.gauges, key);
        Gauge::from_arc(Arc::new(InMemoryGauge { state }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let state = get_or_create(&self.state.histograms, key);
        Histogram::from_arc(Arc::new(InMemoryHistogram { state }))
    }
}
