//! Process-wide metrics registry.
//!
//! Counters, gauges, and duration histograms over atomics, rendered in the
//! Prometheus text exposition format. The registry is the only process-wide
//! mutable state besides the configuration snapshot; create it once at
//! startup and share it via `Arc`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Monotonic counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge (f64 stored as bits).
#[derive(Debug, Clone)]
pub struct Gauge(Arc<AtomicU64>);

impl Default for Gauge {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(0f64.to_bits())))
    }
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Fixed-bucket duration histogram (seconds).
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum of observations in microseconds, to keep the hot path integral.
    sum_micros: AtomicU64,
    total: AtomicU64,
}

impl Histogram {
    fn new(bounds: Vec<f64>) -> Self {
        let counts = (0..bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_micros: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if seconds <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

const DEFAULT_BOUNDS: [f64; 8] = [0.005, 0.025, 0.1, 0.25, 1.0, 2.5, 5.0, 10.0];

/// Named metrics, optionally labelled.
///
/// Series identity is `name` + rendered label pairs; the same identity
/// always returns the same underlying atomic.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Counter {
        self.counter_with(name, &[])
    }

    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> Counter {
        let key = series_key(name, labels);
        if let Some(c) = self.counters.read().ok().and_then(|m| m.get(&key).cloned()) {
            return c;
        }
        let mut map = match self.counters.write() {
            Ok(m) => m,
            Err(_) => return Counter::default(),
        };
        map.entry(key).or_default().clone()
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauge_with(name, &[])
    }

    pub fn gauge_with(&self, name: &str, labels: &[(&str, &str)]) -> Gauge {
        let key = series_key(name, labels);
        if let Some(g) = self.gauges.read().ok().and_then(|m| m.get(&key).cloned()) {
            return g;
        }
        let mut map = match self.gauges.write() {
            Ok(m) => m,
            Err(_) => return Gauge::default(),
        };
        map.entry(key).or_default().clone()
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        let key = name.to_string();
        if let Some(h) = self.histograms.read().ok().and_then(|m| m.get(&key).cloned()) {
            return h;
        }
        let mut map = match self.histograms.write() {
            Ok(m) => m,
            Err(_) => return Arc::new(Histogram::new(DEFAULT_BOUNDS.to_vec())),
        };
        map.entry(key)
            .or_insert_with(|| Arc::new(Histogram::new(DEFAULT_BOUNDS.to_vec())))
            .clone()
    }

    /// Render every series in Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Ok(counters) = self.counters.read() {
            for (key, counter) in counters.iter() {
                out.push_str(&format!("{key} {}\n", counter.get()));
            }
        }
        if let Ok(gauges) = self.gauges.read() {
            for (key, gauge) in gauges.iter() {
                out.push_str(&format!("{key} {}\n", gauge.get()));
            }
        }
        if let Ok(histograms) = self.histograms.read() {
            for (name, histogram) in histograms.iter() {
                for (i, bound) in histogram.bounds.iter().enumerate() {
                    out.push_str(&format!(
                        "{name}_bucket{{le=\"{bound}\"}} {}\n",
                        histogram.counts[i].load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!(
                    "{name}_bucket{{le=\"+Inf\"}} {}\n",
                    histogram.total.load(Ordering::Relaxed)
                ));
                out.push_str(&format!(
                    "{name}_sum {}\n",
                    histogram.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
                ));
                out.push_str(&format!(
                    "{name}_count {}\n",
                    histogram.total.load(Ordering::Relaxed)
                ));
            }
        }
        out
    }
}
