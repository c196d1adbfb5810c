//! Latency histograms for the relay's hot paths.
//! Each metric keeps a bounded window of recent samples (microseconds) and
//! reports p50/p95/p99 on demand.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const WINDOW: usize = 1024;

/// Well-known metric names.
pub mod metric_names {
    /// One backend call (single attempt).
    pub const TRANSLATE_BACKEND: &str = "t_translate_backend";
    /// Full `Translator::translate`, cache hits included.
    pub const TRANSLATE_TOTAL: &str = "t_translate_total";
    /// One recipient's translate + push unit.
    pub const RECIPIENT_UNIT: &str = "t_recipient_unit";
    /// Whole send, from validation to all recipients settled.
    pub const FANOUT_TOTAL: &str = "t_fanout_total";
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: u64,
}

#[derive(Default)]
struct Window {
    samples: VecDeque<f64>,
    count: u64,
}

impl Window {
    fn push(&mut self, value: f64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.count += 1;
    }

    fn summary(&self) -> MetricSummary {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let pick = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        MetricSummary {
            p50_us: pick(50.0),
            p95_us: pick(95.0),
            p99_us: pick(99.0),
            count: self.count,
        }
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, Window>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &'static str, elapsed: Duration) {
        let value_us = elapsed.as_micros() as f64;
        self.windows.lock().entry(name).or_default().push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    /// Start a timer that records into `name` when dropped.
    pub fn timer(self: &Arc<Self>, name: &'static str) -> Timer {
        Timer {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        self.windows
            .lock()
            .iter()
            .map(|(&name, w)| (name.to_string(), w.summary()))
            .collect()
    }
}

/// Records elapsed time on drop, so early returns are measured too.
pub struct Timer {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.registry.record(self.name, self.start.elapsed());
    }
}
