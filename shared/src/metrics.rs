//! Write-only metrics sink consumed by the transport core.
//!
//! The core never reads metric values back; it only emits counters, gauges
//! and histograms with small label tuples. Embedding processes plug in
//! whatever backend they run ([`NullSink`] when they run none). The
//! [`RecordingSink`] recorder exists for tests and ad-hoc inspection and can
//! export its contents in a Prometheus-style text format.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

/// Label tuple attached to an instrument, e.g. `&[("protocol", "tcp")]`.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Destination for the core's instrumentation.
///
/// Implementations must be cheap: these methods sit on the per-message hot
/// path and are called with locks dropped.
pub trait MetricsSink: Send + Sync {
    /// Add `delta` to a monotonically increasing counter.
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64);

    /// Set a gauge to an absolute value.
    fn gauge(&self, name: &str, labels: Labels<'_>, value: i64);

    /// Record one observation into a histogram.
    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64);
}

/// Sink that discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn counter(&self, _name: &str, _labels: Labels<'_>, _delta: u64) {}
    fn gauge(&self, _name: &str, _labels: Labels<'_>, _value: i64) {}
    fn histogram(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

/// In-memory recorder keyed by instrument name and label tuple.
///
/// Histograms keep only observation count and sum; tests assert on those.
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, i64>>,
    histograms: Mutex<HashMap<String, (u64, f64)>>,
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut key = String::with_capacity(name.len() + 16);
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        let _ = write!(key, "{}=\"{}\"", k, v);
    }
    key.push('}');
    key
}

impl RecordingSink {
    /// Create an empty recorder behind an `Arc`, ready to hand to the server.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current value of a counter series (0 if never written).
    pub fn counter_value(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Current value of a gauge series.
    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<i64> {
        self.gauges.lock().get(&series_key(name, labels)).copied()
    }

    /// Observation count and sum of a histogram series.
    pub fn histogram_value(&self, name: &str, labels: Labels<'_>) -> (u64, f64) {
        self.histograms
            .lock()
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or((0, 0.0))
    }

    /// Export all series in Prometheus text exposition format, one per line.
    pub fn export(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.counters.lock().iter() {
            let _ = writeln!(out, "{} {}", key, value);
        }
        for (key, value) in self.gauges.lock().iter() {
            let _ = writeln!(out, "{} {}", key, value);
        }
        for (key, (count, sum)) in self.histograms.lock().iter() {
            let _ = writeln!(out, "{}_count {}", key, count);
            let _ = writeln!(out, "{}_sum {}", key, sum);
        }
        out
    }
}

impl MetricsSink for RecordingSink {
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64) {
        *self.counters.lock().entry(series_key(name, labels)).or_insert(0) += delta;
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: i64) {
        self.gauges.lock().insert(series_key(name, labels), value);
    }

    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        let mut histograms = self.histograms.lock();
        let entry = histograms.entry(series_key(name, labels)).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let sink = RecordingSink::default();
        sink.counter("bytes_sent", &[("protocol", "tcp")], 4);
        sink.counter("bytes_sent", &[("protocol", "tcp")], 6);
        sink.counter("bytes_sent", &[("protocol", "udp")], 1);

        assert_eq!(sink.counter_value("bytes_sent", &[("protocol", "tcp")]), 10);
        assert_eq!(sink.counter_value("bytes_sent", &[("protocol", "udp")]), 1);
        assert_eq!(sink.counter_value("bytes_received", &[("protocol", "tcp")]), 0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let sink = RecordingSink::default();
        sink.gauge("clients_connected", &[], 3);
        sink.gauge("clients_connected", &[], 2);
        assert_eq!(sink.gauge_value("clients_connected", &[]), Some(2));
    }

    #[test]
    fn test_histogram_counts_and_sums() {
        let sink = RecordingSink::default();
        sink.histogram("client_connected_event_time", &[], 0.5);
        sink.histogram("client_connected_event_time", &[], 1.5);
        let (count, sum) = sink.histogram_value("client_connected_event_time", &[]);
        assert_eq!(count, 2);
        assert!((sum - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_export_contains_series() {
        let sink = RecordingSink::default();
        sink.counter("finalizations", &[("type", "message_buffer")], 7);
        let text = sink.export();
        assert!(text.contains("finalizations{type=\"message_buffer\"} 7"));
    }

    #[test]
    fn test_null_sink_is_silent() {
        let sink = NullSink;
        sink.counter("anything", &[], 1);
        sink.gauge("anything", &[], 1);
        sink.histogram("anything", &[], 1.0);
    }
}
