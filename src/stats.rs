//! Service Counters and Gauges
//!
//! All runtime accounting lives on one dependency-injected prometheus
//! registry; the status endpoint serves both the text exposition format and
//! a JSON snapshot. `last_metric_timestamp` doubles as pipeline state: the
//! prediction step extrapolates the forecast timestamp from it.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

pub struct ServiceStats {
    registry: Registry,
    raw_messages_consumed: IntCounter,
    metrics_received: IntCounter,
    metrics_processed: IntCounter,
    reports_attempted: IntCounter,
    anomalies_reported: IntCounter,
    models_loaded: IntGauge,
    calculators_loaded: IntGauge,
    last_metric_timestamp: AtomicI64,
    started: Instant,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(c.clone())).unwrap();
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).unwrap();
    registry.register(Box::new(g.clone())).unwrap();
    g
}

impl ServiceStats {
    pub fn new() -> Self {
        let registry = Registry::new();
        Self {
            raw_messages_consumed: counter(
                &registry,
                "pensu_raw_messages_consumed_total",
                "Raw messages pulled from the metrics topic",
            ),
            metrics_received: counter(
                &registry,
                "pensu_metrics_received_total",
                "Metric lines handed to the parser, including rejects",
            ),
            metrics_processed: counter(
                &registry,
                "pensu_metrics_processed_total",
                "Metrics that completed a pipeline pass",
            ),
            reports_attempted: counter(
                &registry,
                "pensu_anomaly_reports_attempted_total",
                "Anomaly reports submitted to the egress topic",
            ),
            anomalies_reported: counter(
                &registry,
                "pensu_anomalies_reported_total",
                "Anomaly reports acknowledged by the egress topic",
            ),
            models_loaded: gauge(
                &registry,
                "pensu_models_loaded",
                "Forecasting/anomaly models currently cached",
            ),
            calculators_loaded: gauge(
                &registry,
                "pensu_likelihood_calculators_loaded",
                "Likelihood calculators currently cached",
            ),
            last_metric_timestamp: AtomicI64::new(-1),
            started: Instant::now(),
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn inc_raw_messages(&self) {
        self.raw_messages_consumed.inc();
    }

    pub fn inc_metrics_received(&self) {
        self.metrics_received.inc();
    }

    pub fn inc_metrics_processed(&self) {
        self.metrics_processed.inc();
    }

    pub fn inc_reports_attempted(&self) {
        self.reports_attempted.inc();
    }

    pub fn inc_anomalies_reported(&self) {
        self.anomalies_reported.inc();
    }

    pub fn set_models_loaded(&self, count: usize) {
        self.models_loaded.set(count as i64);
    }

    pub fn set_calculators_loaded(&self, count: usize) {
        self.calculators_loaded.set(count as i64);
    }

    /// Timestamp of the last fully processed metric, `-1` until the first
    /// one completes.
    pub fn last_metric_timestamp(&self) -> i64 {
        self.last_metric_timestamp.load(Ordering::SeqCst)
    }

    pub fn record_metric_timestamp(&self, timestamp: i64) {
        self.last_metric_timestamp.store(timestamp, Ordering::SeqCst);
    }

    /// Prometheus text exposition of the registry.
    pub fn encode_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// JSON snapshot for the `/ping` endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.started.elapsed().as_secs(),
            "raw_messages_consumed": self.raw_messages_consumed.get(),
            "metrics_received": self.metrics_received.get(),
            "metrics_processed": self.metrics_processed.get(),
            "anomaly_reports_attempted": self.reports_attempted.get(),
            "anomalies_reported": self.anomalies_reported.get(),
            "models_loaded": self.models_loaded.get(),
            "likelihood_calculators_loaded": self.calculators_loaded.get(),
            "last_metric_timestamp": self.last_metric_timestamp(),
        })
    }
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ServiceStats::new();
        stats.inc_metrics_received();
        stats.inc_metrics_received();
        stats.inc_metrics_processed();
        stats.set_models_loaded(4);
        stats.record_metric_timestamp(1_700_000_000);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot["metrics_received"], 2);
        assert_eq!(snapshot["metrics_processed"], 1);
        assert_eq!(snapshot["models_loaded"], 4);
        assert_eq!(snapshot["last_metric_timestamp"], 1_700_000_000_i64);
    }

    #[test]
    fn test_last_timestamp_starts_unset() {
        let stats = ServiceStats::new();
        assert_eq!(stats.last_metric_timestamp(), -1);
    }

    #[test]
    fn test_prometheus_exposition_contains_counters() {
        let stats = ServiceStats::new();
        stats.inc_raw_messages();
        let text = stats.encode_prometheus();
        assert!(text.contains("pensu_raw_messages_consumed_total 1"));
    }
}
