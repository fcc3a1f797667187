//! Graphite-Line Metric Parsing
//!
//! Metrics arrive as `metric.name.hierarchy value timestamp` lines. The
//! family (the name minus its last dotted segment) and the item (the last
//! segment) are derived once at parse time and never recomputed.

use crate::stats::ServiceStats;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// One observation pulled off the raw metrics topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub family: String,
    pub item: String,
    pub name: String,
    pub value: f64,
    pub timestamp: i64,
}

/// Hex-encode a raw payload so malformed or hostile input never lands
/// verbatim in a log line.
pub(crate) fn encode_payload(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 2);
    for byte in raw.bytes() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Render a series name from the configured prefix template, e.g.
/// `pensu.{{#anomaly_metric}}.metrics_analyzer` + `anomaly_score` +
/// `cpu.load` -> `pensu.anomaly_score.metrics_analyzer.cpu.load`.
pub fn series_name(prefix_template: &str, series: &str, metric_name: &str) -> String {
    format!(
        "{}.{}",
        prefix_template.replace("{{#anomaly_metric}}", series),
        metric_name
    )
}

/// Line parser with received/rejected accounting.
pub struct MetricParser {
    stats: Arc<ServiceStats>,
}

impl MetricParser {
    pub fn new(stats: Arc<ServiceStats>) -> Self {
        Self { stats }
    }

    /// Parse one raw line. Every call counts as a received metric, whether
    /// or not it parses; rejects are logged with the payload encoded and
    /// skipped by the caller.
    pub fn parse(&self, raw: &str) -> Option<Metric> {
        self.stats.inc_metrics_received();

        let fields: Vec<&str> = raw.split(' ').collect();
        if fields.len() != 3 {
            warn!(
                payload = %encode_payload(raw),
                "rejected metric line: expected exactly three space-separated fields"
            );
            return None;
        }

        let name = fields[0];
        let segments: Vec<&str> = name.split('.').collect();
        if segments.len() < 2 {
            warn!(
                payload = %encode_payload(raw),
                "rejected metric line: name has no family (fewer than two dotted segments)"
            );
            return None;
        }
        let family = segments[..segments.len() - 1].join(".");
        let item = segments[segments.len() - 1].to_string();

        let value: f64 = match fields[1].parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    payload = %encode_payload(raw),
                    "rejected metric line: value is not a float"
                );
                return None;
            }
        };
        let timestamp: i64 = match fields[2].parse() {
            Ok(t) => t,
            Err(_) => {
                warn!(
                    payload = %encode_payload(raw),
                    "rejected metric line: timestamp is not an integer"
                );
                return None;
            }
        };

        Some(Metric {
            family,
            item,
            name: name.to_string(),
            value,
            timestamp,
        })
    }
}
