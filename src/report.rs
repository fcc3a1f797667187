//! Anomaly and Prediction Egress
//!
//! Three outgoing streams, all best-effort: the JSON anomaly report for
//! qualifying events, the prediction series (value + companion confidence),
//! and the always-on anomaly series (score, likelihood, direction). A
//! transport failure is logged and the message dropped; nothing is retried
//! or buffered.

use crate::metric::{Metric, series_name};
use crate::pipeline::{Detection, Prediction};
use crate::stats::ServiceStats;
use crate::transport::QueueProducer;
use chrono::DateTime;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Reporter {
    producer: Arc<dyn QueueProducer>,
    stats: Arc<ServiceStats>,
    reports_topic: String,
    predictions_topic: String,
    anomalies_topic: String,
    prefix_template: String,
}

impl Reporter {
    pub fn new(
        producer: Arc<dyn QueueProducer>,
        stats: Arc<ServiceStats>,
        reports_topic: String,
        predictions_topic: String,
        anomalies_topic: String,
        prefix_template: String,
    ) -> Self {
        Self {
            producer,
            stats,
            reports_topic,
            predictions_topic,
            anomalies_topic,
            prefix_template,
        }
    }

    fn iso_timestamp(timestamp: i64) -> String {
        DateTime::from_timestamp(timestamp, 0)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_else(|| timestamp.to_string())
    }

    /// Emit the JSON anomaly report for a threshold-qualified event.
    pub fn report_anomaly(&self, metric: &Metric, detection: &Detection, prediction: Option<&Prediction>) {
        self.stats.inc_reports_attempted();

        let report = serde_json::json!({
            "report_id": Uuid::new_v4().to_string(),
            "metric": metric,
            "reporter": "pensu",
            "meta_data": {
                "htm_anomaly_score": detection.score,
                "htm_anomaly_likelihood": detection.likelihood,
                "anomaly_score": detection.likelihood.unwrap_or(0.0)
                    * detection.direction as f64
                    * 100.0,
                "timestamp": Self::iso_timestamp(metric.timestamp),
                "metric": metric.name,
                "prediction": prediction,
                "value": metric.value,
            },
        });

        let payload = report.to_string();
        match self.producer.send(&self.reports_topic, payload.as_bytes()) {
            Ok(()) => {
                info!(metric = %metric.name, report = %payload, "anomaly reported");
                self.stats.inc_anomalies_reported();
            }
            Err(err) => {
                warn!(
                    metric = %metric.name,
                    error = %err,
                    "failed to publish an anomaly report; dropping it"
                );
            }
        }
    }

    fn send_series(&self, topic: &str, series: &str, metric_name: &str, value: f64, timestamp: i64) {
        let line = format!(
            "{} {} {}",
            series_name(&self.prefix_template, series, metric_name),
            value,
            timestamp
        );
        if let Err(err) = self.producer.send(topic, line.as_bytes()) {
            warn!(
                metric = %metric_name,
                series,
                error = %err,
                "failed to publish a series point; dropping it"
            );
        }
    }

    /// Emit the prediction series for this metric, plus the companion
    /// confidence series when a confidence is available.
    pub fn publish_prediction_series(&self, metric: &Metric, prediction: &Prediction) {
        self.send_series(
            &self.predictions_topic,
            "prediction",
            &metric.name,
            prediction.value,
            prediction.timestamp,
        );
        if let Some(confidence) = prediction.confidence {
            self.send_series(
                &self.predictions_topic,
                "prediction_confidence",
                &metric.name,
                confidence,
                prediction.timestamp,
            );
        }
    }

    /// Emit the three always-on anomaly series for this metric, whatever
    /// the reportability outcome was.
    pub fn publish_anomaly_series(&self, metric: &Metric, detection: &Detection) {
        self.send_series(
            &self.anomalies_topic,
            "anomaly_score",
            &metric.name,
            detection.score,
            metric.timestamp,
        );
        if let Some(likelihood) = detection.likelihood {
            self.send_series(
                &self.anomalies_topic,
                "anomaly_likelihood",
                &metric.name,
                likelihood,
                metric.timestamp,
            );
        }
        self.send_series(
            &self.anomalies_topic,
            "anomaly_direction",
            &metric.name,
            detection.direction as f64,
            metric.timestamp,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    fn reporter(broker: &Arc<MemoryBroker>) -> Reporter {
        Reporter::new(
            Arc::new(broker.producer()),
            Arc::new(ServiceStats::new()),
            "reports".to_string(),
            "predictions".to_string(),
            "anomalies".to_string(),
            "pensu.{{#anomaly_metric}}.metrics_analyzer".to_string(),
        )
    }

    fn metric() -> Metric {
        Metric {
            family: "cpu".to_string(),
            item: "load".to_string(),
            name: "cpu.load".to_string(),
            value: 7.5,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_report_carries_identity_and_derived_score() {
        let broker = MemoryBroker::new();
        let reporter = reporter(&broker);
        let detection = Detection {
            score: 0.99,
            likelihood: Some(0.99999),
            direction: 1,
        };
        reporter.report_anomaly(&metric(), &detection, None);

        let messages = broker.drain("reports");
        assert_eq!(messages.len(), 1);
        let report: serde_json::Value = serde_json::from_slice(&messages[0]).unwrap();
        assert_eq!(report["reporter"], "pensu");
        assert!(report["report_id"].as_str().is_some());
        assert_eq!(report["meta_data"]["htm_anomaly_score"], 0.99);
        let derived = report["meta_data"]["anomaly_score"].as_f64().unwrap();
        assert!((derived - 99.999).abs() < 1e-9);
        assert_eq!(report["meta_data"]["prediction"], serde_json::Value::Null);
        assert_eq!(report["metric"]["name"], "cpu.load");
    }

    #[test]
    fn test_prediction_payload_uses_wire_field_name() {
        let broker = MemoryBroker::new();
        let reporter = reporter(&broker);
        let detection = Detection {
            score: 0.99,
            likelihood: Some(0.99999),
            direction: -1,
        };
        let prediction = Prediction {
            value: 3.0,
            timestamp: 1_700_000_050,
            confidence: Some(0.95),
        };
        reporter.report_anomaly(&metric(), &detection, Some(&prediction));

        let messages = broker.drain("reports");
        let report: serde_json::Value = serde_json::from_slice(&messages[0]).unwrap();
        assert_eq!(report["meta_data"]["prediction"]["confidence_level"], 0.95);
        let derived = report["meta_data"]["anomaly_score"].as_f64().unwrap();
        assert!((derived + 99.999).abs() < 1e-9);
    }

    #[test]
    fn test_anomaly_series_lines() {
        let broker = MemoryBroker::new();
        let reporter = reporter(&broker);
        let detection = Detection {
            score: 0.5,
            likelihood: Some(0.7),
            direction: 0,
        };
        reporter.publish_anomaly_series(&metric(), &detection);

        let lines: Vec<String> = broker
            .drain("anomalies")
            .into_iter()
            .map(|m| String::from_utf8(m).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "pensu.anomaly_score.metrics_analyzer.cpu.load 0.5 1700000000"
        );
        assert_eq!(
            lines[1],
            "pensu.anomaly_likelihood.metrics_analyzer.cpu.load 0.7 1700000000"
        );
        assert_eq!(
            lines[2],
            "pensu.anomaly_direction.metrics_analyzer.cpu.load 0 1700000000"
        );
    }

    #[test]
    fn test_confidence_series_only_when_present() {
        let broker = MemoryBroker::new();
        let reporter = reporter(&broker);
        let prediction = Prediction {
            value: 3.0,
            timestamp: 1_700_000_050,
            confidence: None,
        };
        reporter.publish_prediction_series(&metric(), &prediction);

        let lines = broker.drain("predictions");
        assert_eq!(lines.len(), 1);
    }
}
