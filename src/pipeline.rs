//! Anomaly-Decision Pipeline
//!
//! One metric at a time: evaluate admission, obtain (or build) the three
//! per-metric components, run the prediction and detection steps, apply
//! the reporting decision, emit. Every expected-missing value is an
//! explicit `Option`; the only thing the boundary catch exists for is the
//! genuinely unexpected, and a single metric's failure never halts the
//! stream.

use crate::cache::{LikelihoodHandle, ModelHandle};
use crate::lifecycle::ModelSupplier;
use crate::metric::{Metric, encode_payload};
use crate::predictor::ModelKind;
use crate::report::Reporter;
use crate::stats::ServiceStats;
use serde::Serialize;
use std::sync::{Arc, PoisonError};
use tracing::{error, warn};

/// Forecast extracted at the configured horizon. `confidence` is absent for
/// the zero-value fallback substituted on structural extraction failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub value: f64,
    pub timestamp: i64,
    #[serde(rename = "confidence_level")]
    pub confidence: Option<f64>,
}

/// Outcome of the detection step.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub score: f64,
    pub likelihood: Option<f64>,
    /// +1 when the forecast sits above the observation, -1 below, 0 when
    /// the event did not qualify for the direction refinement.
    pub direction: i8,
}

/// Reporting thresholds; an anomaly must clear all applicable ones.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub score: f64,
    pub likelihood: f64,
    pub confidence: f64,
}

pub struct AnomalyPipeline {
    supplier: Arc<ModelSupplier>,
    reporter: Reporter,
    stats: Arc<ServiceStats>,
    thresholds: Thresholds,
    prediction_steps: u32,
}

impl AnomalyPipeline {
    pub fn new(
        supplier: Arc<ModelSupplier>,
        reporter: Reporter,
        stats: Arc<ServiceStats>,
        thresholds: Thresholds,
        prediction_steps: u32,
    ) -> Self {
        Self {
            supplier,
            reporter,
            stats,
            thresholds,
            prediction_steps,
        }
    }

    /// Run one metric through the pipeline. The boundary catch: whatever
    /// goes wrong for this metric is logged (payload encoded) and swallowed
    /// so the ingestion loop moves on.
    pub fn process(&self, metric: &Metric) {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle(metric);
        }));
        if outcome.is_err() {
            warn!(
                metric = %encode_payload(&format!("{:?}", metric)),
                "failed to analyze a metric; continuing with the next one"
            );
        }
    }

    fn handle(&self, metric: &Metric) {
        let admitted = self.supplier.admit(metric);

        let anomaly_model = self.supplier.model_for(metric, ModelKind::Anomaly, admitted);
        let likelihood_calc = self.supplier.likelihood_for(metric, admitted);
        let prediction_model = self
            .supplier
            .model_for(metric, ModelKind::Prediction, admitted);

        let (prediction, prediction_made) =
            self.prediction_step(metric, prediction_model.as_ref(), admitted);
        let detection = self.detection_step(
            metric,
            anomaly_model.as_ref(),
            likelihood_calc.as_ref(),
            prediction.as_ref(),
        );
        self.decide_and_report(metric, detection, prediction, prediction_made, admitted);

        self.stats.record_metric_timestamp(metric.timestamp);
        self.stats.inc_metrics_processed();
    }

    /// Feed the prediction model and extract the forecast at the configured
    /// horizon. A forecast is only used once a prior timestamp exists (the
    /// very first observation has nothing to extrapolate from). Structural
    /// extraction failure degrades to a zero-value prediction at the
    /// extrapolated future timestamp.
    fn prediction_step(
        &self,
        metric: &Metric,
        model: Option<&ModelHandle>,
        admitted: bool,
    ) -> (Option<Prediction>, bool) {
        let Some(handle) = model else {
            if admitted {
                error!(
                    metric = %metric.name,
                    "could not load or create a prediction model for this metric"
                );
            }
            return (None, false);
        };

        let inference = handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .step(metric.timestamp, metric.value);

        let last_timestamp = self.stats.last_metric_timestamp();
        let horizon = self.prediction_steps;
        let extrapolated =
            metric.timestamp + (metric.timestamp - last_timestamp) * horizon as i64;

        let (prediction, made) = match inference.forecast {
            Some(forecast) if last_timestamp > 0 => match forecast.at(horizon) {
                Some(point) => (
                    Some(Prediction {
                        value: point.value,
                        timestamp: extrapolated,
                        confidence: Some(point.confidence),
                    }),
                    true,
                ),
                None => {
                    warn!(
                        metric = %metric.name,
                        horizon,
                        "forecast did not cover the configured horizon; substituting a zero prediction"
                    );
                    (
                        Some(Prediction {
                            value: 0.0,
                            timestamp: extrapolated,
                            confidence: None,
                        }),
                        false,
                    )
                }
            },
            _ => (None, false),
        };

        if let Some(p) = &prediction {
            self.reporter.publish_prediction_series(metric, p);
        }
        (prediction, made)
    }

    /// Feed the anomaly model and the likelihood calculator. The direction
    /// is a refinement of an already-qualifying event: it is computed only
    /// when likelihood, score, and prediction confidence all clear their
    /// thresholds, and stays 0 otherwise.
    fn detection_step(
        &self,
        metric: &Metric,
        model: Option<&ModelHandle>,
        calc: Option<&LikelihoodHandle>,
        prediction: Option<&Prediction>,
    ) -> Option<Detection> {
        let handle = model?;

        let inference = handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .step(metric.timestamp, metric.value);

        let score = match inference.anomaly_score {
            Some(score) => score,
            None => {
                warn!(
                    metric = %metric.name,
                    "no anomaly score in the inference result; substituting zero"
                );
                0.0
            }
        };

        let likelihood = calc.map(|calc| {
            calc.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .anomaly_probability(metric.value, score, metric.timestamp)
        });

        let mut direction: i8 = 0;
        if let (Some(likelihood), Some(prediction)) = (likelihood, prediction) {
            if let Some(confidence) = prediction.confidence {
                if likelihood >= self.thresholds.likelihood
                    && score >= self.thresholds.score
                    && confidence >= self.thresholds.confidence
                {
                    direction = if prediction.value > metric.value { 1 } else { -1 };
                }
            }
        }

        Some(Detection {
            score,
            likelihood,
            direction,
        })
    }

    /// An anomaly is reportable iff detection was performed, likelihood and
    /// score are present and clear their thresholds, and, only when a
    /// prediction was made, its confidence clears the confidence threshold.
    /// The three anomaly series go out regardless of the reportability
    /// outcome.
    fn decide_and_report(
        &self,
        metric: &Metric,
        detection: Option<Detection>,
        prediction: Option<Prediction>,
        prediction_made: bool,
        admitted: bool,
    ) {
        let Some(detection) = detection else {
            if admitted {
                error!(
                    metric = %metric.name,
                    "could not load or create an anomaly detection model for this metric"
                );
            }
            return;
        };

        let confidence_ok = if prediction_made {
            prediction
                .as_ref()
                .and_then(|p| p.confidence)
                .is_some_and(|c| c >= self.thresholds.confidence)
        } else {
            true
        };
        let reportable = matches!(
            detection.likelihood,
            Some(likelihood) if likelihood >= self.thresholds.likelihood
        ) && detection.score >= self.thresholds.score
            && confidence_ok;

        if reportable {
            let payload = if prediction_made {
                prediction.as_ref()
            } else {
                None
            };
            self.reporter.report_anomaly(metric, &detection, payload);
        }

        self.reporter.publish_anomaly_series(metric, &detection);
    }
}
