//! Reference Model Backend
//!
//! A lightweight, deterministic implementation of the predictor and
//! likelihood capabilities so the service runs end-to-end without an
//! external algorithm package: Holt-Winters additive smoothing for the
//! forecast, an exponentially-weighted residual estimate for the anomaly
//! score, and a rolling-window Gaussian tail for the likelihood.

use crate::predictor::{
    ForecastPoint, Inference, LikelihoodCalculator, LikelihoodFactory, ModelError, ModelParams,
    MultiStepForecast, Predictor, PredictorFactory,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

const CHECKPOINT_VERSION: u32 = 1;

/// Holt-Winters forecaster with an EWMA residual scorer. One instance
/// serves either model kind: anomaly consumers read the score, prediction
/// consumers read the forecast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoothingModel {
    version: u32,
    alpha: f64,
    beta: f64,
    gamma: f64,
    period: usize,
    warmup: usize,
    prediction_steps: u32,

    level: f64,
    trend: f64,
    seasonals: Vec<f64>,
    step: usize,
    initialized: bool,

    // EWMA of squared residuals, alpha derived from the configured half-life.
    residual_alpha: f64,
    residual_var: f64,
}

impl SmoothingModel {
    pub fn new(params: &ModelParams, prediction_steps: u32) -> Result<Self, ModelError> {
        if params.period == 0 {
            return Err(ModelError::Build("period must be non-zero".to_string()));
        }
        if params.residual_half_life <= 0.0 {
            return Err(ModelError::Build(
                "residual_half_life must be positive".to_string(),
            ));
        }
        let residual_alpha = 1.0 - (-std::f64::consts::LN_2 / params.residual_half_life).exp();
        Ok(Self {
            version: CHECKPOINT_VERSION,
            alpha: params.alpha,
            beta: params.beta,
            gamma: params.gamma,
            period: params.period,
            warmup: params.warmup,
            prediction_steps,
            level: 0.0,
            trend: 0.0,
            seasonals: vec![0.0; params.period],
            step: 0,
            initialized: false,
            residual_alpha,
            residual_var: 0.0,
        })
    }

    fn residual_std(&self) -> f64 {
        self.residual_var.sqrt()
    }

    /// Bounded monotone mapping of the normalized residual into [0, 1].
    fn score_from_residual(&self, residual: f64) -> f64 {
        let std = self.residual_std().max(1e-9);
        let z = residual.abs() / std;
        (z / (z + 3.0)).clamp(0.0, 1.0)
    }

    fn forecast(&self) -> MultiStepForecast {
        let mut forecast = MultiStepForecast::default();
        let base = self.level + self.trend;
        let relative_error = self.residual_std() / base.abs().max(1.0);
        let confidence = if relative_error < 0.1 {
            0.9
        } else if relative_error < 0.3 {
            0.7
        } else {
            0.5
        };
        for h in 1..=self.prediction_steps {
            let seasonal = self.seasonals[(self.step + h as usize - 1) % self.period];
            forecast.insert(
                h,
                ForecastPoint {
                    value: self.level + self.trend * h as f64 + seasonal,
                    confidence,
                },
            );
        }
        forecast
    }
}

impl Predictor for SmoothingModel {
    fn step(&mut self, _timestamp: i64, value: f64) -> Inference {
        let season_idx = self.step % self.period;
        let last_seasonal = self.seasonals[season_idx];

        if !self.initialized {
            if self.step == 0 {
                self.level = value;
                self.trend = 0.0;
            } else {
                self.trend = 0.5 * self.trend + 0.5 * (value - self.level);
                self.level = value;
            }
            if self.step >= self.period.max(self.warmup) {
                self.initialized = true;
            }
            self.step += 1;
            // Warm-up: no forecast yet, score pinned to zero.
            return Inference {
                anomaly_score: Some(0.0),
                forecast: None,
            };
        }

        let predicted = self.level + self.trend + last_seasonal;
        let residual = value - predicted;

        let last_level = self.level;
        let last_trend = self.trend;
        self.level =
            self.alpha * (value - last_seasonal) + (1.0 - self.alpha) * (last_level + last_trend);
        self.trend = self.beta * (self.level - last_level) + (1.0 - self.beta) * last_trend;
        self.seasonals[season_idx] =
            self.gamma * (value - self.level) + (1.0 - self.gamma) * last_seasonal;
        self.residual_var = (1.0 - self.residual_alpha)
            * (self.residual_var + self.residual_alpha * residual * residual);
        self.step += 1;

        Inference {
            anomaly_score: Some(self.score_from_residual(residual)),
            forecast: Some(self.forecast()),
        }
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let bytes = bincode::serialize(self).map_err(|e| ModelError::Save(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| ModelError::Save(e.to_string()))
    }
}

/// Factory for [`SmoothingModel`] construction and restore.
pub struct SmoothingFactory;

impl PredictorFactory for SmoothingFactory {
    fn create(
        &self,
        params: &ModelParams,
        prediction_steps: u32,
    ) -> Result<Box<dyn Predictor>, ModelError> {
        Ok(Box::new(SmoothingModel::new(params, prediction_steps)?))
    }

    fn restore(&self, path: &Path) -> Result<Box<dyn Predictor>, ModelError> {
        let bytes = std::fs::read(path).map_err(|e| ModelError::Restore(e.to_string()))?;
        let model: SmoothingModel =
            bincode::deserialize(&bytes).map_err(|e| ModelError::Restore(e.to_string()))?;
        if model.version > CHECKPOINT_VERSION {
            return Err(ModelError::Restore(format!(
                "unsupported checkpoint version {} (max supported: {})",
                model.version, CHECKPOINT_VERSION
            )));
        }
        Ok(Box::new(model))
    }
}

/// Rolling-window likelihood: the probability that the current anomaly
/// score is drawn from the recent score distribution's upper tail,
/// approximated with a logistic fit of the normal CDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingLikelihood {
    version: u32,
    window: VecDeque<f64>,
    capacity: usize,
    min_samples: usize,
}

impl RollingLikelihood {
    pub fn new(capacity: usize, min_samples: usize) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            window: VecDeque::with_capacity(capacity),
            capacity,
            min_samples,
        }
    }
}

impl Default for RollingLikelihood {
    fn default() -> Self {
        Self::new(288, 30)
    }
}

impl LikelihoodCalculator for RollingLikelihood {
    fn anomaly_probability(&mut self, _value: f64, score: f64, _timestamp: i64) -> f64 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(score);

        if self.window.len() < self.min_samples {
            return 0.5;
        }

        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let var = self.window.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
        let std = var.sqrt().max(1e-9);
        let z = (score - mean) / std;
        // Logistic approximation of the standard normal CDF.
        1.0 / (1.0 + (-1.702 * z).exp())
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let bytes = bincode::serialize(self).map_err(|e| ModelError::Save(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| ModelError::Save(e.to_string()))
    }
}

/// Factory for [`RollingLikelihood`].
pub struct RollingLikelihoodFactory;

impl LikelihoodFactory for RollingLikelihoodFactory {
    fn create(&self) -> Box<dyn LikelihoodCalculator> {
        Box::new(RollingLikelihood::default())
    }

    fn restore(&self, path: &Path) -> Result<Box<dyn LikelihoodCalculator>, ModelError> {
        let bytes = std::fs::read(path).map_err(|e| ModelError::Restore(e.to_string()))?;
        let calc: RollingLikelihood =
            bincode::deserialize(&bytes).map_err(|e| ModelError::Restore(e.to_string()))?;
        Ok(Box::new(calc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed_model(samples: usize) -> SmoothingModel {
        let params = ModelParams {
            period: 4,
            warmup: 4,
            ..ModelParams::default()
        };
        let mut model = SmoothingModel::new(&params, 5).unwrap();
        for i in 0..samples {
            model.step(i as i64, 10.0 + (i % 4) as f64);
        }
        model
    }

    #[test]
    fn test_no_forecast_during_warmup() {
        let params = ModelParams {
            period: 8,
            warmup: 8,
            ..ModelParams::default()
        };
        let mut model = SmoothingModel::new(&params, 5).unwrap();
        let inference = model.step(0, 1.0);
        assert!(inference.forecast.is_none());
        assert_eq!(inference.anomaly_score, Some(0.0));
    }

    #[test]
    fn test_forecast_covers_configured_horizon() {
        let mut model = fed_model(20);
        let inference = model.step(20, 10.0);
        let forecast = inference.forecast.expect("model is past warmup");
        assert!(forecast.at(5).is_some());
        assert!(forecast.at(6).is_none());
    }

    #[test]
    fn test_outlier_scores_above_steady_state() {
        let mut model = fed_model(50);
        let steady = model.step(50, 12.0).anomaly_score.unwrap();
        let mut spiked = fed_model(50);
        let spike = spiked.step(50, 500.0).anomaly_score.unwrap();
        assert!(spike > steady);
        assert!(spike <= 1.0);
    }

    #[test]
    fn test_checkpoint_round_trip_preserves_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");

        let mut original = fed_model(40);
        original.save(&path).unwrap();
        let mut restored = SmoothingFactory.restore(&path).unwrap();

        for i in 0..10 {
            let ts = 40 + i;
            let value = 10.0 + (i % 4) as f64;
            let a = original.step(ts, value);
            let b = restored.step(ts, value);
            assert_eq!(a.anomaly_score, b.anomaly_score);
        }
    }

    #[test]
    fn test_zero_period_rejected() {
        let params = ModelParams {
            period: 0,
            ..ModelParams::default()
        };
        assert!(SmoothingModel::new(&params, 5).is_err());
    }

    #[test]
    fn test_likelihood_uniform_before_min_samples() {
        let mut calc = RollingLikelihood::new(100, 10);
        for i in 0..9 {
            assert_eq!(calc.anomaly_probability(1.0, 0.1, i), 0.5);
        }
    }

    #[test]
    fn test_likelihood_rises_for_outlier_scores() {
        let mut calc = RollingLikelihood::new(100, 10);
        for i in 0..50 {
            calc.anomaly_probability(1.0, 0.1, i);
        }
        let p = calc.anomaly_probability(1.0, 0.95, 50);
        assert!(p > 0.9, "outlier score should sit in the upper tail, got {}", p);
    }

    #[test]
    fn test_likelihood_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calc.bin");

        let mut original = RollingLikelihood::new(100, 10);
        for i in 0..30 {
            original.anomaly_probability(1.0, 0.1, i);
        }
        original.save(&path).unwrap();
        let mut restored = RollingLikelihoodFactory.restore(&path).unwrap();

        let a = original.anomaly_probability(1.0, 0.4, 30);
        let b = restored.anomaly_probability(1.0, 0.4, 30);
        assert_eq!(a, b);
    }
}
