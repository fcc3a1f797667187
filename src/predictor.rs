//! Model Capability Seams
//!
//! The forecasting/anomaly algorithm is opaque to the rest of the service:
//! the pipeline only sees these traits. A predictor is an online, stateful
//! model fed one `(timestamp, value)` observation at a time; an anomaly-kind
//! predictor exposes an anomaly score, a prediction-kind predictor exposes a
//! multi-step forecast. Likelihood calculators live in their own namespace
//! and convert raw score history into a probability.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Which of the two per-metric models a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    Anomaly,
    Prediction,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anomaly => "anomaly",
            Self::Prediction => "prediction",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by model construction, restore, and checkpoint I/O.
#[derive(Debug, Clone)]
pub enum ModelError {
    Build(String),
    Restore(String),
    Save(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build(e) => write!(f, "model build failed: {}", e),
            Self::Restore(e) => write!(f, "model restore failed: {}", e),
            Self::Save(e) => write!(f, "model save failed: {}", e),
        }
    }
}

impl std::error::Error for ModelError {}

/// Forecast for one step-ahead horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub value: f64,
    pub confidence: f64,
}

/// Multi-step-ahead forecast, keyed by horizon. A horizon the model did not
/// produce is simply absent; the caller decides how to degrade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiStepForecast {
    steps: BTreeMap<u32, ForecastPoint>,
}

impl MultiStepForecast {
    pub fn insert(&mut self, horizon: u32, point: ForecastPoint) {
        self.steps.insert(horizon, point);
    }

    pub fn at(&self, horizon: u32) -> Option<ForecastPoint> {
        self.steps.get(&horizon).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Result of feeding one observation to a predictor. Expected-missing data
/// is an absent field, never an error.
#[derive(Debug, Clone, Default)]
pub struct Inference {
    pub anomaly_score: Option<f64>,
    pub forecast: Option<MultiStepForecast>,
}

/// Opaque online forecasting/anomaly-scoring model.
pub trait Predictor: Send {
    fn step(&mut self, timestamp: i64, value: f64) -> Inference;

    /// Write the model's checkpoint to `path` (a file inside the metric's
    /// checkpoint directory, which already exists).
    fn save(&self, path: &Path) -> Result<(), ModelError>;
}

/// Builds predictors, fresh or from a checkpoint file.
pub trait PredictorFactory: Send + Sync {
    fn create(
        &self,
        params: &ModelParams,
        prediction_steps: u32,
    ) -> Result<Box<dyn Predictor>, ModelError>;

    fn restore(&self, path: &Path) -> Result<Box<dyn Predictor>, ModelError>;
}

/// Opaque stateful score-history-to-probability converter.
pub trait LikelihoodCalculator: Send {
    fn anomaly_probability(&mut self, value: f64, score: f64, timestamp: i64) -> f64;

    fn save(&self, path: &Path) -> Result<(), ModelError>;
}

/// Builds likelihood calculators, fresh or from a checkpoint file.
pub trait LikelihoodFactory: Send + Sync {
    fn create(&self) -> Box<dyn LikelihoodCalculator>;

    fn restore(&self, path: &Path) -> Result<Box<dyn LikelihoodCalculator>, ModelError>;
}

/// Parameter profile a predictor is built from. Families with registered
/// profiles get their own tuning; everything else uses the kind's default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Level smoothing factor.
    pub alpha: f64,
    /// Trend smoothing factor.
    pub beta: f64,
    /// Seasonality smoothing factor.
    pub gamma: f64,
    /// Season length in observations.
    pub period: usize,
    /// Half-life (in observations) of the residual deviation estimate.
    pub residual_half_life: f64,
    /// Observations before scores and forecasts are emitted.
    pub warmup: usize,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.05,
            gamma: 0.1,
            period: 24,
            residual_half_life: 50.0,
            warmup: 24,
        }
    }
}

/// Registry mapping a metric family to its parameter profile, with an
/// always-present default per model kind. Populated at startup; replaces
/// the dynamic by-name module lookup of older deployments.
pub struct ProfileCatalog {
    profiles: HashMap<(ModelKind, String), ModelParams>,
    default_anomaly: ModelParams,
    default_prediction: ModelParams,
}

impl ProfileCatalog {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            default_anomaly: ModelParams::default(),
            default_prediction: ModelParams::default(),
        }
    }

    pub fn with_defaults(default_anomaly: ModelParams, default_prediction: ModelParams) -> Self {
        Self {
            profiles: HashMap::new(),
            default_anomaly,
            default_prediction,
        }
    }

    pub fn register(&mut self, kind: ModelKind, family: &str, params: ModelParams) {
        self.profiles.insert((kind, family.to_string()), params);
    }

    /// Family-specific profile if registered, else the kind's default.
    pub fn params_for(&self, kind: ModelKind, family: &str) -> &ModelParams {
        self.profiles
            .get(&(kind, family.to_string()))
            .unwrap_or(match kind {
                ModelKind::Anomaly => &self.default_anomaly,
                ModelKind::Prediction => &self.default_prediction,
            })
    }
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        Self::new()
    }
}
