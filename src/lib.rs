//! Pensu: Streaming Anomaly-Detection Service
//!
//! Consumes graphite-format metric lines from a queue, maintains one
//! forecasting model and one anomaly-scoring model per distinct metric
//! (plus a likelihood calculator in its own namespace), and emits
//! threshold-qualified anomaly reports and prediction/anomaly series back
//! onto queues. Model state survives restarts through a periodic,
//! fault-tolerant autosave pass.

pub mod backend;
pub mod cache;
pub mod config;
pub mod heartbeat;
pub mod lifecycle;
pub mod metric;
pub mod pipeline;
pub mod predictor;
pub mod report;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod stats;
pub mod store;
pub mod transport;

pub use cache::{ModelCache, ModelKey};
pub use config::Settings;
pub use lifecycle::{CreationLock, ModelSupplier};
pub use metric::Metric;
pub use pipeline::{AnomalyPipeline, Detection, Prediction, Thresholds};
pub use predictor::ModelKind;
pub use service::Analyzer;
pub use shutdown::ShutdownSignal;
pub use stats::ServiceStats;
pub use store::ModelStore;
