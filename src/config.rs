//! Environment-Derived Service Configuration
//!
//! Every tunable is read from a `PENSU_*` environment variable with a typed
//! default. A missing required value or an unparseable value is fatal at
//! startup; nothing here is reloaded at runtime.

use regex::Regex;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Errors raised while loading [`Settings`]. All of them abort startup.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// The value of an environment variable could not be parsed as the
    /// expected type.
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid {
                var,
                value,
                expected,
            } => {
                write!(f, "invalid value {:?} for {} (expected {})", value, var, expected)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Immutable service configuration, constructed once in `main` and shared by
/// reference with every component.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Random per-process identifier, exposed on `/ping` and resolvable into
    /// client ids via the `{{#instance_id}}` placeholder.
    pub instance_id: Uuid,

    // Persistence
    pub autosave_interval_secs: u64,
    pub anomaly_models_path: PathBuf,
    pub prediction_models_path: PathBuf,
    pub likelihood_calculators_path: PathBuf,
    pub model_checkpoint_filename: String,
    pub likelihood_calculator_filename: String,

    // Pipeline
    pub prediction_steps: u32,
    pub score_threshold: f64,
    pub likelihood_threshold: f64,
    pub confidence_threshold: f64,
    pub max_allowed_models: usize,
    pub over_quota_log_cooldown_secs: u64,
    pub allowed_metrics_pattern: Regex,
    /// Series-name template; the `{{#anomaly_metric}}` placeholder is
    /// replaced with the series kind (`anomaly_score`, `prediction`, ...).
    pub metrics_prefix: String,

    // Transport
    pub consumer_server: String,
    pub consumer_client_id: String,
    pub consumer_session_timeout_ms: u64,
    pub producer_server: String,
    pub producer_client_id: String,
    pub reconnect_backoff_secs: u64,
    pub raw_metrics_topic: String,
    pub anomaly_reports_topic: String,
    pub predictions_topic: String,
    pub anomalies_metrics_topic: String,
    pub topics_list_topic: String,
    pub topics_report_interval_secs: u64,

    // Status endpoint
    pub ping_listen_host: String,
    pub ping_listen_port: u16,
}

fn env_string(var: &'static str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(var: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match std::env::var(var) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            var,
            value: raw,
            expected,
        }),
        Err(_) => Ok(default),
    }
}

fn env_regex(var: &'static str, default: &str) -> Result<Regex, ConfigError> {
    let raw = env_string(var, default);
    Regex::new(&raw).map_err(|_| ConfigError::Invalid {
        var,
        value: raw,
        expected: "regular expression",
    })
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let instance_id = Uuid::new_v4();
        let time_started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let resolve = |raw: String| {
            raw.replace("{{#instance_id}}", &instance_id.to_string())
                .replace("{{#time_started}}", &time_started.to_string())
        };

        Ok(Self {
            instance_id,

            autosave_interval_secs: env_parse("PENSU_MODELS_AUTOSAVE_INTERVAL", 86_400, "integer")?,
            anomaly_models_path: PathBuf::from(env_string(
                "PENSU_ANOMALY_MODELS_PATH",
                "data/anomaly_models",
            )),
            prediction_models_path: PathBuf::from(env_string(
                "PENSU_PREDICTION_MODELS_PATH",
                "data/prediction_models",
            )),
            likelihood_calculators_path: PathBuf::from(env_string(
                "PENSU_LIKELIHOOD_CALCULATORS_PATH",
                "data/anomaly_likelihood_calculators",
            )),
            model_checkpoint_filename: env_string("PENSU_MODEL_CHECKPOINT_FILENAME", "model.bin"),
            likelihood_calculator_filename: env_string(
                "PENSU_ANOMALYCALC_FILENAME",
                "pensu_anomaly_likelihood_calculator",
            ),

            prediction_steps: env_parse("PENSU_PREDICTION_STEPS", 5, "integer")?,
            score_threshold: env_parse("PENSU_ANOMALY_SCORE_THRESHOLD", 0.99, "float")?,
            likelihood_threshold: env_parse("PENSU_ANOMALY_LIKELIHOOD_THRESHOLD", 0.99999, "float")?,
            confidence_threshold: env_parse("PENSU_MINIMUM_CONFIDENCE_FOR_REPORTING", 0.9, "float")?,
            max_allowed_models: env_parse("PENSU_MAX_ALLOWED_MODELS", 10, "integer")?,
            over_quota_log_cooldown_secs: env_parse(
                "PENSU_MIN_SECONDS_BETWEEN_OVER_QUOTA_LOG_MSG",
                300,
                "integer",
            )?,
            allowed_metrics_pattern: env_regex("PENSU_ALLOWED_TO_WORK_ON_METRICS", ".*")?,
            metrics_prefix: env_string(
                "PENSU_METRIC_NAMES_TEMPLATE",
                "pensu.{{#anomaly_metric}}.metrics_analyzer",
            ),

            consumer_server: env_string("PENSU_KAFKA_CONSUMER_SERVER", "kafka:9092"),
            consumer_client_id: resolve(env_string(
                "PENSU_KAFKA_CONSUMER_CLIENT_ID",
                "pensu_consumer_{{#instance_id}}_{{#time_started}}",
            )),
            consumer_session_timeout_ms: env_parse(
                "PENSU_KAFKA_CONSUMER_SESSION_TIMEOUT_MS",
                5_000,
                "integer",
            )?,
            producer_server: env_string("PENSU_KAFKA_PRODUCER_SERVER", "kafka:9092"),
            producer_client_id: resolve(env_string(
                "PENSU_KAFKA_PRODUCER_CLIENT_ID",
                "pensu_producer_{{#instance_id}}_{{#time_started}}",
            )),
            reconnect_backoff_secs: env_parse("PENSU_RECONNECT_BACKOFF_SECONDS", 10, "integer")?,
            raw_metrics_topic: env_string("PENSU_METRICS_KAFKA_TOPIC", "metrics"),
            anomaly_reports_topic: env_string(
                "PENSU_REPORTED_ANOMALIES_KAFKA_TOPIC",
                "pensu.htm.anomaly_metrics",
            ),
            predictions_topic: env_string(
                "PENSU_PREDICTION_METRICS_KAFKA_TOPIC",
                "pensu.htm.predictions",
            ),
            anomalies_metrics_topic: env_string(
                "PENSU_ANOMALIES_METRICS_KAFKA_TOPIC",
                "pensu_anomalies",
            ),
            topics_list_topic: env_string("PENSU_TOPICS_KAFKA_TOPIC", "pensu_monitored_topics"),
            topics_report_interval_secs: env_parse("PENSU_TOPICS_REPORT_INTERVAL", 10, "integer")?,

            ping_listen_host: env_string("PENSU_PING_LISTEN_HOST", "0.0.0.0"),
            ping_listen_port: env_parse("PENSU_PING_LISTEN_PORT", 6666, "integer")?,
        })
    }

    /// Flat string view of the configuration for the status endpoint.
    pub fn gist(&self) -> serde_json::Value {
        serde_json::json!({
            "instance_id": self.instance_id.to_string(),
            "autosave_models_interval": self.autosave_interval_secs.to_string(),
            "anomaly_models_path": self.anomaly_models_path.display().to_string(),
            "prediction_models_path": self.prediction_models_path.display().to_string(),
            "likelihood_calculators_path": self.likelihood_calculators_path.display().to_string(),
            "model_checkpoint_filename": self.model_checkpoint_filename,
            "likelihood_calculator_filename": self.likelihood_calculator_filename,
            "prediction_steps": self.prediction_steps.to_string(),
            "anomaly_score_threshold_for_reporting": self.score_threshold.to_string(),
            "anomaly_likelihood_threshold_for_reporting": self.likelihood_threshold.to_string(),
            "minimum_confidence_for_reporting": self.confidence_threshold.to_string(),
            "max_allowed_models": self.max_allowed_models.to_string(),
            "allowed_to_work_on_metrics_pattern": self.allowed_metrics_pattern.as_str(),
            "metrics_prefix": self.metrics_prefix,
            "kafka_consumer_server": self.consumer_server,
            "kafka_consumer_client_id": self.consumer_client_id,
            "kafka_consumer_session_timeout": self.consumer_session_timeout_ms.to_string(),
            "reconnect_backoff_seconds": self.reconnect_backoff_secs.to_string(),
            "kafka_producer_server": self.producer_server,
            "kafka_producer_client_id": self.producer_client_id,
            "raw_metrics_kafka_topic": self.raw_metrics_topic,
            "anomaly_reports_kafka_topic": self.anomaly_reports_topic,
            "predictions_metrics_kafka_topic": self.predictions_topic,
            "anomalies_metrics_kafka_topic": self.anomalies_metrics_topic,
            "topics_list_topic": self.topics_list_topic,
            "topics_list_report_interval": self.topics_report_interval_secs.to_string(),
            "ping_listen_host": self.ping_listen_host,
            "ping_listen_port": self.ping_listen_port.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_environment() {
        let settings = Settings::from_env().expect("defaults must parse");
        assert_eq!(settings.prediction_steps, 5);
        assert_eq!(settings.max_allowed_models, 10);
        assert_eq!(settings.likelihood_threshold, 0.99999);
        assert_eq!(settings.score_threshold, 0.99);
        assert!(settings.allowed_metrics_pattern.is_match("any.metric.name"));
    }

    #[test]
    fn test_client_id_placeholders_resolved() {
        let settings = Settings::from_env().expect("defaults must parse");
        assert!(!settings.consumer_client_id.contains("{{#instance_id}}"));
        assert!(!settings.consumer_client_id.contains("{{#time_started}}"));
        assert!(
            settings
                .consumer_client_id
                .contains(&settings.instance_id.to_string())
        );
    }

    #[test]
    fn test_gist_masks_nothing_but_stringifies_everything() {
        let settings = Settings::from_env().expect("defaults must parse");
        let gist = settings.gist();
        assert_eq!(gist["max_allowed_models"], "10");
        assert_eq!(gist["raw_metrics_kafka_topic"], "metrics");
    }
}
