//! Service Wiring and Ingestion Loop
//!
//! The analyzer owns the whole object graph: stats, cache, store, supplier,
//! pipeline, reporter. Ingestion is deliberately single-threaded; at most
//! one metric is inside the pipeline at a time, so two metrics can never
//! race on the same key, and the only concurrency is with the autosave and
//! heartbeat threads.

use crate::backend::{RollingLikelihoodFactory, SmoothingFactory};
use crate::cache::ModelCache;
use crate::config::Settings;
use crate::heartbeat::TopicHeartbeat;
use crate::lifecycle::{CreationLock, ModelSupplier};
use crate::metric::MetricParser;
use crate::pipeline::{AnomalyPipeline, Thresholds};
use crate::predictor::ProfileCatalog;
use crate::report::Reporter;
use crate::shutdown::ShutdownSignal;
use crate::stats::ServiceStats;
use crate::store::ModelStore;
use crate::transport::{QueueConsumer, QueueProducer, TransportError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long one consumer poll blocks before re-checking the shutdown flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Analyzer {
    settings: Arc<Settings>,
    stats: Arc<ServiceStats>,
    cache: Arc<ModelCache>,
    store: Arc<ModelStore>,
    supplier: Arc<ModelSupplier>,
    pipeline: AnomalyPipeline,
    parser: MetricParser,
    producer: Arc<dyn QueueProducer>,
    shutdown: ShutdownSignal,
}

impl Analyzer {
    pub fn new(
        settings: Arc<Settings>,
        stats: Arc<ServiceStats>,
        producer: Arc<dyn QueueProducer>,
        catalog: ProfileCatalog,
        shutdown: ShutdownSignal,
    ) -> Self {
        let cache = Arc::new(ModelCache::new(stats.clone()));
        let store = Arc::new(ModelStore::new(
            settings.anomaly_models_path.clone(),
            settings.prediction_models_path.clone(),
            settings.likelihood_calculators_path.clone(),
            settings.model_checkpoint_filename.clone(),
            settings.likelihood_calculator_filename.clone(),
        ));
        let supplier = Arc::new(ModelSupplier::new(
            cache.clone(),
            store.clone(),
            catalog,
            Arc::new(SmoothingFactory),
            Arc::new(RollingLikelihoodFactory),
            CreationLock::new(),
            settings.prediction_steps,
            settings.max_allowed_models,
            Duration::from_secs(settings.over_quota_log_cooldown_secs),
        ));
        let reporter = Reporter::new(
            producer.clone(),
            stats.clone(),
            settings.anomaly_reports_topic.clone(),
            settings.predictions_topic.clone(),
            settings.anomalies_metrics_topic.clone(),
            settings.metrics_prefix.clone(),
        );
        let pipeline = AnomalyPipeline::new(
            supplier.clone(),
            reporter,
            stats.clone(),
            Thresholds {
                score: settings.score_threshold,
                likelihood: settings.likelihood_threshold,
                confidence: settings.confidence_threshold,
            },
            settings.prediction_steps,
        );
        let parser = MetricParser::new(stats.clone());

        Self {
            settings,
            stats,
            cache,
            store,
            supplier,
            pipeline,
            parser,
            producer,
            shutdown,
        }
    }

    pub fn cache(&self) -> Arc<ModelCache> {
        self.cache.clone()
    }

    /// Launch the autosave and heartbeat threads. Autosave is skipped when
    /// the configured interval is zero.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.settings.autosave_interval_secs > 0 {
            let store = self.store.clone();
            let cache = self.cache.clone();
            let creation = self.supplier.creation_lock();
            let shutdown = self.shutdown.clone();
            let interval = self.settings.autosave_interval_secs;
            info!(interval, "launching the autosave thread");
            handles.push(
                std::thread::Builder::new()
                    .name("pensu-autosave".to_string())
                    .spawn(move || store.autosave(interval, cache, creation, shutdown))
                    .expect("failed to spawn autosave thread"),
            );
        } else {
            info!("models autosave is disabled");
        }

        let heartbeat = TopicHeartbeat::new(
            self.producer.clone(),
            self.settings.topics_list_topic.clone(),
            self.settings.raw_metrics_topic.clone(),
            self.settings.topics_report_interval_secs,
        );
        let shutdown = self.shutdown.clone();
        info!("launching the monitored-topic heartbeat thread");
        handles.push(
            std::thread::Builder::new()
                .name("pensu-heartbeat".to_string())
                .spawn(move || heartbeat.run(&shutdown))
                .expect("failed to spawn heartbeat thread"),
        );

        handles
    }

    /// The sequential metrics handling loop. Runs until shutdown or until
    /// the consumed topic closes.
    pub fn run_ingestion(&self, mut consumer: Box<dyn QueueConsumer>) {
        info!("starting the metrics handling loop");
        while !self.shutdown.is_requested() {
            let message = match consumer.poll(POLL_TIMEOUT) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(TransportError::Closed) => {
                    info!("metrics topic closed; stopping the ingestion loop");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "consumer poll failed");
                    if self
                        .shutdown
                        .wait_secs(self.settings.reconnect_backoff_secs)
                    {
                        return;
                    }
                    continue;
                }
            };
            self.stats.inc_raw_messages();
            self.ingest_line(&message);
        }
        info!("metrics handling loop stopped");
    }

    fn ingest_line(&self, message: &[u8]) {
        let Ok(raw) = std::str::from_utf8(message) else {
            warn!("ignoring a non-UTF-8 message from the metrics topic");
            return;
        };
        let raw = raw.trim_end_matches(['\r', '\n']);
        if raw.trim().is_empty() {
            debug!("ignoring an empty metric line");
            return;
        }

        let name = raw.split(' ').next().unwrap_or_default();
        if !self.settings.allowed_metrics_pattern.is_match(name) {
            debug!(metric = name, "metric does not match the allowed pattern; ignoring");
            return;
        }

        if let Some(metric) = self.parser.parse(raw) {
            self.pipeline.process(&metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    fn test_settings(base: &std::path::Path) -> Settings {
        let mut settings = Settings::from_env().expect("defaults must parse");
        settings.anomaly_models_path = base.join("anomaly_models");
        settings.prediction_models_path = base.join("prediction_models");
        settings.likelihood_calculators_path = base.join("likelihood_calculators");
        settings.autosave_interval_secs = 0;
        settings
    }

    fn analyzer(base: &std::path::Path, broker: &Arc<MemoryBroker>) -> Analyzer {
        let settings = Arc::new(test_settings(base));
        Analyzer::new(
            settings,
            Arc::new(ServiceStats::new()),
            Arc::new(broker.producer()),
            ProfileCatalog::new(),
            ShutdownSignal::new(),
        )
    }

    #[test]
    fn test_well_formed_line_builds_models() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let analyzer = analyzer(tmp.path(), &broker);

        analyzer.ingest_line(b"cpu.load 1.5 1700000000");
        // Anomaly + prediction models for the one metric.
        assert_eq!(analyzer.cache.model_count(), 2);
        assert_eq!(analyzer.cache.likelihood_count(), 1);
    }

    #[test]
    fn test_malformed_line_never_reaches_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let analyzer = analyzer(tmp.path(), &broker);

        analyzer.ingest_line(b"not three tokens");
        analyzer.ingest_line(b"nodots 1.0 1700000000");
        assert_eq!(analyzer.cache.model_count(), 0);
        // Received-but-rejected lines are still counted.
        assert_eq!(analyzer.stats.snapshot()["metrics_received"], 2);
    }

    #[test]
    fn test_filtered_metric_is_skipped_before_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let settings = {
            let mut s = test_settings(tmp.path());
            s.allowed_metrics_pattern = regex::Regex::new("^web\\.").unwrap();
            Arc::new(s)
        };
        let analyzer = Analyzer::new(
            settings,
            Arc::new(ServiceStats::new()),
            Arc::new(broker.producer()),
            ProfileCatalog::new(),
            ShutdownSignal::new(),
        );

        analyzer.ingest_line(b"db.queries 1.0 1700000000");
        assert_eq!(analyzer.cache.model_count(), 0);
        // Filtered lines never reach the parser, so nothing is received.
        assert_eq!(analyzer.stats.snapshot()["metrics_received"], 0);

        analyzer.ingest_line(b"web.hits 1.0 1700000000");
        assert_eq!(analyzer.cache.model_count(), 2);
    }

    #[test]
    fn test_ingestion_loop_exits_on_shutdown_within_a_second() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let analyzer = analyzer(tmp.path(), &broker);
        let shutdown = analyzer.shutdown.clone();
        let consumer = Box::new(broker.consumer("metrics"));

        let start = std::time::Instant::now();
        let handle = std::thread::spawn(move || analyzer.run_ingestion(consumer));
        std::thread::sleep(Duration::from_millis(300));
        shutdown.request();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
