//! Pensu service entrypoint.
//!
//! Wires configuration, transport, the analyzer, its background threads,
//! and the status server; a Ctrl-C flips the shared shutdown signal and
//! every loop drains within about a second.

use pensu::config::Settings;
use pensu::predictor::ProfileCatalog;
use pensu::server::{StatusState, router};
use pensu::service::Analyzer;
use pensu::shutdown::ShutdownSignal;
use pensu::stats::ServiceStats;
use pensu::transport::{MemoryBroker, QueueConsumer, QueueProducer, connect_with_backoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let settings = match Settings::from_env() {
        Ok(settings) => Arc::new(settings),
        Err(err) => {
            error!(error = %err, "invalid configuration; cannot continue");
            std::process::exit(1);
        }
    };
    info!(instance_id = %settings.instance_id, "launching pensu");

    let shutdown = ShutdownSignal::new();
    let stats = Arc::new(ServiceStats::new());

    // In-process loopback broker; a real deployment swaps in a broker-backed
    // implementation of the same traits.
    let broker = MemoryBroker::new();
    let backoff = Duration::from_secs(settings.reconnect_backoff_secs);

    info!(client_id = %settings.producer_client_id, "connecting the producer");
    let Some(producer) = connect_with_backoff("producer", backoff, &shutdown, || {
        Ok::<_, pensu::transport::TransportError>(broker.producer())
    }) else {
        return;
    };
    let producer: Arc<dyn QueueProducer> = Arc::new(producer);

    info!(
        client_id = %settings.consumer_client_id,
        topic = %settings.raw_metrics_topic,
        "connecting the consumer"
    );
    let Some(consumer) = connect_with_backoff("consumer", backoff, &shutdown, || {
        Ok::<_, pensu::transport::TransportError>(broker.consumer(&settings.raw_metrics_topic))
    }) else {
        return;
    };

    let analyzer = Arc::new(Analyzer::new(
        settings.clone(),
        stats.clone(),
        producer,
        ProfileCatalog::new(),
        shutdown.clone(),
    ));

    let mut handles = analyzer.spawn_background();
    {
        let analyzer = analyzer.clone();
        let consumer: Box<dyn QueueConsumer> = Box::new(consumer);
        handles.push(
            std::thread::Builder::new()
                .name("pensu-analyzer".to_string())
                .spawn(move || analyzer.run_ingestion(consumer))
                .expect("failed to spawn analyzer thread"),
        );
    }

    let state = StatusState {
        instance_id: settings.instance_id.to_string(),
        config_gist: settings.gist(),
        stats: stats.clone(),
        cache: analyzer.cache(),
    };
    let addr = format!("{}:{}", settings.ping_listen_host, settings.ping_listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("failed to bind the status endpoint");
    info!(addr = %addr, "status endpoint listening");

    let signal = shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install the Ctrl-C handler");
            info!("shutdown requested; draining loops");
            signal.request();
        })
        .await
        .expect("status server crashed");

    shutdown.request();
    for handle in handles {
        let _ = handle.join();
    }
    info!("all loops drained; goodbye");
}
