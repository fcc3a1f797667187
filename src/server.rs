//! Status and Introspection Endpoint
//!
//! A small axum server exposing `/ping` (instance identity, runtime stats,
//! and the configuration gist), `/health`, and `/metrics` (prometheus text
//! exposition). Read-only; nothing here mutates service state.

use crate::cache::ModelCache;
use crate::stats::ServiceStats;
use axum::{Json, Router, extract::State, routing::get};
use std::sync::Arc;

#[derive(Clone)]
pub struct StatusState {
    pub instance_id: String,
    pub config_gist: serde_json::Value,
    pub stats: Arc<ServiceStats>,
    pub cache: Arc<ModelCache>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn ping(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let mut info = state.stats.snapshot();
    info["models_list"] = serde_json::json!(state.cache.metric_names());
    Json(serde_json::json!({
        "response": "PONG",
        "instance_id": state.instance_id,
        "service_specific_info": info,
        "config": state.config_gist,
    }))
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<StatusState>) -> String {
    state.stats.encode_prometheus()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StatusState {
        let stats = Arc::new(ServiceStats::new());
        StatusState {
            instance_id: "test-instance".to_string(),
            config_gist: serde_json::json!({"max_allowed_models": "10"}),
            stats: stats.clone(),
            cache: Arc::new(ModelCache::new(stats)),
        }
    }

    #[tokio::test]
    async fn test_ping_reports_identity_and_stats() {
        let state = state();
        state.stats.inc_metrics_received();
        let Json(body) = ping(State(state)).await;
        assert_eq!(body["response"], "PONG");
        assert_eq!(body["instance_id"], "test-instance");
        assert_eq!(body["service_specific_info"]["metrics_received"], 1);
        assert_eq!(body["config"]["max_allowed_models"], "10");
    }

    #[tokio::test]
    async fn test_metrics_exposition_is_nonempty() {
        let body = metrics(State(state())).await;
        assert!(body.contains("pensu_metrics_received_total"));
    }
}
