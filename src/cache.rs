//! Model Cache
//!
//! One mutual-exclusion domain covers both maps (models keyed by kind +
//! metric name, likelihood calculators keyed by metric name alone) so the
//! autosave pass can observe a consistent view of both. No operation here
//! performs I/O; checkpoint reads and writes happen in the lifecycle and
//! persistence layers against the `Arc` handles this cache hands out.

use crate::predictor::{LikelihoodCalculator, ModelKind, Predictor};
use crate::stats::ServiceStats;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared handle to a cached model; a pipeline invocation clones it for the
/// duration of one pass only.
pub type ModelHandle = Arc<Mutex<Box<dyn Predictor>>>;

/// Shared handle to a cached likelihood calculator.
pub type LikelihoodHandle = Arc<Mutex<Box<dyn LikelihoodCalculator>>>;

/// Key of a cached model: the kind and the full dotted metric name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub kind: ModelKind,
    pub name: String,
}

impl ModelKey {
    pub fn new(kind: ModelKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

#[derive(Default)]
struct CacheInner {
    models: HashMap<ModelKey, ModelHandle>,
    likelihoods: HashMap<String, LikelihoodHandle>,
}

pub struct ModelCache {
    inner: Mutex<CacheInner>,
    stats: Arc<ServiceStats>,
}

impl ModelCache {
    pub fn new(stats: Arc<ServiceStats>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            stats,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains_model(&self, key: &ModelKey) -> bool {
        self.lock().models.contains_key(key)
    }

    pub fn model(&self, key: &ModelKey) -> Option<ModelHandle> {
        self.lock().models.get(key).cloned()
    }

    pub fn insert_model(&self, key: ModelKey, handle: ModelHandle) {
        let mut inner = self.lock();
        inner.models.insert(key, handle);
        self.stats.set_models_loaded(inner.models.len());
    }

    /// Combined count of cached anomaly and prediction models; likelihood
    /// calculators are deliberately excluded (they do not count against the
    /// admission quota).
    pub fn model_count(&self) -> usize {
        self.lock().models.len()
    }

    pub fn contains_likelihood(&self, name: &str) -> bool {
        self.lock().likelihoods.contains_key(name)
    }

    pub fn likelihood(&self, name: &str) -> Option<LikelihoodHandle> {
        self.lock().likelihoods.get(name).cloned()
    }

    pub fn insert_likelihood(&self, name: &str, handle: LikelihoodHandle) {
        let mut inner = self.lock();
        inner.likelihoods.insert(name.to_string(), handle);
        self.stats.set_calculators_loaded(inner.likelihoods.len());
    }

    pub fn likelihood_count(&self) -> usize {
        self.lock().likelihoods.len()
    }

    /// Stable snapshot of the model map for the autosave pass. Iterating
    /// the clone keeps per-entry checkpoint I/O outside the cache lock.
    pub fn snapshot_models(&self) -> Vec<(ModelKey, ModelHandle)> {
        self.lock()
            .models
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn snapshot_likelihoods(&self) -> Vec<(String, LikelihoodHandle)> {
        self.lock()
            .likelihoods
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Names of all cached metrics, for the status endpoint.
    pub fn metric_names(&self) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<String> = inner.models.keys().map(|k| k.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::Inference;
    use std::path::Path;

    struct NullModel;

    impl Predictor for NullModel {
        fn step(&mut self, _timestamp: i64, _value: f64) -> Inference {
            Inference::default()
        }

        fn save(&self, _path: &Path) -> Result<(), crate::predictor::ModelError> {
            Ok(())
        }
    }

    fn handle() -> ModelHandle {
        Arc::new(Mutex::new(Box::new(NullModel)))
    }

    fn cache() -> ModelCache {
        ModelCache::new(Arc::new(ServiceStats::new()))
    }

    #[test]
    fn test_model_namespaces_are_kind_scoped() {
        let cache = cache();
        cache.insert_model(ModelKey::new(ModelKind::Anomaly, "cpu.load"), handle());

        assert!(cache.contains_model(&ModelKey::new(ModelKind::Anomaly, "cpu.load")));
        assert!(!cache.contains_model(&ModelKey::new(ModelKind::Prediction, "cpu.load")));
        assert_eq!(cache.model_count(), 1);
    }

    #[test]
    fn test_likelihoods_do_not_count_against_models() {
        let cache = cache();
        cache.insert_model(ModelKey::new(ModelKind::Anomaly, "cpu.load"), handle());
        cache.insert_model(ModelKey::new(ModelKind::Prediction, "cpu.load"), handle());
        let calc: LikelihoodHandle = Arc::new(Mutex::new(
            Box::new(crate::backend::RollingLikelihood::default())
                as Box<dyn LikelihoodCalculator>,
        ));
        cache.insert_likelihood("cpu.load", calc);

        assert_eq!(cache.model_count(), 2);
        assert_eq!(cache.likelihood_count(), 1);
    }

    #[test]
    fn test_snapshot_is_detached_from_later_inserts() {
        let cache = cache();
        cache.insert_model(ModelKey::new(ModelKind::Anomaly, "a.b"), handle());
        let snapshot = cache.snapshot_models();
        cache.insert_model(ModelKey::new(ModelKind::Anomaly, "c.d"), handle());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(cache.model_count(), 2);
    }

    #[test]
    fn test_metric_names_deduplicate_kinds() {
        let cache = cache();
        cache.insert_model(ModelKey::new(ModelKind::Anomaly, "cpu.load"), handle());
        cache.insert_model(ModelKey::new(ModelKind::Prediction, "cpu.load"), handle());
        assert_eq!(cache.metric_names(), vec!["cpu.load".to_string()]);
    }
}
