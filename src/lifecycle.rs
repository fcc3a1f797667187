//! Model Lifecycle Manager
//!
//! Get-or-create-or-restore for the per-metric models and likelihood
//! calculators. One coarse creation lock, shared by all kinds and by the
//! autosave pass, serializes disk checks against concurrent builders; it is
//! deliberately coarse because builds are rare relative to steady-state
//! lookups. The admission quota is evaluated once per metric (a snapshot
//! read) before any build attempt; ingestion is single-threaded, so the
//! quota cannot overshoot unless ingestion is ever parallelized.

use crate::cache::{LikelihoodHandle, ModelCache, ModelHandle, ModelKey};
use crate::metric::Metric;
use crate::predictor::{
    LikelihoodFactory, ModelKind, Predictor, PredictorFactory, ProfileCatalog,
};
use crate::store::ModelStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock serializing every model/calculator build and the autosave pass.
#[derive(Clone, Default)]
pub struct CreationLock {
    inner: Arc<Mutex<()>>,
}

impl CreationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ModelSupplier {
    cache: Arc<ModelCache>,
    store: Arc<ModelStore>,
    catalog: ProfileCatalog,
    predictor_factory: Arc<dyn PredictorFactory>,
    likelihood_factory: Arc<dyn LikelihoodFactory>,
    creation: CreationLock,
    prediction_steps: u32,
    max_allowed_models: usize,
    over_quota_cooldown: Duration,
    last_over_quota_warn: Mutex<Option<Instant>>,
}

impl ModelSupplier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ModelCache>,
        store: Arc<ModelStore>,
        catalog: ProfileCatalog,
        predictor_factory: Arc<dyn PredictorFactory>,
        likelihood_factory: Arc<dyn LikelihoodFactory>,
        creation: CreationLock,
        prediction_steps: u32,
        max_allowed_models: usize,
        over_quota_cooldown: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            catalog,
            predictor_factory,
            likelihood_factory,
            creation,
            prediction_steps,
            max_allowed_models,
            over_quota_cooldown,
            last_over_quota_warn: Mutex::new(None),
        }
    }

    pub fn creation_lock(&self) -> CreationLock {
        self.creation.clone()
    }

    /// Admission decision for one metric: may more models be created right
    /// now? Evaluated once per metric before any build attempt. Over-quota
    /// warnings are rate-limited to one per cooldown interval, however many
    /// metrics are rejected in between.
    pub fn admit(&self, metric: &Metric) -> bool {
        if self.cache.model_count() < self.max_allowed_models {
            return true;
        }
        let mut last = self
            .last_over_quota_warn
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.is_none_or(|at| at.elapsed() >= self.over_quota_cooldown) {
            warn!(
                metric = %metric.name,
                max_allowed_models = self.max_allowed_models,
                "model quota reached; no new models will be created"
            );
            *last = Some(Instant::now());
        }
        false
    }

    /// Get-or-build the model of `kind` for this metric. Fast path is a
    /// plain cache hit; otherwise the creation lock is taken, existence is
    /// re-checked (another caller may have built it while we waited), and
    /// only then a restore or fresh build runs. A build failure leaves the
    /// key absent so the next metric retries.
    pub fn model_for(&self, metric: &Metric, kind: ModelKind, admitted: bool) -> Option<ModelHandle> {
        let key = ModelKey::new(kind, &metric.name);
        if let Some(handle) = self.cache.model(&key) {
            return Some(handle);
        }

        let _guard = self.creation.guard();
        if let Some(handle) = self.cache.model(&key) {
            return Some(handle);
        }
        if !admitted {
            return None;
        }

        let dir = self.store.model_dir(&metric.name, kind);
        let built: Option<Box<dyn Predictor>> = if self.store.has_model_checkpoint(&dir) {
            match self.store.restore_model(&dir, self.predictor_factory.as_ref()) {
                Ok(model) => {
                    debug!(metric = %metric.name, kind = %kind, "model restored from checkpoint");
                    Some(model)
                }
                Err(err) => {
                    warn!(
                        metric = %metric.name,
                        kind = %kind,
                        error = %err,
                        "checkpoint restore failed; building a fresh model"
                    );
                    self.build_fresh(metric, kind)
                }
            }
        } else {
            self.build_fresh(metric, kind)
        };

        let handle: ModelHandle = Arc::new(Mutex::new(built?));
        self.cache.insert_model(key, handle.clone());
        Some(handle)
    }

    fn build_fresh(&self, metric: &Metric, kind: ModelKind) -> Option<Box<dyn Predictor>> {
        let params = self.catalog.params_for(kind, &metric.family);
        match self.predictor_factory.create(params, self.prediction_steps) {
            Ok(model) => {
                debug!(metric = %metric.name, kind = %kind, "model created from parameter profile");
                Some(model)
            }
            Err(err) => {
                warn!(
                    metric = %metric.name,
                    kind = %kind,
                    error = %err,
                    "model build failed; will retry on the next metric"
                );
                None
            }
        }
    }

    /// Get-or-build the likelihood calculator for this metric. Same shape
    /// as [`Self::model_for`] but in the likelihood namespace, against its
    /// own save path; a restore failure falls back to a fresh calculator
    /// rather than failing the metric.
    pub fn likelihood_for(&self, metric: &Metric, admitted: bool) -> Option<LikelihoodHandle> {
        if let Some(handle) = self.cache.likelihood(&metric.name) {
            return Some(handle);
        }

        let _guard = self.creation.guard();
        if let Some(handle) = self.cache.likelihood(&metric.name) {
            return Some(handle);
        }
        if !admitted {
            return None;
        }

        let calc = if self.store.likelihood_file(&metric.name).is_file() {
            match self
                .store
                .restore_likelihood(&metric.name, self.likelihood_factory.as_ref())
            {
                Ok(calc) => {
                    debug!(metric = %metric.name, "likelihood calculator restored from file");
                    calc
                }
                Err(err) => {
                    warn!(
                        metric = %metric.name,
                        error = %err,
                        "likelihood calculator restore failed; starting a fresh one"
                    );
                    self.likelihood_factory.create()
                }
            }
        } else {
            self.likelihood_factory.create()
        };

        let handle: LikelihoodHandle = Arc::new(Mutex::new(calc));
        self.cache.insert_likelihood(&metric.name, handle.clone());
        Some(handle)
    }
}
