//! Checkpoint Storage and Autosave
//!
//! Save paths map a dotted metric name onto the filesystem by turning each
//! dot into a directory level under a kind-specific base. Because metric
//! `a.b.c` nests inside metric `a.b`'s directory, a leaf whose directory
//! has grown children (and so is non-empty without holding the checkpoint
//! marker file) is redirected into a reserved `.root` subdirectory.
//!
//! The autosave pass runs for the service lifetime on its own thread,
//! serialized against model creation by the shared creation lock.

use crate::cache::ModelCache;
use crate::lifecycle::CreationLock;
use crate::predictor::{
    LikelihoodCalculator, LikelihoodFactory, ModelError, ModelKind, Predictor, PredictorFactory,
};
use crate::shutdown::ShutdownSignal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reserved subdirectory for a metric whose own directory was claimed as a
/// parent by a longer metric name.
const ROOT_SUBDIR: &str = ".root";

pub struct ModelStore {
    anomaly_base: PathBuf,
    prediction_base: PathBuf,
    likelihood_base: PathBuf,
    model_checkpoint_filename: String,
    likelihood_filename: String,
}

impl ModelStore {
    pub fn new(
        anomaly_base: PathBuf,
        prediction_base: PathBuf,
        likelihood_base: PathBuf,
        model_checkpoint_filename: String,
        likelihood_filename: String,
    ) -> Self {
        Self {
            anomaly_base,
            prediction_base,
            likelihood_base,
            model_checkpoint_filename,
            likelihood_filename,
        }
    }

    fn resolve_dir(base: &Path, name: &str, marker: &str) -> PathBuf {
        let mut dir = base.to_path_buf();
        for segment in name.split('.') {
            dir.push(segment);
        }
        if dir.is_dir() {
            let non_empty = std::fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if non_empty && !dir.join(marker).is_file() {
                dir.push(ROOT_SUBDIR);
            }
        }
        dir
    }

    /// Checkpoint directory for a model, after collision resolution.
    pub fn model_dir(&self, name: &str, kind: ModelKind) -> PathBuf {
        let base = match kind {
            ModelKind::Anomaly => &self.anomaly_base,
            ModelKind::Prediction => &self.prediction_base,
        };
        Self::resolve_dir(base, name, &self.model_checkpoint_filename)
    }

    /// Checkpoint directory for a likelihood calculator.
    pub fn likelihood_dir(&self, name: &str) -> PathBuf {
        Self::resolve_dir(&self.likelihood_base, name, &self.likelihood_filename)
    }

    /// The calculator checkpoint file inside [`Self::likelihood_dir`].
    pub fn likelihood_file(&self, name: &str) -> PathBuf {
        self.likelihood_dir(name).join(&self.likelihood_filename)
    }

    fn model_file(&self, dir: &Path) -> PathBuf {
        dir.join(&self.model_checkpoint_filename)
    }

    /// Whether a model checkpoint exists under `dir`.
    pub fn has_model_checkpoint(&self, dir: &Path) -> bool {
        self.model_file(dir).is_file()
    }

    pub fn save_model(&self, dir: &Path, model: &dyn Predictor) -> Result<(), ModelError> {
        std::fs::create_dir_all(dir).map_err(|e| ModelError::Save(e.to_string()))?;
        model.save(&self.model_file(dir))
    }

    pub fn restore_model(
        &self,
        dir: &Path,
        factory: &dyn PredictorFactory,
    ) -> Result<Box<dyn Predictor>, ModelError> {
        factory.restore(&self.model_file(dir))
    }

    pub fn save_likelihood(
        &self,
        name: &str,
        calc: &dyn LikelihoodCalculator,
    ) -> Result<(), ModelError> {
        let dir = self.likelihood_dir(name);
        std::fs::create_dir_all(&dir).map_err(|e| ModelError::Save(e.to_string()))?;
        calc.save(&dir.join(&self.likelihood_filename))
    }

    pub fn restore_likelihood(
        &self,
        name: &str,
        factory: &dyn LikelihoodFactory,
    ) -> Result<Box<dyn LikelihoodCalculator>, ModelError> {
        factory.restore(&self.likelihood_file(name))
    }

    /// One complete checkpoint pass over every cached model and likelihood
    /// calculator. Holds the creation lock for the whole pass so no model
    /// is created mid-snapshot. Per-entry failures are logged and the pass
    /// continues; a shutdown request is honored between entries. Returns
    /// `true` if the pass was cut short by shutdown.
    pub fn run_autosave_pass(
        &self,
        cache: &ModelCache,
        creation: &CreationLock,
        shutdown: &ShutdownSignal,
    ) -> bool {
        let _guard = creation.guard();

        for (key, handle) in cache.snapshot_models() {
            if shutdown.is_requested() {
                return true;
            }
            let dir = self.model_dir(&key.name, key.kind);
            let model = handle.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(err) = self.save_model(&dir, model.as_ref()) {
                warn!(
                    metric = %key.name,
                    kind = %key.kind,
                    path = %dir.display(),
                    error = %err,
                    "autosave: could not save model checkpoint"
                );
            }
        }

        for (name, handle) in cache.snapshot_likelihoods() {
            if shutdown.is_requested() {
                return true;
            }
            let calc = handle.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(err) = self.save_likelihood(&name, calc.as_ref()) {
                warn!(
                    metric = %name,
                    error = %err,
                    "autosave: could not save likelihood calculator checkpoint"
                );
            }
        }

        false
    }

    /// Autosave loop: one full interval of grace after startup, then a pass
    /// every `interval_secs`, until shutdown.
    pub fn autosave(
        &self,
        interval_secs: u64,
        cache: Arc<ModelCache>,
        creation: CreationLock,
        shutdown: ShutdownSignal,
    ) {
        info!(interval_secs, "autosave loop started");
        if shutdown.wait_secs(interval_secs) {
            return;
        }
        loop {
            let interrupted = self.run_autosave_pass(&cache, &creation, &shutdown);
            if interrupted {
                info!("autosave loop stopping mid-pass on shutdown");
                return;
            }
            debug!(
                models = cache.model_count(),
                calculators = cache.likelihood_count(),
                "autosave pass complete"
            );
            if shutdown.wait_secs(interval_secs) {
                info!("autosave loop stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &Path) -> ModelStore {
        ModelStore::new(
            base.join("anomaly_models"),
            base.join("prediction_models"),
            base.join("likelihood_calculators"),
            "model.bin".to_string(),
            "pensu_anomaly_likelihood_calculator".to_string(),
        )
    }

    #[test]
    fn test_dotted_name_maps_to_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let dir = store.model_dir("a.b.c", ModelKind::Anomaly);
        assert_eq!(dir, tmp.path().join("anomaly_models").join("a/b/c"));
    }

    #[test]
    fn test_kinds_use_distinct_bases() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        assert_ne!(
            store.model_dir("a.b", ModelKind::Anomaly),
            store.model_dir("a.b", ModelKind::Prediction)
        );
    }

    #[test]
    fn test_leaf_redirected_to_root_once_children_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        // `a.b.c` persisted first: its directory nests under `a.b`'s.
        let child_dir = store.model_dir("a.b.c", ModelKind::Anomaly);
        std::fs::create_dir_all(&child_dir).unwrap();
        std::fs::write(child_dir.join("model.bin"), b"x").unwrap();

        // `a.b`'s directory now exists, is non-empty, and holds no marker:
        // it must be redirected into `.root` and never collide with the child.
        let leaf_dir = store.model_dir("a.b", ModelKind::Anomaly);
        assert_eq!(
            leaf_dir,
            tmp.path().join("anomaly_models").join("a/b").join(".root")
        );
        assert_ne!(leaf_dir, child_dir);
    }

    #[test]
    fn test_marker_holder_keeps_its_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        let dir = tmp.path().join("anomaly_models").join("a/b");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.bin"), b"x").unwrap();

        // Non-empty but marked as a real checkpoint: no redirect.
        assert_eq!(store.model_dir("a.b", ModelKind::Anomaly), dir);
    }

    #[test]
    fn test_empty_directory_not_redirected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let dir = tmp.path().join("anomaly_models").join("a/b");
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(store.model_dir("a.b", ModelKind::Anomaly), dir);
    }

    #[test]
    fn test_likelihood_file_under_its_own_base() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        assert_eq!(
            store.likelihood_file("a.b"),
            tmp.path()
                .join("likelihood_calculators")
                .join("a/b")
                .join("pensu_anomaly_likelihood_calculator")
        );
    }
}
