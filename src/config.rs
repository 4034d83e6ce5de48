use std::{collections::HashSet, num::NonZeroUsize, path::PathBuf, time::Duration};

use crate::{
    dictionary::{DfFilter, Dictionary},
    error::{EngineErr, Result},
    processor::ProcessOptions,
    regularizer::{PhiRegularizer, ThetaRegularizer},
    scores::ScoreDescriptor,
};

/// Decayed mini-batch update schedule.
///
/// After each model update `apply_weight = (tau0 + update_count)^(-kappa)`
/// (1.0 for the very first update of the run), so later mini-batches get a
/// progressively smaller marginal influence. `kappa` must lie in (0.5, 1]
/// for the average to converge; `tau0` is an initial-inertia offset.
#[derive(Debug, Clone, Copy)]
pub struct OnlineOptions {
    pub update_every: NonZeroUsize,
    pub tau0: f32,
    pub kappa: f32,
}

impl Default for OnlineOptions {
    fn default() -> Self {
        Self {
            // SAFETY: 1 is non-zero.
            update_every: NonZeroUsize::new(1).unwrap(),
            tau0: 1024.0,
            kappa: 0.7,
        }
    }
}

/// Everything a run consumes; validated eagerly, before any batch is
/// dispatched.
#[derive(Debug, Default)]
pub struct TrainerConfig {
    /// Folder holding the run's batch files.
    pub batch_folder: PathBuf,
    /// When set, per-item topic mixtures are cached here after each pass.
    pub disk_cache_folder: Option<PathBuf>,
    /// Worker pool size; defaults to available hardware concurrency.
    pub processors: Option<NonZeroUsize>,

    pub topic_names: Vec<String>,
    pub passes: usize,
    pub inner_iterations: Option<NonZeroUsize>,
    /// None selects the offline (full-batch) algorithm.
    pub online: Option<OnlineOptions>,

    /// Modality weights; empty keeps every modality at weight 1.
    pub class_weights: Vec<(String, f32)>,
    pub phi_regularizers: Vec<PhiRegularizer>,
    pub theta_regularizers: Vec<ThetaRegularizer>,
    pub scores: Vec<ScoreDescriptor>,

    /// Vocabulary source for model initialization; when absent the
    /// vocabulary is gathered from the batches through `df_filter`.
    pub dictionary: Option<Dictionary>,
    pub df_filter: DfFilter,
    /// Import this model file instead of initializing randomly.
    pub load_model: Option<PathBuf>,

    /// Upper bound for every barrier wait.
    pub wait_timeout: Option<Duration>,
    pub seed: u64,
}

impl TrainerConfig {
    pub fn new(batch_folder: impl Into<PathBuf>, topic_count: usize) -> Self {
        Self {
            batch_folder: batch_folder.into(),
            topic_names: topic_names(topic_count),
            passes: 10,
            ..Self::default()
        }
    }

    #[inline]
    pub fn topic_count(&self) -> usize {
        self.topic_names.len()
    }

    pub(crate) fn inner_iterations(&self) -> NonZeroUsize {
        // SAFETY: 10 is non-zero.
        self.inner_iterations
            .unwrap_or_else(|| NonZeroUsize::new(10).unwrap())
    }

    pub(crate) fn wait_timeout(&self) -> Duration {
        self.wait_timeout.unwrap_or(Duration::from_secs(600))
    }

    pub(crate) fn worker_count(&self) -> NonZeroUsize {
        self.processors.unwrap_or_else(|| {
            std::thread::available_parallelism()
                // SAFETY: 1 is non-zero.
                .unwrap_or_else(|_| NonZeroUsize::new(1).unwrap())
        })
    }

    pub(crate) fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            inner_iterations: self.inner_iterations(),
            class_weights: self.class_weights.clone(),
            theta_regularizers: self.theta_regularizers.clone(),
            scores: self.scores.clone(),
        }
    }

    /// Checks every enumerated option; any violation is reported before a
    /// single batch is dispatched.
    pub fn validate(&self) -> Result<()> {
        if self.topic_names.is_empty() {
            return Err(EngineErr::InvalidConfig("topic_names is empty".into()));
        }
        if self.topic_names.iter().collect::<HashSet<_>>().len() != self.topic_names.len() {
            return Err(EngineErr::InvalidConfig(
                "topic_names contains duplicates".into(),
            ));
        }
        if self.passes == 0 {
            return Err(EngineErr::InvalidConfig("passes must be at least 1".into()));
        }

        if let Some(online) = &self.online {
            if !online.kappa.is_finite() || online.kappa <= 0.5 || online.kappa > 1.0 {
                return Err(EngineErr::InvalidConfig(format!(
                    "kappa must lie in (0.5, 1], got {}",
                    online.kappa
                )));
            }
            if !online.tau0.is_finite() || online.tau0 < 0.0 {
                return Err(EngineErr::InvalidConfig(format!(
                    "tau0 must be finite and non-negative, got {}",
                    online.tau0
                )));
            }
        }

        for (class_id, weight) in &self.class_weights {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(EngineErr::InvalidConfig(format!(
                    "class weight for {class_id} must be finite and positive, got {weight}"
                )));
            }
        }

        for regularizer in &self.phi_regularizers {
            regularizer.validate()?;
        }
        for regularizer in &self.theta_regularizers {
            regularizer.validate()?;
        }

        let mut score_names = HashSet::new();
        for descriptor in &self.scores {
            if descriptor.name.is_empty() {
                return Err(EngineErr::InvalidConfig("score name is empty".into()));
            }
            if !score_names.insert(&descriptor.name) {
                return Err(EngineErr::InvalidConfig(format!(
                    "duplicate score name: {}",
                    descriptor.name
                )));
            }
            descriptor.kind.validate()?;
        }

        self.df_filter.validate()?;
        if let Some(dictionary) = &self.dictionary {
            if dictionary.is_empty() {
                return Err(EngineErr::InvalidConfig(
                    "the provided dictionary is empty".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Default topic names: `topic_0` .. `topic_{n-1}`.
pub fn topic_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("topic_{i}")).collect()
}
