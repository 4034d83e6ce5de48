use std::{fs, sync::Arc};

use log::{info, warn};

use crate::{
    cache::IncrementCache,
    config::{OnlineOptions, TrainerConfig},
    error::{EngineErr, ProcessingFailure, Result},
    increment::{ModelIncrement, ThetaMatrix, ThetaRow},
    ingestion::{IngestionLoop, WorkItem},
    model::{InitSource, InitializeArgs, ModelRegistry, TopicModel},
    processor::{ProcessOptions, Processor},
    scores::ScoreAggregator,
    store::{BatchHandle, DiskGeneration},
};

/// The probability model handed to consumers.
pub const PWT: &str = "pwt";
/// The online algorithm's decayed running accumulator.
pub const NWT: &str = "nwt";
/// The accumulator the current (sub-)batch set folds into.
pub const NWT_HAT: &str = "nwt_hat";
/// The summed regularizer corrections.
pub const RWT: &str = "rwt";

/// Extension of the per-batch theta cache files.
const THETA_EXTENSION: &str = "theta";

/// What one pass reported.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub pass: usize,
    pub scores: Vec<crate::scores::PassScore>,
}

/// The iteration controller: executes full training passes by sequencing
/// Process, Merge, Regularize and Normalize over the model registry, with
/// the ingestion loop and increment cache as its computation substrate.
///
/// Runs on the caller's thread and only blocks at explicit barrier points.
/// Matrices are mutated exclusively here, strictly between barriers.
pub struct Trainer {
    config: TrainerConfig,
    registry: Arc<ModelRegistry>,
    generation: DiskGeneration,
    cache: Arc<IncrementCache>,
    ingestion: IngestionLoop,
    scores: Arc<ScoreAggregator>,
    options: Arc<ProcessOptions>,
    batches: Vec<BatchHandle>,
    /// Monotonically increasing across the whole run, never reset per
    /// pass; resetting it would change the online decay schedule.
    update_count: u64,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("update_count", &self.update_count)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// Validates the configuration, discovers the batch generation and
    /// initializes (or imports) the `pwt` model.
    pub fn new(config: TrainerConfig, processor: Arc<dyn Processor>) -> Result<Self> {
        config.validate()?;

        let generation = DiskGeneration::new(&config.batch_folder);
        let batches = generation.discover()?;
        if batches.is_empty() {
            return Err(EngineErr::InvalidConfig(format!(
                "no batches found in {}",
                config.batch_folder.display()
            )));
        }
        info!("using {} batches from {}", batches.len(), config.batch_folder.display());

        let registry = Arc::new(ModelRegistry::new());
        if let Some(path) = &config.load_model {
            registry.import_from(PWT, path)?;
        } else {
            let source = match config.dictionary.clone() {
                Some(dictionary) => InitSource::Dictionary(dictionary),
                None => InitSource::Batches {
                    generation: generation.clone(),
                    filter: config.df_filter,
                },
            };
            registry.initialize(InitializeArgs {
                name: PWT.into(),
                topic_names: config.topic_names.clone(),
                source,
                seed: config.seed,
            })?;
        }

        let cache = Arc::new(IncrementCache::new());
        let scores = Arc::new(ScoreAggregator::new(config.scores.clone()));
        let ingestion = IngestionLoop::new(
            generation.clone(),
            Arc::clone(&cache),
            processor,
            config.worker_count(),
        );
        {
            let scores = Arc::clone(&scores);
            ingestion.on_increment(move |increment| scores.accumulate(increment));
        }

        let options = Arc::new(config.process_options());
        Ok(Self {
            config,
            registry,
            generation,
            cache,
            ingestion,
            scores,
            options,
            batches,
            update_count: 0,
        })
    }

    #[inline]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    #[inline]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// The current probability model.
    pub fn pwt(&self) -> Result<Arc<TopicModel>> {
        self.registry.get(PWT)
    }

    /// Asks the run to stop; queued submissions are abandoned at the next
    /// safe point, in-flight computations complete.
    pub fn stop(&self) {
        self.ingestion.stop();
    }

    /// Discards a named matrix and evicts every cache entry computed for
    /// it, in whatever state.
    pub fn dispose_model(&self, name: &str) {
        self.registry.dispose(name);
        self.cache.dispose_model(name);
    }

    /// Persists a new batch into the run's generation and makes it visible
    /// to subsequent passes.
    pub fn add_batch(&mut self, batch: &crate::batch::Batch) -> Result<uuid::Uuid> {
        let id = self.generation.add_batch(batch)?;
        self.batches.push(self.generation.handle(id));
        Ok(id)
    }

    /// Executes every configured pass and reports per-pass scores.
    ///
    /// A processing failure aborts the current pass; the model produced by
    /// prior passes stays valid and retrievable.
    pub fn run(&mut self) -> Result<Vec<PassReport>> {
        let mut reports = Vec::with_capacity(self.config.passes);

        for pass in 0..self.config.passes {
            let report = match self.config.online {
                Some(online) => self.online_pass(pass, online)?,
                None => self.offline_pass(pass)?,
            };
            for score in &report.scores {
                info!("pass {}: {score}", pass + 1);
            }
            reports.push(report);
        }

        self.cleanup();
        Ok(reports)
    }

    /// One full-batch pass: every batch against the current `pwt`, one
    /// barrier, one fold, regularize, normalize.
    fn offline_pass(&mut self, pass: usize) -> Result<PassReport> {
        self.scores.reset();

        let handles = self.batches.clone();
        let increments = self.process_batches(&handles, NWT_HAT)?;

        let pwt = self.registry.get(PWT)?;
        self.registry.merge_increments(NWT_HAT, &pwt, &increments)?;
        self.regularize_and_normalize(NWT_HAT)?;
        self.write_theta_cache(&increments)?;

        self.finish_pass(pass)
    }

    /// One streaming pass: sub-batches of `update_every` batches, each
    /// folded into the decayed running accumulator `nwt`.
    fn online_pass(&mut self, pass: usize, online: OnlineOptions) -> Result<PassReport> {
        let handles = self.batches.clone();
        let mut subbatch: Vec<BatchHandle> = Vec::new();

        for (i, handle) in handles.iter().enumerate() {
            if i == 0 {
                // Per-pass aggregates must not bleed across passes, unlike
                // update_count.
                self.scores.reset();
            }
            subbatch.push(handle.clone());

            let exhausted = i + 1 == handles.len();
            if subbatch.len() < online.update_every.get() && !exhausted {
                continue;
            }

            let increments = self.process_batches(&subbatch, NWT_HAT)?;
            let pwt = self.registry.get(PWT)?;
            self.registry.merge_increments(NWT_HAT, &pwt, &increments)?;

            self.update_count += 1;
            let apply = apply_weight(self.update_count, &online);
            let decay = 1.0 - apply;
            self.registry.merge(&[(NWT, decay), (NWT_HAT, apply)], NWT)?;

            self.regularize_and_normalize(NWT)?;
            self.write_theta_cache(&increments)?;
            subbatch.clear();
        }

        self.finish_pass(pass)
    }

    /// Processes every batch against the final model without touching any
    /// accumulator, returning the per-item topic mixtures.
    pub fn transform(&mut self) -> Result<ThetaMatrix> {
        let handles = self.batches.clone();
        let increments = self.process_batches(&handles, PWT)?;

        let pwt = self.registry.get(PWT)?;
        Ok(ThetaMatrix {
            topic_names: pwt.topic_names().to_vec(),
            rows: increments
                .into_iter()
                .flat_map(|increment| increment.theta)
                .collect(),
        })
    }

    /// Submits `handles` against the current `pwt` snapshot, waits for the
    /// barrier and harvests every increment. A failed increment aborts the
    /// harvest after draining, so no stale entry survives into later
    /// passes.
    fn process_batches(
        &self,
        handles: &[BatchHandle],
        target: &str,
    ) -> Result<Vec<ModelIncrement>> {
        let pwt = self.registry.get(PWT)?;
        for handle in handles {
            let accepted = self.ingestion.submit(WorkItem {
                handle: handle.clone(),
                model: target.to_string(),
                pwt: Arc::clone(&pwt),
                options: Arc::clone(&self.options),
            });
            if !accepted {
                return Err(EngineErr::Protocol("submit on a stopped ingestion loop"));
            }
        }

        let timeout = self.config.wait_timeout();
        if !self.ingestion.wait_idle(timeout) {
            return Err(EngineErr::Timeout { waited: timeout });
        }

        let mut increments = Vec::with_capacity(handles.len());
        let mut failure: Option<ProcessingFailure> = None;
        for handle in handles {
            let key = (handle.id, target.to_string());
            match self.cache.wait_and_take(&key, timeout)? {
                Ok(increment) => increments.push(increment),
                Err(f) => failure = Some(f),
            }
        }

        if let Some(failure) = failure {
            warn!("aborting pass: {failure}");
            return Err(failure.into());
        }
        Ok(increments)
    }

    fn regularize_and_normalize(&self, nwt_source: &str) -> Result<()> {
        if self.config.phi_regularizers.is_empty() {
            self.registry.normalize(nwt_source, None, PWT)
        } else {
            self.registry
                .regularize(nwt_source, PWT, RWT, &self.config.phi_regularizers)?;
            self.registry.normalize(nwt_source, Some(RWT), PWT)
        }
    }

    fn finish_pass(&self, pass: usize) -> Result<PassReport> {
        let pwt = self.registry.get(PWT)?;
        Ok(PassReport {
            pass,
            scores: self.scores.report(&pwt),
        })
    }

    /// Persists the per-item mixtures of the given increments, one file
    /// per batch; a later pass overwrites with fresher mixtures.
    fn write_theta_cache(&self, increments: &[ModelIncrement]) -> Result<()> {
        let Some(folder) = &self.config.disk_cache_folder else {
            return Ok(());
        };
        fs::create_dir_all(folder).map_err(|e| EngineErr::storage(folder, e))?;

        for increment in increments {
            let path = folder.join(format!("{}.{THETA_EXTENSION}", increment.batch_id));
            let payload = serde_json::to_string(&increment.theta)
                .map_err(|e| EngineErr::malformed(&path, e.to_string()))?;
            fs::write(&path, payload).map_err(|e| EngineErr::storage(&path, e))?;
        }
        Ok(())
    }

    /// The most recently cached per-item mixtures, across all batches.
    pub fn theta_snapshot(&self) -> Result<ThetaMatrix> {
        let Some(folder) = &self.config.disk_cache_folder else {
            return Err(EngineErr::InvalidConfig(
                "no disk cache folder configured".into(),
            ));
        };

        let entries = fs::read_dir(folder).map_err(|e| EngineErr::storage(folder, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineErr::storage(folder, e))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == THETA_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut rows: Vec<ThetaRow> = Vec::new();
        for path in paths {
            let payload = fs::read_to_string(&path).map_err(|e| EngineErr::storage(&path, e))?;
            let mut batch_rows: Vec<ThetaRow> = serde_json::from_str(&payload)
                .map_err(|e| EngineErr::malformed(&path, e.to_string()))?;
            rows.append(&mut batch_rows);
        }

        Ok(ThetaMatrix {
            topic_names: self.config.topic_names.clone(),
            rows,
        })
    }

    /// Drops the run's intermediate matrices. Disposing an absent name is
    /// a no-op, so cleanup never fails.
    fn cleanup(&self) {
        self.registry.dispose(NWT_HAT);
        self.registry.dispose(RWT);
        self.cache.dispose_model(NWT_HAT);
    }
}

/// The weight the freshest sub-batch receives in the online update.
fn apply_weight(update_count: u64, online: &OnlineOptions) -> f32 {
    if update_count == 1 {
        1.0
    } else {
        (online.tau0 + update_count as f32).powf(-online.kappa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    #[test]
    fn first_update_applies_fully() {
        let online = OnlineOptions::default();
        assert_eq!(apply_weight(1, &online), 1.0);
    }

    #[test]
    fn later_updates_follow_the_decay_schedule() {
        let online = OnlineOptions {
            update_every: NonZeroUsize::new(1).unwrap(),
            tau0: 64.0,
            kappa: 0.7,
        };

        for update in 2..10u64 {
            let expected = (64.0 + update as f32).powf(-0.7);
            assert_eq!(apply_weight(update, &online), expected);
        }
    }

    #[test]
    fn decay_is_monotonically_decreasing() {
        let online = OnlineOptions::default();
        let mut previous = apply_weight(2, &online);
        for update in 3..100u64 {
            let current = apply_weight(update, &online);
            assert!(current < previous);
            previous = current;
        }
    }
}
