use std::{collections::HashMap, fs, path::Path, sync::Arc};

use log::{debug, info};
use ndarray::Array2;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use parking_lot::RwLock;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::TopicModel;
use crate::{
    batch::Token,
    dictionary::{DfFilter, Dictionary},
    error::{EngineErr, Result},
    increment::ModelIncrement,
    regularizer::PhiRegularizer,
    store::DiskGeneration,
};

/// Where the initial vocabulary of a model comes from.
pub enum InitSource {
    /// A prepared dictionary of known tokens.
    Dictionary(Dictionary),
    /// Scan the batch folder, optionally excluding tokens outside a
    /// document-frequency window.
    Batches {
        generation: DiskGeneration,
        filter: DfFilter,
    },
}

pub struct InitializeArgs {
    pub name: String,
    pub topic_names: Vec<String>,
    pub source: InitSource,
    pub seed: u64,
}

/// Versioned named matrices of one run.
///
/// Multiple named instances coexist (`pwt`, `nwt`, `nwt_hat`, `rwt`, plus
/// whatever callers add). Every operation builds a fresh matrix and then
/// remaps the destination name, so a concurrent reader holding a snapshot
/// never observes a partially written matrix.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<TopicModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the named matrix.
    pub fn get(&self, name: &str) -> Result<Arc<TopicModel>> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineErr::UnknownModel { name: name.into() })
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.models.read().keys().cloned().collect()
    }

    /// Remaps the model's name to this instance.
    pub fn set(&self, model: TopicModel) {
        let name = model.name().to_string();
        self.models.write().insert(name, Arc::new(model));
    }

    /// Removes the named matrix. Returns false when it was not present.
    pub fn dispose(&self, name: &str) -> bool {
        self.models.write().remove(name).is_some()
    }

    /// Creates a fresh model matrix with uniform-random rows.
    pub fn initialize(&self, args: InitializeArgs) -> Result<()> {
        if args.topic_names.is_empty() {
            return Err(EngineErr::InvalidConfig(
                "cannot initialize a model with no topics".into(),
            ));
        }

        let tokens = match args.source {
            InitSource::Dictionary(dictionary) => dictionary.tokens().to_vec(),
            InitSource::Batches { generation, filter } => {
                filter.validate()?;
                Dictionary::gather(&generation)?.filtered(&filter)
            }
        };
        if tokens.is_empty() {
            return Err(EngineErr::InvalidConfig(
                "model initialization produced an empty vocabulary".into(),
            ));
        }

        let topics = args.topic_names.len();
        let mut rng = StdRng::seed_from_u64(args.seed);
        // SAFETY: the (0, 1) range is statically valid.
        let distribution = Uniform::new(0.0f32, 1.0).unwrap();
        let mut weights = Array2::random_using((tokens.len(), topics), distribution, &mut rng);
        normalize_rows(&mut weights);

        info!(
            "initialized model {}: {} tokens, {topics} topics",
            args.name,
            tokens.len()
        );
        self.set(TopicModel::new(args.name, args.topic_names, tokens, weights));
        Ok(())
    }

    /// Computes `dest` as the weighted elementwise sum of the named
    /// sources, over the union of their vocabularies.
    ///
    /// A zero-weighted source may be absent from the registry; any other
    /// missing source is an error. All present sources must agree on the
    /// topic count.
    pub fn merge(&self, sources: &[(&str, f32)], dest: &str) -> Result<()> {
        let mut resolved = Vec::with_capacity(sources.len());
        for &(name, weight) in sources {
            match self.get(name) {
                Ok(model) => resolved.push((model, weight)),
                Err(_) if weight == 0.0 => {}
                Err(e) => return Err(e),
            }
        }

        let Some((first, _)) = resolved.first() else {
            return Err(EngineErr::InvalidConfig(
                "merge requires at least one present source".into(),
            ));
        };
        let topic_names = first.topic_names().to_vec();
        let topics = topic_names.len();
        for (model, _) in &resolved {
            if model.topic_count() != topics {
                return Err(EngineErr::InvalidConfig(format!(
                    "merge sources disagree on topic count: {} has {}, expected {topics}",
                    model.name(),
                    model.topic_count()
                )));
            }
        }

        let mut union: Vec<Token> = Vec::new();
        let mut index: HashMap<Token, usize> = HashMap::new();
        for (model, _) in &resolved {
            for token in model.tokens() {
                index.entry(token.clone()).or_insert_with(|| {
                    union.push(token.clone());
                    union.len() - 1
                });
            }
        }

        let mut weights = Array2::<f32>::zeros((union.len(), topics));
        for (model, weight) in &resolved {
            let source = model.weights();
            for (row, token) in model.tokens().iter().enumerate() {
                let target_row = index[token];
                for t in 0..topics {
                    weights[(target_row, t)] += weight * source[(row, t)];
                }
            }
        }

        debug!("merged {} sources into {dest}", resolved.len());
        self.set(TopicModel::new(dest, topic_names, union, weights));
        Ok(())
    }

    /// Folds per-batch increments into `dest`, shaped like `template`
    /// (weight 1 each; the fold is commutative, so arrival order does not
    /// matter).
    pub fn merge_increments(
        &self,
        dest: &str,
        template: &TopicModel,
        increments: &[ModelIncrement],
    ) -> Result<()> {
        let topics = template.topic_count();
        let mut weights = Array2::<f32>::zeros((template.token_count(), topics));

        for increment in increments {
            if increment.topic_count() != topics {
                return Err(EngineErr::Protocol("increment topic count mismatch"));
            }
            for (row, token) in increment.tokens.iter().enumerate() {
                let Some(target_row) = template.index_of(token) else {
                    continue;
                };
                for t in 0..topics {
                    weights[(target_row, t)] += increment.nwt[(row, t)];
                }
            }
        }

        self.set(TopicModel::new(
            dest,
            template.topic_names().to_vec(),
            template.tokens().to_vec(),
            weights,
        ));
        Ok(())
    }

    /// Builds `dest` as the summed tau-scaled corrections of the given
    /// regularizers, evaluated against the named accumulator and model.
    pub fn regularize(
        &self,
        nwt_source: &str,
        pwt_source: &str,
        dest: &str,
        regularizers: &[PhiRegularizer],
    ) -> Result<()> {
        let nwt = self.get(nwt_source)?;
        let pwt = self.get(pwt_source)?;

        let mut weights = Array2::<f32>::zeros((nwt.token_count(), nwt.topic_count()));
        for regularizer in regularizers {
            regularizer.apply(&nwt, &pwt, &mut weights);
        }

        self.set(TopicModel::new(
            dest,
            nwt.topic_names().to_vec(),
            nwt.tokens().to_vec(),
            weights,
        ));
        Ok(())
    }

    /// Restores the probability-distribution invariant: for every token the
    /// combined non-negative contributions are divided by their sum. A
    /// token whose total is not positive receives the uniform distribution
    /// instead of a division fault.
    pub fn normalize(&self, nwt_source: &str, rwt_source: Option<&str>, dest: &str) -> Result<()> {
        let nwt = self.get(nwt_source)?;
        let rwt = rwt_source.map(|name| self.get(name)).transpose()?;

        let topics = nwt.topic_count();
        let source = nwt.weights();
        let mut weights = Array2::<f32>::zeros((nwt.token_count(), topics));

        for (row, token) in nwt.tokens().iter().enumerate() {
            let correction = rwt.as_ref().and_then(|r| r.token_row(token));

            let mut total = 0.0f32;
            for t in 0..topics {
                let mut value = source[(row, t)];
                if let Some(correction) = &correction {
                    value += correction[t];
                }
                let value = value.max(0.0);
                weights[(row, t)] = value;
                total += value;
            }

            if total > 0.0 {
                for t in 0..topics {
                    weights[(row, t)] /= total;
                }
            } else {
                let uniform = 1.0 / topics as f32;
                for t in 0..topics {
                    weights[(row, t)] = uniform;
                }
            }
        }

        self.set(TopicModel::new(
            dest,
            nwt.topic_names().to_vec(),
            nwt.tokens().to_vec(),
            weights,
        ));
        Ok(())
    }

    /// Writes the named matrix to a single file.
    pub fn export_to(&self, name: &str, path: &Path) -> Result<()> {
        let model = self.get(name)?;
        let file = ModelFile {
            topic_names: model.topic_names().to_vec(),
            tokens: model.tokens().to_vec(),
            weights: model
                .weights()
                .rows()
                .into_iter()
                .map(|row| row.to_vec())
                .collect(),
        };

        let payload =
            serde_json::to_string(&file).map_err(|e| EngineErr::malformed(path, e.to_string()))?;
        fs::write(path, payload).map_err(|e| EngineErr::storage(path, e))?;

        info!("exported model {name} to {}", path.display());
        Ok(())
    }

    /// Reads a matrix file back under the given name.
    pub fn import_from(&self, name: &str, path: &Path) -> Result<()> {
        let payload = fs::read_to_string(path).map_err(|e| EngineErr::storage(path, e))?;
        let file: ModelFile =
            serde_json::from_str(&payload).map_err(|e| EngineErr::malformed(path, e.to_string()))?;

        let topics = file.topic_names.len();
        if file.weights.len() != file.tokens.len()
            || file.weights.iter().any(|row| row.len() != topics)
        {
            return Err(EngineErr::malformed(path, "weight shape mismatch"));
        }

        let flat: Vec<f32> = file.weights.into_iter().flatten().collect();
        let weights = Array2::from_shape_vec((file.tokens.len(), topics), flat)
            .map_err(|e| EngineErr::malformed(path, e.to_string()))?;

        info!("imported model {name} from {}", path.display());
        self.set(TopicModel::new(name, file.topic_names, file.tokens, weights));
        Ok(())
    }
}

/// On-disk shape of an exported matrix.
#[derive(Serialize, Deserialize)]
struct ModelFile {
    topic_names: Vec<String>,
    tokens: Vec<Token>,
    weights: Vec<Vec<f32>>,
}

fn normalize_rows(weights: &mut Array2<f32>) {
    let topics = weights.ncols();
    for mut row in weights.rows_mut() {
        let total: f32 = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|v| v / total);
        } else {
            row.fill(1.0 / topics as f32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use uuid::Uuid;

    fn model(name: &str, tokens: &[&str], weights: Array2<f32>) -> TopicModel {
        let tokens = tokens.iter().map(|k| Token::plain(*k)).collect();
        TopicModel::new(name, vec!["t0".into(), "t1".into()], tokens, weights)
    }

    #[test]
    fn initialize_from_dictionary_yields_stochastic_rows() {
        let registry = ModelRegistry::new();
        let dictionary =
            Dictionary::from_tokens(vec![Token::plain("a"), Token::plain("b"), Token::plain("c")]);

        registry
            .initialize(InitializeArgs {
                name: "pwt".into(),
                topic_names: vec!["t0".into(), "t1".into()],
                source: InitSource::Dictionary(dictionary),
                seed: 7,
            })
            .unwrap();

        let pwt = registry.get("pwt").unwrap();
        assert_eq!(pwt.token_count(), 3);
        for row in pwt.weights().rows() {
            let total: f32 = row.sum();
            assert!((total - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn initialize_is_deterministic_per_seed() {
        let tokens = vec![Token::plain("a"), Token::plain("b")];
        let registry = ModelRegistry::new();

        for name in ["first", "second"] {
            registry
                .initialize(InitializeArgs {
                    name: name.into(),
                    topic_names: vec!["t0".into(), "t1".into()],
                    source: InitSource::Dictionary(Dictionary::from_tokens(tokens.clone())),
                    seed: 99,
                })
                .unwrap();
        }

        let first = registry.get("first").unwrap();
        let second = registry.get("second").unwrap();
        assert_eq!(first.weights(), second.weights());
    }

    #[test]
    fn merge_weights_and_unions_vocabularies() {
        let registry = ModelRegistry::new();
        registry.set(model("left", &["a", "b"], array![[1.0, 0.0], [2.0, 2.0]]));
        registry.set(model("right", &["b", "c"], array![[4.0, 0.0], [0.0, 8.0]]));

        registry
            .merge(&[("left", 1.0), ("right", 0.5)], "sum")
            .unwrap();

        let sum = registry.get("sum").unwrap();
        assert_eq!(sum.token_count(), 3);
        assert_eq!(sum.token_row(&Token::plain("a")).unwrap()[0], 1.0);
        assert_eq!(sum.token_row(&Token::plain("b")).unwrap()[0], 4.0);
        assert_eq!(sum.token_row(&Token::plain("c")).unwrap()[1], 4.0);
    }

    #[test]
    fn merge_is_order_independent() {
        let registry = ModelRegistry::new();
        registry.set(model("a", &["x", "y"], array![[1.0, 2.0], [3.0, 4.0]]));
        registry.set(model("b", &["y", "x"], array![[0.5, 0.5], [0.25, 0.75]]));

        registry.merge(&[("a", 1.0), ("b", 1.0)], "ab").unwrap();
        registry.merge(&[("b", 1.0), ("a", 1.0)], "ba").unwrap();

        let ab = registry.get("ab").unwrap();
        let ba = registry.get("ba").unwrap();
        for token in [Token::plain("x"), Token::plain("y")] {
            let left = ab.token_row(&token).unwrap();
            let right = ba.token_row(&token).unwrap();
            for t in 0..2 {
                assert!((left[t] - right[t]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn merge_skips_absent_zero_weight_sources() {
        let registry = ModelRegistry::new();
        registry.set(model("present", &["a"], array![[1.0, 1.0]]));

        registry
            .merge(&[("missing", 0.0), ("present", 1.0)], "out")
            .unwrap();
        assert!(registry.get("out").is_ok());

        let err = registry
            .merge(&[("missing", 0.5), ("present", 1.0)], "out")
            .unwrap_err();
        assert!(matches!(err, EngineErr::UnknownModel { .. }));
    }

    #[test]
    fn merge_increments_realigns_tokens() {
        let registry = ModelRegistry::new();
        let template = model("pwt", &["a", "b"], array![[0.5, 0.5], [0.5, 0.5]]);

        let increment = ModelIncrement {
            batch_id: Uuid::new_v4(),
            // Batch order differs from the template's and carries a token
            // the model does not know.
            tokens: vec![Token::plain("b"), Token::plain("z"), Token::plain("a")],
            nwt: array![[1.0, 2.0], [9.0, 9.0], [3.0, 4.0]],
            theta: Vec::new(),
            scores: Vec::new(),
        };

        registry
            .merge_increments("nwt_hat", &template, &[increment])
            .unwrap();

        let nwt_hat = registry.get("nwt_hat").unwrap();
        assert_eq!(nwt_hat.token_row(&Token::plain("a")).unwrap()[1], 4.0);
        assert_eq!(nwt_hat.token_row(&Token::plain("b")).unwrap()[0], 1.0);
        assert!(nwt_hat.index_of(&Token::plain("z")).is_none());
    }

    #[test]
    fn normalize_restores_the_invariant() {
        let registry = ModelRegistry::new();
        registry.set(model("nwt", &["a", "b"], array![[3.0, 1.0], [0.0, 5.0]]));

        registry.normalize("nwt", None, "pwt").unwrap();

        let pwt = registry.get("pwt").unwrap();
        let a = pwt.token_row(&Token::plain("a")).unwrap();
        assert!((a[0] - 0.75).abs() < 1e-6);
        assert!((a[1] - 0.25).abs() < 1e-6);
        for row in pwt.weights().rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn normalize_applies_corrections_and_falls_back_to_uniform() {
        let registry = ModelRegistry::new();
        registry.set(model("nwt", &["a", "b"], array![[3.0, 1.0], [1.0, 1.0]]));
        // The correction wipes token "b" out entirely.
        registry.set(model("rwt", &["a", "b"], array![[1.0, 0.0], [-2.0, -2.0]]));

        registry.normalize("nwt", Some("rwt"), "pwt").unwrap();

        let pwt = registry.get("pwt").unwrap();
        let a = pwt.token_row(&Token::plain("a")).unwrap();
        assert!((a[0] - 0.8).abs() < 1e-6);
        assert!((a[1] - 0.2).abs() < 1e-6);

        let b = pwt.token_row(&Token::plain("b")).unwrap();
        assert!((b[0] - 0.5).abs() < 1e-6);
        assert!((b[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn export_import_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let registry = ModelRegistry::new();
        registry.set(model("pwt", &["a", "b"], array![[0.3, 0.7], [0.5, 0.5]]));
        registry.export_to("pwt", &path).unwrap();
        registry.import_from("restored", &path).unwrap();

        let original = registry.get("pwt").unwrap();
        let restored = registry.get("restored").unwrap();
        assert_eq!(original.tokens(), restored.tokens());
        assert_eq!(original.topic_names(), restored.topic_names());
        for (a, b) in original.weights().iter().zip(restored.weights().iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn get_unknown_model_errors() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.get("nope").unwrap_err(),
            EngineErr::UnknownModel { .. }
        ));
    }
}
