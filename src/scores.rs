use std::{collections::HashMap, fmt, num::NonZeroUsize};

use parking_lot::Mutex;

use crate::{
    error::{EngineErr, Result},
    increment::ModelIncrement,
    model::TopicModel,
};

/// The closed set of metric kinds, each with typed parameters.
///
/// Perplexity and theta sparsity are accumulated from increment payloads as
/// batches are processed; phi sparsity and top tokens are read off the
/// current `pwt` when a pass reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreKind {
    Perplexity,
    SparsityPhi { eps: f32 },
    SparsityTheta { eps: f32 },
    TopTokens { num_tokens: NonZeroUsize },
}

impl ScoreKind {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SparsityPhi { eps } | Self::SparsityTheta { eps } => {
                if !eps.is_finite() || *eps < 0.0 {
                    return Err(EngineErr::InvalidConfig(format!(
                        "sparsity eps must be finite and non-negative, got {eps}"
                    )));
                }
            }
            Self::Perplexity | Self::TopTokens { .. } => {}
        }
        Ok(())
    }

    /// Whether this metric is fed by per-batch increments.
    pub(crate) fn from_increments(&self) -> bool {
        matches!(self, Self::Perplexity | Self::SparsityTheta { .. })
    }
}

/// A named, configured metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreDescriptor {
    pub name: String,
    pub kind: ScoreKind,
}

impl ScoreDescriptor {
    pub fn new(name: impl Into<String>, kind: ScoreKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// The partial metric sums a processor attaches to one batch's increment.
#[derive(Debug, Clone)]
pub enum ScoreIncrement {
    Perplexity {
        name: String,
        log_likelihood: f64,
        token_weight: f64,
    },
    SparsityTheta {
        name: String,
        zero_weights: u64,
        total_weights: u64,
    },
}

/// The strongest tokens of one topic.
#[derive(Debug, Clone)]
pub struct TopicTokens {
    pub topic: String,
    pub entries: Vec<(String, f32)>,
}

/// A reported metric value.
#[derive(Debug, Clone)]
pub enum ScoreValue {
    Perplexity(f64),
    SparsityPhi(f64),
    SparsityTheta(f64),
    TopTokens(Vec<TopicTokens>),
}

/// One named metric as reported after a pass.
#[derive(Debug, Clone)]
pub struct PassScore {
    pub name: String,
    pub value: ScoreValue,
}

impl fmt::Display for PassScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            ScoreValue::Perplexity(v) => write!(f, "{} = {v:.4}", self.name),
            ScoreValue::SparsityPhi(v) | ScoreValue::SparsityTheta(v) => {
                write!(f, "{} = {v:.4}", self.name)
            }
            ScoreValue::TopTokens(topics) => {
                write!(f, "{}:", self.name)?;
                for topic in topics {
                    write!(f, " {}(", topic.topic)?;
                    for (i, (token, weight)) in topic.entries.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        write!(f, "{token}:{weight:.3}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
enum Accum {
    Perplexity { log_likelihood: f64, token_weight: f64 },
    SparsityTheta { zero_weights: u64, total_weights: u64 },
}

/// Collects metric payloads across a pass.
///
/// `accumulate` runs on worker threads via the ingestion loop's increment
/// callback; `reset`/`report` run on the controller thread between
/// barriers.
#[derive(Debug)]
pub struct ScoreAggregator {
    descriptors: Vec<ScoreDescriptor>,
    accum: Mutex<HashMap<String, Accum>>,
}

impl ScoreAggregator {
    pub fn new(descriptors: Vec<ScoreDescriptor>) -> Self {
        Self {
            descriptors,
            accum: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn descriptors(&self) -> &[ScoreDescriptor] {
        &self.descriptors
    }

    /// Folds one increment's payloads into the running sums.
    pub fn accumulate(&self, increment: &ModelIncrement) {
        let mut accum = self.accum.lock();
        for score in &increment.scores {
            match score {
                ScoreIncrement::Perplexity {
                    name,
                    log_likelihood,
                    token_weight,
                } => {
                    let entry = accum.entry(name.clone()).or_insert(Accum::Perplexity {
                        log_likelihood: 0.0,
                        token_weight: 0.0,
                    });
                    if let Accum::Perplexity {
                        log_likelihood: ll,
                        token_weight: tw,
                    } = entry
                    {
                        *ll += log_likelihood;
                        *tw += token_weight;
                    }
                }
                ScoreIncrement::SparsityTheta {
                    name,
                    zero_weights,
                    total_weights,
                } => {
                    let entry = accum.entry(name.clone()).or_insert(Accum::SparsityTheta {
                        zero_weights: 0,
                        total_weights: 0,
                    });
                    if let Accum::SparsityTheta {
                        zero_weights: zw,
                        total_weights: tot,
                    } = entry
                    {
                        *zw += zero_weights;
                        *tot += total_weights;
                    }
                }
            }
        }
    }

    /// Clears the running sums. Called at the start of each pass so
    /// per-pass aggregates do not bleed across passes.
    pub fn reset(&self) {
        self.accum.lock().clear();
    }

    /// Reports every configured metric that has data, in configuration
    /// order.
    pub fn report(&self, pwt: &TopicModel) -> Vec<PassScore> {
        let accum = self.accum.lock();
        let mut out = Vec::new();

        for descriptor in &self.descriptors {
            let value = match &descriptor.kind {
                ScoreKind::Perplexity => match accum.get(&descriptor.name) {
                    Some(Accum::Perplexity {
                        log_likelihood,
                        token_weight,
                    }) if *token_weight > 0.0 => {
                        Some(ScoreValue::Perplexity((-log_likelihood / token_weight).exp()))
                    }
                    _ => None,
                },
                ScoreKind::SparsityTheta { .. } => match accum.get(&descriptor.name) {
                    Some(Accum::SparsityTheta {
                        zero_weights,
                        total_weights,
                    }) if *total_weights > 0 => Some(ScoreValue::SparsityTheta(
                        *zero_weights as f64 / *total_weights as f64,
                    )),
                    _ => None,
                },
                ScoreKind::SparsityPhi { eps } => Some(sparsity_phi(pwt, *eps)),
                ScoreKind::TopTokens { num_tokens } => Some(top_tokens(pwt, num_tokens.get())),
            };
            if let Some(value) = value {
                out.push(PassScore {
                    name: descriptor.name.clone(),
                    value,
                });
            }
        }

        out
    }
}

fn sparsity_phi(pwt: &TopicModel, eps: f32) -> ScoreValue {
    let weights = pwt.weights();
    let total = weights.len();
    if total == 0 {
        return ScoreValue::SparsityPhi(0.0);
    }
    let zero = weights.iter().filter(|&&w| w <= eps).count();
    ScoreValue::SparsityPhi(zero as f64 / total as f64)
}

fn top_tokens(pwt: &TopicModel, num_tokens: usize) -> ScoreValue {
    let weights = pwt.weights();
    let mut topics = Vec::with_capacity(pwt.topic_count());

    for (t, topic) in pwt.topic_names().iter().enumerate() {
        let mut entries: Vec<(String, f32)> = pwt
            .tokens()
            .iter()
            .enumerate()
            .map(|(row, token)| (token.keyword.clone(), weights[(row, t)]))
            .collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1));
        entries.truncate(num_tokens);
        topics.push(TopicTokens {
            topic: topic.clone(),
            entries,
        });
    }

    ScoreValue::TopTokens(topics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Token;
    use ndarray::{array, Array2};
    use uuid::Uuid;

    fn increment_with(scores: Vec<ScoreIncrement>) -> ModelIncrement {
        ModelIncrement {
            batch_id: Uuid::new_v4(),
            tokens: Vec::new(),
            nwt: Array2::zeros((0, 2)),
            theta: Vec::new(),
            scores,
        }
    }

    fn pwt() -> TopicModel {
        TopicModel::new(
            "pwt",
            vec!["t0".into(), "t1".into()],
            vec![Token::plain("a"), Token::plain("b")],
            array![[1.0, 0.0], [0.25, 0.75]],
        )
    }

    #[test]
    fn perplexity_aggregates_across_increments() {
        let aggregator = ScoreAggregator::new(vec![ScoreDescriptor::new(
            "perplexity",
            ScoreKind::Perplexity,
        )]);

        for _ in 0..2 {
            aggregator.accumulate(&increment_with(vec![ScoreIncrement::Perplexity {
                name: "perplexity".into(),
                log_likelihood: 10.0_f64.ln() * -5.0,
                token_weight: 5.0,
            }]));
        }

        let scores = aggregator.report(&pwt());
        assert_eq!(scores.len(), 1);
        let ScoreValue::Perplexity(v) = scores[0].value else {
            panic!("expected perplexity");
        };
        assert!((v - 10.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_increment_side_sums() {
        let aggregator = ScoreAggregator::new(vec![ScoreDescriptor::new(
            "perplexity",
            ScoreKind::Perplexity,
        )]);
        aggregator.accumulate(&increment_with(vec![ScoreIncrement::Perplexity {
            name: "perplexity".into(),
            log_likelihood: -1.0,
            token_weight: 1.0,
        }]));
        aggregator.reset();

        assert!(aggregator.report(&pwt()).is_empty());
    }

    #[test]
    fn phi_side_metrics_read_the_model() {
        let aggregator = ScoreAggregator::new(vec![
            ScoreDescriptor::new("sparsity_phi", ScoreKind::SparsityPhi { eps: 1e-3 }),
            ScoreDescriptor::new(
                "top_tokens",
                ScoreKind::TopTokens {
                    num_tokens: NonZeroUsize::new(1).unwrap(),
                },
            ),
        ]);

        let scores = aggregator.report(&pwt());
        assert_eq!(scores.len(), 2);

        let ScoreValue::SparsityPhi(v) = scores[0].value else {
            panic!("expected sparsity");
        };
        assert!((v - 0.25).abs() < 1e-9);

        let ScoreValue::TopTokens(topics) = &scores[1].value else {
            panic!("expected top tokens");
        };
        assert_eq!(topics[0].entries[0].0, "a");
        assert_eq!(topics[1].entries[0].0, "b");
    }
}
