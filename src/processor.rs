use std::num::NonZeroUsize;

use ndarray::Array2;

use crate::{
    batch::Batch,
    error::ProcessingFailure,
    increment::{ModelIncrement, ThetaRow},
    model::TopicModel,
    regularizer::ThetaRegularizer,
    scores::{ScoreDescriptor, ScoreIncrement, ScoreKind},
};

/// Iteration parameters handed to the processor alongside every batch.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Topic-mixture sweeps per item.
    pub inner_iterations: NonZeroUsize,
    /// Modality weights; empty means every modality at weight 1. A token
    /// whose modality is missing from a non-empty list is ignored.
    pub class_weights: Vec<(String, f32)>,
    pub theta_regularizers: Vec<ThetaRegularizer>,
    /// Configured metrics; the processor computes the increment-side ones.
    pub scores: Vec<ScoreDescriptor>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            // SAFETY: 10 is non-zero.
            inner_iterations: NonZeroUsize::new(10).unwrap(),
            class_weights: Vec::new(),
            theta_regularizers: Vec::new(),
            scores: Vec::new(),
        }
    }
}

/// The per-batch computation the orchestration engine drives but never
/// looks inside: one call per (batch, model snapshot), returning the
/// batch's aggregate contribution or a failure.
pub trait Processor: Send + Sync {
    fn process(
        &self,
        batch: &Batch,
        pwt: &TopicModel,
        options: &ProcessOptions,
    ) -> std::result::Result<ModelIncrement, ProcessingFailure>;
}

/// The built-in processor: the standard EM estimation step.
///
/// For each item it refines a topic mixture over `inner_iterations`
/// sweeps, applying theta regularizers between sweeps, then distributes
/// each token occurrence across topics proportionally to
/// `pwt[token] * theta[item]` and emits that as the nwt contribution.
/// Deterministic: no randomness, occurrences folded in batch order.
#[derive(Debug, Default)]
pub struct EmProcessor;

/// One usable token occurrence of an item: batch token row, model row,
/// class-weighted count.
struct Occurrence {
    batch_row: usize,
    model_row: usize,
    count: f32,
}

impl Processor for EmProcessor {
    fn process(
        &self,
        batch: &Batch,
        pwt: &TopicModel,
        options: &ProcessOptions,
    ) -> std::result::Result<ModelIncrement, ProcessingFailure> {
        let topics = pwt.topic_count();
        if topics == 0 {
            return Err(ProcessingFailure::new(batch.id, "model has no topics"));
        }

        // Resolve each batch token once: model row and modality weight.
        let resolved: Vec<Option<(usize, f32)>> = batch
            .tokens
            .iter()
            .map(|token| {
                let weight = class_weight(&options.class_weights, &token.class_id)?;
                let model_row = pwt.index_of(token)?;
                Some((model_row, weight))
            })
            .collect();

        let weights = pwt.weights();
        let mut nwt = Array2::<f32>::zeros((batch.token_count(), topics));
        let mut theta_rows = Vec::with_capacity(batch.item_count());

        let mut log_likelihood = 0.0f64;
        let mut token_weight = 0.0f64;
        let mut theta_zero = vec![0u64; options.scores.len()];
        let mut theta_total = 0u64;

        let mut responsibility = vec![0.0f32; topics];

        for item in &batch.items {
            let occurrences: Vec<Occurrence> = item
                .token_ids
                .iter()
                .zip(&item.token_weights)
                .filter_map(|(&batch_row, &count)| {
                    let (model_row, class_weight) = resolved[batch_row]?;
                    Some(Occurrence {
                        batch_row,
                        model_row,
                        count: count * class_weight,
                    })
                })
                .collect();

            let mut theta = vec![1.0 / topics as f32; topics];

            for _ in 0..options.inner_iterations.get() {
                let mut next = vec![0.0f32; topics];
                for occ in &occurrences {
                    let row = weights.row(occ.model_row);
                    let mut z = 0.0f32;
                    for t in 0..topics {
                        responsibility[t] = row[t] * theta[t];
                        z += responsibility[t];
                    }
                    if z <= 0.0 {
                        continue;
                    }
                    for t in 0..topics {
                        next[t] += occ.count * responsibility[t] / z;
                    }
                }

                for regularizer in &options.theta_regularizers {
                    let correction = regularizer.correction();
                    for value in next.iter_mut() {
                        *value += correction;
                    }
                }

                let mut total = 0.0f32;
                for value in next.iter_mut() {
                    *value = value.max(0.0);
                    total += *value;
                }
                theta = if total > 0.0 {
                    next.iter().map(|v| v / total).collect()
                } else {
                    vec![1.0 / topics as f32; topics]
                };
            }

            // Final sweep: distribute counts with the converged mixture.
            for occ in &occurrences {
                let row = weights.row(occ.model_row);
                let mut z = 0.0f32;
                for t in 0..topics {
                    responsibility[t] = row[t] * theta[t];
                    z += responsibility[t];
                }
                if z <= 0.0 {
                    continue;
                }
                let mut out = nwt.row_mut(occ.batch_row);
                for t in 0..topics {
                    out[t] += occ.count * responsibility[t] / z;
                }

                log_likelihood += occ.count as f64 * (z.max(f32::MIN_POSITIVE) as f64).ln();
                token_weight += occ.count as f64;
            }

            for (slot, descriptor) in options.scores.iter().enumerate() {
                if let ScoreKind::SparsityTheta { eps } = descriptor.kind {
                    theta_zero[slot] += theta.iter().filter(|&&w| w <= eps).count() as u64;
                }
            }
            theta_total += topics as u64;

            theta_rows.push(ThetaRow {
                item_id: item.id,
                title: item.title.clone(),
                weights: theta,
            });
        }

        let scores = options
            .scores
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind.from_increments())
            .map(|(slot, descriptor)| match descriptor.kind {
                ScoreKind::Perplexity => ScoreIncrement::Perplexity {
                    name: descriptor.name.clone(),
                    log_likelihood,
                    token_weight,
                },
                ScoreKind::SparsityTheta { .. } => ScoreIncrement::SparsityTheta {
                    name: descriptor.name.clone(),
                    zero_weights: theta_zero[slot],
                    total_weights: theta_total,
                },
                // from_increments filtered the phi-side kinds out already.
                _ => unreachable!(),
            })
            .collect();

        Ok(ModelIncrement {
            batch_id: batch.id,
            tokens: batch.tokens.clone(),
            nwt,
            theta: theta_rows,
            scores,
        })
    }
}

fn class_weight(class_weights: &[(String, f32)], class_id: &str) -> Option<f32> {
    if class_weights.is_empty() {
        return Some(1.0);
    }
    class_weights
        .iter()
        .find(|(name, _)| name == class_id)
        .map(|(_, weight)| *weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchItem, Token};
    use ndarray::array;

    fn pwt() -> TopicModel {
        TopicModel::new(
            "pwt",
            vec!["t0".into(), "t1".into()],
            vec![Token::plain("a"), Token::plain("b")],
            array![[0.9, 0.1], [0.1, 0.9]],
        )
    }

    fn two_item_batch() -> Batch {
        let tokens = vec![Token::plain("a"), Token::plain("b")];
        Batch::new(
            tokens,
            vec![
                BatchItem::new(1, vec![0], vec![4.0]),
                BatchItem::new(2, vec![1], vec![6.0]),
            ],
        )
    }

    #[test]
    fn increment_preserves_batch_mass() {
        let increment = EmProcessor
            .process(&two_item_batch(), &pwt(), &ProcessOptions::default())
            .unwrap();

        // Every occurrence is distributed across topics, nothing lost.
        let total: f32 = increment.nwt.iter().sum();
        assert!((total - 10.0).abs() < 1e-4);
        assert_eq!(increment.theta.len(), 2);
    }

    #[test]
    fn mixtures_follow_dominant_topics() {
        let increment = EmProcessor
            .process(&two_item_batch(), &pwt(), &ProcessOptions::default())
            .unwrap();

        // Item 1 only contains "a", which topic t0 dominates.
        assert!(increment.theta[0].weights[0] > 0.9);
        // Item 2 only contains "b", dominated by t1.
        assert!(increment.theta[1].weights[1] > 0.9);
    }

    #[test]
    fn unknown_tokens_are_skipped() {
        let tokens = vec![Token::plain("a"), Token::plain("unseen")];
        let batch = Batch::new(tokens, vec![BatchItem::new(1, vec![0, 1], vec![1.0, 5.0])]);

        let increment = EmProcessor
            .process(&batch, &pwt(), &ProcessOptions::default())
            .unwrap();

        let unseen_mass: f32 = increment.nwt.row(1).sum();
        assert_eq!(unseen_mass, 0.0);
    }

    #[test]
    fn class_weights_scale_and_filter() {
        let tokens = vec![Token::plain("a"), Token::new("@labels", "b")];
        let batch = Batch::new(tokens, vec![BatchItem::new(1, vec![0, 1], vec![2.0, 2.0])]);

        let pwt = TopicModel::new(
            "pwt",
            vec!["t0".into(), "t1".into()],
            vec![Token::plain("a"), Token::new("@labels", "b")],
            array![[0.9, 0.1], [0.1, 0.9]],
        );

        let options = ProcessOptions {
            class_weights: vec![(crate::batch::DEFAULT_CLASS.into(), 2.0)],
            ..ProcessOptions::default()
        };
        let increment = EmProcessor.process(&batch, &pwt, &options).unwrap();

        // The default-modality token is doubled, the unlisted one dropped.
        assert!((increment.nwt.row(0).sum() - 4.0).abs() < 1e-4);
        assert_eq!(increment.nwt.row(1).sum(), 0.0);
    }

    #[test]
    fn deterministic_across_calls() {
        let batch = two_item_batch();
        let a = EmProcessor
            .process(&batch, &pwt(), &ProcessOptions::default())
            .unwrap();
        let b = EmProcessor
            .process(&batch, &pwt(), &ProcessOptions::default())
            .unwrap();
        assert_eq!(a.nwt, b.nwt);
    }

    #[test]
    fn perplexity_payload_counts_tokens() {
        let options = ProcessOptions {
            scores: vec![ScoreDescriptor::new("perplexity", ScoreKind::Perplexity)],
            ..ProcessOptions::default()
        };
        let increment = EmProcessor
            .process(&two_item_batch(), &pwt(), &options)
            .unwrap();

        let ScoreIncrement::Perplexity { token_weight, .. } = &increment.scores[0] else {
            panic!("expected perplexity payload");
        };
        assert!((token_weight - 10.0).abs() < 1e-9);
    }
}
