mod registry;

pub use registry::{InitSource, InitializeArgs, ModelRegistry};

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::batch::Token;

/// A named token-topic matrix.
///
/// One shape serves every role in the pipeline: `pwt` (the probability
/// model handed to consumers), `nwt`/`nwt_hat` (raw accumulators) and
/// `rwt` (the regularizer correction). Only `pwt` carries the
/// distribution invariant, and only the normalize step establishes it.
///
/// Instances are immutable once built; the registry swaps whole matrices
/// under a name instead of mutating them in place.
#[derive(Debug, Clone)]
pub struct TopicModel {
    name: String,
    topic_names: Vec<String>,
    tokens: Vec<Token>,
    token_index: HashMap<Token, usize>,
    weights: Array2<f32>,
}

impl TopicModel {
    /// # Panics
    /// - if `weights` is not (tokens x topic_names) shaped
    pub fn new(
        name: impl Into<String>,
        topic_names: Vec<String>,
        tokens: Vec<Token>,
        weights: Array2<f32>,
    ) -> Self {
        assert_eq!(weights.nrows(), tokens.len(), "one weight row per token");
        assert_eq!(
            weights.ncols(),
            topic_names.len(),
            "one weight column per topic"
        );

        let token_index = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();

        Self {
            name: name.into(),
            topic_names,
            tokens,
            token_index,
            weights,
        }
    }

    /// An all-zero matrix over the given vocabulary.
    pub fn zeroed(name: impl Into<String>, topic_names: Vec<String>, tokens: Vec<Token>) -> Self {
        let weights = Array2::zeros((tokens.len(), topic_names.len()));
        Self::new(name, topic_names, tokens, weights)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn topic_names(&self) -> &[String] {
        &self.topic_names
    }

    #[inline]
    pub fn topic_count(&self) -> usize {
        self.topic_names.len()
    }

    #[inline]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    #[inline]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    #[inline]
    pub fn weights(&self) -> ArrayView2<'_, f32> {
        self.weights.view()
    }

    #[inline]
    pub fn index_of(&self, token: &Token) -> Option<usize> {
        self.token_index.get(token).copied()
    }

    /// The topic weights of `token`, when the model knows it.
    #[inline]
    pub fn token_row(&self, token: &Token) -> Option<ArrayView1<'_, f32>> {
        self.index_of(token).map(|row| self.weights.row(row))
    }
}
