use ndarray::Array2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{batch::Token, scores::ScoreIncrement};

/// The topic mixture inferred for a single item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThetaRow {
    pub item_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub weights: Vec<f32>,
}

/// Per-item topic mixtures for a processed set of batches.
#[derive(Debug, Clone, Default)]
pub struct ThetaMatrix {
    pub topic_names: Vec<String>,
    pub rows: Vec<ThetaRow>,
}

/// The aggregate update produced by processing one batch against a model.
///
/// Rows of `nwt` follow the batch's own token table, not the model's; the
/// consumer realigns them through its token index when folding. Score
/// payloads computed during the same pass ride along. The target model is
/// carried by the cache key, not duplicated here.
#[derive(Debug, Clone)]
pub struct ModelIncrement {
    pub batch_id: Uuid,
    pub tokens: Vec<Token>,
    pub nwt: Array2<f32>,
    pub theta: Vec<ThetaRow>,
    pub scores: Vec<ScoreIncrement>,
}

impl ModelIncrement {
    #[inline]
    pub fn topic_count(&self) -> usize {
        self.nwt.ncols()
    }
}
