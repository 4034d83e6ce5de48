use std::collections::{HashMap, HashSet};

use crate::{
    batch::Token,
    error::{EngineErr, Result},
    store::DiskGeneration,
};

/// A document-frequency bound, as an absolute document count or as a
/// fraction of the collection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DfBound {
    Items(usize),
    Fraction(f64),
}

impl DfBound {
    fn resolve(self, total_items: usize) -> f64 {
        match self {
            Self::Items(n) => n as f64,
            Self::Fraction(f) => f * total_items as f64,
        }
    }
}

/// Excludes tokens whose document frequency falls outside the given bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DfFilter {
    pub min: Option<DfBound>,
    pub max: Option<DfBound>,
}

impl DfFilter {
    pub fn validate(&self) -> Result<()> {
        for bound in [self.min, self.max].into_iter().flatten() {
            if let DfBound::Fraction(f) = bound {
                if !(0.0..=1.0).contains(&f) || !f.is_finite() {
                    return Err(EngineErr::InvalidConfig(format!(
                        "document-frequency fraction must lie in [0, 1], got {f}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn keeps(&self, df: usize, total_items: usize) -> bool {
        let df = df as f64;
        if let Some(min) = self.min {
            if df < min.resolve(total_items) {
                return false;
            }
        }
        if let Some(max) = self.max {
            if df > max.resolve(total_items) {
                return false;
            }
        }
        true
    }
}

/// An ordered token vocabulary with per-token document frequencies.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    tokens: Vec<Token>,
    document_frequency: Vec<usize>,
    total_items: usize,
}

impl Dictionary {
    /// A dictionary of known tokens with no frequency information.
    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        let document_frequency = vec![0; tokens.len()];
        Self {
            tokens,
            document_frequency,
            total_items: 0,
        }
    }

    /// Builds the vocabulary by scanning every batch in the generation,
    /// counting for each token the number of documents it occurs in.
    /// Tokens keep first-seen order.
    pub fn gather(generation: &DiskGeneration) -> Result<Self> {
        let mut index: HashMap<Token, usize> = HashMap::new();
        let mut dict = Self::default();

        for handle in generation.discover()? {
            let batch = generation.load(&handle)?;
            dict.total_items += batch.item_count();

            for item in &batch.items {
                let seen: HashSet<usize> = item.token_ids.iter().copied().collect();
                for tid in seen {
                    let token = &batch.tokens[tid];
                    let slot = *index.entry(token.clone()).or_insert_with(|| {
                        dict.tokens.push(token.clone());
                        dict.document_frequency.push(0);
                        dict.tokens.len() - 1
                    });
                    dict.document_frequency[slot] += 1;
                }
            }
        }

        Ok(dict)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[inline]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    #[inline]
    pub fn total_items(&self) -> usize {
        self.total_items
    }

    /// The tokens surviving the document-frequency filter, in order.
    pub fn filtered(&self, filter: &DfFilter) -> Vec<Token> {
        self.tokens
            .iter()
            .zip(&self.document_frequency)
            .filter(|(_, &df)| filter.keeps(df, self.total_items))
            .map(|(token, _)| token.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchItem};

    fn generation_with_corpus() -> (tempfile::TempDir, DiskGeneration) {
        let dir = tempfile::tempdir().unwrap();
        let generation = DiskGeneration::new(dir.path());

        // "common" appears in all 4 documents, "rare" in one.
        let tokens = vec![Token::plain("common"), Token::plain("rare")];
        let batch_a = Batch::new(
            tokens.clone(),
            vec![
                BatchItem::new(1, vec![0, 1], vec![3.0, 1.0]),
                BatchItem::new(2, vec![0], vec![2.0]),
            ],
        );
        let batch_b = Batch::new(
            tokens,
            vec![
                BatchItem::new(3, vec![0], vec![1.0]),
                BatchItem::new(4, vec![0], vec![4.0]),
            ],
        );
        generation.add_batch(&batch_a).unwrap();
        generation.add_batch(&batch_b).unwrap();

        (dir, generation)
    }

    #[test]
    fn gather_counts_documents_not_occurrences() {
        let (_dir, generation) = generation_with_corpus();
        let dict = Dictionary::gather(&generation).unwrap();

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.total_items(), 4);

        let df: HashMap<_, _> = dict
            .tokens()
            .iter()
            .zip(&dict.document_frequency)
            .map(|(t, &df)| (t.keyword.clone(), df))
            .collect();
        assert_eq!(df["common"], 4);
        assert_eq!(df["rare"], 1);
    }

    #[test]
    fn filter_by_count_and_fraction() {
        let (_dir, generation) = generation_with_corpus();
        let dict = Dictionary::gather(&generation).unwrap();

        let min_two = DfFilter {
            min: Some(DfBound::Items(2)),
            max: None,
        };
        let kept = dict.filtered(&min_two);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].keyword, "common");

        let max_half = DfFilter {
            min: None,
            max: Some(DfBound::Fraction(0.5)),
        };
        let kept = dict.filtered(&max_half);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].keyword, "rare");
    }

    #[test]
    fn fraction_out_of_range_is_rejected() {
        let filter = DfFilter {
            min: Some(DfBound::Fraction(1.5)),
            max: None,
        };
        assert!(matches!(
            filter.validate().unwrap_err(),
            EngineErr::InvalidConfig(_)
        ));
    }
}
