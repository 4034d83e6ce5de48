use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The modality assigned to tokens that don't declare one.
pub const DEFAULT_CLASS: &str = "@default_class";

/// A vocabulary entry: a keyword qualified by its modality (class id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub class_id: String,
    pub keyword: String,
}

impl Token {
    pub fn new(class_id: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            keyword: keyword.into(),
        }
    }

    /// A token in the default modality.
    pub fn plain(keyword: impl Into<String>) -> Self {
        Self::new(DEFAULT_CLASS, keyword)
    }
}

/// One document of a batch: occurrence counts over the batch vocabulary.
///
/// `token_ids` index into the owning batch's `tokens`; `token_weights`
/// carry the matching occurrence counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub token_ids: Vec<usize>,
    pub token_weights: Vec<f32>,
}

impl BatchItem {
    /// # Panics
    /// - if `token_ids.len() != token_weights.len()`
    pub fn new(id: i32, token_ids: Vec<usize>, token_weights: Vec<f32>) -> Self {
        assert_eq!(
            token_ids.len(),
            token_weights.len(),
            "token_ids and token_weights must have same length"
        );
        Self {
            id,
            title: None,
            token_ids,
            token_weights,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// An immutable partition of the corpus, processed as one unit of work.
///
/// Written to disk once at creation and read many times afterwards; the
/// UUID is the batch's stable identity for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub tokens: Vec<Token>,
    pub items: Vec<BatchItem>,
}

impl Batch {
    /// Creates a batch with a freshly generated id.
    ///
    /// # Panics
    /// - if any item references a token id outside `tokens`
    pub fn new(tokens: Vec<Token>, items: Vec<BatchItem>) -> Self {
        for item in &items {
            for &tid in &item.token_ids {
                assert!(tid < tokens.len(), "item references token id {tid} out of range");
            }
        }
        Self {
            id: Uuid::new_v4(),
            tokens,
            items,
        }
    }

    #[inline]
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_basic() {
        let tokens = vec![Token::plain("alpha"), Token::plain("beta")];
        let items = vec![BatchItem::new(1, vec![0, 1], vec![2.0, 1.0])];
        let batch = Batch::new(tokens, items);

        assert_eq!(batch.token_count(), 2);
        assert_eq!(batch.item_count(), 1);
        assert!(!batch.id.is_nil());
    }

    #[test]
    #[should_panic]
    fn item_token_id_out_of_range() {
        let tokens = vec![Token::plain("alpha")];
        let items = vec![BatchItem::new(1, vec![3], vec![1.0])];
        Batch::new(tokens, items);
    }
}
