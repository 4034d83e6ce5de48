//! Training engine for additively regularized topic models.
//!
//! A run turns a folder of immutable batch files into successive
//! refinements of a topic-by-word probability model: batches are processed
//! concurrently by a worker pool behind the [`ingestion::IngestionLoop`],
//! partial results meet in the [`cache::IncrementCache`], and the
//! [`trainer::Trainer`] folds them into the named matrices of the
//! [`model::ModelRegistry`] (merge, regularize, normalize) in either a
//! full-batch (offline) or decayed mini-batch (online) schedule.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod increment;
pub mod ingestion;
pub mod model;
pub mod processor;
pub mod regularizer;
pub mod scores;
pub mod store;
pub mod trainer;

pub use batch::{Batch, BatchItem, Token, DEFAULT_CLASS};
pub use config::{topic_names, OnlineOptions, TrainerConfig};
pub use error::{EngineErr, ProcessingFailure, Result};
pub use model::{ModelRegistry, TopicModel};
pub use processor::{EmProcessor, ProcessOptions, Processor};
pub use trainer::{PassReport, Trainer, NWT, NWT_HAT, PWT, RWT};
