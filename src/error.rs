use std::{error::Error, fmt, io, path::PathBuf, time::Duration};

use uuid::Uuid;

/// The engine's result type.
pub type Result<T> = std::result::Result<T, EngineErr>;

/// Engine failures.
///
/// Storage and configuration errors surface synchronously from the call
/// that raised them; processing errors surface when the controller harvests
/// increments after a barrier. Protocol violations indicate an internal bug.
#[derive(Debug)]
pub enum EngineErr {
    /// A batch or model file could not be read or written.
    Storage { path: PathBuf, source: io::Error },
    /// A batch or model file exists but does not parse.
    Malformed { path: PathBuf, detail: String },
    /// Invalid configuration, caught before any batch is dispatched.
    InvalidConfig(String),
    /// A worker failed to compute an increment for a batch.
    Processing { batch_id: Uuid, detail: String },
    /// Increment-cache misuse, e.g. publish without a matching begin.
    Protocol(&'static str),
    /// A barrier wait exceeded the caller-supplied bound.
    Timeout { waited: Duration },
    /// A named matrix is not present in the registry.
    UnknownModel { name: String },
}

impl EngineErr {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for EngineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage { path, source } => {
                write!(f, "storage error at {}: {source}", path.display())
            }
            Self::Malformed { path, detail } => {
                write!(f, "malformed file {}: {detail}", path.display())
            }
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Processing { batch_id, detail } => {
                write!(f, "processing failed for batch {batch_id}: {detail}")
            }
            Self::Protocol(msg) => write!(f, "cache protocol violation: {msg}"),
            Self::Timeout { waited } => {
                write!(f, "barrier wait timed out after {waited:?}")
            }
            Self::UnknownModel { name } => write!(f, "unknown model: {name}"),
        }
    }
}

impl Error for EngineErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A per-batch processing failure, as stored in the increment cache.
///
/// Kept separate from `EngineErr` so it can be cloned into every consumer
/// that waited on the same cache entry.
#[derive(Debug, Clone)]
pub struct ProcessingFailure {
    pub batch_id: Uuid,
    pub detail: String,
}

impl ProcessingFailure {
    pub fn new(batch_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            batch_id,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch {}: {}", self.batch_id, self.detail)
    }
}

impl From<ProcessingFailure> for EngineErr {
    fn from(value: ProcessingFailure) -> Self {
        Self::Processing {
            batch_id: value.batch_id,
            detail: value.detail,
        }
    }
}
