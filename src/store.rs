use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::warn;
use uuid::Uuid;

use crate::{
    batch::Batch,
    error::{EngineErr, Result},
};

/// File extension recognized when scanning a batch folder.
pub const BATCH_EXTENSION: &str = "batch";

/// A discovered batch: stable identity plus the file that backs it.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    pub id: Uuid,
    pub path: PathBuf,
}

/// The set of batches visible to a run, backed by a single folder on disk.
///
/// Mutable only by addition; batch files are never rewritten or removed
/// while a run is active, so concurrent readers are always safe.
#[derive(Debug, Clone)]
pub struct DiskGeneration {
    folder: PathBuf,
}

impl DiskGeneration {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    #[inline]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Scans the folder for batch files, in sorted filename order.
    ///
    /// Re-runnable: a later scan sees every batch an earlier scan saw, plus
    /// any batches added in between. Files whose stem is not a UUID are
    /// skipped with a warning.
    pub fn discover(&self) -> Result<Vec<BatchHandle>> {
        let entries =
            fs::read_dir(&self.folder).map_err(|e| EngineErr::storage(&self.folder, e))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineErr::storage(&self.folder, e))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == BATCH_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            match Uuid::parse_str(stem) {
                Ok(id) => handles.push(BatchHandle { id, path }),
                Err(_) => warn!("skipping batch file without a UUID name: {}", path.display()),
            }
        }

        Ok(handles)
    }

    /// Persists a new batch and returns its identifier.
    ///
    /// Fails when the folder path is occupied by a regular file, the target
    /// batch file already exists, or the write itself fails.
    pub fn add_batch(&self, batch: &Batch) -> Result<Uuid> {
        if self.folder.exists() && !self.folder.is_dir() {
            return Err(EngineErr::storage(
                &self.folder,
                io::Error::new(io::ErrorKind::AlreadyExists, "path exists and is not a directory"),
            ));
        }
        fs::create_dir_all(&self.folder).map_err(|e| EngineErr::storage(&self.folder, e))?;

        let path = self.batch_path(batch.id);
        if path.exists() {
            return Err(EngineErr::storage(
                &path,
                io::Error::new(io::ErrorKind::AlreadyExists, "batch file already exists"),
            ));
        }

        let payload = serde_json::to_string(batch)
            .map_err(|e| EngineErr::malformed(&path, e.to_string()))?;
        fs::write(&path, payload).map_err(|e| EngineErr::storage(&path, e))?;

        Ok(batch.id)
    }

    /// The handle a batch with this id would have in the folder.
    pub fn handle(&self, id: Uuid) -> BatchHandle {
        BatchHandle {
            id,
            path: self.batch_path(id),
        }
    }

    /// Reads a batch back from disk.
    pub fn load(&self, handle: &BatchHandle) -> Result<Batch> {
        let payload =
            fs::read_to_string(&handle.path).map_err(|e| EngineErr::storage(&handle.path, e))?;
        serde_json::from_str(&payload).map_err(|e| EngineErr::malformed(&handle.path, e.to_string()))
    }

    fn batch_path(&self, id: Uuid) -> PathBuf {
        self.folder.join(format!("{id}.{BATCH_EXTENSION}"))
    }
}
