use super::{RunStore, StoreError};
use crate::registry::RunRecord;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Run sequence as a single JSON document, replaced atomically on every change
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    records: Vec<RunRecord>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// the temporary file has to live next to the target for rename to be atomic
    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn read(&self) -> Vec<RunRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No run store yet, starting empty");
                return Vec::new();
            }
            Err(error) => {
                warn!(path = ?self.path, error = ?error, "Run store unreadable, starting empty");
                return Vec::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(error) => {
                warn!(path = ?self.path, error = %error, "Run store corrupt, starting empty");
                Vec::new()
            }
        }
    }
}

impl RunStore for FileStore {
    fn load(&mut self) -> Vec<RunRecord> {
        self.records = self.read();
        debug!(path = ?self.path, runs = self.records.len(), "Loaded run store");

        self.records.clone()
    }

    fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self.records.clone())
    }

    fn snapshot(&mut self, records: &[RunRecord]) -> Result<(), StoreError> {
        let directory = self.directory();
        let io_error = |source| StoreError::Io {
            path: directory.clone(),
            source,
        };

        let mut file = NamedTempFile::new_in(&directory).map_err(io_error)?;
        serde_json::to_writer_pretty(&mut file, records)?;
        file.as_file().sync_all().map_err(io_error)?;
        file.persist(&self.path)?;

        self.records = records.to_vec();

        Ok(())
    }
}
