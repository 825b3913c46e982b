pub mod file;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::{
    config::{ConfigErrors, StoreConfig},
    registry::RunRecord,
};
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write run store at {path:?}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to encode run records")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to replace run store")]
    Persist(#[from] tempfile::PersistError),
    #[cfg(feature = "sqlite")]
    #[error("SQLite query failed")]
    SQLite(#[from] rusqlite::Error),
}

/// Durable, ordered sequence of run records
pub trait RunStore {
    /// Read the persisted sequence at start-up.
    ///
    /// Missing or unreadable state yields an empty sequence and a warning,
    /// never an error.
    fn load(&mut self) -> Vec<RunRecord>;

    /// everything persisted so far, in submission order
    fn list(&self) -> Result<Vec<RunRecord>, StoreError>;

    /// replace the whole persisted sequence in one step
    fn snapshot(&mut self, records: &[RunRecord]) -> Result<(), StoreError>;

    /// persist one more record, the record is durable once this returns
    fn append(&mut self, record: &RunRecord) -> Result<(), StoreError> {
        let mut records = self.list()?;
        records.push(record.clone());

        self.snapshot(&records)
    }
}

/// All supported stores, selected by `store.name`
#[derive(Debug)]
pub enum Stores {
    Memory(MemoryStore),
    File(FileStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStore),
}

impl Stores {
    pub fn load(config: &StoreConfig) -> Result<Self, ConfigErrors> {
        match config {
            StoreConfig::Memory => Ok(Self::Memory(MemoryStore::default())),
            StoreConfig::File { path } => Ok(Self::File(FileStore::new(path.clone()))),
            #[cfg(feature = "sqlite")]
            StoreConfig::Sqlite { path } => Ok(Self::Sqlite(SqliteStore::load(path)?)),
            #[cfg(not(feature = "sqlite"))]
            StoreConfig::Sqlite { .. } => Err(ConfigErrors::UnsupportedStore("sqlite".to_owned())),
        }
    }
}

impl RunStore for Stores {
    fn load(&mut self) -> Vec<RunRecord> {
        match self {
            Self::Memory(store) => store.load(),
            Self::File(store) => store.load(),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(store) => store.load(),
        }
    }

    fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        match self {
            Self::Memory(store) => store.list(),
            Self::File(store) => store.list(),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(store) => store.list(),
        }
    }

    fn snapshot(&mut self, records: &[RunRecord]) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.snapshot(records),
            Self::File(store) => store.snapshot(records),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(store) => store.snapshot(records),
        }
    }

    fn append(&mut self, record: &RunRecord) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.append(record),
            Self::File(store) => store.append(record),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(store) => store.append(record),
        }
    }
}
