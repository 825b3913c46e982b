use super::{RunStore, StoreError};
use crate::registry::RunRecord;

/// Keeps runs for the lifetime of the process only
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<RunRecord>,
}

impl RunStore for MemoryStore {
    fn load(&mut self) -> Vec<RunRecord> {
        self.records.clone()
    }

    fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self.records.clone())
    }

    fn snapshot(&mut self, records: &[RunRecord]) -> Result<(), StoreError> {
        self.records = records.to_vec();
        Ok(())
    }

    fn append(&mut self, record: &RunRecord) -> Result<(), StoreError> {
        self.records.push(record.clone());
        Ok(())
    }
}
