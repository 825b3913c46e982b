use super::{RunStore, StoreError};
use crate::registry::RunRecord;
use rusqlite::{params, Connection, ErrorCode};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

pub const SQL_SCHEMA: &str = "create table if not exists runs (
    position integer primary key autoincrement,
    reference text not null unique,
    record text not null
);";

/// Run sequence in a SQLite table, one JSON encoded record per row
#[derive(Debug)]
pub struct SqliteStore {
    connection: Connection,
}

fn is_corrupt(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

impl SqliteStore {
    fn open(path: &Path) -> Result<Connection, rusqlite::Error> {
        let connection = Connection::open(path)?;
        connection.execute(SQL_SCHEMA, [])?;
        info!(path = ?path, "Applied SQL schema");

        Ok(connection)
    }

    /// Open the database at `path`, a corrupt file is moved to `<path>.corrupt` and replaced
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let connection = match Self::open(path) {
            Ok(connection) => connection,
            Err(error) if is_corrupt(&error) => {
                let mut aside = path.as_os_str().to_owned();
                aside.push(".corrupt");
                let aside = PathBuf::from(aside);

                warn!(path = ?path, moved_to = ?aside, error = %error, "Run database corrupt, starting empty");
                fs::rename(path, &aside).map_err(|source| StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;

                Self::open(path)?
            }
            Err(error) => {
                error!(error = ?error, "Failed to apply SQL schema: {error}");
                return Err(StoreError::SQLite(error));
            }
        };

        Ok(Self { connection })
    }

    fn insert(connection: &Connection, record: &RunRecord) -> Result<(), StoreError> {
        connection
            .prepare_cached("insert into runs (reference, record) values (?, ?)")?
            .execute(params![
                record.reference.to_string(),
                serde_json::to_string(record)?
            ])?;

        Ok(())
    }
}

impl RunStore for SqliteStore {
    fn load(&mut self) -> Vec<RunRecord> {
        self.list().unwrap_or_else(|error| {
            warn!(error = ?error, "Run table unreadable, starting empty");
            Vec::new()
        })
    }

    fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        let rows = self
            .connection
            .prepare_cached("select reference, record from runs order by position")?
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        // one broken row must not hide every other run
        Ok(rows
            .into_iter()
            .filter_map(|(reference, record)| match serde_json::from_str(&record) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!(reference = %reference, error = %error, "Skipping corrupt run record");
                    None
                }
            })
            .collect())
    }

    fn snapshot(&mut self, records: &[RunRecord]) -> Result<(), StoreError> {
        let mut tx = self.connection.transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        tx.execute("delete from runs", [])?;
        for record in records {
            Self::insert(&tx, record)?;
        }
        tx.commit()?;

        info!("Stored {} runs", records.len());

        Ok(())
    }

    fn append(&mut self, record: &RunRecord) -> Result<(), StoreError> {
        Self::insert(&self.connection, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::record;

    #[test]
    fn records_survive_reopening_in_order() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("runs.db");
        let records = [record("r1"), record("r2"), record("r3")];

        let mut store = SqliteStore::load(&path).unwrap();
        assert!(store.load().is_empty());
        for record in &records {
            store.append(record).unwrap();
        }
        drop(store);

        let loaded = SqliteStore::load(&path).unwrap().load();
        assert_eq!(
            loaded.iter().map(|record| record.reference).collect::<Vec<_>>(),
            records.iter().map(|record| record.reference).collect::<Vec<_>>()
        );
    }

    #[test]
    fn duplicate_reference_is_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::load(&directory.path().join("runs.db")).unwrap();
        let record = record("r1");

        store.append(&record).unwrap();
        assert!(store.append(&record).is_err());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn snapshot_replaces_everything() {
        let directory = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::load(&directory.path().join("runs.db")).unwrap();
        store.append(&record("r1")).unwrap();

        let replacement = [record("r2")];
        store.snapshot(&replacement).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reference, replacement[0].reference);
    }

    #[test]
    fn corrupt_rows_are_skipped() {
        let directory = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::load(&directory.path().join("runs.db")).unwrap();
        store.append(&record("r1")).unwrap();
        store
            .connection
            .execute(
                "insert into runs (reference, record) values ('broken', '{')",
                [],
            )
            .unwrap();

        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn corrupt_database_is_moved_aside() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("runs.db");
        fs::write(&path, "not a database, just text ".repeat(40)).unwrap();

        let mut store = SqliteStore::load(&path).unwrap();
        assert!(store.load().is_empty());
        store.append(&record("r1")).unwrap();

        assert!(directory.path().join("runs.db.corrupt").exists());
        assert_eq!(SqliteStore::load(&path).unwrap().load().len(), 1);
    }
}
