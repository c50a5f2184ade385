use chrono::Utc;
use finmem_models::Day;
use rusqlite::{Connection, OptionalExtension};

use crate::error::MemoryError;

const CHECKPOINT_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS checkpoints (
    run_id     TEXT    NOT NULL,
    day        INTEGER NOT NULL,
    created_at TEXT    NOT NULL,
    blob       BLOB    NOT NULL,
    PRIMARY KEY (run_id, day)
);";

/// Engine snapshots keyed by run and day.
///
/// Written between simulated days, never mid-cycle. Saving the same
/// `(run_id, day)` twice replaces the earlier blob.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    /// Open (or create) a checkpoint database file with WAL journaling.
    pub fn open(path: &str) -> Result<Self, MemoryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(CHECKPOINT_TABLE_DDL)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CHECKPOINT_TABLE_DDL)?;
        Ok(Self { conn })
    }

    pub fn save(&self, run_id: &str, day: Day, blob: &[u8]) -> Result<(), MemoryError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO checkpoints (run_id, day, created_at, blob) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![run_id, day, Utc::now().to_rfc3339(), blob],
        )?;
        Ok(())
    }

    /// Blob saved for exactly this run and day.
    pub fn load(&self, run_id: &str, day: Day) -> Result<Option<Vec<u8>>, MemoryError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT blob FROM checkpoints WHERE run_id = ?1 AND day = ?2")?;
        let blob = stmt
            .query_row(rusqlite::params![run_id, day], |row| row.get(0))
            .optional()?;
        Ok(blob)
    }

    /// Most recent checkpoint of a run, with its day.
    pub fn latest(&self, run_id: &str) -> Result<Option<(Day, Vec<u8>)>, MemoryError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT day, blob FROM checkpoints WHERE run_id = ?1 ORDER BY day DESC LIMIT 1",
        )?;
        let latest = stmt
            .query_row(rusqlite::params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        Ok(latest)
    }

    /// Number of checkpoints kept for a run.
    pub fn count(&self, run_id: &str) -> Result<usize, MemoryError> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE run_id = ?1",
            rusqlite::params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.save("run-a", 1, b"one").unwrap();

        assert_eq!(store.load("run-a", 1).unwrap().unwrap(), b"one".to_vec());
        assert!(store.load("run-a", 2).unwrap().is_none());
        assert!(store.load("run-b", 1).unwrap().is_none());
    }

    #[test]
    fn latest_picks_highest_day() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.save("run-a", 2, b"two").unwrap();
        store.save("run-a", 5, b"five").unwrap();
        store.save("run-a", 3, b"three").unwrap();
        store.save("run-b", 9, b"other").unwrap();

        let (day, blob) = store.latest("run-a").unwrap().unwrap();
        assert_eq!(day, 5);
        assert_eq!(blob, b"five".to_vec());
        assert!(store.latest("run-c").unwrap().is_none());
    }

    #[test]
    fn save_replaces_same_day() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.save("run-a", 1, b"first").unwrap();
        store.save("run-a", 1, b"second").unwrap();

        assert_eq!(store.count("run-a").unwrap(), 1);
        assert_eq!(store.load("run-a", 1).unwrap().unwrap(), b"second".to_vec());
    }

    #[test]
    fn wal_mode_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        let store = SqliteCheckpointStore::open(path.to_str().unwrap()).unwrap();
        store.save("run-a", 0, b"x").unwrap();

        let reopened = SqliteCheckpointStore::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reopened.count("run-a").unwrap(), 1);
    }
}
