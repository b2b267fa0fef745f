use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

const HEAD_KEY: &str = "head";

/// Durable advertisement chain: every record announced so far plus the
/// current head, so the chain survives restarts and old records stay
/// fetchable by the indexer.
pub struct AdvertisementStore {
    db_path: PathBuf,
}

impl AdvertisementStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS advertisements (
                id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS advertisement_chain (
                key TEXT PRIMARY KEY,
                ad_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Stores a record without moving the head. Re-putting an id is a no-op.
    pub fn put_record(&self, id: &str, record: &str) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT OR IGNORE INTO advertisements (id, record, created_at)
             VALUES (?1, ?2, ?3)",
            params![id, record, chrono::Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    pub fn get_record(&self, id: &str) -> Result<Option<String>> {
        let conn = self.get_conn()?;

        let record = conn
            .query_row(
                "SELECT record FROM advertisements WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(record)
    }

    pub fn head(&self) -> Result<Option<String>> {
        let conn = self.get_conn()?;

        let head = conn
            .query_row(
                "SELECT ad_id FROM advertisement_chain WHERE key = ?1",
                [HEAD_KEY],
                |row| row.get(0),
            )
            .optional()?;

        Ok(head)
    }

    pub fn set_head(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO advertisement_chain (key, ad_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET ad_id = excluded.ad_id, updated_at = excluded.updated_at",
            params![HEAD_KEY, id, chrono::Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }
}
