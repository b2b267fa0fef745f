use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A batch window as last advertised for one retrieval node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedBatch {
    pub retrieval_node_handle: String,
    pub first_content_id: u64,
    pub count: u64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Durable record of which windows have been announced per node.
///
/// Only the reconciliation loop writes here.
pub struct LedgerStore {
    db_path: PathBuf,
}

impl LedgerStore {
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

        conn.execute(
            "CREATE TABLE IF NOT EXISTS published_batches (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                retrieval_node_handle TEXT NOT NULL,
                first_content_id INTEGER NOT NULL,
                count INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (retrieval_node_handle, first_content_id)
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get(&self, handle: &str, first_content_id: u64) -> Result<Option<PublishedBatch>> {
        let conn = self.get_conn()?;

        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT count, updated_at FROM published_batches
                 WHERE retrieval_node_handle = ?1 AND first_content_id = ?2",
                params![handle, first_content_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((count, updated_at)) => Ok(Some(PublishedBatch {
                retrieval_node_handle: handle.to_string(),
                first_content_id,
                count: count as u64,
                updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?
                    .with_timezone(&chrono::Utc),
            })),
            None => Ok(None),
        }
    }

    /// Records a first publish. A second insert for the same window is a
    /// no-op and reports `false`.
    pub fn insert(&self, handle: &str, first_content_id: u64, count: u64) -> Result<bool> {
        let conn = self.get_conn()?;

        let affected = conn.execute(
            "INSERT OR IGNORE INTO published_batches (
                retrieval_node_handle, first_content_id, count, updated_at
            ) VALUES (?1, ?2, ?3, ?4)",
            params![
                handle,
                first_content_id as i64,
                count as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(affected > 0)
    }

    pub fn update_count(&self, handle: &str, first_content_id: u64, count: u64) -> Result<bool> {
        let conn = self.get_conn()?;

        let affected = conn.execute(
            "UPDATE published_batches SET count = ?1, updated_at = ?2
             WHERE retrieval_node_handle = ?3 AND first_content_id = ?4",
            params![
                count as i64,
                chrono::Utc::now().to_rfc3339(),
                handle,
                first_content_id as i64,
            ],
        )?;

        Ok(affected > 0)
    }

    pub fn list_for_node(&self, handle: &str) -> Result<Vec<PublishedBatch>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT first_content_id, count, updated_at FROM published_batches
             WHERE retrieval_node_handle = ?1 ORDER BY first_content_id",
        )?;

        let rows = stmt.query_map([handle], |row| {
            let first_content_id: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            let updated_at: String = row.get(2)?;

            Ok(PublishedBatch {
                retrieval_node_handle: handle.to_string(),
                first_content_id: first_content_id as u64,
                count: count as u64,
                updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?
                    .with_timezone(&chrono::Utc),
            })
        })?;

        let mut batches = Vec::new();
        for row in rows {
            batches.push(row?);
        }

        Ok(batches)
    }
}
