use crate::Multihash;
use crate::error::Result;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

/// Read access to the content catalog owned by the storage subsystem.
#[async_trait]
pub trait ContentCatalog: Send + Sync {
    /// Highest content id currently in the catalog, `None` when empty.
    async fn highest_content_id(&self) -> Result<Option<u64>>;

    /// Raw multihash bytes for every object referenced by contents in
    /// `[first, end_exclusive)`, ordered by content id.
    async fn hashes_in_range(&self, first: u64, end_exclusive: u64) -> Result<Vec<Vec<u8>>>;
}

/// Catalog backed by the shared SQLite database.
pub struct SqliteCatalog {
    db_path: PathBuf,
}

impl SqliteCatalog {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let catalog = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn get_conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS objects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS obj_refs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content INTEGER NOT NULL,
                object INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_obj_refs_content ON obj_refs(content);",
        )?;

        Ok(())
    }

    /// Adds one content item referencing the given object hashes. The storage
    /// subsystem owns writes in production; this exists for seeding.
    pub fn insert_content(&self, hashes: &[Multihash]) -> Result<u64> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO contents (created_at) VALUES (?1)",
            params![chrono::Utc::now().to_rfc3339()],
        )?;
        let content_id = tx.last_insert_rowid();

        for hash in hashes {
            tx.execute(
                "INSERT INTO objects (hash) VALUES (?1)",
                params![hash.to_bytes()],
            )?;
            let object_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO obj_refs (content, object) VALUES (?1, ?2)",
                params![content_id, object_id],
            )?;
        }

        tx.commit()?;
        Ok(content_id as u64)
    }
}

#[async_trait]
impl ContentCatalog for SqliteCatalog {
    async fn highest_content_id(&self) -> Result<Option<u64>> {
        let conn = self.get_conn()?;

        let highest: Option<i64> = conn
            .query_row("SELECT MAX(id) FROM contents", [], |row| row.get(0))
            .optional()?
            .flatten();

        Ok(highest.map(|id| id.max(0) as u64))
    }

    async fn hashes_in_range(&self, first: u64, end_exclusive: u64) -> Result<Vec<Vec<u8>>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT objects.hash FROM objects
             JOIN obj_refs ON objects.id = obj_refs.object
             WHERE obj_refs.content >= ?1 AND obj_refs.content < ?2
             ORDER BY obj_refs.content, obj_refs.id",
        )?;

        let rows = stmt.query_map(params![first as i64, end_exclusive as i64], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        let mut hashes = Vec::new();
        for row in rows {
            hashes.push(row?);
        }

        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha2_256_multihash;

    fn hash(data: &[u8]) -> Multihash {
        sha2_256_multihash(data).unwrap()
    }

    #[tokio::test]
    async fn test_empty_catalog_has_no_highest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = SqliteCatalog::new(temp_dir.path().join("beacon.db")).unwrap();

        assert_eq!(catalog.highest_content_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = SqliteCatalog::new(temp_dir.path().join("beacon.db")).unwrap();

        for i in 0..5u8 {
            catalog
                .insert_content(&[hash(&[i]), hash(&[i, i])])
                .unwrap();
        }

        assert_eq!(catalog.highest_content_id().await.unwrap(), Some(5));

        // content ids 2 and 3
        let hashes = catalog.hashes_in_range(2, 4).await.unwrap();
        assert_eq!(hashes.len(), 4);
        assert_eq!(
            hashes,
            vec![
                hash(&[1]).to_bytes(),
                hash(&[1, 1]).to_bytes(),
                hash(&[2]).to_bytes(),
                hash(&[2, 2]).to_bytes(),
            ]
        );
        assert!(!hashes.contains(&hash(&[3]).to_bytes()));

        assert!(catalog.hashes_in_range(6, 10).await.unwrap().is_empty());
    }
}
