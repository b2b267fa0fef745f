use crate::Multihash;
use crate::error::{BeaconError, Result};
use crate::storage::ContentCatalog;

/// Streams the multihashes of one batch window `[first, first + count)`.
///
/// The window is resolved once at construction; memory is bounded by that
/// window. Iteration consumes the cursor, a new pull request builds a new one.
#[derive(Debug)]
pub struct MultihashCursor {
    hashes: std::vec::IntoIter<Multihash>,
    first: u64,
    count: u64,
}

impl MultihashCursor {
    pub async fn resolve(catalog: &dyn ContentCatalog, first: u64, count: u64) -> Result<Self> {
        let end = first.saturating_add(count);
        let rows = catalog.hashes_in_range(first, end).await?;

        let mut hashes = Vec::with_capacity(rows.len());
        for row in rows {
            match Multihash::from_bytes(&row) {
                Ok(hash) => hashes.push(hash),
                Err(error) => {
                    tracing::warn!(
                        "Failed to parse catalog hash {}: {}",
                        hex::encode(&row),
                        error
                    );
                }
            }
        }

        if hashes.is_empty() {
            return Err(BeaconError::NoMultihashes { first, count });
        }

        tracing::info!(
            "Creating cursor for content ids {} to {} ({} multihashes)",
            first,
            end,
            hashes.len()
        );

        Ok(Self {
            hashes: hashes.into_iter(),
            first,
            count,
        })
    }

    pub fn first_content_id(&self) -> u64 {
        self.first
    }

    /// Width of the resolved window, not the number of hashes left.
    pub fn window_count(&self) -> u64 {
        self.count
    }

    pub fn remaining(&self) -> usize {
        self.hashes.len()
    }
}

impl Iterator for MultihashCursor {
    type Item = Multihash;

    fn next(&mut self) -> Option<Multihash> {
        self.hashes.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.hashes.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha2_256_multihash;
    use crate::storage::SqliteCatalog;

    fn hash(seed: u8) -> Multihash {
        sha2_256_multihash(&[seed]).unwrap()
    }

    fn seeded_catalog(dir: &tempfile::TempDir, contents: u8) -> SqliteCatalog {
        let catalog = SqliteCatalog::new(dir.path().join("beacon.db")).unwrap();
        for i in 0..contents {
            catalog.insert_content(&[hash(i)]).unwrap();
        }
        catalog
    }

    #[tokio::test]
    async fn test_cursor_yields_window_then_ends() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = seeded_catalog(&temp_dir, 10);

        let mut cursor = MultihashCursor::resolve(&catalog, 1, 4).await.unwrap();
        assert_eq!(cursor.remaining(), 4);

        let seen: Vec<Multihash> = cursor.by_ref().collect();
        assert_eq!(seen.len(), 4);
        assert!(seen.contains(&hash(0)));
        assert!(!seen.contains(&hash(4)));
        assert!(cursor.next().is_none());
    }

    #[tokio::test]
    async fn test_empty_window_fails_construction() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = seeded_catalog(&temp_dir, 3);

        let err = MultihashCursor::resolve(&catalog, 100, 25).await.unwrap_err();
        assert!(matches!(err, BeaconError::NoMultihashes { first: 100, count: 25 }));
    }

    #[tokio::test]
    async fn test_unparsable_rows_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = seeded_catalog(&temp_dir, 2);

        let conn = rusqlite::Connection::open(temp_dir.path().join("beacon.db")).unwrap();
        conn.execute("INSERT INTO objects (hash) VALUES (x'ffff')", [])
            .unwrap();
        let object_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO obj_refs (content, object) VALUES (1, ?1)",
            [object_id],
        )
        .unwrap();

        let cursor = MultihashCursor::resolve(&catalog, 1, 2).await.unwrap();
        assert_eq!(cursor.window_count(), 2);
        assert_eq!(cursor.first_content_id(), 1);
        assert_eq!(cursor.remaining(), 2);

        let hashes: Vec<Multihash> = cursor.collect();
        assert_eq!(hashes, vec![hash(0), hash(1)]);
    }
}
