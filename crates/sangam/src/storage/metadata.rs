use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};

use crate::error::{Error, Result};
use crate::processing::chunker::ChunkPiece;
use crate::types::{Bundle, BundleRow, BundleStatus, ChunkRow};

/// SQLite's default bound-parameter ceiling is 999; stay well under it when
/// expanding `IN` lists.
const MAX_BIND_PARAMS: usize = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS indexes (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS bundles (
    id      TEXT NOT NULL,
    idx     TEXT NOT NULL,
    source  TEXT NOT NULL,
    name    TEXT NOT NULL,
    created TEXT NOT NULL,
    status  TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'chunked', 'completed')),

    PRIMARY KEY (id, idx),
    FOREIGN KEY (idx) REFERENCES indexes (name) ON DELETE CASCADE
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS chunks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    idx         TEXT NOT NULL,
    bundle_id   TEXT NOT NULL,
    content     TEXT NOT NULL,
    "ref"       TEXT NOT NULL,
    chunk_order INTEGER NOT NULL,

    FOREIGN KEY (bundle_id, idx) REFERENCES bundles (id, idx) ON DELETE CASCADE,
    UNIQUE (bundle_id, idx, chunk_order)
);

CREATE INDEX IF NOT EXISTS idx_chunks_bundle ON chunks (bundle_id, idx);
CREATE INDEX IF NOT EXISTS idx_chunks_idx ON chunks (idx);
"#;

/// Relational metadata store: indexes → bundles → chunks with enforced
/// foreign keys and cascading deletes. Chunk ids are AUTOINCREMENT and are
/// never reused, even after deletion.
///
/// All methods take `&self`; the connection sits behind a mutex and every
/// mutation commits before returning. Call the store from a blocking
/// context (`spawn_blocking`) on hot async paths.
pub struct Metadata {
    conn: Mutex<Connection>,
}

impl Metadata {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside a single transaction. The [`TxnOps`] view exposes the
    /// mutating operations, and arbitrary side effects (filesystem cleanup,
    /// etc.) can be run inside the closure: if anything fails, the whole
    /// transaction rolls back and the error is surfaced unchanged.
    pub fn in_txn<T>(&self, f: impl FnOnce(&TxnOps<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&TxnOps { tx: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    // Indexes -----

    pub fn index_add(&self, name: &str) -> Result<()> {
        self.in_txn(|tx| tx.index_add(name))
    }

    pub fn index_del(&self, name: &str) -> Result<()> {
        self.in_txn(|tx| tx.index_del(name))
    }

    pub fn index_get(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name FROM indexes WHERE name = ?1",
                params![name],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn index_list(&self, page: usize, items: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut sql = String::from("SELECT name FROM indexes ORDER BY name ASC");
        let mut args: Vec<i64> = Vec::new();
        if items > 0 {
            sql.push_str(" LIMIT ?1 OFFSET ?2");
            args.push(items as i64);
            args.push((page * items) as i64);
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| r.get::<_, String>(0))?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }

    // Bundles -----

    pub fn bundle_add(&self, bundle: &Bundle) -> Result<()> {
        self.in_txn(|tx| tx.bundle_add(bundle))
    }

    pub fn bundle_del(&self, bundle_id: &str, index: &str) -> Result<()> {
        self.in_txn(|tx| tx.bundle_del(bundle_id, index))
    }

    pub fn bundle_get(&self, bundle_id: &str, index: &str) -> Result<Option<BundleRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, idx, source, name, created, status
                 FROM bundles WHERE id = ?1 AND idx = ?2",
                params![bundle_id, index],
                bundle_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn bundle_list(&self, index: &str, page: usize, items: usize) -> Result<Vec<BundleRow>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, idx, source, name, created, status
             FROM bundles WHERE idx = ?1 ORDER BY created ASC, id ASC",
        );
        if items > 0 {
            sql.push_str(" LIMIT ?2 OFFSET ?3");
        }
        let mut stmt = conn.prepare(&sql)?;
        if items > 0 {
            let rows = stmt.query_map(
                params![index, items as i64, (page * items) as i64],
                bundle_from_row,
            )?;
            rows.map(|r| r.map_err(Error::from)).collect()
        } else {
            let rows = stmt.query_map(params![index], bundle_from_row)?;
            rows.map(|r| r.map_err(Error::from)).collect()
        }
    }

    pub fn bundle_status_get(&self, bundle_id: &str, index: &str) -> Result<Option<BundleStatus>> {
        let conn = self.conn.lock();
        let status = conn
            .query_row(
                "SELECT status FROM bundles WHERE id = ?1 AND idx = ?2",
                params![bundle_id, index],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        match status {
            None => Ok(None),
            Some(s) => BundleStatus::parse(&s)
                .map(Some)
                .ok_or_else(|| Error::Internal(format!("unknown bundle status '{s}'"))),
        }
    }

    pub fn bundle_status_set(
        &self,
        bundle_id: &str,
        index: &str,
        status: BundleStatus,
    ) -> Result<()> {
        self.in_txn(|tx| tx.bundle_status_set(bundle_id, index, status))
    }

    // Chunks -----

    pub fn chunks_add(&self, index: &str, bundle_id: &str, pieces: &[ChunkPiece]) -> Result<()> {
        self.in_txn(|tx| tx.chunks_add(index, bundle_id, pieces))
    }

    /// Fetch chunk rows by id, in arbitrary order. The id list may be
    /// arbitrarily large; it is expanded in batches to stay under SQLite's
    /// bound-parameter limit.
    pub fn chunks_get(&self, ids: &[i64]) -> Result<Vec<ChunkRow>> {
        let conn = self.conn.lock();
        let mut rows = Vec::with_capacity(ids.len());
        for batch in ids.chunks(MAX_BIND_PARAMS) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT id, idx, bundle_id, content, \"ref\", chunk_order
                 FROM chunks WHERE id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map(params_from_iter(batch.iter()), chunk_from_row)?;
            for row in mapped {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    pub fn chunks_get_by_bundle_id(&self, index: &str, bundle_id: &str) -> Result<Vec<ChunkRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, idx, bundle_id, content, \"ref\", chunk_order
             FROM chunks WHERE idx = ?1 AND bundle_id = ?2 ORDER BY chunk_order ASC",
        )?;
        let rows = stmt.query_map(params![index, bundle_id], chunk_from_row)?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }

    pub fn chunk_ids_by_index(&self, index: &str) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM chunks WHERE idx = ?1")?;
        let rows = stmt.query_map(params![index], |r| r.get::<_, i64>(0))?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }
}

/// Mutating operations scoped to one open transaction. Obtained through
/// [`Metadata::in_txn`].
pub struct TxnOps<'a> {
    tx: &'a Transaction<'a>,
}

impl TxnOps<'_> {
    pub fn index_add(&self, name: &str) -> Result<()> {
        self.tx
            .execute("INSERT INTO indexes (name) VALUES (?1)", params![name])?;
        Ok(())
    }

    pub fn index_del(&self, name: &str) -> Result<()> {
        self.tx
            .execute("DELETE FROM indexes WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn bundle_add(&self, bundle: &Bundle) -> Result<()> {
        let created = chrono::Utc::now().to_rfc3339();
        self.tx.execute(
            "INSERT INTO bundles (id, idx, source, name, created) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![bundle.id, bundle.index, bundle.source, bundle.name, created],
        )?;
        Ok(())
    }

    pub fn bundle_del(&self, bundle_id: &str, index: &str) -> Result<()> {
        self.tx.execute(
            "DELETE FROM bundles WHERE id = ?1 AND idx = ?2",
            params![bundle_id, index],
        )?;
        Ok(())
    }

    pub fn bundle_status_set(
        &self,
        bundle_id: &str,
        index: &str,
        status: BundleStatus,
    ) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE bundles SET status = ?3 WHERE id = ?1 AND idx = ?2",
            params![bundle_id, index, status.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "bundle '{bundle_id}' in index '{index}'"
            )));
        }
        Ok(())
    }

    pub fn chunks_add(&self, index: &str, bundle_id: &str, pieces: &[ChunkPiece]) -> Result<()> {
        let mut stmt = self.tx.prepare(
            "INSERT INTO chunks (idx, bundle_id, content, \"ref\", chunk_order)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for piece in pieces {
            stmt.execute(params![
                index,
                bundle_id,
                piece.content,
                piece.block_ref,
                piece.chunk_order,
            ])?;
        }
        Ok(())
    }
}

fn bundle_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<BundleRow> {
    let status: String = r.get(5)?;
    let status = BundleStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown bundle status '{status}'"),
            )),
        )
    })?;
    Ok(BundleRow {
        id: r.get(0)?,
        index: r.get(1)?,
        source: r.get(2)?,
        name: r.get(3)?,
        created: r.get(4)?,
        status,
    })
}

fn chunk_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        id: r.get(0)?,
        index: r.get(1)?,
        bundle_id: r.get(2)?,
        content: r.get(3)?,
        block_ref: r.get(4)?,
        chunk_order: r.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Metadata) {
        let dir = TempDir::new().unwrap();
        let meta = Metadata::open(&dir.path().join("metadata.db")).unwrap();
        (dir, meta)
    }

    fn bundle(id: &str, index: &str) -> Bundle {
        Bundle {
            id: id.into(),
            index: index.into(),
            source: "test".into(),
            name: format!("bundle {id}"),
            blocks: vec![],
        }
    }

    fn pieces(n: u32) -> Vec<ChunkPiece> {
        (1..=n)
            .map(|i| ChunkPiece {
                content: format!("chunk number {i}"),
                block_ref: "1".into(),
                chunk_order: i,
            })
            .collect()
    }

    #[test]
    fn bundle_status_lifecycle() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        assert_eq!(meta.bundle_status_get("a", "ix").unwrap(), None);

        meta.bundle_add(&bundle("a", "ix")).unwrap();
        assert_eq!(
            meta.bundle_status_get("a", "ix").unwrap(),
            Some(BundleStatus::Pending)
        );

        meta.bundle_status_set("a", "ix", BundleStatus::Chunked).unwrap();
        assert_eq!(
            meta.bundle_status_get("a", "ix").unwrap(),
            Some(BundleStatus::Chunked)
        );
    }

    #[test]
    fn status_set_on_missing_bundle_is_not_found() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        let err = meta
            .bundle_status_set("ghost", "ix", BundleStatus::Chunked)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn same_bundle_id_in_two_indexes() {
        let (_dir, meta) = store();
        meta.index_add("ix1").unwrap();
        meta.index_add("ix2").unwrap();
        meta.bundle_add(&bundle("a", "ix1")).unwrap();
        meta.bundle_add(&bundle("a", "ix2")).unwrap();
        assert!(meta.bundle_get("a", "ix1").unwrap().is_some());
        assert!(meta.bundle_get("a", "ix2").unwrap().is_some());
    }

    #[test]
    fn cascade_delete_index_removes_bundles_and_chunks() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        meta.bundle_add(&bundle("a", "ix")).unwrap();
        meta.chunks_add("ix", "a", &pieces(3)).unwrap();
        assert_eq!(meta.chunk_ids_by_index("ix").unwrap().len(), 3);

        meta.index_del("ix").unwrap();
        assert!(meta.bundle_get("a", "ix").unwrap().is_none());
        assert!(meta.chunk_ids_by_index("ix").unwrap().is_empty());
    }

    #[test]
    fn cascade_delete_bundle_removes_chunks() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        meta.bundle_add(&bundle("a", "ix")).unwrap();
        meta.chunks_add("ix", "a", &pieces(2)).unwrap();

        meta.bundle_del("a", "ix").unwrap();
        assert!(meta.chunk_ids_by_index("ix").unwrap().is_empty());
    }

    #[test]
    fn duplicate_chunk_order_rejected() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        meta.bundle_add(&bundle("a", "ix")).unwrap();
        meta.chunks_add("ix", "a", &pieces(1)).unwrap();
        assert!(meta.chunks_add("ix", "a", &pieces(1)).is_err());
    }

    #[test]
    fn chunk_ids_are_never_reused() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        meta.bundle_add(&bundle("a", "ix")).unwrap();
        meta.chunks_add("ix", "a", &pieces(3)).unwrap();
        let first_max = *meta.chunk_ids_by_index("ix").unwrap().iter().max().unwrap();

        meta.bundle_del("a", "ix").unwrap();
        meta.bundle_add(&bundle("a", "ix")).unwrap();
        meta.chunks_add("ix", "a", &pieces(3)).unwrap();
        let second_min = *meta.chunk_ids_by_index("ix").unwrap().iter().min().unwrap();
        assert!(second_min > first_max);
    }

    #[test]
    fn chunks_get_batches_large_id_lists() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        meta.bundle_add(&bundle("a", "ix")).unwrap();
        meta.chunks_add("ix", "a", &pieces(700)).unwrap();

        let mut ids = meta.chunk_ids_by_index("ix").unwrap();
        ids.push(9_999_999); // unknown id is silently absent
        let rows = meta.chunks_get(&ids).unwrap();
        assert_eq!(rows.len(), 700);
    }

    #[test]
    fn in_txn_rolls_back_when_side_effect_fails() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();

        let result: Result<()> = meta.in_txn(|tx| {
            tx.index_del("ix")?;
            Err(Error::Io(std::io::Error::other("cleanup failed")))
        });
        assert!(result.is_err());
        assert!(meta.index_get("ix").unwrap().is_some());
    }

    #[test]
    fn bundle_list_paginates() {
        let (_dir, meta) = store();
        meta.index_add("ix").unwrap();
        for i in 0..5 {
            meta.bundle_add(&bundle(&format!("b{i}"), "ix")).unwrap();
        }
        assert_eq!(meta.bundle_list("ix", 0, 0).unwrap().len(), 5);
        assert_eq!(meta.bundle_list("ix", 0, 2).unwrap().len(), 2);
        assert_eq!(meta.bundle_list("ix", 2, 2).unwrap().len(), 1);
    }
}
