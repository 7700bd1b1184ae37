//! Durable chunk storage on SQLite
//!
//! Two tables: `transfers` holds one metadata row per transfer id, `chunks`
//! holds raw chunk bytes keyed by `(transfer_id, idx)`. Every write is an
//! upsert, every delete is idempotent, and assembly only succeeds once the
//! persisted chunk count matches the declared total.

use roomdrop_core::{Error, TransferDirection, TransferMetadata, TransferStatus};
use rusqlite::{params, Connection, OptionalExtension, Result};

/// Map a database failure into the crate error taxonomy
pub fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Persistent store for transfer metadata and chunk bytes
pub struct ChunkStore {
    conn: Connection,
}

impl ChunkStore {
    /// Open or create the store database
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an ephemeral in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                sid TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                mime_type TEXT,
                last_modified INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                received_chunks INTEGER NOT NULL,
                status TEXT NOT NULL,
                direction TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                transfer_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (transfer_id, idx)
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Upsert a metadata row by transfer id
    pub fn save_metadata(&self, meta: &TransferMetadata) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO transfers
            (id, sid, name, size, mime_type, last_modified, chunk_size,
             total_chunks, received_chunks, status, direction)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                meta.id,
                meta.sid,
                meta.name,
                meta.size as i64,
                meta.mime_type,
                meta.last_modified as i64,
                meta.chunk_size as i64,
                meta.total_chunks as i64,
                meta.received_chunks as i64,
                meta.status.as_str(),
                meta.direction.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Upsert one chunk by `(transfer_id, index)`
    pub fn save_chunk(&self, transfer_id: &str, index: u32, data: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO chunks (transfer_id, idx, data) VALUES (?, ?, ?)",
            params![transfer_id, index as i64, data],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, transfer_id: &str) -> Result<Option<TransferMetadata>> {
        self.conn
            .prepare(
                "SELECT id, sid, name, size, mime_type, last_modified, chunk_size,
                        total_chunks, received_chunks, status, direction
                 FROM transfers WHERE id = ?",
            )?
            .query_row(params![transfer_id], row_to_metadata)
            .optional()
    }

    /// All chunks of a transfer, ascending by index
    pub fn get_chunks(&self, transfer_id: &str) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT idx, data FROM chunks WHERE transfer_id = ? ORDER BY idx ASC")?;
        let rows = stmt
            .query_map(params![transfer_id], |row| {
                Ok((row.get::<_, i64>(0)? as u32, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn chunk_count(&self, transfer_id: &str) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE transfer_id = ?",
            params![transfer_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Concatenate all chunks in index order, or `None` while incomplete
    pub fn assemble_completed(&self, transfer_id: &str) -> Result<Option<Vec<u8>>> {
        let Some(meta) = self.get_metadata(transfer_id)? else {
            return Ok(None);
        };
        if self.chunk_count(transfer_id)? != meta.total_chunks {
            return Ok(None);
        }
        let mut bytes = Vec::with_capacity(meta.size as usize);
        for (_, chunk) in self.get_chunks(transfer_id)? {
            bytes.extend_from_slice(&chunk);
        }
        Ok(Some(bytes))
    }

    pub fn delete_metadata(&self, transfer_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM transfers WHERE id = ?", params![transfer_id])?;
        Ok(())
    }

    pub fn delete_chunks(&self, transfer_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM chunks WHERE transfer_id = ?",
            params![transfer_id],
        )?;
        Ok(())
    }

    pub fn list_all_metadata(&self) -> Result<Vec<TransferMetadata>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sid, name, size, mime_type, last_modified, chunk_size,
                    total_chunks, received_chunks, status, direction
             FROM transfers",
        )?;
        let rows = stmt
            .query_map([], row_to_metadata)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Flip `completed` rows whose persisted chunk count contradicts their
    /// declared total to `error`; returns how many rows were flipped
    pub fn integrity_sweep(&self) -> Result<usize> {
        let mut flipped = 0;
        for mut meta in self.list_all_metadata()? {
            if meta.status != TransferStatus::Completed {
                continue;
            }
            let count = self.chunk_count(&meta.id)?;
            if count != 0 && count != meta.total_chunks {
                tracing::warn!(
                    id = %meta.id,
                    persisted = count,
                    declared = meta.total_chunks,
                    "chunk count mismatch, marking transfer as errored"
                );
                meta.status = TransferStatus::Error;
                self.save_metadata(&meta)?;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

fn row_to_metadata(row: &rusqlite::Row<'_>) -> Result<TransferMetadata> {
    let status: String = row.get(9)?;
    let direction: String = row.get(10)?;
    Ok(TransferMetadata {
        id: row.get(0)?,
        sid: row.get(1)?,
        name: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        mime_type: row.get(4)?,
        last_modified: row.get::<_, i64>(5)? as u64,
        chunk_size: row.get::<_, i64>(6)? as u32,
        total_chunks: row.get::<_, i64>(7)? as u32,
        received_chunks: row.get::<_, i64>(8)? as u32,
        status: TransferStatus::parse(&status).unwrap_or(TransferStatus::Error),
        direction: TransferDirection::parse(&direction).unwrap_or(TransferDirection::Receiving),
    })
}
