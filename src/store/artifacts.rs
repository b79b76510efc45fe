//! Content-addressed artifact store for rendered export files.
//!
//! Rows are keyed by the SHA-256 of their content, so writes are naturally
//! idempotent (`INSERT OR IGNORE`); UPDATE and DELETE are rejected by
//! triggers like the event log.

use crate::domain::ids::sha256_hex;
use crate::errors::CoreResult;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub sha256: String,
    pub content: Vec<u8>,
    pub content_type: String,
    pub byte_len: u64,
    pub created_at_ms: i64,
}

/// Store content, returning its address. Re-storing identical bytes is a
/// no-op.
pub fn put(
    conn: &Connection,
    content: &[u8],
    content_type: &str,
    now_ms: i64,
) -> CoreResult<String> {
    let sha256 = sha256_hex(content);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO artifacts (sha256, content, content_type, byte_len, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![sha256, content, content_type, content.len() as i64, now_ms],
    )?;
    if inserted > 0 {
        debug!(sha256 = %sha256, bytes = content.len(), "stored artifact");
    }
    Ok(sha256)
}

pub fn get(conn: &Connection, sha256: &str) -> CoreResult<Option<ArtifactRecord>> {
    let record = conn
        .query_row(
            "SELECT sha256, content, content_type, byte_len, created_at
             FROM artifacts WHERE sha256 = ?1",
            params![sha256],
            |row| {
                Ok(ArtifactRecord {
                    sha256: row.get(0)?,
                    content: row.get(1)?,
                    content_type: row.get(2)?,
                    byte_len: row.get::<_, i64>(3)? as u64,
                    created_at_ms: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}
