//! Idempotency ledger: exactly-once visible effect for retried commands.
//!
//! Reservation runs inside the caller's open transaction, so the reserved row
//! commits or rolls back with the command itself. Keys are scoped to the
//! operation kind and the hash of its inputs; the same key with different
//! inputs is a caller bug surfaced as `IDEMPOTENCY_KEY_REUSED`.

use crate::errors::{CoreError, CoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;
use tracing::debug;

/// Outcome of a reservation attempt.
#[derive(Debug)]
pub enum Reservation {
    /// Fresh reservation; the caller runs the command body.
    New,
    /// A previous run completed; return its cached response unchanged.
    Completed(serde_json::Value),
}

/// Insert-or-inspect the key row. State machine:
/// none -> PROCESSING; FAILED/expired -> PROCESSING; PROCESSING (live) ->
/// `OPERATION_IN_PROGRESS`; COMPLETED -> cached response.
pub fn check_and_reserve(
    conn: &Connection,
    key: &str,
    operation_kind: &str,
    input_hash: &str,
    ttl: Duration,
    now_ms: i64,
) -> CoreResult<Reservation> {
    let expires_at = now_ms + ttl.as_millis() as i64;

    let existing: Option<(String, String, String, Option<String>, i64)> = conn
        .query_row(
            "SELECT operation_kind, input_hash, status, response_json, expires_at
             FROM idempotency WHERE key = ?1",
            params![key],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            },
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO idempotency (key, operation_kind, input_hash, status,
                                          response_json, reserved_at, expires_at)
                 VALUES (?1, ?2, ?3, 'PROCESSING', NULL, ?4, ?5)",
                params![key, operation_kind, input_hash, now_ms, expires_at],
            )?;
            debug!(key, operation_kind, "reserved idempotency key");
            Ok(Reservation::New)
        }
        Some((row_kind, row_hash, status, response_json, row_expires)) => {
            if row_kind != operation_kind || row_hash != input_hash {
                return Err(CoreError::IdempotencyKeyReused { key: key.to_string() });
            }
            match status.as_str() {
                "COMPLETED" => {
                    let response = response_json
                        .map(|json| serde_json::from_str(&json))
                        .transpose()?
                        .unwrap_or(serde_json::Value::Null);
                    Ok(Reservation::Completed(response))
                }
                "PROCESSING" if row_expires > now_ms => {
                    Err(CoreError::OperationInProgress { key: key.to_string() })
                }
                // FAILED, or PROCESSING past its TTL: take the reservation over.
                _ => {
                    conn.execute(
                        "UPDATE idempotency
                         SET status = 'PROCESSING', response_json = NULL,
                             reserved_at = ?2, expires_at = ?3
                         WHERE key = ?1",
                        params![key, now_ms, expires_at],
                    )?;
                    debug!(key, operation_kind, "re-reserved idempotency key");
                    Ok(Reservation::New)
                }
            }
        }
    }
}

/// PROCESSING -> COMPLETED with the cached response. Commits with the command
/// transaction.
pub fn record_result(
    conn: &Connection,
    key: &str,
    response: &serde_json::Value,
) -> CoreResult<()> {
    let json = serde_json::to_string(response)?;
    conn.execute(
        "UPDATE idempotency SET status = 'COMPLETED', response_json = ?2 WHERE key = ?1",
        params![key, json],
    )?;
    Ok(())
}

/// PROCESSING -> FAILED so the caller may retry with the same key. Runs in
/// its own transaction after the command rolled back.
pub fn record_failure(conn: &Connection, key: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE idempotency SET status = 'FAILED' WHERE key = ?1 AND status = 'PROCESSING'",
        params![key],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::Db;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(3600);

    #[test]
    fn fresh_key_reserves() {
        let db = Db::in_memory().unwrap();
        let r = db
            .with_tx(|tx| check_and_reserve(tx, "key-00001", "SubmitClaim", "h1", TTL, 1_000))
            .unwrap();
        assert!(matches!(r, Reservation::New));
    }

    #[test]
    fn completed_key_replays_response() {
        let db = Db::in_memory().unwrap();
        db.with_tx(|tx| {
            check_and_reserve(tx, "key-00002", "SubmitClaim", "h1", TTL, 1_000)?;
            record_result(tx, "key-00002", &json!({ "claimId": "clm_1" }))
        })
        .unwrap();

        let r = db
            .with_tx(|tx| check_and_reserve(tx, "key-00002", "SubmitClaim", "h1", TTL, 2_000))
            .unwrap();
        match r {
            Reservation::Completed(response) => {
                assert_eq!(response["claimId"], "clm_1");
            }
            other => panic!("expected cached completion, got {:?}", other),
        }
    }

    #[test]
    fn live_processing_conflicts() {
        let db = Db::in_memory().unwrap();
        db.with_tx(|tx| check_and_reserve(tx, "key-00003", "SubmitClaim", "h1", TTL, 1_000))
            .unwrap();
        let err = db
            .with_tx(|tx| check_and_reserve(tx, "key-00003", "SubmitClaim", "h1", TTL, 2_000))
            .unwrap_err();
        assert_eq!(err.code(), "OPERATION_IN_PROGRESS");
    }

    #[test]
    fn failed_key_can_be_retried() {
        let db = Db::in_memory().unwrap();
        db.with_tx(|tx| check_and_reserve(tx, "key-00004", "SubmitClaim", "h1", TTL, 1_000))
            .unwrap();
        db.with_tx(|tx| record_failure(tx, "key-00004")).unwrap();
        let r = db
            .with_tx(|tx| check_and_reserve(tx, "key-00004", "SubmitClaim", "h1", TTL, 2_000))
            .unwrap();
        assert!(matches!(r, Reservation::New));
    }

    #[test]
    fn expired_processing_is_taken_over() {
        let db = Db::in_memory().unwrap();
        db.with_tx(|tx| {
            check_and_reserve(tx, "key-00005", "SubmitClaim", "h1", Duration::from_millis(10), 1_000)
        })
        .unwrap();
        // Well past 1_000 + 10ms.
        let r = db
            .with_tx(|tx| check_and_reserve(tx, "key-00005", "SubmitClaim", "h1", TTL, 60_000))
            .unwrap();
        assert!(matches!(r, Reservation::New));
    }

    #[test]
    fn key_scoped_to_operation_and_inputs() {
        let db = Db::in_memory().unwrap();
        db.with_tx(|tx| check_and_reserve(tx, "key-00006", "SubmitClaim", "h1", TTL, 1_000))
            .unwrap();
        let wrong_kind = db
            .with_tx(|tx| check_and_reserve(tx, "key-00006", "IssueVoucher", "h1", TTL, 2_000))
            .unwrap_err();
        assert_eq!(wrong_kind.code(), "IDEMPOTENCY_KEY_REUSED");
        let wrong_hash = db
            .with_tx(|tx| check_and_reserve(tx, "key-00006", "SubmitClaim", "h2", TTL, 2_000))
            .unwrap_err();
        assert_eq!(wrong_hash.code(), "IDEMPOTENCY_KEY_REUSED");
    }
}
