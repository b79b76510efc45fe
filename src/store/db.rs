//! SQLite database handle, schema and transaction helpers.
//!
//! The event log and artifact tables are insert-only: UPDATE and DELETE are
//! rejected by triggers raising `IMMUTABILITY_VIOLATION`. `ingested_at` is
//! stamped by a storage-side column default; the append path never binds it.
//! Grant bucket arithmetic is enforced twice, here as a CHECK constraint and
//! in the domain fold.

use crate::config::Config;
use crate::errors::{CoreError, CoreResult};
use crate::store::locks::LockTable;
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Schema version. Bump on layout changes.
const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
-- ===========================================================================
-- EVENT LOG (sole source of truth, append-only)
-- ===========================================================================
CREATE TABLE IF NOT EXISTS events (
    event_id        TEXT PRIMARY KEY,
    aggregate_kind  TEXT NOT NULL,
    aggregate_id    TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    event_data      TEXT NOT NULL,
    occurred_at     TEXT NOT NULL,
    -- Server stamp: epoch milliseconds, never bound by callers.
    ingested_at     INTEGER NOT NULL DEFAULT (CAST(unixepoch('subsec') * 1000 AS INTEGER)),
    cycle_id        TEXT NOT NULL,
    correlation_id  TEXT NOT NULL,
    causation_id    TEXT,
    actor_id        TEXT NOT NULL,
    actor_kind      TEXT NOT NULL
);

-- Canonical replay order.
CREATE INDEX IF NOT EXISTS idx_events_ingest ON events(ingested_at, event_id);
CREATE INDEX IF NOT EXISTS idx_events_aggregate
    ON events(aggregate_kind, aggregate_id, ingested_at, event_id);
CREATE INDEX IF NOT EXISTS idx_events_cycle_type ON events(cycle_id, event_type);

CREATE TRIGGER IF NOT EXISTS events_no_update
BEFORE UPDATE ON events
BEGIN
    SELECT RAISE(ABORT, 'IMMUTABILITY_VIOLATION');
END;

CREATE TRIGGER IF NOT EXISTS events_no_delete
BEFORE DELETE ON events
BEGIN
    SELECT RAISE(ABORT, 'IMMUTABILITY_VIOLATION');
END;

-- ===========================================================================
-- IDEMPOTENCY LEDGER
-- ===========================================================================
CREATE TABLE IF NOT EXISTS idempotency (
    key             TEXT PRIMARY KEY,
    operation_kind  TEXT NOT NULL,
    input_hash      TEXT NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('PROCESSING','COMPLETED','FAILED')),
    response_json   TEXT,
    reserved_at     INTEGER NOT NULL,
    expires_at      INTEGER NOT NULL
);

-- ===========================================================================
-- ARTIFACT STORE (content-addressed, insert-only)
-- ===========================================================================
CREATE TABLE IF NOT EXISTS artifacts (
    sha256        TEXT PRIMARY KEY,
    content       BLOB NOT NULL,
    content_type  TEXT NOT NULL,
    byte_len      INTEGER NOT NULL,
    created_at    INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS artifacts_no_update
BEFORE UPDATE ON artifacts
BEGIN
    SELECT RAISE(ABORT, 'IMMUTABILITY_VIOLATION');
END;

CREATE TRIGGER IF NOT EXISTS artifacts_no_delete
BEFORE DELETE ON artifacts
BEGIN
    SELECT RAISE(ABORT, 'IMMUTABILITY_VIOLATION');
END;

-- ===========================================================================
-- PROJECTIONS (derived, disposable, rebuildable)
-- Every row carries rebuilt_at / watermark_ingested_at / watermark_event_id.
-- ===========================================================================
CREATE TABLE IF NOT EXISTS grants (
    grant_id                TEXT PRIMARY KEY,
    cycle_id                TEXT NOT NULL,
    rate_numerator          INTEGER NOT NULL,
    rate_denominator        INTEGER NOT NULL,
    period_start            TEXT NOT NULL,
    period_end              TEXT NOT NULL,
    matching_committed_cents INTEGER NOT NULL,
    matching_reported_cents  INTEGER NOT NULL,
    claims_deadline_passed  INTEGER NOT NULL,
    rebuilt_at              INTEGER NOT NULL,
    watermark_ingested_at   INTEGER NOT NULL,
    watermark_event_id      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_grants_cycle ON grants(cycle_id);

CREATE TABLE IF NOT EXISTS grant_buckets (
    grant_id     TEXT NOT NULL,
    bucket       TEXT NOT NULL CHECK (bucket IN ('GENERAL','LIRP')),
    awarded      INTEGER NOT NULL,
    available    INTEGER NOT NULL,
    encumbered   INTEGER NOT NULL,
    liquidated   INTEGER NOT NULL,
    released     INTEGER NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL,
    PRIMARY KEY (grant_id, bucket),
    CHECK (available + encumbered + liquidated = awarded),
    CHECK (available >= 0 AND encumbered >= 0 AND liquidated >= 0 AND released >= 0),
    CHECK (released <= awarded)
);

CREATE TABLE IF NOT EXISTS vouchers (
    voucher_id              TEXT PRIMARY KEY,
    cycle_id                TEXT NOT NULL,
    grant_id                TEXT NOT NULL,
    code                    TEXT NOT NULL,
    county                  TEXT NOT NULL,
    status                  TEXT NOT NULL,
    is_lirp                 INTEGER NOT NULL,
    max_reimbursement_cents INTEGER NOT NULL,
    valid_until             TEXT NOT NULL,
    tentative_expires_at    INTEGER,
    redeemed_claim_id       TEXT,
    void_reason             TEXT,
    rebuilt_at              INTEGER NOT NULL,
    watermark_ingested_at   INTEGER NOT NULL,
    watermark_event_id      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vouchers_code ON vouchers(code);
CREATE INDEX IF NOT EXISTS idx_vouchers_sweep ON vouchers(status, tentative_expires_at);

CREATE TABLE IF NOT EXISTS allocators (
    cycle_id      TEXT NOT NULL,
    county        TEXT NOT NULL,
    next_sequence INTEGER NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL,
    PRIMARY KEY (cycle_id, county)
);

CREATE TABLE IF NOT EXISTS clinics (
    clinic_id          TEXT PRIMARY KEY,
    name               TEXT NOT NULL,
    status             TEXT NOT NULL,
    license_number     TEXT NOT NULL,
    license_status     TEXT NOT NULL,
    license_expires_at TEXT NOT NULL,
    oasis_vendor_code  TEXT,
    payee_name         TEXT,
    remit_address      TEXT,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS claims (
    claim_id              TEXT PRIMARY KEY,
    cycle_id              TEXT NOT NULL,
    voucher_id            TEXT NOT NULL,
    clinic_id             TEXT NOT NULL,
    fingerprint           TEXT NOT NULL,
    status                TEXT NOT NULL,
    procedure_code        TEXT NOT NULL,
    date_of_service       TEXT NOT NULL,
    amount_cents          INTEGER NOT NULL,
    copay_cents           INTEGER NOT NULL,
    rabies_included       INTEGER NOT NULL,
    approved_amount_cents INTEGER,
    decision_basis        TEXT,
    invoice_id            TEXT,
    artifacts_json        TEXT NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL,
    UNIQUE (fingerprint, cycle_id)
);
CREATE INDEX IF NOT EXISTS idx_claims_cycle_status ON claims(cycle_id, status);
CREATE INDEX IF NOT EXISTS idx_claims_clinic ON claims(clinic_id, status);

CREATE TABLE IF NOT EXISTS invoices (
    invoice_id        TEXT PRIMARY KEY,
    cycle_id          TEXT NOT NULL,
    clinic_id         TEXT NOT NULL,
    status            TEXT NOT NULL,
    total_cents       INTEGER NOT NULL,
    paid_total_cents  INTEGER NOT NULL,
    payment_count     INTEGER NOT NULL,
    batch_id          TEXT,
    period_start      TEXT NOT NULL,
    period_end        TEXT NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_invoices_cycle_status ON invoices(cycle_id, status);
CREATE INDEX IF NOT EXISTS idx_invoices_export
    ON invoices(status, batch_id, watermark_ingested_at, watermark_event_id);

CREATE TABLE IF NOT EXISTS invoice_payments (
    payment_id   TEXT PRIMARY KEY,
    invoice_id   TEXT NOT NULL,
    cycle_id     TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    paid_at      INTEGER NOT NULL,
    reference    TEXT NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_payments_invoice ON invoice_payments(invoice_id);

CREATE TABLE IF NOT EXISTS invoice_adjustments (
    adjustment_id     TEXT PRIMARY KEY,
    cycle_id          TEXT NOT NULL,
    amount_cents      INTEGER NOT NULL,
    reason            TEXT NOT NULL,
    target_invoice_id TEXT,
    applied           INTEGER NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_adjustments_pending
    ON invoice_adjustments(cycle_id, target_invoice_id);

CREATE TABLE IF NOT EXISTS oasis_batches (
    batch_id              TEXT PRIMARY KEY,
    cycle_id              TEXT NOT NULL,
    status                TEXT NOT NULL,
    batch_code            TEXT NOT NULL,
    fingerprint           TEXT NOT NULL,
    period_start          TEXT NOT NULL,
    period_end            TEXT NOT NULL,
    selection_wm_ingested_at INTEGER NOT NULL,
    selection_wm_event_id    TEXT NOT NULL,
    record_count          INTEGER NOT NULL,
    control_total_cents   INTEGER NOT NULL,
    artifact_sha256       TEXT,
    content_length        INTEGER NOT NULL,
    format_version        TEXT,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_batches_selection
    ON oasis_batches(cycle_id, period_start, period_end,
                     selection_wm_ingested_at, selection_wm_event_id);

CREATE TABLE IF NOT EXISTS oasis_batch_items (
    batch_id     TEXT NOT NULL,
    position     INTEGER NOT NULL,
    invoice_id   TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL,
    PRIMARY KEY (batch_id, position)
);

CREATE TABLE IF NOT EXISTS closeouts (
    cycle_id            TEXT PRIMARY KEY,
    status              TEXT NOT NULL,
    pre_hold_status     TEXT,
    checks_json         TEXT NOT NULL,
    financial_json      TEXT,
    matching_json       TEXT,
    activity_json       TEXT,
    reconciled_wm_ingested_at INTEGER,
    reconciled_wm_event_id    TEXT,
    closed_by           TEXT,
    final_balance_cents INTEGER,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS breeder_filings (
    filing_id          TEXT PRIMARY KEY,
    cycle_id           TEXT NOT NULL,
    breeder_id         TEXT NOT NULL,
    due_at             INTEGER NOT NULL,
    submitted_at       INTEGER,
    cured_at           INTEGER,
    cure_period_days   INTEGER NOT NULL,
    -- Wall-clock-derived; excluded from rebuild determinism.
    compliance_status  TEXT NOT NULL,
    status_computed_at INTEGER NOT NULL,
    rebuilt_at            INTEGER NOT NULL,
    watermark_ingested_at INTEGER NOT NULL,
    watermark_event_id    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_filings_due ON breeder_filings(compliance_status, due_at);
"#;

/// Projection tables in FK-child-first truncation order.
pub const PROJECTION_TABLES: &[&str] = &[
    "oasis_batch_items",
    "invoice_payments",
    "invoice_adjustments",
    "grant_buckets",
    "oasis_batches",
    "invoices",
    "claims",
    "clinics",
    "allocators",
    "vouchers",
    "grants",
    "closeouts",
    "breeder_filings",
];

/// Shared database handle. One writer connection behind a mutex; commands
/// serialize their transactions on it, and the lock table provides
/// aggregate-level mutual exclusion above it.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    locks: Arc<LockTable>,
    config: Config,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, config)
    }

    /// In-memory database (for tests).
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, Config::default())
    }

    fn from_connection(conn: Connection, config: Config) -> CoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.busy_timeout(config.statement_timeout)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: Arc::new(LockTable::new()),
            config,
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match current {
            None => {
                conn.execute_batch(SCHEMA_SQL)?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
                info!("created schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!("schema version mismatch: expected {}, got {}", SCHEMA_VERSION, v);
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Run `f` inside one IMMEDIATE transaction; commit on Ok, roll back on
    /// Err.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> CoreResult<T>) -> CoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Transaction rolls back on drop.
                Err(e)
            }
        }
    }

    /// Read-only access outside any explicit transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Retry transient storage failures with exponential backoff and jitter.
/// Business errors surface on first occurrence.
pub fn with_retry<T>(config: &Config, mut op: impl FnMut() -> CoreResult<T>) -> CoreResult<T> {
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt + 1 < config.retry_attempts.max(1) => {
                let base = config.retry_backoff_base.as_millis() as u64;
                let backoff = base.saturating_mul(1u64 << attempt.min(16));
                let jitter = rand::thread_rng().gen_range(0..=base.max(1));
                let sleep = Duration::from_millis(backoff + jitter);
                warn!(code = %e.code(), attempt, "transient storage error, retrying in {:?}", sleep);
                std::thread::sleep(sleep);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_in_memory() {
        let db = Db::in_memory().unwrap();
        db.with_conn(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type='table'", [], |r| {
                    r.get(0)
                })
                .map_err(CoreError::from)?;
            assert!(n > 10);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn grant_bucket_check_constraint_enforced() {
        let db = Db::in_memory().unwrap();
        let err = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO grant_buckets (grant_id, bucket, awarded, available, encumbered,
                     liquidated, released, rebuilt_at, watermark_ingested_at, watermark_event_id)
                 VALUES ('g1','GENERAL', 100, 90, 0, 0, 0, 0, 0, 'x')",
                [],
            )
            .map_err(CoreError::from)?;
            Ok(())
        });
        assert!(err.is_err(), "90 + 0 + 0 != 100 must be rejected");
    }

    #[test]
    fn retry_gives_up_after_configured_attempts() {
        let config = Config { retry_backoff_base: Duration::from_millis(1), ..Config::default() };
        let mut calls = 0;
        let result: CoreResult<()> = with_retry(&config, || {
            calls += 1;
            Err(CoreError::StorageTimeout { detail: "busy".into() })
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_does_not_retry_business_errors() {
        let config = Config::default();
        let mut calls = 0;
        let result: CoreResult<()> = with_retry(&config, || {
            calls += 1;
            Err(CoreError::LirpCopayForbidden)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
