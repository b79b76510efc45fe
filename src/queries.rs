//! Read-only query surface over the projections, plus the paginated event
//! feed.
//!
//! Queries never touch aggregates or the lock table; they read whatever the
//! projections currently say. Event pagination uses the same exclusive
//! `(ingested_at, event_id)` watermark as rebuild.

use crate::domain::event::{Event, Watermark};
use crate::domain::ids::CycleId;
use crate::errors::CoreResult;
use crate::store::artifacts::{self, ArtifactRecord};
use crate::store::db::Db;
use crate::store::event_log;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherRow {
    pub voucher_id: String,
    pub cycle_id: String,
    pub grant_id: String,
    pub code: String,
    pub county: String,
    pub status: String,
    pub is_lirp: bool,
    pub max_reimbursement_cents: i64,
    pub valid_until: String,
    pub redeemed_claim_id: Option<String>,
}

fn voucher_row(row: &Row<'_>) -> rusqlite::Result<VoucherRow> {
    Ok(VoucherRow {
        voucher_id: row.get(0)?,
        cycle_id: row.get(1)?,
        grant_id: row.get(2)?,
        code: row.get(3)?,
        county: row.get(4)?,
        status: row.get(5)?,
        is_lirp: row.get::<_, i64>(6)? != 0,
        max_reimbursement_cents: row.get(7)?,
        valid_until: row.get(8)?,
        redeemed_claim_id: row.get(9)?,
    })
}

const VOUCHER_COLS: &str = "voucher_id, cycle_id, grant_id, code, county, status, is_lirp,
     max_reimbursement_cents, valid_until, redeemed_claim_id";

pub fn voucher_by_id(db: &Db, voucher_id: &str) -> CoreResult<Option<VoucherRow>> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                &format!("SELECT {VOUCHER_COLS} FROM vouchers WHERE voucher_id = ?1"),
                params![voucher_id],
                voucher_row,
            )
            .optional()?)
    })
}

pub fn voucher_by_code(db: &Db, code: &str) -> CoreResult<Option<VoucherRow>> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                &format!("SELECT {VOUCHER_COLS} FROM vouchers WHERE code = ?1"),
                params![code],
                voucher_row,
            )
            .optional()?)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRow {
    pub claim_id: String,
    pub cycle_id: String,
    pub voucher_id: String,
    pub clinic_id: String,
    pub fingerprint: String,
    pub status: String,
    pub date_of_service: String,
    pub amount_cents: i64,
    pub approved_amount_cents: Option<i64>,
    pub invoice_id: Option<String>,
}

fn claim_row(row: &Row<'_>) -> rusqlite::Result<ClaimRow> {
    Ok(ClaimRow {
        claim_id: row.get(0)?,
        cycle_id: row.get(1)?,
        voucher_id: row.get(2)?,
        clinic_id: row.get(3)?,
        fingerprint: row.get(4)?,
        status: row.get(5)?,
        date_of_service: row.get(6)?,
        amount_cents: row.get(7)?,
        approved_amount_cents: row.get(8)?,
        invoice_id: row.get(9)?,
    })
}

const CLAIM_COLS: &str = "claim_id, cycle_id, voucher_id, clinic_id, fingerprint, status,
     date_of_service, amount_cents, approved_amount_cents, invoice_id";

pub fn claim_by_id(db: &Db, claim_id: &str) -> CoreResult<Option<ClaimRow>> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                &format!("SELECT {CLAIM_COLS} FROM claims WHERE claim_id = ?1"),
                params![claim_id],
                claim_row,
            )
            .optional()?)
    })
}

pub fn claim_by_fingerprint(
    db: &Db,
    cycle_id: &CycleId,
    fingerprint: &str,
) -> CoreResult<Option<ClaimRow>> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {CLAIM_COLS} FROM claims WHERE fingerprint = ?1 AND cycle_id = ?2"
                ),
                params![fingerprint, cycle_id.as_str()],
                claim_row,
            )
            .optional()?)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRow {
    pub invoice_id: String,
    pub cycle_id: String,
    pub clinic_id: String,
    pub status: String,
    pub total_cents: i64,
    pub paid_total_cents: i64,
    pub batch_id: Option<String>,
}

pub fn invoices_by_cycle(
    db: &Db,
    cycle_id: &CycleId,
    status: Option<&str>,
) -> CoreResult<Vec<InvoiceRow>> {
    db.with_conn(|conn| {
        let mut sql = String::from(
            "SELECT invoice_id, cycle_id, clinic_id, status, total_cents, paid_total_cents,
                    batch_id
             FROM invoices WHERE cycle_id = ?1",
        );
        if status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(" ORDER BY invoice_id ASC");
        let mut stmt = conn.prepare(&sql)?;
        let map = |row: &Row<'_>| -> rusqlite::Result<InvoiceRow> {
            Ok(InvoiceRow {
                invoice_id: row.get(0)?,
                cycle_id: row.get(1)?,
                clinic_id: row.get(2)?,
                status: row.get(3)?,
                total_cents: row.get(4)?,
                paid_total_cents: row.get(5)?,
                batch_id: row.get(6)?,
            })
        };
        let rows = match status {
            Some(status) => stmt
                .query_map(params![cycle_id.as_str(), status], map)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![cycle_id.as_str()], map)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetail {
    pub batch_id: String,
    pub cycle_id: String,
    pub status: String,
    pub batch_code: String,
    pub fingerprint: String,
    pub record_count: u32,
    pub control_total_cents: i64,
    pub artifact_sha256: Option<String>,
    pub format_version: Option<String>,
    pub items: Vec<BatchItemRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemRow {
    pub position: u32,
    pub invoice_id: String,
    pub amount_cents: i64,
}

pub fn batch_detail(db: &Db, batch_id: &str) -> CoreResult<Option<BatchDetail>> {
    db.with_conn(|conn| {
        let head = conn
            .query_row(
                "SELECT batch_id, cycle_id, status, batch_code, fingerprint, record_count,
                        control_total_cents, artifact_sha256, format_version
                 FROM oasis_batches WHERE batch_id = ?1",
                params![batch_id],
                |row| {
                    Ok(BatchDetail {
                        batch_id: row.get(0)?,
                        cycle_id: row.get(1)?,
                        status: row.get(2)?,
                        batch_code: row.get(3)?,
                        fingerprint: row.get(4)?,
                        record_count: row.get(5)?,
                        control_total_cents: row.get(6)?,
                        artifact_sha256: row.get(7)?,
                        format_version: row.get(8)?,
                        items: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut detail) = head else { return Ok(None) };
        let mut stmt = conn.prepare(
            "SELECT position, invoice_id, amount_cents FROM oasis_batch_items
             WHERE batch_id = ?1 ORDER BY position ASC",
        )?;
        detail.items = stmt
            .query_map(params![batch_id], |row| {
                Ok(BatchItemRow {
                    position: row.get(0)?,
                    invoice_id: row.get(1)?,
                    amount_cents: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(detail))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketRow {
    pub bucket: String,
    pub awarded: i64,
    pub available: i64,
    pub encumbered: i64,
    pub liquidated: i64,
    pub released: i64,
}

pub fn grant_balances(db: &Db, grant_id: &str) -> CoreResult<Vec<BucketRow>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT bucket, awarded, available, encumbered, liquidated, released
             FROM grant_buckets WHERE grant_id = ?1 ORDER BY bucket ASC",
        )?;
        let rows = stmt
            .query_map(params![grant_id], |row| {
                Ok(BucketRow {
                    bucket: row.get(0)?,
                    awarded: row.get(1)?,
                    available: row.get(2)?,
                    encumbered: row.get(3)?,
                    liquidated: row.get(4)?,
                    released: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseoutRow {
    pub cycle_id: String,
    pub status: String,
    pub checks_json: String,
    pub financial_json: Option<String>,
    pub closed_by: Option<String>,
    pub final_balance_cents: Option<i64>,
}

pub fn closeout_status(db: &Db, cycle_id: &CycleId) -> CoreResult<Option<CloseoutRow>> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT cycle_id, status, checks_json, financial_json, closed_by,
                        final_balance_cents
                 FROM closeouts WHERE cycle_id = ?1",
                params![cycle_id.as_str()],
                |row| {
                    Ok(CloseoutRow {
                        cycle_id: row.get(0)?,
                        status: row.get(1)?,
                        checks_json: row.get(2)?,
                        financial_json: row.get(3)?,
                        closed_by: row.get(4)?,
                        final_balance_cents: row.get(5)?,
                    })
                },
            )
            .optional()?)
    })
}

/// Paginated event feed in canonical replay order.
pub fn events_since(db: &Db, watermark: Watermark, limit: u32) -> CoreResult<Vec<Event>> {
    db.with_conn(|conn| event_log::fetch_since(conn, watermark, limit))
}

/// Fetch a rendered artifact by content address.
pub fn artifact(db: &Db, sha256: &str) -> CoreResult<Option<ArtifactRecord>> {
    db.with_conn(|conn| artifacts::get(conn, sha256))
}
