//! Projection engine.
//!
//! Projections are derived, disposable read rows. Two write paths share the
//! same fold and row-writer code so they produce identical bytes:
//!
//! - **Incremental**: after a command appends events, it refolds each touched
//!   aggregate from its full event history and upserts the row inside the
//!   same transaction.
//! - **Full rebuild**: truncate child-first, fold the entire log once in
//!   `(ingested_at, event_id)` order with per-aggregate in-memory state, and
//!   insert the final states.
//!
//! Every row carries `rebuilt_at`, `watermark_ingested_at` and
//! `watermark_event_id`; the watermark names the last event folded into the
//! row. `rebuilt_at` and the breeder `compliance_status` are wall-clock
//! derived and excluded from the determinism contract. Unknown event types
//! are skipped.

use crate::domain::breeder::FilingState;
use crate::domain::claim::ClaimState;
use crate::domain::clinic::ClinicState;
use crate::domain::closeout::CloseoutState;
use crate::domain::event::{self, AggregateKind, Event, Watermark};
use crate::domain::grant::{Bucket, GrantState};
use crate::domain::ids::{
    BatchId, ClaimId, ClinicId, CycleId, FilingId, GrantId, InvoiceId, VoucherId,
};
use crate::domain::invoice::{
    AdjustmentAppliedData, AdjustmentRecordedData, InvoiceState, PaymentRecordedData,
};
use crate::domain::oasis_batch::{BatchItemAddedData, BatchState};
use crate::domain::voucher::{VoucherIssuedData, VoucherState};
use crate::errors::{CoreError, CoreResult};
use crate::store::db::{Db, PROJECTION_TABLES};
use crate::store::event_log;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Page size when streaming the log during a full rebuild.
const REBUILD_PAGE: u32 = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildReport {
    pub events_replayed: u64,
    pub aggregates_written: u64,
}

// ===========================================================================
// INCREMENTAL PATH
// ===========================================================================

/// Project a command's freshly appended events: refold every touched
/// aggregate, then apply child-row and allocator effects per event. Runs in
/// the command's transaction.
pub fn project_events(tx: &Connection, events: &[Event], now_ms: i64) -> CoreResult<()> {
    let mut touched: Vec<(AggregateKind, String)> = events
        .iter()
        .map(|ev| (ev.aggregate_kind, ev.aggregate_id.clone()))
        .collect();
    touched.sort();
    touched.dedup();
    for (kind, aggregate_id) in &touched {
        refold_aggregate(tx, *kind, aggregate_id, now_ms)?;
    }
    for ev in events {
        dispatch_child(tx, ev, now_ms)?;
    }
    Ok(())
}

/// Refold one aggregate from its complete event history and upsert its row.
pub fn refold_aggregate(
    tx: &Connection,
    kind: AggregateKind,
    aggregate_id: &str,
    now_ms: i64,
) -> CoreResult<()> {
    let events = event_log::fetch_aggregate(tx, kind, aggregate_id)?;
    let Some(last) = events.last() else {
        return Ok(());
    };
    let watermark = last.watermark();
    let mut state = AnyState::empty(kind, aggregate_id);
    for ev in &events {
        state.apply(ev)?;
    }
    state.check_invariant()?;
    state.write(tx, watermark, now_ms)?;
    Ok(())
}

// ===========================================================================
// FULL REBUILD (single-writer, truncate then reinsert)
// ===========================================================================

/// Rebuild every projection from the event log in one transaction.
pub fn rebuild_all(db: &Db, now_ms: i64) -> CoreResult<RebuildReport> {
    db.with_tx(|tx| {
        for table in PROJECTION_TABLES {
            tx.execute(&format!("DELETE FROM {}", table), [])?;
        }

        let mut report = RebuildReport::default();
        // BTreeMap keeps the final insert order deterministic.
        let mut states: BTreeMap<(String, String), (AnyState, Watermark)> = BTreeMap::new();
        let mut watermark = Watermark::zero();
        loop {
            let page = event_log::fetch_since(tx, watermark, REBUILD_PAGE)?;
            if page.is_empty() {
                break;
            }
            for ev in &page {
                report.events_replayed += 1;
                let key = (ev.aggregate_kind.as_str().to_string(), ev.aggregate_id.clone());
                let entry = states.entry(key).or_insert_with(|| {
                    (AnyState::empty(ev.aggregate_kind, &ev.aggregate_id), ev.watermark())
                });
                entry.0.apply(ev)?;
                entry.1 = ev.watermark();
                dispatch_child(tx, ev, now_ms)?;
            }
            watermark = page.last().map(|ev| ev.watermark()).unwrap_or(watermark);
        }

        for (state, state_watermark) in states.values() {
            state.check_invariant()?;
            if state.write(tx, *state_watermark, now_ms)? {
                report.aggregates_written += 1;
            }
        }
        info!(
            events = report.events_replayed,
            aggregates = report.aggregates_written,
            "projection rebuild complete"
        );
        Ok(report)
    })
}

// ===========================================================================
// CHILD ROWS & ALLOCATORS (per-event effects shared by both paths)
// ===========================================================================

/// Per-event effects on rows that are not the emitting aggregate's main row:
/// payments, adjustments, batch items, and the voucher-code allocator.
fn dispatch_child(tx: &Connection, ev: &Event, now_ms: i64) -> CoreResult<()> {
    let wm = ev.watermark();
    match ev.event_type.as_str() {
        event::INVOICE_PAYMENT_RECORDED => {
            let data: PaymentRecordedData = serde_json::from_value(ev.event_data.clone())?;
            tx.execute(
                "INSERT INTO invoice_payments (payment_id, invoice_id, cycle_id, amount_cents,
                     paid_at, reference, rebuilt_at, watermark_ingested_at, watermark_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(payment_id) DO NOTHING",
                params![
                    data.payment_id,
                    ev.aggregate_id,
                    ev.cycle_id.as_str(),
                    data.amount_cents.get(),
                    data.paid_at.timestamp_millis(),
                    data.reference,
                    now_ms,
                    wm.ingested_at_ms,
                    wm.event_id.to_string(),
                ],
            )?;
        }
        event::INVOICE_ADJUSTMENT_RECORDED => {
            let data: AdjustmentRecordedData = serde_json::from_value(ev.event_data.clone())?;
            tx.execute(
                "INSERT INTO invoice_adjustments (adjustment_id, cycle_id, amount_cents, reason,
                     target_invoice_id, applied, rebuilt_at,
                     watermark_ingested_at, watermark_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8)
                 ON CONFLICT(adjustment_id) DO NOTHING",
                params![
                    data.adjustment_id,
                    ev.cycle_id.as_str(),
                    data.amount_cents.get(),
                    data.reason,
                    data.target_invoice_id.as_ref().map(|id| id.as_str().to_string()),
                    now_ms,
                    wm.ingested_at_ms,
                    wm.event_id.to_string(),
                ],
            )?;
        }
        event::INVOICE_ADJUSTMENT_APPLIED => {
            let data: AdjustmentAppliedData = serde_json::from_value(ev.event_data.clone())?;
            tx.execute(
                "UPDATE invoice_adjustments
                 SET applied = 1, target_invoice_id = ?2,
                     rebuilt_at = ?3, watermark_ingested_at = ?4, watermark_event_id = ?5
                 WHERE adjustment_id = ?1",
                params![
                    data.adjustment_id,
                    ev.aggregate_id,
                    now_ms,
                    wm.ingested_at_ms,
                    wm.event_id.to_string(),
                ],
            )?;
        }
        event::OASIS_EXPORT_BATCH_ITEM_ADDED => {
            let data: BatchItemAddedData = serde_json::from_value(ev.event_data.clone())?;
            tx.execute(
                "INSERT INTO oasis_batch_items (batch_id, position, invoice_id, amount_cents,
                     rebuilt_at, watermark_ingested_at, watermark_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(batch_id, position) DO NOTHING",
                params![
                    ev.aggregate_id,
                    data.position,
                    data.invoice_id.as_str(),
                    data.amount_cents.get(),
                    now_ms,
                    wm.ingested_at_ms,
                    wm.event_id.to_string(),
                ],
            )?;
        }
        event::VOUCHER_ISSUED | event::VOUCHER_ISSUED_TENTATIVE => {
            let data: VoucherIssuedData = serde_json::from_value(ev.event_data.clone())?;
            let county = data.county.to_ascii_uppercase();
            tx.execute(
                "INSERT INTO allocators (cycle_id, county, next_sequence, rebuilt_at,
                     watermark_ingested_at, watermark_event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(cycle_id, county) DO UPDATE SET
                     next_sequence = MAX(next_sequence, excluded.next_sequence),
                     rebuilt_at = excluded.rebuilt_at,
                     watermark_ingested_at = excluded.watermark_ingested_at,
                     watermark_event_id = excluded.watermark_event_id",
                params![
                    ev.cycle_id.as_str(),
                    county,
                    data.sequence + 1,
                    now_ms,
                    wm.ingested_at_ms,
                    wm.event_id.to_string(),
                ],
            )?;
        }
        _ => {}
    }
    Ok(())
}

// ===========================================================================
// PER-AGGREGATE STATE DISPATCH
// ===========================================================================

/// Tagged-variant dispatch over aggregate kinds; keeps `apply` pure and one
/// writer per projection table.
enum AnyState {
    Grant(GrantState),
    Voucher(VoucherState),
    Clinic(ClinicState),
    Claim(ClaimState),
    Invoice(InvoiceState),
    Batch(BatchState),
    Closeout(CloseoutState),
    Filing(FilingState),
    /// Allocator rows are maintained per event in `dispatch_child`.
    Passive,
}

impl AnyState {
    fn empty(kind: AggregateKind, aggregate_id: &str) -> Self {
        match kind {
            AggregateKind::Grant => Self::Grant(GrantState::empty(GrantId::new(aggregate_id))),
            AggregateKind::Voucher => {
                Self::Voucher(VoucherState::empty(VoucherId::new(aggregate_id)))
            }
            AggregateKind::Clinic => Self::Clinic(ClinicState::empty(ClinicId::new(aggregate_id))),
            AggregateKind::Claim => Self::Claim(ClaimState::empty(ClaimId::new(aggregate_id))),
            AggregateKind::Invoice => {
                Self::Invoice(InvoiceState::empty(InvoiceId::new(aggregate_id)))
            }
            AggregateKind::OasisBatch => Self::Batch(BatchState::empty(BatchId::new(aggregate_id))),
            AggregateKind::Closeout => {
                Self::Closeout(CloseoutState::empty(CycleId::new(aggregate_id)))
            }
            AggregateKind::BreederFiling => {
                Self::Filing(FilingState::empty(FilingId::new(aggregate_id)))
            }
            AggregateKind::Allocator => Self::Passive,
        }
    }

    fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match self {
            Self::Grant(s) => s.apply(ev),
            Self::Voucher(s) => s.apply(ev),
            Self::Clinic(s) => s.apply(ev),
            Self::Claim(s) => s.apply(ev),
            Self::Invoice(s) => s.apply(ev),
            Self::Batch(s) => s.apply(ev),
            Self::Closeout(s) => s.apply(ev),
            Self::Filing(s) => s.apply(ev),
            Self::Passive => Ok(()),
        }
    }

    fn check_invariant(&self) -> CoreResult<()> {
        match self {
            Self::Grant(s) => s.check_invariant(),
            Self::Voucher(s) => s.check_invariant(),
            Self::Clinic(s) => s.check_invariant(),
            Self::Claim(s) => s.check_invariant(),
            Self::Invoice(s) => s.check_invariant(),
            Self::Batch(s) => s.check_invariant(),
            Self::Closeout(s) => s.check_invariant(),
            Self::Filing(_) | Self::Passive => Ok(()),
        }
    }

    /// Upsert the row(s); returns false when the state never materialized
    /// (an aggregate that only saw unknown or advisory events).
    fn write(&self, tx: &Connection, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
        match self {
            Self::Grant(s) => write_grant(tx, s, wm, now_ms),
            Self::Voucher(s) => write_voucher(tx, s, wm, now_ms),
            Self::Clinic(s) => write_clinic(tx, s, wm, now_ms),
            Self::Claim(s) => write_claim(tx, s, wm, now_ms),
            Self::Invoice(s) => write_invoice(tx, s, wm, now_ms),
            Self::Batch(s) => write_batch(tx, s, wm, now_ms),
            Self::Closeout(s) => write_closeout(tx, s, wm, now_ms),
            Self::Filing(s) => write_filing(tx, s, wm, now_ms),
            Self::Passive => Ok(false),
        }
    }
}

// ===========================================================================
// ROW WRITERS
// ===========================================================================

fn write_grant(tx: &Connection, s: &GrantState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    if s.cycle_id.as_str().is_empty() {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO grants (grant_id, cycle_id, rate_numerator, rate_denominator,
             period_start, period_end, matching_committed_cents, matching_reported_cents,
             claims_deadline_passed, rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(grant_id) DO UPDATE SET
             cycle_id = excluded.cycle_id,
             rate_numerator = excluded.rate_numerator,
             rate_denominator = excluded.rate_denominator,
             period_start = excluded.period_start,
             period_end = excluded.period_end,
             matching_committed_cents = excluded.matching_committed_cents,
             matching_reported_cents = excluded.matching_reported_cents,
             claims_deadline_passed = excluded.claims_deadline_passed,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.grant_id.as_str(),
            s.cycle_id.as_str(),
            s.rate.numerator,
            s.rate.denominator,
            s.period_start.to_string(),
            s.period_end.to_string(),
            s.matching_committed.get(),
            s.matching_reported.get(),
            s.claims_deadline_passed as i64,
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    for (bucket, balances) in [(Bucket::General, &s.general), (Bucket::Lirp, &s.lirp)] {
        tx.execute(
            "INSERT INTO grant_buckets (grant_id, bucket, awarded, available, encumbered,
                 liquidated, released, rebuilt_at, watermark_ingested_at, watermark_event_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(grant_id, bucket) DO UPDATE SET
                 awarded = excluded.awarded,
                 available = excluded.available,
                 encumbered = excluded.encumbered,
                 liquidated = excluded.liquidated,
                 released = excluded.released,
                 rebuilt_at = excluded.rebuilt_at,
                 watermark_ingested_at = excluded.watermark_ingested_at,
                 watermark_event_id = excluded.watermark_event_id",
            params![
                s.grant_id.as_str(),
                bucket.as_str(),
                balances.awarded.get(),
                balances.available.get(),
                balances.encumbered.get(),
                balances.liquidated.get(),
                balances.released.get(),
                now_ms,
                wm.ingested_at_ms,
                wm.event_id.to_string(),
            ],
        )?;
    }
    Ok(true)
}

fn write_voucher(tx: &Connection, s: &VoucherState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    if s.code.is_empty() {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO vouchers (voucher_id, cycle_id, grant_id, code, county, status, is_lirp,
             max_reimbursement_cents, valid_until, tentative_expires_at, redeemed_claim_id,
             void_reason, rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(voucher_id) DO UPDATE SET
             cycle_id = excluded.cycle_id,
             grant_id = excluded.grant_id,
             code = excluded.code,
             county = excluded.county,
             status = excluded.status,
             is_lirp = excluded.is_lirp,
             max_reimbursement_cents = excluded.max_reimbursement_cents,
             valid_until = excluded.valid_until,
             tentative_expires_at = excluded.tentative_expires_at,
             redeemed_claim_id = excluded.redeemed_claim_id,
             void_reason = excluded.void_reason,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.voucher_id.as_str(),
            s.cycle_id.as_str(),
            s.grant_id.as_str(),
            s.code,
            s.county,
            s.status.as_str(),
            s.is_lirp as i64,
            s.max_reimbursement.get(),
            s.valid_until.to_string(),
            s.tentative_expires_at.map(|t| t.timestamp_millis()),
            s.redeemed_claim_id.as_ref().map(|id| id.as_str().to_string()),
            s.void_reason,
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    Ok(true)
}

fn write_clinic(tx: &Connection, s: &ClinicState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    if s.name.is_empty() {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO clinics (clinic_id, name, status, license_number, license_status,
             license_expires_at, oasis_vendor_code, payee_name, remit_address,
             rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(clinic_id) DO UPDATE SET
             name = excluded.name,
             status = excluded.status,
             license_number = excluded.license_number,
             license_status = excluded.license_status,
             license_expires_at = excluded.license_expires_at,
             oasis_vendor_code = excluded.oasis_vendor_code,
             payee_name = excluded.payee_name,
             remit_address = excluded.remit_address,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.clinic_id.as_str(),
            s.name,
            s.status.as_str(),
            s.license.number,
            s.license.status,
            s.license.expires_at.to_string(),
            s.oasis_vendor_code,
            s.payment_info.as_ref().map(|p| p.payee_name.clone()),
            s.payment_info.as_ref().map(|p| p.remit_address.clone()),
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    Ok(true)
}

fn write_claim(tx: &Connection, s: &ClaimState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    if s.fingerprint.is_empty() {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO claims (claim_id, cycle_id, voucher_id, clinic_id, fingerprint, status,
             procedure_code, date_of_service, amount_cents, copay_cents, rabies_included,
             approved_amount_cents, decision_basis, invoice_id, artifacts_json,
             rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(claim_id) DO UPDATE SET
             status = excluded.status,
             amount_cents = excluded.amount_cents,
             approved_amount_cents = excluded.approved_amount_cents,
             decision_basis = excluded.decision_basis,
             invoice_id = excluded.invoice_id,
             artifacts_json = excluded.artifacts_json,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.claim_id.as_str(),
            s.cycle_id.as_str(),
            s.voucher_id.as_str(),
            s.clinic_id.as_str(),
            s.fingerprint,
            s.status.as_str(),
            s.procedure_code,
            s.date_of_service.to_string(),
            s.submitted_amount.get(),
            s.copay.get(),
            s.rabies_included as i64,
            s.approved_amount.map(|a| a.get()),
            s.decision_basis,
            s.invoice_id.as_ref().map(|id| id.as_str().to_string()),
            serde_json::to_string(&s.artifacts)?,
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    Ok(true)
}

fn write_invoice(tx: &Connection, s: &InvoiceState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    if s.clinic_id.as_str().is_empty() {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO invoices (invoice_id, cycle_id, clinic_id, status, total_cents,
             paid_total_cents, payment_count, batch_id, period_start, period_end,
             rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(invoice_id) DO UPDATE SET
             status = excluded.status,
             total_cents = excluded.total_cents,
             paid_total_cents = excluded.paid_total_cents,
             payment_count = excluded.payment_count,
             batch_id = excluded.batch_id,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.invoice_id.as_str(),
            s.cycle_id.as_str(),
            s.clinic_id.as_str(),
            s.status.as_str(),
            s.total.get(),
            s.paid_total.get(),
            s.payment_count,
            s.batch_id.as_ref().map(|id| id.as_str().to_string()),
            s.period_start.to_string(),
            s.period_end.to_string(),
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    Ok(true)
}

fn write_batch(tx: &Connection, s: &BatchState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    if s.batch_code.is_empty() {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO oasis_batches (batch_id, cycle_id, status, batch_code, fingerprint,
             period_start, period_end, selection_wm_ingested_at, selection_wm_event_id,
             record_count, control_total_cents, artifact_sha256, content_length,
             format_version, rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(batch_id) DO UPDATE SET
             status = excluded.status,
             record_count = excluded.record_count,
             control_total_cents = excluded.control_total_cents,
             artifact_sha256 = excluded.artifact_sha256,
             content_length = excluded.content_length,
             format_version = excluded.format_version,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.batch_id.as_str(),
            s.cycle_id.as_str(),
            s.status.as_str(),
            s.batch_code,
            s.fingerprint,
            s.period_start.to_string(),
            s.period_end.to_string(),
            s.selection_watermark.ingested_at_ms,
            s.selection_watermark.event_id.to_string(),
            s.record_count,
            s.control_total.get(),
            s.artifact_sha256,
            s.content_length as i64,
            s.format_version,
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    Ok(true)
}

fn write_closeout(tx: &Connection, s: &CloseoutState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    tx.execute(
        "INSERT INTO closeouts (cycle_id, status, pre_hold_status, checks_json, financial_json,
             matching_json, activity_json, reconciled_wm_ingested_at, reconciled_wm_event_id,
             closed_by, final_balance_cents, rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(cycle_id) DO UPDATE SET
             status = excluded.status,
             pre_hold_status = excluded.pre_hold_status,
             checks_json = excluded.checks_json,
             financial_json = excluded.financial_json,
             matching_json = excluded.matching_json,
             activity_json = excluded.activity_json,
             reconciled_wm_ingested_at = excluded.reconciled_wm_ingested_at,
             reconciled_wm_event_id = excluded.reconciled_wm_event_id,
             closed_by = excluded.closed_by,
             final_balance_cents = excluded.final_balance_cents,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.cycle_id.as_str(),
            s.status.as_str(),
            s.pre_hold_status.map(|st| st.as_str().to_string()),
            serde_json::to_string(&s.checks)?,
            s.financial.map(|f| serde_json::to_string(&f)).transpose()?,
            s.matching.map(|m| serde_json::to_string(&m)).transpose()?,
            s.activity.map(|a| serde_json::to_string(&a)).transpose()?,
            s.reconciled_watermark.map(|w| w.ingested_at_ms),
            s.reconciled_watermark.map(|w| w.event_id.to_string()),
            s.closed_by.as_ref().map(|a| a.as_str().to_string()),
            s.final_balance.map(|c| c.get()),
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    Ok(true)
}

fn write_filing(tx: &Connection, s: &FilingState, wm: Watermark, now_ms: i64) -> CoreResult<bool> {
    if s.breeder_id.is_empty() {
        return Ok(false);
    }
    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .ok_or_else(|| CoreError::InvalidDateFormat { value: now_ms.to_string() })?;
    let status = s.status_at(now);
    tx.execute(
        "INSERT INTO breeder_filings (filing_id, cycle_id, breeder_id, due_at, submitted_at,
             cured_at, cure_period_days, compliance_status, status_computed_at,
             rebuilt_at, watermark_ingested_at, watermark_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(filing_id) DO UPDATE SET
             submitted_at = excluded.submitted_at,
             cured_at = excluded.cured_at,
             compliance_status = excluded.compliance_status,
             status_computed_at = excluded.status_computed_at,
             rebuilt_at = excluded.rebuilt_at,
             watermark_ingested_at = excluded.watermark_ingested_at,
             watermark_event_id = excluded.watermark_event_id",
        params![
            s.filing_id.as_str(),
            s.cycle_id.as_str(),
            s.breeder_id,
            s.due_at.timestamp_millis(),
            s.submitted_at.map(|t| t.timestamp_millis()),
            s.cured_at.map(|t| t.timestamp_millis()),
            s.cure_period_days,
            status.as_str(),
            now_ms,
            now_ms,
            wm.ingested_at_ms,
            wm.event_id.to_string(),
        ],
    )?;
    Ok(true)
}

/// Recompute the wall-clock compliance column in place (sweep path).
pub fn update_filing_compliance(
    tx: &Connection,
    filing_id: &str,
    status: &str,
    now_ms: i64,
) -> CoreResult<()> {
    tx.execute(
        "UPDATE breeder_filings
         SET compliance_status = ?2, status_computed_at = ?3
         WHERE filing_id = ?1",
        params![filing_id, status, now_ms],
    )?;
    debug!(filing_id, status, "recomputed filing compliance");
    Ok(())
}
