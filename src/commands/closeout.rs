//! End-of-cycle closeout: preflight checks, reconciliation at a watermark,
//! audit hold, and the close itself.

use crate::commands::{execute, input_hash, load_closeout, CommandContext, Core};
use crate::domain::closeout::{
    ActivitySummary, AuditHoldData, CloseoutStatus, CycleClosedData, FinancialSummary,
    MatchingSummary, PreflightCheck, PreflightCompletedData, ReconciledData, PREFLIGHT_CHECKS,
};
use crate::domain::event::{self, AggregateKind};
use crate::domain::grant::GrantState;
use crate::domain::ids::{CycleId, GrantId};
use crate::domain::money::Cents;
use crate::domain::Watermark;
use crate::errors::{CoreError, CoreResult};
use crate::store::event_log;
use crate::store::locks::{LockKey, LockKind};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleInput {
    pub cycle_id: CycleId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResponse {
    pub cycle_id: CycleId,
    pub status: CloseoutStatus,
    pub checks: Vec<PreflightCheck>,
    pub passed: bool,
}

fn count(conn: &Connection, sql: &str, cycle_id: &CycleId) -> CoreResult<i64> {
    Ok(conn.query_row(sql, params![cycle_id.as_str()], |row| row.get(0))?)
}

fn preflight_checks(conn: &Connection, cycle_id: &CycleId) -> CoreResult<Vec<PreflightCheck>> {
    let approved_uninvoiced = count(
        conn,
        "SELECT COUNT(*) FROM claims
         WHERE cycle_id = ?1 AND status = 'APPROVED' AND invoice_id IS NULL",
        cycle_id,
    )?;
    let submitted_unexported = count(
        conn,
        "SELECT COUNT(*) FROM invoices
         WHERE cycle_id = ?1 AND status = 'SUBMITTED' AND batch_id IS NULL",
        cycle_id,
    )?;
    let unacknowledged_batches = count(
        conn,
        "SELECT COUNT(*) FROM oasis_batches
         WHERE cycle_id = ?1 AND status NOT IN ('ACKNOWLEDGED','VOIDED')",
        cycle_id,
    )?;
    let unpaid_invoices = count(
        conn,
        "SELECT COUNT(*) FROM invoices i
         WHERE i.cycle_id = ?1 AND i.status = 'SUBMITTED'
           AND NOT EXISTS (SELECT 1 FROM invoice_payments p WHERE p.invoice_id = i.invoice_id)",
        cycle_id,
    )?;
    let pending_adjustments = count(
        conn,
        "SELECT COUNT(*) FROM invoice_adjustments
         WHERE cycle_id = ?1 AND target_invoice_id IS NULL",
        cycle_id,
    )?;
    let (committed, reported): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(matching_committed_cents), 0),
                COALESCE(SUM(matching_reported_cents), 0)
         FROM grants WHERE cycle_id = ?1",
        params![cycle_id.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let results: [(bool, String); 6] = [
        (approved_uninvoiced == 0, format!("{} approved claims not invoiced", approved_uninvoiced)),
        (
            submitted_unexported == 0,
            format!("{} submitted invoices not exported", submitted_unexported),
        ),
        (
            unacknowledged_batches == 0,
            format!("{} batches not acknowledged", unacknowledged_batches),
        ),
        (unpaid_invoices == 0, format!("{} submitted invoices without payments", unpaid_invoices)),
        (pending_adjustments == 0, format!("{} adjustments without a target", pending_adjustments)),
        (
            reported >= committed,
            format!("matching reported {} < committed {}", reported, committed),
        ),
    ];
    Ok(PREFLIGHT_CHECKS
        .iter()
        .zip(results)
        .map(|(name, (passed, detail))| PreflightCheck {
            name: name.to_string(),
            passed,
            detail: if passed { String::new() } else { detail },
        })
        .collect())
}

/// Recompute the deterministic preflight check list and record the outcome.
pub fn run_preflight(
    core: &Core,
    ctx: &CommandContext,
    input: CycleInput,
) -> CoreResult<PreflightResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Closeout, input.cycle_id.as_str())];
    execute(core, ctx, "RunCloseoutPreflight", &hash, locks, |tx, scope| {
        let checks = preflight_checks(tx, &input.cycle_id)?;
        let passed = checks.iter().all(|c| c.passed);
        scope.emit(
            AggregateKind::Closeout,
            input.cycle_id.as_str(),
            &input.cycle_id,
            event::GRANT_CYCLE_CLOSEOUT_PREFLIGHT_COMPLETED,
            &PreflightCompletedData { checks: checks.clone(), passed },
            None,
        )?;
        info!(cycle = %input.cycle_id, passed, "closeout preflight completed");
        Ok(PreflightResponse {
            cycle_id: input.cycle_id.clone(),
            status: if passed {
                CloseoutStatus::PreflightPassed
            } else {
                CloseoutStatus::PreflightFailed
            },
            checks,
            passed,
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseoutResponse {
    pub cycle_id: CycleId,
    pub status: CloseoutStatus,
}

pub fn start_closeout(
    core: &Core,
    ctx: &CommandContext,
    input: CycleInput,
) -> CoreResult<CloseoutResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Closeout, input.cycle_id.as_str())];
    execute(core, ctx, "StartCloseout", &hash, locks, |tx, scope| {
        let closeout = load_closeout(tx, &input.cycle_id)?;
        closeout.check_can_start()?;
        scope.emit(
            AggregateKind::Closeout,
            input.cycle_id.as_str(),
            &input.cycle_id,
            event::GRANT_CYCLE_CLOSEOUT_STARTED,
            &serde_json::json!({}),
            None,
        )?;
        Ok(CloseoutResponse { cycle_id: input.cycle_id.clone(), status: CloseoutStatus::Started })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileInput {
    pub cycle_id: CycleId,
    /// Summaries are computed at this watermark so they are reproducible.
    /// Defaults to the current log tail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<Watermark>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub cycle_id: CycleId,
    pub status: CloseoutStatus,
    pub financial: FinancialSummary,
    pub matching: MatchingSummary,
    pub activity: ActivitySummary,
    pub watermark: Watermark,
}

/// Fold the cycle's grant events up to the watermark and sum both buckets.
fn financial_at(
    conn: &Connection,
    cycle_id: &CycleId,
    wm: Watermark,
) -> CoreResult<(FinancialSummary, MatchingSummary)> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT aggregate_id FROM events
         WHERE cycle_id = ?1 AND aggregate_kind = 'GRANT'
         ORDER BY aggregate_id",
    )?;
    let grant_ids = stmt
        .query_map(params![cycle_id.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    let mut awarded = Cents::ZERO;
    let mut liquidated = Cents::ZERO;
    let mut released = Cents::ZERO;
    let mut committed = Cents::ZERO;
    let mut reported = Cents::ZERO;
    for grant_id in &grant_ids {
        let mut state = GrantState::empty(GrantId::new(grant_id.clone()));
        for ev in event_log::fetch_aggregate(conn, AggregateKind::Grant, grant_id)? {
            if ev.watermark() > wm {
                break;
            }
            state.apply(&ev)?;
        }
        state.check_invariant()?;
        for bucket in [&state.general, &state.lirp] {
            awarded = awarded + bucket.awarded;
            liquidated = liquidated + bucket.liquidated;
            released = released + bucket.released;
        }
        committed = committed + state.matching_committed;
        reported = reported + state.matching_reported;
    }
    let unspent = awarded - liquidated - released;
    let financial = FinancialSummary {
        awarded_cents: awarded,
        liquidated_cents: liquidated,
        released_cents: released,
        unspent_cents: unspent,
    };
    let matching = MatchingSummary {
        committed_cents: committed,
        reported_cents: reported,
        shortfall_cents: committed.saturating_sub_floor_zero(reported),
        surplus_cents: reported.saturating_sub_floor_zero(committed),
    };
    Ok((financial, matching))
}

fn activity_at(conn: &Connection, cycle_id: &CycleId, wm: Watermark) -> CoreResult<ActivitySummary> {
    let count_type = |event_types: &[&str]| -> CoreResult<u32> {
        let mut total = 0i64;
        for event_type in event_types {
            total += conn.query_row(
                "SELECT COUNT(*) FROM events
                 WHERE cycle_id = ?1 AND event_type = ?2
                   AND (ingested_at < ?3 OR (ingested_at = ?3 AND event_id <= ?4))",
                params![cycle_id.as_str(), event_type, wm.ingested_at_ms, wm.event_id.to_string()],
                |row| row.get::<_, i64>(0),
            )?;
        }
        Ok(total as u32)
    };
    Ok(ActivitySummary {
        vouchers_issued: count_type(&[event::VOUCHER_ISSUED, event::VOUCHER_ISSUED_TENTATIVE])?,
        vouchers_redeemed: count_type(&[event::VOUCHER_REDEEMED])?,
        claims_submitted: count_type(&[event::CLAIM_SUBMITTED])?,
        claims_approved: count_type(&[event::CLAIM_APPROVED])?,
        claims_denied: count_type(&[event::CLAIM_DENIED])?,
        invoices_generated: count_type(&[event::INVOICE_GENERATED])?,
        batches_acknowledged: count_type(&[event::OASIS_EXPORT_BATCH_ACKNOWLEDGED])?,
    })
}

/// Compute and record the reconciliation summaries at the caller's watermark.
pub fn reconcile_closeout(
    core: &Core,
    ctx: &CommandContext,
    input: ReconcileInput,
) -> CoreResult<ReconcileResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Closeout, input.cycle_id.as_str())];
    execute(core, ctx, "ReconcileCloseout", &hash, locks, |tx, scope| {
        let closeout = load_closeout(tx, &input.cycle_id)?;
        closeout.check_can_reconcile()?;

        let wm = match input.watermark {
            Some(wm) => wm,
            None => event_log::latest_watermark(tx)?,
        };
        let (financial, matching) = financial_at(tx, &input.cycle_id, wm)?;
        financial.check()?;
        let activity = activity_at(tx, &input.cycle_id, wm)?;

        scope.emit(
            AggregateKind::Closeout,
            input.cycle_id.as_str(),
            &input.cycle_id,
            event::GRANT_CYCLE_CLOSEOUT_RECONCILED,
            &ReconciledData { financial, matching, activity, watermark: wm },
            None,
        )?;
        Ok(ReconcileResponse {
            cycle_id: input.cycle_id.clone(),
            status: CloseoutStatus::Reconciled,
            financial,
            matching,
            activity,
            watermark: wm,
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHoldInput {
    pub cycle_id: CycleId,
    pub reason: String,
}

/// Place the cycle under audit hold (blocks close until resolved).
pub fn set_audit_hold(
    core: &Core,
    ctx: &CommandContext,
    input: AuditHoldInput,
) -> CoreResult<CloseoutResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Closeout, input.cycle_id.as_str())];
    execute(core, ctx, "SetAuditHold", &hash, locks, |tx, scope| {
        let closeout = load_closeout(tx, &input.cycle_id)?;
        closeout.check_can_hold()?;
        scope.emit(
            AggregateKind::Closeout,
            input.cycle_id.as_str(),
            &input.cycle_id,
            event::GRANT_CYCLE_AUDIT_HOLD_SET,
            &AuditHoldData { reason: input.reason.clone() },
            None,
        )?;
        Ok(CloseoutResponse { cycle_id: input.cycle_id.clone(), status: CloseoutStatus::AuditHold })
    })
}

/// Resolve the audit hold, restoring the pre-hold status.
pub fn resolve_audit_hold(
    core: &Core,
    ctx: &CommandContext,
    input: CycleInput,
) -> CoreResult<CloseoutResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Closeout, input.cycle_id.as_str())];
    execute(core, ctx, "ResolveAuditHold", &hash, locks, |tx, scope| {
        let closeout = load_closeout(tx, &input.cycle_id)?;
        closeout.check_can_resolve_hold()?;
        scope.emit(
            AggregateKind::Closeout,
            input.cycle_id.as_str(),
            &input.cycle_id,
            event::GRANT_CYCLE_AUDIT_RESOLVED,
            &serde_json::json!({}),
            None,
        )?;
        let restored = closeout.pre_hold_status.unwrap_or(CloseoutStatus::Reconciled);
        Ok(CloseoutResponse { cycle_id: input.cycle_id.clone(), status: restored })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseCycleResponse {
    pub cycle_id: CycleId,
    pub status: CloseoutStatus,
    pub final_balance_cents: Cents,
}

/// Close the cycle. Requires RECONCILED with no audit hold; the final balance
/// is the reconciled unspent amount.
pub fn close_cycle(
    core: &Core,
    ctx: &CommandContext,
    input: CycleInput,
) -> CoreResult<CloseCycleResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Closeout, input.cycle_id.as_str())];
    execute(core, ctx, "CloseCycle", &hash, locks, |tx, scope| {
        let closeout = load_closeout(tx, &input.cycle_id)?;
        closeout.check_can_closeout()?;
        let financial = closeout.financial.ok_or_else(|| CoreError::CloseoutInvariant {
            detail: format!("cycle {} reconciled without financial summary", input.cycle_id),
        })?;
        financial.check()?;
        scope.emit(
            AggregateKind::Closeout,
            input.cycle_id.as_str(),
            &input.cycle_id,
            event::GRANT_CYCLE_CLOSED,
            &CycleClosedData {
                closed_by: ctx.actor_id.clone(),
                final_balance_cents: financial.unspent_cents,
            },
            None,
        )?;
        info!(cycle = %input.cycle_id, "cycle closed");
        Ok(CloseCycleResponse {
            cycle_id: input.cycle_id.clone(),
            status: CloseoutStatus::Closed,
            final_balance_cents: financial.unspent_cents,
        })
    })
}
