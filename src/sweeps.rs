//! Background sweeps.
//!
//! Each sweep is a synchronous `run_once` (testable without a runtime) plus a
//! tokio interval loop that logs and keeps going on errors. Both sweeps are
//! idempotent: re-scanning a row it already handled is a no-op.

use crate::commands::vouchers::{void_voucher, VoidVoucherInput};
use crate::commands::{CommandContext, Core};
use crate::domain::breeder::{compliance_status, ComplianceStatus};
use crate::domain::ids::{ActorKind, VoucherId};
use crate::errors::{CoreError, CoreResult};
use crate::projections;
use chrono::{TimeZone, Utc};
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub scanned: u32,
    pub changed: u32,
}

/// Void tentative vouchers whose hold expired. Voiding releases the bucket
/// encumbrance through the normal command path.
pub fn run_voucher_sweep_once(core: &Core) -> CoreResult<SweepReport> {
    let now_ms = Utc::now().timestamp_millis();
    let expired: Vec<String> = core.db().with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT voucher_id FROM vouchers
             WHERE status = 'TENTATIVE' AND tentative_expires_at < ?1
             ORDER BY voucher_id",
        )?;
        let ids = stmt
            .query_map(params![now_ms], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    })?;

    let mut report = SweepReport { scanned: expired.len() as u32, changed: 0 };
    for voucher_id in expired {
        // Deterministic key: the sweeper cannot carry client state.
        let ctx = CommandContext::new(
            format!("sweep:voucher:{}", voucher_id),
            format!("sweep-{}", voucher_id),
            "voucher-sweeper",
            ActorKind::System,
        );
        let input = VoidVoucherInput {
            voucher_id: VoucherId::new(voucher_id.clone()),
            reason: "tentative expired".to_string(),
        };
        match void_voucher(core, &ctx, input) {
            Ok(_) => report.changed += 1,
            // Raced with a confirm or an earlier sweep pass; nothing to do.
            Err(CoreError::VoucherNotVoidable { .. }) => {
                debug!(voucher_id, "voucher no longer tentative, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    if report.changed > 0 {
        info!(voided = report.changed, "tentative voucher sweep");
    }
    metrics::increment_counter!("wvsnp_sweep_runs_total", "sweep" => "voucher");
    Ok(report)
}

/// Recompute the derived compliance column for every breeder filing.
pub fn run_compliance_sweep_once(core: &Core) -> CoreResult<SweepReport> {
    let now_ms = Utc::now().timestamp_millis();
    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now);
    core.db().with_tx(|tx| {
        let mut stmt = tx.prepare(
            "SELECT filing_id, due_at, submitted_at, cured_at, cure_period_days, compliance_status
             FROM breeder_filings ORDER BY filing_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = SweepReport { scanned: rows.len() as u32, changed: 0 };
        for (filing_id, due_ms, submitted_ms, cured_ms, cure_days, stored) in rows {
            let to_dt = |ms: i64| Utc.timestamp_millis_opt(ms).single();
            let Some(due_at) = to_dt(due_ms) else { continue };
            let status = compliance_status(
                due_at,
                submitted_ms.and_then(to_dt),
                cured_ms.and_then(to_dt),
                cure_days,
                now,
            );
            if ComplianceStatus::parse(&stored) != Some(status) {
                projections::update_filing_compliance(tx, &filing_id, status.as_str(), now_ms)?;
                report.changed += 1;
            }
        }
        metrics::increment_counter!("wvsnp_sweep_runs_total", "sweep" => "compliance");
        Ok(report)
    })
}

/// Spawn both sweep loops on the runtime. Errors are logged and the loop
/// continues; the handles run until aborted.
pub fn spawn_sweeps(core: Arc<Core>) -> Vec<tokio::task::JoinHandle<()>> {
    let voucher_interval = core.db().config().voucher_sweep_interval;
    let compliance_interval = core.db().config().compliance_sweep_interval;
    vec![
        spawn_loop(Arc::clone(&core), "voucher", voucher_interval, run_voucher_sweep_once),
        spawn_loop(core, "compliance", compliance_interval, run_compliance_sweep_once),
    ]
}

fn spawn_loop(
    core: Arc<Core>,
    name: &'static str,
    interval: Duration,
    run_once: fn(&Core) -> CoreResult<SweepReport>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let core = Arc::clone(&core);
            let result =
                tokio::task::spawn_blocking(move || run_once(&core)).await;
            match result {
                Ok(Ok(report)) => {
                    debug!(sweep = name, scanned = report.scanned, changed = report.changed,
                        "sweep pass complete");
                }
                Ok(Err(e)) => warn!(sweep = name, "sweep pass failed: {}", e),
                Err(e) => warn!(sweep = name, "sweep task panicked: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::grants::{register_grant, RegisterGrantInput};
    use crate::commands::vouchers::{issue_voucher, IssueVoucherInput};
    use crate::domain::grant::Bucket;
    use crate::domain::ids::{CycleId, GrantId};
    use crate::domain::money::Cents;
    use chrono::NaiveDate;
    use rusqlite::params;

    fn ctx(key: &str) -> CommandContext {
        CommandContext::new(key.to_string(), "corr-sweep-test", "admin-1", ActorKind::Admin)
    }

    fn seeded_core() -> Core {
        let core = Core::in_memory().unwrap();
        register_grant(
            &core,
            &ctx("seed-grant-0001"),
            RegisterGrantInput {
                grant_id: GrantId::new("grant-1"),
                cycle_id: CycleId::new("FY2026"),
                general_awarded_cents: Cents::new(1_000_000),
                lirp_awarded_cents: Cents::new(0),
                rate_numerator: 1,
                rate_denominator: 1,
                period_start: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
                period_end: NaiveDate::from_ymd_opt(2026, 6, 30).unwrap(),
            },
        )
        .unwrap();
        core
    }

    #[test]
    fn sweep_voids_expired_tentatives_and_releases_funds() {
        let core = seeded_core();
        let issued = issue_voucher(
            &core,
            &ctx("issue-tentative-01"),
            IssueVoucherInput {
                grant_id: GrantId::new("grant-1"),
                county: "KANAWHA".into(),
                is_lirp: false,
                max_reimbursement_cents: Cents::new(50_000),
                valid_until: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
                tentative_hold_hours: Some(1),
            },
        )
        .unwrap();

        // Force the hold into the past.
        core.db()
            .with_tx(|tx| {
                tx.execute(
                    "UPDATE vouchers SET tentative_expires_at = 1 WHERE voucher_id = ?1",
                    params![issued.voucher_id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let first = run_voucher_sweep_once(&core).unwrap();
        assert_eq!(first.changed, 1);

        // Idempotent: a second pass finds nothing tentative.
        let second = run_voucher_sweep_once(&core).unwrap();
        assert_eq!(second.scanned, 0);
        assert_eq!(second.changed, 0);

        // Encumbrance came back.
        let grant = core
            .db()
            .with_conn(|conn| crate::commands::load_grant(conn, "grant-1"))
            .unwrap();
        assert_eq!(grant.bucket(Bucket::General).available.get(), 1_000_000);
        assert_eq!(grant.bucket(Bucket::General).encumbered.get(), 0);
    }
}
