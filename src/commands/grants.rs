//! Grant-level commands: award registration, matching funds, claims
//! deadline.

use crate::commands::{execute, input_hash, load_grant, CommandContext, Core};
use crate::domain::event::{self, AggregateKind};
use crate::domain::grant::{ClaimsDeadlineData, GrantAwardedData, MatchingFundsData};
use crate::domain::ids::{CycleId, GrantId};
use crate::domain::money::Cents;
use crate::errors::{CoreError, CoreResult};
use crate::store::locks::{LockKey, LockKind};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterGrantInput {
    pub grant_id: GrantId,
    pub cycle_id: CycleId,
    pub general_awarded_cents: Cents,
    pub lirp_awarded_cents: Cents,
    pub rate_numerator: i64,
    pub rate_denominator: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterGrantResponse {
    pub grant_id: GrantId,
    pub cycle_id: CycleId,
    pub already_registered: bool,
}

/// Register an award for a cycle. Registering the same grant twice returns
/// the existing registration.
pub fn register_grant(
    core: &Core,
    ctx: &CommandContext,
    input: RegisterGrantInput,
) -> CoreResult<RegisterGrantResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![
        LockKey::new(LockKind::GrantGeneral, input.grant_id.as_str()),
        LockKey::new(LockKind::GrantLirp, input.grant_id.as_str()),
    ];
    execute(core, ctx, "RegisterGrant", &hash, locks, |tx, scope| {
        if load_grant(tx, input.grant_id.as_str()).is_ok() {
            return Ok(RegisterGrantResponse {
                grant_id: input.grant_id.clone(),
                cycle_id: input.cycle_id.clone(),
                already_registered: true,
            });
        }
        if input.general_awarded_cents.is_negative() || input.lirp_awarded_cents.is_negative() {
            return Err(CoreError::BalanceInvariant {
                detail: "negative award".to_string(),
            });
        }
        let data = GrantAwardedData {
            grant_id: input.grant_id.clone(),
            cycle_id: input.cycle_id.clone(),
            general_awarded_cents: input.general_awarded_cents,
            lirp_awarded_cents: input.lirp_awarded_cents,
            rate_numerator: input.rate_numerator,
            rate_denominator: input.rate_denominator,
            period_start: input.period_start,
            period_end: input.period_end,
        };
        scope.emit(
            AggregateKind::Grant,
            input.grant_id.as_str(),
            &input.cycle_id,
            event::GRANT_AWARDED,
            &data,
            None,
        )?;
        Ok(RegisterGrantResponse {
            grant_id: input.grant_id.clone(),
            cycle_id: input.cycle_id.clone(),
            already_registered: false,
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingFundsInput {
    pub grant_id: GrantId,
    pub amount_cents: Cents,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingFundsResponse {
    pub grant_id: GrantId,
    pub committed_cents: Cents,
    pub reported_cents: Cents,
}

fn matching_funds(
    core: &Core,
    ctx: &CommandContext,
    input: MatchingFundsInput,
    event_type: &'static str,
    op: &'static str,
) -> CoreResult<MatchingFundsResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![
        LockKey::new(LockKind::GrantGeneral, input.grant_id.as_str()),
        LockKey::new(LockKind::GrantLirp, input.grant_id.as_str()),
    ];
    execute(core, ctx, op, &hash, locks, |tx, scope| {
        let mut grant = load_grant(tx, input.grant_id.as_str())?;
        if input.amount_cents.is_negative() {
            return Err(CoreError::BalanceInvariant {
                detail: "negative matching amount".to_string(),
            });
        }
        let data = MatchingFundsData {
            amount_cents: input.amount_cents,
            source: input.source.clone(),
        };
        let ev = scope.emit(
            AggregateKind::Grant,
            input.grant_id.as_str(),
            &grant.cycle_id.clone(),
            event_type,
            &data,
            None,
        )?;
        grant.apply(&ev)?;
        grant.check_invariant()?;
        Ok(MatchingFundsResponse {
            grant_id: input.grant_id.clone(),
            committed_cents: grant.matching_committed,
            reported_cents: grant.matching_reported,
        })
    })
}

/// Record a matching-funds commitment.
pub fn commit_matching_funds(
    core: &Core,
    ctx: &CommandContext,
    input: MatchingFundsInput,
) -> CoreResult<MatchingFundsResponse> {
    matching_funds(core, ctx, input, event::GRANT_MATCHING_COMMITTED, "CommitMatchingFunds")
}

/// Report matching funds actually raised.
pub fn report_matching_funds(
    core: &Core,
    ctx: &CommandContext,
    input: MatchingFundsInput,
) -> CoreResult<MatchingFundsResponse> {
    matching_funds(core, ctx, input, event::GRANT_MATCHING_REPORTED, "ReportMatchingFunds")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimsDeadlineInput {
    pub grant_id: GrantId,
    pub deadline: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimsDeadlineResponse {
    pub grant_id: GrantId,
    pub cycle_id: CycleId,
}

/// Flip the cycle's claims deadline. Submissions after this are rejected with
/// `GRANT_CLAIMS_DEADLINE_PASSED`.
pub fn mark_claims_deadline_passed(
    core: &Core,
    ctx: &CommandContext,
    input: ClaimsDeadlineInput,
) -> CoreResult<ClaimsDeadlineResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![
        LockKey::new(LockKind::GrantGeneral, input.grant_id.as_str()),
        LockKey::new(LockKind::GrantLirp, input.grant_id.as_str()),
    ];
    execute(core, ctx, "MarkClaimsDeadlinePassed", &hash, locks, |tx, scope| {
        let grant = load_grant(tx, input.grant_id.as_str())?;
        let cycle_id = grant.cycle_id.clone();
        scope.emit(
            AggregateKind::Grant,
            input.grant_id.as_str(),
            &cycle_id,
            event::GRANT_CLAIMS_DEADLINE_PASSED,
            &ClaimsDeadlineData { deadline: input.deadline },
            None,
        )?;
        Ok(ClaimsDeadlineResponse { grant_id: input.grant_id.clone(), cycle_id })
    })
}
