//! Claim commands: submission with fingerprint dedup, adjudication,
//! adjustment, artifact attachment.
//!
//! Duplicate submissions (same canonical fingerprint in the same cycle) are
//! not errors: the existing claim id comes back with a `duplicateDetected`
//! marker and nothing is emitted. Fraud signals are advisory; they are
//! recorded in the same transaction and never block.

use crate::commands::{
    ensure_cycle_open, execute, input_hash, load_claim, load_clinic, load_grant, load_voucher,
    CommandContext, Core,
};
use crate::domain::claim::{
    claim_fingerprint, leading_iso_date, ClaimArtifacts, ClaimAdjustedData, ClaimDecisionData,
    ClaimStatus, ClaimSubmittedData, FraudSignalData,
};
use crate::domain::event::{self, AggregateKind};
use crate::domain::grant::{Bucket, FundsMovementData};
use crate::domain::ids::{ClaimId, ClinicId, VoucherId};
use crate::domain::money::Cents;
use crate::domain::voucher::VoucherRedeemedData;
use crate::errors::{CoreError, CoreResult};
use crate::store::locks::{LockKey, LockKind};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitClaimInput {
    pub voucher_id: VoucherId,
    pub clinic_id: ClinicId,
    pub procedure_code: String,
    /// Raw service date; only the leading `YYYY-MM-DD` is significant.
    pub date_of_service: String,
    pub amount_cents: Cents,
    #[serde(default)]
    pub copay_cents: Cents,
    pub rabies_included: bool,
    pub artifacts: ClaimArtifacts,
    /// Client-supplied claim id; minted fresh when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<ClaimId>,
    /// Advisory signals from upstream screening; recorded, never blocking.
    #[serde(default)]
    pub fraud_signals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitClaimResponse {
    pub claim_id: ClaimId,
    pub fingerprint: String,
    pub duplicate_detected: bool,
}

/// Submit a reimbursement claim against an issued voucher.
pub fn submit_claim(
    core: &Core,
    ctx: &CommandContext,
    input: SubmitClaimInput,
) -> CoreResult<SubmitClaimResponse> {
    let hash = input_hash(&input)?;
    let fingerprint = claim_fingerprint(
        input.voucher_id.as_str(),
        input.clinic_id.as_str(),
        &input.procedure_code,
        &input.date_of_service,
        input.rabies_included,
    )?;
    // Locking the fingerprint (not the yet-unknown claim id) serializes
    // concurrent duplicate submissions.
    let locks = vec![
        LockKey::new(LockKind::Voucher, input.voucher_id.as_str()),
        LockKey::new(LockKind::Clinic, input.clinic_id.as_str()),
        LockKey::new(LockKind::Claim, fingerprint.clone()),
    ];
    execute(core, ctx, "SubmitClaim", &hash, locks, |tx, scope| {
        let date_of_service = parse_service_date(&input.date_of_service)?;

        let voucher = load_voucher(tx, input.voucher_id.as_str())?;
        let cycle_id = voucher.cycle_id.clone();

        // Closed-cycle gate comes before everything else, including dedup.
        ensure_cycle_open(tx, &cycle_id, event::CLAIM_SUBMITTED)?;

        // Fingerprint dedup under (fingerprint, cycle_id): idempotent, not an
        // error.
        let existing: Option<String> = tx
            .query_row(
                "SELECT claim_id FROM claims WHERE fingerprint = ?1 AND cycle_id = ?2",
                params![fingerprint, cycle_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(claim_id) = existing {
            info!(claim_id, "duplicate claim submission collapsed by fingerprint");
            return Ok(SubmitClaimResponse {
                claim_id: ClaimId::new(claim_id),
                fingerprint: fingerprint.clone(),
                duplicate_detected: true,
            });
        }

        let grant = load_grant(tx, voucher.grant_id.as_str())?;
        if grant.claims_deadline_passed {
            return Err(CoreError::GrantClaimsDeadlinePassed { cycle_id: cycle_id.to_string() });
        }
        if !grant.period_contains(date_of_service) {
            return Err(CoreError::GrantPeriodEnded { cycle_id: cycle_id.to_string() });
        }
        voucher.check_valid_for_service(date_of_service)?;

        let clinic = load_clinic(tx, input.clinic_id.as_str())?;
        clinic.check_active()?;
        // As of the service date, not as of now.
        clinic.check_license_for_service(date_of_service)?;

        if voucher.is_lirp && input.copay_cents > Cents::ZERO {
            return Err(CoreError::LirpCopayForbidden);
        }
        input.artifacts.check_required(input.rabies_included, input.copay_cents)?;
        if input.amount_cents <= Cents::ZERO {
            return Err(CoreError::BalanceInvariant {
                detail: "claim amount must be positive".to_string(),
            });
        }

        let claim_id = match &input.claim_id {
            Some(id) => {
                if !id.is_well_formed() {
                    return Err(CoreError::ClaimIdMalformed { claim_id: id.to_string() });
                }
                id.clone()
            }
            None => ClaimId::mint(),
        };

        let data = ClaimSubmittedData {
            claim_id: claim_id.clone(),
            voucher_id: input.voucher_id.clone(),
            clinic_id: input.clinic_id.clone(),
            procedure_code: input.procedure_code.clone(),
            date_of_service,
            amount_cents: input.amount_cents,
            copay_cents: input.copay_cents,
            rabies_included: input.rabies_included,
            fingerprint: fingerprint.clone(),
            artifacts: input.artifacts.clone(),
        };
        let submitted = scope.emit(
            AggregateKind::Claim,
            claim_id.as_str(),
            &cycle_id,
            event::CLAIM_SUBMITTED,
            &data,
            None,
        )?;

        // Advisory fraud signals ride along, causally linked.
        let mut signals: Vec<FraudSignalData> = input
            .fraud_signals
            .iter()
            .map(|s| FraudSignalData { signal: s.clone(), detail: String::new() })
            .collect();
        if input.amount_cents > voucher.max_reimbursement {
            signals.push(FraudSignalData {
                signal: "AMOUNT_EXCEEDS_VOUCHER_MAX".to_string(),
                detail: format!(
                    "claimed {} against voucher max {}",
                    input.amount_cents, voucher.max_reimbursement
                ),
            });
        }
        for signal in &signals {
            scope.emit(
                AggregateKind::Claim,
                claim_id.as_str(),
                &cycle_id,
                event::CLAIM_FRAUD_SIGNAL_RECORDED,
                signal,
                Some(submitted.event_id),
            )?;
        }

        Ok(SubmitClaimResponse { claim_id, fingerprint: fingerprint.clone(), duplicate_detected: false })
    })
}

fn parse_service_date(raw: &str) -> CoreResult<NaiveDate> {
    let leading = leading_iso_date(raw)?;
    NaiveDate::parse_from_str(leading, "%Y-%m-%d")
        .map_err(|_| CoreError::InvalidDateFormat { value: raw.to_string() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjudicateClaimInput {
    pub claim_id: ClaimId,
    pub decision: ClaimDecision,
    pub decision_basis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjudicateClaimResponse {
    pub claim_id: ClaimId,
    pub status: ClaimStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_amount_cents: Option<Cents>,
    pub conflict_detected: bool,
}

/// Approve or deny a claim. Adjudicating a claim that is no longer SUBMITTED
/// or ADJUSTED records an advisory conflict event and succeeds with
/// `conflictDetected: true` without changing claim state.
pub fn adjudicate_claim(
    core: &Core,
    ctx: &CommandContext,
    input: AdjudicateClaimInput,
) -> CoreResult<AdjudicateClaimResponse> {
    let hash = input_hash(&input)?;
    // The claim's voucher and grant never change after submission, so the
    // ahead-of-transaction read is stable for lock ordering.
    let claim = core.db().with_conn(|conn| load_claim(conn, input.claim_id.as_str()))?;
    let voucher = core.db().with_conn(|conn| load_voucher(conn, claim.voucher_id.as_str()))?;
    let bucket_kind = if voucher.is_lirp {
        LockKind::GrantLirp
    } else {
        LockKind::GrantGeneral
    };
    let locks = vec![
        LockKey::new(LockKind::Voucher, claim.voucher_id.as_str()),
        LockKey::new(bucket_kind, voucher.grant_id.as_str()),
        LockKey::new(LockKind::Claim, input.claim_id.as_str()),
    ];
    execute(core, ctx, "AdjudicateClaim", &hash, locks, |tx, scope| {
        let claim = load_claim(tx, input.claim_id.as_str())?;
        let cycle_id = claim.cycle_id.clone();

        if !claim.can_adjudicate() {
            scope.emit(
                AggregateKind::Claim,
                input.claim_id.as_str(),
                &cycle_id,
                event::CLAIM_DECISION_CONFLICT_RECORDED,
                &serde_json::json!({
                    "attemptedDecision": input.decision,
                    "currentStatus": claim.status.as_str(),
                }),
                None,
            )?;
            return Ok(AdjudicateClaimResponse {
                claim_id: input.claim_id.clone(),
                status: claim.status,
                approved_amount_cents: None,
                conflict_detected: true,
            });
        }

        match input.decision {
            ClaimDecision::Deny => {
                scope.emit(
                    AggregateKind::Claim,
                    input.claim_id.as_str(),
                    &cycle_id,
                    event::CLAIM_DENIED,
                    &ClaimDecisionData {
                        approved_amount_cents: None,
                        decision_basis: input.decision_basis.clone(),
                    },
                    None,
                )?;
                Ok(AdjudicateClaimResponse {
                    claim_id: input.claim_id.clone(),
                    status: ClaimStatus::Denied,
                    approved_amount_cents: None,
                    conflict_detected: false,
                })
            }
            ClaimDecision::Approve => {
                let voucher = load_voucher(tx, claim.voucher_id.as_str())?;
                voucher.check_valid_for_service(claim.date_of_service)?;
                let grant = load_grant(tx, voucher.grant_id.as_str())?;
                let bucket = Bucket::for_voucher(voucher.is_lirp);

                // Reimburse the eligible amount at the grant rate, capped by
                // the voucher.
                let eligible = claim.submitted_amount.min(voucher.max_reimbursement);
                let approved = grant.rate.apply(eligible);

                let approve_event = scope.emit(
                    AggregateKind::Claim,
                    input.claim_id.as_str(),
                    &cycle_id,
                    event::CLAIM_APPROVED,
                    &ClaimDecisionData {
                        approved_amount_cents: Some(approved),
                        decision_basis: input.decision_basis.clone(),
                    },
                    None,
                )?;
                scope.emit(
                    AggregateKind::Voucher,
                    voucher.voucher_id.as_str(),
                    &cycle_id,
                    event::VOUCHER_REDEEMED,
                    &VoucherRedeemedData { claim_id: input.claim_id.clone() },
                    Some(approve_event.event_id),
                )?;
                scope.emit(
                    AggregateKind::Grant,
                    voucher.grant_id.as_str(),
                    &cycle_id,
                    event::GRANT_FUNDS_LIQUIDATED,
                    &FundsMovementData {
                        bucket,
                        amount_cents: approved,
                        voucher_id: Some(voucher.voucher_id.as_str().to_string()),
                        claim_id: Some(input.claim_id.as_str().to_string()),
                        reason: "claim approved".to_string(),
                    },
                    Some(approve_event.event_id),
                )?;
                // Whatever the encumbrance still holds beyond the approved
                // amount goes back to the bucket.
                let remainder = voucher.max_reimbursement - approved;
                if remainder > Cents::ZERO {
                    scope.emit(
                        AggregateKind::Grant,
                        voucher.grant_id.as_str(),
                        &cycle_id,
                        event::GRANT_FUNDS_RELEASED,
                        &FundsMovementData {
                            bucket,
                            amount_cents: remainder,
                            voucher_id: Some(voucher.voucher_id.as_str().to_string()),
                            claim_id: Some(input.claim_id.as_str().to_string()),
                            reason: "encumbrance remainder after redemption".to_string(),
                        },
                        Some(approve_event.event_id),
                    )?;
                }
                Ok(AdjudicateClaimResponse {
                    claim_id: input.claim_id.clone(),
                    status: ClaimStatus::Approved,
                    approved_amount_cents: Some(approved),
                    conflict_detected: false,
                })
            }
        }
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustClaimInput {
    pub claim_id: ClaimId,
    pub amount_cents: Cents,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustClaimResponse {
    pub claim_id: ClaimId,
    pub status: ClaimStatus,
    pub amount_cents: Cents,
}

/// Correct a claim's submitted amount before adjudication.
pub fn adjust_claim(
    core: &Core,
    ctx: &CommandContext,
    input: AdjustClaimInput,
) -> CoreResult<AdjustClaimResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Claim, input.claim_id.as_str())];
    execute(core, ctx, "AdjustClaim", &hash, locks, |tx, scope| {
        let claim = load_claim(tx, input.claim_id.as_str())?;
        if !claim.can_adjudicate() {
            return Err(CoreError::InvalidTransition {
                aggregate: "Claim".into(),
                from: claim.status.as_str().into(),
                to: ClaimStatus::Adjusted.as_str().into(),
            });
        }
        if input.amount_cents <= Cents::ZERO {
            return Err(CoreError::BalanceInvariant {
                detail: "adjusted amount must be positive".to_string(),
            });
        }
        scope.emit(
            AggregateKind::Claim,
            input.claim_id.as_str(),
            &claim.cycle_id,
            event::CLAIM_ADJUSTED,
            &ClaimAdjustedData { amount_cents: input.amount_cents, reason: input.reason.clone() },
            None,
        )?;
        Ok(AdjustClaimResponse {
            claim_id: input.claim_id.clone(),
            status: ClaimStatus::Adjusted,
            amount_cents: input.amount_cents,
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArtifactInput {
    pub claim_id: ClaimId,
    /// Which artifact slot this document fills.
    pub field: String,
    /// Reference into the content-addressed artifact store.
    pub artifact_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArtifactResponse {
    pub claim_id: ClaimId,
    pub field: String,
}

/// Attach a supporting document to a claim. Allowed after cycle close.
pub fn attach_artifact(
    core: &Core,
    ctx: &CommandContext,
    input: AttachArtifactInput,
) -> CoreResult<AttachArtifactResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Claim, input.claim_id.as_str())];
    execute(core, ctx, "AttachArtifact", &hash, locks, |tx, scope| {
        let claim = load_claim(tx, input.claim_id.as_str())?;
        scope.emit(
            AggregateKind::Claim,
            input.claim_id.as_str(),
            &claim.cycle_id,
            event::ARTIFACT_ATTACHED,
            &serde_json::json!({
                "field": input.field,
                "artifactSha256": input.artifact_sha256,
            }),
            None,
        )?;
        Ok(AttachArtifactResponse { claim_id: input.claim_id.clone(), field: input.field.clone() })
    })
}
