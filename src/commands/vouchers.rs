//! Voucher commands: issue (tentative or direct), confirm, void.
//!
//! Issuing encumbers the grant bucket the voucher draws from; voiding (or the
//! tentative sweep) releases the encumbrance.

use crate::commands::{
    allocator_next_sequence, execute, input_hash, load_grant, load_voucher, CommandContext, Core,
};
use crate::domain::event::{self, AggregateKind};
use crate::domain::grant::{Bucket, FundsMovementData};
use crate::domain::ids::{GrantId, VoucherId};
use crate::domain::money::Cents;
use crate::domain::voucher::{
    mint_voucher_code, VoucherIssuedData, VoucherStatus, VoucherVoidedData,
};
use crate::errors::{CoreError, CoreResult};
use crate::store::locks::{LockKey, LockKind};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

fn bucket_lock(is_lirp: bool) -> LockKind {
    if is_lirp {
        LockKind::GrantLirp
    } else {
        LockKind::GrantGeneral
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueVoucherInput {
    pub grant_id: GrantId,
    pub county: String,
    pub is_lirp: bool,
    pub max_reimbursement_cents: Cents,
    pub valid_until: NaiveDate,
    /// Issue as tentative with a confirmation hold of this many hours.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tentative_hold_hours: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueVoucherResponse {
    pub voucher_id: VoucherId,
    pub code: String,
    pub status: VoucherStatus,
    pub sequence: i64,
}

/// Issue a voucher, minting its code from the per-(cycle, county) allocator
/// and encumbering the bucket it draws from.
pub fn issue_voucher(
    core: &Core,
    ctx: &CommandContext,
    input: IssueVoucherInput,
) -> CoreResult<IssueVoucherResponse> {
    let hash = input_hash(&input)?;
    // Cycle is derivable only from the grant; read it ahead for the
    // allocator lock key. The grant never changes cycle after award.
    let cycle_id = core
        .db()
        .with_conn(|conn| load_grant(conn, input.grant_id.as_str()))?
        .cycle_id;
    let allocator_id =
        crate::domain::allocator::allocator_key(&cycle_id, &input.county);
    let locks = vec![
        LockKey::new(bucket_lock(input.is_lirp), input.grant_id.as_str()),
        LockKey::new(LockKind::Allocator, allocator_id),
    ];
    execute(core, ctx, "IssueVoucher", &hash, locks, |tx, scope| {
        let grant = load_grant(tx, input.grant_id.as_str())?;
        let bucket = Bucket::for_voucher(input.is_lirp);
        if input.max_reimbursement_cents <= Cents::ZERO {
            return Err(CoreError::BalanceInvariant {
                detail: "voucher amount must be positive".to_string(),
            });
        }
        grant.can_encumber(bucket, input.max_reimbursement_cents)?;

        let sequence = allocator_next_sequence(tx, &grant.cycle_id, &input.county)?;
        let code = mint_voucher_code(&grant.cycle_id, &input.county, sequence);
        let voucher_id = VoucherId::mint();
        let tentative_expires_at =
            input.tentative_hold_hours.map(|h| scope.now() + Duration::hours(h));
        let status = if tentative_expires_at.is_some() {
            VoucherStatus::Tentative
        } else {
            VoucherStatus::Issued
        };

        let issued = VoucherIssuedData {
            voucher_id: voucher_id.clone(),
            grant_id: input.grant_id.clone(),
            code: code.clone(),
            county: input.county.to_ascii_uppercase(),
            is_lirp: input.is_lirp,
            max_reimbursement_cents: input.max_reimbursement_cents,
            sequence,
            valid_until: input.valid_until,
            tentative_expires_at,
        };
        let issue_type = if status == VoucherStatus::Tentative {
            event::VOUCHER_ISSUED_TENTATIVE
        } else {
            event::VOUCHER_ISSUED
        };
        let issue_event = scope.emit(
            AggregateKind::Voucher,
            voucher_id.as_str(),
            &grant.cycle_id,
            issue_type,
            &issued,
            None,
        )?;
        scope.emit(
            AggregateKind::Grant,
            input.grant_id.as_str(),
            &grant.cycle_id,
            event::GRANT_FUNDS_ENCUMBERED,
            &FundsMovementData {
                bucket,
                amount_cents: input.max_reimbursement_cents,
                voucher_id: Some(voucher_id.as_str().to_string()),
                claim_id: None,
                reason: "voucher issued".to_string(),
            },
            Some(issue_event.event_id),
        )?;
        Ok(IssueVoucherResponse { voucher_id, code, status, sequence })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmVoucherInput {
    pub voucher_id: VoucherId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmVoucherResponse {
    pub voucher_id: VoucherId,
    pub status: VoucherStatus,
}

/// Confirm a tentative voucher before its hold expires.
pub fn confirm_voucher(
    core: &Core,
    ctx: &CommandContext,
    input: ConfirmVoucherInput,
) -> CoreResult<ConfirmVoucherResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Voucher, input.voucher_id.as_str())];
    execute(core, ctx, "ConfirmVoucher", &hash, locks, |tx, scope| {
        let voucher = load_voucher(tx, input.voucher_id.as_str())?;
        if !voucher.can_confirm() {
            return Err(CoreError::VoucherNotValid {
                voucher_id: input.voucher_id.to_string(),
                reason: format!("cannot confirm from status {}", voucher.status.as_str()),
            });
        }
        scope.emit(
            AggregateKind::Voucher,
            input.voucher_id.as_str(),
            &voucher.cycle_id,
            event::VOUCHER_ISSUED,
            &serde_json::json!({}),
            None,
        )?;
        Ok(ConfirmVoucherResponse {
            voucher_id: input.voucher_id.clone(),
            status: VoucherStatus::Issued,
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoidVoucherInput {
    pub voucher_id: VoucherId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoidVoucherResponse {
    pub voucher_id: VoucherId,
    pub status: VoucherStatus,
    pub released_cents: Cents,
}

/// Void a tentative or issued voucher, releasing its encumbrance back to the
/// bucket.
pub fn void_voucher(
    core: &Core,
    ctx: &CommandContext,
    input: VoidVoucherInput,
) -> CoreResult<VoidVoucherResponse> {
    let hash = input_hash(&input)?;
    // Grant and bucket are fixed at issue time; safe to read ahead for locks.
    let voucher = core
        .db()
        .with_conn(|conn| load_voucher(conn, input.voucher_id.as_str()))?;
    let locks = vec![
        LockKey::new(LockKind::Voucher, input.voucher_id.as_str()),
        LockKey::new(bucket_lock(voucher.is_lirp), voucher.grant_id.as_str()),
    ];
    execute(core, ctx, "VoidVoucher", &hash, locks, |tx, scope| {
        let voucher = load_voucher(tx, input.voucher_id.as_str())?;
        voucher.check_voidable()?;
        let void_event = scope.emit(
            AggregateKind::Voucher,
            input.voucher_id.as_str(),
            &voucher.cycle_id,
            event::VOUCHER_VOIDED,
            &VoucherVoidedData { reason: input.reason.clone() },
            None,
        )?;
        scope.emit(
            AggregateKind::Grant,
            voucher.grant_id.as_str(),
            &voucher.cycle_id,
            event::GRANT_FUNDS_RELEASED,
            &FundsMovementData {
                bucket: Bucket::for_voucher(voucher.is_lirp),
                amount_cents: voucher.max_reimbursement,
                voucher_id: Some(input.voucher_id.as_str().to_string()),
                claim_id: None,
                reason: format!("voucher voided: {}", input.reason),
            },
            Some(void_event.event_id),
        )?;
        Ok(VoidVoucherResponse {
            voucher_id: input.voucher_id.clone(),
            status: VoucherStatus::Voided,
            released_cents: voucher.max_reimbursement,
        })
    })
}
