//! Invoice commands: generation from approved claims, submission, payments,
//! adjustments.

use crate::commands::{
    execute, input_hash, load_claim, load_invoice, CommandContext, Core,
};
use crate::domain::claim::ClaimInvoicedData;
use crate::domain::event::{self, AggregateKind};
use crate::domain::ids::{ClaimId, ClinicId, CycleId, InvoiceId};
use crate::domain::invoice::{
    AdjustmentAppliedData, AdjustmentRecordedData, InvoiceGeneratedData, InvoiceStatus,
    PaymentRecordedData,
};
use crate::domain::money::Cents;
use crate::errors::{CoreError, CoreResult};
use crate::store::locks::{LockKey, LockKind};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInvoicesInput {
    pub cycle_id: CycleId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedInvoice {
    pub invoice_id: InvoiceId,
    pub clinic_id: ClinicId,
    pub total_cents: Cents,
    pub claim_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInvoicesResponse {
    pub cycle_id: CycleId,
    pub invoices: Vec<GeneratedInvoice>,
}

/// Roll approved, un-invoiced claims into one invoice per clinic.
pub fn generate_invoices(
    core: &Core,
    ctx: &CommandContext,
    input: GenerateInvoicesInput,
) -> CoreResult<GenerateInvoicesResponse> {
    let hash = input_hash(&input)?;
    // Candidate set read ahead of the transaction to build the lock list;
    // each claim is re-checked under its lock before being invoiced.
    let candidates: Vec<String> = core.db().with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT claim_id FROM claims
             WHERE cycle_id = ?1 AND status = 'APPROVED' AND invoice_id IS NULL
             ORDER BY claim_id ASC",
        )?;
        let ids = stmt
            .query_map(params![input.cycle_id.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    })?;
    let mut locks: Vec<LockKey> = candidates
        .iter()
        .map(|id| LockKey::new(LockKind::Claim, id.clone()))
        .collect();
    locks.push(LockKey::new(LockKind::Invoice, input.cycle_id.as_str()));

    execute(core, ctx, "GenerateInvoices", &hash, locks, |tx, scope| {
        // Group invoiceable claims by clinic, deterministically.
        let mut by_clinic: Vec<(String, Vec<(ClaimId, Cents)>)> = Vec::new();
        for claim_id in &candidates {
            let claim = load_claim(tx, claim_id)?;
            if !claim.can_invoice() {
                continue;
            }
            let Some(approved) = claim.approved_amount else { continue };
            let clinic_key = claim.clinic_id.as_str().to_string();
            match by_clinic.iter_mut().find(|(c, _)| *c == clinic_key) {
                Some((_, claims)) => claims.push((claim.claim_id.clone(), approved)),
                None => by_clinic.push((clinic_key, vec![(claim.claim_id.clone(), approved)])),
            }
        }
        by_clinic.sort_by(|a, b| a.0.cmp(&b.0));

        let mut generated = Vec::new();
        for (clinic_id, claims) in &by_clinic {
            let invoice_id = InvoiceId::mint();
            let mut total = Cents::ZERO;
            for (_, amount) in claims {
                total = total
                    .checked_add(*amount)
                    .ok_or_else(|| CoreError::BalanceInvariant {
                        detail: "invoice total overflow".to_string(),
                    })?;
            }
            let data = InvoiceGeneratedData {
                invoice_id: invoice_id.clone(),
                clinic_id: ClinicId::new(clinic_id.clone()),
                claim_ids: claims.iter().map(|(id, _)| id.clone()).collect(),
                total_cents: total,
                period_start: input.period_start,
                period_end: input.period_end,
            };
            let generated_event = scope.emit(
                AggregateKind::Invoice,
                invoice_id.as_str(),
                &input.cycle_id,
                event::INVOICE_GENERATED,
                &data,
                None,
            )?;
            for (claim_id, _) in claims {
                scope.emit(
                    AggregateKind::Claim,
                    claim_id.as_str(),
                    &input.cycle_id,
                    event::CLAIM_INVOICED,
                    &ClaimInvoicedData { invoice_id: invoice_id.clone() },
                    Some(generated_event.event_id),
                )?;
            }
            generated.push(GeneratedInvoice {
                invoice_id,
                clinic_id: ClinicId::new(clinic_id.clone()),
                total_cents: total,
                claim_count: claims.len() as u32,
            });
        }
        info!(cycle = %input.cycle_id, invoices = generated.len(), "generated invoices");
        Ok(GenerateInvoicesResponse { cycle_id: input.cycle_id.clone(), invoices: generated })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitInvoiceInput {
    pub invoice_id: InvoiceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    pub invoice_id: InvoiceId,
    pub status: InvoiceStatus,
}

pub fn submit_invoice(
    core: &Core,
    ctx: &CommandContext,
    input: SubmitInvoiceInput,
) -> CoreResult<InvoiceResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Invoice, input.invoice_id.as_str())];
    execute(core, ctx, "SubmitInvoice", &hash, locks, |tx, scope| {
        let invoice = load_invoice(tx, input.invoice_id.as_str())?;
        if !invoice.can_submit() {
            return Err(CoreError::InvalidTransition {
                aggregate: "Invoice".into(),
                from: invoice.status.as_str().into(),
                to: InvoiceStatus::Submitted.as_str().into(),
            });
        }
        scope.emit(
            AggregateKind::Invoice,
            input.invoice_id.as_str(),
            &invoice.cycle_id,
            event::INVOICE_SUBMITTED,
            &serde_json::json!({}),
            None,
        )?;
        Ok(InvoiceResponse { invoice_id: input.invoice_id.clone(), status: InvoiceStatus::Submitted })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentInput {
    pub invoice_id: InvoiceId,
    pub amount_cents: Cents,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentResponse {
    pub invoice_id: InvoiceId,
    pub payment_id: String,
    pub status: InvoiceStatus,
    pub paid_total_cents: Cents,
}

/// Record a treasury payment against a submitted invoice. On the post-close
/// allow-list: payments may land after the cycle closes.
pub fn record_payment(
    core: &Core,
    ctx: &CommandContext,
    input: RecordPaymentInput,
) -> CoreResult<RecordPaymentResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Invoice, input.invoice_id.as_str())];
    execute(core, ctx, "RecordPayment", &hash, locks, |tx, scope| {
        let mut invoice = load_invoice(tx, input.invoice_id.as_str())?;
        if !matches!(invoice.status, InvoiceStatus::Submitted | InvoiceStatus::Paid) {
            return Err(CoreError::InvalidTransition {
                aggregate: "Invoice".into(),
                from: invoice.status.as_str().into(),
                to: InvoiceStatus::Paid.as_str().into(),
            });
        }
        if input.amount_cents <= Cents::ZERO {
            return Err(CoreError::BalanceInvariant {
                detail: "payment amount must be positive".to_string(),
            });
        }
        let payment_id = format!("pay_{}", Uuid::new_v4().simple());
        let ev = scope.emit(
            AggregateKind::Invoice,
            input.invoice_id.as_str(),
            &invoice.cycle_id.clone(),
            event::INVOICE_PAYMENT_RECORDED,
            &PaymentRecordedData {
                payment_id: payment_id.clone(),
                amount_cents: input.amount_cents,
                paid_at: input.paid_at.unwrap_or_else(|| scope.now()),
                reference: input.reference.clone(),
            },
            None,
        )?;
        invoice.apply(&ev)?;
        Ok(RecordPaymentResponse {
            invoice_id: input.invoice_id.clone(),
            payment_id,
            status: invoice.status,
            paid_total_cents: invoice.paid_total,
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordAdjustmentInput {
    pub cycle_id: CycleId,
    pub amount_cents: Cents,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_invoice_id: Option<InvoiceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordAdjustmentResponse {
    pub adjustment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_invoice_id: Option<InvoiceId>,
}

/// Record a monetary adjustment; a target invoice can be supplied now or
/// attached later with `apply_adjustment`.
pub fn record_adjustment(
    core: &Core,
    ctx: &CommandContext,
    input: RecordAdjustmentInput,
) -> CoreResult<RecordAdjustmentResponse> {
    let hash = input_hash(&input)?;
    let mut locks = Vec::new();
    if let Some(target) = &input.target_invoice_id {
        locks.push(LockKey::new(LockKind::Invoice, target.as_str()));
    }
    execute(core, ctx, "RecordAdjustment", &hash, locks, |tx, scope| {
        let adjustment_id = format!("adj_{}", Uuid::new_v4().simple());
        scope.emit(
            AggregateKind::Invoice,
            &adjustment_id,
            &input.cycle_id,
            event::INVOICE_ADJUSTMENT_RECORDED,
            &AdjustmentRecordedData {
                adjustment_id: adjustment_id.clone(),
                amount_cents: input.amount_cents,
                reason: input.reason.clone(),
                target_invoice_id: input.target_invoice_id.clone(),
            },
            None,
        )?;
        // When the target is already known, apply in the same transaction.
        if let Some(target) = &input.target_invoice_id {
            let invoice = load_invoice(tx, target.as_str())?;
            scope.emit(
                AggregateKind::Invoice,
                target.as_str(),
                &invoice.cycle_id,
                event::INVOICE_ADJUSTMENT_APPLIED,
                &AdjustmentAppliedData {
                    adjustment_id: adjustment_id.clone(),
                    amount_cents: input.amount_cents,
                },
                scope.last_event_id(),
            )?;
        }
        Ok(RecordAdjustmentResponse {
            adjustment_id,
            target_invoice_id: input.target_invoice_id.clone(),
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyAdjustmentInput {
    pub adjustment_id: String,
    pub invoice_id: InvoiceId,
}

/// Attach a pending adjustment to its invoice.
pub fn apply_adjustment(
    core: &Core,
    ctx: &CommandContext,
    input: ApplyAdjustmentInput,
) -> CoreResult<RecordAdjustmentResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Invoice, input.invoice_id.as_str())];
    execute(core, ctx, "ApplyAdjustment", &hash, locks, |tx, scope| {
        let pending: Option<(i64, i64)> = tx
            .query_row(
                "SELECT amount_cents, applied FROM invoice_adjustments WHERE adjustment_id = ?1",
                params![input.adjustment_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((amount_cents, applied)) = pending else {
            return Err(CoreError::AdjustmentNotFound {
                adjustment_id: input.adjustment_id.clone(),
            });
        };
        if applied != 0 {
            // Already attached; idempotent success.
            return Ok(RecordAdjustmentResponse {
                adjustment_id: input.adjustment_id.clone(),
                target_invoice_id: Some(input.invoice_id.clone()),
            });
        }
        let invoice = load_invoice(tx, input.invoice_id.as_str())?;
        scope.emit(
            AggregateKind::Invoice,
            input.invoice_id.as_str(),
            &invoice.cycle_id,
            event::INVOICE_ADJUSTMENT_APPLIED,
            &AdjustmentAppliedData {
                adjustment_id: input.adjustment_id.clone(),
                amount_cents: Cents::new(amount_cents),
            },
            None,
        )?;
        Ok(RecordAdjustmentResponse {
            adjustment_id: input.adjustment_id.clone(),
            target_invoice_id: Some(input.invoice_id.clone()),
        })
    })
}
