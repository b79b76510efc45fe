//! Invoice aggregate.
//!
//! Approved claims for one clinic roll up into an invoice; submitted invoices
//! are claimed by OASIS export batches. A batch rejection or void releases
//! the invoice (clears its batch reference) so a new batch can claim it.

use crate::domain::event::{self, Event};
use crate::domain::ids::{BatchId, ClaimId, ClinicId, CycleId, InvoiceId};
use crate::domain::money::Cents;
use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Generated,
    Submitted,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Generated => "GENERATED",
            Self::Submitted => "SUBMITTED",
            Self::Paid => "PAID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "GENERATED" => Some(Self::Generated),
            "SUBMITTED" => Some(Self::Submitted),
            "PAID" => Some(Self::Paid),
            _ => None,
        }
    }
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceGeneratedData {
    pub invoice_id: InvoiceId,
    pub clinic_id: ClinicId,
    pub claim_ids: Vec<ClaimId>,
    pub total_cents: Cents,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecordedData {
    pub payment_id: String,
    pub amount_cents: Cents,
    pub paid_at: DateTime<Utc>,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRecordedData {
    pub adjustment_id: String,
    pub amount_cents: Cents,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_invoice_id: Option<InvoiceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentAppliedData {
    pub adjustment_id: String,
    pub amount_cents: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceExportedData {
    pub batch_id: BatchId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceReleasedData {
    pub batch_id: BatchId,
    pub reason: String,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceState {
    pub invoice_id: InvoiceId,
    pub cycle_id: CycleId,
    pub clinic_id: ClinicId,
    pub status: InvoiceStatus,
    pub claim_ids: Vec<ClaimId>,
    pub adjustment_ids: Vec<String>,
    pub total: Cents,
    pub paid_total: Cents,
    pub payment_count: u32,
    pub batch_id: Option<BatchId>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl InvoiceState {
    pub fn empty(invoice_id: InvoiceId) -> Self {
        Self {
            invoice_id,
            cycle_id: CycleId::new(""),
            clinic_id: ClinicId::new(""),
            status: InvoiceStatus::Draft,
            claim_ids: Vec::new(),
            adjustment_ids: Vec::new(),
            total: Cents::ZERO,
            paid_total: Cents::ZERO,
            payment_count: 0,
            batch_id: None,
            period_start: NaiveDate::MIN,
            period_end: NaiveDate::MAX,
        }
    }

    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::INVOICE_GENERATED => {
                let data: InvoiceGeneratedData = serde_json::from_value(ev.event_data.clone())?;
                self.cycle_id = ev.cycle_id.clone();
                self.clinic_id = data.clinic_id;
                self.claim_ids = data.claim_ids;
                self.total = data.total_cents;
                self.period_start = data.period_start;
                self.period_end = data.period_end;
                self.status = InvoiceStatus::Generated;
            }
            event::INVOICE_SUBMITTED => {
                self.status = InvoiceStatus::Submitted;
            }
            event::INVOICE_PAYMENT_RECORDED => {
                let data: PaymentRecordedData = serde_json::from_value(ev.event_data.clone())?;
                self.paid_total = self.paid_total + data.amount_cents;
                self.payment_count += 1;
                if self.paid_total >= self.total {
                    self.status = InvoiceStatus::Paid;
                }
            }
            event::INVOICE_ADJUSTMENT_APPLIED => {
                let data: AdjustmentAppliedData = serde_json::from_value(ev.event_data.clone())?;
                self.total = self.total + data.amount_cents;
                self.adjustment_ids.push(data.adjustment_id);
            }
            event::INVOICE_EXPORTED => {
                let data: InvoiceExportedData = serde_json::from_value(ev.event_data.clone())?;
                self.batch_id = Some(data.batch_id);
            }
            event::INVOICE_RELEASED => {
                self.batch_id = None;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn check_invariant(&self) -> CoreResult<()> {
        if self.total.is_negative() {
            return Err(CoreError::BalanceInvariant {
                detail: format!("invoice {} negative total", self.invoice_id),
            });
        }
        if self.status == InvoiceStatus::Paid && self.payment_count == 0 {
            return Err(CoreError::BalanceInvariant {
                detail: format!("invoice {} paid without payments", self.invoice_id),
            });
        }
        Ok(())
    }

    // -- Guards --------------------------------------------------------------

    pub fn can_submit(&self) -> bool {
        self.status == InvoiceStatus::Generated
    }

    /// Eligible for export: submitted, no batch holds it.
    pub fn is_exportable(&self) -> bool {
        self.status == InvoiceStatus::Submitted && self.batch_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{AggregateKind, INVOICE_EXPORTED, INVOICE_GENERATED,
        INVOICE_PAYMENT_RECORDED, INVOICE_RELEASED, INVOICE_SUBMITTED};
    use crate::domain::ids::{ActorId, ActorKind, CorrelationId, EventIdGen};

    fn invoice_event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            event_id: EventIdGen::new().next_now(),
            aggregate_kind: AggregateKind::Invoice,
            aggregate_id: "inv_1".into(),
            event_type: event_type.to_string(),
            event_data: data,
            occurred_at: Utc::now(),
            ingested_at_ms: Utc::now().timestamp_millis(),
            cycle_id: CycleId::new("FY2026"),
            correlation_id: CorrelationId::new("corr"),
            causation_id: None,
            actor_id: ActorId::new("tester"),
            actor_kind: ActorKind::Admin,
        }
    }

    fn generated() -> InvoiceState {
        let mut inv = InvoiceState::empty(InvoiceId::new("inv_1"));
        let data = InvoiceGeneratedData {
            invoice_id: InvoiceId::new("inv_1"),
            clinic_id: ClinicId::new("clinic-1"),
            claim_ids: vec![ClaimId::new("clm_a"), ClaimId::new("clm_b")],
            total_cents: Cents::new(90_000),
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        };
        inv.apply(&invoice_event(INVOICE_GENERATED, serde_json::to_value(&data).unwrap()))
            .unwrap();
        inv
    }

    #[test]
    fn generated_invoice_has_claims_and_total() {
        let inv = generated();
        assert_eq!(inv.status, InvoiceStatus::Generated);
        assert_eq!(inv.claim_ids.len(), 2);
        assert_eq!(inv.total.get(), 90_000);
        assert!(inv.can_submit());
        assert!(!inv.is_exportable());
    }

    #[test]
    fn export_then_release_clears_batch_reference() {
        let mut inv = generated();
        inv.apply(&invoice_event(INVOICE_SUBMITTED, serde_json::json!({}))).unwrap();
        assert!(inv.is_exportable());

        let exported =
            serde_json::to_value(InvoiceExportedData { batch_id: BatchId::new("bat_1") }).unwrap();
        inv.apply(&invoice_event(INVOICE_EXPORTED, exported)).unwrap();
        assert!(!inv.is_exportable());
        assert_eq!(inv.batch_id, Some(BatchId::new("bat_1")));

        let released = serde_json::to_value(InvoiceReleasedData {
            batch_id: BatchId::new("bat_1"),
            reason: "batch voided".into(),
        })
        .unwrap();
        inv.apply(&invoice_event(INVOICE_RELEASED, released)).unwrap();
        assert!(inv.batch_id.is_none());
        assert!(inv.is_exportable(), "released invoice is eligible for a new batch");
    }

    #[test]
    fn payments_drive_paid_status() {
        let mut inv = generated();
        inv.apply(&invoice_event(INVOICE_SUBMITTED, serde_json::json!({}))).unwrap();
        let pay = |amount: i64| {
            serde_json::to_value(PaymentRecordedData {
                payment_id: format!("pay-{}", amount),
                amount_cents: Cents::new(amount),
                paid_at: Utc::now(),
                reference: "treasury".into(),
            })
            .unwrap()
        };
        inv.apply(&invoice_event(INVOICE_PAYMENT_RECORDED, pay(40_000))).unwrap();
        assert_eq!(inv.status, InvoiceStatus::Submitted);
        inv.apply(&invoice_event(INVOICE_PAYMENT_RECORDED, pay(50_000))).unwrap();
        assert_eq!(inv.status, InvoiceStatus::Paid);
        assert_eq!(inv.payment_count, 2);
        inv.check_invariant().unwrap();
    }
}
