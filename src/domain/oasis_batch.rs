//! OASIS export batch aggregate.
//!
//! A batch captures the set of invoices selected at a watermark, the rendered
//! treasury file, and the downstream acknowledgement lifecycle.
//!
//! ```text
//! CREATED -> FILE_RENDERED -> SUBMITTED -> ACKNOWLEDGED
//!    \            \               \-> REJECTED (releases invoices)
//!     \            \-> VOIDED (releases invoices)
//!      \-> VOIDED
//! ```

use crate::domain::event::{self, Event};
use crate::domain::ids::{sha256_hex, BatchId, CycleId, InvoiceId};
use crate::domain::money::Cents;
use crate::domain::Watermark;
use crate::errors::{CoreError, CoreResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Created,
    FileRendered,
    Submitted,
    Acknowledged,
    Rejected,
    Voided,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::FileRendered => "FILE_RENDERED",
            Self::Submitted => "SUBMITTED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Rejected => "REJECTED",
            Self::Voided => "VOIDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "FILE_RENDERED" => Some(Self::FileRendered),
            "SUBMITTED" => Some(Self::Submitted),
            "ACKNOWLEDGED" => Some(Self::Acknowledged),
            "REJECTED" => Some(Self::Rejected),
            "VOIDED" => Some(Self::Voided),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Rejected | Self::Voided)
    }
}

/// Stable identifier of the invoice set constituting a batch:
/// `sha256(cycle ":" periodStart ":" periodEnd ":" sorted invoice ids)`.
pub fn batch_fingerprint(
    cycle_id: &CycleId,
    period_start: NaiveDate,
    period_end: NaiveDate,
    invoice_ids: &[InvoiceId],
) -> String {
    let mut ids: Vec<&str> = invoice_ids.iter().map(|i| i.as_str()).collect();
    ids.sort_unstable();
    let input = format!(
        "{}:{}:{}:{}",
        cycle_id.as_str(),
        period_start,
        period_end,
        ids.join(",")
    );
    sha256_hex(input.as_bytes())
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreatedData {
    pub batch_id: BatchId,
    pub batch_code: String,
    pub fingerprint: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    /// Selection watermark the eligible-invoice query ran at.
    pub watermark: Watermark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemAddedData {
    pub invoice_id: InvoiceId,
    pub position: u32,
    pub amount_cents: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRenderedData {
    pub record_count: u32,
    pub control_total_cents: Cents,
    pub content_length: u64,
    pub sha256: String,
    pub format_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransitionData {
    pub reason: String,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: BatchId,
    pub cycle_id: CycleId,
    pub status: BatchStatus,
    pub batch_code: String,
    pub fingerprint: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub selection_watermark: Watermark,
    /// Invoices in selection order.
    pub invoice_ids: Vec<InvoiceId>,
    pub record_count: u32,
    pub control_total: Cents,
    pub artifact_sha256: Option<String>,
    pub content_length: u64,
    pub format_version: Option<String>,
}

impl BatchState {
    pub fn empty(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            cycle_id: CycleId::new(""),
            status: BatchStatus::Created,
            batch_code: String::new(),
            fingerprint: String::new(),
            period_start: NaiveDate::MIN,
            period_end: NaiveDate::MAX,
            selection_watermark: Watermark::zero(),
            invoice_ids: Vec::new(),
            record_count: 0,
            control_total: Cents::ZERO,
            artifact_sha256: None,
            content_length: 0,
            format_version: None,
        }
    }

    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::OASIS_EXPORT_BATCH_CREATED => {
                let data: BatchCreatedData = serde_json::from_value(ev.event_data.clone())?;
                self.cycle_id = ev.cycle_id.clone();
                self.batch_code = data.batch_code;
                self.fingerprint = data.fingerprint;
                self.period_start = data.period_start;
                self.period_end = data.period_end;
                self.selection_watermark = data.watermark;
                self.status = BatchStatus::Created;
            }
            event::OASIS_EXPORT_BATCH_ITEM_ADDED => {
                let data: BatchItemAddedData = serde_json::from_value(ev.event_data.clone())?;
                self.invoice_ids.push(data.invoice_id);
            }
            event::OASIS_EXPORT_FILE_RENDERED => {
                let data: FileRenderedData = serde_json::from_value(ev.event_data.clone())?;
                self.record_count = data.record_count;
                self.control_total = data.control_total_cents;
                self.artifact_sha256 = Some(data.sha256);
                self.content_length = data.content_length;
                self.format_version = Some(data.format_version);
                self.status = BatchStatus::FileRendered;
            }
            event::OASIS_EXPORT_BATCH_SUBMITTED => {
                self.status = BatchStatus::Submitted;
            }
            event::OASIS_EXPORT_BATCH_ACKNOWLEDGED => {
                self.status = BatchStatus::Acknowledged;
            }
            event::OASIS_EXPORT_BATCH_REJECTED => {
                self.status = BatchStatus::Rejected;
            }
            event::OASIS_EXPORT_BATCH_VOIDED => {
                self.status = BatchStatus::Voided;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn check_invariant(&self) -> CoreResult<()> {
        if self.control_total.is_negative() {
            return Err(CoreError::BatchInvariant {
                detail: format!("batch {} negative control total", self.batch_id),
            });
        }
        // Rendered batches must reference their artifact.
        if matches!(
            self.status,
            BatchStatus::FileRendered | BatchStatus::Submitted | BatchStatus::Acknowledged
        ) && self.artifact_sha256.is_none()
        {
            return Err(CoreError::BatchInvariant {
                detail: format!("batch {} rendered without artifact", self.batch_id),
            });
        }
        Ok(())
    }

    // -- Guards --------------------------------------------------------------

    pub fn check_can_render(&self) -> CoreResult<()> {
        match self.status {
            BatchStatus::Created => Ok(()),
            // Idempotent re-render is handled by the caller via the stored
            // artifact reference; any other state is a hard stop.
            BatchStatus::FileRendered => Ok(()),
            BatchStatus::Voided => {
                Err(CoreError::BatchAlreadyVoided { batch_id: self.batch_id.to_string() })
            }
            other => Err(CoreError::InvalidTransition {
                aggregate: "OasisBatch".into(),
                from: other.as_str().into(),
                to: BatchStatus::FileRendered.as_str().into(),
            }),
        }
    }

    pub fn check_can_submit(&self) -> CoreResult<()> {
        match self.status {
            BatchStatus::FileRendered => Ok(()),
            BatchStatus::Created => {
                Err(CoreError::BatchNotRendered { batch_id: self.batch_id.to_string() })
            }
            BatchStatus::Submitted | BatchStatus::Acknowledged => {
                Err(CoreError::BatchAlreadySubmitted { batch_id: self.batch_id.to_string() })
            }
            BatchStatus::Voided => {
                Err(CoreError::BatchAlreadyVoided { batch_id: self.batch_id.to_string() })
            }
            other => Err(CoreError::InvalidTransition {
                aggregate: "OasisBatch".into(),
                from: other.as_str().into(),
                to: BatchStatus::Submitted.as_str().into(),
            }),
        }
    }

    /// ACKNOWLEDGED and REJECTED are only reachable from SUBMITTED.
    pub fn check_can_resolve(&self, to: BatchStatus) -> CoreResult<()> {
        if self.status == BatchStatus::Submitted {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                aggregate: "OasisBatch".into(),
                from: self.status.as_str().into(),
                to: to.as_str().into(),
            })
        }
    }

    /// VOIDED is reachable from any non-SUBMITTED, non-ACKNOWLEDGED state.
    pub fn check_can_void(&self) -> CoreResult<()> {
        match self.status {
            BatchStatus::Created | BatchStatus::FileRendered | BatchStatus::Rejected => Ok(()),
            BatchStatus::Voided => {
                Err(CoreError::BatchAlreadyVoided { batch_id: self.batch_id.to_string() })
            }
            BatchStatus::Submitted | BatchStatus::Acknowledged => {
                Err(CoreError::BatchAlreadySubmitted { batch_id: self.batch_id.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{AggregateKind, OASIS_EXPORT_BATCH_CREATED,
        OASIS_EXPORT_BATCH_SUBMITTED, OASIS_EXPORT_BATCH_VOIDED, OASIS_EXPORT_FILE_RENDERED};
    use crate::domain::ids::{ActorId, ActorKind, CorrelationId, EventIdGen};
    use chrono::Utc;

    fn batch_event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            event_id: EventIdGen::new().next_now(),
            aggregate_kind: AggregateKind::OasisBatch,
            aggregate_id: "bat_1".into(),
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

    fn created() -> BatchState {
        let mut b = BatchState::empty(BatchId::new("bat_1"));
        let data = BatchCreatedData {
            batch_id: BatchId::new("bat_1"),
            batch_code: "WVSNP-FY2026-001".into(),
            fingerprint: "f".repeat(64),
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            watermark: Watermark::zero(),
        };
        b.apply(&batch_event(OASIS_EXPORT_BATCH_CREATED, serde_json::to_value(&data).unwrap()))
            .unwrap();
        b
    }

    fn rendered() -> BatchState {
        let mut b = created();
        let data = FileRenderedData {
            record_count: 2,
            control_total_cents: Cents::new(125_000),
            content_length: 408,
            sha256: "a".repeat(64),
            format_version: "OASIS-1.0".into(),
        };
        b.apply(&batch_event(OASIS_EXPORT_FILE_RENDERED, serde_json::to_value(&data).unwrap()))
            .unwrap();
        b
    }

    #[test]
    fn happy_path_transitions() {
        let mut b = rendered();
        b.check_can_submit().unwrap();
        b.apply(&batch_event(OASIS_EXPORT_BATCH_SUBMITTED, serde_json::json!({}))).unwrap();
        b.check_can_resolve(BatchStatus::Acknowledged).unwrap();
        b.check_invariant().unwrap();
    }

    #[test]
    fn submit_requires_render() {
        let b = created();
        assert_eq!(b.check_can_submit().unwrap_err().code(), "BATCH_NOT_RENDERED");
    }

    #[test]
    fn submitted_batch_cannot_be_voided() {
        let mut b = rendered();
        b.apply(&batch_event(OASIS_EXPORT_BATCH_SUBMITTED, serde_json::json!({}))).unwrap();
        assert_eq!(b.check_can_void().unwrap_err().code(), "BATCH_ALREADY_SUBMITTED");
    }

    #[test]
    fn voided_batch_is_terminal() {
        let mut b = created();
        b.check_can_void().unwrap();
        let data = BatchTransitionData { reason: "operator request".into() };
        b.apply(&batch_event(OASIS_EXPORT_BATCH_VOIDED, serde_json::to_value(&data).unwrap()))
            .unwrap();
        assert_eq!(b.check_can_void().unwrap_err().code(), "BATCH_ALREADY_VOIDED");
        assert_eq!(b.check_can_render().unwrap_err().code(), "BATCH_ALREADY_VOIDED");
    }

    #[test]
    fn fingerprint_is_order_insensitive() {
        let cycle = CycleId::new("FY2026");
        let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        let a = batch_fingerprint(
            &cycle, start, end,
            &[InvoiceId::new("inv_b"), InvoiceId::new("inv_a")],
        );
        let b = batch_fingerprint(
            &cycle, start, end,
            &[InvoiceId::new("inv_a"), InvoiceId::new("inv_b")],
        );
        assert_eq!(a, b);
        let c = batch_fingerprint(&cycle, start, end, &[InvoiceId::new("inv_a")]);
        assert_ne!(a, c);
    }
}
