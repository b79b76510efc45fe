//! Event envelope and replay ordering.
//!
//! The event log is the sole source of truth. Every event carries business
//! time (`occurred_at`, caller-provided) and ingest time (`ingested_at`,
//! storage-stamped); replay and pagination always use the
//! `(ingested_at, event_id)` tuple.

use crate::domain::ids::{ActorId, ActorKind, CorrelationId, CycleId, EventId};
use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Aggregate families participating in replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateKind {
    Grant,
    Voucher,
    Allocator,
    Clinic,
    Claim,
    Invoice,
    OasisBatch,
    Closeout,
    BreederFiling,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "GRANT",
            Self::Voucher => "VOUCHER",
            Self::Allocator => "ALLOCATOR",
            Self::Clinic => "CLINIC",
            Self::Claim => "CLAIM",
            Self::Invoice => "INVOICE",
            Self::OasisBatch => "OASIS_BATCH",
            Self::Closeout => "CLOSEOUT",
            Self::BreederFiling => "BREEDER_FILING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GRANT" => Some(Self::Grant),
            "VOUCHER" => Some(Self::Voucher),
            "ALLOCATOR" => Some(Self::Allocator),
            "CLINIC" => Some(Self::Clinic),
            "CLAIM" => Some(Self::Claim),
            "INVOICE" => Some(Self::Invoice),
            "OASIS_BATCH" => Some(Self::OasisBatch),
            "CLOSEOUT" => Some(Self::Closeout),
            "BREEDER_FILING" => Some(Self::BreederFiling),
            _ => None,
        }
    }
}

// Event type constants. Ingest accepts any `[A-Z0-9_]+` type (forward
// compatibility); rebuild silently skips types it does not know.
pub const GRANT_AWARDED: &str = "GRANT_AWARDED";
pub const GRANT_FUNDS_ENCUMBERED: &str = "GRANT_FUNDS_ENCUMBERED";
pub const GRANT_FUNDS_RELEASED: &str = "GRANT_FUNDS_RELEASED";
pub const GRANT_FUNDS_LIQUIDATED: &str = "GRANT_FUNDS_LIQUIDATED";
pub const GRANT_MATCHING_COMMITTED: &str = "GRANT_MATCHING_COMMITTED";
pub const GRANT_MATCHING_REPORTED: &str = "GRANT_MATCHING_REPORTED";
pub const GRANT_CLAIMS_DEADLINE_PASSED: &str = "GRANT_CLAIMS_DEADLINE_PASSED";
pub const GRANT_CYCLE_CLOSEOUT_PREFLIGHT_COMPLETED: &str =
    "GRANT_CYCLE_CLOSEOUT_PREFLIGHT_COMPLETED";
pub const GRANT_CYCLE_CLOSEOUT_STARTED: &str = "GRANT_CYCLE_CLOSEOUT_STARTED";
pub const GRANT_CYCLE_CLOSEOUT_RECONCILED: &str = "GRANT_CYCLE_CLOSEOUT_RECONCILED";
pub const GRANT_CYCLE_AUDIT_HOLD_SET: &str = "GRANT_CYCLE_AUDIT_HOLD_SET";
pub const GRANT_CYCLE_AUDIT_RESOLVED: &str = "GRANT_CYCLE_AUDIT_RESOLVED";
pub const GRANT_CYCLE_CLOSED: &str = "GRANT_CYCLE_CLOSED";

pub const VOUCHER_ISSUED_TENTATIVE: &str = "VOUCHER_ISSUED_TENTATIVE";
pub const VOUCHER_ISSUED: &str = "VOUCHER_ISSUED";
pub const VOUCHER_REDEEMED: &str = "VOUCHER_REDEEMED";
pub const VOUCHER_EXPIRED: &str = "VOUCHER_EXPIRED";
pub const VOUCHER_VOIDED: &str = "VOUCHER_VOIDED";

pub const CLINIC_REGISTERED: &str = "CLINIC_REGISTERED";
pub const CLINIC_SUSPENDED: &str = "CLINIC_SUSPENDED";
pub const CLINIC_REINSTATED: &str = "CLINIC_REINSTATED";
pub const CLINIC_LICENSE_UPDATED: &str = "CLINIC_LICENSE_UPDATED";

pub const CLAIM_SUBMITTED: &str = "CLAIM_SUBMITTED";
pub const CLAIM_APPROVED: &str = "CLAIM_APPROVED";
pub const CLAIM_DENIED: &str = "CLAIM_DENIED";
pub const CLAIM_ADJUSTED: &str = "CLAIM_ADJUSTED";
pub const CLAIM_INVOICED: &str = "CLAIM_INVOICED";
pub const CLAIM_DECISION_CONFLICT_RECORDED: &str = "CLAIM_DECISION_CONFLICT_RECORDED";
pub const CLAIM_FRAUD_SIGNAL_RECORDED: &str = "CLAIM_FRAUD_SIGNAL_RECORDED";

pub const INVOICE_GENERATED: &str = "INVOICE_GENERATED";
pub const INVOICE_SUBMITTED: &str = "INVOICE_SUBMITTED";
pub const INVOICE_PAYMENT_RECORDED: &str = "INVOICE_PAYMENT_RECORDED";
pub const INVOICE_ADJUSTMENT_RECORDED: &str = "INVOICE_ADJUSTMENT_RECORDED";
pub const INVOICE_ADJUSTMENT_APPLIED: &str = "INVOICE_ADJUSTMENT_APPLIED";
/// Invoice claimed by an export batch (batch reference set).
pub const INVOICE_EXPORTED: &str = "INVOICE_EXPORTED";
/// Batch reference cleared after a batch rejection or void.
pub const INVOICE_RELEASED: &str = "INVOICE_RELEASED";

pub const OASIS_EXPORT_BATCH_CREATED: &str = "OASIS_EXPORT_BATCH_CREATED";
pub const OASIS_EXPORT_BATCH_ITEM_ADDED: &str = "OASIS_EXPORT_BATCH_ITEM_ADDED";
pub const OASIS_EXPORT_FILE_RENDERED: &str = "OASIS_EXPORT_FILE_RENDERED";
pub const OASIS_EXPORT_BATCH_SUBMITTED: &str = "OASIS_EXPORT_BATCH_SUBMITTED";
pub const OASIS_EXPORT_BATCH_ACKNOWLEDGED: &str = "OASIS_EXPORT_BATCH_ACKNOWLEDGED";
pub const OASIS_EXPORT_BATCH_REJECTED: &str = "OASIS_EXPORT_BATCH_REJECTED";
pub const OASIS_EXPORT_BATCH_VOIDED: &str = "OASIS_EXPORT_BATCH_VOIDED";

pub const BREEDER_FILING_DUE: &str = "BREEDER_FILING_DUE";
pub const BREEDER_FILING_SUBMITTED: &str = "BREEDER_FILING_SUBMITTED";
pub const BREEDER_FILING_CURED: &str = "BREEDER_FILING_CURED";

pub const ARTIFACT_ATTACHED: &str = "ARTIFACT_ATTACHED";

/// Event types a closed cycle still accepts.
pub const POST_CLOSE_ALLOWED: &[&str] = &[
    INVOICE_PAYMENT_RECORDED,
    OASIS_EXPORT_FILE_RENDERED,
    OASIS_EXPORT_BATCH_SUBMITTED,
    OASIS_EXPORT_BATCH_ACKNOWLEDGED,
    OASIS_EXPORT_BATCH_REJECTED,
    OASIS_EXPORT_BATCH_VOIDED,
    INVOICE_RELEASED,
    GRANT_CYCLE_AUDIT_HOLD_SET,
    GRANT_CYCLE_AUDIT_RESOLVED,
    ARTIFACT_ATTACHED,
];

/// `[A-Z0-9_]+`
pub fn is_valid_event_type(event_type: &str) -> bool {
    !event_type.is_empty()
        && event_type
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Integers beyond 2^53 do not survive a JSON round trip; money must travel
/// as decimal digit strings instead.
const MAX_SAFE_JSON_INT: i64 = 1 << 53;

/// Reject payloads containing lossy integer encodings.
pub fn validate_event_data(data: &Value) -> CoreResult<()> {
    fn walk(value: &Value, path: &str) -> CoreResult<()> {
        match value {
            Value::Number(n) => {
                let lossy = match (n.as_i64(), n.as_u64()) {
                    (Some(i), _) => i.abs() > MAX_SAFE_JSON_INT,
                    (None, Some(_)) => true, // above i64::MAX
                    _ => false,              // floats pass; money fields are strings
                };
                if lossy {
                    return Err(CoreError::EventDataBigintForbidden { path: path.to_string() });
                }
                Ok(())
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    walk(item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            Value::Object(map) => {
                for (k, v) in map {
                    walk(v, &format!("{}.{}", path, k))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
    walk(data, "$")
}

/// An event as proposed by a command handler, before the storage stamp.
///
/// There is intentionally no ingest-time field here: a client-supplied value
/// cannot exist at the type level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: EventId,
    pub aggregate_kind: AggregateKind,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub occurred_at: DateTime<Utc>,
    pub cycle_id: CycleId,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub actor_id: ActorId,
    pub actor_kind: ActorKind,
}

impl NewEvent {
    /// Append-time validation. Storage-level checks (id uniqueness,
    /// immutability) live in the log itself.
    pub fn validate(&self) -> CoreResult<()> {
        if !self.event_id.is_time_ordered() {
            return Err(CoreError::UuidTimeOrderedRequired {
                event_id: self.event_id.to_string(),
            });
        }
        if !is_valid_event_type(&self.event_type) {
            return Err(CoreError::EventTypeInvalid { event_type: self.event_type.clone() });
        }
        validate_event_data(&self.event_data)?;
        if self.cycle_id.as_str().is_empty() {
            return Err(CoreError::EventEnvelopeIncomplete { field: "cycle_id" });
        }
        if self.correlation_id.as_str().is_empty() {
            return Err(CoreError::EventEnvelopeIncomplete { field: "correlation_id" });
        }
        if self.actor_id.as_str().is_empty() {
            return Err(CoreError::EventEnvelopeIncomplete { field: "actor_id" });
        }
        Ok(())
    }
}

/// A committed event with its storage-stamped ingest time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub aggregate_kind: AggregateKind,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub occurred_at: DateTime<Utc>,
    /// Epoch milliseconds, stamped by the storage layer on insert.
    #[serde(rename = "ingested_at", with = "rfc3339_millis")]
    pub ingested_at_ms: i64,
    pub cycle_id: CycleId,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub actor_id: ActorId,
    pub actor_kind: ActorKind,
}

impl Event {
    pub fn ingested_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.ingested_at_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn watermark(&self) -> Watermark {
        Watermark { ingested_at_ms: self.ingested_at_ms, event_id: self.event_id }
    }
}

/// Wire format for ingest time: RFC-3339 with offset, millisecond precision.
mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ms: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        let dt = Utc
            .timestamp_millis_opt(*ms)
            .single()
            .ok_or_else(|| serde::ser::Error::custom("ingested_at out of range"))?;
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let s = String::deserialize(deserializer)?;
        let dt = DateTime::parse_from_rfc3339(&s).map_err(D::Error::custom)?;
        Ok(dt.timestamp_millis())
    }
}

/// Replay / pagination cursor. Ordering is the tuple order
/// `(ingested_at, event_id)`; field order here makes the derived `Ord` match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub ingested_at_ms: i64,
    pub event_id: EventId,
}

impl Watermark {
    /// Before the first event.
    pub fn zero() -> Self {
        Self { ingested_at_ms: 0, event_id: EventId::from_uuid(Uuid::nil()) }
    }

    pub fn from_event(event: &Event) -> Self {
        event.watermark()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::EventIdGen;
    use serde_json::json;

    fn new_event(data: Value) -> NewEvent {
        let gen = EventIdGen::new();
        NewEvent {
            event_id: gen.next(1_700_000_000_000),
            aggregate_kind: AggregateKind::Claim,
            aggregate_id: "clm_x".into(),
            event_type: CLAIM_SUBMITTED.into(),
            event_data: data,
            occurred_at: Utc::now(),
            cycle_id: CycleId::new("FY2026"),
            correlation_id: CorrelationId::new("corr-1"),
            causation_id: None,
            actor_id: ActorId::new("actor-1"),
            actor_kind: ActorKind::Admin,
        }
    }

    #[test]
    fn event_type_charset() {
        assert!(is_valid_event_type("CLAIM_SUBMITTED"));
        assert!(is_valid_event_type("X9_Y"));
        assert!(!is_valid_event_type("claim_submitted"));
        assert!(!is_valid_event_type("CLAIM-SUBMITTED"));
        assert!(!is_valid_event_type(""));
    }

    #[test]
    fn lossy_integers_rejected() {
        let bad = json!({ "amountCents": 9_007_199_254_740_993i64 });
        let err = validate_event_data(&bad).unwrap_err();
        assert_eq!(err.code(), "EVENT_DATA_BIGINT_FORBIDDEN");

        let nested = json!({ "a": [1, { "b": u64::MAX }] });
        assert!(validate_event_data(&nested).is_err());

        let ok = json!({ "amountCents": "40000", "count": 3 });
        assert!(validate_event_data(&ok).is_ok());
    }

    #[test]
    fn validate_rejects_non_v7_ids() {
        let mut ev = new_event(json!({}));
        ev.event_id = EventId::from_uuid(Uuid::new_v4());
        assert_eq!(ev.validate().unwrap_err().code(), "UUID_TIME_ORDERED_REQUIRED");
    }

    #[test]
    fn watermark_tuple_order() {
        let gen = EventIdGen::new();
        let a = Watermark { ingested_at_ms: 10, event_id: gen.next(10) };
        let b = Watermark { ingested_at_ms: 10, event_id: gen.next(10) };
        let c = Watermark { ingested_at_ms: 11, event_id: gen.next(9) };
        assert!(a < b, "same millisecond falls back to id order");
        assert!(b < c, "ingest time dominates");
        assert!(Watermark::zero() < a);
    }

    #[test]
    fn envelope_serializes_ingest_time_as_rfc3339() {
        let ev = Event {
            event_id: EventIdGen::new().next(1_700_000_000_000),
            aggregate_kind: AggregateKind::Grant,
            aggregate_id: "grant-1".into(),
            event_type: GRANT_AWARDED.into(),
            event_data: json!({}),
            occurred_at: Utc::now(),
            ingested_at_ms: 1_700_000_000_123,
            cycle_id: CycleId::new("FY2026"),
            correlation_id: CorrelationId::new("corr"),
            causation_id: None,
            actor_id: ActorId::new("a"),
            actor_kind: ActorKind::System,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["ingested_at"], "2023-11-14T22:13:20.123Z");
        let back: Event = serde_json::from_value(v).unwrap();
        assert_eq!(back.ingested_at_ms, 1_700_000_000_123);
    }
}
