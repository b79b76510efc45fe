//! Cycle closeout aggregate.
//!
//! ```text
//! NOT_STARTED -> PREFLIGHT_PASSED|PREFLIGHT_FAILED -> STARTED
//!             -> RECONCILED -> CLOSED
//! ```
//!
//! AUDIT_HOLD is entered from RECONCILED and exits back to the pre-hold
//! status. CLOSED is terminal except for the post-close allow-list enforced
//! by the command layer.
//!
//! # Invariants
//!
//! In RECONCILED and CLOSED the financial summary must satisfy
//! `awarded = liquidated + released + unspent`.

use crate::domain::event::{self, Event};
use crate::domain::ids::{ActorId, CycleId};
use crate::domain::money::Cents;
use crate::domain::Watermark;
use crate::errors::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseoutStatus {
    NotStarted,
    PreflightFailed,
    PreflightPassed,
    Started,
    Reconciled,
    AuditHold,
    Closed,
}

impl CloseoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::PreflightFailed => "PREFLIGHT_FAILED",
            Self::PreflightPassed => "PREFLIGHT_PASSED",
            Self::Started => "STARTED",
            Self::Reconciled => "RECONCILED",
            Self::AuditHold => "AUDIT_HOLD",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NOT_STARTED" => Some(Self::NotStarted),
            "PREFLIGHT_FAILED" => Some(Self::PreflightFailed),
            "PREFLIGHT_PASSED" => Some(Self::PreflightPassed),
            "STARTED" => Some(Self::Started),
            "RECONCILED" => Some(Self::Reconciled),
            "AUDIT_HOLD" => Some(Self::AuditHold),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// One preflight check result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Names of the deterministic preflight check list, in evaluation order.
pub const PREFLIGHT_CHECKS: &[&str] = &[
    "ALL_APPROVED_CLAIMS_INVOICED",
    "ALL_SUBMITTED_INVOICES_EXPORTED",
    "ALL_EXPORT_BATCHES_ACKNOWLEDGED",
    "ALL_PAYMENTS_RECORDED",
    "NO_PENDING_ADJUSTMENTS",
    "MATCHING_FUNDS_REPORTED",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialSummary {
    pub awarded_cents: Cents,
    pub liquidated_cents: Cents,
    pub released_cents: Cents,
    pub unspent_cents: Cents,
}

impl FinancialSummary {
    pub fn check(&self) -> CoreResult<()> {
        let sum = self.liquidated_cents + self.released_cents + self.unspent_cents;
        if sum != self.awarded_cents {
            return Err(CoreError::CloseoutInvariant {
                detail: format!(
                    "awarded {} != liquidated {} + released {} + unspent {}",
                    self.awarded_cents,
                    self.liquidated_cents,
                    self.released_cents,
                    self.unspent_cents
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingSummary {
    pub committed_cents: Cents,
    pub reported_cents: Cents,
    pub shortfall_cents: Cents,
    pub surplus_cents: Cents,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub vouchers_issued: u32,
    pub vouchers_redeemed: u32,
    pub claims_submitted: u32,
    pub claims_approved: u32,
    pub claims_denied: u32,
    pub invoices_generated: u32,
    pub batches_acknowledged: u32,
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCompletedData {
    pub checks: Vec<PreflightCheck>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledData {
    pub financial: FinancialSummary,
    pub matching: MatchingSummary,
    pub activity: ActivitySummary,
    /// Watermark the summaries were computed at, for reproducibility.
    pub watermark: Watermark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHoldData {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleClosedData {
    pub closed_by: ActorId,
    pub final_balance_cents: Cents,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseoutState {
    pub cycle_id: CycleId,
    pub status: CloseoutStatus,
    /// Status to restore when an audit hold resolves.
    pub pre_hold_status: Option<CloseoutStatus>,
    pub checks: Vec<PreflightCheck>,
    pub financial: Option<FinancialSummary>,
    pub matching: Option<MatchingSummary>,
    pub activity: Option<ActivitySummary>,
    pub reconciled_watermark: Option<Watermark>,
    pub closed_by: Option<ActorId>,
    pub final_balance: Option<Cents>,
}

impl CloseoutState {
    pub fn empty(cycle_id: CycleId) -> Self {
        Self {
            cycle_id,
            status: CloseoutStatus::NotStarted,
            pre_hold_status: None,
            checks: Vec::new(),
            financial: None,
            matching: None,
            activity: None,
            reconciled_watermark: None,
            closed_by: None,
            final_balance: None,
        }
    }

    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::GRANT_CYCLE_CLOSEOUT_PREFLIGHT_COMPLETED => {
                let data: PreflightCompletedData = serde_json::from_value(ev.event_data.clone())?;
                self.checks = data.checks;
                self.status = if data.passed {
                    CloseoutStatus::PreflightPassed
                } else {
                    CloseoutStatus::PreflightFailed
                };
            }
            event::GRANT_CYCLE_CLOSEOUT_STARTED => {
                self.status = CloseoutStatus::Started;
            }
            event::GRANT_CYCLE_CLOSEOUT_RECONCILED => {
                let data: ReconciledData = serde_json::from_value(ev.event_data.clone())?;
                self.financial = Some(data.financial);
                self.matching = Some(data.matching);
                self.activity = Some(data.activity);
                self.reconciled_watermark = Some(data.watermark);
                self.status = CloseoutStatus::Reconciled;
            }
            event::GRANT_CYCLE_AUDIT_HOLD_SET => {
                self.pre_hold_status = Some(self.status);
                self.status = CloseoutStatus::AuditHold;
            }
            event::GRANT_CYCLE_AUDIT_RESOLVED => {
                self.status = self.pre_hold_status.take().unwrap_or(CloseoutStatus::Reconciled);
            }
            event::GRANT_CYCLE_CLOSED => {
                let data: CycleClosedData = serde_json::from_value(ev.event_data.clone())?;
                self.closed_by = Some(data.closed_by);
                self.final_balance = Some(data.final_balance_cents);
                self.status = CloseoutStatus::Closed;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn check_invariant(&self) -> CoreResult<()> {
        if matches!(self.status, CloseoutStatus::Reconciled | CloseoutStatus::Closed) {
            let financial = self.financial.ok_or_else(|| CoreError::CloseoutInvariant {
                detail: format!("cycle {} {} without financial summary",
                    self.cycle_id, self.status.as_str()),
            })?;
            financial.check()?;
        }
        if self.status == CloseoutStatus::Closed && self.closed_by.is_none() {
            return Err(CoreError::CloseoutInvariant {
                detail: format!("cycle {} closed without actor", self.cycle_id),
            });
        }
        Ok(())
    }

    // -- Guards --------------------------------------------------------------

    pub fn check_can_start(&self) -> CoreResult<()> {
        match self.status {
            CloseoutStatus::PreflightPassed => Ok(()),
            other => Err(CoreError::PreflightNotPassed { status: other.as_str().to_string() }),
        }
    }

    pub fn check_can_reconcile(&self) -> CoreResult<()> {
        match self.status {
            // Re-reconciling at a newer watermark is allowed.
            CloseoutStatus::Started | CloseoutStatus::Reconciled => Ok(()),
            other => Err(CoreError::InvalidTransition {
                aggregate: "Closeout".into(),
                from: other.as_str().into(),
                to: CloseoutStatus::Reconciled.as_str().into(),
            }),
        }
    }

    pub fn check_can_hold(&self) -> CoreResult<()> {
        match self.status {
            CloseoutStatus::Reconciled => Ok(()),
            other => Err(CoreError::InvalidTransition {
                aggregate: "Closeout".into(),
                from: other.as_str().into(),
                to: CloseoutStatus::AuditHold.as_str().into(),
            }),
        }
    }

    pub fn check_can_resolve_hold(&self) -> CoreResult<()> {
        match self.status {
            CloseoutStatus::AuditHold => Ok(()),
            other => Err(CoreError::InvalidTransition {
                aggregate: "Closeout".into(),
                from: other.as_str().into(),
                to: "pre-hold status".into(),
            }),
        }
    }

    /// Close requires RECONCILED and no active audit hold.
    pub fn check_can_closeout(&self) -> CoreResult<()> {
        match self.status {
            CloseoutStatus::Reconciled => Ok(()),
            CloseoutStatus::AuditHold => {
                Err(CoreError::AuditHoldActive { cycle_id: self.cycle_id.to_string() })
            }
            other => Err(CoreError::InvalidTransition {
                aggregate: "Closeout".into(),
                from: other.as_str().into(),
                to: CloseoutStatus::Closed.as_str().into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{AggregateKind, GRANT_CYCLE_AUDIT_HOLD_SET,
        GRANT_CYCLE_AUDIT_RESOLVED, GRANT_CYCLE_CLOSED,
        GRANT_CYCLE_CLOSEOUT_PREFLIGHT_COMPLETED, GRANT_CYCLE_CLOSEOUT_RECONCILED,
        GRANT_CYCLE_CLOSEOUT_STARTED};
    use crate::domain::ids::{ActorKind, CorrelationId, EventIdGen};
    use chrono::Utc;

    fn closeout_event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            event_id: EventIdGen::new().next_now(),
            aggregate_kind: AggregateKind::Closeout,
            aggregate_id: "FY2026".into(),
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

    fn preflight(passed: bool) -> serde_json::Value {
        serde_json::to_value(PreflightCompletedData {
            checks: PREFLIGHT_CHECKS
                .iter()
                .map(|name| PreflightCheck {
                    name: name.to_string(),
                    passed,
                    detail: String::new(),
                })
                .collect(),
            passed,
        })
        .unwrap()
    }

    fn reconciled_data() -> serde_json::Value {
        serde_json::to_value(ReconciledData {
            financial: FinancialSummary {
                awarded_cents: Cents::new(100_000),
                liquidated_cents: Cents::new(50_000),
                released_cents: Cents::ZERO,
                unspent_cents: Cents::new(50_000),
            },
            matching: MatchingSummary {
                committed_cents: Cents::ZERO,
                reported_cents: Cents::ZERO,
                shortfall_cents: Cents::ZERO,
                surplus_cents: Cents::ZERO,
            },
            activity: ActivitySummary {
                vouchers_issued: 1,
                vouchers_redeemed: 1,
                claims_submitted: 1,
                claims_approved: 1,
                claims_denied: 0,
                invoices_generated: 1,
                batches_acknowledged: 1,
            },
            watermark: Watermark::zero(),
        })
        .unwrap()
    }

    fn reconciled_state() -> CloseoutState {
        let mut c = CloseoutState::empty(CycleId::new("FY2026"));
        c.apply(&closeout_event(GRANT_CYCLE_CLOSEOUT_PREFLIGHT_COMPLETED, preflight(true)))
            .unwrap();
        c.apply(&closeout_event(GRANT_CYCLE_CLOSEOUT_STARTED, serde_json::json!({}))).unwrap();
        c.apply(&closeout_event(GRANT_CYCLE_CLOSEOUT_RECONCILED, reconciled_data())).unwrap();
        c
    }

    #[test]
    fn happy_path_to_close() {
        let mut c = reconciled_state();
        c.check_invariant().unwrap();
        c.check_can_closeout().unwrap();
        let closed = serde_json::to_value(CycleClosedData {
            closed_by: ActorId::new("admin-1"),
            final_balance_cents: Cents::new(50_000),
        })
        .unwrap();
        c.apply(&closeout_event(GRANT_CYCLE_CLOSED, closed)).unwrap();
        assert_eq!(c.status, CloseoutStatus::Closed);
        c.check_invariant().unwrap();
    }

    #[test]
    fn failed_preflight_blocks_start() {
        let mut c = CloseoutState::empty(CycleId::new("FY2026"));
        c.apply(&closeout_event(GRANT_CYCLE_CLOSEOUT_PREFLIGHT_COMPLETED, preflight(false)))
            .unwrap();
        assert_eq!(c.status, CloseoutStatus::PreflightFailed);
        assert_eq!(c.check_can_start().unwrap_err().code(), "PREFLIGHT_NOT_PASSED");
    }

    #[test]
    fn audit_hold_round_trip() {
        let mut c = reconciled_state();
        c.check_can_hold().unwrap();
        let hold = serde_json::to_value(AuditHoldData { reason: "spot audit".into() }).unwrap();
        c.apply(&closeout_event(GRANT_CYCLE_AUDIT_HOLD_SET, hold)).unwrap();
        assert_eq!(c.status, CloseoutStatus::AuditHold);
        assert_eq!(c.check_can_closeout().unwrap_err().code(), "AUDIT_HOLD_ACTIVE");

        c.apply(&closeout_event(GRANT_CYCLE_AUDIT_RESOLVED, serde_json::json!({}))).unwrap();
        assert_eq!(c.status, CloseoutStatus::Reconciled);
        c.check_can_closeout().unwrap();
    }

    #[test]
    fn financial_identity_enforced_when_reconciled() {
        let mut c = reconciled_state();
        c.financial = Some(FinancialSummary {
            awarded_cents: Cents::new(100_000),
            liquidated_cents: Cents::new(50_000),
            released_cents: Cents::ZERO,
            unspent_cents: Cents::new(40_000), // off by 10_000
        });
        let err = c.check_invariant().unwrap_err();
        assert!(err.code().starts_with("CLOSEOUT_INVARIANT:"));
    }
}
