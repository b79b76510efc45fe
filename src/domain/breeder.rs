//! Breeder compliance filings.
//!
//! Compliance classification is a pure function of the filing timestamps and
//! the current time, so the sweep can recompute it at any moment and the
//! stored status column is wall-clock-derived (excluded from rebuild
//! determinism).

use crate::domain::event::{self, Event};
use crate::domain::ids::{CycleId, FilingId};
use crate::errors::CoreResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Days before the due date a filing turns DUE_SOON.
pub const DUE_SOON_WINDOW_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    OnTime,
    DueSoon,
    Overdue,
    Cured,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTime => "ON_TIME",
            Self::DueSoon => "DUE_SOON",
            Self::Overdue => "OVERDUE",
            Self::Cured => "CURED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ON_TIME" => Some(Self::OnTime),
            "DUE_SOON" => Some(Self::DueSoon),
            "OVERDUE" => Some(Self::Overdue),
            "CURED" => Some(Self::Cured),
            _ => None,
        }
    }
}

/// Classify a filing. Cured means cured explicitly or submitted within the
/// cure window after the due date.
pub fn compliance_status(
    due_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    cured_at: Option<DateTime<Utc>>,
    cure_period_days: i64,
    now: DateTime<Utc>,
) -> ComplianceStatus {
    let cure_deadline = due_at + Duration::days(cure_period_days);
    if let Some(submitted) = submitted_at {
        if submitted <= due_at {
            return ComplianceStatus::OnTime;
        }
        if submitted <= cure_deadline {
            return ComplianceStatus::Cured;
        }
        return ComplianceStatus::Overdue;
    }
    if cured_at.is_some_and(|c| c <= cure_deadline) {
        return ComplianceStatus::Cured;
    }
    if now > due_at {
        return ComplianceStatus::Overdue;
    }
    if now >= due_at - Duration::days(DUE_SOON_WINDOW_DAYS) {
        return ComplianceStatus::DueSoon;
    }
    ComplianceStatus::OnTime
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilingDueData {
    pub filing_id: FilingId,
    pub breeder_id: String,
    pub due_at: DateTime<Utc>,
    pub cure_period_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilingSubmittedData {
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilingCuredData {
    pub cured_at: DateTime<Utc>,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingState {
    pub filing_id: FilingId,
    pub cycle_id: CycleId,
    pub breeder_id: String,
    pub due_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub cured_at: Option<DateTime<Utc>>,
    pub cure_period_days: i64,
}

impl FilingState {
    pub fn empty(filing_id: FilingId) -> Self {
        Self {
            filing_id,
            cycle_id: CycleId::new(""),
            breeder_id: String::new(),
            due_at: DateTime::<Utc>::MIN_UTC,
            submitted_at: None,
            cured_at: None,
            cure_period_days: 0,
        }
    }

    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::BREEDER_FILING_DUE => {
                let data: FilingDueData = serde_json::from_value(ev.event_data.clone())?;
                self.cycle_id = ev.cycle_id.clone();
                self.breeder_id = data.breeder_id;
                self.due_at = data.due_at;
                self.cure_period_days = data.cure_period_days;
            }
            event::BREEDER_FILING_SUBMITTED => {
                let data: FilingSubmittedData = serde_json::from_value(ev.event_data.clone())?;
                self.submitted_at = Some(data.submitted_at);
            }
            event::BREEDER_FILING_CURED => {
                let data: FilingCuredData = serde_json::from_value(ev.event_data.clone())?;
                self.cured_at = Some(data.cured_at);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> ComplianceStatus {
        compliance_status(
            self.due_at,
            self.submitted_at,
            self.cured_at,
            self.cure_period_days,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn on_time_before_window() {
        let status = compliance_status(ts("2026-03-10T00:00:00Z"), None, None, 30,
            ts("2026-03-01T00:00:00Z"));
        assert_eq!(status, ComplianceStatus::OnTime);
    }

    #[test]
    fn due_soon_inside_three_days() {
        let status = compliance_status(ts("2026-03-10T00:00:00Z"), None, None, 30,
            ts("2026-03-08T00:00:00Z"));
        assert_eq!(status, ComplianceStatus::DueSoon);
    }

    #[test]
    fn overdue_after_due() {
        let status = compliance_status(ts("2026-03-10T00:00:00Z"), None, None, 30,
            ts("2026-03-11T00:00:00Z"));
        assert_eq!(status, ComplianceStatus::Overdue);
    }

    #[test]
    fn submitted_on_time() {
        let status = compliance_status(
            ts("2026-03-10T00:00:00Z"),
            Some(ts("2026-03-09T00:00:00Z")),
            None,
            30,
            ts("2026-06-01T00:00:00Z"),
        );
        assert_eq!(status, ComplianceStatus::OnTime);
    }

    #[test]
    fn late_submission_within_cure_window_is_cured() {
        let status = compliance_status(
            ts("2026-03-10T00:00:00Z"),
            Some(ts("2026-03-20T00:00:00Z")),
            None,
            30,
            ts("2026-06-01T00:00:00Z"),
        );
        assert_eq!(status, ComplianceStatus::Cured);
    }

    #[test]
    fn submission_past_cure_window_stays_overdue() {
        let status = compliance_status(
            ts("2026-03-10T00:00:00Z"),
            Some(ts("2026-05-01T00:00:00Z")),
            None,
            30,
            ts("2026-06-01T00:00:00Z"),
        );
        assert_eq!(status, ComplianceStatus::Overdue);
    }
}
