//! Grant aggregate: bucketed balances and matching funds.
//!
//! A grant is one award for one funding cycle. Funds live in two isolated
//! buckets (GENERAL and LIRP); vouchers encumber, releases return, claim
//! approval liquidates.
//!
//! # Invariants
//!
//! Per bucket: `awarded = available + encumbered + liquidated`,
//! `released <= awarded`, no field negative. Matching shortfall and surplus
//! are floored at zero so they can never both be positive.

use crate::domain::event::{self, Event};
use crate::domain::ids::{CycleId, GrantId};
use crate::domain::money::{Cents, RateFraction};
use crate::errors::{CoreError, CoreResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Funding bucket. LIRP vouchers draw only from the LIRP bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bucket {
    General,
    Lirp,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "GENERAL",
            Self::Lirp => "LIRP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GENERAL" => Some(Self::General),
            "LIRP" => Some(Self::Lirp),
            _ => None,
        }
    }

    /// Bucket a voucher draws from.
    pub fn for_voucher(is_lirp: bool) -> Self {
        if is_lirp {
            Self::Lirp
        } else {
            Self::General
        }
    }
}

/// Balance row for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBalances {
    pub awarded: Cents,
    pub available: Cents,
    pub encumbered: Cents,
    pub liquidated: Cents,
    pub released: Cents,
}

impl BucketBalances {
    fn award(amount: Cents) -> Self {
        Self {
            awarded: amount,
            available: amount,
            encumbered: Cents::ZERO,
            liquidated: Cents::ZERO,
            released: Cents::ZERO,
        }
    }

    fn check(&self, bucket: Bucket) -> CoreResult<()> {
        let sum = self.available + self.encumbered + self.liquidated;
        if sum != self.awarded {
            return Err(CoreError::BalanceInvariant {
                detail: format!(
                    "{}: available {} + encumbered {} + liquidated {} != awarded {}",
                    bucket.as_str(),
                    self.available,
                    self.encumbered,
                    self.liquidated,
                    self.awarded
                ),
            });
        }
        for (name, v) in [
            ("awarded", self.awarded),
            ("available", self.available),
            ("encumbered", self.encumbered),
            ("liquidated", self.liquidated),
            ("released", self.released),
        ] {
            if v.is_negative() {
                return Err(CoreError::BalanceInvariant {
                    detail: format!("{}: negative {}", bucket.as_str(), name),
                });
            }
        }
        if self.released > self.awarded {
            return Err(CoreError::BalanceInvariant {
                detail: format!("{}: released exceeds awarded", bucket.as_str()),
            });
        }
        Ok(())
    }
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantAwardedData {
    pub grant_id: GrantId,
    pub cycle_id: CycleId,
    pub general_awarded_cents: Cents,
    pub lirp_awarded_cents: Cents,
    pub rate_numerator: i64,
    pub rate_denominator: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Payload shared by encumber / release / liquidate events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsMovementData {
    pub bucket: Bucket,
    pub amount_cents: Cents,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingFundsData {
    pub amount_cents: Cents,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimsDeadlineData {
    pub deadline: NaiveDate,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantState {
    pub grant_id: GrantId,
    pub cycle_id: CycleId,
    pub general: BucketBalances,
    pub lirp: BucketBalances,
    pub matching_committed: Cents,
    pub matching_reported: Cents,
    pub rate: RateFraction,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub claims_deadline_passed: bool,
}

impl GrantState {
    /// Empty state for replay; filled by the `GRANT_AWARDED` event.
    pub fn empty(grant_id: GrantId) -> Self {
        Self {
            grant_id,
            cycle_id: CycleId::new(""),
            general: BucketBalances::default(),
            lirp: BucketBalances::default(),
            matching_committed: Cents::ZERO,
            matching_reported: Cents::ZERO,
            rate: RateFraction::whole(),
            period_start: NaiveDate::MIN,
            period_end: NaiveDate::MAX,
            claims_deadline_passed: false,
        }
    }

    pub fn bucket(&self, bucket: Bucket) -> &BucketBalances {
        match bucket {
            Bucket::General => &self.general,
            Bucket::Lirp => &self.lirp,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut BucketBalances {
        match bucket {
            Bucket::General => &mut self.general,
            Bucket::Lirp => &mut self.lirp,
        }
    }

    /// Fold one event. Deterministic, no I/O; unknown types are skipped.
    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::GRANT_AWARDED => {
                let data: GrantAwardedData = serde_json::from_value(ev.event_data.clone())?;
                self.cycle_id = data.cycle_id;
                self.general = BucketBalances::award(data.general_awarded_cents);
                self.lirp = BucketBalances::award(data.lirp_awarded_cents);
                self.rate = RateFraction::new(data.rate_numerator, data.rate_denominator)
                    .map_err(|detail| CoreError::BalanceInvariant { detail })?;
                self.period_start = data.period_start;
                self.period_end = data.period_end;
            }
            event::GRANT_FUNDS_ENCUMBERED => {
                let data: FundsMovementData = serde_json::from_value(ev.event_data.clone())?;
                let b = self.bucket_mut(data.bucket);
                b.available = b.available - data.amount_cents;
                b.encumbered = b.encumbered + data.amount_cents;
            }
            event::GRANT_FUNDS_RELEASED => {
                let data: FundsMovementData = serde_json::from_value(ev.event_data.clone())?;
                let b = self.bucket_mut(data.bucket);
                b.encumbered = b.encumbered - data.amount_cents;
                b.available = b.available + data.amount_cents;
                b.released = b.released + data.amount_cents;
            }
            event::GRANT_FUNDS_LIQUIDATED => {
                let data: FundsMovementData = serde_json::from_value(ev.event_data.clone())?;
                let b = self.bucket_mut(data.bucket);
                b.encumbered = b.encumbered - data.amount_cents;
                b.liquidated = b.liquidated + data.amount_cents;
            }
            event::GRANT_MATCHING_COMMITTED => {
                let data: MatchingFundsData = serde_json::from_value(ev.event_data.clone())?;
                self.matching_committed = self.matching_committed + data.amount_cents;
            }
            event::GRANT_MATCHING_REPORTED => {
                let data: MatchingFundsData = serde_json::from_value(ev.event_data.clone())?;
                self.matching_reported = self.matching_reported + data.amount_cents;
            }
            event::GRANT_CLAIMS_DEADLINE_PASSED => {
                self.claims_deadline_passed = true;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn check_invariant(&self) -> CoreResult<()> {
        self.general.check(Bucket::General)?;
        self.lirp.check(Bucket::Lirp)?;
        if self.matching_committed.is_negative() || self.matching_reported.is_negative() {
            return Err(CoreError::BalanceInvariant {
                detail: "negative matching funds".to_string(),
            });
        }
        Ok(())
    }

    // -- Guards --------------------------------------------------------------

    pub fn can_encumber(&self, bucket: Bucket, amount: Cents) -> CoreResult<()> {
        let b = self.bucket(bucket);
        if b.available < amount {
            return Err(CoreError::InsufficientFunds {
                bucket: bucket.as_str().to_string(),
                requested_cents: amount.get(),
                available_cents: b.available.get(),
            });
        }
        Ok(())
    }

    pub fn period_contains(&self, date: NaiveDate) -> bool {
        self.period_start <= date && date <= self.period_end
    }

    /// `max(committed - reported, 0)`
    pub fn matching_shortfall(&self) -> Cents {
        self.matching_committed.saturating_sub_floor_zero(self.matching_reported)
    }

    /// `max(reported - committed, 0)`
    pub fn matching_surplus(&self) -> Cents {
        self.matching_reported.saturating_sub_floor_zero(self.matching_committed)
    }
}
