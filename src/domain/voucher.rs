//! Voucher aggregate.
//!
//! A voucher is a spend authorization against one grant bucket. Tentative
//! vouchers hold an encumbrance until confirmed or swept; issued vouchers can
//! be redeemed by exactly one approved claim.

use crate::domain::event::{self, Event};
use crate::domain::ids::{ClaimId, CycleId, GrantId, VoucherId};
use crate::domain::money::Cents;
use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherStatus {
    Tentative,
    Issued,
    Redeemed,
    Expired,
    Voided,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tentative => "TENTATIVE",
            Self::Issued => "ISSUED",
            Self::Redeemed => "REDEEMED",
            Self::Expired => "EXPIRED",
            Self::Voided => "VOIDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TENTATIVE" => Some(Self::Tentative),
            "ISSUED" => Some(Self::Issued),
            "REDEEMED" => Some(Self::Redeemed),
            "EXPIRED" => Some(Self::Expired),
            "VOIDED" => Some(Self::Voided),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Redeemed | Self::Expired | Self::Voided)
    }
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherIssuedData {
    pub voucher_id: VoucherId,
    pub grant_id: GrantId,
    pub code: String,
    pub county: String,
    pub is_lirp: bool,
    pub max_reimbursement_cents: Cents,
    pub sequence: i64,
    /// End of the service-date validity window.
    pub valid_until: NaiveDate,
    /// Present only on tentative issuance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tentative_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherRedeemedData {
    pub claim_id: ClaimId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherVoidedData {
    pub reason: String,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherState {
    pub voucher_id: VoucherId,
    pub cycle_id: CycleId,
    pub grant_id: GrantId,
    pub code: String,
    pub county: String,
    pub status: VoucherStatus,
    pub is_lirp: bool,
    pub max_reimbursement: Cents,
    pub valid_until: NaiveDate,
    pub tentative_expires_at: Option<DateTime<Utc>>,
    pub redeemed_claim_id: Option<ClaimId>,
    pub void_reason: Option<String>,
}

impl VoucherState {
    pub fn empty(voucher_id: VoucherId) -> Self {
        Self {
            voucher_id,
            cycle_id: CycleId::new(""),
            grant_id: GrantId::new(""),
            code: String::new(),
            county: String::new(),
            status: VoucherStatus::Voided, // overwritten by the issue event
            is_lirp: false,
            max_reimbursement: Cents::ZERO,
            valid_until: NaiveDate::MIN,
            tentative_expires_at: None,
            redeemed_claim_id: None,
            void_reason: None,
        }
    }

    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::VOUCHER_ISSUED_TENTATIVE => {
                self.fill_issue(ev, VoucherStatus::Tentative)?;
            }
            event::VOUCHER_ISSUED => {
                // Direct issue or confirmation of a tentative.
                if self.status == VoucherStatus::Tentative {
                    self.status = VoucherStatus::Issued;
                    self.tentative_expires_at = None;
                } else {
                    self.fill_issue(ev, VoucherStatus::Issued)?;
                }
            }
            event::VOUCHER_REDEEMED => {
                let data: VoucherRedeemedData = serde_json::from_value(ev.event_data.clone())?;
                self.status = VoucherStatus::Redeemed;
                self.redeemed_claim_id = Some(data.claim_id);
            }
            event::VOUCHER_EXPIRED => {
                self.status = VoucherStatus::Expired;
            }
            event::VOUCHER_VOIDED => {
                let data: VoucherVoidedData = serde_json::from_value(ev.event_data.clone())?;
                self.status = VoucherStatus::Voided;
                self.void_reason = Some(data.reason);
            }
            _ => {}
        }
        Ok(())
    }

    fn fill_issue(&mut self, ev: &Event, status: VoucherStatus) -> CoreResult<()> {
        let data: VoucherIssuedData = serde_json::from_value(ev.event_data.clone())?;
        self.cycle_id = ev.cycle_id.clone();
        self.grant_id = data.grant_id;
        self.code = data.code;
        self.county = data.county;
        self.is_lirp = data.is_lirp;
        self.max_reimbursement = data.max_reimbursement_cents;
        self.valid_until = data.valid_until;
        self.tentative_expires_at = data.tentative_expires_at;
        self.status = status;
        Ok(())
    }

    pub fn check_invariant(&self) -> CoreResult<()> {
        if self.max_reimbursement.is_negative() {
            return Err(CoreError::BalanceInvariant {
                detail: format!("voucher {} negative max reimbursement", self.voucher_id),
            });
        }
        if self.status == VoucherStatus::Redeemed && self.redeemed_claim_id.is_none() {
            return Err(CoreError::BalanceInvariant {
                detail: format!("voucher {} redeemed without claim", self.voucher_id),
            });
        }
        Ok(())
    }

    // -- Guards --------------------------------------------------------------

    /// Valid for a claim with the given service date.
    pub fn check_valid_for_service(&self, date_of_service: NaiveDate) -> CoreResult<()> {
        match self.status {
            VoucherStatus::Issued => {}
            VoucherStatus::Redeemed => {
                return Err(CoreError::VoucherAlreadyRedeemed {
                    voucher_id: self.voucher_id.to_string(),
                })
            }
            other => {
                return Err(CoreError::VoucherNotValid {
                    voucher_id: self.voucher_id.to_string(),
                    reason: format!("status {}", other.as_str()),
                })
            }
        }
        if date_of_service > self.valid_until {
            return Err(CoreError::VoucherNotValid {
                voucher_id: self.voucher_id.to_string(),
                reason: format!("service date after validity window end {}", self.valid_until),
            });
        }
        Ok(())
    }

    pub fn check_voidable(&self) -> CoreResult<()> {
        match self.status {
            VoucherStatus::Tentative | VoucherStatus::Issued => Ok(()),
            other => Err(CoreError::VoucherNotVoidable {
                voucher_id: self.voucher_id.to_string(),
                status: other.as_str().to_string(),
            }),
        }
    }

    pub fn can_confirm(&self) -> bool {
        self.status == VoucherStatus::Tentative
    }

    /// Tentative and past its hold expiry.
    pub fn is_tentative_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == VoucherStatus::Tentative
            && self.tentative_expires_at.is_some_and(|t| t < now)
    }
}

/// Mint a voucher code from the allocator sequence: `{CYCLE_SHORT}-{COUNTY}-{SEQ}`.
pub fn mint_voucher_code(cycle_id: &CycleId, county: &str, sequence: i64) -> String {
    let cycle_short: String = cycle_id
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    format!("{}-{}-{:05}", cycle_short, county.to_ascii_uppercase(), sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{AggregateKind, VOUCHER_ISSUED, VOUCHER_ISSUED_TENTATIVE,
        VOUCHER_REDEEMED, VOUCHER_VOIDED};
    use crate::domain::ids::{ActorId, ActorKind, CorrelationId, EventIdGen};

    fn voucher_event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            event_id: EventIdGen::new().next_now(),
            aggregate_kind: AggregateKind::Voucher,
            aggregate_id: "vch_1".into(),
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

    fn issued_data(tentative: bool) -> serde_json::Value {
        serde_json::to_value(VoucherIssuedData {
            voucher_id: VoucherId::new("vch_1"),
            grant_id: GrantId::new("grant-1"),
            code: "FY2026-KANAWHA-00001".into(),
            county: "KANAWHA".into(),
            is_lirp: false,
            max_reimbursement_cents: Cents::new(50_000),
            sequence: 1,
            valid_until: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
            tentative_expires_at: tentative
                .then(|| Utc::now() + chrono::Duration::days(14)),
        })
        .unwrap()
    }

    #[test]
    fn tentative_then_confirm() {
        let mut v = VoucherState::empty(VoucherId::new("vch_1"));
        v.apply(&voucher_event(VOUCHER_ISSUED_TENTATIVE, issued_data(true))).unwrap();
        assert_eq!(v.status, VoucherStatus::Tentative);
        assert!(v.can_confirm());

        v.apply(&voucher_event(VOUCHER_ISSUED, serde_json::json!({}))).unwrap();
        assert_eq!(v.status, VoucherStatus::Issued);
        assert!(v.tentative_expires_at.is_none());
    }

    #[test]
    fn redeemed_voucher_is_not_valid_again() {
        let mut v = VoucherState::empty(VoucherId::new("vch_1"));
        v.apply(&voucher_event(VOUCHER_ISSUED, issued_data(false))).unwrap();
        let dos = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        v.check_valid_for_service(dos).unwrap();

        let redeemed = serde_json::to_value(VoucherRedeemedData {
            claim_id: ClaimId::new("clm_a"),
        })
        .unwrap();
        v.apply(&voucher_event(VOUCHER_REDEEMED, redeemed)).unwrap();
        v.check_invariant().unwrap();
        let err = v.check_valid_for_service(dos).unwrap_err();
        assert_eq!(err.code(), "VOUCHER_ALREADY_REDEEMED");
    }

    #[test]
    fn service_date_outside_window_rejected() {
        let mut v = VoucherState::empty(VoucherId::new("vch_1"));
        v.apply(&voucher_event(VOUCHER_ISSUED, issued_data(false))).unwrap();
        let late = NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        assert_eq!(v.check_valid_for_service(late).unwrap_err().code(), "VOUCHER_NOT_VALID");
    }

    #[test]
    fn voided_voucher_not_voidable_again() {
        let mut v = VoucherState::empty(VoucherId::new("vch_1"));
        v.apply(&voucher_event(VOUCHER_ISSUED, issued_data(false))).unwrap();
        v.check_voidable().unwrap();
        let voided = serde_json::to_value(VoucherVoidedData { reason: "test".into() }).unwrap();
        v.apply(&voucher_event(VOUCHER_VOIDED, voided)).unwrap();
        assert_eq!(v.check_voidable().unwrap_err().code(), "VOUCHER_NOT_VOIDABLE");
    }

    #[test]
    fn tentative_expiry_detection() {
        let mut v = VoucherState::empty(VoucherId::new("vch_1"));
        let mut data: VoucherIssuedData = serde_json::from_value(issued_data(true)).unwrap();
        data.tentative_expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        v.apply(&voucher_event(
            VOUCHER_ISSUED_TENTATIVE,
            serde_json::to_value(&data).unwrap(),
        ))
        .unwrap();
        assert!(v.is_tentative_expired(Utc::now()));
        // Sweep idempotence: once voided it no longer matches.
        let voided =
            serde_json::to_value(VoucherVoidedData { reason: "tentative expired".into() }).unwrap();
        v.apply(&voucher_event(VOUCHER_VOIDED, voided)).unwrap();
        assert!(!v.is_tentative_expired(Utc::now()));
    }

    #[test]
    fn voucher_code_format() {
        assert_eq!(
            mint_voucher_code(&CycleId::new("FY2026"), "Kanawha", 42),
            "FY2026-KANAWHA-00042"
        );
    }
}
