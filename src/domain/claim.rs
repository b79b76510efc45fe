//! Claim aggregate.
//!
//! Claims are deduplicated by a canonical fingerprint independent of
//! idempotency keys. The canonicalization below is part of the durable
//! contract: it is stored in events and indexed on the claim projection, so
//! it must never change shape.

use crate::domain::event::{self, Event};
use crate::domain::ids::{sha256_hex, ClaimId, ClinicId, CycleId, InvoiceId, VoucherId};
use crate::domain::money::Cents;
use crate::errors::{CoreError, CoreResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Submitted,
    Approved,
    Denied,
    Adjusted,
    Invoiced,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::Adjusted => "ADJUSTED",
            Self::Invoiced => "INVOICED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(Self::Submitted),
            "APPROVED" => Some(Self::Approved),
            "DENIED" => Some(Self::Denied),
            "ADJUSTED" => Some(Self::Adjusted),
            "INVOICED" => Some(Self::Invoiced),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Invoiced)
    }
}

/// Canonical duplicate-detection fingerprint.
///
/// `sha256(lc(trim(voucher)) ":" lc(trim(clinic)) ":" uc(trim(proc)) ":"
/// date ":rabies=" 0|1)` where `date` is the leading `YYYY-MM-DD` of the
/// date-of-service string. Any other canonicalization is forbidden.
pub fn claim_fingerprint(
    voucher_id: &str,
    clinic_id: &str,
    procedure_code: &str,
    date_of_service: &str,
    rabies_included: bool,
) -> CoreResult<String> {
    let canon_voucher = voucher_id.trim().to_lowercase();
    let canon_clinic = clinic_id.trim().to_lowercase();
    let canon_proc = procedure_code.trim().to_uppercase();
    let canon_date = leading_iso_date(date_of_service)?;
    let canon_rabies = if rabies_included { "1" } else { "0" };
    let input = format!(
        "{}:{}:{}:{}:rabies={}",
        canon_voucher, canon_clinic, canon_proc, canon_date, canon_rabies
    );
    Ok(sha256_hex(input.as_bytes()))
}

/// First match of `^\d{4}-\d{2}-\d{2}`; rejects anything else.
pub fn leading_iso_date(value: &str) -> CoreResult<&str> {
    let b = value.as_bytes();
    let shaped = b.len() >= 10
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5].is_ascii_digit()
        && b[6].is_ascii_digit()
        && b[7] == b'-'
        && b[8].is_ascii_digit()
        && b[9].is_ascii_digit();
    if !shaped {
        return Err(CoreError::InvalidDateFormat { value: value.to_string() });
    }
    Ok(&value[..10])
}

/// Document references a claim must carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimArtifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinic_invoice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rabies_certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copay_receipt: Option<String>,
}

impl ClaimArtifacts {
    /// Required references: procedure report and clinic invoice always,
    /// rabies certificate when rabies is included, co-pay receipt when a
    /// co-pay was collected.
    pub fn check_required(&self, rabies_included: bool, copay: Cents) -> CoreResult<()> {
        if self.procedure_report.is_none() {
            return Err(CoreError::MissingRequiredArtifacts { field: "procedureReport" });
        }
        if self.clinic_invoice.is_none() {
            return Err(CoreError::MissingRequiredArtifacts { field: "clinicInvoice" });
        }
        if rabies_included && self.rabies_certificate.is_none() {
            return Err(CoreError::MissingRequiredArtifacts { field: "rabiesCertificate" });
        }
        if copay > Cents::ZERO && self.copay_receipt.is_none() {
            return Err(CoreError::MissingRequiredArtifacts { field: "copayReceipt" });
        }
        Ok(())
    }
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSubmittedData {
    pub claim_id: ClaimId,
    pub voucher_id: VoucherId,
    pub clinic_id: ClinicId,
    pub procedure_code: String,
    pub date_of_service: NaiveDate,
    pub amount_cents: Cents,
    pub copay_cents: Cents,
    pub rabies_included: bool,
    pub fingerprint: String,
    pub artifacts: ClaimArtifacts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDecisionData {
    pub approved_amount_cents: Option<Cents>,
    pub decision_basis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAdjustedData {
    pub amount_cents: Cents,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimInvoicedData {
    pub invoice_id: InvoiceId,
}

/// Advisory payload; never blocks submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudSignalData {
    pub signal: String,
    pub detail: String,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimState {
    pub claim_id: ClaimId,
    pub cycle_id: CycleId,
    pub voucher_id: VoucherId,
    pub clinic_id: ClinicId,
    pub fingerprint: String,
    pub status: ClaimStatus,
    pub procedure_code: String,
    pub date_of_service: NaiveDate,
    pub submitted_amount: Cents,
    pub copay: Cents,
    pub rabies_included: bool,
    pub approved_amount: Option<Cents>,
    pub decision_basis: Option<String>,
    pub invoice_id: Option<InvoiceId>,
    pub artifacts: ClaimArtifacts,
}

impl ClaimState {
    pub fn empty(claim_id: ClaimId) -> Self {
        Self {
            claim_id,
            cycle_id: CycleId::new(""),
            voucher_id: VoucherId::new(""),
            clinic_id: ClinicId::new(""),
            fingerprint: String::new(),
            status: ClaimStatus::Submitted,
            procedure_code: String::new(),
            date_of_service: NaiveDate::MIN,
            submitted_amount: Cents::ZERO,
            copay: Cents::ZERO,
            rabies_included: false,
            approved_amount: None,
            decision_basis: None,
            invoice_id: None,
            artifacts: ClaimArtifacts::default(),
        }
    }

    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::CLAIM_SUBMITTED => {
                let data: ClaimSubmittedData = serde_json::from_value(ev.event_data.clone())?;
                self.cycle_id = ev.cycle_id.clone();
                self.voucher_id = data.voucher_id;
                self.clinic_id = data.clinic_id;
                self.fingerprint = data.fingerprint;
                self.procedure_code = data.procedure_code;
                self.date_of_service = data.date_of_service;
                self.submitted_amount = data.amount_cents;
                self.copay = data.copay_cents;
                self.rabies_included = data.rabies_included;
                self.artifacts = data.artifacts;
                self.status = ClaimStatus::Submitted;
            }
            event::CLAIM_APPROVED => {
                let data: ClaimDecisionData = serde_json::from_value(ev.event_data.clone())?;
                self.status = ClaimStatus::Approved;
                self.approved_amount = data.approved_amount_cents;
                self.decision_basis = Some(data.decision_basis);
            }
            event::CLAIM_DENIED => {
                let data: ClaimDecisionData = serde_json::from_value(ev.event_data.clone())?;
                self.status = ClaimStatus::Denied;
                self.approved_amount = None;
                self.decision_basis = Some(data.decision_basis);
            }
            event::CLAIM_ADJUSTED => {
                let data: ClaimAdjustedData = serde_json::from_value(ev.event_data.clone())?;
                self.status = ClaimStatus::Adjusted;
                self.submitted_amount = data.amount_cents;
            }
            event::CLAIM_INVOICED => {
                let data: ClaimInvoicedData = serde_json::from_value(ev.event_data.clone())?;
                self.status = ClaimStatus::Invoiced;
                self.invoice_id = Some(data.invoice_id);
            }
            // Advisory events leave claim state untouched.
            event::CLAIM_DECISION_CONFLICT_RECORDED | event::CLAIM_FRAUD_SIGNAL_RECORDED => {}
            _ => {}
        }
        Ok(())
    }

    pub fn check_invariant(&self) -> CoreResult<()> {
        if self.submitted_amount.is_negative() || self.copay.is_negative() {
            return Err(CoreError::BalanceInvariant {
                detail: format!("claim {} negative amount", self.claim_id),
            });
        }
        if self.status == ClaimStatus::Invoiced && self.invoice_id.is_none() {
            return Err(CoreError::BalanceInvariant {
                detail: format!("claim {} invoiced without invoice reference", self.claim_id),
            });
        }
        Ok(())
    }

    // -- Guards --------------------------------------------------------------

    /// Adjudication only lands on SUBMITTED or ADJUSTED claims; anything else
    /// is a conflict to be recorded, not an error.
    pub fn can_adjudicate(&self) -> bool {
        matches!(self.status, ClaimStatus::Submitted | ClaimStatus::Adjusted)
    }

    pub fn can_invoice(&self) -> bool {
        self.status == ClaimStatus::Approved && self.invoice_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fingerprint_canonicalization_erases_case_and_whitespace() {
        let a = claim_fingerprint(" VCH_1 ", "Clinic-9", "spay", "2026-01-15", false).unwrap();
        let b = claim_fingerprint("vch_1", "clinic-9", "SPAY ", "2026-01-15T08:30:00Z", false)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_business_fields() {
        let base = claim_fingerprint("v", "c", "spay", "2026-01-15", false).unwrap();
        assert_ne!(base, claim_fingerprint("v2", "c", "spay", "2026-01-15", false).unwrap());
        assert_ne!(base, claim_fingerprint("v", "c", "neuter", "2026-01-15", false).unwrap());
        assert_ne!(base, claim_fingerprint("v", "c", "spay", "2026-01-16", false).unwrap());
        assert_ne!(base, claim_fingerprint("v", "c", "spay", "2026-01-15", true).unwrap());
    }

    #[test]
    fn bad_service_dates_rejected() {
        for bad in ["15/01/2026", "2026-1-5", "jan 15", "", "2026-01"] {
            let err = claim_fingerprint("v", "c", "spay", bad, false).unwrap_err();
            assert_eq!(err.code(), "INVALID_DATE_FORMAT");
        }
    }

    #[test]
    fn required_artifact_matrix() {
        let none = ClaimArtifacts::default();
        assert_eq!(
            none.check_required(false, Cents::ZERO).unwrap_err().code(),
            "MISSING_REQUIRED_ARTIFACTS:procedureReport"
        );

        let base = ClaimArtifacts {
            procedure_report: Some("doc-1".into()),
            clinic_invoice: Some("doc-2".into()),
            ..Default::default()
        };
        base.check_required(false, Cents::ZERO).unwrap();
        assert_eq!(
            base.check_required(true, Cents::ZERO).unwrap_err().code(),
            "MISSING_REQUIRED_ARTIFACTS:rabiesCertificate"
        );
        assert_eq!(
            base.check_required(false, Cents::new(500)).unwrap_err().code(),
            "MISSING_REQUIRED_ARTIFACTS:copayReceipt"
        );
    }

    #[test]
    fn adjudication_guard() {
        let mut c = ClaimState::empty(ClaimId::mint());
        c.status = ClaimStatus::Submitted;
        assert!(c.can_adjudicate());
        c.status = ClaimStatus::Adjusted;
        assert!(c.can_adjudicate());
        c.status = ClaimStatus::Approved;
        assert!(!c.can_adjudicate());
        c.status = ClaimStatus::Denied;
        assert!(!c.can_adjudicate());
    }

    proptest! {
        // Property 10: fingerprints collapse only across canonicalization-erased
        // dimensions.
        #[test]
        fn fingerprint_collapses_only_erased_dimensions(
            voucher in "[a-zA-Z0-9_]{1,12}",
            clinic in "[a-zA-Z0-9-]{1,12}",
            proc in "[a-zA-Z]{1,8}",
            pad_left in " {0,3}",
            pad_right in " {0,3}",
            time_suffix in "(T[0-2][0-9]:[0-5][0-9]:[0-5][0-9]Z)?",
            rabies in proptest::bool::ANY,
        ) {
            let date = format!("2026-03-07{}", time_suffix);
            let noisy_voucher = format!("{}{}{}", pad_left, voucher.to_uppercase(), pad_right);
            let a = claim_fingerprint(&noisy_voucher, &clinic, &proc, &date, rabies).unwrap();
            let b = claim_fingerprint(
                &voucher.to_lowercase(), &clinic.to_lowercase(),
                &proc.to_uppercase(), "2026-03-07", rabies,
            ).unwrap();
            prop_assert_eq!(&a, &b);

            let flipped = claim_fingerprint(&voucher, &clinic, &proc, &date, !rabies).unwrap();
            prop_assert_ne!(&a, &flipped);
        }
    }
}
