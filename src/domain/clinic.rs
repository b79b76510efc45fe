//! Clinic aggregate: participation status, veterinary license, OASIS vendor
//! registration.
//!
//! License validity is always judged as of the claim's date of service, not
//! as of now.

use crate::domain::event::{self, Event};
use crate::domain::ids::ClinicId;
use crate::errors::{CoreError, CoreResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClinicStatus {
    Active,
    Suspended,
}

impl ClinicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "SUSPENDED" => Some(Self::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    pub number: String,
    /// "ACTIVE" unless the licensing board says otherwise.
    pub status: String,
    pub expires_at: NaiveDate,
}

impl License {
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.status == "ACTIVE" && date <= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    pub payee_name: String,
    pub remit_address: String,
}

// -- Event payloads ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicRegisteredData {
    pub clinic_id: ClinicId,
    pub name: String,
    pub license: License,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oasis_vendor_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_info: Option<PaymentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicSuspendedData {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicLicenseUpdatedData {
    pub license: License,
}

// -- State -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicState {
    pub clinic_id: ClinicId,
    pub name: String,
    pub status: ClinicStatus,
    pub license: License,
    pub oasis_vendor_code: Option<String>,
    pub payment_info: Option<PaymentInfo>,
}

impl ClinicState {
    pub fn empty(clinic_id: ClinicId) -> Self {
        Self {
            clinic_id,
            name: String::new(),
            status: ClinicStatus::Suspended,
            license: License {
                number: String::new(),
                status: "INACTIVE".into(),
                expires_at: NaiveDate::MIN,
            },
            oasis_vendor_code: None,
            payment_info: None,
        }
    }

    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::CLINIC_REGISTERED => {
                let data: ClinicRegisteredData = serde_json::from_value(ev.event_data.clone())?;
                self.name = data.name;
                self.status = ClinicStatus::Active;
                self.license = data.license;
                self.oasis_vendor_code = data.oasis_vendor_code;
                self.payment_info = data.payment_info;
            }
            event::CLINIC_SUSPENDED => {
                self.status = ClinicStatus::Suspended;
            }
            event::CLINIC_REINSTATED => {
                self.status = ClinicStatus::Active;
            }
            event::CLINIC_LICENSE_UPDATED => {
                let data: ClinicLicenseUpdatedData =
                    serde_json::from_value(ev.event_data.clone())?;
                self.license = data.license;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn check_invariant(&self) -> CoreResult<()> {
        Ok(())
    }

    // -- Guards --------------------------------------------------------------

    pub fn check_active(&self) -> CoreResult<()> {
        if self.status != ClinicStatus::Active {
            return Err(CoreError::ClinicNotActive { clinic_id: self.clinic_id.to_string() });
        }
        Ok(())
    }

    /// License must be valid as of the service date.
    pub fn check_license_for_service(&self, date_of_service: NaiveDate) -> CoreResult<()> {
        if !self.license.is_valid_on(date_of_service) {
            return Err(CoreError::ClinicLicenseInvalidForServiceDate {
                clinic_id: self.clinic_id.to_string(),
                date_of_service: date_of_service.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{AggregateKind, CLINIC_LICENSE_UPDATED, CLINIC_REGISTERED,
        CLINIC_SUSPENDED};
    use crate::domain::ids::{ActorId, ActorKind, CorrelationId, CycleId, EventIdGen};
    use chrono::Utc;

    fn clinic_event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            event_id: EventIdGen::new().next_now(),
            aggregate_kind: AggregateKind::Clinic,
            aggregate_id: "clinic-1".into(),
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

    fn registered(expires: NaiveDate) -> ClinicState {
        let mut c = ClinicState::empty(ClinicId::new("clinic-1"));
        let data = ClinicRegisteredData {
            clinic_id: ClinicId::new("clinic-1"),
            name: "Valley Vet".into(),
            license: License { number: "WV-001".into(), status: "ACTIVE".into(), expires_at: expires },
            oasis_vendor_code: Some("VENDOR001".into()),
            payment_info: None,
        };
        c.apply(&clinic_event(CLINIC_REGISTERED, serde_json::to_value(&data).unwrap())).unwrap();
        c
    }

    #[test]
    fn license_checked_as_of_service_date() {
        // Scenario S2 shape: license expires 2026-06-10, service on 2026-06-15.
        let c = registered(NaiveDate::from_ymd_opt(2026, 6, 10).unwrap());
        let err = c
            .check_license_for_service(NaiveDate::from_ymd_opt(2026, 6, 15).unwrap())
            .unwrap_err();
        assert_eq!(err.code(), "CLINIC_LICENSE_INVALID_FOR_SERVICE_DATE");
        // Service before the expiry passes even if the license is expired "now".
        c.check_license_for_service(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()).unwrap();
    }

    #[test]
    fn suspension_blocks_activity() {
        let mut c = registered(NaiveDate::from_ymd_opt(2027, 12, 31).unwrap());
        c.check_active().unwrap();
        let data = ClinicSuspendedData { reason: "audit".into() };
        c.apply(&clinic_event(CLINIC_SUSPENDED, serde_json::to_value(&data).unwrap())).unwrap();
        assert_eq!(c.check_active().unwrap_err().code(), "CLINIC_NOT_ACTIVE");
    }

    #[test]
    fn license_update_replaces_license() {
        let mut c = registered(NaiveDate::from_ymd_opt(2026, 6, 10).unwrap());
        let data = ClinicLicenseUpdatedData {
            license: License {
                number: "WV-001".into(),
                status: "ACTIVE".into(),
                expires_at: NaiveDate::from_ymd_opt(2028, 6, 10).unwrap(),
            },
        };
        c.apply(&clinic_event(CLINIC_LICENSE_UPDATED, serde_json::to_value(&data).unwrap()))
            .unwrap();
        c.check_license_for_service(NaiveDate::from_ymd_opt(2027, 1, 1).unwrap()).unwrap();
    }
}
