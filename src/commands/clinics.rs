//! Clinic commands: registration, suspension, reinstatement, license
//! updates.

use crate::commands::{execute, input_hash, load_clinic, CommandContext, Core};
use crate::domain::clinic::{
    ClinicLicenseUpdatedData, ClinicRegisteredData, ClinicStatus, ClinicSuspendedData, License,
    PaymentInfo,
};
use crate::domain::event::{self, AggregateKind};
use crate::domain::ids::{ClinicId, CycleId};
use crate::errors::{CoreError, CoreResult};
use crate::store::locks::{LockKey, LockKind};
use serde::{Deserialize, Serialize};

/// Clinic registration is cycle-independent; clinic events are recorded
/// against this administrative pseudo-cycle so the envelope stays complete.
const ADMIN_CYCLE: &str = "ADMIN";

fn admin_cycle() -> CycleId {
    CycleId::new(ADMIN_CYCLE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClinicInput {
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
pub struct ClinicResponse {
    pub clinic_id: ClinicId,
    pub status: ClinicStatus,
}

pub fn register_clinic(
    core: &Core,
    ctx: &CommandContext,
    input: RegisterClinicInput,
) -> CoreResult<ClinicResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Clinic, input.clinic_id.as_str())];
    execute(core, ctx, "RegisterClinic", &hash, locks, |tx, scope| {
        if load_clinic(tx, input.clinic_id.as_str()).is_ok() {
            // Idempotent: registration already happened.
            return Ok(ClinicResponse {
                clinic_id: input.clinic_id.clone(),
                status: ClinicStatus::Active,
            });
        }
        let data = ClinicRegisteredData {
            clinic_id: input.clinic_id.clone(),
            name: input.name.clone(),
            license: input.license.clone(),
            oasis_vendor_code: input.oasis_vendor_code.clone(),
            payment_info: input.payment_info.clone(),
        };
        scope.emit(
            AggregateKind::Clinic,
            input.clinic_id.as_str(),
            &admin_cycle(),
            event::CLINIC_REGISTERED,
            &data,
            None,
        )?;
        Ok(ClinicResponse { clinic_id: input.clinic_id.clone(), status: ClinicStatus::Active })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendClinicInput {
    pub clinic_id: ClinicId,
    pub reason: String,
}

pub fn suspend_clinic(
    core: &Core,
    ctx: &CommandContext,
    input: SuspendClinicInput,
) -> CoreResult<ClinicResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Clinic, input.clinic_id.as_str())];
    execute(core, ctx, "SuspendClinic", &hash, locks, |tx, scope| {
        let clinic = load_clinic(tx, input.clinic_id.as_str())?;
        if clinic.status == ClinicStatus::Suspended {
            return Ok(ClinicResponse {
                clinic_id: input.clinic_id.clone(),
                status: ClinicStatus::Suspended,
            });
        }
        scope.emit(
            AggregateKind::Clinic,
            input.clinic_id.as_str(),
            &admin_cycle(),
            event::CLINIC_SUSPENDED,
            &ClinicSuspendedData { reason: input.reason.clone() },
            None,
        )?;
        Ok(ClinicResponse { clinic_id: input.clinic_id.clone(), status: ClinicStatus::Suspended })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinstateClinicInput {
    pub clinic_id: ClinicId,
}

pub fn reinstate_clinic(
    core: &Core,
    ctx: &CommandContext,
    input: ReinstateClinicInput,
) -> CoreResult<ClinicResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Clinic, input.clinic_id.as_str())];
    execute(core, ctx, "ReinstateClinic", &hash, locks, |tx, scope| {
        let clinic = load_clinic(tx, input.clinic_id.as_str())?;
        if clinic.status != ClinicStatus::Suspended {
            return Err(CoreError::InvalidTransition {
                aggregate: "Clinic".into(),
                from: clinic.status.as_str().into(),
                to: ClinicStatus::Active.as_str().into(),
            });
        }
        scope.emit(
            AggregateKind::Clinic,
            input.clinic_id.as_str(),
            &admin_cycle(),
            event::CLINIC_REINSTATED,
            &serde_json::json!({}),
            None,
        )?;
        Ok(ClinicResponse { clinic_id: input.clinic_id.clone(), status: ClinicStatus::Active })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClinicLicenseInput {
    pub clinic_id: ClinicId,
    pub license: License,
}

pub fn update_clinic_license(
    core: &Core,
    ctx: &CommandContext,
    input: UpdateClinicLicenseInput,
) -> CoreResult<ClinicResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::Clinic, input.clinic_id.as_str())];
    execute(core, ctx, "UpdateClinicLicense", &hash, locks, |tx, scope| {
        let clinic = load_clinic(tx, input.clinic_id.as_str())?;
        scope.emit(
            AggregateKind::Clinic,
            input.clinic_id.as_str(),
            &admin_cycle(),
            event::CLINIC_LICENSE_UPDATED,
            &ClinicLicenseUpdatedData { license: input.license.clone() },
            None,
        )?;
        Ok(ClinicResponse { clinic_id: input.clinic_id.clone(), status: clinic.status })
    })
}
