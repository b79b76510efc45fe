//! Shared seed helpers for the end-to-end scenario tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use wvsnp_backend::commands::claims::{submit_claim, SubmitClaimInput, SubmitClaimResponse};
use wvsnp_backend::commands::clinics::{register_clinic, RegisterClinicInput};
use wvsnp_backend::commands::grants::{register_grant, RegisterGrantInput};
use wvsnp_backend::commands::vouchers::{issue_voucher, IssueVoucherInput, IssueVoucherResponse};
use wvsnp_backend::domain::claim::ClaimArtifacts;
use wvsnp_backend::domain::clinic::License;
use wvsnp_backend::domain::ids::{ClinicId, CycleId, GrantId, VoucherId};
use wvsnp_backend::{ActorKind, Cents, CommandContext, Core};

pub const CYCLE: &str = "FY2026";
pub const GRANT: &str = "grant-fy2026";

/// Honor RUST_LOG in test runs; safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ctx(key: &str) -> CommandContext {
    CommandContext::new(key.to_string(), format!("corr-{}", key), "admin-1", ActorKind::Admin)
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Grant with the FY2026 window and a 1:1 reimbursement rate.
pub fn seed_grant(core: &Core, general_cents: i64, lirp_cents: i64) {
    init_tracing();
    register_grant(
        core,
        &ctx("seed-grant-001"),
        RegisterGrantInput {
            grant_id: GrantId::new(GRANT),
            cycle_id: CycleId::new(CYCLE),
            general_awarded_cents: Cents::new(general_cents),
            lirp_awarded_cents: Cents::new(lirp_cents),
            rate_numerator: 1,
            rate_denominator: 1,
            period_start: date(2025, 7, 1),
            period_end: date(2026, 6, 30),
        },
    )
    .unwrap();
}

pub fn seed_clinic(core: &Core, clinic_id: &str, license_expires: NaiveDate, vendor: &str) {
    register_clinic(
        core,
        &ctx(&format!("seed-clinic-{}", clinic_id)),
        RegisterClinicInput {
            clinic_id: ClinicId::new(clinic_id),
            name: format!("{} Veterinary", clinic_id),
            license: License {
                number: format!("WV-{}", clinic_id),
                status: "ACTIVE".into(),
                expires_at: license_expires,
            },
            oasis_vendor_code: Some(vendor.to_string()),
            payment_info: None,
        },
    )
    .unwrap();
}

/// Directly issued (non-tentative) voucher against the seeded grant.
pub fn seed_voucher(core: &Core, key: &str, max_cents: i64, is_lirp: bool) -> IssueVoucherResponse {
    issue_voucher(
        core,
        &ctx(key),
        IssueVoucherInput {
            grant_id: GrantId::new(GRANT),
            county: "KANAWHA".into(),
            is_lirp,
            max_reimbursement_cents: Cents::new(max_cents),
            valid_until: date(2026, 12, 31),
            tentative_hold_hours: None,
        },
    )
    .unwrap()
}

pub fn artifacts() -> ClaimArtifacts {
    ClaimArtifacts {
        procedure_report: Some("doc-procedure".into()),
        clinic_invoice: Some("doc-invoice".into()),
        rabies_certificate: None,
        copay_receipt: None,
    }
}

pub fn claim_input(voucher_id: &VoucherId, clinic_id: &str, amount_cents: i64) -> SubmitClaimInput {
    SubmitClaimInput {
        voucher_id: voucher_id.clone(),
        clinic_id: ClinicId::new(clinic_id),
        procedure_code: "spay".into(),
        date_of_service: "2026-01-15".into(),
        amount_cents: Cents::new(amount_cents),
        copay_cents: Cents::new(0),
        rabies_included: false,
        artifacts: artifacts(),
        claim_id: None,
        fraud_signals: Vec::new(),
    }
}

pub fn submit(core: &Core, key: &str, input: SubmitClaimInput) -> SubmitClaimResponse {
    submit_claim(core, &ctx(key), input).unwrap()
}

/// Count events of one type in the whole log.
pub fn count_events(core: &Core, event_type: &str) -> i64 {
    core.db()
        .with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT COUNT(*) FROM events WHERE event_type = ?1",
                    rusqlite::params![event_type],
                    |row| row.get(0),
                )
                .unwrap())
        })
        .unwrap()
}
