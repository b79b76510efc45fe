//! Error taxonomy for the transactional core.
//!
//! Every error carries a stable string code that callers can match on.
//! Messages are for humans and may change; codes may not.
//!
//! Categories:
//! - Validation: bad envelope or payload shape, rejected before any write.
//! - Business: a domain rule said no. Rolled back, never retried.
//! - Concurrency: idempotency-ledger conflicts.
//! - Invariant: corruption or a bug. Logged with full context, fail fast.
//! - Transient: storage-level busy/timeout. Retried internally up to the
//!   configured attempt cap, then surfaced as-is.

use std::fmt;

/// Core error type surfaced by command handlers, stores and queries.
#[derive(Debug)]
pub enum CoreError {
    // -- Validation ----------------------------------------------------------
    MissingIdempotencyKey,
    MissingRequiredArtifacts { field: &'static str },
    InvalidDateFormat { value: String },
    UuidTimeOrderedRequired { event_id: String },
    EventDataBigintForbidden { path: String },
    EventTypeInvalid { event_type: String },
    EventEnvelopeIncomplete { field: &'static str },
    ClaimIdMalformed { claim_id: String },

    // -- Business rules ------------------------------------------------------
    InsufficientFunds { bucket: String, requested_cents: i64, available_cents: i64 },
    LirpCopayForbidden,
    VoucherNotFound { voucher_id: String },
    VoucherNotValid { voucher_id: String, reason: String },
    VoucherNotVoidable { voucher_id: String, status: String },
    VoucherAlreadyRedeemed { voucher_id: String },
    ClinicNotFound { clinic_id: String },
    ClinicNotActive { clinic_id: String },
    ClinicLicenseInvalidForServiceDate { clinic_id: String, date_of_service: String },
    GrantNotFound { grant_id: String },
    GrantPeriodEnded { cycle_id: String },
    GrantClaimsDeadlinePassed { cycle_id: String },
    GrantCycleClosed { cycle_id: String },
    ClaimNotFound { claim_id: String },
    InvoiceNotFound { invoice_id: String },
    AdjustmentNotFound { adjustment_id: String },
    BatchNotFound { batch_id: String },
    BatchNotRendered { batch_id: String },
    BatchAlreadySubmitted { batch_id: String },
    BatchAlreadyVoided { batch_id: String },
    NoInvoicesEligibleForExport { cycle_id: String },
    FilingNotFound { filing_id: String },
    PreflightNotPassed { status: String },
    AuditHoldActive { cycle_id: String },
    InvalidTransition { aggregate: String, from: String, to: String },

    // -- Concurrency ---------------------------------------------------------
    OperationInProgress { key: String },
    IdempotencyKeyReused { key: String },

    // -- Invariants ----------------------------------------------------------
    BatchInvariant { detail: String },
    CloseoutInvariant { detail: String },
    BalanceInvariant { detail: String },
    ImmutabilityViolation,

    // -- Transient -----------------------------------------------------------
    StorageSerializationFailure { detail: String },
    StorageTimeout { detail: String },

    // -- Plumbing ------------------------------------------------------------
    Storage(rusqlite::Error),
    Serialization(serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> String {
        match self {
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY".into(),
            Self::MissingRequiredArtifacts { field } => {
                format!("MISSING_REQUIRED_ARTIFACTS:{}", field)
            }
            Self::InvalidDateFormat { .. } => "INVALID_DATE_FORMAT".into(),
            Self::UuidTimeOrderedRequired { .. } => "UUID_TIME_ORDERED_REQUIRED".into(),
            Self::EventDataBigintForbidden { .. } => "EVENT_DATA_BIGINT_FORBIDDEN".into(),
            Self::EventTypeInvalid { .. } => "EVENT_TYPE_INVALID".into(),
            Self::EventEnvelopeIncomplete { .. } => "EVENT_ENVELOPE_INCOMPLETE".into(),
            Self::ClaimIdMalformed { .. } => "CLAIM_ID_MALFORMED".into(),
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS".into(),
            Self::LirpCopayForbidden => "LIRP_COPAY_FORBIDDEN".into(),
            Self::VoucherNotFound { .. } => "VOUCHER_NOT_FOUND".into(),
            Self::VoucherNotValid { .. } => "VOUCHER_NOT_VALID".into(),
            Self::VoucherNotVoidable { .. } => "VOUCHER_NOT_VOIDABLE".into(),
            Self::VoucherAlreadyRedeemed { .. } => "VOUCHER_ALREADY_REDEEMED".into(),
            Self::ClinicNotFound { .. } => "CLINIC_NOT_FOUND".into(),
            Self::ClinicNotActive { .. } => "CLINIC_NOT_ACTIVE".into(),
            Self::ClinicLicenseInvalidForServiceDate { .. } => {
                "CLINIC_LICENSE_INVALID_FOR_SERVICE_DATE".into()
            }
            Self::GrantNotFound { .. } => "GRANT_NOT_FOUND".into(),
            Self::GrantPeriodEnded { .. } => "GRANT_PERIOD_ENDED".into(),
            Self::GrantClaimsDeadlinePassed { .. } => "GRANT_CLAIMS_DEADLINE_PASSED".into(),
            Self::GrantCycleClosed { .. } => "GRANT_CYCLE_CLOSED".into(),
            Self::ClaimNotFound { .. } => "CLAIM_NOT_FOUND".into(),
            Self::InvoiceNotFound { .. } => "INVOICE_NOT_FOUND".into(),
            Self::AdjustmentNotFound { .. } => "ADJUSTMENT_NOT_FOUND".into(),
            Self::BatchNotFound { .. } => "BATCH_NOT_FOUND".into(),
            Self::BatchNotRendered { .. } => "BATCH_NOT_RENDERED".into(),
            Self::BatchAlreadySubmitted { .. } => "BATCH_ALREADY_SUBMITTED".into(),
            Self::BatchAlreadyVoided { .. } => "BATCH_ALREADY_VOIDED".into(),
            Self::NoInvoicesEligibleForExport { .. } => "NO_INVOICES_ELIGIBLE_FOR_EXPORT".into(),
            Self::FilingNotFound { .. } => "FILING_NOT_FOUND".into(),
            Self::PreflightNotPassed { .. } => "PREFLIGHT_NOT_PASSED".into(),
            Self::AuditHoldActive { .. } => "AUDIT_HOLD_ACTIVE".into(),
            Self::InvalidTransition { .. } => "INVALID_TRANSITION".into(),
            Self::OperationInProgress { .. } => "OPERATION_IN_PROGRESS".into(),
            Self::IdempotencyKeyReused { .. } => "IDEMPOTENCY_KEY_REUSED".into(),
            Self::BatchInvariant { detail } => format!("BATCH_INVARIANT:{}", detail),
            Self::CloseoutInvariant { detail } => format!("CLOSEOUT_INVARIANT:{}", detail),
            Self::BalanceInvariant { detail } => format!("GRANT_BALANCE_INVARIANT:{}", detail),
            Self::ImmutabilityViolation => "IMMUTABILITY_VIOLATION".into(),
            Self::StorageSerializationFailure { .. } => "STORAGE_SERIALIZATION_FAILURE".into(),
            Self::StorageTimeout { .. } => "STORAGE_TIMEOUT".into(),
            Self::Storage(_) => "STORAGE_ERROR".into(),
            Self::Serialization(_) => "SERIALIZATION_ERROR".into(),
        }
    }

    /// Transient errors are retried by the command executor; everything else
    /// surfaces on first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StorageSerializationFailure { .. } | Self::StorageTimeout { .. }
        )
    }

    /// Invariant violations indicate a bug or corrupted state.
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            Self::BatchInvariant { .. }
                | Self::CloseoutInvariant { .. }
                | Self::BalanceInvariant { .. }
                | Self::ImmutabilityViolation
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIdempotencyKey => {
                write!(f, "MISSING_IDEMPOTENCY_KEY: idempotency key absent or too short")
            }
            Self::MissingRequiredArtifacts { field } => {
                write!(f, "MISSING_REQUIRED_ARTIFACTS:{}: required artifact reference absent", field)
            }
            Self::InvalidDateFormat { value } => {
                write!(f, "INVALID_DATE_FORMAT: cannot parse date from {:?}", value)
            }
            Self::UuidTimeOrderedRequired { event_id } => {
                write!(f, "UUID_TIME_ORDERED_REQUIRED: event id {} is not time-ordered", event_id)
            }
            Self::EventDataBigintForbidden { path } => {
                write!(f, "EVENT_DATA_BIGINT_FORBIDDEN: lossy integer at {}", path)
            }
            Self::EventTypeInvalid { event_type } => {
                write!(f, "EVENT_TYPE_INVALID: {:?}", event_type)
            }
            Self::EventEnvelopeIncomplete { field } => {
                write!(f, "EVENT_ENVELOPE_INCOMPLETE: missing {}", field)
            }
            Self::ClaimIdMalformed { claim_id } => {
                write!(f, "CLAIM_ID_MALFORMED: {:?}", claim_id)
            }
            Self::InsufficientFunds { bucket, requested_cents, available_cents } => write!(
                f,
                "INSUFFICIENT_FUNDS: bucket {} has {} cents, requested {}",
                bucket, available_cents, requested_cents
            ),
            Self::LirpCopayForbidden => {
                write!(f, "LIRP_COPAY_FORBIDDEN: LIRP vouchers do not allow co-pay")
            }
            Self::VoucherNotFound { voucher_id } => {
                write!(f, "VOUCHER_NOT_FOUND: {}", voucher_id)
            }
            Self::VoucherNotValid { voucher_id, reason } => {
                write!(f, "VOUCHER_NOT_VALID: {} ({})", voucher_id, reason)
            }
            Self::VoucherNotVoidable { voucher_id, status } => {
                write!(f, "VOUCHER_NOT_VOIDABLE: {} in status {}", voucher_id, status)
            }
            Self::VoucherAlreadyRedeemed { voucher_id } => {
                write!(f, "VOUCHER_ALREADY_REDEEMED: {}", voucher_id)
            }
            Self::ClinicNotFound { clinic_id } => write!(f, "CLINIC_NOT_FOUND: {}", clinic_id),
            Self::ClinicNotActive { clinic_id } => write!(f, "CLINIC_NOT_ACTIVE: {}", clinic_id),
            Self::ClinicLicenseInvalidForServiceDate { clinic_id, date_of_service } => write!(
                f,
                "CLINIC_LICENSE_INVALID_FOR_SERVICE_DATE: clinic {} at {}",
                clinic_id, date_of_service
            ),
            Self::GrantNotFound { grant_id } => write!(f, "GRANT_NOT_FOUND: {}", grant_id),
            Self::GrantPeriodEnded { cycle_id } => {
                write!(f, "GRANT_PERIOD_ENDED: cycle {}", cycle_id)
            }
            Self::GrantClaimsDeadlinePassed { cycle_id } => {
                write!(f, "GRANT_CLAIMS_DEADLINE_PASSED: cycle {}", cycle_id)
            }
            Self::GrantCycleClosed { cycle_id } => {
                write!(f, "GRANT_CYCLE_CLOSED: cycle {}", cycle_id)
            }
            Self::ClaimNotFound { claim_id } => write!(f, "CLAIM_NOT_FOUND: {}", claim_id),
            Self::InvoiceNotFound { invoice_id } => write!(f, "INVOICE_NOT_FOUND: {}", invoice_id),
            Self::AdjustmentNotFound { adjustment_id } => {
                write!(f, "ADJUSTMENT_NOT_FOUND: {}", adjustment_id)
            }
            Self::BatchNotFound { batch_id } => write!(f, "BATCH_NOT_FOUND: {}", batch_id),
            Self::BatchNotRendered { batch_id } => write!(f, "BATCH_NOT_RENDERED: {}", batch_id),
            Self::BatchAlreadySubmitted { batch_id } => {
                write!(f, "BATCH_ALREADY_SUBMITTED: {}", batch_id)
            }
            Self::BatchAlreadyVoided { batch_id } => {
                write!(f, "BATCH_ALREADY_VOIDED: {}", batch_id)
            }
            Self::NoInvoicesEligibleForExport { cycle_id } => {
                write!(f, "NO_INVOICES_ELIGIBLE_FOR_EXPORT: cycle {}", cycle_id)
            }
            Self::FilingNotFound { filing_id } => write!(f, "FILING_NOT_FOUND: {}", filing_id),
            Self::PreflightNotPassed { status } => {
                write!(f, "PREFLIGHT_NOT_PASSED: closeout status {}", status)
            }
            Self::AuditHoldActive { cycle_id } => {
                write!(f, "AUDIT_HOLD_ACTIVE: cycle {}", cycle_id)
            }
            Self::InvalidTransition { aggregate, from, to } => {
                write!(f, "INVALID_TRANSITION: {} {} -> {}", aggregate, from, to)
            }
            Self::OperationInProgress { key } => write!(f, "OPERATION_IN_PROGRESS: key {}", key),
            Self::IdempotencyKeyReused { key } => write!(f, "IDEMPOTENCY_KEY_REUSED: key {}", key),
            Self::BatchInvariant { detail } => write!(f, "BATCH_INVARIANT:{}", detail),
            Self::CloseoutInvariant { detail } => write!(f, "CLOSEOUT_INVARIANT:{}", detail),
            Self::BalanceInvariant { detail } => write!(f, "GRANT_BALANCE_INVARIANT:{}", detail),
            Self::ImmutabilityViolation => {
                write!(f, "IMMUTABILITY_VIOLATION: event log rows cannot be updated or deleted")
            }
            Self::StorageSerializationFailure { detail } => {
                write!(f, "STORAGE_SERIALIZATION_FAILURE: {}", detail)
            }
            Self::StorageTimeout { detail } => write!(f, "STORAGE_TIMEOUT: {}", detail),
            Self::Storage(e) => write!(f, "STORAGE_ERROR: {}", e),
            Self::Serialization(e) => write!(f, "SERIALIZATION_ERROR: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(ffi, msg) => {
                // RAISE(ABORT, 'IMMUTABILITY_VIOLATION') from the log triggers.
                if msg.as_deref().is_some_and(|m| m.contains("IMMUTABILITY_VIOLATION")) {
                    return Self::ImmutabilityViolation;
                }
                match ffi.code {
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Self::StorageTimeout {
                        detail: msg.clone().unwrap_or_else(|| "database busy".into()),
                    },
                    ErrorCode::ConstraintViolation => {
                        let detail = msg.clone().unwrap_or_else(|| "constraint violation".into());
                        if detail.contains("grant_buckets") {
                            Self::BalanceInvariant { detail }
                        } else {
                            Self::Storage(e)
                        }
                    }
                    _ => Self::Storage(e),
                }
            }
            _ => Self::Storage(e),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::MissingIdempotencyKey.code(), "MISSING_IDEMPOTENCY_KEY");
        assert_eq!(
            CoreError::MissingRequiredArtifacts { field: "rabiesCertificate" }.code(),
            "MISSING_REQUIRED_ARTIFACTS:rabiesCertificate"
        );
        assert_eq!(
            CoreError::BatchInvariant { detail: "line_length".into() }.code(),
            "BATCH_INVARIANT:line_length"
        );
        assert_eq!(CoreError::ImmutabilityViolation.code(), "IMMUTABILITY_VIOLATION");
    }

    #[test]
    fn transient_classification() {
        assert!(CoreError::StorageTimeout { detail: "busy".into() }.is_transient());
        assert!(CoreError::StorageSerializationFailure { detail: "x".into() }.is_transient());
        assert!(!CoreError::LirpCopayForbidden.is_transient());
        assert!(!CoreError::ImmutabilityViolation.is_transient());
    }

    #[test]
    fn immutability_violation_detected_from_sqlite_message() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: 1811,
            },
            Some("IMMUTABILITY_VIOLATION".to_string()),
        );
        let err: CoreError = raw.into();
        assert!(matches!(err, CoreError::ImmutabilityViolation));
    }
}
