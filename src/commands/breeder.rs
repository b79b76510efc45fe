//! Breeder compliance filing commands.
//!
//! Filings touch exactly one aggregate each, so no multi-aggregate lock set
//! is needed; the command transaction serializes access and the sweep
//! recomputes the derived compliance column.

use crate::commands::{execute, input_hash, load_filing, CommandContext, Core};
use crate::domain::breeder::{
    ComplianceStatus, FilingCuredData, FilingDueData, FilingSubmittedData,
};
use crate::domain::event::{self, AggregateKind};
use crate::domain::ids::{CycleId, FilingId};
use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilingDueInput {
    pub filing_id: FilingId,
    pub cycle_id: CycleId,
    pub breeder_id: String,
    pub due_at: DateTime<Utc>,
    pub cure_period_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilingResponse {
    pub filing_id: FilingId,
    pub compliance_status: ComplianceStatus,
}

/// Record a filing obligation with its due date and cure window.
pub fn record_filing_due(
    core: &Core,
    ctx: &CommandContext,
    input: RecordFilingDueInput,
) -> CoreResult<FilingResponse> {
    let hash = input_hash(&input)?;
    execute(core, ctx, "RecordFilingDue", &hash, Vec::new(), |tx, scope| {
        if let Ok(filing) = load_filing(tx, input.filing_id.as_str()) {
            return Ok(FilingResponse {
                filing_id: input.filing_id.clone(),
                compliance_status: filing.status_at(scope.now()),
            });
        }
        if input.cure_period_days < 0 {
            return Err(CoreError::BalanceInvariant {
                detail: "negative cure period".to_string(),
            });
        }
        scope.emit(
            AggregateKind::BreederFiling,
            input.filing_id.as_str(),
            &input.cycle_id,
            event::BREEDER_FILING_DUE,
            &FilingDueData {
                filing_id: input.filing_id.clone(),
                breeder_id: input.breeder_id.clone(),
                due_at: input.due_at,
                cure_period_days: input.cure_period_days,
            },
            None,
        )?;
        let filing = load_filing(tx, input.filing_id.as_str())?;
        Ok(FilingResponse {
            filing_id: input.filing_id.clone(),
            compliance_status: filing.status_at(scope.now()),
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFilingInput {
    pub filing_id: FilingId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

pub fn submit_filing(
    core: &Core,
    ctx: &CommandContext,
    input: SubmitFilingInput,
) -> CoreResult<FilingResponse> {
    let hash = input_hash(&input)?;
    execute(core, ctx, "SubmitFiling", &hash, Vec::new(), |tx, scope| {
        let mut filing = load_filing(tx, input.filing_id.as_str())?;
        let submitted_at = input.submitted_at.unwrap_or_else(|| scope.now());
        let ev = scope.emit(
            AggregateKind::BreederFiling,
            input.filing_id.as_str(),
            &filing.cycle_id.clone(),
            event::BREEDER_FILING_SUBMITTED,
            &FilingSubmittedData { submitted_at },
            None,
        )?;
        filing.apply(&ev)?;
        Ok(FilingResponse {
            filing_id: input.filing_id.clone(),
            compliance_status: filing.status_at(scope.now()),
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CureFilingInput {
    pub filing_id: FilingId,
}

/// Mark an overdue filing cured (administrative remedy inside the cure
/// window).
pub fn cure_filing(
    core: &Core,
    ctx: &CommandContext,
    input: CureFilingInput,
) -> CoreResult<FilingResponse> {
    let hash = input_hash(&input)?;
    execute(core, ctx, "CureFiling", &hash, Vec::new(), |tx, scope| {
        let mut filing = load_filing(tx, input.filing_id.as_str())?;
        let ev = scope.emit(
            AggregateKind::BreederFiling,
            input.filing_id.as_str(),
            &filing.cycle_id.clone(),
            event::BREEDER_FILING_CURED,
            &FilingCuredData { cured_at: scope.now() },
            None,
        )?;
        filing.apply(&ev)?;
        Ok(FilingResponse {
            filing_id: input.filing_id.clone(),
            compliance_status: filing.status_at(scope.now()),
        })
    })
}
