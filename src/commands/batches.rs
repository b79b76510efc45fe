//! OASIS export batch commands: selection, rendering, and the downstream
//! acknowledgement lifecycle.
//!
//! Batch generation is idempotent on `(cycle, period, watermark)`; rendering
//! is idempotent on the stored artifact reference; rejection and void release
//! the batch's invoices so a new batch can claim them.

use crate::commands::{execute, input_hash, load_batch, load_invoice, CommandContext, Core};
use crate::domain::event::{self, AggregateKind};
use crate::domain::ids::{BatchId, CycleId, InvoiceId};
use crate::domain::invoice::{InvoiceExportedData, InvoiceReleasedData};
use crate::domain::money::Cents;
use crate::domain::oasis_batch::{
    batch_fingerprint, BatchCreatedData, BatchItemAddedData, BatchStatus, BatchTransitionData,
    FileRenderedData,
};
use crate::domain::Watermark;
use crate::errors::{CoreError, CoreResult};
use crate::oasis::{self, BatchMetadata, OasisInvoice};
use crate::store::artifacts;
use crate::store::locks::{LockKey, LockKind};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBatchInput {
    pub cycle_id: CycleId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    /// Selection watermark: only invoices whose projection watermark is at or
    /// before this point are eligible.
    pub watermark: Watermark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBatchResponse {
    pub batch_id: BatchId,
    pub batch_code: String,
    pub invoice_count: u32,
    /// True when an identical selection already existed.
    pub existing: bool,
}

fn eligible_invoices(
    conn: &Connection,
    input: &GenerateBatchInput,
) -> CoreResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT i.invoice_id, i.total_cents
         FROM invoices i
         JOIN clinics c ON c.clinic_id = i.clinic_id
         WHERE i.cycle_id = ?1
           AND i.status = 'SUBMITTED'
           AND i.batch_id IS NULL
           AND c.oasis_vendor_code IS NOT NULL
           AND (i.watermark_ingested_at < ?2
                OR (i.watermark_ingested_at = ?2 AND i.watermark_event_id <= ?3))
         ORDER BY i.watermark_ingested_at ASC, i.watermark_event_id ASC, i.invoice_id ASC",
    )?;
    let rows = stmt
        .query_map(
            params![
                input.cycle_id.as_str(),
                input.watermark.ingested_at_ms,
                input.watermark.event_id.to_string(),
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?
        .collect::<Result<Vec<(String, i64)>, _>>()?;
    Ok(rows)
}

/// Select eligible invoices at the caller's watermark into a new batch.
pub fn generate_export_batch(
    core: &Core,
    ctx: &CommandContext,
    input: GenerateBatchInput,
) -> CoreResult<GenerateBatchResponse> {
    let hash = input_hash(&input)?;
    // Lock list from an ahead-of-transaction read; the in-transaction
    // re-selection under those locks is authoritative.
    let candidates = core.db().with_conn(|conn| eligible_invoices(conn, &input))?;
    let mut locks: Vec<LockKey> = candidates
        .iter()
        .map(|(id, _)| LockKey::new(LockKind::Invoice, id.clone()))
        .collect();
    locks.push(LockKey::new(LockKind::OasisBatch, input.cycle_id.as_str()));

    execute(core, ctx, "GenerateExportBatch", &hash, locks, |tx, scope| {
        // Identical (cycle, period, watermark) selection already captured?
        let existing: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT batch_id, batch_code,
                        (SELECT COUNT(*) FROM oasis_batch_items it
                          WHERE it.batch_id = oasis_batches.batch_id)
                 FROM oasis_batches
                 WHERE cycle_id = ?1 AND period_start = ?2 AND period_end = ?3
                   AND selection_wm_ingested_at = ?4 AND selection_wm_event_id = ?5",
                params![
                    input.cycle_id.as_str(),
                    input.period_start.to_string(),
                    input.period_end.to_string(),
                    input.watermark.ingested_at_ms,
                    input.watermark.event_id.to_string(),
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((batch_id, batch_code, count)) = existing {
            return Ok(GenerateBatchResponse {
                batch_id: BatchId::new(batch_id),
                batch_code,
                invoice_count: count as u32,
                existing: true,
            });
        }

        let selected = eligible_invoices(tx, &input)?;
        if selected.is_empty() {
            return Err(CoreError::NoInvoicesEligibleForExport {
                cycle_id: input.cycle_id.to_string(),
            });
        }

        let invoice_ids: Vec<InvoiceId> =
            selected.iter().map(|(id, _)| InvoiceId::new(id.clone())).collect();
        let fingerprint = batch_fingerprint(
            &input.cycle_id,
            input.period_start,
            input.period_end,
            &invoice_ids,
        );
        let batch_id = BatchId::mint();
        let batch_code = format!(
            "WVSNP-{}-{}",
            input.cycle_id.as_str(),
            fingerprint[..6].to_ascii_uppercase()
        );

        let created = scope.emit(
            AggregateKind::OasisBatch,
            batch_id.as_str(),
            &input.cycle_id,
            event::OASIS_EXPORT_BATCH_CREATED,
            &BatchCreatedData {
                batch_id: batch_id.clone(),
                batch_code: batch_code.clone(),
                fingerprint,
                period_start: input.period_start,
                period_end: input.period_end,
                watermark: input.watermark,
            },
            None,
        )?;
        for (position, (invoice_id, total_cents)) in selected.iter().enumerate() {
            scope.emit(
                AggregateKind::OasisBatch,
                batch_id.as_str(),
                &input.cycle_id,
                event::OASIS_EXPORT_BATCH_ITEM_ADDED,
                &BatchItemAddedData {
                    invoice_id: InvoiceId::new(invoice_id.clone()),
                    position: position as u32,
                    amount_cents: Cents::new(*total_cents),
                },
                Some(created.event_id),
            )?;
            scope.emit(
                AggregateKind::Invoice,
                invoice_id,
                &input.cycle_id,
                event::INVOICE_EXPORTED,
                &InvoiceExportedData { batch_id: batch_id.clone() },
                Some(created.event_id),
            )?;
        }
        info!(batch = %batch_id, invoices = selected.len(), "export batch created");
        Ok(GenerateBatchResponse {
            batch_id,
            batch_code,
            invoice_count: selected.len() as u32,
            existing: false,
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderBatchInput {
    pub batch_id: BatchId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderBatchResponse {
    pub batch_id: BatchId,
    pub sha256: String,
    pub record_count: u32,
    pub control_total_cents: Cents,
    pub content_length: u64,
    pub format_version: String,
}

/// Render the batch file, store it content-addressed, and record its digest.
/// Re-rendering a rendered batch returns the stored artifact reference.
pub fn render_export_file(
    core: &Core,
    ctx: &CommandContext,
    input: RenderBatchInput,
) -> CoreResult<RenderBatchResponse> {
    let hash = input_hash(&input)?;
    let locks = vec![LockKey::new(LockKind::OasisBatch, input.batch_id.as_str())];
    execute(core, ctx, "RenderExportFile", &hash, locks, |tx, scope| {
        let batch = load_batch(tx, input.batch_id.as_str())?;
        if batch.status == BatchStatus::Voided {
            return Err(CoreError::BatchAlreadyVoided { batch_id: input.batch_id.to_string() });
        }
        if let Some(sha256) = &batch.artifact_sha256 {
            return Ok(RenderBatchResponse {
                batch_id: input.batch_id.clone(),
                sha256: sha256.clone(),
                record_count: batch.record_count,
                control_total_cents: batch.control_total,
                content_length: batch.content_length,
                format_version: batch
                    .format_version
                    .clone()
                    .unwrap_or_else(|| oasis::FORMAT_VERSION.to_string()),
            });
        }
        batch.check_can_render()?;

        // Items in deterministic (position) order with vendor codes.
        let mut stmt = tx.prepare(
            "SELECT it.invoice_id, it.amount_cents, i.clinic_id, c.oasis_vendor_code
             FROM oasis_batch_items it
             JOIN invoices i ON i.invoice_id = it.invoice_id
             JOIN clinics c ON c.clinic_id = i.clinic_id
             WHERE it.batch_id = ?1
             ORDER BY it.position ASC",
        )?;
        let rows = stmt
            .query_map(params![input.batch_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut invoices = Vec::with_capacity(rows.len());
        for (invoice_id, amount_cents, clinic_id, vendor_code) in rows {
            let oasis_vendor_code = vendor_code.ok_or_else(|| CoreError::BatchInvariant {
                detail: format!("clinic {} lost its vendor code", clinic_id),
            })?;
            invoices.push(OasisInvoice {
                invoice_id,
                clinic_id,
                oasis_vendor_code,
                amount_cents,
                period_start: batch.period_start,
                period_end: batch.period_end,
            });
        }

        let metadata = BatchMetadata {
            batch_code: batch.batch_code.clone(),
            generation_date: scope.now().date_naive(),
            fund_code: oasis::FUND_CODE.to_string(),
            org_code: oasis::ORG_CODE.to_string(),
            object_code: oasis::OBJECT_CODE.to_string(),
        };
        let rendered = oasis::render_oasis_file(&invoices, &metadata)?;
        let sha256 = artifacts::put(tx, &rendered.content, oasis::CONTENT_TYPE, scope.now_ms())?;
        if sha256 != rendered.sha256 {
            return Err(CoreError::BatchInvariant {
                detail: "artifact digest mismatch".to_string(),
            });
        }

        scope.emit(
            AggregateKind::OasisBatch,
            input.batch_id.as_str(),
            &batch.cycle_id,
            event::OASIS_EXPORT_FILE_RENDERED,
            &FileRenderedData {
                record_count: rendered.record_count,
                control_total_cents: Cents::new(rendered.control_total_cents),
                content_length: rendered.content.len() as u64,
                sha256: sha256.clone(),
                format_version: oasis::FORMAT_VERSION.to_string(),
            },
            None,
        )?;
        Ok(RenderBatchResponse {
            batch_id: input.batch_id.clone(),
            sha256,
            record_count: rendered.record_count,
            control_total_cents: Cents::new(rendered.control_total_cents),
            content_length: rendered.content.len() as u64,
            format_version: oasis::FORMAT_VERSION.to_string(),
        })
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLifecycleInput {
    pub batch_id: BatchId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub released_invoices: u32,
}

fn batch_locks(core: &Core, batch_id: &BatchId) -> CoreResult<Vec<LockKey>> {
    // Invoices attached to the batch may need releasing; lock them too.
    let invoice_ids: Vec<String> = core.db().with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT invoice_id FROM oasis_batch_items WHERE batch_id = ?1 ORDER BY position",
        )?;
        let ids = stmt
            .query_map(params![batch_id.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    })?;
    let mut locks: Vec<LockKey> = invoice_ids
        .into_iter()
        .map(|id| LockKey::new(LockKind::Invoice, id))
        .collect();
    locks.push(LockKey::new(LockKind::OasisBatch, batch_id.as_str()));
    Ok(locks)
}

fn transition(
    core: &Core,
    ctx: &CommandContext,
    input: BatchLifecycleInput,
    op: &'static str,
    event_type: &'static str,
    to: BatchStatus,
    releases_invoices: bool,
) -> CoreResult<BatchResponse> {
    let hash = input_hash(&input)?;
    let locks = batch_locks(core, &input.batch_id)?;
    execute(core, ctx, op, &hash, locks, |tx, scope| {
        let batch = load_batch(tx, input.batch_id.as_str())?;
        match to {
            BatchStatus::Submitted => batch.check_can_submit()?,
            BatchStatus::Acknowledged | BatchStatus::Rejected => batch.check_can_resolve(to)?,
            BatchStatus::Voided => batch.check_can_void()?,
            _ => {
                return Err(CoreError::InvalidTransition {
                    aggregate: "OasisBatch".into(),
                    from: batch.status.as_str().into(),
                    to: to.as_str().into(),
                })
            }
        }
        let transition_event = scope.emit(
            AggregateKind::OasisBatch,
            input.batch_id.as_str(),
            &batch.cycle_id,
            event_type,
            &BatchTransitionData { reason: input.reason.clone() },
            None,
        )?;

        let mut released = 0u32;
        if releases_invoices {
            for invoice_id in &batch.invoice_ids {
                let invoice = load_invoice(tx, invoice_id.as_str())?;
                if invoice.batch_id.as_ref() != Some(&input.batch_id) {
                    continue; // already released by an earlier rejection
                }
                scope.emit(
                    AggregateKind::Invoice,
                    invoice_id.as_str(),
                    &batch.cycle_id,
                    event::INVOICE_RELEASED,
                    &InvoiceReleasedData {
                        batch_id: input.batch_id.clone(),
                        reason: format!("batch {}", to.as_str().to_ascii_lowercase()),
                    },
                    Some(transition_event.event_id),
                )?;
                released += 1;
            }
        }
        Ok(BatchResponse { batch_id: input.batch_id.clone(), status: to, released_invoices: released })
    })
}

pub fn submit_batch(
    core: &Core,
    ctx: &CommandContext,
    input: BatchLifecycleInput,
) -> CoreResult<BatchResponse> {
    transition(core, ctx, input, "SubmitBatch", event::OASIS_EXPORT_BATCH_SUBMITTED,
        BatchStatus::Submitted, false)
}

pub fn acknowledge_batch(
    core: &Core,
    ctx: &CommandContext,
    input: BatchLifecycleInput,
) -> CoreResult<BatchResponse> {
    transition(core, ctx, input, "AcknowledgeBatch", event::OASIS_EXPORT_BATCH_ACKNOWLEDGED,
        BatchStatus::Acknowledged, false)
}

/// Rejection releases the batch's invoices for re-export.
pub fn reject_batch(
    core: &Core,
    ctx: &CommandContext,
    input: BatchLifecycleInput,
) -> CoreResult<BatchResponse> {
    transition(core, ctx, input, "RejectBatch", event::OASIS_EXPORT_BATCH_REJECTED,
        BatchStatus::Rejected, true)
}

/// Void releases the batch's invoices for re-export.
pub fn void_batch(
    core: &Core,
    ctx: &CommandContext,
    input: BatchLifecycleInput,
) -> CoreResult<BatchResponse> {
    transition(core, ctx, input, "VoidBatch", event::OASIS_EXPORT_BATCH_VOIDED,
        BatchStatus::Voided, true)
}
