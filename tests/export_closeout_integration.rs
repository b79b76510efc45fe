//! Export batch and closeout scenarios: deterministic rendering, invoice
//! release on void, reconciliation arithmetic, and the post-close gate.

mod common;

use common::*;
use wvsnp_backend::commands::batches::{
    acknowledge_batch, generate_export_batch, render_export_file, submit_batch, void_batch,
    BatchLifecycleInput, GenerateBatchInput, RenderBatchInput,
};
use wvsnp_backend::commands::claims::{adjudicate_claim, AdjudicateClaimInput, ClaimDecision};
use wvsnp_backend::commands::closeout::{
    close_cycle, reconcile_closeout, run_preflight, start_closeout, CycleInput, ReconcileInput,
};
use wvsnp_backend::commands::invoices::{
    generate_invoices, record_payment, submit_invoice, GenerateInvoicesInput, RecordPaymentInput,
    SubmitInvoiceInput,
};
use wvsnp_backend::commands::claims::submit_claim;
use wvsnp_backend::domain::ids::{CycleId, InvoiceId};
use wvsnp_backend::queries;
use wvsnp_backend::{Cents, Core, Watermark};

fn approve(core: &Core, key: &str, claim_id: &wvsnp_backend::domain::ids::ClaimId) {
    let response = adjudicate_claim(
        core,
        &ctx(key),
        AdjudicateClaimInput {
            claim_id: claim_id.clone(),
            decision: ClaimDecision::Approve,
            decision_basis: "reviewed".into(),
        },
    )
    .unwrap();
    assert!(!response.conflict_detected);
}

fn latest_watermark(core: &Core) -> Watermark {
    queries::events_since(core.db(), Watermark::zero(), u32::MAX)
        .unwrap()
        .last()
        .map(|ev| ev.watermark())
        .expect("log is not empty")
}

/// Submit, approve and invoice two claims from two clinics, then submit both
/// invoices. Returns the invoice ids.
fn seed_two_submitted_invoices(core: &Core) -> Vec<InvoiceId> {
    seed_grant(core, 1_000_000, 0);
    seed_clinic(core, "clinic-1", date(2027, 12, 31), "VENDOR001");
    seed_clinic(core, "clinic-2", date(2027, 12, 31), "VENDOR002");
    let v1 = seed_voucher(core, "issue-v1-00001", 50_000, false);
    let v2 = seed_voucher(core, "issue-v2-00001", 75_000, false);

    let c1 = submit(core, "claim-1-00001", claim_input(&v1.voucher_id, "clinic-1", 50_000));
    let c2 = submit(core, "claim-2-00001", claim_input(&v2.voucher_id, "clinic-2", 75_000));
    approve(core, "approve-1-0001", &c1.claim_id);
    approve(core, "approve-2-0001", &c2.claim_id);

    let generated = generate_invoices(
        core,
        &ctx("gen-invoices-01"),
        GenerateInvoicesInput {
            cycle_id: CycleId::new(CYCLE),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
        },
    )
    .unwrap();
    assert_eq!(generated.invoices.len(), 2);

    let mut ids = Vec::new();
    for (i, invoice) in generated.invoices.iter().enumerate() {
        submit_invoice(
            core,
            &ctx(&format!("submit-inv-{:04}", i)),
            SubmitInvoiceInput { invoice_id: invoice.invoice_id.clone() },
        )
        .unwrap();
        ids.push(invoice.invoice_id.clone());
    }
    ids
}

/// S3 at the command level: generation + rendering is deterministic and
/// idempotent, with the expected count and control total.
#[test]
fn batch_render_is_deterministic_and_idempotent() {
    let core = Core::in_memory().unwrap();
    seed_two_submitted_invoices(&core);

    let batch = generate_export_batch(
        &core,
        &ctx("gen-batch-0001"),
        GenerateBatchInput {
            cycle_id: CycleId::new(CYCLE),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
            watermark: latest_watermark(&core),
        },
    )
    .unwrap();
    assert!(!batch.existing);
    assert_eq!(batch.invoice_count, 2);

    let rendered = render_export_file(
        &core,
        &ctx("render-0000001"),
        RenderBatchInput { batch_id: batch.batch_id.clone() },
    )
    .unwrap();
    assert_eq!(rendered.record_count, 2);
    assert_eq!(rendered.control_total_cents, Cents::new(125_000));

    // Re-render (new key) returns the stored artifact reference.
    let again = render_export_file(
        &core,
        &ctx("render-0000002"),
        RenderBatchInput { batch_id: batch.batch_id.clone() },
    )
    .unwrap();
    assert_eq!(again.sha256, rendered.sha256);
    assert_eq!(count_events(&core, "OASIS_EXPORT_FILE_RENDERED"), 1);

    // The artifact bytes are well-formed OASIS records.
    let artifact = queries::artifact(core.db(), &rendered.sha256).unwrap().unwrap();
    let text = String::from_utf8(artifact.content).unwrap();
    assert!(text.ends_with("\r\n"));
    for line in text.trim_end_matches("\r\n").split("\r\n") {
        assert_eq!(line.len(), 100);
    }

    // Identical (cycle, period, watermark) selection returns the same batch.
    let replay = generate_export_batch(
        &core,
        &ctx("gen-batch-0002"),
        GenerateBatchInput {
            cycle_id: CycleId::new(CYCLE),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
            watermark: batch_selection_watermark(&core, &batch.batch_id),
        },
    )
    .unwrap();
    assert!(replay.existing);
    assert_eq!(replay.batch_id, batch.batch_id);
}

fn batch_selection_watermark(core: &Core, batch_id: &wvsnp_backend::domain::ids::BatchId) -> Watermark {
    let events = queries::events_since(core.db(), Watermark::zero(), u32::MAX).unwrap();
    let created = events
        .iter()
        .find(|ev| ev.event_type == "OASIS_EXPORT_BATCH_CREATED" && ev.aggregate_id == batch_id.as_str())
        .unwrap();
    serde_json::from_value(created.event_data["watermark"].clone()).unwrap()
}

/// S4: voiding a batch releases its invoices for a new batch.
#[test]
fn void_batch_releases_invoices() {
    let core = Core::in_memory().unwrap();
    let invoice_ids = seed_two_submitted_invoices(&core);

    let batch = generate_export_batch(
        &core,
        &ctx("gen-batch-0001"),
        GenerateBatchInput {
            cycle_id: CycleId::new(CYCLE),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
            watermark: latest_watermark(&core),
        },
    )
    .unwrap();

    let voided = void_batch(
        &core,
        &ctx("void-batch-001"),
        BatchLifecycleInput { batch_id: batch.batch_id.clone(), reason: "operator".into() },
    )
    .unwrap();
    assert_eq!(voided.released_invoices, 2);

    let detail = queries::batch_detail(core.db(), batch.batch_id.as_str()).unwrap().unwrap();
    assert_eq!(detail.status, "VOIDED");
    for invoice_id in &invoice_ids {
        let rows = queries::invoices_by_cycle(core.db(), &CycleId::new(CYCLE), None).unwrap();
        let row = rows.iter().find(|r| r.invoice_id == *invoice_id.as_str()).unwrap();
        assert!(row.batch_id.is_none(), "void cleared the batch reference");
    }

    // Released invoices are eligible again at a newer watermark.
    let second = generate_export_batch(
        &core,
        &ctx("gen-batch-0002"),
        GenerateBatchInput {
            cycle_id: CycleId::new(CYCLE),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
            watermark: latest_watermark(&core),
        },
    )
    .unwrap();
    assert!(!second.existing);
    assert_eq!(second.invoice_count, 2);
}

/// S5 + S6: full cycle to CLOSED, reconciliation arithmetic, and the
/// post-close gate.
#[test]
fn closeout_flow_and_post_close_gate() {
    let core = Core::in_memory().unwrap();
    seed_grant(&core, 100_000, 0);
    seed_clinic(&core, "clinic-1", date(2027, 12, 31), "VENDOR001");
    let voucher = seed_voucher(&core, "issue-close-001", 50_000, false);

    let claim = submit(&core, "claim-close-001", claim_input(&voucher.voucher_id, "clinic-1", 50_000));
    approve(&core, "approve-close-1", &claim.claim_id);

    let generated = generate_invoices(
        &core,
        &ctx("gen-inv-close1"),
        GenerateInvoicesInput {
            cycle_id: CycleId::new(CYCLE),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
        },
    )
    .unwrap();
    let invoice_id = generated.invoices[0].invoice_id.clone();
    submit_invoice(&core, &ctx("submit-inv-cl1"), SubmitInvoiceInput { invoice_id: invoice_id.clone() })
        .unwrap();

    let batch = generate_export_batch(
        &core,
        &ctx("gen-batch-cls1"),
        GenerateBatchInput {
            cycle_id: CycleId::new(CYCLE),
            period_start: date(2026, 1, 1),
            period_end: date(2026, 1, 31),
            watermark: latest_watermark(&core),
        },
    )
    .unwrap();
    render_export_file(&core, &ctx("render-close-1"), RenderBatchInput {
        batch_id: batch.batch_id.clone(),
    })
    .unwrap();
    submit_batch(&core, &ctx("submit-bat-cl1"), BatchLifecycleInput {
        batch_id: batch.batch_id.clone(),
        reason: String::new(),
    })
    .unwrap();
    acknowledge_batch(&core, &ctx("ack-batch-cls1"), BatchLifecycleInput {
        batch_id: batch.batch_id.clone(),
        reason: String::new(),
    })
    .unwrap();
    record_payment(&core, &ctx("pay-invoice-01"), RecordPaymentInput {
        invoice_id: invoice_id.clone(),
        amount_cents: Cents::new(50_000),
        reference: "treasury-001".into(),
        paid_at: None,
    })
    .unwrap();

    let preflight =
        run_preflight(&core, &ctx("preflight-0001"), CycleInput { cycle_id: CycleId::new(CYCLE) })
            .unwrap();
    assert!(preflight.passed, "failed checks: {:?}", preflight.checks);

    start_closeout(&core, &ctx("start-close-01"), CycleInput { cycle_id: CycleId::new(CYCLE) })
        .unwrap();
    let reconciled = reconcile_closeout(
        &core,
        &ctx("reconcile-0001"),
        ReconcileInput { cycle_id: CycleId::new(CYCLE), watermark: None },
    )
    .unwrap();

    // S5 arithmetic: awarded = liquidated + released + unspent.
    assert_eq!(reconciled.financial.awarded_cents, Cents::new(100_000));
    assert_eq!(reconciled.financial.liquidated_cents, Cents::new(50_000));
    assert_eq!(reconciled.financial.released_cents, Cents::new(0));
    assert_eq!(reconciled.financial.unspent_cents, Cents::new(50_000));

    let closed =
        close_cycle(&core, &ctx("close-cycle-01"), CycleInput { cycle_id: CycleId::new(CYCLE) })
            .unwrap();
    assert_eq!(closed.final_balance_cents, Cents::new(50_000));

    // S6: blocked set rejects, allow-list still works.
    let voucher2 = wvsnp_backend::commands::vouchers::issue_voucher(
        &core,
        &ctx("issue-postclose"),
        wvsnp_backend::commands::vouchers::IssueVoucherInput {
            grant_id: wvsnp_backend::domain::ids::GrantId::new(GRANT),
            county: "KANAWHA".into(),
            is_lirp: false,
            max_reimbursement_cents: Cents::new(10_000),
            valid_until: date(2026, 12, 31),
            tentative_hold_hours: None,
        },
    );
    assert_eq!(voucher2.unwrap_err().code(), "GRANT_CYCLE_CLOSED");

    let err = submit_claim(
        &core,
        &ctx("post-close-clm1"),
        claim_input(&voucher.voucher_id, "clinic-1", 10_000),
    )
    .unwrap_err();
    assert_eq!(err.code(), "GRANT_CYCLE_CLOSED");

    // Payments are on the post-close allow-list.
    record_payment(&core, &ctx("pay-post-close"), RecordPaymentInput {
        invoice_id,
        amount_cents: Cents::new(1),
        reference: "late-remit".into(),
        paid_at: None,
    })
    .unwrap();

    let closeout = queries::closeout_status(core.db(), &CycleId::new(CYCLE)).unwrap().unwrap();
    assert_eq!(closeout.status, "CLOSED");
    assert_eq!(closeout.final_balance_cents, Some(50_000));
}
