//! Command handlers.
//!
//! Every command is one transaction with the same skeleton: reserve the
//! idempotency key, acquire aggregate locks in the fixed global order, run
//! pure guards on replayed state, append events, update projections, record
//! the cached response, commit. On error the transaction rolls back and the
//! key is marked FAILED (best effort) so the caller can retry. Transient
//! storage errors are retried with backoff; business errors are not.

pub mod batches;
pub mod breeder;
pub mod claims;
pub mod clinics;
pub mod closeout;
pub mod grants;
pub mod invoices;
pub mod vouchers;

use crate::domain::breeder::FilingState;
use crate::domain::claim::ClaimState;
use crate::domain::clinic::ClinicState;
use crate::domain::closeout::CloseoutState;
use crate::domain::event::{self, AggregateKind, Event, NewEvent};
use crate::domain::grant::GrantState;
use crate::domain::ids::{
    sha256_hex, ActorId, ActorKind, CorrelationId, CycleId, EventId, EventIdGen,
};
use crate::domain::invoice::InvoiceState;
use crate::domain::oasis_batch::BatchState;
use crate::domain::voucher::VoucherState;
use crate::errors::{CoreError, CoreResult};
use crate::projections;
use crate::store::db::{with_retry, Db};
use crate::store::idempotency::{self, Reservation};
use crate::store::locks::LockKey;
use crate::store::event_log;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

/// The transactional core: storage handle plus the process-wide event id
/// generator.
pub struct Core {
    db: Db,
    event_ids: EventIdGen,
}

impl Core {
    pub fn new(db: Db) -> Self {
        Self { db, event_ids: EventIdGen::new() }
    }

    /// In-memory core (for tests).
    pub fn in_memory() -> CoreResult<Self> {
        Ok(Self::new(Db::in_memory()?))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn event_ids(&self) -> &EventIdGen {
        &self.event_ids
    }
}

/// Authenticated envelope every command carries.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub idempotency_key: String,
    pub correlation_id: CorrelationId,
    pub actor_id: ActorId,
    pub actor_kind: ActorKind,
}

impl CommandContext {
    pub fn new(
        idempotency_key: impl Into<String>,
        correlation_id: impl Into<String>,
        actor_id: impl Into<String>,
        actor_kind: ActorKind,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            correlation_id: CorrelationId::new(correlation_id),
            actor_id: ActorId::new(actor_id),
            actor_kind,
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.idempotency_key.trim().len() < 8 {
            return Err(CoreError::MissingIdempotencyKey);
        }
        Ok(())
    }
}

/// Canonical hash of a command's business inputs, scoping the idempotency
/// key to them.
pub fn input_hash(inputs: &impl Serialize) -> CoreResult<String> {
    Ok(sha256_hex(serde_json::to_string(inputs)?.as_bytes()))
}

/// Event emission scope for one command transaction. Enforces the post-close
/// gate and threads causation through the appended chain.
pub struct EventScope<'a> {
    tx: &'a Transaction<'a>,
    event_ids: &'a EventIdGen,
    ctx: &'a CommandContext,
    now_ms: i64,
    appended: Vec<Event>,
}

impl<'a> EventScope<'a> {
    fn new(
        tx: &'a Transaction<'a>,
        event_ids: &'a EventIdGen,
        ctx: &'a CommandContext,
        now_ms: i64,
    ) -> Self {
        Self { tx, event_ids, ctx, now_ms, appended: Vec::new() }
    }

    pub fn now(&self) -> DateTime<Utc> {
        chrono::TimeZone::timestamp_millis_opt(&Utc, self.now_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn last_event_id(&self) -> Option<EventId> {
        self.appended.last().map(|ev| ev.event_id)
    }

    /// Append one event. Closed cycles only accept allow-listed types.
    pub fn emit(
        &mut self,
        kind: AggregateKind,
        aggregate_id: &str,
        cycle_id: &CycleId,
        event_type: &str,
        data: &impl Serialize,
        causation_id: Option<EventId>,
    ) -> CoreResult<Event> {
        self.emit_at(kind, aggregate_id, cycle_id, event_type, data, causation_id, self.now())
    }

    /// Append with explicit business time (`occurred_at`).
    #[allow(clippy::too_many_arguments)]
    pub fn emit_at(
        &mut self,
        kind: AggregateKind,
        aggregate_id: &str,
        cycle_id: &CycleId,
        event_type: &str,
        data: &impl Serialize,
        causation_id: Option<EventId>,
        occurred_at: DateTime<Utc>,
    ) -> CoreResult<Event> {
        ensure_cycle_open(self.tx, cycle_id, event_type)?;
        let new_event = NewEvent {
            event_id: self.event_ids.next(self.now_ms),
            aggregate_kind: kind,
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            event_data: serde_json::to_value(data)?,
            occurred_at,
            cycle_id: cycle_id.clone(),
            correlation_id: self.ctx.correlation_id.clone(),
            causation_id,
            actor_id: self.ctx.actor_id.clone(),
            actor_kind: self.ctx.actor_kind,
        };
        let committed = event_log::append(self.tx, &new_event)?;
        self.appended.push(committed.clone());
        Ok(committed)
    }
}

/// Reject writes on closed cycles unless the event type is allow-listed.
pub fn ensure_cycle_open(
    conn: &Connection,
    cycle_id: &CycleId,
    event_type: &str,
) -> CoreResult<()> {
    if event::POST_CLOSE_ALLOWED.contains(&event_type) {
        return Ok(());
    }
    if event_log::cycle_is_closed(conn, cycle_id)? {
        return Err(CoreError::GrantCycleClosed { cycle_id: cycle_id.to_string() });
    }
    Ok(())
}

enum Outcome<T> {
    Fresh(T),
    Cached(T),
}

/// Run one command through the shared skeleton.
pub(crate) fn execute<T, F>(
    core: &Core,
    ctx: &CommandContext,
    operation_kind: &str,
    input_hash: &str,
    lock_keys: Vec<LockKey>,
    body: F,
) -> CoreResult<T>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&Transaction, &mut EventScope) -> CoreResult<T>,
{
    ctx.validate()?;
    let config = core.db.config().clone();
    let result = with_retry(&config, || {
        // Locks first, in sorted global order; then the storage transaction.
        let _locks = core.db.locks().acquire(lock_keys.clone());
        let now_ms = Utc::now().timestamp_millis();
        let outcome = core.db.with_tx(|tx| {
            let reservation = idempotency::check_and_reserve(
                tx,
                &ctx.idempotency_key,
                operation_kind,
                input_hash,
                config.idempotency_ttl,
                now_ms,
            )?;
            if let Reservation::Completed(cached) = reservation {
                let value: T = serde_json::from_value(cached)?;
                return Ok(Outcome::Cached(value));
            }
            let mut scope = EventScope::new(tx, &core.event_ids, ctx, now_ms);
            let value = body(tx, &mut scope)?;
            projections::project_events(tx, &scope.appended, now_ms)?;
            let response = serde_json::to_value(&value)?;
            idempotency::record_result(tx, &ctx.idempotency_key, &response)?;
            Ok(Outcome::Fresh(value))
        });
        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_invariant() {
                    error!(
                        op = operation_kind,
                        key = %ctx.idempotency_key,
                        correlation = %ctx.correlation_id,
                        "invariant violation: {}",
                        e
                    );
                }
                let key_conflict = matches!(
                    e,
                    CoreError::OperationInProgress { .. }
                        | CoreError::IdempotencyKeyReused { .. }
                        | CoreError::MissingIdempotencyKey
                );
                if !e.is_transient() && !key_conflict {
                    // Best effort: free the key for retries, preserve the
                    // original error if this secondary write fails too.
                    if let Err(mark_err) = core
                        .db
                        .with_tx(|tx| idempotency::record_failure(tx, &ctx.idempotency_key))
                    {
                        warn!(
                            op = operation_kind,
                            "failed to mark idempotency key FAILED: {}", mark_err
                        );
                    }
                }
                Err(e)
            }
        }
    });
    match &result {
        Ok(Outcome::Fresh(_)) => {
            metrics::increment_counter!("wvsnp_commands_total",
                "op" => operation_kind.to_string(), "outcome" => "ok");
        }
        Ok(Outcome::Cached(_)) => {
            metrics::increment_counter!("wvsnp_commands_total",
                "op" => operation_kind.to_string(), "outcome" => "cached");
        }
        Err(_) => {
            metrics::increment_counter!("wvsnp_commands_total",
                "op" => operation_kind.to_string(), "outcome" => "error");
        }
    }
    result.map(|outcome| match outcome {
        Outcome::Fresh(v) | Outcome::Cached(v) => v,
    })
}

// ===========================================================================
// AGGREGATE LOADING (replay-backed, inside the command transaction)
// ===========================================================================

fn fold_events<S>(
    conn: &Connection,
    kind: AggregateKind,
    aggregate_id: &str,
    mut state: S,
    mut apply: impl FnMut(&mut S, &Event) -> CoreResult<()>,
) -> CoreResult<Option<S>> {
    let events = event_log::fetch_aggregate(conn, kind, aggregate_id)?;
    if events.is_empty() {
        return Ok(None);
    }
    for ev in &events {
        apply(&mut state, ev)?;
    }
    Ok(Some(state))
}

pub(crate) fn load_grant(conn: &Connection, grant_id: &str) -> CoreResult<GrantState> {
    fold_events(
        conn,
        AggregateKind::Grant,
        grant_id,
        GrantState::empty(crate::domain::ids::GrantId::new(grant_id)),
        |s, ev| s.apply(ev),
    )?
    .ok_or_else(|| CoreError::GrantNotFound { grant_id: grant_id.to_string() })
}

pub(crate) fn load_voucher(conn: &Connection, voucher_id: &str) -> CoreResult<VoucherState> {
    fold_events(
        conn,
        AggregateKind::Voucher,
        voucher_id,
        VoucherState::empty(crate::domain::ids::VoucherId::new(voucher_id)),
        |s, ev| s.apply(ev),
    )?
    .ok_or_else(|| CoreError::VoucherNotFound { voucher_id: voucher_id.to_string() })
}

pub(crate) fn load_clinic(conn: &Connection, clinic_id: &str) -> CoreResult<ClinicState> {
    fold_events(
        conn,
        AggregateKind::Clinic,
        clinic_id,
        ClinicState::empty(crate::domain::ids::ClinicId::new(clinic_id)),
        |s, ev| s.apply(ev),
    )?
    .ok_or_else(|| CoreError::ClinicNotFound { clinic_id: clinic_id.to_string() })
}

pub(crate) fn load_claim(conn: &Connection, claim_id: &str) -> CoreResult<ClaimState> {
    fold_events(
        conn,
        AggregateKind::Claim,
        claim_id,
        ClaimState::empty(crate::domain::ids::ClaimId::new(claim_id)),
        |s, ev| s.apply(ev),
    )?
    .ok_or_else(|| CoreError::ClaimNotFound { claim_id: claim_id.to_string() })
}

pub(crate) fn load_invoice(conn: &Connection, invoice_id: &str) -> CoreResult<InvoiceState> {
    fold_events(
        conn,
        AggregateKind::Invoice,
        invoice_id,
        InvoiceState::empty(crate::domain::ids::InvoiceId::new(invoice_id)),
        |s, ev| s.apply(ev),
    )?
    .ok_or_else(|| CoreError::InvoiceNotFound { invoice_id: invoice_id.to_string() })
}

pub(crate) fn load_batch(conn: &Connection, batch_id: &str) -> CoreResult<BatchState> {
    fold_events(
        conn,
        AggregateKind::OasisBatch,
        batch_id,
        BatchState::empty(crate::domain::ids::BatchId::new(batch_id)),
        |s, ev| s.apply(ev),
    )?
    .ok_or_else(|| CoreError::BatchNotFound { batch_id: batch_id.to_string() })
}

/// Closeout state starts NOT_STARTED when no events exist yet.
pub(crate) fn load_closeout(conn: &Connection, cycle_id: &CycleId) -> CoreResult<CloseoutState> {
    Ok(fold_events(
        conn,
        AggregateKind::Closeout,
        cycle_id.as_str(),
        CloseoutState::empty(cycle_id.clone()),
        |s, ev| s.apply(ev),
    )?
    .unwrap_or_else(|| CloseoutState::empty(cycle_id.clone())))
}

pub(crate) fn load_filing(conn: &Connection, filing_id: &str) -> CoreResult<FilingState> {
    fold_events(
        conn,
        AggregateKind::BreederFiling,
        filing_id,
        FilingState::empty(crate::domain::ids::FilingId::new(filing_id)),
        |s, ev| s.apply(ev),
    )?
    .ok_or_else(|| CoreError::FilingNotFound { filing_id: filing_id.to_string() })
}

/// Next allocator sequence for (cycle, county), from the projection row.
pub(crate) fn allocator_next_sequence(
    conn: &Connection,
    cycle_id: &CycleId,
    county: &str,
) -> CoreResult<i64> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT next_sequence FROM allocators WHERE cycle_id = ?1 AND county = ?2",
            params![cycle_id.as_str(), county.to_ascii_uppercase()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seq.unwrap_or(1))
}
