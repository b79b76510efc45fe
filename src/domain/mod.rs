//! Pure domain model: money, identifiers, the event envelope, and one state
//! machine per aggregate kind.
//!
//! Nothing in this tree touches storage. Every aggregate exposes the same
//! shape: construct empty state, fold events in `(ingested_at, event_id)`
//! order through `apply`, then `check_invariant`. Command handlers call the
//! guard predicates before emitting events; the projection engine calls the
//! same fold to build read rows.

pub mod allocator;
pub mod breeder;
pub mod claim;
pub mod clinic;
pub mod closeout;
pub mod event;
pub mod grant;
pub mod ids;
pub mod invoice;
pub mod money;
pub mod oasis_batch;
pub mod voucher;

pub use event::{AggregateKind, Event, NewEvent, Watermark};
pub use ids::{
    ActorId, ActorKind, BatchId, ClaimId, ClinicId, CorrelationId, CycleId, EventId, EventIdGen,
    FilingId, GrantId, InvoiceId, VoucherId,
};
pub use money::{Cents, RateFraction};
