//! Storage layer: SQLite-backed event log, idempotency ledger, artifact
//! store, the aggregate lock table, and the shared database handle.

pub mod artifacts;
pub mod db;
pub mod event_log;
pub mod idempotency;
pub mod locks;

pub use db::{with_retry, Db};
pub use idempotency::Reservation;
pub use locks::{LockKey, LockKind, LockSetGuard, LockTable};
