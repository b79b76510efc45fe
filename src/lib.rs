//! WVSNP Grant-Management Transactional Core
//!
//! Event-sourced write/read kernel for the spay/neuter grant program:
//! append-only event log, idempotent command handlers over bucketed grant
//! balances, deterministic projection rebuild, byte-stable OASIS treasury
//! export rendering, and cycle closeout with reconciliation invariants.
//!
//! Transport, authentication and schema provisioning live outside this
//! crate; it exposes command functions ([`commands`]), read-only queries
//! ([`queries`]), background sweeps ([`sweeps`]) and the pure domain model
//! ([`domain`]).

pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod oasis;
pub mod projections;
pub mod queries;
pub mod store;
pub mod sweeps;

pub use commands::{CommandContext, Core};
pub use config::Config;
pub use errors::{CoreError, CoreResult};

// Re-export the envelope types callers handle constantly.
pub use domain::{ActorKind, Cents, EventId, Watermark};
