//! Voucher-code allocator.
//!
//! One counter per (cycle, county). The allocator has no events of its own:
//! its state is derived from voucher issuance events, which carry the minted
//! sequence number, so replay reproduces the counter exactly.

use crate::domain::event::{self, Event};
use crate::domain::ids::CycleId;
use crate::domain::voucher::VoucherIssuedData;
use crate::errors::CoreResult;
use serde::{Deserialize, Serialize};

/// Aggregate id for an allocator row: `{cycle}:{COUNTY}`.
pub fn allocator_key(cycle_id: &CycleId, county: &str) -> String {
    format!("{}:{}", cycle_id.as_str(), county.to_ascii_uppercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorState {
    pub cycle_id: CycleId,
    pub county: String,
    /// Sequence the next voucher in this (cycle, county) will take.
    pub next_sequence: i64,
}

impl AllocatorState {
    pub fn empty(cycle_id: CycleId, county: &str) -> Self {
        Self {
            cycle_id,
            county: county.to_ascii_uppercase(),
            next_sequence: 1,
        }
    }

    /// Folds voucher issuance events for this (cycle, county).
    pub fn apply(&mut self, ev: &Event) -> CoreResult<()> {
        match ev.event_type.as_str() {
            event::VOUCHER_ISSUED | event::VOUCHER_ISSUED_TENTATIVE => {
                let data: VoucherIssuedData = serde_json::from_value(ev.event_data.clone())?;
                if ev.cycle_id == self.cycle_id
                    && data.county.eq_ignore_ascii_case(&self.county)
                    && data.sequence >= self.next_sequence
                {
                    self.next_sequence = data.sequence + 1;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
