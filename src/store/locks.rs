//! Fixed-order aggregate lock table.
//!
//! All handlers that need multiple aggregate locks acquire them through this
//! table, which sorts requests into the global total order first:
//!
//! `Voucher -> Grant GENERAL -> Grant LIRP -> Allocator -> Clinic -> Claim ->
//!  Invoice -> OasisBatch -> Closeout`, id-ascending within a kind.
//!
//! Sorting before acquisition is the only deadlock-freedom mechanism; ad-hoc
//! locking elsewhere is forbidden.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Lock kinds in the global acquisition order. The discriminant IS the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKind {
    Voucher = 0,
    GrantGeneral = 1,
    GrantLirp = 2,
    Allocator = 3,
    Clinic = 4,
    Claim = 5,
    Invoice = 6,
    OasisBatch = 7,
    Closeout = 8,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    pub kind: LockKind,
    pub id: String,
}

impl LockKey {
    pub fn new(kind: LockKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

/// In-process lock table keyed by (kind, aggregate id).
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key, blocking until all are available. Keys are sorted
    /// and deduplicated first, so two commands touching the same aggregates
    /// in different call orders still lock in the same global order.
    pub fn acquire(&self, mut keys: Vec<LockKey>) -> LockSetGuard<'_> {
        keys.sort();
        keys.dedup();
        let mut held = self.held.lock();
        for key in &keys {
            while held.contains(key) {
                self.released.wait(&mut held);
            }
            held.insert(key.clone());
        }
        drop(held);
        LockSetGuard { table: self, keys }
    }
}

/// Releases all keys on drop.
pub struct LockSetGuard<'a> {
    table: &'a LockTable,
    keys: Vec<LockKey>,
}

impl LockSetGuard<'_> {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for LockSetGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.table.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn keys_sort_into_the_global_order() {
        let table = LockTable::new();
        let guard = table.acquire(vec![
            LockKey::new(LockKind::Closeout, "FY2026"),
            LockKey::new(LockKind::Voucher, "vch_b"),
            LockKey::new(LockKind::Voucher, "vch_a"),
            LockKey::new(LockKind::GrantGeneral, "grant-1"),
        ]);
        let kinds: Vec<_> = guard.keys().iter().map(|k| (k.kind, k.id.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                (LockKind::Voucher, "vch_a".to_string()),
                (LockKind::Voucher, "vch_b".to_string()),
                (LockKind::GrantGeneral, "grant-1".to_string()),
                (LockKind::Closeout, "FY2026".to_string()),
            ]
        );
    }

    #[test]
    fn duplicate_keys_collapse() {
        let table = LockTable::new();
        let guard = table.acquire(vec![
            LockKey::new(LockKind::Claim, "clm_1"),
            LockKey::new(LockKind::Claim, "clm_1"),
        ]);
        assert_eq!(guard.keys().len(), 1);
    }

    /// Two threads lock the same two aggregates, requested in opposite call
    /// orders. Without the sort this interleaving deadlocks.
    #[test]
    fn opposite_call_orders_do_not_deadlock() {
        let table = Arc::new(LockTable::new());
        let mut handles = Vec::new();
        for flip in [false, true] {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let keys = if flip {
                        vec![
                            LockKey::new(LockKind::Invoice, "inv_1"),
                            LockKey::new(LockKind::Claim, "clm_1"),
                        ]
                    } else {
                        vec![
                            LockKey::new(LockKind::Claim, "clm_1"),
                            LockKey::new(LockKind::Invoice, "inv_1"),
                        ]
                    };
                    let _guard = table.acquire(keys);
                    std::thread::sleep(Duration::from_micros(50));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("no deadlock, no panic");
        }
    }
}
