//! Execution ledger
//! The set of support records already executed against the device. Both the push
//! path and the poll path go through `claim`, so a record runs at most once no
//! matter which path sees it first.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::relay::record::RecordId;

#[derive(Debug, Default)]
pub struct ExecutionLedger {
    executed: Mutex<HashSet<RecordId>>,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<RecordId>> {
        self.executed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `id` as executed. Returns `false` if it already was, in which case the
    /// caller must not execute it.
    pub fn claim(&self, id: &RecordId) -> bool {
        self.lock().insert(id.clone())
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
