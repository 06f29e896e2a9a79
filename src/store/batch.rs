//! Staged insert batches.
//!
//! External inserts are accepted between steps but must not be visible to
//! rules until the next step begins. A batch is validated as a whole when it
//! is staged (schema, key, seal checks against committed *and* already
//! staged rows) and applied verbatim when the step admits it.

use std::collections::HashMap;

use crate::id::RelId;
use crate::value::Tuple;

/// One accepted insert batch
#[derive(Debug, Clone)]
pub struct InsertBatch {
    pub rel: RelId,
    pub rows: Vec<Tuple>,
}

/// Batches waiting for the next step, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct StagedInserts {
    batches: Vec<InsertBatch>,
}

impl StagedInserts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, batch: InsertBatch) {
        self.batches.push(batch);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of staged rows across all batches
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.rows.len()).sum()
    }

    /// Latest staged row per key for one relation, for validating the next
    /// batch against what is already queued.
    pub fn rows_by_key(&self, rel: RelId, key_arity: usize) -> HashMap<Tuple, &Tuple> {
        self.batches
            .iter()
            .filter(|b| b.rel == rel)
            .flat_map(|b| b.rows.iter())
            .map(|row| (row[..key_arity].to_vec(), row))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<InsertBatch> {
        std::mem::take(&mut self.batches)
    }
}
