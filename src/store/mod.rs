//! Persistent relation storage.
//!
//! The store owns one [`KeyedRelation`] per persistent relation plus the
//! staging area for external inserts. Mutation happens only at step
//! boundaries:
//! - staged batches are admitted when a step begins
//! - derived inserts and RSE deletions are applied when a step commits
//!
//! so every rule evaluated inside a step sees one consistent snapshot.
//!
//! # Module structure
//!
//! - [`relation`]: keyed relation storage with slot reclamation
//! - [`batch`]: staged insert batches
//! - [`commit`]: step-boundary application of inserts and deletions

use crate::config::KeyConflictPolicy;
use crate::core::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::id::RelId;
use crate::seal::SealTracker;
use crate::value::{display_tuple, Tuple};

pub mod batch;
pub mod commit;
pub mod relation;

pub use batch::{InsertBatch, StagedInserts};
pub use relation::{InsertOutcome, KeyedRelation, RelationStorage};

// ============================================================================
// STORE
// ============================================================================

/// Committed persistent relations plus staged input.
#[derive(Debug, Clone)]
pub struct Store {
    /// Indexed by RelId; `None` for ephemeral relations
    relations: Vec<Option<KeyedRelation>>,
    staged: StagedInserts,
}

impl Store {
    /// Empty storage for every persistent relation in the catalog
    pub fn new(catalog: &Catalog) -> Self {
        let relations = catalog
            .iter()
            .map(|(_, sym)| {
                sym.is_persistent()
                    .then(|| KeyedRelation::new(sym.schema.arity(), sym.schema.key_arity))
            })
            .collect();
        Self {
            relations,
            staged: StagedInserts::new(),
        }
    }

    /// Committed contents of a persistent relation
    pub fn relation(&self, rel: RelId) -> Option<&KeyedRelation> {
        self.relations.get(rel).and_then(|r| r.as_ref())
    }

    pub(crate) fn relation_mut(&mut self, rel: RelId) -> Option<&mut KeyedRelation> {
        self.relations.get_mut(rel).and_then(|r| r.as_mut())
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn staged_rows(&self) -> usize {
        self.staged.row_count()
    }

    /// Validate a batch and queue it for the next step.
    ///
    /// The batch is rejected as a whole if any row has the wrong shape,
    /// conflicts with a bound key (under [`KeyConflictPolicy::Reject`]) or
    /// would add a row to a sealed partition.
    pub fn stage(
        &mut self,
        catalog: &Catalog,
        seals: &SealTracker,
        rel: RelId,
        rows: Vec<Tuple>,
        policy: KeyConflictPolicy,
    ) -> EngineResult<usize> {
        let sym = catalog.symbol(rel);
        let relation = self
            .relation(rel)
            .ok_or_else(|| EngineError::NotPersistent(sym.name.clone()))?;

        let key_arity = relation.key_arity();
        let mut queued = self.staged.rows_by_key(rel, key_arity);
        for row in &rows {
            sym.schema.check(&sym.name, row)?;

            // An identical live row is a no-op even inside a sealed partition.
            if !relation.contains(row) {
                if let Some(mark) = seals.covering(rel, row) {
                    return Err(EngineError::SealedPartition {
                        relation: sym.name.clone(),
                        row: display_tuple(row),
                        partition: mark.describe(&sym.schema),
                    });
                }
            }

            if policy == KeyConflictPolicy::Reject {
                let key = &row[..key_arity];
                let existing = queued
                    .get(key)
                    .map(|t| t.as_slice())
                    .or_else(|| relation.get_by_key(key));
                if let Some(existing) = existing.filter(|e| *e != row.as_slice()) {
                    return Err(EngineError::KeyConflict {
                        relation: sym.name.clone(),
                        key: display_tuple(key),
                        existing: display_tuple(existing),
                        incoming: display_tuple(row),
                    });
                }
            }
            queued.insert(row[..key_arity].to_vec(), row);
        }

        let count = rows.len();
        self.staged.push(InsertBatch { rel, rows });
        Ok(count)
    }

    /// Apply every staged batch. Returns how many rows changed.
    pub fn admit(&mut self) -> usize {
        let batches = self.staged.drain();
        let mut changed = 0;
        for batch in batches {
            if let Some(relation) = self.relation_mut(batch.rel) {
                for row in batch.rows {
                    if relation.insert(row).changed() {
                        changed += 1;
                    }
                }
            }
        }
        changed
    }
}
