//! Step-boundary mutation of persistent relations.
//!
//! A step commits in a fixed order: derived inserts first, then RSE
//! deletions. Derived rows are screened one by one before anything is
//! applied. A row that cannot be committed (wrong shape, inside a sealed
//! partition, or contending for a key under `Reject`) is dropped and logged;
//! the rest of the step commits normally.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::config::KeyConflictPolicy;
use crate::core::Catalog;
use crate::id::RelId;
use crate::query::backend::TupleSet;
use crate::seal::SealTracker;
use crate::value::{display_tuple, Tuple, Value};

use super::{RelationStorage, Store};

impl Store {
    /// Split derived inserts into rows that can be committed and a count of
    /// dropped rows per relation.
    ///
    /// Under `Reject` a key contended by two new rows drops both: neither
    /// has a better claim than the other.
    pub fn screen_derived(
        &self,
        catalog: &Catalog,
        seals: &SealTracker,
        inserts: Vec<(RelId, TupleSet)>,
        policy: impl Fn(RelId) -> KeyConflictPolicy,
    ) -> (Vec<(RelId, TupleSet)>, BTreeMap<RelId, usize>) {
        let mut accepted = Vec::new();
        let mut dropped = BTreeMap::new();

        for (rel, rows) in inserts {
            let sym = catalog.symbol(rel);
            let Some(relation) = self.relation(rel) else {
                continue;
            };
            let reject_conflicts = policy(rel) == KeyConflictPolicy::Reject;
            let refuse = |row: &[Value], reason: &str| {
                warn!(relation = %sym.name, row = %display_tuple(row), reason, "derived row dropped");
            };

            let mut claims: HashMap<&[Value], usize> = HashMap::new();
            if reject_conflicts {
                for row in rows.iter().filter(|row| !relation.contains(row)) {
                    *claims.entry(relation.key_of(row)).or_insert(0) += 1;
                }
            }

            let mut keep = TupleSet::new();
            let mut refused = 0;
            for row in &rows {
                if let Err(err) = sym.schema.check(&sym.name, row) {
                    refuse(row, &err.to_string());
                    refused += 1;
                    continue;
                }
                if relation.contains(row) {
                    continue;
                }
                if let Some(mark) = seals.covering(rel, row) {
                    refuse(row, &format!("partition {} is sealed", mark.describe(&sym.schema)));
                    refused += 1;
                    continue;
                }
                if reject_conflicts {
                    let key = relation.key_of(row);
                    if let Some(existing) = relation.get_by_key(key) {
                        refuse(row, &format!("key bound to {}", display_tuple(existing)));
                        refused += 1;
                        continue;
                    }
                    if claims.get(key).copied().unwrap_or(0) > 1 {
                        refuse(row, "key derived more than once in this step");
                        refused += 1;
                        continue;
                    }
                }
                keep.insert(row.clone());
            }

            if refused > 0 {
                dropped.insert(rel, refused);
            }
            if !keep.is_empty() {
                accepted.push((rel, keep));
            }
        }
        (accepted, dropped)
    }

    /// Apply derived inserts. Returns rows changed per relation.
    pub fn apply_derived(&mut self, inserts: Vec<(RelId, TupleSet)>) -> BTreeMap<RelId, usize> {
        let mut counts = BTreeMap::new();
        for (rel, rows) in inserts {
            let Some(relation) = self.relation_mut(rel) else {
                continue;
            };
            let changed = rows
                .into_iter()
                .filter(|row| relation.insert(row.clone()).changed())
                .count();
            if changed > 0 {
                *counts.entry(rel).or_insert(0) += changed;
            }
        }
        counts
    }

    /// Remove rows. Returns rows actually removed per relation.
    pub fn apply_deletions(&mut self, deletions: Vec<(RelId, Vec<Tuple>)>) -> BTreeMap<RelId, usize> {
        let mut counts = BTreeMap::new();
        for (rel, rows) in deletions {
            let Some(relation) = self.relation_mut(rel) else {
                continue;
            };
            let removed = rows.iter().filter(|row| relation.remove(row)).count();
            if removed > 0 {
                *counts.entry(rel).or_insert(0) += removed;
            }
        }
        counts
    }
}
