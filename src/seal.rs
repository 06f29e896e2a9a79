//! Seal marks: monotone completeness facts about relations.
//!
//! A seal mark states that no further rows will ever be inserted into a
//! relation, either globally or for one partition (the rows whose values on
//! some columns equal given values, e.g. `epoch = 1`). A partition is
//! *closed* once a mark exists for it or for any coarser partition: a mark
//! on `epoch = 1` also closes `epoch = 1, node = "foo"`, and the global mark
//! closes everything. Marks are only ever added.
//!
//! Like inserts, marks arrive between steps and are staged; they become
//! visible when the next step admits them.

use std::collections::{BTreeSet, HashMap};

use crate::core::Schema;
use crate::id::{ColId, RelId};
use crate::value::Value;

/// Identifies the partition a seal mark closes.
///
/// Column/value pairs are kept sorted by column so the same partition always
/// has the same key. No columns means the global partition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SealKey {
    columns: Vec<ColId>,
    values: Vec<Value>,
}

impl SealKey {
    /// The mark that closes a relation as a whole
    pub fn global() -> Self {
        Self {
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn partition(pairs: impl IntoIterator<Item = (ColId, Value)>) -> Self {
        let mut pairs: Vec<(ColId, Value)> = pairs.into_iter().collect();
        pairs.sort();
        pairs.dedup_by(|a, b| a.0 == b.0);
        let (columns, values) = pairs.into_iter().unzip();
        Self { columns, values }
    }

    /// Partition of `row` over `columns`
    pub fn of_row(columns: &[ColId], row: &[Value]) -> Self {
        Self::partition(columns.iter().map(|&c| (c, row[c].clone())))
    }

    pub fn is_global(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColId] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Does `row` fall into this partition?
    pub fn covers(&self, row: &[Value]) -> bool {
        self.columns
            .iter()
            .zip(&self.values)
            .all(|(&c, v)| row.get(c) == Some(v))
    }

    /// Is every row of `other`'s partition also in this one? Holds when each
    /// column/value pair of `self` appears in `other`.
    pub fn encloses(&self, other: &SealKey) -> bool {
        self.columns.iter().zip(&self.values).all(|(c, v)| {
            other
                .columns
                .iter()
                .zip(&other.values)
                .any(|(oc, ov)| oc == c && ov == v)
        })
    }

    /// Human-readable form using the relation's column names
    pub fn describe(&self, schema: &Schema) -> String {
        if self.is_global() {
            return "*".to_string();
        }
        let parts: Vec<String> = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(&c, v)| {
                let name = schema.columns.get(c).map(|col| col.name.as_str()).unwrap_or("?");
                format!("{}={}", name, v)
            })
            .collect();
        parts.join(",")
    }
}

/// Tracks committed and staged seal marks per relation.
#[derive(Clone, Debug, Default)]
pub struct SealTracker {
    marks: HashMap<RelId, BTreeSet<SealKey>>,
    staged: Vec<(RelId, SealKey)>,
}

impl SealTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mark immediately. Returns false if it already existed.
    pub fn seal(&mut self, rel: RelId, key: SealKey) -> bool {
        self.marks.entry(rel).or_default().insert(key)
    }

    /// Queue a mark for the next step.
    pub fn stage(&mut self, rel: RelId, key: SealKey) {
        self.staged.push((rel, key));
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Make staged marks visible. Returns how many were new.
    pub fn admit(&mut self) -> usize {
        let staged = std::mem::take(&mut self.staged);
        staged
            .into_iter()
            .filter(|(rel, key)| self.seal(*rel, key.clone()))
            .count()
    }

    /// Is the partition of `rel` given by `key` closed by an admitted mark
    /// on it or on a coarser partition?
    pub fn is_closed(&self, rel: RelId, key: &SealKey) -> bool {
        self.marks
            .get(&rel)
            .is_some_and(|marks| marks.iter().any(|mark| mark.encloses(key)))
    }

    /// Is `rel` closed as a whole?
    pub fn is_globally_closed(&self, rel: RelId) -> bool {
        self.is_closed(rel, &SealKey::global())
    }

    /// First mark, committed or staged, whose partition contains `row`.
    pub fn covering(&self, rel: RelId, row: &[Value]) -> Option<&SealKey> {
        let committed = self.marks.get(&rel).into_iter().flatten();
        let staged = self
            .staged
            .iter()
            .filter(move |(r, _)| *r == rel)
            .map(|(_, key)| key);
        committed.chain(staged).find(|key| key.covers(row))
    }

    /// Committed marks of a relation
    pub fn marks(&self, rel: RelId) -> impl Iterator<Item = &SealKey> {
        self.marks.get(&rel).into_iter().flatten()
    }

    /// Total number of committed marks
    pub fn len(&self) -> usize {
        self.marks.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_is_idempotent() {
        let mut seals = SealTracker::new();
        let key = SealKey::partition([(1, Value::Int(1))]);
        assert!(seals.seal(0, key.clone()));
        assert!(!seals.seal(0, key.clone()));
        assert_eq!(seals.len(), 1);
        assert!(seals.is_closed(0, &key));
        assert!(!seals.is_closed(0, &SealKey::partition([(1, Value::Int(2))])));
        assert!(!seals.is_closed(1, &key));
    }

    #[test]
    fn test_global_mark_closes_all_partitions() {
        let mut seals = SealTracker::new();
        seals.seal(3, SealKey::global());
        assert!(seals.is_closed(3, &SealKey::partition([(0, Value::from("any"))])));
        assert!(seals.is_globally_closed(3));
    }

    #[test]
    fn test_coarser_mark_closes_finer_partition() {
        let epoch_1 = SealKey::partition([(1, Value::Int(1))]);
        let finer = SealKey::partition([(0, Value::from("foo")), (1, Value::Int(1))]);
        assert!(epoch_1.encloses(&finer));
        assert!(!finer.encloses(&epoch_1));
        assert!(SealKey::global().encloses(&finer));
        assert!(!SealKey::partition([(1, Value::Int(2))]).encloses(&finer));

        let mut tracker = SealTracker::new();
        tracker.seal(0, SealKey::partition([(1, Value::Int(1))]));
        assert!(tracker.is_closed(0, &finer));
        assert!(!tracker.is_closed(0, &SealKey::global()));
        assert!(!tracker.is_closed(
            0,
            &SealKey::partition([(0, Value::from("foo")), (1, Value::Int(2))])
        ));
    }

    #[test]
    fn test_staged_marks_invisible_until_admitted() {
        let mut seals = SealTracker::new();
        seals.stage(0, SealKey::global());
        seals.stage(0, SealKey::global());
        assert!(!seals.is_globally_closed(0));
        // staged marks still guard inserts
        assert!(seals.covering(0, &[Value::Int(1)]).is_some());
        assert_eq!(seals.admit(), 1);
        assert!(seals.is_globally_closed(0));
        assert!(!seals.has_staged());
    }

    #[test]
    fn test_partition_key_normalized() {
        let a = SealKey::partition([(2, Value::Int(1)), (0, Value::from("x"))]);
        let b = SealKey::partition([(0, Value::from("x")), (2, Value::Int(1))]);
        assert_eq!(a, b);
        assert!(a.covers(&[Value::from("x"), Value::Int(9), Value::Int(1)]));
        assert!(!a.covers(&[Value::from("y"), Value::Int(9), Value::Int(1)]));
        assert_eq!(SealKey::of_row(&[2, 0], &[Value::from("x"), Value::Int(9), Value::Int(1)]), a);
    }
}
