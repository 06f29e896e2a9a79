//! Keyed relation storage.
//!
//! Rows live in a slotted tuple log; a roaring bitmap tracks which slots
//! currently hold a row. Deleting a row frees its slot immediately, and once
//! more than half the log is free slots the log is compacted, so storage
//! stays proportional to the live extent however many rows pass through.
//!
//! On top of the log sits a key index over live rows. The key is the first
//! `key_arity` columns of the schema, or the whole row when no key was
//! declared; either way at most one live row exists per key.

use std::collections::HashMap;

use roaring::RoaringTreemap;

use crate::id::TupleId;
use crate::value::{Tuple, Value};

/// Free slots tolerated before compaction is considered
const COMPACT_MIN_FREE: usize = 32;

/// Trait for relation storage implementations.
pub trait RelationStorage {
    /// Check if a tuple is in the relation
    fn contains(&self, tuple: &[Value]) -> bool;

    /// Insert a tuple, replacing any live row bound to the same key
    fn insert(&mut self, tuple: Tuple) -> InsertOutcome;

    /// Remove a tuple, returns true if it was present
    fn remove(&mut self, tuple: &[Value]) -> bool;

    /// Number of tuples currently in the relation
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arity of tuples in this relation
    fn arity(&self) -> usize;
}

/// Result of inserting a row into a keyed relation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was unbound; the row is new
    Inserted,
    /// The identical row was already present
    Unchanged,
    /// The key was bound to a different row, which has been removed
    Replaced { previous: Tuple },
}

impl InsertOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, InsertOutcome::Unchanged)
    }
}

/// Slotted tuple log with membership bitmap and key index.
#[derive(Clone, Debug)]
pub struct KeyedRelation {
    arity: usize,
    /// Number of leading columns forming the key (== arity when unkeyed)
    key_arity: usize,
    /// Tuple log in insertion order; `None` is a freed slot
    slots: Vec<Option<Tuple>>,
    /// Map from live tuple to its slot
    tuple_to_id: HashMap<Tuple, TupleId>,
    /// Map from key to the slot of the live tuple bound to it
    key_to_id: HashMap<Tuple, TupleId>,
    /// Bitmap of occupied slots
    extent: RoaringTreemap,
}

impl KeyedRelation {
    /// Create an empty relation. A `key_arity` of zero means the whole row
    /// is the key.
    pub fn new(arity: usize, key_arity: usize) -> Self {
        let key_arity = if key_arity == 0 { arity } else { key_arity.min(arity) };
        Self {
            arity,
            key_arity,
            slots: Vec::new(),
            tuple_to_id: HashMap::new(),
            key_to_id: HashMap::new(),
            extent: RoaringTreemap::new(),
        }
    }

    pub fn key_arity(&self) -> usize {
        self.key_arity
    }

    /// Key columns of a row
    pub fn key_of<'a>(&self, tuple: &'a [Value]) -> &'a [Value] {
        &tuple[..self.key_arity.min(tuple.len())]
    }

    /// Live row bound to `key`, if any
    pub fn get_by_key(&self, key: &[Value]) -> Option<&[Value]> {
        self.key_to_id
            .get(key)
            .and_then(|&id| self.get_tuple(id))
    }

    /// The live row that `tuple` would displace: same key, different content.
    pub fn conflicting(&self, tuple: &[Value]) -> Option<&[Value]> {
        self.get_by_key(self.key_of(tuple))
            .filter(|existing| *existing != tuple)
    }

    /// Live tuple stored in slot `id`
    pub fn get_tuple(&self, id: TupleId) -> Option<&[Value]> {
        self.slots.get(id).and_then(|slot| slot.as_deref())
    }

    /// Slots held by the log, live or free. Never more than twice the live
    /// row count once the log has grown past a handful of free slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over all live tuples, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &[Value]> + '_ {
        self.extent.iter().filter_map(|id| self.get_tuple(id as TupleId))
    }

    /// Iterate over occupied slots
    pub fn iter_ids(&self) -> impl Iterator<Item = TupleId> + '_ {
        self.extent.iter().map(|id| id as TupleId)
    }

    /// Remove every live row matching `pred`; returns the removed rows.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&[Value]) -> bool) -> Vec<Tuple> {
        let doomed: Vec<Tuple> = self.iter().filter(|t| pred(t)).map(|t| t.to_vec()).collect();
        for tuple in &doomed {
            self.remove(tuple);
        }
        doomed
    }

    /// Drop every row
    pub fn clear(&mut self) {
        self.slots.clear();
        self.tuple_to_id.clear();
        self.key_to_id.clear();
        self.extent.clear();
    }

    /// Append a row in a fresh slot
    fn push(&mut self, tuple: Tuple) -> TupleId {
        let id = self.slots.len();
        self.tuple_to_id.insert(tuple.clone(), id);
        self.slots.push(Some(tuple));
        self.extent.insert(id as u64);
        id
    }

    /// Free slot `id`, handing back the row it held
    fn release(&mut self, id: TupleId) -> Option<Tuple> {
        let tuple = self.slots.get_mut(id)?.take()?;
        self.extent.remove(id as u64);
        self.tuple_to_id.remove(&tuple);
        Some(tuple)
    }

    fn maybe_compact(&mut self) {
        let free = self.slots.len() - self.extent.len() as usize;
        if free > COMPACT_MIN_FREE && free * 2 > self.slots.len() {
            self.compact();
        }
    }

    /// Rebuild the log from live rows only, keeping their order.
    fn compact(&mut self) {
        let live: Vec<Tuple> = std::mem::take(&mut self.slots).into_iter().flatten().collect();
        self.tuple_to_id.clear();
        self.key_to_id.clear();
        self.extent.clear();
        self.slots.reserve_exact(live.len());
        for tuple in live {
            let key = self.key_of(&tuple).to_vec();
            let id = self.push(tuple);
            self.key_to_id.insert(key, id);
        }
    }
}

impl RelationStorage for KeyedRelation {
    fn contains(&self, tuple: &[Value]) -> bool {
        self.tuple_to_id.contains_key(tuple)
    }

    fn insert(&mut self, tuple: Tuple) -> InsertOutcome {
        debug_assert_eq!(tuple.len(), self.arity, "tuple arity mismatch");

        let key = self.key_of(&tuple).to_vec();
        let previous = match self.key_to_id.get(&key).copied() {
            Some(id) if self.get_tuple(id) == Some(tuple.as_slice()) => {
                return InsertOutcome::Unchanged
            }
            Some(id) => self.release(id),
            None => None,
        };

        let id = self.push(tuple);
        self.key_to_id.insert(key, id);

        match previous {
            Some(previous) => {
                self.maybe_compact();
                InsertOutcome::Replaced { previous }
            }
            None => InsertOutcome::Inserted,
        }
    }

    fn remove(&mut self, tuple: &[Value]) -> bool {
        let Some(&id) = self.tuple_to_id.get(tuple) else {
            return false;
        };
        let key = self.key_of(tuple);
        if self.key_to_id.get(key) == Some(&id) {
            self.key_to_id.remove(key);
        }
        self.release(id);
        self.maybe_compact();
        true
    }

    fn len(&self) -> usize {
        self.extent.len() as usize
    }

    fn arity(&self) -> usize {
        self.arity
    }
}
