//! ID types for the evaluator.
//!
//! Everything is addressed by dense indices handed out at registration time:
//! - RelIds index the program catalog and are stable for the process lifetime
//! - TupleIds index slots of a relation's tuple log
//! - ColIds index a relation's schema

/// Relation ID: index into the catalog (0..N-1).
pub type RelId = usize;

/// Tuple ID: slot in a relation's tuple log.
/// Only meaningful until the next deletion; compaction renumbers slots.
pub type TupleId = usize;

/// Column index within a schema.
pub type ColId = usize;

/// Number of completed Deriving/Committing cycles.
pub type StepId = u64;
