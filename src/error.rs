//! Error types for the evaluator.
//!
//! Two families:
//! - [`RegistrationError`]: configuration mistakes in the program (unknown
//!   relations or columns, arity mismatches, unstratifiable negation). These
//!   are caught by `ProgramBuilder::build` before the first step runs.
//! - [`EngineError`]: rejected inputs at the insertion/seal interfaces, plus
//!   a step exceeding its fixpoint bound. A rejected input leaves all state
//!   unchanged.

use thiserror::Error;

use crate::value::ColumnType;

/// Row does not fit a relation's declared schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("relation {relation}: expected {expected} columns, got {got}")]
    Arity {
        relation: String,
        expected: usize,
        got: usize,
    },

    #[error("relation {relation}: column '{column}' expects {expected}, got {got}")]
    Type {
        relation: String,
        column: String,
        expected: ColumnType,
        got: ColumnType,
    },
}

/// Errors detected while registering relations and rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("duplicate relation: {0}")]
    DuplicateRelation(String),

    #[error("relation {relation}: duplicate column '{column}'")]
    DuplicateColumn { relation: String, column: String },

    #[error("relation {relation}: key arity {key_arity} exceeds {columns} columns")]
    KeyTooWide {
        relation: String,
        key_arity: usize,
        columns: usize,
    },

    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    #[error("relation {relation}: no column '{column}'")]
    UnknownColumn { relation: String, column: String },

    #[error("rule '{rule}': column {index} out of range for input of arity {arity}")]
    ColumnOutOfRange {
        rule: String,
        index: usize,
        arity: usize,
    },

    #[error("rule '{rule}': produces {got} columns but head {head} has {expected}")]
    ArityMismatch {
        rule: String,
        head: String,
        expected: usize,
        got: usize,
    },

    #[error("rule '{rule}': {op} inputs have arities {left} and {right}")]
    InputArity {
        rule: String,
        op: &'static str,
        left: usize,
        right: usize,
    },

    #[error("rule '{rule}': negation of {relation} is not stratifiable")]
    UnstratifiableNegation { rule: String, relation: String },
}

pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Errors returned by the running engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    #[error("relation {relation}: no column '{column}'")]
    UnknownColumn { relation: String, column: String },

    #[error("relation {0} is ephemeral and cannot receive external input")]
    NotPersistent(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("relation {relation}: key {key} already bound to {existing}, rejected {incoming}")]
    KeyConflict {
        relation: String,
        key: String,
        existing: String,
        incoming: String,
    },

    #[error("relation {relation}: row {row} falls in sealed partition {partition}")]
    SealedPartition {
        relation: String,
        row: String,
        partition: String,
    },

    #[error("fixpoint did not converge after {0} iterations")]
    FixpointDiverged(usize),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

pub type EngineResult<T> = Result<T, EngineError>;
