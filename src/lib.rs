//! rse-engine: an incremental relational evaluator with Redundant State
//! Elimination.
//!
//! Relations only grow, except where RSE can prove a buffered row will never
//! again affect an antijoin-derived result. Programs are registered once
//! through [`ProgramBuilder`], then driven step by step by an [`Engine`]:
//!
//! ```
//! use rse_engine::{Engine, ProgramBuilder, Schema};
//!
//! let mut b = ProgramBuilder::new();
//! b.table("sbuf", Schema::of_names(&["id", "val"])).unwrap();
//! b.table("res_approx", Schema::of_names(&["id", "val"])).unwrap();
//! b.scratch("res", Schema::of_names(&["id", "val"])).unwrap();
//! let body = b.scan("sbuf").unwrap().antijoin(b.scan("res_approx").unwrap(), None);
//! b.rule("res", body).unwrap();
//!
//! let mut engine = Engine::new(b.build().unwrap());
//! engine.insert("sbuf", [[5, 10], [6, 12]]).unwrap();
//! engine.advance().unwrap();
//! assert_eq!(engine.len("res").unwrap(), 2);
//!
//! engine.insert("res_approx", [[5, 10]]).unwrap();
//! engine.advance_many(2).unwrap();
//! assert_eq!(engine.len("sbuf").unwrap(), 1);
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod id;
pub mod program;
pub mod query;
pub mod rse;
pub mod seal;
pub mod store;
pub mod value;

pub use config::{EngineConfig, KeyConflictPolicy};
pub use crate::core::{Catalog, Column, RelationKind, Schema};
pub use engine::{Engine, Phase, StepReport};
pub use error::{EngineError, EngineResult, RegistrationError, RegistrationResult, SchemaError};
pub use program::{Program, ProgramBuilder, Rule};
pub use query::backend::{Expr, JoinCond, JoinOutput, Predicate, QueryOp};
pub use seal::SealKey;
pub use value::{tuple, ColumnType, Tuple, Value};
