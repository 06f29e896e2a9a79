//! Relational-algebra operators.
//!
//! Rule bodies are [`backend::QueryOp`] trees built at registration time and
//! interpreted against a step snapshot. Operators are deterministic and
//! set-valued:
//!
//! | Operator   | Meaning                                                   |
//! |------------|-----------------------------------------------------------|
//! | `Scan`     | all rows of a relation                                    |
//! | `Delta`    | rows new in the previous semi-naive iteration             |
//! | `Project`  | per-row column map                                        |
//! | `Filter`   | rows satisfying a predicate                               |
//! | `Join`     | "pairs": equi-join or cross product with an output map    |
//! | `Antijoin` | "notin": left rows with no qualifying witness row         |
//! | `Union`    | set union                                                 |
//!
//! [`optimize`] applies algebraic simplifications before a program freezes.

pub mod backend;
pub mod optimize;
