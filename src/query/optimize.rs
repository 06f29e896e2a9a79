//! Rule-body simplifier using algebraic laws.
//!
//! Runs once per rule when the program is built. Single-pass, bottom-up, no
//! cost model; every rewrite preserves the set of rows a tree produces for
//! any relation contents.
//!
//! Rewrites:
//! - Filter(True, x) → x
//! - Filter(Not(True), x) → Empty
//! - Filter(p, Filter(q, x)) → Filter(And(p, q), x)
//! - Filter/Project over Empty → Empty
//! - Union(x, Empty) → x, Union(Empty, x) → x
//! - Join(x, Empty) → Empty, Join(Empty, x) → Empty
//! - Antijoin(Empty, x) → Empty
//! - Antijoin(x, Empty) → x

use super::backend::{Predicate, QueryOp};

/// Simplify an operator tree.
pub fn optimize(plan: &QueryOp) -> QueryOp {
    apply_rules(optimize_children(plan))
}

fn optimize_children(plan: &QueryOp) -> QueryOp {
    match plan {
        QueryOp::Filter { input, pred } => QueryOp::Filter {
            input: Box::new(optimize(input)),
            pred: pred.clone(),
        },

        QueryOp::Project { input, columns } => QueryOp::Project {
            input: Box::new(optimize(input)),
            columns: columns.clone(),
        },

        QueryOp::Join {
            left,
            right,
            cond,
            output,
        } => QueryOp::Join {
            left: Box::new(optimize(left)),
            right: Box::new(optimize(right)),
            cond: cond.clone(),
            output: output.clone(),
        },

        QueryOp::Antijoin {
            left,
            right,
            qualifier,
        } => QueryOp::Antijoin {
            left: Box::new(optimize(left)),
            right: Box::new(optimize(right)),
            qualifier: qualifier.clone(),
        },

        QueryOp::Union { left, right } => QueryOp::Union {
            left: Box::new(optimize(left)),
            right: Box::new(optimize(right)),
        },

        leaf => leaf.clone(),
    }
}

/// Apply rewrites to a node whose children are already simplified.
fn apply_rules(plan: QueryOp) -> QueryOp {
    match plan {
        // ============================================================
        // Filter Laws
        // ============================================================
        QueryOp::Filter {
            input,
            pred: Predicate::True,
        } => *input,

        QueryOp::Filter { pred: Predicate::Not(inner), .. } if *inner == Predicate::True => {
            QueryOp::Empty
        }

        QueryOp::Filter {
            input,
            pred: outer_pred,
        } => match *input {
            QueryOp::Empty => QueryOp::Empty,
            QueryOp::Filter {
                input: inner_input,
                pred: inner_pred,
            } => QueryOp::Filter {
                input: inner_input,
                pred: Predicate::And(Box::new(outer_pred), Box::new(inner_pred)),
            },
            other => QueryOp::Filter {
                input: Box::new(other),
                pred: outer_pred,
            },
        },

        QueryOp::Project { input, columns } => {
            if matches!(*input, QueryOp::Empty) {
                QueryOp::Empty
            } else {
                QueryOp::Project { input, columns }
            }
        }

        // ============================================================
        // Union Laws
        // ============================================================
        QueryOp::Union { left, right } => match (&*left, &*right) {
            (QueryOp::Empty, _) => *right,
            (_, QueryOp::Empty) => *left,
            _ => QueryOp::Union { left, right },
        },

        // ============================================================
        // Join Laws
        // ============================================================
        QueryOp::Join {
            left,
            right,
            cond,
            output,
        } => {
            if matches!(*left, QueryOp::Empty) || matches!(*right, QueryOp::Empty) {
                QueryOp::Empty
            } else {
                QueryOp::Join {
                    left,
                    right,
                    cond,
                    output,
                }
            }
        }

        QueryOp::Antijoin {
            left,
            right,
            qualifier,
        } => match (&*left, &*right) {
            (QueryOp::Empty, _) => QueryOp::Empty,
            (_, QueryOp::Empty) => *left,
            _ => QueryOp::Antijoin {
                left,
                right,
                qualifier,
            },
        },

        other => other,
    }
}
