//! Redundant State Elimination: deleting buffered rows once they provably
//! cannot change any derived result.
//!
//! # Rule shapes
//!
//! RSE looks for rules whose body is an antijoin against a witness
//! relation `W`:
//!
//! ```text
//! head <= L antijoin(W, Q)                      simple
//! head <= map(L) antijoin(W, Q)                 simple, mapped
//! head <= (L join J on P, mapped) antijoin(W, Q) join
//! ```
//!
//! # Why deletion is safe
//!
//! `W` only grows, so once a left row is matched by some `W` row it is
//! filtered out of the antijoin forever. A row of `L` whose only reader is
//! this antijoin can therefore be dropped as soon as it is matched.
//!
//! With a join, a row `l` contributes one output row per partner `j`
//! sharing its join-key partition `k`. Dropping `l` is safe only when every
//! pairing it could *ever* take part in is already witnessed:
//! - `J` is closed for `k` (sealed), so no new partner can arrive
//! - every current `j` in `J_k` yields a witnessed output for `(l, j)`
//!
//! and symmetrically for `j`. Without an equijoin condition the whole
//! relation is one partition and only a global seal closes it.
//!
//! # Applicability
//!
//! A side is eligible only when its relation is persistent, is read by no
//! other rule (and only once by this one), is written by no rule, and is
//! neither the witness nor the other join side. A rule writing into `L`
//! would re-derive deleted rows, and once their partition is sealed those
//! rows could never be re-admitted. Declined sides are reported as
//! [`RseSkip`].
//!
//! The witness relation must only grow: [`Program::key_policy`] never lets a
//! key replacement remove a witness row.
//!
//! [`Program::key_policy`]: crate::program::Program::key_policy

use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::core::Catalog;
use crate::id::{ColId, RelId};
use crate::program::Rule;
use crate::query::backend::{
    join_output, Expr, JoinCond, JoinOutput, QueryOp, RelationSource, TupleSet,
    WitnessIndex,
};
use crate::seal::{SealKey, SealTracker};
use crate::value::{Tuple, Value};

/// Shape of the antijoin input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RseInput {
    /// `L` or `map(L)`
    Simple {
        left: RelId,
        map: Option<Vec<Expr>>,
    },
    /// `L join J on cond`, mapped through `output`
    Join {
        left: RelId,
        right: RelId,
        cond: JoinCond,
        output: Vec<JoinOutput>,
        delete_left: bool,
        delete_right: bool,
    },
}

/// A deletion rule derived from one antijoin rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsePlan {
    /// Name of the antijoin rule this plan serves
    pub rule: String,
    pub input: RseInput,
    pub witness: RelId,
    pub qualifier: Option<Vec<(ColId, ColId)>>,
}

/// An antijoin rule side that RSE left alone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RseSkip {
    pub rule: String,
    pub relation: String,
    pub reason: String,
}

/// Rows to delete from one relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub rel: RelId,
    pub rows: Vec<Tuple>,
}

// ============================================================================
// PLANNING
// ============================================================================

/// Derive deletion plans for every eligible antijoin rule.
pub fn plan_rules(catalog: &Catalog, rules: &[Rule]) -> (Vec<RsePlan>, Vec<RseSkip>) {
    let mut readers: HashMap<RelId, usize> = HashMap::new();
    for rule in rules {
        for (rel, _) in rule.body.reads() {
            *readers.entry(rel).or_insert(0) += 1;
        }
    }
    let written: HashSet<RelId> = rules.iter().map(|rule| rule.head).collect();

    let mut plans = Vec::new();
    let mut skips = Vec::new();
    for rule in rules {
        let QueryOp::Antijoin {
            left,
            right,
            qualifier,
        } = &rule.body
        else {
            continue;
        };
        let skip = |rel: RelId, reason: &str| RseSkip {
            rule: rule.name.clone(),
            relation: catalog.name(rel).to_string(),
            reason: reason.to_string(),
        };

        let QueryOp::Scan { rel: witness } = **right else {
            skips.push(RseSkip {
                rule: rule.name.clone(),
                relation: catalog.name(rule.head).to_string(),
                reason: "witness side is not a plain relation scan".to_string(),
            });
            continue;
        };
        if !catalog.symbol(witness).is_persistent() {
            skips.push(skip(witness, "witness relation is ephemeral"));
            continue;
        }

        // Why `rel` may not be deleted from, if anything.
        let blocker = |rel: RelId, other: Option<RelId>| -> Option<&'static str> {
            if !catalog.symbol(rel).is_persistent() {
                Some("relation is ephemeral")
            } else if rel == witness {
                Some("relation is its own witness")
            } else if Some(rel) == other {
                Some("relation is joined with itself")
            } else if written.contains(&rel) {
                Some("relation is written by a rule")
            } else if readers.get(&rel).copied().unwrap_or(0) != 1 {
                Some("relation is read by other rules")
            } else {
                None
            }
        };

        let input = match &**left {
            QueryOp::Scan { rel } => match blocker(*rel, None) {
                None => RseInput::Simple {
                    left: *rel,
                    map: None,
                },
                Some(reason) => {
                    skips.push(skip(*rel, reason));
                    continue;
                }
            },
            QueryOp::Project { input, columns } => match **input {
                QueryOp::Scan { rel } => match blocker(rel, None) {
                    None => RseInput::Simple {
                        left: rel,
                        map: Some(columns.clone()),
                    },
                    Some(reason) => {
                        skips.push(skip(rel, reason));
                        continue;
                    }
                },
                _ => {
                    skips.push(skip(rule.head, "antijoin input is not a relation scan"));
                    continue;
                }
            },
            QueryOp::Join {
                left: jl,
                right: jr,
                cond,
                output,
            } => match (&**jl, &**jr) {
                (QueryOp::Scan { rel: l }, QueryOp::Scan { rel: r }) => {
                    let left_block = blocker(*l, Some(*r));
                    let right_block = blocker(*r, Some(*l));
                    if let Some(reason) = left_block {
                        skips.push(skip(*l, reason));
                    }
                    if let Some(reason) = right_block {
                        skips.push(skip(*r, reason));
                    }
                    if left_block.is_some() && right_block.is_some() {
                        continue;
                    }
                    RseInput::Join {
                        left: *l,
                        right: *r,
                        cond: cond.clone(),
                        output: output.clone(),
                        delete_left: left_block.is_none(),
                        delete_right: right_block.is_none(),
                    }
                }
                _ => {
                    skips.push(skip(rule.head, "join inputs are not relation scans"));
                    continue;
                }
            },
            _ => {
                skips.push(skip(rule.head, "antijoin input has an unsupported shape"));
                continue;
            }
        };

        plans.push(RsePlan {
            rule: rule.name.clone(),
            input,
            witness,
            qualifier: qualifier.clone(),
        });
    }
    (plans, skips)
}

// ============================================================================
// EVALUATION
// ============================================================================

impl RsePlan {
    /// Relations this plan may delete from
    pub fn targets(&self) -> Vec<RelId> {
        match &self.input {
            RseInput::Simple { left, .. } => vec![*left],
            RseInput::Join {
                left,
                right,
                delete_left,
                delete_right,
                ..
            } => {
                let mut out = Vec::new();
                if *delete_left {
                    out.push(*left);
                }
                if *delete_right {
                    out.push(*right);
                }
                out
            }
        }
    }

    /// Rows that can be deleted given the current snapshot and seal marks.
    pub fn deletions<S: RelationSource + ?Sized>(
        &self,
        source: &S,
        seals: &SealTracker,
    ) -> Vec<Deletion> {
        let witnesses = source.scan(self.witness);
        if witnesses.is_empty() {
            return Vec::new();
        }
        let index = WitnessIndex::build(&witnesses, self.qualifier.as_deref());

        match &self.input {
            RseInput::Simple { left, map } => {
                let rows: Vec<Tuple> = source
                    .scan(*left)
                    .into_iter()
                    .filter(|row| match map {
                        Some(columns) => index.matches(&apply_map(columns, row)),
                        None => index.matches(row),
                    })
                    .collect();
                if rows.is_empty() {
                    return Vec::new();
                }
                info!(rule = %self.rule, rows = rows.len(), "RSE: witnessed rows eligible for deletion");
                vec![Deletion { rel: *left, rows }]
            }

            RseInput::Join {
                left,
                right,
                cond,
                output,
                delete_left,
                delete_right,
            } => {
                let left_rows = source.scan(*left);
                let right_rows = source.scan(*right);
                let covered = |l: &[Value], r: &[Value]| index.matches(&join_output(output, l, r));

                let mut out = Vec::new();
                if *delete_left {
                    let rows = coverable(
                        &left_rows,
                        &right_rows,
                        &cond.left_cols(),
                        &cond.right_cols(),
                        |key| seals.is_closed(*right, key),
                        |l, r| covered(l, r),
                    );
                    if !rows.is_empty() {
                        out.push(Deletion { rel: *left, rows });
                    }
                }
                if *delete_right {
                    let rows = coverable(
                        &right_rows,
                        &left_rows,
                        &cond.right_cols(),
                        &cond.left_cols(),
                        |key| seals.is_closed(*left, key),
                        |r, l| covered(l, r),
                    );
                    if !rows.is_empty() {
                        out.push(Deletion { rel: *right, rows });
                    }
                }
                for d in &out {
                    info!(rule = %self.rule, rel = d.rel, rows = d.rows.len(), "RSE: fully witnessed join rows eligible for deletion");
                }
                out
            }
        }
    }
}

fn apply_map(columns: &[Expr], row: &[Value]) -> Tuple {
    columns
        .iter()
        .map(|e| match e {
            Expr::Col(c) => row[*c].clone(),
            Expr::Const(v) => v.clone(),
        })
        .collect()
}

/// Rows of `mine` whose partner partition in `theirs` is closed and whose
/// every current pairing is witnessed.
///
/// `my_cols`/`their_cols` are the paired equijoin columns; partition keys
/// are the values on those columns (empty for a cross product).
fn coverable(
    mine: &TupleSet,
    theirs: &TupleSet,
    my_cols: &[ColId],
    their_cols: &[ColId],
    partner_closed: impl Fn(&SealKey) -> bool,
    witnessed: impl Fn(&[Value], &[Value]) -> bool,
) -> Vec<Tuple> {
    let mut partners: HashMap<Tuple, Vec<&Tuple>> = HashMap::new();
    for row in theirs {
        let key: Tuple = their_cols.iter().map(|&c| row[c].clone()).collect();
        partners.entry(key).or_default().push(row);
    }

    mine.iter()
        .filter(|row| {
            let key: Tuple = my_cols.iter().map(|&c| row[c].clone()).collect();
            let seal_key = SealKey::partition(their_cols.iter().copied().zip(key.iter().cloned()));
            if !partner_closed(&seal_key) {
                return false;
            }
            partners
                .get(&key)
                .map_or(true, |group| group.iter().all(|partner| witnessed(row, partner)))
        })
        .cloned()
        .collect()
}
