//! Interpreter for relational operator trees.
//!
//! Rule bodies are plain data: a [`QueryOp`] tree built once at registration
//! and walked by [`execute`] every step. The interpreter is deliberately
//! simple:
//! - Set semantics throughout ([`TupleSet`] is ordered, so output is
//!   deterministic)
//! - Hash indexes built on the fly for equi-joins and antijoins
//! - Relation contents come from a [`RelationSource`], so the same code runs
//!   over committed persistent state, in-step ephemeral state and semi-naive
//!   deltas

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::id::{ColId, RelId};
use crate::value::{Tuple, Value};

/// A set of tuples. Ordered so scans and results are reproducible.
pub type TupleSet = BTreeSet<Tuple>;

/// Where operator trees read relation contents from.
pub trait RelationSource {
    /// Current contents of a relation
    fn scan(&self, rel: RelId) -> TupleSet;

    /// Rows added to a relation by the previous semi-naive iteration.
    /// Sources outside a fixpoint loop have no deltas.
    fn scan_delta(&self, _rel: RelId) -> TupleSet {
        TupleSet::new()
    }
}

/// Output column of a projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Copy input column
    Col(ColId),
    /// Constant value
    Const(Value),
}

/// Output column of a join, chosen from either side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutput {
    Left(ColId),
    Right(ColId),
    Const(Value),
}

/// Join condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinCond {
    /// Cross product
    Cross,
    /// Equijoin on (left column, right column) pairs
    Equi(Vec<(ColId, ColId)>),
}

impl JoinCond {
    pub fn pairs(&self) -> &[(ColId, ColId)] {
        match self {
            JoinCond::Cross => &[],
            JoinCond::Equi(pairs) => pairs,
        }
    }

    pub fn left_cols(&self) -> Vec<ColId> {
        self.pairs().iter().map(|&(l, _)| l).collect()
    }

    pub fn right_cols(&self) -> Vec<ColId> {
        self.pairs().iter().map(|&(_, r)| r).collect()
    }
}

/// Predicate for filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    True,
    /// Column equals constant
    ColEqConst { col: ColId, val: Value },
    /// Two columns equal
    ColEqCol { left: ColId, right: ColId },
    And(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

/// Relational operator tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOp {
    /// All rows of a relation
    Scan { rel: RelId },

    /// Rows a relation gained in the previous fixpoint iteration.
    /// Only introduced by semi-naive rewriting.
    Delta { rel: RelId },

    /// Filter by predicate
    Filter {
        input: Box<QueryOp>,
        pred: Predicate,
    },

    /// Map each row to a new row
    Project {
        input: Box<QueryOp>,
        columns: Vec<Expr>,
    },

    /// Pairs of rows satisfying `cond`, mapped through `output`
    Join {
        left: Box<QueryOp>,
        right: Box<QueryOp>,
        cond: JoinCond,
        output: Vec<JoinOutput>,
    },

    /// Rows of `left` with no match in `right`. Matching compares the
    /// `(left column, right column)` pairs of the qualifier, or whole rows
    /// when there is no qualifier.
    Antijoin {
        left: Box<QueryOp>,
        right: Box<QueryOp>,
        qualifier: Option<Vec<(ColId, ColId)>>,
    },

    /// Set union
    Union {
        left: Box<QueryOp>,
        right: Box<QueryOp>,
    },

    /// Constant single tuple
    Constant { tuple: Tuple },

    /// Empty relation
    Empty,
}

/// Whether a relation is read monotonically or under negation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

impl QueryOp {
    pub fn scan(rel: RelId) -> Self {
        QueryOp::Scan { rel }
    }

    pub fn project(self, columns: Vec<Expr>) -> Self {
        QueryOp::Project {
            input: Box::new(self),
            columns,
        }
    }

    pub fn filter(self, pred: Predicate) -> Self {
        QueryOp::Filter {
            input: Box::new(self),
            pred,
        }
    }

    pub fn join(self, right: QueryOp, cond: JoinCond, output: Vec<JoinOutput>) -> Self {
        QueryOp::Join {
            left: Box::new(self),
            right: Box::new(right),
            cond,
            output,
        }
    }

    pub fn antijoin(self, right: QueryOp, qualifier: Option<Vec<(ColId, ColId)>>) -> Self {
        QueryOp::Antijoin {
            left: Box::new(self),
            right: Box::new(right),
            qualifier,
        }
    }

    pub fn union(self, right: QueryOp) -> Self {
        QueryOp::Union {
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    /// Every relation read by this tree, with the polarity of each read.
    /// Relations under the right side of an antijoin are negative.
    pub fn reads(&self) -> Vec<(RelId, Polarity)> {
        let mut out = Vec::new();
        self.collect_reads(Polarity::Positive, &mut out);
        out
    }

    fn collect_reads(&self, polarity: Polarity, out: &mut Vec<(RelId, Polarity)>) {
        match self {
            QueryOp::Scan { rel } | QueryOp::Delta { rel } => out.push((*rel, polarity)),
            QueryOp::Filter { input, .. } | QueryOp::Project { input, .. } => {
                input.collect_reads(polarity, out)
            }
            QueryOp::Join { left, right, .. } | QueryOp::Union { left, right } => {
                left.collect_reads(polarity, out);
                right.collect_reads(polarity, out);
            }
            QueryOp::Antijoin { left, right, .. } => {
                left.collect_reads(polarity, out);
                right.collect_reads(Polarity::Negative, out);
            }
            QueryOp::Constant { .. } | QueryOp::Empty => {}
        }
    }

    /// Semi-naive variants of this tree: one copy per positive scan of a
    /// relation in `recursive`, with that single scan replaced by its delta.
    ///
    /// For monotone trees the union of the variants' results contains every
    /// row the full tree can newly derive from the last iteration's delta.
    pub fn delta_variants(&self, recursive: &dyn Fn(RelId) -> bool) -> Vec<QueryOp> {
        let occurrences = self
            .reads()
            .iter()
            .filter(|(rel, pol)| *pol == Polarity::Positive && recursive(*rel))
            .count();
        (0..occurrences)
            .map(|target| {
                let mut seen = 0;
                self.replace_scan(target, &mut seen, recursive)
            })
            .collect()
    }

    fn replace_scan(
        &self,
        target: usize,
        seen: &mut usize,
        recursive: &dyn Fn(RelId) -> bool,
    ) -> QueryOp {
        match self {
            QueryOp::Scan { rel } if recursive(*rel) => {
                let hit = *seen == target;
                *seen += 1;
                if hit {
                    QueryOp::Delta { rel: *rel }
                } else {
                    self.clone()
                }
            }
            QueryOp::Filter { input, pred } => QueryOp::Filter {
                input: Box::new(input.replace_scan(target, seen, recursive)),
                pred: pred.clone(),
            },
            QueryOp::Project { input, columns } => QueryOp::Project {
                input: Box::new(input.replace_scan(target, seen, recursive)),
                columns: columns.clone(),
            },
            QueryOp::Join {
                left,
                right,
                cond,
                output,
            } => QueryOp::Join {
                left: Box::new(left.replace_scan(target, seen, recursive)),
                right: Box::new(right.replace_scan(target, seen, recursive)),
                cond: cond.clone(),
                output: output.clone(),
            },
            QueryOp::Union { left, right } => QueryOp::Union {
                left: Box::new(left.replace_scan(target, seen, recursive)),
                right: Box::new(right.replace_scan(target, seen, recursive)),
            },
            // Negative side is never rewritten: it reads a lower stratum.
            QueryOp::Antijoin {
                left,
                right,
                qualifier,
            } => QueryOp::Antijoin {
                left: Box::new(left.replace_scan(target, seen, recursive)),
                right: right.clone(),
                qualifier: qualifier.clone(),
            },
            other => other.clone(),
        }
    }
}

/// Index over a witness-side relation answering "does some row match this
/// left row under the qualifier?".
#[derive(Debug, Clone)]
pub struct WitnessIndex {
    qualifier: Option<Vec<(ColId, ColId)>>,
    keys: HashSet<Tuple>,
}

impl WitnessIndex {
    pub fn build<'a>(
        rows: impl IntoIterator<Item = &'a Tuple>,
        qualifier: Option<&[(ColId, ColId)]>,
    ) -> Self {
        let keys = rows
            .into_iter()
            .map(|row| match qualifier {
                Some(q) => q.iter().map(|&(_, r)| row[r].clone()).collect(),
                None => row.clone(),
            })
            .collect();
        Self {
            qualifier: qualifier.map(|q| q.to_vec()),
            keys,
        }
    }

    /// Is `left_row` matched by some witness row?
    pub fn matches(&self, left_row: &[Value]) -> bool {
        match &self.qualifier {
            Some(q) => {
                let key: Tuple = q.iter().map(|&(l, _)| left_row[l].clone()).collect();
                self.keys.contains(&key)
            }
            None => self.keys.contains(left_row),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Execute an operator tree against a relation source.
pub fn execute<S: RelationSource + ?Sized>(plan: &QueryOp, source: &S) -> TupleSet {
    match plan {
        QueryOp::Scan { rel } => source.scan(*rel),

        QueryOp::Delta { rel } => source.scan_delta(*rel),

        QueryOp::Filter { input, pred } => execute(input, source)
            .into_iter()
            .filter(|tuple| eval_predicate(pred, tuple))
            .collect(),

        QueryOp::Project { input, columns } => execute(input, source)
            .iter()
            .map(|tuple| {
                columns
                    .iter()
                    .map(|expr| match expr {
                        Expr::Col(c) => tuple[*c].clone(),
                        Expr::Const(v) => v.clone(),
                    })
                    .collect()
            })
            .collect(),

        QueryOp::Join {
            left,
            right,
            cond,
            output,
        } => {
            let left_set = execute(left, source);
            let right_set = execute(right, source);
            let mut result = TupleSet::new();
            for_each_pair(&left_set, &right_set, cond, |l, r| {
                result.insert(join_output(output, l, r));
            });
            result
        }

        QueryOp::Antijoin {
            left,
            right,
            qualifier,
        } => {
            let left_set = execute(left, source);
            let right_set = execute(right, source);
            let index = WitnessIndex::build(&right_set, qualifier.as_deref());
            left_set
                .into_iter()
                .filter(|tuple| !index.matches(tuple))
                .collect()
        }

        QueryOp::Union { left, right } => {
            let mut result = execute(left, source);
            result.extend(execute(right, source));
            result
        }

        QueryOp::Constant { tuple } => TupleSet::from([tuple.clone()]),

        QueryOp::Empty => TupleSet::new(),
    }
}

/// Build one join output row from a matched pair
pub fn join_output(output: &[JoinOutput], left: &[Value], right: &[Value]) -> Tuple {
    output
        .iter()
        .map(|o| match o {
            JoinOutput::Left(c) => left[*c].clone(),
            JoinOutput::Right(c) => right[*c].clone(),
            JoinOutput::Const(v) => v.clone(),
        })
        .collect()
}

/// Call `f` for every (left, right) pair satisfying `cond`.
pub fn for_each_pair<'a>(
    left: impl IntoIterator<Item = &'a Tuple>,
    right: &'a TupleSet,
    cond: &JoinCond,
    mut f: impl FnMut(&'a Tuple, &'a Tuple),
) {
    match cond {
        JoinCond::Cross => {
            for l in left {
                for r in right {
                    f(l, r);
                }
            }
        }
        JoinCond::Equi(pairs) => {
            let mut index: HashMap<Tuple, Vec<&Tuple>> = HashMap::new();
            for r in right {
                let key = pairs.iter().map(|&(_, rc)| r[rc].clone()).collect();
                index.entry(key).or_default().push(r);
            }
            for l in left {
                let key: Tuple = pairs.iter().map(|&(lc, _)| l[lc].clone()).collect();
                if let Some(matches) = index.get(&key) {
                    for &r in matches {
                        f(l, r);
                    }
                }
            }
        }
    }
}

pub fn eval_predicate(pred: &Predicate, tuple: &[Value]) -> bool {
    match pred {
        Predicate::True => true,
        Predicate::ColEqConst { col, val } => tuple.get(*col) == Some(val),
        Predicate::ColEqCol { left, right } => {
            tuple.get(*left) == tuple.get(*right) && tuple.get(*left).is_some()
        }
        Predicate::And(a, b) => eval_predicate(a, tuple) && eval_predicate(b, tuple),
        Predicate::Not(p) => !eval_predicate(p, tuple),
    }
}
