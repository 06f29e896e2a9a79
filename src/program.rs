//! Program registration: relations, rules, validation and stratification.
//!
//! A program is declared once through [`ProgramBuilder`] and frozen by
//! [`ProgramBuilder::build`], which catches every configuration error
//! (unknown relations or columns, arity mismatches, negation through
//! recursion) before the first step can run. The frozen [`Program`] carries:
//! - ephemeral rules grouped into strata, each with its semi-naive variants
//! - deferred rules, whose heads are persistent and whose output lands at
//!   commit time
//! - the RSE deletion plans derived from antijoin rules
//!
//! # Example
//!
//! ```
//! use rse_engine::core::{Column, Schema};
//! use rse_engine::program::ProgramBuilder;
//!
//! let mut b = ProgramBuilder::new();
//! b.table("sbuf", Schema::keyed(vec![Column::any("id")], vec![Column::any("val")])).unwrap();
//! b.scratch("res", Schema::of_names(&["id", "val"])).unwrap();
//! b.table("res_approx", Schema::of_names(&["id", "val"])).unwrap();
//!
//! let body = b.scan("sbuf").unwrap().antijoin(b.scan("res_approx").unwrap(), None);
//! b.rule("res", body).unwrap();
//!
//! let program = b.build().unwrap();
//! assert_eq!(program.rse_plans().len(), 1);
//! ```

use std::collections::HashMap;

use tracing::debug;

use crate::config::KeyConflictPolicy;
use crate::core::{Catalog, RelationKind, Schema};
use crate::error::{RegistrationError, RegistrationResult};
use crate::id::{ColId, RelId};
use crate::query::backend::{Expr, JoinCond, JoinOutput, Polarity, Predicate, QueryOp};
use crate::query::optimize::optimize;
use crate::rse::{self, RsePlan, RseSkip};

/// A validated rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub head: RelId,
    pub body: QueryOp,
    /// Semi-naive variants of `body` (empty when the rule does not read its
    /// own stratum)
    pub delta_variants: Vec<QueryOp>,
}

/// A frozen, validated program.
#[derive(Debug, Clone)]
pub struct Program {
    catalog: Catalog,
    rules: Vec<Rule>,
    /// Indices into `rules`, one group per stratum, lowest first
    strata: Vec<Vec<usize>>,
    /// Indices into `rules` of rules with persistent heads
    deferred: Vec<usize>,
    rse_plans: Vec<RsePlan>,
    rse_skips: Vec<RseSkip>,
}

impl Program {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn strata(&self) -> impl Iterator<Item = impl Iterator<Item = &Rule>> {
        self.strata
            .iter()
            .map(move |group| group.iter().map(move |&i| &self.rules[i]))
    }

    pub fn stratum_count(&self) -> usize {
        self.strata.len()
    }

    pub fn deferred_rules(&self) -> impl Iterator<Item = &Rule> {
        self.deferred.iter().map(move |&i| &self.rules[i])
    }

    pub fn rse_plans(&self) -> &[RsePlan] {
        &self.rse_plans
    }

    /// Antijoin rules (or sides of them) that RSE declined, with reasons
    pub fn rse_skips(&self) -> &[RseSkip] {
        &self.rse_skips
    }

    pub fn lookup(&self, name: &str) -> Option<RelId> {
        self.catalog.lookup(name)
    }

    /// Is `rel` the witness of some RSE plan?
    pub fn is_witness(&self, rel: RelId) -> bool {
        self.rse_plans.iter().any(|plan| plan.witness == rel)
    }

    /// Key conflict policy in force for `rel`. Witness relations only ever
    /// grow, so a conflicting witness row is rejected even under
    /// [`KeyConflictPolicy::Replace`].
    pub fn key_policy(&self, rel: RelId, configured: KeyConflictPolicy) -> KeyConflictPolicy {
        if self.is_witness(rel) {
            KeyConflictPolicy::Reject
        } else {
            configured
        }
    }
}

/// Collects relation and rule declarations.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    catalog: Catalog,
    rules: Vec<(String, RelId, QueryOp)>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a persistent relation
    pub fn table(&mut self, name: &str, schema: Schema) -> RegistrationResult<RelId> {
        self.catalog.add_relation(name, schema, RelationKind::Persistent)
    }

    /// Declare an ephemeral relation
    pub fn scratch(&mut self, name: &str, schema: Schema) -> RegistrationResult<RelId> {
        self.catalog.add_relation(name, schema, RelationKind::Ephemeral)
    }

    pub fn rel(&self, name: &str) -> RegistrationResult<RelId> {
        self.catalog
            .lookup(name)
            .ok_or_else(|| RegistrationError::UnknownRelation(name.to_string()))
    }

    pub fn schema(&self, name: &str) -> RegistrationResult<&Schema> {
        Ok(self.catalog.schema(self.rel(name)?))
    }

    /// Column index by name
    pub fn col(&self, rel: &str, column: &str) -> RegistrationResult<ColId> {
        self.catalog.resolve_column(self.rel(rel)?, column)
    }

    /// `Scan` of a named relation
    pub fn scan(&self, name: &str) -> RegistrationResult<QueryOp> {
        Ok(QueryOp::scan(self.rel(name)?))
    }

    /// Resolve `(left column, right column)` name pairs between two relations.
    pub fn qualifier(
        &self,
        left: &str,
        right: &str,
        pairs: &[(&str, &str)],
    ) -> RegistrationResult<Vec<(ColId, ColId)>> {
        pairs
            .iter()
            .map(|(l, r)| Ok((self.col(left, l)?, self.col(right, r)?)))
            .collect()
    }

    /// Equijoin condition from column name pairs; no pairs gives a cross product.
    pub fn pairs(&self, left: &str, right: &str, pairs: &[(&str, &str)]) -> RegistrationResult<JoinCond> {
        if pairs.is_empty() {
            return Ok(JoinCond::Cross);
        }
        Ok(JoinCond::Equi(self.qualifier(left, right, pairs)?))
    }

    /// Projection of a relation's columns by name
    pub fn project(&self, rel: &str, columns: &[&str]) -> RegistrationResult<QueryOp> {
        let exprs = columns
            .iter()
            .map(|c| Ok(Expr::Col(self.col(rel, c)?)))
            .collect::<RegistrationResult<Vec<_>>>()?;
        Ok(self.scan(rel)?.project(exprs))
    }

    /// Declare `head <= body`, named `head#n` after its declaration position.
    pub fn rule(&mut self, head: &str, body: QueryOp) -> RegistrationResult<()> {
        let n = self.rules.len();
        self.rule_named(&format!("{}#{}", head, n), head, body)
    }

    pub fn rule_named(&mut self, name: &str, head: &str, body: QueryOp) -> RegistrationResult<()> {
        let head_id = self.rel(head)?;
        check_plan(&self.catalog, name, head_id, &body)?;
        self.rules.push((name.to_string(), head_id, body));
        Ok(())
    }

    /// Validate, stratify and plan RSE.
    pub fn build(self) -> RegistrationResult<Program> {
        let ProgramBuilder { catalog, rules } = self;

        let mut built = Vec::with_capacity(rules.len());
        for (name, head, body) in rules {
            check_plan(&catalog, &name, head, &body)?;
            built.push(Rule {
                name,
                head,
                body: optimize(&body),
                delta_variants: Vec::new(),
            });
        }

        let stratum_of = stratify(&catalog, &built)?;
        let stratum_count = stratum_of.values().copied().max().map_or(0, |s| s + 1);

        let mut strata = vec![Vec::new(); stratum_count];
        let mut deferred = Vec::new();
        for (i, rule) in built.iter_mut().enumerate() {
            if catalog.symbol(rule.head).is_persistent() {
                deferred.push(i);
                continue;
            }
            let stratum = stratum_of[&rule.head];
            let recursive = |rel: RelId| {
                !catalog.symbol(rel).is_persistent() && stratum_of.get(&rel) == Some(&stratum)
            };
            rule.delta_variants = rule.body.delta_variants(&recursive);
            strata[stratum].push(i);
        }

        let (rse_plans, rse_skips) = rse::plan_rules(&catalog, &built);
        for skip in &rse_skips {
            debug!(rule = %skip.rule, relation = %skip.relation, reason = %skip.reason, "RSE not applied");
        }
        debug!(
            relations = catalog.len(),
            rules = built.len(),
            strata = strata.len(),
            rse_plans = rse_plans.len(),
            "program built"
        );

        Ok(Program {
            catalog,
            rules: built,
            strata,
            deferred,
            rse_plans,
            rse_skips,
        })
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

fn check_plan(catalog: &Catalog, rule: &str, head: RelId, body: &QueryOp) -> RegistrationResult<()> {
    let expected = catalog.schema(head).arity();
    match infer_arity(catalog, rule, body)? {
        Some(got) if got != expected => Err(RegistrationError::ArityMismatch {
            rule: rule.to_string(),
            head: catalog.name(head).to_string(),
            expected,
            got,
        }),
        _ => Ok(()),
    }
}

fn check_col(rule: &str, index: ColId, arity: Option<usize>) -> RegistrationResult<()> {
    match arity {
        Some(arity) if index >= arity => Err(RegistrationError::ColumnOutOfRange {
            rule: rule.to_string(),
            index,
            arity,
        }),
        _ => Ok(()),
    }
}

fn check_pred(rule: &str, pred: &Predicate, arity: Option<usize>) -> RegistrationResult<()> {
    match pred {
        Predicate::True => Ok(()),
        Predicate::ColEqConst { col, .. } => check_col(rule, *col, arity),
        Predicate::ColEqCol { left, right } => {
            check_col(rule, *left, arity)?;
            check_col(rule, *right, arity)
        }
        Predicate::And(a, b) => {
            check_pred(rule, a, arity)?;
            check_pred(rule, b, arity)
        }
        Predicate::Not(p) => check_pred(rule, p, arity),
    }
}

/// Output arity of a tree; `None` for `Empty`, which fits any arity.
fn infer_arity(catalog: &Catalog, rule: &str, plan: &QueryOp) -> RegistrationResult<Option<usize>> {
    match plan {
        QueryOp::Scan { rel } | QueryOp::Delta { rel } => catalog
            .get(*rel)
            .map(|sym| Some(sym.schema.arity()))
            .ok_or_else(|| RegistrationError::UnknownRelation(format!("#{}", rel))),

        QueryOp::Filter { input, pred } => {
            let arity = infer_arity(catalog, rule, input)?;
            check_pred(rule, pred, arity)?;
            Ok(arity)
        }

        QueryOp::Project { input, columns } => {
            let arity = infer_arity(catalog, rule, input)?;
            for expr in columns {
                if let Expr::Col(c) = expr {
                    check_col(rule, *c, arity)?;
                }
            }
            Ok(Some(columns.len()))
        }

        QueryOp::Join {
            left,
            right,
            cond,
            output,
        } => {
            let la = infer_arity(catalog, rule, left)?;
            let ra = infer_arity(catalog, rule, right)?;
            for &(l, r) in cond.pairs() {
                check_col(rule, l, la)?;
                check_col(rule, r, ra)?;
            }
            for o in output {
                match o {
                    JoinOutput::Left(c) => check_col(rule, *c, la)?,
                    JoinOutput::Right(c) => check_col(rule, *c, ra)?,
                    JoinOutput::Const(_) => {}
                }
            }
            Ok(Some(output.len()))
        }

        QueryOp::Antijoin {
            left,
            right,
            qualifier,
        } => {
            let la = infer_arity(catalog, rule, left)?;
            let ra = infer_arity(catalog, rule, right)?;
            match qualifier {
                Some(pairs) => {
                    for &(l, r) in pairs {
                        check_col(rule, l, la)?;
                        check_col(rule, r, ra)?;
                    }
                }
                None => {
                    if let (Some(l), Some(r)) = (la, ra) {
                        if l != r {
                            return Err(RegistrationError::InputArity {
                                rule: rule.to_string(),
                                op: "antijoin",
                                left: l,
                                right: r,
                            });
                        }
                    }
                }
            }
            Ok(la)
        }

        QueryOp::Union { left, right } => {
            let la = infer_arity(catalog, rule, left)?;
            let ra = infer_arity(catalog, rule, right)?;
            match (la, ra) {
                (Some(l), Some(r)) if l != r => Err(RegistrationError::InputArity {
                    rule: rule.to_string(),
                    op: "union",
                    left: l,
                    right: r,
                }),
                (Some(a), _) | (_, Some(a)) => Ok(Some(a)),
                (None, None) => Ok(None),
            }
        }

        QueryOp::Constant { tuple } => Ok(Some(tuple.len())),

        QueryOp::Empty => Ok(None),
    }
}

// ============================================================================
// STRATIFICATION
// ============================================================================

/// Assign a stratum to every ephemeral rule head.
///
/// A head sits at or above every ephemeral relation it reads positively and
/// strictly above every ephemeral relation it reads under an antijoin.
/// Persistent relations are fixed for the whole step and impose nothing.
fn stratify(catalog: &Catalog, rules: &[Rule]) -> RegistrationResult<HashMap<RelId, usize>> {
    let mut stratum: HashMap<RelId, usize> = HashMap::new();
    for rule in rules {
        if !catalog.symbol(rule.head).is_persistent() {
            stratum.insert(rule.head, 0);
        }
    }
    let limit = catalog.len();

    loop {
        let mut changed = false;
        for rule in rules {
            if catalog.symbol(rule.head).is_persistent() {
                continue;
            }
            for (rel, polarity) in rule.body.reads() {
                if catalog.symbol(rel).is_persistent() {
                    continue;
                }
                let below = stratum.get(&rel).copied().unwrap_or(0);
                let needed = match polarity {
                    Polarity::Positive => below,
                    Polarity::Negative => below + 1,
                };
                let current = stratum.entry(rule.head).or_insert(0);
                if needed > *current {
                    if needed > limit {
                        return Err(RegistrationError::UnstratifiableNegation {
                            rule: rule.name.clone(),
                            relation: catalog.name(rel).to_string(),
                        });
                    }
                    *current = needed;
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(stratum);
        }
    }
}
