//! Step evaluator.
//!
//! One call to [`Engine::advance`] runs a full step:
//!
//! ```text
//! Idle ─▶ Deriving ─▶ Committing ─▶ Idle
//! ```
//!
//! **Deriving**
//! 1. Admit staged inserts and seal marks. This is the snapshot every rule
//!    in the step reads.
//! 2. Recompute ephemeral relations stratum by stratum, each to a
//!    semi-naive fixpoint.
//! 3. Evaluate deferred rules (persistent heads) and RSE deletion plans
//!    against the same snapshot.
//!
//! **Committing**
//! 4. Apply derived inserts, then deletions. Derived rows that cannot be
//!    committed (inside a sealed partition, or contending for a key under
//!    `Reject`) are dropped one by one with a warning and counted in
//!    [`StepReport::rejected`]; they never hold back the rest of the step.
//!
//! The only way a step fails is exceeding the fixpoint bound. Its inputs
//! stay admitted and nothing derived or deleted is committed.
//!
//! # Two advances per transition
//!
//! Inputs staged between steps are admitted by the next `advance`, and RSE
//! deletions they enable are applied at the end of that same step. Deferred
//! rules land one step later. Callers that want every consequence of a batch
//! of inputs to be visible, including deletions enabled by deferred output,
//! call `advance` twice; [`Engine::advance_many`] exists for that idiom.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::id::{RelId, StepId};
use crate::program::{Program, Rule};
use crate::query::backend::{execute, RelationSource, TupleSet};
use crate::rse::Deletion;
use crate::seal::{SealKey, SealTracker};
use crate::store::{RelationStorage, Store};
use crate::value::{Tuple, Value};

/// Where the evaluator is in its step cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Deriving,
    Committing,
}

/// What one step did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Step number (1 for the first step)
    pub step: StepId,
    /// Semi-naive iterations across all strata
    pub iterations: usize,
    /// External rows admitted that changed a relation
    pub admitted: usize,
    /// New seal marks admitted
    pub seals_admitted: usize,
    /// Rows added to persistent relations by deferred rules
    pub inserted: BTreeMap<String, usize>,
    /// Derived rows dropped at commit
    pub rejected: BTreeMap<String, usize>,
    /// Rows removed by RSE
    pub deleted: BTreeMap<String, usize>,
}

impl StepReport {
    pub fn total_deleted(&self) -> usize {
        self.deleted.values().sum()
    }
}

/// The evaluator: a frozen program plus its relation state.
#[derive(Debug, Clone)]
pub struct Engine {
    program: Program,
    config: EngineConfig,
    store: Store,
    seals: SealTracker,
    /// Ephemeral contents from the last completed step, indexed by RelId
    ephemeral: Vec<TupleSet>,
    step: StepId,
    phase: Phase,
}

/// Read view of one step: committed persistent relations plus the
/// ephemeral relations derived so far, with optional semi-naive deltas.
struct StepView<'a> {
    store: &'a Store,
    ephemeral: &'a [TupleSet],
    delta: Option<&'a [TupleSet]>,
}

impl RelationSource for StepView<'_> {
    fn scan(&self, rel: RelId) -> TupleSet {
        match self.store.relation(rel) {
            Some(relation) => relation.iter().map(|t| t.to_vec()).collect(),
            None => self.ephemeral.get(rel).cloned().unwrap_or_default(),
        }
    }

    fn scan_delta(&self, rel: RelId) -> TupleSet {
        self.delta
            .and_then(|d| d.get(rel))
            .cloned()
            .unwrap_or_default()
    }
}

impl Engine {
    pub fn new(program: Program) -> Self {
        Self::with_config(program, EngineConfig::default())
    }

    pub fn with_config(program: Program, config: EngineConfig) -> Self {
        let store = Store::new(program.catalog());
        let ephemeral = vec![TupleSet::new(); program.catalog().len()];
        Self {
            program,
            config,
            store,
            seals: SealTracker::new(),
            ephemeral,
            step: 0,
            phase: Phase::Idle,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of completed steps
    pub fn step(&self) -> StepId {
        self.step
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Committed persistent relations
    pub fn store(&self) -> &Store {
        &self.store
    }

    fn resolve(&self, name: &str) -> EngineResult<RelId> {
        self.program
            .lookup(name)
            .ok_or_else(|| EngineError::UnknownRelation(name.to_string()))
    }

    // ========================================================================
    // INPUT
    // ========================================================================

    /// Stage rows for a persistent relation; visible from the next step.
    pub fn insert<I, T, V>(&mut self, rel: &str, rows: I) -> EngineResult<usize>
    where
        I: IntoIterator<Item = T>,
        T: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let rel_id = self.resolve(rel)?;
        let rows: Vec<Tuple> = rows
            .into_iter()
            .map(|row| row.into_iter().map(Into::into).collect())
            .collect();
        self.stage(rel_id, rows)
    }

    /// Stage already-built tuples (mixed value types).
    pub fn insert_tuples(&mut self, rel: &str, rows: Vec<Tuple>) -> EngineResult<usize> {
        let rel_id = self.resolve(rel)?;
        self.stage(rel_id, rows)
    }

    pub fn insert_one(&mut self, rel: &str, row: Tuple) -> EngineResult<usize> {
        self.insert_tuples(rel, vec![row])
    }

    fn stage(&mut self, rel: RelId, rows: Vec<Tuple>) -> EngineResult<usize> {
        let catalog = self.program.catalog();
        let policy = self.program.key_policy(rel, self.config.key_conflict);
        self.store
            .stage(catalog, &self.seals, rel, rows, policy)
            .inspect_err(|err| warn!(relation = catalog.name(rel), %err, "insert batch rejected"))
    }

    /// Stage a seal mark closing the partition of `rel` where each named
    /// column equals the given value.
    pub fn seal(&mut self, rel: &str, partition: &[(&str, Value)]) -> EngineResult<()> {
        let rel_id = self.resolve(rel)?;
        let sym = self.program.catalog().symbol(rel_id);
        if !sym.is_persistent() {
            return Err(EngineError::NotPersistent(sym.name.clone()));
        }
        let mut pairs = Vec::with_capacity(partition.len());
        for (column, value) in partition {
            let col = sym
                .schema
                .column_index(column)
                .ok_or_else(|| EngineError::UnknownColumn {
                    relation: sym.name.clone(),
                    column: column.to_string(),
                })?;
            let ty = sym.schema.columns[col].ty;
            if !ty.admits(value) {
                return Err(crate::error::SchemaError::Type {
                    relation: sym.name.clone(),
                    column: column.to_string(),
                    expected: ty,
                    got: value.column_type(),
                }
                .into());
            }
            pairs.push((col, value.clone()));
        }
        self.seals.stage(rel_id, SealKey::partition(pairs));
        Ok(())
    }

    /// Stage a global seal: `rel` will never receive another row.
    pub fn seal_all(&mut self, rel: &str) -> EngineResult<()> {
        self.seal(rel, &[])
    }

    // ========================================================================
    // STEP
    // ========================================================================

    /// Run one Deriving/Committing cycle.
    ///
    /// Fails only with [`EngineError::FixpointDiverged`]; such a step has
    /// still admitted its inputs, but applies no derived inserts and no
    /// deletions.
    pub fn advance(&mut self) -> EngineResult<StepReport> {
        let step = self.step + 1;
        self.phase = Phase::Deriving;

        let admitted = self.store.admit();
        let seals_admitted = self.seals.admit();

        let result = self.derive().map(|(iterations, inserts, deletions)| {
            self.phase = Phase::Committing;
            let (inserted, rejected, deleted) = self.commit(inserts, deletions);
            StepReport {
                step,
                iterations,
                admitted,
                seals_admitted,
                inserted,
                rejected,
                deleted,
            }
        });

        self.phase = Phase::Idle;
        self.step = step;
        let report = result?;
        debug!(
            step,
            iterations = report.iterations,
            admitted,
            seals_admitted,
            deleted = report.total_deleted(),
            "step complete"
        );
        Ok(report)
    }

    /// Run `n` steps, returning the last report.
    pub fn advance_many(&mut self, n: usize) -> EngineResult<StepReport> {
        let mut last = StepReport::default();
        for _ in 0..n {
            last = self.advance()?;
        }
        Ok(last)
    }

    #[allow(clippy::type_complexity)]
    fn derive(&mut self) -> EngineResult<(usize, Vec<(RelId, TupleSet)>, Vec<Deletion>)> {
        let mut ephemeral = vec![TupleSet::new(); self.program.catalog().len()];
        let mut iterations = 0;
        for stratum in self.program.strata() {
            let rules: Vec<&Rule> = stratum.collect();
            iterations += self.fixpoint(&rules, &mut ephemeral)?;
        }
        self.ephemeral = ephemeral;

        let view = StepView {
            store: &self.store,
            ephemeral: &self.ephemeral,
            delta: None,
        };

        let mut inserts: Vec<(RelId, TupleSet)> = Vec::new();
        for rule in self.program.deferred_rules() {
            let rows = execute(&rule.body, &view);
            if !rows.is_empty() {
                inserts.push((rule.head, rows));
            }
        }

        let mut deletions = Vec::new();
        if self.config.rse_enabled {
            for plan in self.program.rse_plans() {
                deletions.extend(plan.deletions(&view, &self.seals));
            }
        }
        Ok((iterations, inserts, deletions))
    }

    /// Semi-naive fixpoint for one stratum. Returns the iteration count.
    fn fixpoint(&self, rules: &[&Rule], ephemeral: &mut [TupleSet]) -> EngineResult<usize> {
        let width = ephemeral.len();

        // First round: every rule over the full input.
        let mut delta = vec![TupleSet::new(); width];
        {
            let view = StepView {
                store: &self.store,
                ephemeral: &*ephemeral,
                delta: None,
            };
            for rule in rules {
                for row in execute(&rule.body, &view) {
                    if !view.ephemeral[rule.head].contains(&row) {
                        delta[rule.head].insert(row);
                    }
                }
            }
        }

        let mut iterations = 1;
        loop {
            if delta.iter().all(|d| d.is_empty()) {
                return Ok(iterations);
            }
            for (rel, rows) in delta.iter().enumerate() {
                ephemeral[rel].extend(rows.iter().cloned());
            }
            trace!(
                iteration = iterations,
                new_rows = delta.iter().map(|d| d.len()).sum::<usize>(),
                "fixpoint iteration"
            );
            if iterations >= self.config.max_fixpoint_iterations {
                return Err(EngineError::FixpointDiverged(iterations));
            }

            let mut next = vec![TupleSet::new(); width];
            {
                let view = StepView {
                    store: &self.store,
                    ephemeral: &*ephemeral,
                    delta: Some(delta.as_slice()),
                };
                for rule in rules {
                    for variant in &rule.delta_variants {
                        for row in execute(variant, &view) {
                            if !view.ephemeral[rule.head].contains(&row) {
                                next[rule.head].insert(row);
                            }
                        }
                    }
                }
            }
            delta = next;
            iterations += 1;
        }
    }

    /// Apply screened derived inserts, then deletions. Returns inserted,
    /// dropped and deleted row counts by relation name.
    #[allow(clippy::type_complexity)]
    fn commit(
        &mut self,
        inserts: Vec<(RelId, TupleSet)>,
        deletions: Vec<Deletion>,
    ) -> (
        BTreeMap<String, usize>,
        BTreeMap<String, usize>,
        BTreeMap<String, usize>,
    ) {
        let program = &self.program;
        let configured = self.config.key_conflict;
        let catalog = program.catalog();
        let (inserts, rejected) = self.store.screen_derived(catalog, &self.seals, inserts, |rel| {
            program.key_policy(rel, configured)
        });

        let inserted = self.store.apply_derived(inserts);
        let deleted = self
            .store
            .apply_deletions(deletions.into_iter().map(|d| (d.rel, d.rows)).collect());

        let named = |counts: BTreeMap<RelId, usize>| {
            counts
                .into_iter()
                .map(|(rel, n)| (catalog.name(rel).to_string(), n))
                .collect()
        };
        (named(inserted), named(rejected), named(deleted))
    }

    // ========================================================================
    // QUERY
    // ========================================================================

    /// Current rows of a relation. Persistent relations yield rows in
    /// insertion order; ephemeral relations expose the content computed by
    /// the last completed step.
    pub fn scan(&self, rel: &str) -> EngineResult<Vec<Tuple>> {
        let rel_id = self.resolve(rel)?;
        Ok(match self.store.relation(rel_id) {
            Some(relation) => relation.iter().map(|t| t.to_vec()).collect(),
            None => self.ephemeral[rel_id].iter().cloned().collect(),
        })
    }

    /// [`Engine::scan`], sorted.
    pub fn scan_sorted(&self, rel: &str) -> EngineResult<Vec<Tuple>> {
        let mut rows = self.scan(rel)?;
        rows.sort();
        Ok(rows)
    }

    pub fn contains(&self, rel: &str, row: &[Value]) -> EngineResult<bool> {
        let rel_id = self.resolve(rel)?;
        Ok(match self.store.relation(rel_id) {
            Some(relation) => relation.contains(row),
            None => self.ephemeral[rel_id].contains(row),
        })
    }

    pub fn len(&self, rel: &str) -> EngineResult<usize> {
        let rel_id = self.resolve(rel)?;
        Ok(match self.store.relation(rel_id) {
            Some(relation) => relation.len(),
            None => self.ephemeral[rel_id].len(),
        })
    }

    /// Is the named partition of `rel` closed by an admitted seal mark?
    pub fn is_closed(&self, rel: &str, partition: &[(&str, Value)]) -> EngineResult<bool> {
        let rel_id = self.resolve(rel)?;
        let schema = self.program.catalog().schema(rel_id);
        let mut pairs = Vec::with_capacity(partition.len());
        for (column, value) in partition {
            let col = schema
                .column_index(column)
                .ok_or_else(|| EngineError::UnknownColumn {
                    relation: rel.to_string(),
                    column: column.to_string(),
                })?;
            pairs.push((col, value.clone()));
        }
        Ok(self.seals.is_closed(rel_id, &SealKey::partition(pairs)))
    }

    /// Are there staged inputs the next step would admit?
    pub fn has_pending_input(&self) -> bool {
        self.store.has_staged() || self.seals.has_staged()
    }
}
