//! End-to-end tests for Redundant State Elimination.
//!
//! Each scenario drives an engine through the "advance twice" idiom: inputs
//! staged before a pair of advances are fully settled (derived outputs and
//! the deletions they enable) once the pair completes.

use rse_engine::rse::RseInput;
use rse_engine::store::RelationStorage;
use rse_engine::{
    Column, Engine, EngineConfig, EngineError, Expr, JoinCond, JoinOutput, KeyConflictPolicy,
    Program, ProgramBuilder, Schema, Tuple, Value,
};

macro_rules! row {
    ($($v:expr),* $(,)?) => { vec![$(Value::from($v)),*] };
}

fn sorted(engine: &Engine, rel: &str) -> Vec<Tuple> {
    engine.scan_sorted(rel).unwrap()
}

fn keyed(keys: &[&str], values: &[&str]) -> Schema {
    Schema::keyed(
        keys.iter().map(|n| Column::any(*n)).collect(),
        values.iter().map(|n| Column::any(*n)).collect(),
    )
}

// ============================================================================
// PROGRAMS
// ============================================================================

/// `res <= sbuf.notin(res_approx)`
fn simple_rse() -> Program {
    let mut b = ProgramBuilder::new();
    b.table("sbuf", keyed(&["id"], &["val"])).unwrap();
    b.scratch("res", keyed(&["id"], &["val"])).unwrap();
    b.table("res_approx", keyed(&["id"], &["val"])).unwrap();
    let body = b.scan("sbuf").unwrap().antijoin(b.scan("res_approx").unwrap(), None);
    b.rule("res", body).unwrap();
    b.build().unwrap()
}

/// `res <= sbuf.notin(sbuf_val_seen, :val => :val)`
fn simple_rse_qual() -> Program {
    let mut b = ProgramBuilder::new();
    b.table("sbuf", keyed(&["id"], &["val"])).unwrap();
    b.scratch("res", keyed(&["id"], &["val"])).unwrap();
    b.table("sbuf_val_seen", Schema::of_names(&["val"])).unwrap();
    let qual = b.qualifier("sbuf", "sbuf_val_seen", &[("val", "val")]).unwrap();
    let body = b
        .scan("sbuf")
        .unwrap()
        .antijoin(b.scan("sbuf_val_seen").unwrap(), Some(qual));
    b.rule("res", body).unwrap();
    b.build().unwrap()
}

/// `res <= ((sbuf * node).pairs(:epoch => :epoch) {|s,n| [n.addr] + s}).notin(res_approx)`
fn join_rse() -> Program {
    let mut b = ProgramBuilder::new();
    b.table("node", Schema::of_names(&["addr", "epoch"])).unwrap();
    b.table("sbuf", keyed(&["id"], &["epoch", "val"])).unwrap();
    b.scratch("res", Schema::of_names(&["addr", "id", "epoch", "val"])).unwrap();
    b.table("res_approx", Schema::of_names(&["addr", "id", "epoch", "val"])).unwrap();
    let cond = b.pairs("sbuf", "node", &[("epoch", "epoch")]).unwrap();
    let joined = b.scan("sbuf").unwrap().join(
        b.scan("node").unwrap(),
        cond,
        vec![
            JoinOutput::Right(0),
            JoinOutput::Left(0),
            JoinOutput::Left(1),
            JoinOutput::Left(2),
        ],
    );
    let body = joined.antijoin(b.scan("res_approx").unwrap(), None);
    b.rule("res", body).unwrap();
    b.build().unwrap()
}

/// `res <= ((sbuf * node).pairs {|s,n| s + n}).notin(res_approx)`
fn join_rse_no_qual() -> Program {
    let mut b = ProgramBuilder::new();
    b.table("node", Schema::of_names(&["addr"])).unwrap();
    b.table("sbuf", keyed(&["id"], &["val"])).unwrap();
    b.scratch("res", Schema::of_names(&["id", "val", "addr"])).unwrap();
    b.table("res_approx", Schema::of_names(&["id", "val", "addr"])).unwrap();
    let cond = b.pairs("sbuf", "node", &[]).unwrap();
    assert_eq!(cond, JoinCond::Cross);
    let joined = b.scan("sbuf").unwrap().join(
        b.scan("node").unwrap(),
        cond,
        vec![JoinOutput::Left(0), JoinOutput::Left(1), JoinOutput::Right(0)],
    );
    let body = joined.antijoin(b.scan("res_approx").unwrap(), None);
    b.rule("res", body).unwrap();
    b.build().unwrap()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_simple_rse() {
    let mut e = Engine::new(simple_rse());
    e.insert("sbuf", [[5, 10], [6, 12]]).unwrap();
    e.advance().unwrap();
    e.insert("res_approx", [[5, 10]]).unwrap();
    e.advance().unwrap();
    e.advance().unwrap();

    assert_eq!(sorted(&e, "sbuf"), vec![row![6, 12]]);
}

#[test]
fn test_simple_rse_qual() {
    let mut e = Engine::new(simple_rse_qual());
    e.insert("sbuf", [[1, 5], [2, 5], [3, 6]]).unwrap();
    e.advance().unwrap();
    assert_eq!(sorted(&e, "res"), vec![row![1, 5], row![2, 5], row![3, 6]]);

    e.insert("sbuf_val_seen", [[5]]).unwrap();
    e.advance().unwrap();
    e.advance().unwrap();

    assert_eq!(sorted(&e, "res"), vec![row![3, 6]]);
    assert_eq!(sorted(&e, "sbuf"), vec![row![3, 6]]);
}

#[test]
fn test_join_rse() {
    let mut e = Engine::new(join_rse());
    e.insert_tuples("node", vec![row!["foo", 1], row!["bar", 1], row!["bar", 2]])
        .unwrap();
    e.insert_tuples("sbuf", vec![row![100, 1, "x"], row![101, 1, "y"]])
        .unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1, "x"], row![101, 1, "y"]]);
    assert_eq!(
        sorted(&e, "node"),
        vec![row!["bar", 1], row!["bar", 2], row!["foo", 1]]
    );

    e.insert_tuples(
        "res_approx",
        vec![row!["foo", 100, 1, "x"], row!["foo", 101, 1, "y"]],
    )
    .unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1, "x"], row![101, 1, "y"]]);
    assert_eq!(
        sorted(&e, "node"),
        vec![row!["bar", 1], row!["bar", 2], row!["foo", 1]]
    );

    // No more messages in epoch 1
    e.seal("sbuf", &[("epoch", 1.into())]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1, "x"], row![101, 1, "y"]]);
    assert_eq!(sorted(&e, "node"), vec![row!["bar", 1], row!["bar", 2]]);

    // No more node addresses in epoch 1
    e.seal("node", &[("epoch", 1.into())]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1, "x"], row![101, 1, "y"]]);
    assert_eq!(sorted(&e, "node"), vec![row!["bar", 1], row!["bar", 2]]);

    e.insert_tuples("res_approx", vec![row!["bar", 100, 1, "x"]])
        .unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![101, 1, "y"]]);
    assert_eq!(sorted(&e, "node"), vec![row!["bar", 1], row!["bar", 2]]);

    e.insert_tuples("res_approx", vec![row!["bar", 101, 1, "y"]])
        .unwrap();
    e.advance_many(2).unwrap();
    assert!(sorted(&e, "sbuf").is_empty());
    assert_eq!(sorted(&e, "node"), vec![row!["bar", 2]]);
}

#[test]
fn test_join_rse_no_qual() {
    let mut e = Engine::new(join_rse_no_qual());
    e.insert("node", [["foo"], ["bar"]]).unwrap();
    e.insert_tuples("sbuf", vec![row![1, "x"], row![2, "y"], row![3, "z"]])
        .unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "node"), vec![row!["bar"], row!["foo"]]);
    assert_eq!(sorted(&e, "sbuf"), vec![row![1, "x"], row![2, "y"], row![3, "z"]]);

    e.seal_all("node").unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "node"), vec![row!["bar"], row!["foo"]]);
    assert_eq!(sorted(&e, "sbuf"), vec![row![1, "x"], row![2, "y"], row![3, "z"]]);

    e.insert_tuples(
        "res_approx",
        vec![
            row![1, "x", "foo"],
            row![2, "y", "bar"],
            row![3, "z", "foo"],
            row![3, "z", "bar"],
        ],
    )
    .unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "node"), vec![row!["bar"], row!["foo"]]);
    assert_eq!(sorted(&e, "sbuf"), vec![row![1, "x"], row![2, "y"]]);

    e.insert_tuples("res_approx", vec![row![2, "y", "foo"]]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "node"), vec![row!["bar"], row!["foo"]]);
    assert_eq!(sorted(&e, "sbuf"), vec![row![1, "x"]]);

    e.seal_all("sbuf").unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "node"), vec![row!["bar"]]);
    assert_eq!(sorted(&e, "sbuf"), vec![row![1, "x"]]);

    e.insert_tuples("res_approx", vec![row![1, "x", "bar"]]).unwrap();
    e.advance_many(2).unwrap();
    assert!(sorted(&e, "node").is_empty());
    assert!(sorted(&e, "sbuf").is_empty());
}

// ============================================================================
// PLANNER BEHAVIOUR
// ============================================================================

#[test]
fn test_empty_witness_deletes_nothing() {
    let mut e = Engine::new(simple_rse());
    e.insert("sbuf", [[1, 1], [2, 2]]).unwrap();
    let report = e.advance_many(3).unwrap();
    assert_eq!(report.total_deleted(), 0);
    assert_eq!(e.len("sbuf").unwrap(), 2);
    assert_eq!(e.len("res").unwrap(), 2);
}

#[test]
fn test_step_report_counts_deletions() {
    let mut e = Engine::new(simple_rse());
    e.insert("sbuf", [[1, 1], [2, 2]]).unwrap();
    e.insert("res_approx", [[1, 1]]).unwrap();
    let report = e.advance().unwrap();
    assert_eq!(report.step, 1);
    assert_eq!(report.admitted, 3);
    assert_eq!(report.deleted.get("sbuf"), Some(&1));
    assert_eq!(e.len("sbuf").unwrap(), 1);
    // The derived result was computed before the deletion
    assert_eq!(e.len("res").unwrap(), 1);
}

#[test]
fn test_rse_disabled_keeps_rows() {
    let mut e = Engine::with_config(simple_rse(), EngineConfig::default().with_rse(false));
    e.insert("sbuf", [[5, 10], [6, 12]]).unwrap();
    e.insert("res_approx", [[5, 10]]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(e.len("sbuf").unwrap(), 2);
    assert_eq!(sorted(&e, "res"), vec![row![6, 12]]);
}

#[test]
fn test_shared_reader_is_not_collected() {
    let mut b = ProgramBuilder::new();
    b.table("sbuf", keyed(&["id"], &["val"])).unwrap();
    b.table("res_approx", keyed(&["id"], &["val"])).unwrap();
    b.scratch("res", keyed(&["id"], &["val"])).unwrap();
    b.scratch("audit", keyed(&["id"], &["val"])).unwrap();
    let body = b.scan("sbuf").unwrap().antijoin(b.scan("res_approx").unwrap(), None);
    b.rule("res", body).unwrap();
    b.rule("audit", b.scan("sbuf").unwrap()).unwrap();
    let program = b.build().unwrap();
    assert!(program.rse_plans().is_empty());
    assert_eq!(program.rse_skips().len(), 1);
    assert_eq!(program.rse_skips()[0].relation, "sbuf");

    let mut e = Engine::new(program);
    e.insert("sbuf", [[5, 10]]).unwrap();
    e.insert("res_approx", [[5, 10]]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(e.len("sbuf").unwrap(), 1);
    assert_eq!(e.len("audit").unwrap(), 1);
}

#[test]
fn test_partition_seal_does_not_close_other_partitions() {
    let mut e = Engine::new(join_rse());
    e.insert_tuples("node", vec![row!["a", 2]]).unwrap();
    e.insert_tuples("sbuf", vec![row![7, 2, "z"]]).unwrap();
    e.insert_tuples("res_approx", vec![row!["a", 7, 2, "z"]]).unwrap();
    e.seal("node", &[("epoch", 1.into())]).unwrap();
    e.seal("sbuf", &[("epoch", 1.into())]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(e.len("sbuf").unwrap(), 1);
    assert_eq!(e.len("node").unwrap(), 1);
    assert!(e.is_closed("node", &[("epoch", 1.into())]).unwrap());
    assert!(!e.is_closed("node", &[("epoch", 2.into())]).unwrap());

    e.seal("node", &[("epoch", 2.into())]).unwrap();
    e.seal("sbuf", &[("epoch", 2.into())]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(e.len("sbuf").unwrap(), 0);
    assert_eq!(e.len("node").unwrap(), 0);
}

#[test]
fn test_global_seal_closes_every_partition() {
    let mut e = Engine::new(join_rse());
    e.insert_tuples("node", vec![row!["a", 3]]).unwrap();
    e.insert_tuples("sbuf", vec![row![8, 3, "q"]]).unwrap();
    e.insert_tuples("res_approx", vec![row!["a", 8, 3, "q"]]).unwrap();
    e.seal_all("node").unwrap();
    e.advance_many(2).unwrap();
    assert!(e.is_closed("node", &[("epoch", 3.into())]).unwrap());
    // Only sbuf's partner is closed
    assert_eq!(e.len("sbuf").unwrap(), 0);
    assert_eq!(e.len("node").unwrap(), 1);
}

#[test]
fn test_mapped_antijoin_deletes_matched_rows() {
    // res <= sbuf { |s| [s.id] }.notin(acked)
    let mut b = ProgramBuilder::new();
    b.table("sbuf", Schema::of_names(&["id", "val"])).unwrap();
    b.table("acked", Schema::of_names(&["id"])).unwrap();
    b.scratch("res", Schema::of_names(&["id"])).unwrap();
    let body = b
        .project("sbuf", &["id"])
        .unwrap()
        .antijoin(b.scan("acked").unwrap(), None);
    b.rule("res", body).unwrap();
    let program = b.build().unwrap();
    assert_eq!(
        program.rse_plans()[0].input,
        RseInput::Simple {
            left: program.lookup("sbuf").unwrap(),
            map: Some(vec![Expr::Col(0)]),
        }
    );

    let mut e = Engine::new(program);
    e.insert_tuples("sbuf", vec![row![1, "a"], row![2, "b"], row![1, "c"]])
        .unwrap();
    e.advance().unwrap();
    assert_eq!(sorted(&e, "res"), vec![row![1], row![2]]);

    e.insert("acked", [[1]]).unwrap();
    let report = e.advance().unwrap();
    assert_eq!(report.deleted.get("sbuf"), Some(&2));
    e.advance().unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![2, "b"]]);
    assert_eq!(sorted(&e, "res"), vec![row![2]]);
}

#[test]
fn test_qualified_join_plan() {
    // res <= (sbuf * node).pairs(:epoch => :epoch) { |s, n| [n.addr, s.id, s.epoch] }
    //            .notin(acked, 0 => :addr, 1 => :id)
    let mut b = ProgramBuilder::new();
    b.table("sbuf", Schema::of_names(&["id", "epoch"])).unwrap();
    b.table("node", Schema::of_names(&["addr", "epoch"])).unwrap();
    b.table("acked", Schema::of_names(&["addr", "id"])).unwrap();
    b.scratch("res", Schema::of_names(&["addr", "id", "epoch"])).unwrap();
    let cond = b.pairs("sbuf", "node", &[("epoch", "epoch")]).unwrap();
    let joined = b.scan("sbuf").unwrap().join(
        b.scan("node").unwrap(),
        cond,
        vec![JoinOutput::Right(0), JoinOutput::Left(0), JoinOutput::Left(1)],
    );
    let body = joined.antijoin(b.scan("acked").unwrap(), Some(vec![(0, 0), (1, 1)]));
    b.rule("res", body).unwrap();
    let program = b.build().unwrap();
    assert_eq!(program.rse_plans()[0].qualifier, Some(vec![(0, 0), (1, 1)]));

    let mut e = Engine::new(program);
    e.insert_tuples("node", vec![row!["foo", 1], row!["bar", 1]]).unwrap();
    e.insert("sbuf", [[100, 1]]).unwrap();
    e.seal("sbuf", &[("epoch", 1.into())]).unwrap();
    e.seal("node", &[("epoch", 1.into())]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "res"), vec![row!["bar", 100, 1], row!["foo", 100, 1]]);
    assert_eq!(e.len("node").unwrap(), 2);

    // Only the foo pairing is acknowledged: foo's node row has nothing left
    // to contribute, the sbuf row still pairs with bar
    e.insert_tuples("acked", vec![row!["foo", 100]]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "res"), vec![row!["bar", 100, 1]]);
    assert_eq!(sorted(&e, "node"), vec![row!["bar", 1]]);
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1]]);

    e.insert_tuples("acked", vec![row!["bar", 100]]).unwrap();
    e.advance_many(2).unwrap();
    assert!(sorted(&e, "res").is_empty());
    assert!(sorted(&e, "node").is_empty());
    assert!(sorted(&e, "sbuf").is_empty());
}

#[test]
fn test_deleted_rows_release_storage() {
    let mut e = Engine::new(simple_rse());
    let sbuf = e.program().lookup("sbuf").unwrap();
    for id in 0..300 {
        e.insert("sbuf", [[id, id * 2]]).unwrap();
        e.insert("res_approx", [[id, id * 2]]).unwrap();
        e.advance_many(2).unwrap();
    }
    let relation = e.store().relation(sbuf).unwrap();
    assert!(relation.is_empty());
    assert!(relation.slot_count() <= 64, "sbuf holds {} slots", relation.slot_count());
    assert_eq!(e.len("res_approx").unwrap(), 300);
}

#[test]
fn test_replace_policy_never_shrinks_witness() {
    let config = EngineConfig::default().with_key_conflict(KeyConflictPolicy::Replace);
    let mut rse = Engine::with_config(simple_rse(), config.clone());
    let mut baseline = Engine::with_config(simple_rse(), config.with_rse(false));
    let witness = rse.program().lookup("res_approx").unwrap();
    assert_eq!(
        rse.program().key_policy(witness, KeyConflictPolicy::Replace),
        KeyConflictPolicy::Reject
    );

    for e in [&mut rse, &mut baseline] {
        e.insert("sbuf", [[5, 10]]).unwrap();
        e.insert("res_approx", [[5, 10]]).unwrap();
        e.advance_many(2).unwrap();

        // A second witness for key 5 would displace the first
        assert!(matches!(
            e.insert("res_approx", [[5, 11]]),
            Err(EngineError::KeyConflict { .. })
        ));
        e.advance_many(2).unwrap();
        assert_eq!(sorted(e, "res_approx"), vec![row![5, 10]]);
    }
    assert_eq!(sorted(&rse, "res"), sorted(&baseline, "res"));
    assert!(sorted(&rse, "res").is_empty());
    assert!(sorted(&rse, "sbuf").is_empty());
    assert_eq!(sorted(&baseline, "sbuf"), vec![row![5, 10]]);

    // Non-witness relations still follow the configured policy
    rse.insert("sbuf", [[6, 1]]).unwrap();
    rse.advance().unwrap();
    rse.insert("sbuf", [[6, 2]]).unwrap();
    rse.advance().unwrap();
    assert_eq!(sorted(&rse, "sbuf"), vec![row![6, 2]]);
}

#[test]
fn test_relation_fed_by_a_rule_is_never_collected() {
    // sbuf <= src, and sbuf is the left side of a join antijoin
    let mut b = ProgramBuilder::new();
    b.table("src", Schema::of_names(&["id", "epoch"])).unwrap();
    b.table("sbuf", Schema::of_names(&["id", "epoch"])).unwrap();
    b.table("node", Schema::of_names(&["addr", "epoch"])).unwrap();
    b.table("res_approx", Schema::of_names(&["addr", "id", "epoch"])).unwrap();
    b.scratch("res", Schema::of_names(&["addr", "id", "epoch"])).unwrap();
    b.rule("sbuf", b.scan("src").unwrap()).unwrap();
    let cond = b.pairs("sbuf", "node", &[("epoch", "epoch")]).unwrap();
    let joined = b.scan("sbuf").unwrap().join(
        b.scan("node").unwrap(),
        cond,
        vec![JoinOutput::Right(0), JoinOutput::Left(0), JoinOutput::Left(1)],
    );
    let body = joined.antijoin(b.scan("res_approx").unwrap(), None);
    b.rule("res", body).unwrap();
    let program = b.build().unwrap();

    let skip = program
        .rse_skips()
        .iter()
        .find(|s| s.relation == "sbuf")
        .unwrap();
    assert_eq!(skip.reason, "relation is written by a rule");
    assert!(matches!(
        program.rse_plans()[0].input,
        RseInput::Join {
            delete_left: false,
            delete_right: true,
            ..
        }
    ));

    let mut e = Engine::new(program);
    e.insert("src", [[100, 1]]).unwrap();
    e.insert_tuples("node", vec![row!["a", 1]]).unwrap();
    e.insert_tuples("res_approx", vec![row!["a", 100, 1]]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1]]);

    e.seal("sbuf", &[("epoch", 1.into())]).unwrap();
    e.seal("node", &[("epoch", 1.into())]).unwrap();
    for _ in 0..4 {
        let report = e.advance().unwrap();
        assert!(report.rejected.is_empty());
    }
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1]]);
    assert!(sorted(&e, "node").is_empty());

    // The engine keeps committing new work
    e.insert("src", [[200, 2]]).unwrap();
    e.advance_many(2).unwrap();
    assert_eq!(sorted(&e, "sbuf"), vec![row![100, 1], row![200, 2]]);
}
