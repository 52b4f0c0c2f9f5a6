mod common;

use common::{batch, by_region, engine, scenario_a};
use pivotcore::{
    AggKind, AggSpec, CancellationToken, FilterOp, HavingSpec, HavingTerm, LimitKind, Op,
    PivotConfig, PivotEngine, Progress, ProgressChannel, ROOT, ScalarValue, SortDirection,
    SortSpec,
};

fn sums() -> Vec<AggSpec> {
    vec![
        AggSpec::new("total", AggKind::Sum, vec!["amt"]),
        AggSpec::new("n", AggKind::Count, Vec::<String>::new()),
    ]
}

fn cell(engine: &PivotEngine, path: &[&str], aggregate: &str) -> ScalarValue {
    let tree = engine.contexts()[0].tree();
    let path: Vec<ScalarValue> = path.iter().map(|v| ScalarValue::string(*v)).collect();
    let node = tree.resolve_path(&path).expect("path");
    let col = tree.plan().position(aggregate).expect("aggregate");
    tree.get_aggregate(node, col)
}

fn loaded(config: PivotConfig) -> PivotEngine {
    let mut engine = engine();
    engine.add_context(config).expect("context");
    let input = batch(&engine, &scenario_a(), Op::Insert);
    engine.update(&input, &ProgressChannel::silent()).expect("update");
    engine
}

#[test]
fn scenario_a_sums_by_region() {
    let engine = loaded(by_region(sums()));
    assert_eq!(cell(&engine, &[], "total"), ScalarValue::int64(22));
    assert_eq!(cell(&engine, &["US"], "total"), ScalarValue::int64(15));
    assert_eq!(cell(&engine, &["EU"], "total"), ScalarValue::int64(7));
    assert_eq!(cell(&engine, &[], "n"), ScalarValue::int64(3));
}

#[test]
fn scenario_b_delete_moves_counts() {
    let mut engine = loaded(by_region(sums()));
    let us_before = {
        let tree = engine.contexts()[0].tree();
        let us = tree.resolve_path(&[ScalarValue::string("US")]).expect("us");
        tree.node(us).expect("node").strand_count
    };

    let input = batch(&engine, &[(2, "US", 5, 1)], Op::Delete);
    engine.update(&input, &ProgressChannel::silent()).expect("delete");

    assert_eq!(cell(&engine, &["US"], "total"), ScalarValue::int64(10));
    assert_eq!(cell(&engine, &[], "total"), ScalarValue::int64(17));
    let tree = engine.contexts()[0].tree();
    let us = tree.resolve_path(&[ScalarValue::string("US")]).expect("us");
    let us_after = tree.node(us).expect("node").strand_count;
    assert_eq!(us_after, us_before - 1);
    assert!(us_after > 0);
}

#[test]
fn scenario_c_having_restricts_visible_keys() {
    let mut config = by_region(sums());
    config.having = HavingSpec {
        terms: vec![HavingTerm::new(1, "total", FilterOp::Gt, vec![ScalarValue::int64(10)])],
        ..HavingSpec::default()
    };
    let engine = loaded(config);
    let context = &engine.contexts()[0];

    let visible: Vec<Vec<ScalarValue>> = context
        .visible_rows()
        .into_iter()
        .map(|node| context.tree().get_path(node))
        .collect();
    assert_eq!(visible, vec![vec![], vec![ScalarValue::string("US")]]);
    assert_eq!(cell(&engine, &[], "total"), ScalarValue::int64(15));
    assert_eq!(cell(&engine, &[], "n"), ScalarValue::int64(2));
}

#[test]
fn scenario_d_first_follows_sort_column() {
    let mut engine = engine();
    engine
        .add_context(PivotConfig {
            aggregates: vec![
                AggSpec::new("first", AggKind::First, vec!["amt", "ts"]),
                AggSpec::new("last", AggKind::Last, vec!["amt", "ts"]),
            ],
            ..PivotConfig::default()
        })
        .expect("context");
    let rows = [(1, "US", 30, 3), (2, "US", 10, 1), (3, "EU", 20, 2)];
    let input = batch(&engine, &rows, Op::Insert);
    engine.update(&input, &ProgressChannel::silent()).expect("update");

    assert_eq!(cell(&engine, &[], "first"), ScalarValue::int64(10));
    assert_eq!(cell(&engine, &[], "last"), ScalarValue::int64(30));
}

#[test]
fn rewriting_identical_rows_changes_nothing() {
    let mut config = by_region(sums());
    config.options.track_deltas = true;
    let mut engine = loaded(config);
    let before = engine.contexts()[0].tree().pprint();

    let input = batch(&engine, &scenario_a(), Op::Insert);
    let reports = engine.update(&input, &ProgressChannel::silent()).expect("rewrite");
    assert_eq!(reports[0].aggregate_changes, 0);
    assert_eq!(engine.contexts()[0].tree().pprint(), before);

    let empty = batch(&engine, &[], Op::Insert);
    engine.update(&empty, &ProgressChannel::silent()).expect("empty");
    assert_eq!(engine.contexts()[0].tree().pprint(), before);
}

#[test]
fn emptied_groups_are_pruned() {
    let mut engine = loaded(by_region(sums()));
    let input = batch(&engine, &[(3, "EU", 7, 2)], Op::Delete);
    let reports = engine.update(&input, &ProgressChannel::silent()).expect("delete");
    assert_eq!(reports[0].nodes_removed, 1);

    let tree = engine.contexts()[0].tree();
    assert!(tree.resolve_path(&[ScalarValue::string("EU")]).is_none());
    for idx in tree.dfs() {
        for ancestor in tree.get_ancestry(idx) {
            assert!(tree.node(ancestor).expect("node").strand_count > 0);
        }
    }
}

#[test]
fn emptied_groups_stay_hidden_without_pruning() {
    let mut config = by_region(sums());
    config.options.prune_zero_strands = false;
    let mut engine = loaded(config);
    let input = batch(&engine, &[(3, "EU", 7, 2)], Op::Delete);
    engine.update(&input, &ProgressChannel::silent()).expect("delete");

    let context = &engine.contexts()[0];
    let eu = context
        .tree()
        .resolve_path(&[ScalarValue::string("EU")])
        .expect("eu kept");
    assert!(context.tree().zero_nodes().contains(&eu));
    assert!(!context.visible_rows().contains(&eu));

    // Rows coming back revive the node.
    let input = batch(&engine, &[(4, "EU", 2, 5)], Op::Insert);
    engine.update(&input, &ProgressChannel::silent()).expect("reinsert");
    assert_eq!(cell(&engine, &["EU"], "total"), ScalarValue::int64(2));
}

#[test]
fn limit_keeps_largest_group() {
    let mut config = by_region(sums());
    config.sort =
        vec![SortSpec::new("total", SortDirection::Descending, 1).with_limit(1.0, LimitKind::Items)];
    let engine = loaded(config);
    let context = &engine.contexts()[0];
    assert_eq!(context.visible_rows().len(), 2);
    assert_eq!(cell(&engine, &[], "total"), ScalarValue::int64(15));
}

#[test]
fn cancelled_cycle_catches_up_on_next_update() {
    let mut engine = engine();
    engine.add_context(by_region(sums())).expect("context");

    let token = CancellationToken::new();
    token.cancel();
    let cancelled = ProgressChannel::silent().with_token(token);
    let input = batch(&engine, &scenario_a(), Op::Insert);
    let reports = engine.update(&input, &cancelled).expect("cancelled update");
    assert_eq!(reports[0].progress, Progress::Cancelled);
    assert_eq!(engine.progress(), Progress::Cancelled);
    assert!(engine.contexts()[0].is_stale());
    assert_eq!(engine.export(None).expect("export").size(), 3);

    let input = batch(&engine, &[(4, "EU", 1, 9)], Op::Insert);
    let reports = engine.update(&input, &ProgressChannel::silent()).expect("catch up");
    assert_eq!(reports[0].progress, Progress::Completed);
    assert_eq!(cell(&engine, &[], "total"), ScalarValue::int64(23));
    assert_eq!(cell(&engine, &["EU"], "total"), ScalarValue::int64(8));
}

#[test]
fn progress_sink_sees_both_phases() {
    use std::sync::{Arc, Mutex};

    use pivotcore::Phase;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress = ProgressChannel::silent().with_sink(move |phase: Phase, percent: u8| {
        sink.lock().expect("lock").push((phase, percent));
    });

    let mut engine = engine();
    engine.add_context(by_region(sums())).expect("context");
    let input = batch(&engine, &scenario_a(), Op::Insert);
    engine.update(&input, &progress).expect("update");

    let seen = seen.lock().expect("lock");
    assert!(seen.contains(&(Phase::ShapeUpdate, 100)));
    assert!(seen.contains(&(Phase::AggregateUpdate, 100)));
}

#[test]
fn root_reads_match_every_context() {
    let mut engine = engine();
    engine.add_context(by_region(sums())).expect("by region");
    engine
        .add_context(PivotConfig {
            aggregates: sums(),
            ..PivotConfig::default()
        })
        .expect("flat");
    let input = batch(&engine, &scenario_a(), Op::Insert);
    let reports = engine.update(&input, &ProgressChannel::silent()).expect("update");
    assert_eq!(reports.len(), 2);
    for context in engine.contexts() {
        assert_eq!(context.tree().get_aggregate(ROOT, 0), ScalarValue::int64(22));
    }
}

#[test]
fn json_config_drives_a_context() {
    let json = r#"{
        "row_pivots": [{"column": "region"}],
        "aggregates": [
            {"name": "total", "kind": "sum", "dependencies": ["amt"]},
            {"name": "avg", "kind": "mean", "dependencies": ["amt"]}
        ],
        "sort": [{"column": "total", "direction": "descending", "level": 1}],
        "options": {"grand_total_label": "All", "track_deltas": true}
    }"#;
    let config: PivotConfig = serde_json::from_str(json).expect("config");
    let engine = loaded(config);
    let context = &engine.contexts()[0];

    let labels: Vec<String> = context
        .visible_rows()
        .into_iter()
        .map(|node| context.tree().node(node).expect("node").value.to_string())
        .collect();
    assert_eq!(labels, vec!["All", "US", "EU"]);
    assert_eq!(cell(&engine, &["US"], "avg"), ScalarValue::float64(7.5));
    assert!(!context.deltas().is_empty());
}

#[test]
fn cycle_report_serializes_to_one_line() {
    let mut engine = engine();
    engine.add_context(by_region(sums())).expect("context");
    let input = batch(&engine, &scenario_a(), Op::Insert);
    let reports = engine.update(&input, &ProgressChannel::silent()).expect("update");

    let line = reports[0].to_json_line().expect("json");
    assert!(!line.contains('\n'));
    let value: serde_json::Value = serde_json::from_str(&line).expect("parse");
    assert_eq!(value["input_rows"], 3);
    assert_eq!(value["nodes_created"], 2);
    assert_eq!(value["progress"], "completed");
}
