mod common;

use common::*;
use pivot_view::{
    AggFunc, AggSpec, ContextConfig, ContextKind, EngineConfig, EngineError, Pipeline, Scalar,
    SymbolTable,
};
use std::sync::Arc;
use std::thread;

#[test]
fn test_duplicate_registration_leaves_existing_view_working() {
    let pipeline = setup(kv_schema());
    let view = pipeline.register_view("v", ContextConfig::default()).unwrap();
    let dup = pipeline.register_view("v", ContextConfig::new().row_pivot("pkey"));
    assert!(matches!(dup, Err(EngineError::AlreadyExists(name)) if name == "v"));

    pipeline.update(vec![ins("a", 1)]).unwrap();
    assert_eq!(view.get_row_count(), 1);
    assert_eq!(pipeline.view("v").unwrap().kind(), ContextKind::Unit);
}

#[test]
fn test_view_registered_after_data_sees_existing_rows() {
    let pipeline = setup(kv_schema());
    pipeline.update(vec![ins("a", 1), ins("b", 2)]).unwrap();

    let unit = pipeline.register_view("late", ContextConfig::default()).unwrap();
    let totals = pipeline
        .register_view(
            "late_totals",
            ContextConfig::new()
                .row_pivot("pkey")
                .aggregate(AggSpec::new("value", AggFunc::Sum)),
        )
        .unwrap();
    assert_eq!(unit.get_row_count(), 2);
    assert_eq!(all_rows(&totals)[0], row(&[Scalar::str("Total"), Scalar::Int(3)]));

    pipeline.update(vec![ins("c", 4)]).unwrap();
    assert_eq!(all_rows(&totals)[0][1], Scalar::Int(7));
    let delta = unit.get_row_delta();
    assert_eq!(delta.num_rows_changed(), 1);
}

#[test]
fn test_unregistered_view_stops_receiving_updates() {
    let pipeline = setup(kv_schema());
    let view = pipeline.register_view("gone", ContextConfig::default()).unwrap();
    pipeline.unregister_view("gone").unwrap();
    let report = pipeline.update(vec![ins("a", 1)]).unwrap();
    assert_eq!(report.views_notified, 0);
    assert_eq!(view.get_row_count(), 0);
    assert!(matches!(
        pipeline.unregister_view("gone"),
        Err(EngineError::UnknownView(_))
    ));
}

#[test]
fn test_config_deserializes_from_json_and_yaml() {
    let from_json: ContextConfig = serde_json::from_value(serde_json::json!({
        "row_pivots": ["region"],
        "aggregates": [{"column": "qty", "func": "sum", "alias": "units"}],
        "filters": [{"column": "qty", "op": ">", "value": 0}],
        "sort": [{"column": "units", "direction": "desc"}],
        "expand_depth": 1
    }))
    .unwrap();
    assert_eq!(from_json.kind(), ContextKind::GroupedByOne);

    let from_yaml: ContextConfig = serde_yaml::from_str(
        "row_pivots: [region]\ncolumn_pivots: [kind]\naggregates:\n  - {column: qty, func: distinct_count}\n",
    )
    .unwrap();
    assert_eq!(from_yaml.kind(), ContextKind::GroupedByTwo);

    let pipeline = setup(sales_schema());
    pipeline.register_view("json", from_json).unwrap();
    pipeline.register_view("yaml", from_yaml).unwrap();
    assert_eq!(pipeline.view_names(), vec!["json", "yaml"]);
}

#[test]
fn test_many_views_fan_out_on_worker_pool() {
    let config = EngineConfig {
        worker_threads: Some(3),
        parallel_threshold: 2,
        ..EngineConfig::default()
    };
    let pipeline = Pipeline::with_symbols(sales_schema(), config, Arc::new(SymbolTable::new())).unwrap();
    let names: Vec<String> = (0..8).map(|i| format!("view_{}", i)).collect();
    for (i, name) in names.iter().enumerate() {
        let config = match i % 3 {
            0 => ContextConfig::default(),
            1 => ContextConfig::new().project(&["id", "qty"]),
            _ => ContextConfig::new()
                .row_pivot("region")
                .aggregate(AggSpec::new("qty", AggFunc::Sum)),
        };
        pipeline.register_view(name, config).unwrap();
    }

    let report = pipeline
        .update((0..50).map(|i| sale(&i.to_string(), "eu", "a", 1, 1.0)).collect())
        .unwrap();
    assert_eq!(report.views_notified, 8);
    assert_eq!(report.inserted, 50);
    for name in &names {
        let view = pipeline.view(name).unwrap();
        assert!(view.has_deltas(), "{} missed the batch", name);
    }
    let pivot = pipeline.view("view_2").unwrap();
    assert_eq!(all_rows(&pivot)[0][1], Scalar::Int(50));
}

#[test]
fn test_readers_never_observe_partial_batches() {
    let pipeline = Arc::new(setup(kv_schema()));
    let unit = pipeline.register_view("unit", ContextConfig::default()).unwrap();
    let totals = pipeline
        .register_view(
            "totals",
            ContextConfig::new()
                .row_pivot("pkey")
                .aggregate(AggSpec::new("value", AggFunc::Count)),
        )
        .unwrap();

    let writer = {
        let pipeline = pipeline.clone();
        thread::spawn(move || {
            for i in 0..100 {
                pipeline
                    .update(vec![ins(&format!("a{}", i), 1), ins(&format!("b{}", i), 1)])
                    .unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let unit = unit.clone();
            let totals = totals.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let block = unit.get_data(0, i64::MAX, 0, 2);
                    assert_eq!(block.num_rows() % 2, 0);
                    let root = totals.get_data(0, 1, 0, 2);
                    match root.get(0, 1) {
                        Some(Scalar::Int(n)) => assert_eq!(n % 2, 0),
                        Some(Scalar::None) | None => {}
                        other => panic!("unexpected root cell {:?}", other),
                    }
                    let _ = unit.get_row_delta();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(unit.get_row_count(), 200);
    assert_eq!(all_rows(&totals)[0][1], Scalar::Int(200));
}
