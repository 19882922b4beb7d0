mod common;

use common::*;
use pivot_view::{ContextConfig, ContextKind, DType, EngineError, FilterOp, Scalar, SortDirection};
use serde_json::json;

#[test]
fn test_filtered_view_ignores_rows_that_never_pass() {
    let pipeline = setup(sales_schema());
    let config = ContextConfig::new().filter("region", FilterOp::Eq, json!("eu"));
    let view = pipeline.register_view("eu_only", config).unwrap();
    assert_eq!(view.kind(), ContextKind::Flat);

    pipeline
        .update(vec![sale("1", "eu", "a", 1, 1.0), sale("2", "us", "a", 1, 1.0)])
        .unwrap();
    let _ = view.get_row_delta();

    pipeline.update(vec![sale("2", "us", "b", 5, 1.0)]).unwrap();
    assert!(!view.has_deltas());
    assert_eq!(view.get_row_delta().num_rows_changed(), 0);

    // entering the filter is reported
    pipeline.update(vec![sale("2", "eu", "b", 5, 1.0)]).unwrap();
    let delta = view.get_row_delta();
    assert_eq!(delta.num_rows_changed(), 1);
    assert_eq!(delta.num_rows, 2);
}

#[test]
fn test_delete_outside_filter_still_raises_flag() {
    let pipeline = setup(sales_schema());
    let config = ContextConfig::new().filter("qty", FilterOp::Gt, json!(100));
    let view = pipeline.register_view("big", config).unwrap();
    pipeline.update(vec![sale("1", "eu", "a", 1, 1.0)]).unwrap();
    let _ = view.get_row_delta();
    pipeline.update(vec![del_sale("1")]).unwrap();
    assert!(view.has_deltas());
}

#[test]
fn test_sorted_projection_with_computed_column() {
    let pipeline = setup(sales_schema());
    let config = ContextConfig::new()
        .project(&["id", "region"])
        .computed("revenue", "qty * price")
        .sort_by("revenue", SortDirection::Desc);
    let view = pipeline.register_view("revenue", config).unwrap();
    pipeline
        .update(vec![
            sale("1", "eu", "a", 2, 5.0),
            sale("2", "us", "a", 1, 30.0),
            sale("3", "eu", "b", 4, 1.0),
        ])
        .unwrap();

    assert_eq!(view.get_column_names(), vec!["id", "region", "revenue"]);
    assert_eq!(view.get_column_dtype(2), DType::Float);
    assert_eq!(
        all_rows(&view),
        vec![
            row(&[Scalar::str("2"), Scalar::str("us"), Scalar::Float(30.0)]),
            row(&[Scalar::str("1"), Scalar::str("eu"), Scalar::Float(10.0)]),
            row(&[Scalar::str("3"), Scalar::str("eu"), Scalar::Float(4.0)]),
        ]
    );

    // re-sorting moves only the changed key
    pipeline.update(vec![sale("3", "eu", "b", 40, 1.0)]).unwrap();
    let ids: Vec<Scalar> = all_rows(&view).into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, vec![Scalar::str("3"), Scalar::str("2"), Scalar::str("1")]);
    let delta = view.get_row_delta();
    assert_eq!(delta.row_indices, vec![0]);
}

#[test]
fn test_ties_keep_insertion_order() {
    let pipeline = setup(sales_schema());
    let config = ContextConfig::new().sort_by("region", SortDirection::Asc);
    let view = pipeline.register_view("by_region", config).unwrap();
    pipeline
        .update(vec![
            sale("c", "us", "a", 1, 1.0),
            sale("a", "eu", "a", 1, 1.0),
            sale("b", "eu", "a", 1, 1.0),
        ])
        .unwrap();
    let ids: Vec<Scalar> = all_rows(&view).into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, vec![Scalar::str("a"), Scalar::str("b"), Scalar::str("c")]);
}

#[test]
fn test_filter_operators() {
    let pipeline = setup(sales_schema());
    let starts = pipeline
        .register_view(
            "starts",
            ContextConfig::new().filter("region", FilterOp::BeginsWith, json!("a")),
        )
        .unwrap();
    let listed = pipeline
        .register_view(
            "listed",
            ContextConfig::new().filter("id", FilterOp::In, json!(["1", "3"])),
        )
        .unwrap();
    let ranged = pipeline
        .register_view(
            "ranged",
            ContextConfig::new()
                .filter("qty", FilterOp::Gte, json!(2))
                .filter("price", FilterOp::Lt, json!(10)),
        )
        .unwrap();

    pipeline
        .update(vec![
            sale("1", "apac", "a", 1, 1.0),
            sale("2", "eu", "a", 2, 5.0),
            sale("3", "amer", "a", 3, 50.0),
        ])
        .unwrap();
    assert_eq!(starts.get_row_count(), 2);
    assert_eq!(listed.get_row_count(), 2);
    assert_eq!(ranged.get_row_count(), 1);
    assert_eq!(ranged.get_pkeys(&[(0, 0)]).unwrap(), vec![Scalar::str("2")]);
}

#[test]
fn test_bad_expression_is_rejected_at_registration() {
    let pipeline = setup(sales_schema());
    let err = pipeline
        .register_view("broken", ContextConfig::new().computed("x", "qty * (price"))
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Expression { .. }));
    assert!(pipeline.view_names().is_empty());
}

#[test]
fn test_unknown_projection_column_reads_as_null() {
    let pipeline = setup(sales_schema());
    let view = pipeline
        .register_view("ghost", ContextConfig::new().project(&["id", "ghost"]))
        .unwrap();
    pipeline.update(vec![sale("1", "eu", "a", 1, 1.0)]).unwrap();
    assert_eq!(all_rows(&view), vec![row(&[Scalar::str("1"), Scalar::None])]);
    assert_eq!(view.get_column_dtype(1), DType::None);
}
