//! Runs the bundled fixture scripts from disk.

mod common;

use dsl_host::dsl_execution::{DslHost, FileSystemResolver, HostConfig};
use dsl_host::{BridgedValue, ResourceBudget};
use std::sync::Arc;

fn fixture_host() -> DslHost {
    common::init_logging();
    let resolver = Arc::new(FileSystemResolver::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/fixtures"
    )));
    DslHost::new(resolver, HostConfig::default()).unwrap()
}

fn ints(values: &[i64]) -> BridgedValue {
    BridgedValue::Sequence(values.iter().map(|v| BridgedValue::Int(*v)).collect())
}

#[test]
fn test_config_fixture() {
    let host = fixture_host();
    let config = host
        .run("config", "get_config", vec![], ResourceBudget::default())
        .into_result()
        .unwrap();

    let keys: Vec<&str> = config
        .as_mapping()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        keys,
        vec!["database_url", "features", "max_connections", "redis_url", "timeout"]
    );
    assert_eq!(config.get("redis_url"), Some(&BridgedValue::from("redis://localhost:6379")));
    assert_eq!(config.get("timeout"), Some(&BridgedValue::Int(30)));

    let features = config.get("features").unwrap();
    assert_eq!(features.get("enable_metrics"), Some(&BridgedValue::Bool(true)));
    assert_eq!(features.get("debug_mode"), Some(&BridgedValue::Bool(false)));

    let via_main = host
        .run("config", "main", vec![], ResourceBudget::default())
        .into_result()
        .unwrap();
    assert_eq!(via_main, config);
}

#[test]
fn test_config_fixture_globals() {
    let host = fixture_host();
    let url = host.read_global("config", "DATABASE_URL", ResourceBudget::default());
    assert_eq!(
        url.value(),
        Some(&BridgedValue::from("postgresql://localhost:5432/rust202"))
    );
}

#[test]
fn test_transform_fixture() {
    let host = fixture_host();
    let input = ints(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

    let squares = host.run("transform", "transform", vec![input.clone()], ResourceBudget::default());
    assert_eq!(squares.value(), Some(&ints(&[4, 16, 36, 64, 100])));

    let doubled = host.run(
        "transform",
        "filter_and_map",
        vec![input, BridgedValue::from(5)],
        ResourceBudget::default(),
    );
    assert_eq!(doubled.value(), Some(&ints(&[12, 14, 16, 18, 20])));
}

#[test]
fn test_transform_fixture_main() {
    let host = fixture_host();
    let summary = host
        .run("transform", "main", vec![], ResourceBudget::default())
        .into_result()
        .unwrap();

    assert_eq!(summary.get("count"), Some(&BridgedValue::Int(5)));
    assert_eq!(summary.get("output"), Some(&ints(&[4, 16, 36, 64, 100])));
    assert_eq!(
        summary.get("input").and_then(BridgedValue::as_sequence).map(<[_]>::len),
        Some(10)
    );
}

#[test]
fn test_fixture_entry_points() {
    let host = fixture_host();
    let mut names: Vec<String> = host
        .entry_points("transform")
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "filter_and_map(items, threshold)".to_string(),
            "main()".to_string(),
            "transform(items)".to_string(),
        ]
    );
}

#[test]
fn test_path_traversal_is_rejected() {
    let host = fixture_host();
    let error = host
        .run("../Cargo", "main", vec![], ResourceBudget::default())
        .into_result()
        .unwrap_err();
    assert_eq!(error.kind(), dsl_host::dsl_execution::ErrorKind::ResolverFailure);
}
