use memfabric_consistency::{Modification, VersionDiff, semantic_merge};
use memfabric_types::Value;
use pretty_assertions::assert_eq;

#[test]
fn maps_merge_recursively() {
    let current = Value::map([
        ("name", Value::from("a")),
        ("tags", Value::from(vec![Value::from("x")])),
        ("meta", Value::map([("owner", Value::from("alice"))])),
    ]);
    let incoming = Value::map([
        ("name", Value::from("b")),
        ("tags", Value::from(vec![Value::from("y"), Value::from("x")])),
        ("meta", Value::map([("rev", Value::Int(2))])),
    ]);

    let merged = semantic_merge(&current, &incoming).unwrap();
    assert_eq!(merged.get("name"), Some(&Value::from("b")));
    assert_eq!(
        merged.get("tags"),
        Some(&Value::from(vec![Value::from("x"), Value::from("y")]))
    );
    let meta = merged.get("meta").cloned().unwrap_or(Value::Null);
    assert_eq!(meta.get("owner"), Some(&Value::from("alice")));
    assert_eq!(meta.get("rev"), Some(&Value::Int(2)));
}

#[test]
fn mismatched_types_do_not_merge() {
    assert_eq!(semantic_merge(&Value::Int(1), &Value::Int(2)), None);
    assert_eq!(
        semantic_merge(&Value::map([("a", Value::Int(1))]), &Value::from(vec![Value::Int(1)])),
        None
    );
}

#[test]
fn nested_scalar_collision_takes_incoming() {
    let current = Value::map([("n", Value::map([("x", Value::Int(1))]))]);
    let incoming = Value::map([("n", Value::Int(7))]);
    let merged = semantic_merge(&current, &incoming).unwrap();
    assert_eq!(merged.get("n"), Some(&Value::Int(7)));
}

#[test]
fn diff_reports_added_removed_and_modified() {
    let old = Value::map([
        ("keep", Value::Int(1)),
        ("drop", Value::Int(2)),
        ("change", Value::map([("deep", Value::from("a"))])),
    ]);
    let new = Value::map([
        ("keep", Value::Int(1)),
        ("add", Value::Bool(true)),
        ("change", Value::map([("deep", Value::from("b"))])),
    ]);

    let diff = VersionDiff::between(1, &old, 2, &new);
    assert_eq!(diff.added, vec![("/add".to_string(), Value::Bool(true))]);
    assert_eq!(diff.removed, vec![("/drop".to_string(), Value::Int(2))]);
    assert_eq!(
        diff.modified,
        vec![Modification {
            path: "/change/deep".to_string(),
            old: Value::from("a"),
            new: Value::from("b"),
        }]
    );
    assert_eq!(diff.len(), 3);
}

#[test]
fn diff_walks_arrays_by_index() {
    let old = Value::from(vec![Value::Int(1), Value::Int(2)]);
    let new = Value::from(vec![Value::Int(1), Value::Int(3), Value::Int(4)]);
    let diff = VersionDiff::between(1, &old, 2, &new);
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].path, "/1");
    assert_eq!(diff.added, vec![("/2".to_string(), Value::Int(4))]);
}

#[test]
fn scalar_root_change_has_empty_path() {
    let diff = VersionDiff::between(1, &Value::Int(1), 2, &Value::from("x"));
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].path, "");
}

#[test]
fn path_segments_are_escaped() {
    let old = Value::map([("a/b", Value::Int(1))]);
    let new = Value::map([("a/b", Value::Int(2))]);
    let diff = VersionDiff::between(1, &old, 2, &new);
    assert_eq!(diff.modified[0].path, "/a~1b");
}

#[test]
fn identical_values_diff_empty() {
    let v = Value::map([("a", Value::Int(1))]);
    assert!(VersionDiff::between(1, &v, 2, &v).is_empty());
}
