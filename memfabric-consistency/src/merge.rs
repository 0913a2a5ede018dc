//! Semantic merge of structured payloads.
//!
//! Maps merge field by field with the incoming side winning scalar
//! collisions; nested maps and arrays recurse. Arrays merge as a set union
//! by value equality, current elements first. Anything else is not
//! mergeable and yields `None`.

use memfabric_types::Value;
use std::collections::BTreeMap;

/// Merges `incoming` into `current`. Returns `None` unless both are maps or
/// both are arrays.
#[must_use]
pub fn semantic_merge(current: &Value, incoming: &Value) -> Option<Value> {
    match (current, incoming) {
        (Value::Map(ours), Value::Map(theirs)) => Some(Value::Map(merge_maps(ours, theirs))),
        (Value::Array(ours), Value::Array(theirs)) => Some(Value::Array(union(ours, theirs))),
        _ => None,
    }
}

fn merge_maps(
    ours: &BTreeMap<String, Value>,
    theirs: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let mut merged = ours.clone();
    for (field, incoming) in theirs {
        let value = match merged.get(field) {
            Some(current) => semantic_merge(current, incoming).unwrap_or_else(|| incoming.clone()),
            None => incoming.clone(),
        };
        merged.insert(field.clone(), value);
    }
    merged
}

fn union(ours: &[Value], theirs: &[Value]) -> Vec<Value> {
    let mut merged = ours.to_vec();
    for item in theirs {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}
