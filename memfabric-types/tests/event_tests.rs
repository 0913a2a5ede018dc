use memfabric_types::{BusEvent, EventKind, Value};
use pretty_assertions::assert_eq;

#[test]
fn store_event_carries_payload() {
    let event = BusEvent::store("user:1", "default", Value::from("alice"), "agent-a");
    assert_eq!(event.kind, EventKind::Store);
    assert_eq!(event.key, "user:1");
    assert_eq!(event.partition_id, "default");
    assert_eq!(event.data, Some(Value::from("alice")));
    assert_eq!(event.source, "agent-a");
    assert_eq!(event.version, 0);
    assert_eq!(event.timestamp, 0);
}

#[test]
fn remove_event_has_no_payload() {
    let event = BusEvent::remove("k", "cache", "agent-b");
    assert_eq!(event.kind, EventKind::Remove);
    assert!(event.data.is_none());
}

#[test]
fn wire_shape_uses_stable_field_names() {
    let event = BusEvent::update("k", "shared", Value::Int(7), "agent-a")
        .with_metadata("reason", serde_json::json!("sync"));
    let json = serde_json::to_value(&event).unwrap();

    assert_eq!(json["type"], "update");
    assert_eq!(json["key"], "k");
    assert_eq!(json["partitionId"], "shared");
    assert_eq!(json["source"], "agent-a");
    assert_eq!(json["metadata"]["reason"], "sync");
    assert!(json["timestamp"].is_number());
    assert!(json["version"].is_number());
    assert!(json.get("data").is_some());
}

#[test]
fn absent_data_is_omitted_from_wire() {
    let event = BusEvent::remove("k", "default", "agent-a");
    let json = serde_json::to_value(&event).unwrap();
    assert!(json.get("data").is_none());
}

#[test]
fn wire_round_trip() {
    let event = BusEvent::store("k", "default", Value::map([("n", Value::Int(1))]), "x");
    let json = serde_json::to_string(&event).unwrap();
    let back: BusEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back, event);
}

#[test]
fn event_kind_display() {
    assert_eq!(EventKind::Store.to_string(), "store");
    assert_eq!(EventKind::Clear.to_string(), "clear");
}
