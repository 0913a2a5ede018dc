use memfabric_bus::{BusError, EventFilter};
use memfabric_types::{BusEvent, EventKind, Value};

fn event(key: &str, partition: &str, source: &str) -> BusEvent {
    let mut event = BusEvent::store(key, partition, Value::from(1), source);
    event.timestamp = 1_000;
    event
}

#[test]
fn default_filter_matches_everything() {
    let filter = EventFilter::all();
    assert!(filter.matches(&event("k", "default", "a"), 1_000));
    assert!(filter.matches(&BusEvent::new(EventKind::Clear, "", "cache", "b"), 0));
}

#[test]
fn partition_and_kind_criteria() {
    let filter = EventFilter::all()
        .partitions(["shared"])
        .kinds([EventKind::Store, EventKind::Update]);

    assert!(filter.matches(&event("k", "shared", "a"), 1_000));
    assert!(!filter.matches(&event("k", "cache", "a"), 1_000));
    assert!(!filter.matches(&BusEvent::remove("k", "shared", "a"), 1_000));
}

#[test]
fn any_key_pattern_may_match() {
    let filter = EventFilter::all()
        .key_glob("user:*")
        .unwrap()
        .key_pattern(r"^session:\d+$")
        .unwrap();

    assert!(filter.matches(&event("user:42", "default", "a"), 1_000));
    assert!(filter.matches(&event("session:7", "default", "a"), 1_000));
    assert!(!filter.matches(&event("session:x", "default", "a"), 1_000));
    assert!(!filter.matches(&event("xuser:1", "default", "a"), 1_000));
}

#[test]
fn glob_escapes_regex_metacharacters() {
    let filter = EventFilter::all().key_glob("a.b*").unwrap();
    assert!(filter.matches(&event("a.b.c", "default", "s"), 1_000));
    assert!(!filter.matches(&event("axb", "default", "s"), 1_000));
}

#[test]
fn invalid_pattern_is_an_error() {
    let err = EventFilter::all().key_pattern("(").unwrap_err();
    assert!(matches!(err, BusError::InvalidPattern(_)));
}

#[test]
fn source_inclusion_and_exclusion() {
    let only_a = EventFilter::all().sources(["a"]);
    assert!(only_a.matches(&event("k", "default", "a"), 1_000));
    assert!(!only_a.matches(&event("k", "default", "b"), 1_000));

    let not_a = EventFilter::all().exclude_source("a");
    assert!(!not_a.matches(&event("k", "default", "a"), 1_000));
    assert!(not_a.matches(&event("k", "default", "b"), 1_000));
}

#[test]
fn max_age_is_measured_at_match_time() {
    let filter = EventFilter::all().max_age(500);
    let e = event("k", "default", "a");
    assert!(filter.matches(&e, 1_500));
    assert!(!filter.matches(&e, 1_501));
}

#[test]
fn custom_predicate_is_conjoined() {
    let filter = EventFilter::all()
        .partitions(["default"])
        .predicate(|e| e.key.len() > 2);
    assert!(filter.matches(&event("long", "default", "a"), 1_000));
    assert!(!filter.matches(&event("k", "default", "a"), 1_000));
    assert!(!filter.matches(&event("long", "cache", "a"), 1_000));
}

#[test]
fn debug_output_hides_predicate_body() {
    let filter = EventFilter::all().key_glob("x*").unwrap().predicate(|_| true);
    let debug = format!("{filter:?}");
    assert!(debug.contains("^x.*$"));
    assert!(debug.contains("predicate: true"));
}
