use memfabric_store::{DEFAULT_PARTITION, DEFAULT_PARTITIONS, PartitionController};
use pretty_assertions::assert_eq;

#[test]
fn starts_with_default_partitions() {
    let controller = PartitionController::new(0);
    for (id, priority) in DEFAULT_PARTITIONS {
        let partition = controller.get_partition_info(id).unwrap();
        assert_eq!(partition.priority, *priority);
        assert_eq!(partition.aggregate_size, 0);
    }
    assert!(controller.get_partition_info(DEFAULT_PARTITION).is_some());
}

#[test]
fn empty_controller_has_no_partitions() {
    assert_eq!(PartitionController::empty().partitions().count(), 0);
}

#[test]
fn add_and_remove_keep_aggregates_exact() {
    let mut controller = PartitionController::new(0);
    controller.add_to_partition("cache", "a", 100, 1);
    controller.add_to_partition("cache", "b", 50, 2);

    let cache = controller.get_partition_info("cache").unwrap();
    assert_eq!(cache.aggregate_size, 150);
    assert_eq!(cache.entry_count, 2);

    assert_eq!(
        controller.remove_from_partition("a"),
        Some(("cache".to_string(), 100))
    );
    assert_eq!(controller.remove_from_partition("a"), None);
    assert_eq!(controller.get_partition_info("cache").unwrap().aggregate_size, 50);
}

#[test]
fn readding_a_key_releases_its_previous_charge() {
    let mut controller = PartitionController::new(0);
    controller.add_to_partition("cache", "k", 100, 1);
    controller.add_to_partition("cache", "k", 40, 2);
    assert_eq!(controller.get_partition_info("cache").unwrap().aggregate_size, 40);

    controller.add_to_partition("shared", "k", 60, 3);
    assert_eq!(controller.get_partition_info("cache").unwrap().aggregate_size, 0);
    assert_eq!(controller.get_partition_info("shared").unwrap().aggregate_size, 60);
    assert_eq!(controller.partition_of("k"), Some("shared"));
    assert_eq!(controller.charged_size("k"), Some(60));
    assert_eq!(controller.total_size(), 60);
}

#[test]
fn unknown_partitions_are_created_on_first_use() {
    let mut controller = PartitionController::empty();
    controller.add_to_partition("scratch", "k", 10, 5);

    let scratch = controller.get_partition_info("scratch").unwrap();
    assert_eq!(scratch.priority, 5);
    assert_eq!(scratch.created_at, 5);
}

#[test]
fn declare_updates_existing_partition() {
    let mut controller = PartitionController::new(0);
    controller.add_to_partition("cache", "k", 10, 1);
    controller.declare("cache", 9, Some(1024), 2);

    let cache = controller.get_partition_info("cache").unwrap();
    assert_eq!(cache.priority, 9);
    assert_eq!(cache.remaining(), Some(1014));
    assert_eq!(cache.entry_count, 1);
}

#[test]
fn eviction_candidates_lowest_priority_first() {
    let mut controller = PartitionController::new(0);
    controller.add_to_partition("critical", "c", 100, 1);
    controller.add_to_partition("temporary", "t", 100, 2);
    controller.add_to_partition("cache", "x", 100, 3);

    let candidates = controller.eviction_candidates(150);
    let ids: Vec<&str> = candidates.iter().map(|c| c.partition_id.as_str()).collect();
    assert_eq!(ids, vec!["temporary", "cache"]);
    assert_eq!(candidates[0].keys, vec!["t".to_string()]);
}

#[test]
fn eviction_candidates_returns_everything_when_short() {
    let mut controller = PartitionController::new(0);
    controller.add_to_partition("cache", "a", 10, 1);
    controller.add_to_partition("shared", "b", 10, 1);

    assert_eq!(controller.eviction_candidates(1_000).len(), 2);
    assert!(controller.eviction_candidates(0).is_empty());
}

#[test]
fn same_priority_breaks_ties_by_last_access() {
    let mut controller = PartitionController::empty();
    controller.declare("older", 3, None, 0);
    controller.declare("newer", 3, None, 0);
    controller.add_to_partition("newer", "n", 10, 20);
    controller.add_to_partition("older", "o", 10, 10);

    let first = &controller.eviction_candidates(5)[0];
    assert_eq!(first.partition_id, "older");
}

#[test]
fn clear_keeps_declarations() {
    let mut controller = PartitionController::new(0);
    controller.add_to_partition("cache", "a", 10, 1);
    controller.clear();

    assert_eq!(controller.total_size(), 0);
    assert_eq!(controller.partition_of("a"), None);
    assert!(controller.get_partition_info("cache").is_some());
}
