use memfabric_bus::EventFilter;
use memfabric_consistency::VersionConfig;
use memfabric_coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorSignal, MaintenanceReport,
    PrincipalConfig, PrincipalHealth,
};
use memfabric_store::{MemoryPersistence, PersistenceAdapter, StoreConfig};
use memfabric_types::{EventKind, PrincipalId, Value};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

fn pid(id: &str) -> PrincipalId {
    PrincipalId::new(id).unwrap()
}

fn manual() -> CoordinatorConfig {
    CoordinatorConfig {
        auto_sync: false,
        ..Default::default()
    }
}

fn shared(id: &str) -> PrincipalConfig {
    PrincipalConfig::new(pid(id), 1 << 20)
        .with_partitions(["shared"])
        .sharing(true)
}

// ── Registration ─────────────────────────────────────────────────

#[tokio::test]
async fn register_and_unregister() {
    let coordinator = Coordinator::new(manual());
    let mut signals = coordinator.signals();
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1024).with_domain("planning"))
        .await
        .unwrap();

    assert!(coordinator.is_registered(&pid("a")).await);
    assert_eq!(coordinator.principal_ids().await, vec![pid("a")]);
    assert_eq!(
        signals.try_recv().unwrap(),
        CoordinatorSignal::PrincipalRegistered {
            principal_id: pid("a")
        }
    );

    let status = coordinator.principal_status(&pid("a")).await.unwrap();
    assert_eq!(status.domain, "planning");
    assert_eq!(status.memory_limit, 1024);
    assert_eq!(status.health, PrincipalHealth::Healthy);

    assert!(coordinator.unregister_principal(&pid("a")).await.unwrap());
    assert!(!coordinator.unregister_principal(&pid("a")).await.unwrap());
    assert!(!coordinator.is_registered(&pid("a")).await);
}

#[tokio::test]
async fn failed_registration_leaves_no_bus_subscription() {
    let coordinator = Coordinator::new(manual());
    coordinator.broadcaster().shutdown().await;

    let err = coordinator.register_principal(shared("a")).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Bus(_)));
    assert!(!coordinator.is_registered(&pid("a")).await);
    assert_eq!(coordinator.bus().subscription_count().await, 0);
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1024))
        .await
        .unwrap();
    let err = coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 2048))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::AlreadyRegistered(id) if id == pid("a")));
}

#[tokio::test]
async fn registration_is_capped() {
    let coordinator = Coordinator::new(CoordinatorConfig {
        max_principals: 2,
        ..manual()
    });
    for id in ["a", "b"] {
        coordinator
            .register_principal(PrincipalConfig::new(pid(id), 1024))
            .await
            .unwrap();
    }
    let err = coordinator
        .register_principal(PrincipalConfig::new(pid("c"), 1024))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::CapacityExceeded { limit: 2 }));
    assert!(err.is_capacity());
}

#[tokio::test]
async fn persistent_principal_restores_entries() {
    let adapter: Arc<dyn PersistenceAdapter> = Arc::new(MemoryPersistence::new());
    let first = Coordinator::new(manual());
    first
        .register_principal_with_persistence(
            PrincipalConfig::new(pid("a"), 1 << 20),
            Arc::clone(&adapter),
        )
        .await
        .unwrap();
    first.store(&pid("a"), "k", Value::from("kept"), None).await.unwrap();
    first.shutdown().await.unwrap();

    let second = Coordinator::new(manual());
    second
        .register_principal_with_persistence(PrincipalConfig::new(pid("a"), 1 << 20), adapter)
        .await
        .unwrap();
    assert_eq!(
        second.retrieve(&pid("a"), "k").await.unwrap(),
        Some(Value::from("kept"))
    );
}

// ── Data path ────────────────────────────────────────────────────

#[tokio::test]
async fn store_retrieve_remove() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1 << 20))
        .await
        .unwrap();
    let value = Value::map([("step", Value::from(1))]);

    assert!(coordinator.store(&pid("a"), "plan", value.clone(), None).await.unwrap());
    assert_eq!(coordinator.retrieve(&pid("a"), "plan").await.unwrap(), Some(value));
    assert!(coordinator.remove(&pid("a"), "plan").await.unwrap());
    assert!(!coordinator.remove(&pid("a"), "plan").await.unwrap());
    assert_eq!(coordinator.retrieve(&pid("a"), "plan").await.unwrap(), None);
}

#[tokio::test]
async fn unknown_principal_is_not_an_error() {
    let coordinator = Coordinator::new(manual());
    let ghost = pid("ghost");
    assert!(!coordinator.store(&ghost, "k", Value::Null, None).await.unwrap());
    assert_eq!(coordinator.retrieve(&ghost, "k").await.unwrap(), None);
    assert!(!coordinator.remove(&ghost, "k").await.unwrap());
    assert!(coordinator.principal_status(&ghost).await.is_none());
    assert!(coordinator.version_history(&ghost, "k").await.is_empty());
}

#[tokio::test]
async fn repeated_reads_hit_the_cache() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1 << 20))
        .await
        .unwrap();
    coordinator.store(&pid("a"), "k", Value::from("v"), None).await.unwrap();

    for _ in 0..3 {
        assert_eq!(
            coordinator.retrieve(&pid("a"), "k").await.unwrap(),
            Some(Value::from("v"))
        );
    }
    let status = coordinator.principal_status(&pid("a")).await.unwrap();
    assert_eq!(status.cache_hit_rate, 1.0);
    assert_eq!(status.operations, 4);

    coordinator.store(&pid("a"), "k", Value::from("w"), None).await.unwrap();
    assert_eq!(
        coordinator.retrieve(&pid("a"), "k").await.unwrap(),
        Some(Value::from("w"))
    );
}

#[tokio::test]
async fn private_principal_publishes_nothing() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1 << 20).with_partitions(["notes"]))
        .await
        .unwrap();
    coordinator.register_principal(shared("b")).await.unwrap();
    coordinator.store(&pid("a"), "k", Value::from(1), Some("shared")).await.unwrap();

    assert_eq!(coordinator.pump_events().await, 0);
    let status = coordinator.principal_status(&pid("b")).await.unwrap();
    assert_eq!(status.events_received, 0);
}

// ── Events ───────────────────────────────────────────────────────

#[tokio::test]
async fn writes_reach_interested_sharing_principals() {
    let coordinator = Coordinator::new(manual());
    coordinator.register_principal(shared("a")).await.unwrap();
    coordinator.register_principal(shared("b")).await.unwrap();
    coordinator
        .register_principal(
            PrincipalConfig::new(pid("c"), 1 << 20)
                .with_partitions(["elsewhere"])
                .sharing(true),
        )
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::<(EventKind, String)>::new()));
    let sink = Arc::clone(&seen);
    coordinator
        .subscribe(&pid("b"), EventFilter::all(), move |batch| {
            sink.lock()
                .unwrap()
                .extend(batch.iter().map(|e| (e.kind, e.key.clone())));
            Ok(())
        })
        .await
        .unwrap();

    coordinator.store(&pid("a"), "k", Value::from(1), None).await.unwrap();
    coordinator.store(&pid("a"), "k", Value::from(2), None).await.unwrap();
    coordinator.remove(&pid("a"), "k").await.unwrap();
    assert!(coordinator.pump_events().await > 0);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (EventKind::Store, "k".to_string()),
            (EventKind::Update, "k".to_string()),
            (EventKind::Remove, "k".to_string()),
        ]
    );
    for (id, received) in [("a", 0), ("b", 3), ("c", 0)] {
        let status = coordinator.principal_status(&pid(id)).await.unwrap();
        assert_eq!(status.events_received, received, "{id}");
    }
}

// ── Versions ─────────────────────────────────────────────────────

#[tokio::test]
async fn versioned_principal_rolls_back() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1 << 20).versioning(true))
        .await
        .unwrap();
    for n in 1..=3 {
        coordinator.store(&pid("a"), "k", Value::from(n), None).await.unwrap();
    }
    let history = coordinator.version_history(&pid("a"), "k").await;
    assert_eq!(history.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(history.iter().all(|v| v.author == "a"));

    let diff = coordinator.version_diff(&pid("a"), "k", 1, 3).await.unwrap();
    assert!(diff.is_some());

    let version = coordinator.rollback(&pid("a"), "k", 1).await.unwrap();
    assert_eq!(version, Some(4));
    assert_eq!(coordinator.retrieve(&pid("a"), "k").await.unwrap(), Some(Value::from(1)));
    assert_eq!(coordinator.version_history(&pid("a"), "k").await.len(), 4);
}

#[tokio::test]
async fn rollback_to_unknown_version_fails() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1 << 20).versioning(true))
        .await
        .unwrap();
    coordinator.store(&pid("a"), "k", Value::from(1), None).await.unwrap();
    let err = coordinator.rollback(&pid("a"), "k", 9).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Consistency(_)));
}

#[tokio::test]
async fn unversioned_principal_keeps_no_history() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1 << 20))
        .await
        .unwrap();
    coordinator.store(&pid("a"), "k", Value::from(1), None).await.unwrap();
    assert!(coordinator.version_history(&pid("a"), "k").await.is_empty());
}

/// Keys among `keys` that still have recorded history.
async fn keys_with_history(coordinator: &Coordinator, id: &str, keys: &[String]) -> usize {
    let mut count = 0;
    for key in keys {
        if !coordinator.version_history(&pid(id), key).await.is_empty() {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn evicted_keys_drop_their_history() {
    let coordinator = Coordinator::new(manual());
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 2000).versioning(true).with_store_config(
            StoreConfig {
                compression_enabled: false,
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    let keys: Vec<String> = (0..200).map(|n| format!("k{n:03}")).collect();
    for key in &keys {
        let payload = Value::String(format!("{key}-{}", "x".repeat(200)));
        coordinator.store(&pid("a"), key, payload, None).await.unwrap();
    }
    let live = coordinator.principal_status(&pid("a")).await.unwrap().entry_count;
    assert!(live < 20, "{live} entries should fit in 2000 bytes");

    // The store watcher catches up once the writer yields.
    for _ in 0..100 {
        if keys_with_history(&coordinator, "a", &keys).await == live {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(keys_with_history(&coordinator, "a", &keys).await, live);
    assert!(!coordinator.version_history(&pid("a"), "k199").await.is_empty());
    assert!(coordinator.version_history(&pid("a"), "k000").await.is_empty());
}

#[tokio::test]
async fn maintenance_expires_versions_and_forgets_removed_keys() {
    let coordinator = Coordinator::new(CoordinatorConfig {
        versions: VersionConfig {
            retention_period_ms: 0,
            ..Default::default()
        },
        ..manual()
    });
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1 << 20).versioning(true))
        .await
        .unwrap();
    for n in 1..=3 {
        coordinator.store(&pid("a"), "k", Value::from(n), None).await.unwrap();
    }
    coordinator.store(&pid("a"), "gone", Value::from(0), None).await.unwrap();
    coordinator.remove(&pid("a"), "gone").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    assert_eq!(
        coordinator.run_maintenance().await,
        MaintenanceReport {
            forgotten_keys: 1,
            expired_versions: 2,
        }
    );
    let history = coordinator.version_history(&pid("a"), "k").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 3);
    assert!(coordinator.version_history(&pid("a"), "gone").await.is_empty());
    assert_eq!(coordinator.run_maintenance().await, MaintenanceReport::default());
}

// ── Health and metrics ───────────────────────────────────────────

#[tokio::test]
async fn crossing_the_degraded_threshold_signals() {
    let coordinator = Coordinator::new(CoordinatorConfig {
        degraded_utilization: 0.1,
        ..manual()
    });
    coordinator
        .register_principal(PrincipalConfig::new(pid("a"), 1000).with_store_config(StoreConfig {
            compression_enabled: false,
            ..Default::default()
        }))
        .await
        .unwrap();
    let mut signals = coordinator.signals();

    assert!(coordinator.check_health().await.is_empty());
    let payload = Value::String("x".repeat(300));
    coordinator.store(&pid("a"), "big", payload, None).await.unwrap();

    assert_eq!(
        coordinator.check_health().await,
        vec![(pid("a"), PrincipalHealth::Degraded)]
    );
    assert_eq!(
        signals.try_recv().unwrap(),
        CoordinatorSignal::HealthChanged {
            principal_id: pid("a"),
            from: PrincipalHealth::Healthy,
            to: PrincipalHealth::Degraded,
        }
    );
    // No transition, no report.
    assert!(coordinator.check_health().await.is_empty());

    let metrics = coordinator.metrics().await;
    assert_eq!(metrics.principals, 1);
    assert_eq!(metrics.degraded, 1);
    assert!(metrics.system_health < 1.0);
}

#[tokio::test]
async fn metrics_aggregate_principals() {
    let coordinator = Coordinator::new(manual());
    assert_eq!(coordinator.metrics().await.system_health, 1.0);

    coordinator.register_principal(shared("a")).await.unwrap();
    coordinator.register_principal(shared("b")).await.unwrap();
    coordinator.store(&pid("a"), "k", Value::from("v"), None).await.unwrap();

    let metrics = coordinator.metrics().await;
    assert_eq!(metrics.principals, 2);
    assert_eq!(metrics.healthy, 2);
    assert_eq!(metrics.memory_limit, 2 << 20);
    assert!(metrics.memory_used > 0);
    assert_eq!(metrics.total_operations, 1);
    assert_eq!(metrics.sync_runs, 0);
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_closes_everything() {
    let coordinator = Coordinator::new(manual());
    coordinator.register_principal(shared("a")).await.unwrap();
    coordinator.start().await;
    coordinator.store(&pid("a"), "k", Value::from(1), None).await.unwrap();

    coordinator.shutdown().await.unwrap();
    assert!(coordinator.is_closed());
    assert!(coordinator.principal_ids().await.is_empty());
    assert!(matches!(
        coordinator.store(&pid("a"), "k", Value::from(2), None).await,
        Err(CoordinatorError::Closed)
    ));
    assert!(matches!(
        coordinator
            .register_principal(PrincipalConfig::new(pid("b"), 1024))
            .await,
        Err(CoordinatorError::Closed)
    ));
    // Idempotent.
    coordinator.shutdown().await.unwrap();
}

// ── Configuration ────────────────────────────────────────────────

#[test]
fn configs_deserialize_with_defaults() {
    let config: CoordinatorConfig =
        serde_json::from_str(r#"{ "max_principals": 4, "default_strategy": "last-write-wins" }"#)
            .unwrap();
    assert_eq!(config.max_principals, 4);
    assert_eq!(
        config.default_strategy,
        memfabric_consistency::Strategy::LastWriteWins
    );
    assert_eq!(config.sync_interval_ms, CoordinatorConfig::default().sync_interval_ms);

    let principal: PrincipalConfig =
        serde_json::from_str(r#"{ "principal_id": "planner", "max_memory_size": 4096 }"#).unwrap();
    assert_eq!(principal.partition_ids, vec!["default".to_string()]);
    assert_eq!(principal.home_partition(), "default");
    assert!(!principal.enable_sharing);
    assert_eq!(principal.store_config().max_size_bytes, 4096);
}
