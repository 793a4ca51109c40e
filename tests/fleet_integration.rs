//! Fleet Integration Tests
//!
//! Full fleet-manager + sprite-process flows against the stub worker API:
//! external deletion, API drift, metadata restore across restarts, and the
//! fleet summary contract.

use lattice::capabilities::worker_api::{make_api_sprite, StubWorkerApi};
use lattice::events::{topics, BusMessage, EventBus};
use lattice::fleet::{FleetDeps, FleetManager, MetadataStore, SpriteMetadata};
use lattice::sprite::{SpriteOptions, SpriteStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn make_deps(stub: &StubWorkerApi, bus: &EventBus, metadata: Arc<MetadataStore>) -> FleetDeps {
    FleetDeps {
        sprite_reconcile_interval: Some(Duration::from_millis(25)),
        sprite_not_found_recheck: Some(Duration::from_millis(25)),
        reconcile_fast: Some(Duration::from_millis(40)),
        reconcile_slow: Some(Duration::from_millis(40)),
        ..FleetDeps::new(Arc::new(stub.clone()), bus.clone(), metadata)
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(90)).await;
}

/// Two consecutive not-founds terminate the sprite process, publish one
/// external-deletion notice, and drop the id from the fleet.
#[tokio::test]
async fn test_external_deletion_end_to_end() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "running"));
    stub.insert_sprite(make_api_sprite("s2", "warm"));
    let bus = EventBus::new();
    let metadata = Arc::new(MetadataStore::temporary().unwrap());
    let mut fleet_rx = bus.subscribe(&topics::fleet());

    let cancel = CancellationToken::new();
    let (handle, join) =
        FleetManager::spawn(make_deps(&stub, &bus, Arc::clone(&metadata)), cancel.clone());
    settle().await;
    assert_eq!(handle.fleet_summary().await.unwrap().total, 2);

    // The sprite process discovers the deletion itself through two
    // consecutive not-founds; keep the API listing unchanged so the fleet
    // reconcile loop is not the one reacting.
    stub.set_list_override(vec!["s1".to_string(), "s2".to_string()]);
    stub.remove_sprite("s1");

    let deleted = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(BusMessage::SpriteExternallyDeleted { sprite_id }) = fleet_rx.recv().await {
                return sprite_id;
            }
        }
    })
    .await
    .expect("no deletion notice observed");
    assert_eq!(deleted, "s1");

    settle().await;
    let sprites = handle.list_sprites().await.unwrap();
    let ids: Vec<&str> = sprites.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["s2"]);

    cancel.cancel();
    let _ = join.await;
}

/// Fleet reconcile with an empty API list drains every child and leaves a
/// zero summary.
#[tokio::test]
async fn test_empty_api_list_drains_fleet() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "cold"));
    stub.insert_sprite(make_api_sprite("s2", "running"));
    let bus = EventBus::new();
    let metadata = Arc::new(MetadataStore::temporary().unwrap());

    let cancel = CancellationToken::new();
    let (handle, join) =
        FleetManager::spawn(make_deps(&stub, &bus, Arc::clone(&metadata)), cancel.clone());
    settle().await;

    stub.remove_sprite("s1");
    stub.remove_sprite("s2");
    settle().await;
    settle().await;

    let summary = handle.fleet_summary().await.unwrap();
    assert_eq!(summary.total, 0);
    assert!(summary.by_state.is_empty());

    cancel.cancel();
    let _ = join.await;
}

/// Tags and desired status persist through the metadata store and are
/// restored on the next manager start.
#[tokio::test]
async fn test_metadata_restored_on_restart() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "cold"));
    let metadata = Arc::new(MetadataStore::temporary().unwrap());

    // First manager: set tags through the sprite handle.
    {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let (handle, join) =
            FleetManager::spawn(make_deps(&stub, &bus, Arc::clone(&metadata)), cancel.clone());
        settle().await;

        let sprite = handle.get_sprite_handle("s1").await.unwrap().unwrap();
        let mut tags = HashMap::new();
        tags.insert("owner".to_string(), "platform-team".to_string());
        sprite.set_tags(tags).await.unwrap();
        sprite.set_desired_status(Some(SpriteStatus::Running)).await.unwrap();
        settle().await;

        cancel.cancel();
        let _ = join.await;
    }

    assert_eq!(
        metadata.get("s1").unwrap(),
        Some(SpriteMetadata {
            tags: HashMap::from([("owner".to_string(), "platform-team".to_string())]),
            desired_status: Some(SpriteStatus::Running),
        })
    );

    // Second manager: restored state is visible immediately.
    let bus = EventBus::new();
    let cancel = CancellationToken::new();
    let (handle, join) =
        FleetManager::spawn(make_deps(&stub, &bus, Arc::clone(&metadata)), cancel.clone());
    settle().await;

    let sprites = handle.list_sprites().await.unwrap();
    let (_, state) = sprites.iter().find(|(id, _)| id == "s1").unwrap();
    assert_eq!(state.tags.get("owner").map(String::as_str), Some("platform-team"));
    assert_eq!(state.desired_status, Some(SpriteStatus::Running));

    cancel.cancel();
    let _ = join.await;
}

/// Runtime add/remove with duplicate detection, and metadata cleanup on
/// removal.
#[tokio::test]
async fn test_runtime_add_remove_cleans_metadata() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "cold"));
    let bus = EventBus::new();
    let metadata = Arc::new(MetadataStore::temporary().unwrap());

    let cancel = CancellationToken::new();
    let (handle, join) =
        FleetManager::spawn(make_deps(&stub, &bus, Arc::clone(&metadata)), cancel.clone());
    settle().await;

    stub.insert_sprite(make_api_sprite("s2", "warm"));
    handle.add_sprite("s2", SpriteOptions::default()).await.unwrap().unwrap();
    settle().await;

    let sprite = handle.get_sprite_handle("s2").await.unwrap().unwrap();
    let mut tags = HashMap::new();
    tags.insert("temp".to_string(), "yes".to_string());
    sprite.set_tags(tags).await.unwrap();
    settle().await;
    assert!(metadata.get("s2").unwrap().is_some());

    // Keep the API listing stable so the reconcile loop does not re-add s2
    // after removal.
    stub.set_list_override(vec!["s1".to_string()]);
    handle.remove_sprite("s2").await.unwrap().unwrap();
    assert_eq!(metadata.get("s2").unwrap(), None);

    cancel.cancel();
    let _ = join.await;
}

/// Wake fan-out returns per-id results and nudges desired state.
#[tokio::test]
async fn test_wake_fan_out_results() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "sleeping"));
    stub.insert_sprite(make_api_sprite("s2", "sleeping"));
    let bus = EventBus::new();
    let metadata = Arc::new(MetadataStore::temporary().unwrap());

    let cancel = CancellationToken::new();
    let (handle, join) =
        FleetManager::spawn(make_deps(&stub, &bus, Arc::clone(&metadata)), cancel.clone());
    settle().await;

    let results = handle
        .wake_sprites(vec!["s1".to_string(), "s2".to_string(), "ghost".to_string()])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results.get("s1"), Some(&Ok(())));
    assert_eq!(results.get("s2"), Some(&Ok(())));
    assert!(results.get("ghost").unwrap().is_err());

    settle().await;
    let summary = handle.fleet_summary().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.by_state.get(&SpriteStatus::Warm), Some(&2));

    cancel.cancel();
    let _ = join.await;
}
