// Roster Fallback Tests
// `PlejdManager::init` must tolerate a cloud that is unreachable, falling
// back to a caller-supplied snapshot or a persisted one before giving up.

use std::sync::Arc;

use plejd_mesh::cloud::FakeRosterFetcher;
use plejd_mesh::{MeshStore, PlejdError, PlejdManager, RosterDocument};

fn sample_document(site_id: &str) -> RosterDocument {
    serde_json::from_value(serde_json::json!({
        "site": {"siteId": site_id, "title": "Home"},
        "plejdMesh": {"cryptoKey": "000102030405060708090a0b0c0d0e0f"},
        "rooms": [],
        "scenes": [],
        "devices": [{"id": "d1", "title": "Hall relay", "roomId": null, "hidden": false}],
        "plejdDevices": [{
            "deviceId": "d1",
            "hardwareId": "REL-01",
            "BLEAddress": "AA:BB:CC:DD:EE:FF",
            "firmware": null,
            "outputType": "relay",
            "traits": 0x01,
            "connectable": true
        }],
        "inputSettings": [],
        "outputSettings": [],
        "motionSensors": [],
        "deviceAddress": {"d1": 5},
        "rxAddress": {},
        "sceneIndex": {}
    }))
    .unwrap()
}

fn fake_gatt() -> Arc<plejd_mesh::gatt::FakeGatt> {
    Arc::new(plejd_mesh::gatt::FakeGatt::new())
}

#[tokio::test]
async fn live_fetch_succeeds_and_is_used_directly() {
    let fetcher = Arc::new(
        FakeRosterFetcher::new().with_site(sample_document("site-1"), serde_json::json!({})),
    );
    let mut manager = PlejdManager::new("user", "pass", "site-1", fake_gatt(), fetcher, None);

    manager.init(None).await.unwrap();
    assert_eq!(manager.site_data().unwrap().site_id, "site-1");
}

#[tokio::test]
async fn cloud_failure_falls_back_to_caller_supplied_snapshot() {
    let fetcher = Arc::new(FakeRosterFetcher::new().with_connection_failure("offline"));
    let mut manager = PlejdManager::new("user", "pass", "site-1", fake_gatt(), fetcher, None);

    manager.init(Some(sample_document("site-1"))).await.unwrap();
    assert!(manager.device("d1").is_some());
}

#[tokio::test]
async fn cloud_failure_with_no_snapshot_falls_back_to_persisted_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = MeshStore::open(dir.path()).unwrap();
    store.save_roster_snapshot("site-1", &sample_document("site-1")).unwrap();

    let fetcher = Arc::new(FakeRosterFetcher::new().with_connection_failure("offline"));
    let mut manager = PlejdManager::new("user", "pass", "site-1", fake_gatt(), fetcher, Some(store));

    manager.init(None).await.unwrap();
    assert!(manager.device("d1").is_some());
}

#[tokio::test]
async fn cloud_failure_with_nothing_to_fall_back_to_surfaces_the_original_error() {
    let fetcher = Arc::new(FakeRosterFetcher::new().with_connection_failure("offline"));
    let mut manager = PlejdManager::new("user", "pass", "site-1", fake_gatt(), fetcher, None);

    let result = manager.init(None).await;
    assert!(matches!(result, Err(PlejdError::Cloud(_))));
}
