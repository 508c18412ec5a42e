// Gateway Selection Tests
// Cover the fallback behaviour scenario F describes at the manager level: a
// stronger candidate that refuses the connection must not block a weaker one
// from becoming the gateway.

use std::sync::Arc;

use plejd_mesh::cloud::FakeRosterFetcher;
use plejd_mesh::gatt::FakeGatt;
use plejd_mesh::node::BleAddress;
use plejd_mesh::{PlejdError, PlejdManager, RosterDocument};

fn sample_document() -> RosterDocument {
    serde_json::from_value(serde_json::json!({
        "site": {"siteId": "site-1", "title": "Home"},
        "plejdMesh": {"cryptoKey": "000102030405060708090a0b0c0d0e0f"},
        "rooms": [],
        "scenes": [],
        "devices": [{"id": "d1", "title": "Hall relay", "roomId": null, "hidden": false}],
        "plejdDevices": [{
            "deviceId": "d1",
            "hardwareId": "REL-01",
            "BLEAddress": "AA:AA:AA:AA:AA:01",
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

async fn manager_with(gatt: Arc<FakeGatt>) -> PlejdManager {
    let fetcher = Arc::new(FakeRosterFetcher::new().with_site(sample_document(), serde_json::json!({})));
    let mut manager = PlejdManager::new("user", "pass", "site-1", gatt, fetcher, None);
    manager.init(None).await.unwrap();
    manager
}

#[tokio::test]
async fn falls_back_to_the_next_strongest_candidate_on_connect_failure() {
    let gatt = Arc::new(FakeGatt::new());
    let mut manager = manager_with(gatt.clone()).await;

    let strong = BleAddress::parse("AA:AA:AA:AA:AA:02").unwrap();
    let weak = BleAddress::parse("AA:AA:AA:AA:AA:03").unwrap();
    gatt.fail_connect_for(strong);

    manager.add_mesh_device(strong, -40);
    manager.add_mesh_device(weak, -80);

    manager.ping().await.unwrap();

    let attempts = gatt.connect_attempts();
    assert_eq!(attempts, vec![strong, weak]);
    assert!(manager.connected().await);
}

#[tokio::test]
async fn no_candidate_gateway_when_nothing_has_been_scanned() {
    let gatt = Arc::new(FakeGatt::new());
    let mut manager = manager_with(gatt).await;

    let result = manager.ping().await;
    assert!(matches!(result, Err(PlejdError::NoCandidateGateway)));
}

#[tokio::test]
async fn every_candidate_unreachable_also_reports_no_candidate_session_error() {
    let gatt = Arc::new(FakeGatt::new());
    let mut manager = manager_with(gatt.clone()).await;

    let only = BleAddress::parse("AA:AA:AA:AA:AA:02").unwrap();
    gatt.fail_connect_for(only);
    manager.add_mesh_device(only, -50);

    let result = manager.ping().await;
    assert!(result.is_err());
    assert!(!manager.connected().await);
}
