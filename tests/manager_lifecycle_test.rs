// Manager Lifecycle Tests
// Exercise init -> connect -> control end-to-end against a fake GATT stack
// and a fake cloud fetcher, in place of real hardware.

use std::sync::Arc;

use plejd_mesh::cloud::FakeRosterFetcher;
use plejd_mesh::device::{DeviceError, Projection};
use plejd_mesh::gatt::FakeGatt;
use plejd_mesh::node::BleAddress;
use plejd_mesh::{Device, PlejdManager, RosterDocument};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

const KITCHEN_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

fn sample_document() -> RosterDocument {
    serde_json::from_value(serde_json::json!({
        "site": {"siteId": "site-1", "title": "Home"},
        "plejdMesh": {"cryptoKey": "000102030405060708090a0b0c0d0e0f"},
        "rooms": [{"id": "r1", "title": "Kitchen"}],
        "scenes": [],
        "devices": [{"id": "d1", "title": "Kitchen light", "roomId": "r1", "hidden": false}],
        "plejdDevices": [{
            "deviceId": "d1",
            "hardwareId": "DIM-01",
            "BLEAddress": KITCHEN_ADDRESS,
            "firmware": "1.0",
            "outputType": "light",
            "traits": 0x03,
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

fn light_is_available(manager: &PlejdManager) -> bool {
    match manager.device("d1").unwrap().project() {
        Projection::Light { available, .. } => available,
        other => panic!("expected light projection, got {other:?}"),
    }
}

async fn init_and_connect(gatt: Arc<FakeGatt>) -> PlejdManager {
    let fetcher = Arc::new(FakeRosterFetcher::new().with_site(sample_document(), serde_json::json!({})));
    let mut manager = PlejdManager::new("user", "pass", "site-1", gatt.clone(), fetcher, None);
    manager.init(None).await.unwrap();

    let kitchen = BleAddress::parse(KITCHEN_ADDRESS).unwrap();
    manager.add_mesh_device(kitchen, -55);
    manager
}

// ============================================================================
// INIT AND AVAILABILITY
// ============================================================================

#[tokio::test]
async fn devices_start_unavailable_and_controls_reject_while_disconnected() {
    let gatt = Arc::new(FakeGatt::new());
    let manager = init_and_connect(gatt).await;

    assert!(!light_is_available(&manager));
    match manager.device("d1").unwrap() {
        Device::Light(light) => {
            let err = light.turn_on(Some(128), None).await.unwrap_err();
            assert!(matches!(err, DeviceError::Unavailable));
        }
        _ => panic!("expected light device, got a different kind"),
    }
}

#[tokio::test]
async fn ping_establishes_gateway_and_marks_every_device_available() {
    let gatt = Arc::new(FakeGatt::new());
    let mut manager = init_and_connect(gatt.clone()).await;

    manager.ping().await.unwrap();

    assert!(light_is_available(&manager));
    assert!(manager.connected().await);

    // the auth handshake and the post-connect poll must have gone out
    let writes = gatt.writes();
    assert!(writes.iter().any(|(c, _)| *c == plejd_mesh::gatt::Characteristic::Auth));
    assert!(writes.iter().any(|(c, _)| *c == plejd_mesh::gatt::Characteristic::Poll));
}

#[tokio::test]
async fn control_succeeds_once_ping_has_connected_the_session() {
    let gatt = Arc::new(FakeGatt::new());
    let mut manager = init_and_connect(gatt.clone()).await;

    manager.ping().await.unwrap();

    match manager.device("d1").unwrap() {
        Device::Light(light) => light.turn_on(Some(128), None).await.unwrap(),
        _ => panic!("expected light device"),
    }

    let writes = gatt.writes();
    assert!(writes.iter().any(|(c, _)| *c == plejd_mesh::gatt::Characteristic::Data));
}

#[tokio::test]
async fn disconnect_marks_every_device_unavailable_again() {
    let gatt = Arc::new(FakeGatt::new());
    let mut manager = init_and_connect(gatt.clone()).await;

    manager.ping().await.unwrap();
    assert!(light_is_available(&manager));

    manager.disconnect().await;
    assert!(!light_is_available(&manager));
    assert!(!manager.connected().await);
}

#[tokio::test]
async fn keep_alive_ping_failure_marks_session_and_devices_lost() {
    let gatt = Arc::new(FakeGatt::new());
    let mut manager = init_and_connect(gatt.clone()).await;

    manager.ping().await.unwrap();
    assert!(light_is_available(&manager));

    gatt.set_ping_fails(true);
    manager.ping().await.unwrap();

    assert!(!light_is_available(&manager));
    assert!(!manager.connected().await);
}
