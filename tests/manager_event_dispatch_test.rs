// Manager Event Dispatch Tests
// Push encrypted notifications through a fake GATT stack and confirm the
// manager's single event loop decrypts, decodes, and fans them out to the
// matching device's projection — the same round-trip a real stack drives via
// `handle_next_event`.

use std::sync::Arc;

use plejd_mesh::cloud::FakeRosterFetcher;
use plejd_mesh::codec::{CommandType, Frame, Opcode};
use plejd_mesh::crypto::{self, SiteKey};
use plejd_mesh::device::{ButtonAction, Projection};
use plejd_mesh::gatt::{Characteristic, FakeGatt};
use plejd_mesh::node::BleAddress;
use plejd_mesh::{Device, PlejdManager, RosterDocument};

const SWITCH_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const CRYPTO_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";

fn sample_document() -> RosterDocument {
    serde_json::from_value(serde_json::json!({
        "site": {"siteId": "site-1", "title": "Home"},
        "plejdMesh": {"cryptoKey": CRYPTO_KEY_HEX},
        "rooms": [],
        "scenes": [],
        "devices": [{"id": "d1", "title": "Hall switch", "roomId": null, "hidden": false}],
        "plejdDevices": [{
            "deviceId": "d1",
            "hardwareId": "WPH-01",
            "BLEAddress": SWITCH_ADDRESS,
            "firmware": null,
            "outputType": null,
            "traits": 0x00,
            "connectable": true
        }],
        "inputSettings": [{"deviceId": "d1", "input": 2}],
        "outputSettings": [],
        "motionSensors": [],
        "deviceAddress": {"d1": 5},
        "rxAddress": {},
        "sceneIndex": {}
    }))
    .unwrap()
}

async fn connected_manager() -> (PlejdManager, Arc<FakeGatt>, BleAddress) {
    let gatt = Arc::new(FakeGatt::new());
    let fetcher = Arc::new(FakeRosterFetcher::new().with_site(sample_document(), serde_json::json!({})));
    let mut manager = PlejdManager::new("user", "pass", "site-1", gatt.clone(), fetcher, None);
    manager.init(None).await.unwrap();

    let gateway = BleAddress::parse(SWITCH_ADDRESS).unwrap();
    manager.add_mesh_device(gateway, -50);
    manager.ping().await.unwrap();

    (manager, gatt, gateway)
}

fn button_device<'a>(manager: &'a PlejdManager) -> &'a plejd_mesh::device::button::ButtonDevice {
    manager
        .devices_for("d1")
        .into_iter()
        .find_map(|d| match d {
            Device::Button(b) => Some(b),
            _ => None,
        })
        .expect("roster entry should have produced a button device")
}

#[tokio::test]
async fn event_fired_notification_reaches_the_matching_button_device() {
    let (mut manager, gatt, gateway) = connected_manager().await;

    let key = SiteKey::from_hex(CRYPTO_KEY_HEX).unwrap();
    let frame = Frame::new(
        0x00,
        CommandType::DontRespond,
        Opcode::EventFired as u16,
        vec![0x05, 0x02, 0x00],
    );
    let encrypted = crypto::encrypt_decrypt(&key, gateway.as_bytes(), &frame.encode());
    gatt.push_notification(Characteristic::LastData, encrypted);

    manager.handle_next_event().await.unwrap();

    match button_device(&manager).project() {
        Projection::Button { action, button, .. } => {
            assert_eq!(button, 2);
            assert_eq!(action, Some(ButtonAction::Release));
        }
        other => panic!("expected button projection, got {other:?}"),
    }
}

#[tokio::test]
async fn button_fire_enqueues_an_event_prepare_write() {
    let (mut manager, gatt, gateway) = connected_manager().await;

    let key = SiteKey::from_hex(CRYPTO_KEY_HEX).unwrap();
    let frame = Frame::new(
        0x00,
        CommandType::DontRespond,
        Opcode::EventFired as u16,
        vec![0x05, 0x02, 0x00],
    );
    let encrypted = crypto::encrypt_decrypt(&key, gateway.as_bytes(), &frame.encode());
    gatt.push_notification(Characteristic::LastData, encrypted);

    manager.handle_next_event().await.unwrap();

    let writes = gatt.writes();
    let event_prepare = writes.iter().rev().find(|(characteristic, data)| {
        *characteristic == Characteristic::Data
            && crypto::encrypt_decrypt(&key, gateway.as_bytes(), data)
                .get(3..5)
                == Some(&(Opcode::EventPrepare as u16).to_be_bytes()[..])
    });
    assert!(
        event_prepare.is_some(),
        "expected an event-prepare frame to follow the button fire"
    );
}

#[tokio::test]
async fn stack_disconnect_event_marks_devices_unavailable() {
    let (mut manager, gatt, _gateway) = connected_manager().await;
    assert!(manager.connected().await);

    gatt.push_disconnect("link supervision timeout");
    manager.handle_next_event().await.unwrap();

    assert!(!manager.connected().await);
    match button_device(&manager).project() {
        Projection::Button { available, .. } => assert!(!available),
        other => panic!("expected button projection, got {other:?}"),
    }
}
