// The roster document: the cloud-provided site descriptor, and the narrow
// projection the rest of the core actually consumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoError, SiteKey};
use crate::device::PlejdTraits;
use crate::node::{AddressError, BleAddress};

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster document missing mesh crypto key")]
    MissingCryptoKey,

    #[error("invalid crypto key in roster document: {0}")]
    InvalidCryptoKey(#[from] CryptoError),

    #[error("invalid ble address in roster document: {0}")]
    InvalidBleAddress(#[from] AddressError),

    #[error("device {0} has no assigned mesh output address")]
    MissingOutputAddress(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteInfo {
    #[serde(rename = "siteId")]
    pub site_id: String,
    pub title: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlejdMeshInfo {
    #[serde(rename = "cryptoKey")]
    pub crypto_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub title: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub title: String,
    #[serde(rename = "roomId")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlejdDeviceRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "hardwareId")]
    pub hardware_id: String,
    #[serde(rename = "BLEAddress")]
    pub ble_address: String,
    #[serde(rename = "firmware")]
    pub firmware: Option<String>,
    #[serde(rename = "outputType")]
    pub output_type: Option<String>,
    #[serde(default)]
    pub traits: u8,
    #[serde(rename = "connectable", default = "default_true")]
    pub connectable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputSettingRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub input: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputSettingRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MotionSensorRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

/// The roster document as fetched from the cloud: opaque beyond the fields
/// the core actually needs, which is why the address tables are left as
/// `device id -> mesh address` maps rather than typed further.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RosterDocument {
    pub site: SiteInfo,
    #[serde(rename = "plejdMesh")]
    pub plejd_mesh: PlejdMeshInfo,
    #[serde(default)]
    pub rooms: Vec<RoomInfo>,
    #[serde(default)]
    pub scenes: Vec<SceneInfo>,
    pub devices: Vec<DeviceRecord>,
    #[serde(rename = "plejdDevices")]
    pub plejd_devices: Vec<PlejdDeviceRecord>,
    #[serde(rename = "inputSettings", default)]
    pub input_settings: Vec<InputSettingRecord>,
    #[serde(rename = "outputSettings", default)]
    pub output_settings: Vec<OutputSettingRecord>,
    #[serde(rename = "motionSensors", default)]
    pub motion_sensors: Vec<MotionSensorRecord>,
    #[serde(rename = "deviceAddress")]
    pub device_address: HashMap<String, u8>,
    #[serde(rename = "rxAddress", default)]
    pub rx_address: HashMap<String, u8>,
    #[serde(rename = "sceneIndex", default)]
    pub scene_index: HashMap<String, u8>,
}

/// One entry of the projected roster: everything `Manager` needs to
/// instantiate a device and register its MeshNode, with no further lookups
/// into the raw document required.
#[derive(Clone, Debug)]
pub struct RosterDeviceSpec {
    pub device_id: String,
    pub name: String,
    pub room: Option<String>,
    pub hidden: bool,
    pub ble_address: BleAddress,
    pub hardware: String,
    pub firmware: Option<String>,
    pub output_type: Option<String>,
    pub traits: PlejdTraits,
    pub connectable: bool,
    pub address: u8,
    pub rx_address: Option<u8>,
    /// Present iff this device has at least one registered input (button).
    pub input_buttons: Vec<u8>,
    pub is_motion_sensor: bool,
}

#[derive(Clone, Debug)]
pub struct RosterSceneSpec {
    pub title: String,
    pub hidden: bool,
    pub index: u8,
}

/// The narrow view the rest of the core actually consumes.
#[derive(Clone, Debug)]
pub struct RosterView {
    pub site_id: String,
    pub title: String,
    pub crypto_key: SiteKey,
    pub devices: Vec<RosterDeviceSpec>,
    pub scenes: Vec<RosterSceneSpec>,
}

impl RosterDocument {
    pub fn project(&self) -> Result<RosterView, RosterError> {
        let crypto_key = SiteKey::from_hex(&self.plejd_mesh.crypto_key)?;

        let room_titles: HashMap<&str, &str> = self
            .rooms
            .iter()
            .map(|r| (r.id.as_str(), r.title.as_str()))
            .collect();

        let mut devices = Vec::with_capacity(self.plejd_devices.len());
        for plejd_device in &self.plejd_devices {
            let record = self
                .devices
                .iter()
                .find(|d| d.id == plejd_device.device_id);

            let address = *self
                .device_address
                .get(&plejd_device.device_id)
                .ok_or_else(|| RosterError::MissingOutputAddress(plejd_device.device_id.clone()))?;
            let rx_address = self.rx_address.get(&plejd_device.device_id).copied();

            let input_buttons: Vec<u8> = self
                .input_settings
                .iter()
                .filter(|input| input.device_id == plejd_device.device_id)
                .map(|input| input.input)
                .collect();

            let is_motion_sensor = self
                .motion_sensors
                .iter()
                .any(|m| m.device_id == plejd_device.device_id);

            devices.push(RosterDeviceSpec {
                device_id: plejd_device.device_id.clone(),
                name: record.map(|r| r.title.clone()).unwrap_or_else(|| plejd_device.device_id.clone()),
                room: record
                    .and_then(|r| r.room_id.as_deref())
                    .and_then(|id| room_titles.get(id).map(|t| t.to_string())),
                hidden: record.map(|r| r.hidden).unwrap_or(false),
                ble_address: BleAddress::parse(&plejd_device.ble_address)?,
                hardware: plejd_device.hardware_id.clone(),
                firmware: plejd_device.firmware.clone(),
                output_type: plejd_device.output_type.clone(),
                traits: PlejdTraits::from_bits(plejd_device.traits),
                connectable: plejd_device.connectable,
                address,
                rx_address,
                input_buttons,
                is_motion_sensor,
            });
        }

        let scenes = self
            .scenes
            .iter()
            .map(|scene| RosterSceneSpec {
                title: scene.title.clone(),
                hidden: scene.hidden,
                index: self.scene_index.get(&scene.id).copied().unwrap_or(0),
            })
            .collect();

        Ok(RosterView {
            site_id: self.site.site_id.clone(),
            title: self.site.title.clone(),
            crypto_key,
            devices,
            scenes,
        })
    }
}
