// Public façade: initialise from a fetched roster, wire the device model to
// a session, and drive ping / keep-alive / time-broadcast / blacklist (§4.6).
//
// The cyclic reference a naive port would reach for (Device -> Manager ->
// Device) is avoided the way the design notes prescribe: devices hold a
// narrow capability (`SessionSink`, an `Arc` around the session) rather than
// the manager itself, so there is no strong cycle for the owner to break.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cloud::{RosterFetcher, SiteSummary};
use crate::codec::{batch, CommandType, Frame};
use crate::device::button::ButtonDevice;
use crate::device::climate::ClimateDevice;
use crate::device::cover::CoverDevice;
use crate::device::fellowship::FellowshipDevice;
use crate::device::light::LightDevice;
use crate::device::motion::MotionDevice;
use crate::device::relay::RelayDevice;
use crate::device::scene::SceneDevice;
use crate::device::{
    classify, Device, DeviceError, DeviceInfo, DeviceKind, Dispatcher, FrameSink, Subscribers,
};
use crate::error::PlejdError;
use crate::gatt::{Characteristic, GattEvent, PlejdGatt};
use crate::mesh::{MeshSession, DEFAULT_PING_INTERVAL};
use crate::node::{BleAddress, NodeTable};
use crate::roster::{RosterDeviceSpec, RosterDocument, RosterView};
use crate::storage::MeshStore;

/// The placeholder BLE identity used for purely logical devices (scenes)
/// that are not tied to any single physical node.
const VIRTUAL_BLE_ADDRESS: [u8; 6] = [0, 0, 0, 0, 0, 0];

/// The narrow send capability devices hold instead of a reference back to
/// the manager: lock the shared session, hand off the frames, unlock.
struct SessionSink(Arc<Mutex<MeshSession>>);

#[async_trait::async_trait]
impl FrameSink for SessionSink {
    async fn send(&self, frames: Vec<Frame>) -> Result<(), DeviceError> {
        let session = self.0.lock().await;
        session
            .write_frames(&frames)
            .await
            .map_err(|e| DeviceError::SendFailed(e.to_string()))
    }
}

/// Index into `Dispatcher`'s device list, by roster device id (one-to-many:
/// a roster entry with several input buttons gets several `Device::Button`
/// entries) and by scene index.
#[derive(Default)]
struct DeviceIndex {
    by_device_id: HashMap<String, Vec<usize>>,
    by_scene_index: HashMap<u8, usize>,
}

pub struct PlejdManager {
    username: String,
    password: String,
    site_id: String,
    gatt: Arc<dyn PlejdGatt>,
    fetcher: Arc<dyn RosterFetcher>,
    store: Option<MeshStore>,
    session: Option<Arc<Mutex<MeshSession>>>,
    nodes: NodeTable,
    dispatcher: Dispatcher,
    index: DeviceIndex,
    roster: Option<RosterView>,
    ping_interval: Duration,
}

impl PlejdManager {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        site_id: impl Into<String>,
        gatt: Arc<dyn PlejdGatt>,
        fetcher: Arc<dyn RosterFetcher>,
        store: Option<MeshStore>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            site_id: site_id.into(),
            gatt,
            fetcher,
            store,
            session: None,
            nodes: NodeTable::new(),
            dispatcher: Dispatcher::new(Vec::new()),
            index: DeviceIndex::default(),
            roster: None,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn site_data(&self) -> Option<&RosterView> {
        self.roster.as_ref()
    }

    pub async fn connected(&self) -> bool {
        match &self.session {
            Some(session) => session.lock().await.is_connected(),
            None => false,
        }
    }

    pub fn devices(&self) -> &[Device] {
        self.dispatcher.devices()
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.index
            .by_device_id
            .get(device_id)
            .and_then(|indices| indices.first())
            .map(|&i| &self.dispatcher.devices()[i])
    }

    pub fn devices_for(&self, device_id: &str) -> Vec<&Device> {
        self.index
            .by_device_id
            .get(device_id)
            .map(|indices| indices.iter().map(|&i| &self.dispatcher.devices()[i]).collect())
            .unwrap_or_default()
    }

    pub fn scene(&self, index: u8) -> Option<&Device> {
        self.index
            .by_scene_index
            .get(&index)
            .map(|&i| &self.dispatcher.devices()[i])
    }

    // -- caller helpers that never touch a live session ---------------------

    pub async fn list_sites(
        fetcher: &dyn RosterFetcher,
        username: &str,
        password: &str,
    ) -> Result<Vec<SiteSummary>, PlejdError> {
        Ok(fetcher.list_sites(username, password).await?)
    }

    pub async fn verify_credentials(
        fetcher: &dyn RosterFetcher,
        username: &str,
        password: &str,
    ) -> Result<(), PlejdError> {
        Ok(fetcher.verify_credentials(username, password).await?)
    }

    // -- initialisation -------------------------------------------------------

    /// Load the roster (preferring a live cloud fetch, falling back to
    /// `snapshot` or a persisted snapshot if the fetch fails), set the key on
    /// a fresh session, instantiate every device, and register each device's
    /// BLE address as an expected MeshNode.
    pub async fn init(&mut self, snapshot: Option<RosterDocument>) -> Result<(), PlejdError> {
        let document = self.load_roster_document(snapshot).await?;
        let view = document.project()?;

        let session = Arc::new(Mutex::new(MeshSession::new(self.gatt.clone(), view.crypto_key.clone())));
        let sink: Arc<dyn FrameSink> = Arc::new(SessionSink(session.clone()));

        let mut dispatcher = Dispatcher::new(Vec::new());
        let mut index = DeviceIndex::default();

        for spec in &view.devices {
            self.nodes.expect(spec.ble_address, spec.connectable);
            instantiate_roster_device(spec, &sink, &mut dispatcher, &mut index);
        }

        for scene in &view.scenes {
            let position = dispatcher.devices().len();
            let info = virtual_device_info(scene.title.clone(), scene.hidden);
            dispatcher.push(Device::Scene(SceneDevice::new(info, scene.index, sink.clone())));
            index.by_scene_index.insert(scene.index, position);
        }

        self.session = Some(session);
        self.dispatcher = dispatcher;
        self.index = index;
        self.roster = Some(view);
        Ok(())
    }

    async fn load_roster_document(
        &self,
        snapshot: Option<RosterDocument>,
    ) -> Result<RosterDocument, PlejdError> {
        match self.fetcher.load_site(&self.username, &self.password, &self.site_id).await {
            Ok(document) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save_roster_snapshot(&self.site_id, &document) {
                        warn!(error = %e, "failed to persist roster snapshot");
                    }
                }
                Ok(document)
            }
            Err(fetch_err) => {
                warn!(error = %fetch_err, "live roster fetch failed, attempting fallback");
                if let Some(document) = snapshot {
                    return Ok(document);
                }
                if let Some(store) = &self.store {
                    if let Some(document) = store.load_roster_snapshot(&self.site_id)? {
                        return Ok(document);
                    }
                }
                Err(fetch_err.into())
            }
        }
    }

    // -- scan feed --------------------------------------------------------

    /// Record a scan callback observation; true the first time this peer is seen.
    pub fn add_mesh_device(&mut self, ble_address: BleAddress, rssi: i16) -> bool {
        self.nodes.see(ble_address, rssi)
    }

    // -- session-driving operations -----------------------------------------

    /// Ensure a session (connecting if idle), run one keep-alive cycle, then
    /// a poll; outside the write mutex, follow a successful keep-alive with
    /// `event-prepare` if button activity was observed this cycle.
    pub async fn ping(&mut self) -> Result<(), PlejdError> {
        let session = self.session.as_ref().ok_or(PlejdError::NotInitialised)?;

        let mut newly_connected = false;
        let keep_alive_ok = {
            let mut guard = session.lock().await;
            if !guard.is_connected() {
                let candidates = self.nodes.gateway_candidates();
                if candidates.is_empty() {
                    return Err(PlejdError::NoCandidateGateway);
                }
                // §3: rssi tracks the peak since the *last connect attempt*, not
                // an all-time high. Reset every candidate's peak now that a fresh
                // attempt is starting, so the next scan callback starts clean.
                for &candidate in &candidates {
                    if let Some(node) = self.nodes.get_mut(candidate) {
                        node.reset_rssi_peak();
                    }
                }
                guard.connect(&candidates).await?;
                if let Some(gateway) = guard.gateway() {
                    self.nodes.clear_gateway();
                    if let Some(node) = self.nodes.get_mut(gateway) {
                        node.set_gateway(true);
                    }
                }
                newly_connected = true;
            }
            guard.keep_alive().await?
        };

        if !keep_alive_ok {
            self.mark_session_lost().await;
        } else if newly_connected {
            self.set_all_devices_available(true);
        }

        Ok(())
    }

    /// Iterate powered devices; broadcast current time to the whole mesh for
    /// the first one whose clock has drifted beyond the threshold.
    pub async fn broadcast_time(&self) -> Result<(), PlejdError> {
        let session = self.session.as_ref().ok_or(PlejdError::NotInitialised)?;
        let now = now_unix_secs();
        let dst_offset_hours = dst_offset_hours();

        for device in self.dispatcher.devices() {
            if !matches!(device.kind(), DeviceKind::Light | DeviceKind::Relay | DeviceKind::Climate) {
                continue;
            }
            let guard = session.lock().await;
            match guard.poll_time(device.info().address, now, dst_offset_hours).await {
                Ok(drifted) if drifted => {
                    info!(address = device.info().address, "clock drift detected, broadcasting time");
                    guard.broadcast_time(now, dst_offset_hours).await?;
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(address = device.info().address, error = %e, "poll_time failed, trying next device");
                    continue;
                }
            }
        }
        Ok(())
    }

    /// Update every MeshNode's blacklist flag; if the current gateway was
    /// just blacklisted, force a disconnect so the next `ping` reselects,
    /// then ping immediately.
    pub async fn set_blacklist(&mut self, blacklisted: HashSet<BleAddress>) -> Result<(), PlejdError> {
        let gateway_was_blacklisted = self
            .nodes
            .current_gateway()
            .map(|gw| blacklisted.contains(&gw))
            .unwrap_or(false);

        self.nodes.set_blacklist(blacklisted);

        if gateway_was_blacklisted {
            self.disconnect().await;
        }
        self.ping().await
    }

    /// Tear down the session and notify every device unavailable.
    pub async fn disconnect(&mut self) {
        if let Some(session) = &self.session {
            session.lock().await.disconnect().await;
        }
        self.nodes.clear_gateway();
        self.set_all_devices_available(false);
    }

    async fn mark_session_lost(&mut self) {
        if let Some(session) = &self.session {
            session.lock().await.mark_lost();
        }
        self.nodes.clear_gateway();
        self.set_all_devices_available(false);
    }

    fn set_all_devices_available(&mut self, available: bool) {
        for device in self.dispatcher.devices_mut() {
            device.set_available(available);
            device.notify();
        }
    }

    // -- ingress event loop ---------------------------------------------------

    /// Drive the single event loop: wait for the next BLE stack event and
    /// dispatch it. Runs until the stack reports a disconnect or `next_event`
    /// returns `None` (the gatt implementation is shutting down). Intended to
    /// be awaited in a loop by the caller (typically `main.rs`).
    pub async fn handle_next_event(&mut self) -> Result<(), PlejdError> {
        let session = self.session.as_ref().ok_or(PlejdError::NotInitialised)?.clone();
        let event = session.lock().await.next_event().await;

        match event {
            Some(GattEvent::Notification { characteristic, data }) => {
                self.handle_notification(characteristic, data).await
            }
            Some(GattEvent::Disconnected { reason }) => {
                warn!(%reason, "stack-initiated disconnect");
                self.mark_session_lost().await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn handle_notification(&mut self, characteristic: Characteristic, data: Vec<u8>) -> Result<(), PlejdError> {
        let session = self.session.as_ref().ok_or(PlejdError::NotInitialised)?.clone();
        let Some(decrypted) = session.lock().await.decrypt(&data) else {
            return Ok(());
        };

        match characteristic {
            Characteristic::Poll => {
                let (records, batch_err) = batch::decode_batch(&decrypted);
                if let Some(e) = batch_err {
                    warn!(error = %e, "malformed poll batch");
                }
                self.dispatcher.dispatch_batch(&records);
            }
            Characteristic::LastData => {
                let frame = match crate::codec::Frame::decode(&decrypted) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "failed to decode mesh frame");
                        return Ok(());
                    }
                };
                let outcome = self.dispatcher.dispatch(&frame);
                if outcome.button_event {
                    // §4.4: a button-fired frame is followed, after notifying,
                    // by an outbound event-prepare so the mesh reveals any
                    // coalesced presses. Also recorded for the next keep-alive
                    // cycle, which issues its own event-prepare if any button
                    // activity was seen since the last one.
                    if let Some(session) = &self.session {
                        let mut guard = session.lock().await;
                        guard.note_button_seen();
                        if let Err(e) = guard
                            .write_frame(&crate::codec::Frame::new(
                                crate::codec::ADDR_BROADCAST,
                                CommandType::DontRespond,
                                crate::codec::Opcode::EventPrepare as u16,
                                Vec::new(),
                            ))
                            .await
                        {
                            warn!(error = %e, "failed to enqueue event-prepare after button fire");
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn now_unix_secs() -> i64 {
    Utc::now().timestamp()
}

/// Current local UTC-offset, in whole hours, standing in for the DST-hour
/// offset §4.6 adds on top of the epoch-seconds time broadcast.
fn dst_offset_hours() -> i64 {
    Local::now().offset().local_minus_utc() as i64 / 3600
}

fn virtual_device_info(name: String, hidden: bool) -> DeviceInfo {
    DeviceInfo {
        address: crate::codec::ADDR_SCENE,
        rx_address: None,
        ble_address: BleAddress::from_bytes(VIRTUAL_BLE_ADDRESS),
        name,
        room: None,
        traits: crate::device::PlejdTraits::NONE,
        hardware: "scene".into(),
        firmware: None,
        hidden,
    }
}

fn device_info(spec: &RosterDeviceSpec) -> DeviceInfo {
    DeviceInfo {
        address: spec.address,
        rx_address: spec.rx_address,
        ble_address: spec.ble_address,
        name: spec.name.clone(),
        room: spec.room.clone(),
        traits: spec.traits,
        hardware: spec.hardware.clone(),
        firmware: spec.firmware.clone(),
        hidden: spec.hidden,
    }
}

/// Classify and build every `Device` a single roster entry produces: the
/// primary output device (if any), plus one `Device::Button` per registered
/// input. A device can be both (a wall switch with a relay output and
/// physical buttons), so these are not mutually exclusive.
fn instantiate_roster_device(
    spec: &RosterDeviceSpec,
    sink: &Arc<dyn FrameSink>,
    dispatcher: &mut Dispatcher,
    index: &mut DeviceIndex,
) {
    let mut kind = classify(spec.output_type.as_deref(), spec.traits, is_fellowship(spec));
    if spec.is_motion_sensor {
        kind = DeviceKind::Motion;
    }

    let mut indices = Vec::new();

    if !matches!(kind, DeviceKind::Button) {
        let info = device_info(spec);
        let device = match kind {
            DeviceKind::Light => Device::Light(LightDevice::new(info, sink.clone())),
            DeviceKind::Relay => Device::Relay(RelayDevice::new(info, sink.clone())),
            DeviceKind::Cover => Device::Cover(CoverDevice::new(info, sink.clone())),
            DeviceKind::Climate => Device::Climate(ClimateDevice::new(info, sink.clone())),
            DeviceKind::Motion => Device::Motion(MotionDevice::new(info, sink.clone())),
            DeviceKind::Scene => Device::Scene(SceneDevice::new(info, 0, sink.clone())),
            DeviceKind::FellowshipFollower => Device::FellowshipFollower(FellowshipDevice::new(info)),
            DeviceKind::Button | DeviceKind::Unknown => Device::Unknown(info, Subscribers::default()),
        };
        indices.push(dispatcher.devices().len());
        dispatcher.push(device);
    }

    for &button in &spec.input_buttons {
        indices.push(dispatcher.devices().len());
        dispatcher.push(Device::Button(ButtonDevice::new(device_info(spec), button)));
    }

    index.by_device_id.insert(spec.device_id.clone(), indices);
}

/// A fellowship follower is a roster entry classified as `light`/`relay`-like
/// but whose traits carry the `GROUP` bit with no power output of its own;
/// the roster document does not name this explicitly, so it is inferred from
/// the absence of both `POWER` and `COVER`/`CLIMATE` traits alongside `GROUP`.
fn is_fellowship(spec: &RosterDeviceSpec) -> bool {
    use crate::device::PlejdTraits;
    spec.traits.contains(PlejdTraits::GROUP)
        && !spec.traits.contains(PlejdTraits::POWER)
        && !spec.traits.contains(PlejdTraits::COVER)
        && !spec.traits.contains(PlejdTraits::CLIMATE)
}
