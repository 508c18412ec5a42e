// Logical device model: the closed set of variants, their shared reducer
// contract, classification from roster traits, and frame-match/dispatch.

pub mod button;
pub mod climate;
pub mod cover;
pub mod fellowship;
pub mod light;
pub mod motion;
pub mod relay;
pub mod scene;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::codec::{BatchRecord, CommandType, Frame, Opcode, ADDR_BROADCAST};

/// Narrow capability a device holds to enqueue outbound frames, so devices
/// never hold a strong reference back to the manager that owns them.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frames: Vec<Frame>) -> Result<(), DeviceError>;
}

#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("device is unavailable")]
    Unavailable,
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Capability bitset derived from the roster. Classification uses `outputType`
/// first and these bits second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlejdTraits(u8);

impl PlejdTraits {
    pub const NONE: Self = Self(0);
    pub const POWER: Self = Self(0x01);
    pub const DIM: Self = Self(0x02);
    pub const TEMP: Self = Self(0x04);
    pub const GROUP: Self = Self(0x08);
    pub const COVER: Self = Self(0x10);
    pub const CLIMATE: Self = Self(0x20);
    pub const TILT: Self = Self(0x40);
    pub const CLIMATE_PWM: Self = Self(0x80);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for PlejdTraits {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// The closed set of logical device kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Light,
    Relay,
    Cover,
    Climate,
    Button,
    Motion,
    Scene,
    FellowshipFollower,
    Unknown,
}

/// Classify a device once at roster load: `outputType` (hardware-reported
/// role, as a lower-case string from the roster document) takes priority;
/// trait bits are the fallback for hardware that reports a generic type.
pub fn classify(output_type: Option<&str>, traits: PlejdTraits, is_fellowship: bool) -> DeviceKind {
    if is_fellowship {
        return DeviceKind::FellowshipFollower;
    }
    match output_type {
        Some("light") => return DeviceKind::Light,
        Some("relay") => return DeviceKind::Relay,
        Some("cover") | Some("coveringapi") => return DeviceKind::Cover,
        Some("climate") => return DeviceKind::Climate,
        Some("button") => return DeviceKind::Button,
        Some("motion") => return DeviceKind::Motion,
        Some("scene") => return DeviceKind::Scene,
        _ => {}
    }
    if traits.contains(PlejdTraits::CLIMATE) {
        DeviceKind::Climate
    } else if traits.contains(PlejdTraits::COVER) {
        DeviceKind::Cover
    } else if traits.contains(PlejdTraits::DIM) || traits.contains(PlejdTraits::TEMP) {
        DeviceKind::Light
    } else if traits.contains(PlejdTraits::POWER) {
        DeviceKind::Relay
    } else {
        DeviceKind::Unknown
    }
}

/// Static, roster-derived identity shared by every device variant.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub address: u8,
    pub rx_address: Option<u8>,
    pub ble_address: crate::node::BleAddress,
    pub name: String,
    pub room: Option<String>,
    pub traits: PlejdTraits,
    pub hardware: String,
    pub firmware: Option<String>,
    pub hidden: bool,
}

impl DeviceInfo {
    /// `F.addr ∈ {D.address, D.rxAddress, 0}`. Button devices additionally
    /// require a matching input index, checked by the button variant itself.
    pub fn matches_address(&self, frame_addr: u8) -> bool {
        frame_addr == self.address || Some(frame_addr) == self.rx_address || frame_addr == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonAction {
    Press,
    Release,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClimateMode {
    Off,
    Idle,
    Heating,
}

/// The outward-facing view every device emits to subscribers. Always carries
/// `available`.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    Light {
        available: bool,
        state: bool,
        dim: f32,
        colortemp: Option<u32>,
    },
    Relay {
        available: bool,
        state: bool,
    },
    Cover {
        available: bool,
        moving: bool,
        position: u8,
        angle: Option<i8>,
        opening: Option<bool>,
    },
    Climate {
        available: bool,
        mode: ClimateMode,
        current_temperature: Option<f32>,
        setpoint: Option<f32>,
        floor_min_temp: Option<f32>,
        floor_max_temp: Option<f32>,
        room_max_temp: Option<f32>,
    },
    Motion {
        available: bool,
        motion: bool,
        luminance: Option<u16>,
        battery: Option<u8>,
    },
    Button {
        available: bool,
        button: u8,
        action: Option<ButtonAction>,
    },
    Scene {
        available: bool,
        triggered: bool,
    },
    FellowshipFollower {
        available: bool,
    },
    Unknown {
        available: bool,
    },
}

/// Fan-out for one device's projected-state stream. Each `subscribe()` call
/// gets its own receiver; a slow subscriber drops the oldest unread update
/// rather than blocking dispatch (bounded broadcast, matching the
/// single-event-loop discipline: dispatch must never await a subscriber).
#[derive(Clone)]
pub struct Subscribers {
    tx: broadcast::Sender<Projection>,
}

impl Default for Subscribers {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(32);
        Self { tx }
    }
}

impl Subscribers {
    pub fn subscribe(&self) -> broadcast::Receiver<Projection> {
        self.tx.subscribe()
    }

    /// Fire exactly once; a channel with no subscribers is not an error.
    pub fn notify(&self, projection: Projection) {
        let _ = self.tx.send(projection);
    }
}

/// The closed set of device variants, dispatched over by address/opcode.
pub enum Device {
    Light(light::LightDevice),
    Relay(relay::RelayDevice),
    Cover(cover::CoverDevice),
    Climate(climate::ClimateDevice),
    Button(button::ButtonDevice),
    Motion(motion::MotionDevice),
    Scene(scene::SceneDevice),
    FellowshipFollower(fellowship::FellowshipDevice),
    Unknown(DeviceInfo, Subscribers),
}

impl Device {
    pub fn info(&self) -> &DeviceInfo {
        match self {
            Self::Light(d) => &d.info,
            Self::Relay(d) => &d.info,
            Self::Cover(d) => &d.info,
            Self::Climate(d) => &d.info,
            Self::Button(d) => &d.info,
            Self::Motion(d) => &d.info,
            Self::Scene(d) => &d.info,
            Self::FellowshipFollower(d) => &d.info,
            Self::Unknown(info, _) => info,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Light(_) => DeviceKind::Light,
            Self::Relay(_) => DeviceKind::Relay,
            Self::Cover(_) => DeviceKind::Cover,
            Self::Climate(_) => DeviceKind::Climate,
            Self::Button(_) => DeviceKind::Button,
            Self::Motion(_) => DeviceKind::Motion,
            Self::Scene(_) => DeviceKind::Scene,
            Self::FellowshipFollower(_) => DeviceKind::FellowshipFollower,
            Self::Unknown(..) => DeviceKind::Unknown,
        }
    }

    /// Whether `frame` is addressed to this device. Button devices override
    /// the plain address check with an additional input-index requirement.
    pub fn matches(&self, frame: &Frame) -> bool {
        match self {
            Self::Button(d) => d.matches(frame),
            other => other.info().matches_address(frame.addr),
        }
    }

    /// Apply one matched frame; pure except for the owned state map.
    pub fn apply(&mut self, frame: &Frame) {
        match self {
            Self::Light(d) => d.apply(frame),
            Self::Relay(d) => d.apply(frame),
            Self::Cover(d) => d.apply(frame),
            Self::Climate(d) => d.apply(frame),
            Self::Button(d) => d.apply(frame),
            Self::Motion(d) => d.apply(frame),
            Self::Scene(d) => d.apply(frame),
            Self::FellowshipFollower(_) | Self::Unknown(..) => {}
        }
    }

    pub fn project(&self) -> Projection {
        match self {
            Self::Light(d) => d.project(),
            Self::Relay(d) => d.project(),
            Self::Cover(d) => d.project(),
            Self::Climate(d) => d.project(),
            Self::Button(d) => d.project(),
            Self::Motion(d) => d.project(),
            Self::Scene(d) => d.project(),
            Self::FellowshipFollower(d) => d.project(),
            Self::Unknown(_, _) => Projection::Unknown { available: false },
        }
    }

    pub fn set_available(&mut self, available: bool) {
        match self {
            Self::Light(d) => d.available = available,
            Self::Relay(d) => d.available = available,
            Self::Cover(d) => d.available = available,
            Self::Climate(d) => d.set_available(available),
            Self::Button(d) => d.available = available,
            Self::Motion(d) => d.available = available,
            Self::Scene(d) => d.available = available,
            Self::FellowshipFollower(d) => d.available = available,
            Self::Unknown(..) => {}
        }
    }

    pub fn subscribers(&self) -> &Subscribers {
        match self {
            Self::Light(d) => &d.subs,
            Self::Relay(d) => &d.subs,
            Self::Cover(d) => &d.subs,
            Self::Climate(d) => &d.subs,
            Self::Button(d) => &d.subs,
            Self::Motion(d) => &d.subs,
            Self::Scene(d) => &d.subs,
            Self::FellowshipFollower(d) => &d.subs,
            Self::Unknown(_, subs) => subs,
        }
    }

    /// Notify subscribers with the current projection; called once per
    /// matched device after `apply`, in frame-arrival order.
    pub fn notify(&self) {
        self.subscribers().notify(self.project());
    }
}

/// Result of dispatching one inbound frame: how many devices matched, and
/// whether any of them was a button (the caller enqueues `event-prepare`
/// after a button fires, per §4.4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub matched: usize,
    pub button_event: bool,
}

/// Routes inbound frames to the matching logical devices and fires their
/// subscribers, in frame-arrival order. Owns the closed device set; nothing
/// outside this module ever iterates `Vec<Device>` directly.
pub struct Dispatcher {
    devices: Vec<Device>,
}

impl Dispatcher {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    pub fn push(&mut self, device: Device) {
        self.devices.push(device);
    }

    /// Dispatch one decoded inbound frame to every matching device: apply,
    /// then notify, in that order, once per device (§4.4 rule 1-2). An
    /// unrecognised opcode is logged and discarded rather than matched.
    pub fn dispatch(&mut self, frame: &Frame) -> DispatchOutcome {
        if frame.opcode().is_none() {
            if frame.addr == ADDR_BROADCAST {
                warn!(opcode = format!("0x{:04x}", frame.opcode_raw), "unknown command");
            } else {
                warn!(
                    opcode = format!("0x{:04x}", frame.opcode_raw),
                    addr = frame.addr,
                    "unrecognised opcode"
                );
            }
            return DispatchOutcome::default();
        }

        let mut outcome = DispatchOutcome::default();
        for device in self.devices.iter_mut() {
            if device.matches(frame) {
                device.apply(frame);
                device.notify();
                outcome.matched += 1;
                if device.kind() == DeviceKind::Button {
                    outcome.button_event = true;
                }
            }
        }
        outcome
    }

    /// Split a poll/lightlevel batch into per-record frames and dispatch each
    /// as normal, synthesised with `GroupStateAndLevel`/`OutputStateAndLevel`
    /// semantics (§4.2). Returns the total number of device matches across
    /// every record.
    pub fn dispatch_batch(&mut self, records: &[BatchRecord]) -> usize {
        let mut total = 0;
        for record in records {
            let position_bytes = record.cover_position.to_le_bytes();
            let frame = Frame::new(
                record.addr,
                CommandType::DontRespond,
                Opcode::OutputStateAndLevel as u16,
                vec![record.state as u8, position_bytes[0], position_bytes[1]],
            );
            total += self.dispatch(&frame).matched;
        }
        total
    }
}
