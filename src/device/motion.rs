// Motion sensor: rising-edge-only hardware, so the auto-clear timer and the
// ambient-light follow-up read both live here rather than on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::codec::minipkg::{TYPE_BATTERY_INFO, TYPE_LUX, TYPE_SOURCE};
use crate::codec::minipkg::SOURCE_MOTION;
use crate::codec::{CommandType, Frame, Opcode};
use crate::device::{DeviceInfo, FrameSink, Projection, Subscribers};

/// The hardware only ever reports a rising edge; motion is cleared locally
/// after this long with no re-trigger.
const MOTION_AUTO_CLEAR: Duration = Duration::from_secs(75);

#[derive(Default)]
struct MotionState {
    motion: bool,
    luminance: Option<u16>,
    battery: Option<u8>,
}

pub struct MotionDevice {
    pub info: DeviceInfo,
    pub subs: Subscribers,
    pub available: bool,
    state: Arc<StdMutex<MotionState>>,
    generation: Arc<AtomicU64>,
    sink: Arc<dyn FrameSink>,
}

impl MotionDevice {
    pub fn new(info: DeviceInfo, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            info,
            subs: Subscribers::default(),
            available: false,
            state: Arc::new(StdMutex::new(MotionState::default())),
            generation: Arc::new(AtomicU64::new(0)),
            sink,
        }
    }

    pub(crate) fn apply(&mut self, frame: &Frame) {
        let Some(Opcode::OutputSet) = frame.opcode() else {
            return;
        };
        let Ok(pkgs) = frame.minipkgs() else {
            return;
        };

        for pkg in pkgs {
            if pkg.kind == TYPE_SOURCE && pkg.payload.first() == Some(&SOURCE_MOTION) {
                self.trigger_motion();
            } else if pkg.kind == TYPE_BATTERY_INFO && pkg.payload.len() >= 2 {
                self.state.lock().unwrap().battery = Some(pkg.payload[1]);
            } else if pkg.kind == TYPE_LUX {
                if pkg.payload.len() >= 2 {
                    let raw = u16::from_be_bytes([pkg.payload[0], pkg.payload[1]]);
                    self.state.lock().unwrap().luminance = Some(raw);
                } else {
                    self.spawn_ambient_light_followup();
                }
            }
        }
    }

    pub(crate) fn project(&self) -> Projection {
        let state = self.state.lock().unwrap();
        Projection::Motion {
            available: self.available,
            motion: state.motion,
            luminance: state.luminance,
            battery: state.battery,
        }
    }

    fn trigger_motion(&self) {
        self.state.lock().unwrap().motion = true;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let state = self.state.clone();
        let gen_cell = self.generation.clone();
        let subs = self.subs.clone();
        let available = self.available;
        tokio::spawn(async move {
            tokio::time::sleep(MOTION_AUTO_CLEAR).await;
            if gen_cell.load(Ordering::SeqCst) == generation {
                let projection = {
                    let mut guard = state.lock().unwrap();
                    guard.motion = false;
                    Projection::Motion {
                        available,
                        motion: false,
                        luminance: guard.luminance,
                        battery: guard.battery,
                    }
                };
                subs.notify(projection);
            }
        });
    }

    /// A motion event's lux mini-package in the wild only carries a threshold
    /// flag, not a reading; request a fresh ambient-light read to follow it up.
    fn spawn_ambient_light_followup(&self) {
        let sink = self.sink.clone();
        let addr = self.info.address;
        tokio::spawn(async move {
            let _ = sink
                .send(vec![Frame::new(
                    addr,
                    CommandType::Read,
                    Opcode::AmbientLightRead as u16,
                    Vec::new(),
                )])
                .await;
        });
    }
}
