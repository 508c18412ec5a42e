use std::sync::{Arc, Mutex as StdMutex};

use crate::codec::{CommandType, Frame, Opcode, ADDR_SCENE};
use crate::device::{DeviceError, DeviceInfo, FrameSink, Projection, Subscribers};

pub struct SceneDevice {
    pub info: DeviceInfo,
    /// Index in `[0, 255]`; every scene device shares `info.address == ADDR_SCENE`,
    /// so this is what actually distinguishes one scene from another.
    pub index: u8,
    pub subs: Subscribers,
    pub available: bool,
    /// Transient: consumed (and cleared) by the next `project`.
    triggered: StdMutex<bool>,
    sink: Arc<dyn FrameSink>,
}

impl SceneDevice {
    pub fn new(info: DeviceInfo, index: u8, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            info,
            index,
            subs: Subscribers::default(),
            available: false,
            triggered: StdMutex::new(false),
            sink,
        }
    }

    pub(crate) fn apply(&mut self, frame: &Frame) {
        if frame.opcode() != Some(Opcode::Scene) {
            return;
        }
        if frame.payload.first() == Some(&self.index) {
            *self.triggered.lock().unwrap() = true;
        }
    }

    pub(crate) fn project(&self) -> Projection {
        let mut triggered = self.triggered.lock().unwrap();
        let fired = *triggered;
        *triggered = false;
        Projection::Scene {
            available: self.available,
            triggered: fired,
        }
    }

    pub async fn activate(&self) -> Result<(), DeviceError> {
        if !self.available {
            return Err(DeviceError::Unavailable);
        }
        self.sink
            .send(vec![Frame::new(
                ADDR_SCENE,
                CommandType::DontRespond,
                Opcode::Scene as u16,
                vec![self.index],
            )])
            .await
    }
}
