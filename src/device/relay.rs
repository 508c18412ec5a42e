use std::sync::Arc;

use crate::codec::{CommandType, Frame, Opcode};
use crate::device::{DeviceError, DeviceInfo, FrameSink, Projection, Subscribers};

pub struct RelayDevice {
    pub info: DeviceInfo,
    pub subs: Subscribers,
    pub available: bool,
    state: bool,
    sink: Arc<dyn FrameSink>,
}

impl RelayDevice {
    pub fn new(info: DeviceInfo, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            info,
            subs: Subscribers::default(),
            available: false,
            state: false,
            sink,
        }
    }

    pub(crate) fn apply(&mut self, frame: &Frame) {
        match frame.opcode() {
            Some(Opcode::GroupState) => {
                if let Some(&on) = frame.payload.first() {
                    self.state = on != 0;
                }
            }
            Some(Opcode::GroupStateAndLevel) | Some(Opcode::OutputStateAndLevel) => {
                if let Some(&on) = frame.payload.first() {
                    self.state = on != 0;
                }
            }
            _ => {}
        }
    }

    pub(crate) fn project(&self) -> Projection {
        Projection::Relay {
            available: self.available,
            state: self.state,
        }
    }

    pub async fn turn_on(&self) -> Result<(), DeviceError> {
        self.set_state(true).await
    }

    pub async fn turn_off(&self) -> Result<(), DeviceError> {
        self.set_state(false).await
    }

    async fn set_state(&self, on: bool) -> Result<(), DeviceError> {
        if !self.available {
            return Err(DeviceError::Unavailable);
        }
        self.sink
            .send(vec![Frame::new(
                self.info.address,
                CommandType::DontRespond,
                Opcode::GroupState as u16,
                vec![on as u8],
            )])
            .await
    }
}
