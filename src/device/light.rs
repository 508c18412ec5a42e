use std::sync::Arc;

use crate::codec::{CommandType, Frame, MiniPackage, Opcode};
use crate::device::{DeviceError, DeviceInfo, FrameSink, PlejdTraits, Projection, Subscribers};

const TYPE_WHITE_BALANCE: u16 = crate::codec::minipkg::TYPE_WHITE_BALANCE;

pub struct LightDevice {
    pub info: DeviceInfo,
    pub subs: Subscribers,
    pub available: bool,
    state: bool,
    dim: u8,
    colortemp: Option<u32>,
    sink: Arc<dyn FrameSink>,
}

impl LightDevice {
    pub fn new(info: DeviceInfo, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            info,
            subs: Subscribers::default(),
            available: false,
            state: false,
            dim: 0,
            colortemp: None,
            sink,
        }
    }

    pub(crate) fn apply(&mut self, frame: &Frame) {
        match frame.opcode() {
            Some(Opcode::GroupStateAndLevel) | Some(Opcode::OutputStateAndLevel) => {
                if frame.payload.len() >= 3 {
                    self.state = frame.payload[0] != 0;
                    self.dim = frame.payload[2];
                }
            }
            Some(Opcode::GroupState) => {
                if let Some(&on) = frame.payload.first() {
                    self.state = on != 0;
                }
            }
            Some(Opcode::OutputSet) => {
                if let Ok(pkgs) = frame.minipkgs() {
                    for pkg in pkgs {
                        if pkg.kind == TYPE_WHITE_BALANCE && pkg.payload.len() >= 2 {
                            let raw = u16::from_be_bytes([pkg.payload[0], pkg.payload[1]]) as u32;
                            if raw > 0 {
                                self.colortemp = Some(1_000_000 / raw);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn project(&self) -> Projection {
        Projection::Light {
            available: self.available,
            state: self.state,
            dim: self.dim as f32 / 255.0,
            colortemp: self.colortemp,
        }
    }

    pub async fn turn_on(&self, dim: Option<u8>, colortemp: Option<u32>) -> Result<(), DeviceError> {
        if !self.available {
            return Err(DeviceError::Unavailable);
        }
        let dim_byte = dim.unwrap_or(self.dim).max(1);
        let mut frames = vec![Frame::new(
            self.info.address,
            CommandType::DontRespond,
            Opcode::GroupStateAndLevel as u16,
            vec![0x01, dim_byte, dim_byte],
        )];

        if self.info.traits.contains(PlejdTraits::TEMP) {
            if let Some(k) = colortemp {
                let inverted = (1_000_000u32 / k.max(1)) as u16;
                let pkg = MiniPackage::new(TYPE_WHITE_BALANCE, inverted.to_be_bytes().to_vec());
                frames.push(Frame::with_minipkgs(
                    self.info.address,
                    CommandType::DontRespond,
                    &[pkg],
                ));
            }
        }

        self.sink
            .send(frames)
            .await
    }

    pub async fn turn_off(&self) -> Result<(), DeviceError> {
        if !self.available {
            return Err(DeviceError::Unavailable);
        }
        self.sink
            .send(vec![Frame::new(
                self.info.address,
                CommandType::DontRespond,
                Opcode::GroupStateAndLevel as u16,
                vec![0x00, 0x00, 0x00],
            )])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BleAddress;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(StdMutex<Vec<Vec<Frame>>>);

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&self, frames: Vec<Frame>) -> Result<(), DeviceError> {
            self.0.lock().unwrap().push(frames);
            Ok(())
        }
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            address: 0x05,
            rx_address: None,
            ble_address: BleAddress::parse("AA:BB:CC:DD:EE:FF").unwrap(),
            name: "Kitchen".into(),
            room: None,
            traits: PlejdTraits::POWER.union(PlejdTraits::DIM),
            hardware: "DIM-01".into(),
            firmware: None,
            hidden: false,
        }
    }

    #[tokio::test]
    async fn scenario_a_turn_on_dim_128() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let mut light = LightDevice::new(info(), sink.clone());
        light.available = true;
        light.turn_on(Some(128), None).await.unwrap();

        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0][0].encode(),
            vec![0x05, 0x01, 0x10, 0x00, 0x98, 0x01, 0x80, 0x80]
        );
    }

    #[test]
    fn turn_off_clears_state_regardless_of_cached_dim() {
        let sink = Arc::new(RecordingSink(StdMutex::new(Vec::new())));
        let mut light = LightDevice::new(info(), sink);
        light.dim = 200;
        light.apply(&Frame::new(
            0x05,
            CommandType::DontRespond,
            Opcode::GroupStateAndLevel as u16,
            vec![0x00, 0x00, 0x00],
        ));
        match light.project() {
            Projection::Light { state, .. } => assert!(!state),
            _ => panic!("expected light projection"),
        }
    }
}
