use std::sync::Arc;

use crate::codec::{CommandType, Frame, Opcode};
use crate::device::{DeviceError, DeviceInfo, FrameSink, Projection, Subscribers};

/// Full scale for the 15-bit position fraction carried on the wire.
const POSITION_FULL_SCALE: u16 = 0x7FFF;

pub struct CoverDevice {
    pub info: DeviceInfo,
    pub subs: Subscribers,
    pub available: bool,
    moving: bool,
    position: u8,
    previous_position: Option<u8>,
    angle: Option<i8>,
    sink: Arc<dyn FrameSink>,
}

impl CoverDevice {
    pub fn new(info: DeviceInfo, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            info,
            subs: Subscribers::default(),
            available: false,
            moving: false,
            position: 0,
            previous_position: None,
            angle: None,
            sink,
        }
    }

    pub(crate) fn apply(&mut self, frame: &Frame) {
        match frame.opcode() {
            Some(Opcode::GroupStateAndLevel) | Some(Opcode::OutputStateAndLevel) => {
                if frame.payload.len() < 3 {
                    return;
                }
                self.moving = frame.payload[0] != 0;
                let raw = u16::from_le_bytes([frame.payload[1], frame.payload[2]]);
                let new_position = position_from_raw(raw);

                if self.moving {
                    self.previous_position = Some(self.position);
                }
                self.position = new_position;

                if let Some(&angle_byte) = frame.payload.get(3) {
                    self.angle = Some(decode_angle(angle_byte));
                }
            }
            _ => {}
        }
    }

    /// `opening` is inferred locally: while moving, compare current to the
    /// position recorded when motion started.
    pub(crate) fn project(&self) -> Projection {
        let opening = if self.moving {
            self.previous_position
                .map(|prev| self.position > prev)
        } else {
            None
        };
        Projection::Cover {
            available: self.available,
            moving: self.moving,
            position: self.position,
            angle: self.angle,
            opening,
        }
    }

    pub async fn open(&self) -> Result<(), DeviceError> {
        self.set_position(100).await
    }

    pub async fn close(&self) -> Result<(), DeviceError> {
        self.set_position(0).await
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        if !self.available {
            return Err(DeviceError::Unavailable);
        }
        self.sink
            .send(vec![Frame::new(
                self.info.address,
                CommandType::DontRespond,
                Opcode::GroupState as u16,
                vec![0x00],
            )])
            .await
    }

    pub async fn set_position(&self, percent: u8) -> Result<(), DeviceError> {
        if !self.available {
            return Err(DeviceError::Unavailable);
        }
        let raw = raw_from_position(percent.min(100));
        let bytes = raw.to_le_bytes();
        self.sink
            .send(vec![Frame::new(
                self.info.address,
                CommandType::DontRespond,
                Opcode::GroupStateAndLevel as u16,
                vec![0x01, bytes[0], bytes[1]],
            )])
            .await
    }
}

fn position_from_raw(raw: u16) -> u8 {
    let fraction = (raw & POSITION_FULL_SCALE) as u32;
    ((fraction * 100) / POSITION_FULL_SCALE as u32) as u8
}

fn raw_from_position(percent: u8) -> u16 {
    ((percent as u32 * POSITION_FULL_SCALE as u32) / 100) as u16
}

/// Sign-magnitude 6-bit angle: bit 6 is the sign, bits 0..5 the magnitude.
/// Documented-but-unverified upstream; treated as advisory only.
fn decode_angle(byte: u8) -> i8 {
    let magnitude = (byte & 0x3F) as i8;
    if byte & 0x40 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_round_trips_through_full_scale() {
        for percent in [0u8, 25, 50, 75, 100] {
            let raw = raw_from_position(percent);
            let back = position_from_raw(raw);
            assert!((back as i16 - percent as i16).abs() <= 1);
        }
    }

    #[test]
    fn angle_decodes_sign_magnitude() {
        assert_eq!(decode_angle(0x05), 5);
        assert_eq!(decode_angle(0x45), -5);
    }
}
