// Outer mesh frame: encode/decode and the opcode table.
//
// `ADDR(1) VER(1) CMDTYPE(1) OPCODE(2, big-endian) PAYLOAD(n)`. Composite
// 0x0420 payloads are a list of mini-packages (see `minipkg`); poll/lightlevel
// batches are a concatenation of fixed 10-byte records (see `batch`).

pub mod batch;
pub mod minipkg;

pub use batch::{BatchError, BatchRecord};
pub use minipkg::MiniPackage;

use thiserror::Error;

pub const FRAME_VERSION: u8 = 0x01;

/// Pseudo-destination for broadcast frames (time, unrecognised scene updates).
pub const ADDR_BROADCAST: u8 = 0;
/// Pseudo-destination for the time/clock subsystem.
pub const ADDR_TIME: u8 = 1;
/// Pseudo-destination scenes are triggered against.
pub const ADDR_SCENE: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    Write,
    Ack,
    Read,
    DontRespond,
}

impl CommandType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Write),
            0x01 => Some(Self::Ack),
            0x02 => Some(Self::Read),
            0x10 => Some(Self::DontRespond),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Write => 0x00,
            Self::Ack => 0x01,
            Self::Read => 0x02,
            Self::DontRespond => 0x10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    EventPrepare = 0x0015,
    EventFired = 0x0016,
    Time = 0x001B,
    Scene = 0x0021,
    GroupState = 0x0097,
    GroupStateAndLevel = 0x0098,
    OutputStateAndLevel = 0x00C8,
    TunableWhiteSetpoint = 0x0101,
    OutputSet = 0x0420,
    AmbientLightRead = 0x0434,
    ThermostatSetpoint = 0x045C,
    ThermostatMode = 0x045F,
    ThermostatLimits = 0x0460,
    ThermostatResetMode = 0x047E,
}

impl Opcode {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0015 => Self::EventPrepare,
            0x0016 => Self::EventFired,
            0x001B => Self::Time,
            0x0021 => Self::Scene,
            0x0097 => Self::GroupState,
            0x0098 => Self::GroupStateAndLevel,
            0x00C8 => Self::OutputStateAndLevel,
            0x0101 => Self::TunableWhiteSetpoint,
            0x0420 => Self::OutputSet,
            0x0434 => Self::AmbientLightRead,
            0x045C => Self::ThermostatSetpoint,
            0x045F => Self::ThermostatMode,
            0x0460 => Self::ThermostatLimits,
            0x047E => Self::ThermostatResetMode,
            _ => return None,
        })
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("unrecognised command type byte 0x{0:02x}")]
    UnknownCommandType(u8),

    #[error("unrecognised opcode 0x{0:04x}")]
    UnknownOpcode(u16),

    #[error("malformed mini-package: {0}")]
    MalformedMiniPackage(String),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// A decoded (or about-to-be-encoded) outer mesh frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub addr: u8,
    pub cmd_type: CommandType,
    pub opcode_raw: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(addr: u8, cmd_type: CommandType, opcode: u16, payload: Vec<u8>) -> Self {
        Self {
            addr,
            cmd_type,
            opcode_raw: opcode,
            payload,
        }
    }

    /// The recognised opcode, if any; unrecognised opcodes are not fatal to
    /// decode a frame but callers should discard them at dispatch (`UnknownOpcode`).
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode_raw)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        out.push(self.addr);
        out.push(FRAME_VERSION);
        out.push(self.cmd_type.to_byte());
        out.extend_from_slice(&self.opcode_raw.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 5 {
            return Err(CodecError::FrameTooShort(bytes.len()));
        }
        let addr = bytes[0];
        // bytes[1] is the version byte; every observed wire format is 0x01 and
        // decode does not reject other values, matching upstream's leniency.
        let cmd_type = CommandType::from_byte(bytes[2])
            .ok_or(CodecError::UnknownCommandType(bytes[2]))?;
        let opcode_raw = u16::from_be_bytes([bytes[3], bytes[4]]);
        let payload = bytes[5..].to_vec();

        Ok(Self {
            addr,
            cmd_type,
            opcode_raw,
            payload,
        })
    }

    /// Parse the payload as a sequence of mini-packages (0x0420 composite frames).
    pub fn minipkgs(&self) -> Result<Vec<MiniPackage>, CodecError> {
        minipkg::parse_all(&self.payload)
    }

    pub fn with_minipkgs(addr: u8, cmd_type: CommandType, pkgs: &[MiniPackage]) -> Self {
        let mut payload = Vec::new();
        for pkg in pkgs {
            payload.extend_from_slice(&pkg.encode());
        }
        Self::new(addr, cmd_type, Opcode::OutputSet as u16, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_is_inverse_of_encode_round_trip() {
        let frame = Frame::new(
            0x05,
            CommandType::DontRespond,
            Opcode::GroupStateAndLevel as u16,
            vec![0x01, 0x80, 0x80],
        );
        let encoded = frame.encode();
        assert_eq!(encoded, vec![0x05, 0x01, 0x10, 0x00, 0x98, 0x01, 0x80, 0x80]);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn scenario_a_round_trip_dim() {
        // light.turn_on(dim=128) -> 05 01 10 00 98 01 80 80
        let frame = Frame::new(
            0x05,
            CommandType::DontRespond,
            Opcode::GroupStateAndLevel as u16,
            vec![0x01, 0x80, 0x80],
        );
        assert_eq!(
            frame.encode(),
            vec![0x05, 0x01, 0x10, 0x00, 0x98, 0x01, 0x80, 0x80]
        );
    }

    #[test]
    fn unknown_command_type_is_reported_not_panicked() {
        let bytes = [0x05, 0x01, 0xFE, 0x00, 0x98, 0x01];
        assert!(matches!(
            Frame::decode(&bytes),
            Err(CodecError::UnknownCommandType(0xFE))
        ));
    }

    #[test]
    fn frame_too_short_is_reported() {
        assert!(matches!(
            Frame::decode(&[0x05, 0x01]),
            Err(CodecError::FrameTooShort(2))
        ));
    }
}
