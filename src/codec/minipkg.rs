// Mini-package TLV encoding used inside composite 0x0420 payloads.
//
// byte0: F SSS TTTT  (F=flag, SSS=length-1 of payload, TTTT=type low nybble;
// if TTTT==0xF the type is extended into the following byte as `0xF + b1`).

use super::CodecError;

pub const TYPE_WHITE_BALANCE: u16 = 0x01;
pub const TYPE_SOURCE: u16 = 0x03;
pub const TYPE_LUX: u16 = 0x06;
pub const TYPE_WINDOW_CONTROL: u16 = 0x07;
pub const TYPE_CHANNEL: u16 = 0x10;
pub const TYPE_BATTERY_INFO: u16 = 0x16;
pub const TYPE_TILT: u16 = 0x18;
pub const TYPE_WINDOW_POSITION: u16 = 0x27;

pub const SOURCE_MANUAL: u8 = 0x01;
pub const SOURCE_MOTION: u8 = 0x03;
pub const SOURCE_APP: u8 = 0x08;

/// A single typed, length-prefixed element inside a composite payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiniPackage {
    pub flag: bool,
    pub kind: u16,
    pub payload: Vec<u8>,
}

impl MiniPackage {
    pub fn new(kind: u16, payload: Vec<u8>) -> Self {
        Self {
            flag: false,
            kind,
            payload,
        }
    }

    pub fn with_flag(kind: u16, payload: Vec<u8>, flag: bool) -> Self {
        Self { flag, kind, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len().max(1);
        let mut header = if self.flag { 0x80u8 } else { 0 };
        header |= (((len - 1) as u8) & 0x7) << 4;

        let mut out = Vec::with_capacity(2 + self.payload.len());
        if self.kind > 0xF {
            out.push(header | 0x0F);
            out.push((self.kind - 0xF) as u8);
        } else {
            out.push(header | (self.kind as u8 & 0x0F));
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one mini-package from the start of `bytes`, returning it along
    /// with the number of bytes consumed so the caller can advance an offset.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), CodecError> {
        let b0 = *bytes
            .first()
            .ok_or_else(|| CodecError::MalformedMiniPackage("empty input".into()))?;

        let flag = b0 & 0x80 != 0;
        let length = ((b0 & 0x70) >> 4) as usize + 1;
        let mut kind = (b0 & 0x0F) as u16;
        let mut start = 1;

        if kind == 0x0F {
            let ext = *bytes
                .get(1)
                .ok_or_else(|| CodecError::MalformedMiniPackage("truncated extended type".into()))?;
            kind += ext as u16;
            start = 2;
        }

        if bytes.len() < start + length {
            return Err(CodecError::MalformedMiniPackage(format!(
                "need {} bytes, have {}",
                start + length,
                bytes.len()
            )));
        }

        let payload = bytes[start..start + length].to_vec();
        Ok((Self { flag, kind, payload }, start + length))
    }
}

/// Decode the full sequence of mini-packages packed into a 0x0420 payload.
pub fn parse_all(payload: &[u8]) -> Result<Vec<MiniPackage>, CodecError> {
    let mut offset = 0;
    let mut out = Vec::new();
    while offset < payload.len() {
        let (pkg, consumed) = MiniPackage::decode(&payload[offset..])?;
        offset += consumed;
        out.push(pkg);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_short_type() {
        let pkg = MiniPackage::new(TYPE_SOURCE, vec![SOURCE_MOTION]);
        let encoded = pkg.encode();
        let (decoded, consumed) = MiniPackage::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, pkg);
    }

    #[test]
    fn round_trips_extended_type() {
        let pkg = MiniPackage::new(TYPE_BATTERY_INFO, vec![0x00, 0x9C]);
        let encoded = pkg.encode();
        assert_eq!(encoded.len(), 4); // 2 header bytes + 2 payload bytes
        let (decoded, consumed) = MiniPackage::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, pkg);
    }

    #[test]
    fn parses_real_motion_event_sequence() {
        // 03 03 | 1f 07 00 9c | 0f 08 46 | 06 01
        let bytes = [0x03u8, 0x03, 0x1f, 0x07, 0x00, 0x9c, 0x0f, 0x08, 0x46, 0x06, 0x01];
        let pkgs = parse_all(&bytes).unwrap();
        assert_eq!(pkgs.len(), 4);
        assert_eq!(pkgs[0].kind, TYPE_SOURCE);
        assert_eq!(pkgs[0].payload, vec![0x03]);
        assert_eq!(pkgs[1].kind, TYPE_BATTERY_INFO);
        assert_eq!(pkgs[1].payload, vec![0x00, 0x9c]);
        assert_eq!(pkgs[2].kind, 0x17); // sender-device-type, not a type the codec names
        assert_eq!(pkgs[2].payload, vec![0x46]);
        assert_eq!(pkgs[3].kind, TYPE_LUX);
        assert_eq!(pkgs[3].payload, vec![0x01]);
    }

    #[test]
    fn round_trips_lengths_one_through_eight() {
        for len in 1..=8usize {
            let payload: Vec<u8> = (0..len as u8).collect();
            let pkg = MiniPackage::new(TYPE_WINDOW_POSITION, payload);
            let encoded = pkg.encode();
            let (decoded, consumed) = MiniPackage::decode(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, pkg);
        }
    }

    #[test]
    fn truncated_extended_type_is_reported() {
        assert!(MiniPackage::decode(&[0x0F]).is_err());
    }
}
