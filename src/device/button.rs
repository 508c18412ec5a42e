use std::sync::Mutex as StdMutex;

use crate::codec::{Frame, Opcode};
use crate::device::{ButtonAction, DeviceInfo, Projection, Subscribers};

pub struct ButtonDevice {
    pub info: DeviceInfo,
    /// Which physical button within the input this device represents; frame
    /// matching requires both `info.address` (the input address) and this.
    pub button: u8,
    pub subs: Subscribers,
    pub available: bool,
    /// Transient: set by `apply`, consumed (and cleared) by the next `project`.
    action: StdMutex<Option<ButtonAction>>,
}

impl ButtonDevice {
    pub fn new(info: DeviceInfo, button: u8) -> Self {
        Self {
            info,
            button,
            subs: Subscribers::default(),
            available: false,
            action: StdMutex::new(None),
        }
    }

    /// `0x0016` carries `addr(1) btn(1) [action(1)]` in the payload itself;
    /// the outer frame address is broadcast, so matching is payload-driven.
    pub(crate) fn matches(&self, frame: &Frame) -> bool {
        frame.opcode() == Some(Opcode::EventFired)
            && frame.payload.len() >= 2
            && frame.payload[0] == self.info.address
            && frame.payload[1] == self.button
    }

    pub(crate) fn apply(&mut self, frame: &Frame) {
        if frame.opcode() != Some(Opcode::EventFired) {
            return;
        }
        let action = match frame.payload.get(2) {
            Some(0) => ButtonAction::Release,
            Some(_) => ButtonAction::Press,
            None => ButtonAction::Press,
        };
        *self.action.lock().unwrap() = Some(action);
    }

    pub(crate) fn project(&self) -> Projection {
        let action = self.action.lock().unwrap().take();
        Projection::Button {
            available: self.available,
            button: self.button,
            action,
        }
    }
}
