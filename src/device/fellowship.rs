use crate::device::{DeviceInfo, Projection, Subscribers};

/// A passive light member of a group, present only so the mesh can route
/// through its node. Never produces output and never accepts a control call.
pub struct FellowshipDevice {
    pub info: DeviceInfo,
    pub subs: Subscribers,
    pub available: bool,
}

impl FellowshipDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            subs: Subscribers::default(),
            available: false,
        }
    }

    pub(crate) fn project(&self) -> Projection {
        Projection::FellowshipFollower {
            available: self.available,
        }
    }
}
