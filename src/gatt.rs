// The BLE capability the mesh session depends on: connect, GATT read/write,
// subscribe/notify, disconnect. Scanning is the caller's responsibility (fed
// in via `Manager::add_mesh_device`); this module only models the
// once-connected capability surface.

use async_trait::async_trait;
use thiserror::Error;

use crate::node::BleAddress;

pub const PLEJD_SERVICE_UUID: &str = "31ba0001-6085-4726-be45-040c957391b5";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// `31ba0003-...` — write 0x01 to request; notify batches.
    Poll,
    /// `31ba0004-...` — write encrypted frames; no notify.
    Data,
    /// `31ba0005-...` — notify decrypted-by-keystream frames; readable for time response.
    LastData,
    /// `31ba0009-...` — write/read for challenge/response.
    Auth,
    /// `31ba000a-...` — write 1 byte, read 1 byte.
    Ping,
}

impl Characteristic {
    pub fn uuid(self) -> &'static str {
        match self {
            Self::Poll => "31ba0003-6085-4726-be45-040c957391b5",
            Self::Data => "31ba0004-6085-4726-be45-040c957391b5",
            Self::LastData => "31ba0005-6085-4726-be45-040c957391b5",
            Self::Auth => "31ba0009-6085-4726-be45-040c957391b5",
            Self::Ping => "31ba000a-6085-4726-be45-040c957391b5",
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum GattError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("gatt operation timed out")]
    Timeout,

    #[error("gatt read/write failed: {0}")]
    IoFailed(String),

    #[error("not connected")]
    NotConnected,
}

impl GattError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectFailed(_) | Self::NotConnected)
    }
}

/// One event delivered out of band by the stack: a notification on a
/// subscribed characteristic, or the stack-initiated disconnect callback.
#[derive(Clone, Debug)]
pub enum GattEvent {
    Notification { characteristic: Characteristic, data: Vec<u8> },
    Disconnected { reason: String },
}

/// The capability surface a concrete BLE stack must provide. Held by the
/// session as `Box<dyn PlejdGatt + Send + Sync>`.
#[async_trait]
pub trait PlejdGatt: Send + Sync {
    async fn connect(&self, node: BleAddress) -> Result<(), GattError>;
    async fn disconnect(&self) -> Result<(), GattError>;
    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), GattError>;
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, GattError>;
    async fn subscribe(&self, characteristic: Characteristic) -> Result<(), GattError>;
    async fn unsubscribe(&self, characteristic: Characteristic) -> Result<(), GattError>;

    /// Wait for the next notification or disconnect callback. Cooperative:
    /// there is one event loop, so this is awaited rather than delivered via
    /// a separate callback thread.
    async fn next_event(&self) -> Option<GattEvent>;
}

// ============================================================================
// FAKE GATT STACK
// ============================================================================

/// A scripted `PlejdGatt` for tests: always hands back a fixed auth
/// challenge, echoes the keep-alive ping unless told to fail, and lets the
/// test push notifications/disconnects onto the event queue it will later
/// hand out through `next_event`.
pub struct FakeGatt {
    inner: std::sync::Mutex<FakeGattState>,
    notify: tokio::sync::Notify,
}

struct FakeGattState {
    challenge: [u8; 16],
    last_ping_byte: u8,
    ping_fails: bool,
    unreachable: std::collections::HashSet<BleAddress>,
    connected: bool,
    connect_attempts: Vec<BleAddress>,
    writes: Vec<(Characteristic, Vec<u8>)>,
    events: std::collections::VecDeque<GattEvent>,
    closed: bool,
}

impl FakeGatt {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(FakeGattState {
                challenge: [0u8; 16],
                last_ping_byte: 0,
                ping_fails: false,
                unreachable: std::collections::HashSet::new(),
                connected: false,
                connect_attempts: Vec::new(),
                writes: Vec::new(),
                events: std::collections::VecDeque::new(),
                closed: false,
            }),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Fix the 16-byte challenge `connect` will read back on the auth characteristic.
    pub fn with_challenge(self, challenge: [u8; 16]) -> Self {
        self.inner.lock().unwrap().challenge = challenge;
        self
    }

    /// Make every keep-alive ping on this stack fail from here on.
    pub fn set_ping_fails(&self, fails: bool) {
        self.inner.lock().unwrap().ping_fails = fails;
    }

    /// Make `connect` fail for this specific candidate (so gateway selection
    /// moves on to the next one), as in scenario F.
    pub fn fail_connect_for(&self, node: BleAddress) {
        self.inner.lock().unwrap().unreachable.insert(node);
    }

    /// Queue a notification the next `next_event` call will hand out.
    pub fn push_notification(&self, characteristic: Characteristic, data: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .events
            .push_back(GattEvent::Notification { characteristic, data });
        self.notify.notify_one();
    }

    pub fn push_disconnect(&self, reason: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .events
            .push_back(GattEvent::Disconnected { reason: reason.into() });
        self.notify.notify_one();
    }

    /// Unblock a pending `next_event` call with `None`, as if the stack shut down.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    /// Every write recorded so far, in order.
    pub fn writes(&self) -> Vec<(Characteristic, Vec<u8>)> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// Every node `connect` was asked to try, in order, including ones that failed.
    pub fn connect_attempts(&self) -> Vec<BleAddress> {
        self.inner.lock().unwrap().connect_attempts.clone()
    }
}

impl Default for FakeGatt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlejdGatt for FakeGatt {
    async fn connect(&self, node: BleAddress) -> Result<(), GattError> {
        let mut state = self.inner.lock().unwrap();
        state.connect_attempts.push(node);
        if state.unreachable.contains(&node) {
            return Err(GattError::ConnectFailed(format!("{node} unreachable")));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GattError> {
        self.inner.lock().unwrap().connected = false;
        Ok(())
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), GattError> {
        let mut state = self.inner.lock().unwrap();
        if characteristic == Characteristic::Ping {
            if let Some(&byte) = data.first() {
                state.last_ping_byte = byte;
            }
        }
        state.writes.push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, GattError> {
        let state = self.inner.lock().unwrap();
        match characteristic {
            Characteristic::Auth => Ok(state.challenge.to_vec()),
            Characteristic::Ping => {
                if state.ping_fails {
                    Ok(vec![state.last_ping_byte])
                } else {
                    Ok(vec![state.last_ping_byte.wrapping_add(1)])
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn subscribe(&self, _characteristic: Characteristic) -> Result<(), GattError> {
        Ok(())
    }

    async fn unsubscribe(&self, _characteristic: Characteristic) -> Result<(), GattError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<GattEvent> {
        loop {
            {
                let mut state = self.inner.lock().unwrap();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}
