// Gateway selection, authentication, keep-alive and write serialisation.
//
//   Idle --connect()--> Selecting --establish--> Authenticating --auth+ping--> Ready
//    ^                       |                         |                          |
//    |                       +---- next-candidate ----+                          |
//    +------------- disconnect()/auth-fail/ping-fail/stack-disconnect -----------+

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::{CommandType, Frame, Opcode};
use crate::crypto::{self, SiteKey};
use crate::gatt::{Characteristic, GattError, GattEvent, PlejdGatt};
use crate::node::BleAddress;

/// Default keep-alive cadence (§4.6 `ping_interval`).
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// A single short timeout applied to each GATT op (§5).
const GATT_TIMEOUT: Duration = Duration::from_secs(5);

/// Drift beyond which `poll_time` reports the device clock as wrong.
const TIME_DRIFT_THRESHOLD_SECS: i64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Selecting,
    Authenticating,
    Ready,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no candidate gateway available")]
    NoCandidateGateway,

    #[error("authentication failed on candidate gateway")]
    AuthFailure,

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] GattError),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoCandidateGateway | Self::AuthFailure | Self::Transport(_)
        )
    }
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, GattError>>,
) -> Result<T, GattError> {
    match tokio::time::timeout(GATT_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(GattError::Timeout),
    }
}

/// The live mesh session: gateway selection, auth, keep-alive and the
/// write-mutex that serialises every multi-frame outbound operation.
pub struct MeshSession {
    gatt: Arc<dyn PlejdGatt>,
    key: SiteKey,
    state: SessionState,
    gateway: Option<BleAddress>,
    write_mutex: Mutex<()>,
    /// Set when a button event was seen since the last keep-alive cycle;
    /// consumed by the next `keep_alive` to decide whether to also send
    /// event-prepare.
    button_seen: bool,
}

impl MeshSession {
    pub fn new(gatt: Arc<dyn PlejdGatt>, key: SiteKey) -> Self {
        Self {
            gatt,
            key,
            state: SessionState::Idle,
            gateway: None,
            write_mutex: Mutex::new(()),
            button_seen: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn gateway(&self) -> Option<BleAddress> {
        self.gateway
    }

    pub fn note_button_seen(&mut self) {
        self.button_seen = true;
    }

    /// Attempt each candidate in RSSI-descending order until one authenticates
    /// and passes a post-auth ping. `candidates` must already be sorted.
    pub async fn connect(&mut self, candidates: &[BleAddress]) -> Result<BleAddress, SessionError> {
        if self.is_connected() {
            return Ok(self.gateway.expect("Ready implies a gateway"));
        }

        self.state = SessionState::Selecting;

        for &candidate in candidates {
            debug!(%candidate, "attempting gateway candidate");
            if let Err(e) = with_timeout(self.gatt.connect(candidate)).await {
                warn!(%candidate, error = %e, "candidate connect failed");
                continue;
            }

            self.state = SessionState::Authenticating;
            match self.authenticate(candidate).await {
                Ok(()) => {
                    self.gateway = Some(candidate);
                    self.state = SessionState::Ready;
                    self.subscribe_notifications().await?;
                    self.poll().await?;
                    debug!(%candidate, "gateway established");
                    return Ok(candidate);
                }
                Err(e) => {
                    warn!(%candidate, error = %e, "candidate authentication failed");
                    let _ = with_timeout(self.gatt.disconnect()).await;
                    self.state = SessionState::Selecting;
                }
            }
        }

        self.state = SessionState::Idle;
        Err(SessionError::NoCandidateGateway)
    }

    async fn authenticate(&mut self, _candidate: BleAddress) -> Result<(), SessionError> {
        with_timeout(self.gatt.write(Characteristic::Auth, &[0u8])).await?;
        let challenge_bytes = with_timeout(self.gatt.read(Characteristic::Auth)).await?;
        let challenge: [u8; 16] = challenge_bytes
            .try_into()
            .map_err(|_| SessionError::AuthFailure)?;

        let response = crypto::auth_response(&self.key, &challenge);
        with_timeout(self.gatt.write(Characteristic::Auth, &response)).await?;

        if !self.ping_once().await? {
            return Err(SessionError::AuthFailure);
        }
        Ok(())
    }

    async fn subscribe_notifications(&self) -> Result<(), SessionError> {
        with_timeout(self.gatt.subscribe(Characteristic::LastData)).await?;
        with_timeout(self.gatt.subscribe(Characteristic::Poll)).await?;
        Ok(())
    }

    /// Write 1 byte to the poll characteristic to request a state batch.
    pub async fn poll(&self) -> Result<(), SessionError> {
        let _guard = self.write_mutex.lock().await;
        with_timeout(self.gatt.write(Characteristic::Poll, &[0x01])).await?;
        Ok(())
    }

    /// One ping/pong round-trip: success iff `(written + 1) & 0xFF == read`.
    async fn ping_once(&self) -> Result<bool, SessionError> {
        let byte: u8 = rand::thread_rng().gen();
        with_timeout(self.gatt.write(Characteristic::Ping, &[byte])).await?;
        let pong = with_timeout(self.gatt.read(Characteristic::Ping)).await?;
        Ok(pong.first().copied() == Some(byte.wrapping_add(1)))
    }

    /// Run one keep-alive cycle: ping, then (on success) a poll, and an
    /// event-prepare if button activity was seen since the last cycle.
    pub async fn keep_alive(&mut self) -> Result<bool, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let ok = {
            let _guard = self.write_mutex.lock().await;
            self.ping_once().await?
        };

        if !ok {
            warn!("keep-alive ping failed, session considered lost");
            self.mark_lost();
            return Ok(false);
        }

        self.poll().await?;

        if std::mem::take(&mut self.button_seen) {
            self.write_frame(&Frame::new(
                crate::codec::ADDR_BROADCAST,
                CommandType::DontRespond,
                Opcode::EventPrepare as u16,
                Vec::new(),
            ))
            .await?;
        }

        Ok(true)
    }

    /// Explicit disconnect: unsubscribe, close, clear session state.
    pub async fn disconnect(&mut self) {
        if self.state != SessionState::Idle {
            let _ = with_timeout(self.gatt.unsubscribe(Characteristic::LastData)).await;
            let _ = with_timeout(self.gatt.unsubscribe(Characteristic::Poll)).await;
            let _ = with_timeout(self.gatt.disconnect()).await;
        }
        self.mark_lost();
    }

    /// Called on keep-alive failure or a stack-initiated disconnect callback:
    /// clear gateway state so the next `connect` reselects.
    pub fn mark_lost(&mut self) {
        self.state = SessionState::Idle;
        self.gateway = None;
        self.button_seen = false;
    }

    /// Encrypt and write one frame under the write mutex.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        self.write_frames(std::slice::from_ref(frame)).await
    }

    /// Encrypt and write a sequence of frames atomically: the mutex is held
    /// for the full sequence so no other high-level operation interleaves.
    pub async fn write_frames(&self, frames: &[Frame]) -> Result<(), SessionError> {
        let gateway = self.gateway.ok_or(SessionError::NotConnected)?;
        let _guard = self.write_mutex.lock().await;
        for frame in frames {
            let encrypted = crypto::encrypt_decrypt(&self.key, gateway.as_bytes(), &frame.encode());
            with_timeout(self.gatt.write(Characteristic::Data, &encrypted)).await?;
        }
        Ok(())
    }

    /// Decrypt a raw notification payload against the current gateway's keystream.
    pub fn decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.gateway
            .map(|gateway| crypto::encrypt_decrypt(&self.key, gateway.as_bytes(), data))
    }

    /// Wait for the next stack event (notification or disconnect callback).
    pub async fn next_event(&self) -> Option<GattEvent> {
        self.gatt.next_event().await
    }

    /// `poll_time(addr)`: read-request the device clock, compare against wall
    /// clock + DST offset; true iff drift exceeds the threshold.
    pub async fn poll_time(
        &self,
        addr: u8,
        now_unix_secs: i64,
        dst_offset_hours: i64,
    ) -> Result<bool, SessionError> {
        self.write_frame(&Frame::new(
            addr,
            CommandType::Read,
            Opcode::Time as u16,
            Vec::new(),
        ))
        .await?;

        let gateway = self.gateway.ok_or(SessionError::NotConnected)?;
        let raw = with_timeout(self.gatt.read(Characteristic::LastData)).await?;
        let decrypted = crypto::encrypt_decrypt(&self.key, gateway.as_bytes(), &raw);

        let frame = Frame::decode(&decrypted).map_err(|_| SessionError::NotConnected)?;
        let ts = timestamp_from_payload(&frame.payload);
        let local = now_unix_secs + dst_offset_hours * 3600;
        Ok((ts - local).abs() > TIME_DRIFT_THRESHOLD_SECS)
    }

    /// `broadcast_time`: seconds-since-epoch, 5-byte little-endian, plus a
    /// trailing DST-hour offset byte (signed), to address 0.
    pub async fn broadcast_time(
        &self,
        now_unix_secs: i64,
        dst_offset_hours: i64,
    ) -> Result<(), SessionError> {
        let mut payload = (now_unix_secs as u64).to_le_bytes()[..5].to_vec();
        payload.push(dst_offset_hours as i8 as u8);
        self.write_frame(&Frame::new(
            crate::codec::ADDR_BROADCAST,
            CommandType::Write,
            Opcode::Time as u16,
            payload,
        ))
        .await
    }
}

fn timestamp_from_payload(payload: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = payload.len().min(5);
    buf[..n].copy_from_slice(&payload[..n]);
    i64::from_le_bytes(buf)
}
