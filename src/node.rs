// MeshNode bookkeeping: visible BLE peers, RSSI peak-tracking, blacklist.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("ble address must be 6 bytes (12 hex digits), got {0}")]
    InvalidLength(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A canonical, colon-free, upper-case 48-bit BLE hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BleAddress([u8; 6]);

impl BleAddress {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let stripped: String = text.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&stripped)?;
        if bytes.len() != 6 {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 6];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl fmt::Debug for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BleAddress({self})")
    }
}

/// A physical, visible BLE peer. At most one node has `is_gateway == true`.
#[derive(Clone, Debug)]
pub struct MeshNode {
    ble_address: BleAddress,
    /// Participates in the mesh radio at all. Some hardware (sensors-only,
    /// low-power peripherals) is visible but never connectable.
    connectable: bool,
    blacklisted: bool,
    /// Last observed RSSI; tracks the *maximum* seen since the last connect
    /// attempt, not the instantaneous value.
    rssi: Option<i16>,
    is_gateway: bool,
}

impl MeshNode {
    pub fn new(ble_address: BleAddress, connectable: bool) -> Self {
        Self {
            ble_address,
            connectable,
            blacklisted: false,
            rssi: None,
            is_gateway: false,
        }
    }

    pub fn ble_address(&self) -> BleAddress {
        self.ble_address
    }

    /// Connectable right now: the hardware participates in the radio and is
    /// not blacklisted by the caller.
    pub fn is_connectable(&self) -> bool {
        self.connectable && !self.blacklisted
    }

    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    pub fn is_gateway(&self) -> bool {
        self.is_gateway
    }

    pub fn set_gateway(&mut self, is_gateway: bool) {
        self.is_gateway = is_gateway;
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted
    }

    pub fn set_blacklisted(&mut self, blacklisted: bool) {
        self.blacklisted = blacklisted;
    }

    /// Record a scan observation; RSSI only ever climbs toward the peak until
    /// the node is reset for a new connect attempt.
    fn see(&mut self, rssi: i16) {
        self.rssi = Some(self.rssi.map_or(rssi, |prev| prev.max(rssi)));
    }

    /// Reset the RSSI peak ahead of a fresh connect attempt.
    pub fn reset_rssi_peak(&mut self) {
        self.rssi = None;
    }
}

/// The roster of all MeshNodes the manager knows about, keyed by BLE address.
#[derive(Default)]
pub struct NodeTable {
    nodes: HashMap<BleAddress, MeshNode>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an expected node from the roster (connectable flag set at load time).
    pub fn expect(&mut self, ble_address: BleAddress, connectable: bool) {
        self.nodes
            .entry(ble_address)
            .or_insert_with(|| MeshNode::new(ble_address, connectable));
    }

    /// Record a scan callback observation. Returns true the first time this
    /// peer is seen.
    pub fn see(&mut self, ble_address: BleAddress, rssi: i16) -> bool {
        match self.nodes.get_mut(&ble_address) {
            Some(node) => {
                node.see(rssi);
                false
            }
            None => {
                let mut node = MeshNode::new(ble_address, true);
                node.see(rssi);
                self.nodes.insert(ble_address, node);
                true
            }
        }
    }

    pub fn get(&self, ble_address: BleAddress) -> Option<&MeshNode> {
        self.nodes.get(&ble_address)
    }

    pub fn get_mut(&mut self, ble_address: BleAddress) -> Option<&mut MeshNode> {
        self.nodes.get_mut(&ble_address)
    }

    /// Candidates for gateway selection: connectable, non-blacklisted, with a
    /// known RSSI, sorted strongest-first.
    pub fn gateway_candidates(&self) -> Vec<BleAddress> {
        let mut candidates: Vec<(BleAddress, i16)> = self
            .nodes
            .values()
            .filter(|n| n.is_connectable() && n.rssi.is_some())
            .map(|n| (n.ble_address, n.rssi.unwrap()))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.into_iter().map(|(addr, _)| addr).collect()
    }

    pub fn current_gateway(&self) -> Option<BleAddress> {
        self.nodes
            .values()
            .find(|n| n.is_gateway())
            .map(|n| n.ble_address())
    }

    pub fn clear_gateway(&mut self) {
        for node in self.nodes.values_mut() {
            node.set_gateway(false);
        }
    }

    pub fn set_blacklist(&mut self, blacklisted: impl IntoIterator<Item = BleAddress>) {
        let set: std::collections::HashSet<BleAddress> = blacklisted.into_iter().collect();
        for node in self.nodes.values_mut() {
            node.set_blacklisted(set.contains(&node.ble_address));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_tracks_peak_not_instantaneous() {
        let mut table = NodeTable::new();
        let addr = BleAddress::parse("AA:BB:CC:DD:EE:FF").unwrap();
        table.expect(addr, true);
        table.see(addr, -80);
        table.see(addr, -60);
        table.see(addr, -90);
        assert_eq!(table.get(addr).unwrap().rssi(), Some(-60));
    }

    #[test]
    fn scenario_f_gateway_candidate_order() {
        let mut table = NodeTable::new();
        let a = BleAddress::parse("AA:AA:AA:AA:AA:01").unwrap();
        let b = BleAddress::parse("AA:AA:AA:AA:AA:02").unwrap();
        let c = BleAddress::parse("AA:AA:AA:AA:AA:03").unwrap();
        for (addr, rssi) in [(a, -60), (b, -80), (c, -55)] {
            table.expect(addr, true);
            table.see(addr, rssi);
        }
        assert_eq!(table.gateway_candidates(), vec![c, a, b]);
    }

    #[test]
    fn blacklisted_node_is_not_a_candidate() {
        let mut table = NodeTable::new();
        let addr = BleAddress::parse("AA:BB:CC:DD:EE:FF").unwrap();
        table.expect(addr, true);
        table.see(addr, -50);
        table.set_blacklist([addr]);
        assert!(table.gateway_candidates().is_empty());
    }
}
