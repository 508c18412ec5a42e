// Frame keystream and challenge/response authentication.
//
// Both primitives are keyed by the site key; the keystream additionally
// depends on the current gateway's BLE address, so traffic captured from one
// node does not yield a reusable stream for the rest of the mesh.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A 128-bit site key shared by every node in a Plejd installation.
#[derive(Clone)]
pub struct SiteKey([u8; 16]);

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("site key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("ble address must be 6 bytes, got {0}")]
    InvalidAddressLength(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl SiteKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 16 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str.replace('-', ""))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Derive the per-gateway keystream block: AES-ECB(K, A ∥ A ∥ A[0..4]) where A
/// is the gateway's 6-byte BLE address in little-endian (reversed) order.
fn keystream_block(key: &SiteKey, gateway_addr_le: &[u8; 6]) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..6].copy_from_slice(gateway_addr_le);
    buf[6..12].copy_from_slice(gateway_addr_le);
    buf[12..16].copy_from_slice(&gateway_addr_le[0..4]);

    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(&buf);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// Reverse a canonical (big-endian, on-air order) 6-byte BLE address into the
/// little-endian form the keystream derivation expects.
fn reverse_address(addr: &[u8; 6]) -> [u8; 6] {
    let mut out = *addr;
    out.reverse();
    out
}

/// XOR `data` in place against the keystream for `gateway_addr` (canonical,
/// big-endian order). Its own inverse: the same call both encrypts outbound
/// frames and decrypts inbound notifications.
pub fn encrypt_decrypt(key: &SiteKey, gateway_addr: &[u8; 6], data: &[u8]) -> Vec<u8> {
    let stream = keystream_block(key, &reverse_address(gateway_addr));
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ stream[i % 16])
        .collect()
}

/// Compute the 16-byte response to a 16-byte authentication challenge:
/// `H = SHA256((K XOR C) as big-endian 16 bytes)`, response = `H[0..16] XOR H[16..32]`.
pub fn auth_response(key: &SiteKey, challenge: &[u8; 16]) -> [u8; 16] {
    let mut xored = [0u8; 16];
    for i in 0..16 {
        xored[i] = key.as_bytes()[i] ^ challenge[i];
    }

    let digest = Sha256::digest(xored);
    let mut response = [0u8; 16];
    for i in 0..16 {
        response[i] = digest[i] ^ digest[16 + i];
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystream_is_involution() {
        let key = SiteKey::from_bytes(&(0u8..16).collect::<Vec<_>>()).unwrap();
        let addr: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let plain = b"\x05\x01\x10\x00\x98\x01\x80\x80".to_vec();

        let encrypted = encrypt_decrypt(&key, &addr, &plain);
        let decrypted = encrypt_decrypt(&key, &addr, &encrypted);
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn challenge_response_matches_scenario_b() {
        let key = SiteKey::from_bytes(&[0u8; 16]).unwrap();
        let challenge = [0xFFu8; 16];

        let digest = Sha256::digest([0xFFu8; 16]);
        let mut expected = [0u8; 16];
        for i in 0..16 {
            expected[i] = digest[i] ^ digest[16 + i];
        }

        assert_eq!(auth_response(&key, &challenge), expected);
    }

    #[test]
    fn rejects_wrong_length_key() {
        assert!(matches!(
            SiteKey::from_bytes(&[0u8; 15]),
            Err(CryptoError::InvalidKeyLength(15))
        ));
    }
}
