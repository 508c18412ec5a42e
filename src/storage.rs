// Optional persistence: a snapshot of the last-known roster document, kept
// only so a caller can start offline when the cloud fetch fails (§6
// "Persisted state"). Nothing else in the core survives between runs.

use std::path::Path;

use thiserror::Error;

use crate::roster::RosterDocument;

mod keys {
    pub const ROSTER_SNAPSHOT_PREFIX: &[u8] = b"roster:snapshot:";
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    OpenFailed(String),

    #[error("database operation failed: {0}")]
    DatabaseError(String),

    #[error("failed to serialize roster snapshot: {0}")]
    SerializationFailed(String),

    #[error("failed to deserialize roster snapshot: {0}")]
    DeserializationFailed(String),

    #[error("flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Persistent key-value store backing the offline roster snapshot. Crash-safe,
/// embedded; every write here is a full-document replace, not incremental.
pub struct MeshStore {
    db: sled::Db,
}

impl MeshStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    fn snapshot_key(site_id: &str) -> Vec<u8> {
        [keys::ROSTER_SNAPSHOT_PREFIX, site_id.as_bytes()].concat()
    }

    /// Replace the stored snapshot for `site_id` with the roster document
    /// just fetched live. Called from `Manager::init` on a successful fetch.
    pub fn save_roster_snapshot(&self, site_id: &str, document: &RosterDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(document)
            .map_err(|e| StoreError::SerializationFailed(e.to_string()))?;
        self.db
            .insert(Self::snapshot_key(site_id), bytes)
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Load the last snapshot for `site_id`, if one was ever saved. `Manager::init`
    /// falls back to this when the live cloud fetch fails.
    pub fn load_roster_snapshot(&self, site_id: &str) -> Result<Option<RosterDocument>, StoreError> {
        match self.db.get(Self::snapshot_key(site_id))? {
            Some(bytes) => {
                let document = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_document() -> RosterDocument {
        serde_json::from_value(serde_json::json!({
            "site": {"siteId": "site-1", "title": "Home"},
            "plejdMesh": {"cryptoKey": "00112233445566778899aabbccddeeff"},
            "rooms": [],
            "scenes": [],
            "devices": [],
            "plejdDevices": [],
            "inputSettings": [],
            "outputSettings": [],
            "motionSensors": [],
            "deviceAddress": {},
            "rxAddress": {},
            "sceneIndex": {}
        }))
        .unwrap()
    }

    #[test]
    fn roster_snapshot_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = MeshStore::open(dir.path()).unwrap();
        let document = sample_document();

        assert!(store.load_roster_snapshot("site-1").unwrap().is_none());
        store.save_roster_snapshot("site-1", &document).unwrap();

        let loaded = store.load_roster_snapshot("site-1").unwrap().unwrap();
        assert_eq!(loaded.site.site_id, document.site.site_id);
    }

    #[test]
    fn snapshot_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = MeshStore::open(dir.path()).unwrap();
            store.save_roster_snapshot("site-1", &sample_document()).unwrap();
            store.flush().unwrap();
        }
        {
            let store = MeshStore::open(dir.path()).unwrap();
            assert!(store.load_roster_snapshot("site-1").unwrap().is_some());
        }
    }
}
