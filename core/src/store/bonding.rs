// Bonding key store: peer identity to opaque key material
//
// Records are held in memory and the whole set is persisted on every change.
// A persistence failure never propagates: the store warns once and keeps
// working in memory for the rest of the session.

use crate::store::backend::{BondBackend, JsonFileBackend, MemoryBackend};
use crate::transport::abstraction::{AddressType, KeyMaterial, PeerAddress, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BondStoreError {
    #[error("No bond for {0}")]
    NotFound(PeerId),

    #[error("Bond store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bond store format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Unsupported bond file version {0}")]
    UnsupportedVersion(u32),
}

/// One bonded peer as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondRecord {
    pub peer_address: PeerAddress,
    pub address_type: AddressType,
    pub key_material: KeyMaterial,
    /// Unix seconds
    pub last_updated: u64,
}

impl BondRecord {
    pub fn peer(&self) -> PeerId {
        PeerId::new(self.peer_address, self.address_type)
    }
}

pub struct BondingStore {
    records: HashMap<PeerId, BondRecord>,
    backend: Arc<dyn BondBackend>,
    degraded: bool,
}

impl BondingStore {
    /// Load existing records from `backend`.
    pub fn open(backend: Arc<dyn BondBackend>) -> Result<Self, BondStoreError> {
        let records = backend
            .load()?
            .into_iter()
            .map(|record| (record.peer(), record))
            .collect::<HashMap<_, _>>();
        info!("Loaded {} bond(s) from {}", records.len(), backend.describe());
        Ok(Self {
            records,
            backend,
            degraded: false,
        })
    }

    /// Like `open`, but an unreadable backend yields an empty memory-only
    /// store. The unreadable file is left untouched.
    pub fn open_or_degraded(backend: Arc<dyn BondBackend>) -> Self {
        match Self::open(backend.clone()) {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    "Bond store {} unreadable ({}); bonding is memory-only this session",
                    backend.describe(),
                    e
                );
                Self {
                    records: HashMap::new(),
                    backend,
                    degraded: true,
                }
            }
        }
    }

    /// File-backed store at `path`
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self, BondStoreError> {
        Self::open(Arc::new(JsonFileBackend::new(path)))
    }

    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            records: HashMap::new(),
            backend: Arc::new(MemoryBackend::new()),
            degraded: false,
        }
    }

    pub fn lookup(&self, peer: &PeerId) -> Result<&KeyMaterial, BondStoreError> {
        self.records
            .get(peer)
            .map(|record| &record.key_material)
            .ok_or(BondStoreError::NotFound(*peer))
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.records.contains_key(peer)
    }

    /// Insert or replace the bond for `peer`
    pub fn store(&mut self, peer: PeerId, key: KeyMaterial) {
        let record = BondRecord {
            peer_address: peer.address,
            address_type: peer.address_type,
            key_material: key,
            last_updated: current_timestamp(),
        };
        let replaced = self.records.insert(peer, record).is_some();
        debug!(peer = %peer, replaced, "bond stored");
        self.persist();
    }

    /// Remove one bond. Returns whether it existed.
    pub fn delete(&mut self, peer: &PeerId) -> bool {
        if self.records.remove(peer).is_none() {
            return false;
        }
        debug!(peer = %peer, "bond deleted");
        self.persist();
        true
    }

    /// Remove every bond and the backing file
    pub fn delete_all(&mut self) {
        let count = self.records.len();
        self.records.clear();
        info!("Deleting all {} bond(s)", count);
        if self.degraded {
            return;
        }
        if let Err(e) = self.backend.wipe() {
            self.degrade(&e);
        }
    }

    /// Records sorted by peer identity
    pub fn records(&self) -> Vec<BondRecord> {
        let mut records: Vec<BondRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.peer());
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True once persistence has failed; changes are then kept in memory only
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn persist(&mut self) {
        if self.degraded {
            return;
        }
        if let Err(e) = self.backend.persist(&self.records()) {
            self.degrade(&e);
        }
    }

    fn degrade(&mut self, error: &BondStoreError) {
        warn!(
            "Bond store {} write failed ({}); continuing with memory-only bonding",
            self.backend.describe(),
            error
        );
        self.degraded = true;
    }
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn peer(n: u8) -> PeerId {
        PeerId::public([0xE0, 0, 0, 0, 0, n])
    }

    fn key(n: u8) -> KeyMaterial {
        KeyMaterial::new(vec![n; 16])
    }

    #[test]
    fn test_lookup_missing_is_not_found() {
        let store = BondingStore::in_memory();
        assert!(matches!(
            store.lookup(&peer(1)),
            Err(BondStoreError::NotFound(p)) if p == peer(1)
        ));
    }

    #[test]
    fn test_store_upserts() {
        let mut store = BondingStore::in_memory();
        store.store(peer(1), key(1));
        store.store(peer(1), key(2));
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(&peer(1)).expect("bond"), &key(2));
    }

    #[test]
    fn test_restart_restores_bonds() {
        let backend = MemoryBackend::new();
        let mut store = BondingStore::open(Arc::new(backend.clone())).expect("open");
        store.store(peer(1), key(1));
        drop(store);

        let store = BondingStore::open(Arc::new(backend)).expect("reopen");
        assert_eq!(store.lookup(&peer(1)).expect("bond"), &key(1));
    }

    #[test]
    fn test_delete_single() {
        let mut store = BondingStore::in_memory();
        store.store(peer(1), key(1));
        store.store(peer(2), key(2));
        assert!(store.delete(&peer(1)));
        assert!(!store.delete(&peer(1)));
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn test_write_failure_degrades_to_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = dir.path().join("state");
        let mut store = BondingStore::open_file(parent.join("bonds.json")).expect("open");
        assert!(!store.is_degraded());

        // The parent directory can no longer be created
        fs::write(&parent, b"not a directory").expect("write");
        store.store(peer(1), key(1));

        assert!(store.is_degraded());
        assert_eq!(store.lookup(&peer(1)).expect("bond"), &key(1));
        store.store(peer(2), key(2));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_corrupt_file_opens_degraded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bonds.json");
        fs::write(&path, b"{ not json").expect("write");

        assert!(BondingStore::open_file(&path).is_err());

        let mut store = BondingStore::open_or_degraded(Arc::new(JsonFileBackend::new(&path)));
        assert!(store.is_degraded());
        store.store(peer(1), key(1));
        assert_eq!(fs::read(&path).expect("read"), b"{ not json");
    }
}
