// Storage backends for bonding records

use crate::store::bonding::{BondRecord, BondStoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Current on-disk format version
pub const BOND_FILE_VERSION: u32 = 1;

/// Where bonding records live between sessions.
///
/// Every `persist` replaces the whole record set.
pub trait BondBackend: Send + Sync {
    fn load(&self) -> Result<Vec<BondRecord>, BondStoreError>;
    fn persist(&self, records: &[BondRecord]) -> Result<(), BondStoreError>;
    fn wipe(&self) -> Result<(), BondStoreError>;
    fn describe(&self) -> String;
}

/// In-memory backend; clones share the same records, which lets tests
/// simulate a restart without touching the filesystem.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<Vec<BondRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BondBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<BondRecord>, BondStoreError> {
        Ok(self.records.lock().clone())
    }

    fn persist(&self, records: &[BondRecord]) -> Result<(), BondStoreError> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }

    fn wipe(&self) -> Result<(), BondStoreError> {
        self.records.lock().clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Serialize, Deserialize)]
struct BondFile {
    version: u32,
    records: Vec<BondRecord>,
}

/// JSON file backend with write-new-then-rename replacement.
///
/// A crash mid-write leaves the previous file intact; the lock keeps two
/// writers in one process from racing on the temp file.
pub struct JsonFileBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl BondBackend for JsonFileBackend {
    fn load(&self) -> Result<Vec<BondRecord>, BondStoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: BondFile = serde_json::from_slice(&bytes)?;
        if file.version != BOND_FILE_VERSION {
            return Err(BondStoreError::UnsupportedVersion(file.version));
        }
        Ok(file.records)
    }

    fn persist(&self, records: &[BondRecord]) -> Result<(), BondStoreError> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let body = serde_json::to_vec_pretty(&BondFile {
            version: BOND_FILE_VERSION,
            records: records.to_vec(),
        })?;

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn wipe(&self) -> Result<(), BondStoreError> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
