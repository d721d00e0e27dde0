// Store module: bonding key persistence

pub mod backend;
pub mod bonding;

pub use backend::{BondBackend, JsonFileBackend, MemoryBackend};
pub use bonding::{BondRecord, BondStoreError, BondingStore};
