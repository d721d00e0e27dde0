// Roampool Core: BLE roaming pool coordinator
//
// "Is the peer served by the radio that hears it best?"
//
// Several radios share one identity address and hand peripherals between
// each other as they move. Everything here is transport agnostic; radios
// plug in through `transport::Transport`.

pub mod config;
pub mod roaming;
pub mod store;
pub mod transport;

use std::time::Duration;
use thiserror::Error;

pub use config::{ConfigError, RoamingConfig};
pub use roaming::{NetworkCoordinator, RoamEvent, RoamingNetwork, TopologySnapshot};
pub use store::{BondStoreError, BondingStore};
pub use transport::{
    AddressType, EndpointId, EndpointState, PeerAddress, PeerId, Transport, TransportError,
};

use transport::ble::scanner::ScannerError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum RoamError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Command rejected: {0}")]
    CommandRejected(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Bonding conflict with {0}")]
    BondingConflict(PeerId),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Scanner error: {0}")]
    Scanner(#[from] ScannerError),
    #[error("Unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("Coordinator stopped")]
    Stopped,
}

// ============================================================================
// TESTS
// ============================================================================
