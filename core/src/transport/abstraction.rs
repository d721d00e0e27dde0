//! Transport abstraction layer for the roaming pool
//!
//! Defines the identifiers, commands and notifications exchanged with one
//! radio front-end, and the `Transport` capability each radio implements.

use crate::transport::ble::advertisement::{Advertisement, ServiceUuid};
use crate::transport::ble::gatt::AttributeHandle;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Sequence number of a radio endpoint, assigned in configuration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u16);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AP#{}", self.0)
    }
}

/// 48-bit Bluetooth device address, most significant byte first.
///
/// Serialized in its `AA:BB:CC:DD:EE:FF` text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(pub [u8; 6]);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for PeerAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(TransportError::InvalidAddress(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Bluetooth address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressType {
    /// Public device address
    Public,
    /// Static or resolvable random address
    Random,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => write!(f, "public"),
            AddressType::Random => write!(f, "random"),
        }
    }
}

/// Stable identity of a peer device: address plus address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    pub address: PeerAddress,
    pub address_type: AddressType,
}

impl PeerId {
    pub fn new(address: PeerAddress, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
        }
    }

    pub fn public(address: [u8; 6]) -> Self {
        Self::new(PeerAddress(address), AddressType::Public)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.address_type)
    }
}

/// Connection handle allocated by a radio; unique per endpoint only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Opaque bonding key material produced by the radio's security manager.
///
/// The core never interprets these bytes; it only stores and replays them.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct KeyMaterial(#[serde(with = "hex_bytes")] Vec<u8>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// What a scan is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Generic discovery of any advertising peer
    Discovery,
    /// RSSI analysis of one specific peer's advertisements
    Targeted(PeerId),
}

/// Commands from the coordinator to one radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioCommand {
    /// Adopt the pool's shared identity address
    SetIdentityAddress { address: PeerAddress },
    /// Start scanning (idempotent)
    StartScan { mode: ScanMode },
    /// Stop scanning (idempotent)
    StopScan,
    /// Open a connection to a peer
    Connect { peer: PeerId },
    /// Abandon a connect that has not completed yet
    CancelConnect { peer: PeerId },
    /// Close an open connection
    Disconnect { handle: ConnectionHandle },
    /// Request one RSSI measurement on an open connection
    SampleRssi { handle: ConnectionHandle },
    /// Answer a pairing key request; `None` lets pairing run from scratch
    ProvideBondingData {
        handle: ConnectionHandle,
        key: Option<KeyMaterial>,
    },
    /// Restart pairing on a connection after a bonding conflict
    RetryPairing { handle: ConnectionHandle },
    /// Look up a primary service by UUID
    DiscoverService {
        handle: ConnectionHandle,
        service: ServiceUuid,
    },
    /// Look up a characteristic by UUID inside a discovered service
    DiscoverCharacteristic {
        handle: ConnectionHandle,
        service: AttributeHandle,
        characteristic: ServiceUuid,
    },
    /// Turn on value notifications for a characteristic
    EnableNotifications {
        handle: ConnectionHandle,
        characteristic: AttributeHandle,
    },
}

impl fmt::Display for RadioCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioCommand::SetIdentityAddress { address } => {
                write!(f, "SetIdentityAddress {{ address: {} }}", address)
            }
            RadioCommand::StartScan { mode } => write!(f, "StartScan {{ mode: {:?} }}", mode),
            RadioCommand::StopScan => write!(f, "StopScan"),
            RadioCommand::Connect { peer } => write!(f, "Connect {{ peer: {} }}", peer),
            RadioCommand::CancelConnect { peer } => {
                write!(f, "CancelConnect {{ peer: {} }}", peer)
            }
            RadioCommand::Disconnect { handle } => write!(f, "Disconnect {{ {} }}", handle),
            RadioCommand::SampleRssi { handle } => write!(f, "SampleRssi {{ {} }}", handle),
            RadioCommand::ProvideBondingData { handle, key } => write!(
                f,
                "ProvideBondingData {{ {}, bonded: {} }}",
                handle,
                key.is_some()
            ),
            RadioCommand::RetryPairing { handle } => write!(f, "RetryPairing {{ {} }}", handle),
            RadioCommand::DiscoverService { handle, service } => {
                write!(f, "DiscoverService {{ {}, service: {} }}", handle, service)
            }
            RadioCommand::DiscoverCharacteristic {
                handle,
                service,
                characteristic,
            } => write!(
                f,
                "DiscoverCharacteristic {{ {}, service: {}, characteristic: {} }}",
                handle, service, characteristic
            ),
            RadioCommand::EnableNotifications {
                handle,
                characteristic,
            } => write!(f, "EnableNotifications {{ {}, {} }}", handle, characteristic),
        }
    }
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Closed on our request
    LocalRequest,
    /// The peer terminated the link
    RemoteTerminated,
    /// Link supervision timeout (peer walked out of range)
    SupervisionTimeout,
    /// Any other controller reason code
    Other(u16),
}

/// Why bonding failed on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondingFailure {
    /// Stored keys do not match the peer's (peer lost its bond)
    KeyMismatch,
    /// Any other security manager reason code
    Other(u16),
}

/// Notifications from one radio to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioNotification {
    /// An advertisement was received while scanning
    ScanReport {
        peer: PeerId,
        rssi: i8,
        advertisement: Advertisement,
    },
    /// A connect completed
    ConnectionOpened {
        handle: ConnectionHandle,
        peer: PeerId,
    },
    /// A connect failed before a handle was allocated
    ConnectFailed { peer: PeerId, reason: String },
    /// A connection closed
    ConnectionClosed {
        handle: ConnectionHandle,
        reason: CloseReason,
    },
    /// Result of `SampleRssi`
    RssiSample { handle: ConnectionHandle, rssi: i8 },
    /// The security manager needs bonding data for this connection
    PairingKeyRequested { handle: ConnectionHandle },
    /// Pairing finished and produced key material worth keeping
    PairingCompleted {
        handle: ConnectionHandle,
        key: KeyMaterial,
    },
    /// Pairing or encryption failed
    BondingFailed {
        handle: ConnectionHandle,
        failure: BondingFailure,
    },
    /// The radio refused a command (busy or invalid state)
    CommandRejected { command: RadioCommand, reason: String },
    /// The link is encrypted, with a stored or a fresh bond
    LinkSecured { handle: ConnectionHandle },
    /// Result of `DiscoverService`
    ServiceDiscovered {
        handle: ConnectionHandle,
        service: AttributeHandle,
    },
    /// Result of `DiscoverCharacteristic`
    CharacteristicDiscovered {
        handle: ConnectionHandle,
        characteristic: AttributeHandle,
    },
    /// A GATT procedure ended with an error status (nothing found, ATT error)
    GattFailed { handle: ConnectionHandle, reason: String },
    /// A notified characteristic value
    CharacteristicValue {
        handle: ConnectionHandle,
        characteristic: AttributeHandle,
        value: Vec<u8>,
    },
}

impl fmt::Display for RadioNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioNotification::ScanReport { peer, rssi, .. } => {
                write!(f, "ScanReport {{ peer: {}, rssi: {} }}", peer, rssi)
            }
            RadioNotification::ConnectionOpened { handle, peer } => {
                write!(f, "ConnectionOpened {{ {}, peer: {} }}", handle, peer)
            }
            RadioNotification::ConnectFailed { peer, reason } => {
                write!(f, "ConnectFailed {{ peer: {}, reason: {} }}", peer, reason)
            }
            RadioNotification::ConnectionClosed { handle, reason } => {
                write!(f, "ConnectionClosed {{ {}, reason: {:?} }}", handle, reason)
            }
            RadioNotification::RssiSample { handle, rssi } => {
                write!(f, "RssiSample {{ {}, rssi: {} }}", handle, rssi)
            }
            RadioNotification::PairingKeyRequested { handle } => {
                write!(f, "PairingKeyRequested {{ {} }}", handle)
            }
            RadioNotification::PairingCompleted { handle, .. } => {
                write!(f, "PairingCompleted {{ {} }}", handle)
            }
            RadioNotification::BondingFailed { handle, failure } => {
                write!(f, "BondingFailed {{ {}, failure: {:?} }}", handle, failure)
            }
            RadioNotification::CommandRejected { command, reason } => {
                write!(f, "CommandRejected {{ command: {}, reason: {} }}", command, reason)
            }
            RadioNotification::LinkSecured { handle } => write!(f, "LinkSecured {{ {} }}", handle),
            RadioNotification::ServiceDiscovered { handle, service } => {
                write!(f, "ServiceDiscovered {{ {}, {} }}", handle, service)
            }
            RadioNotification::CharacteristicDiscovered {
                handle,
                characteristic,
            } => write!(f, "CharacteristicDiscovered {{ {}, {} }}", handle, characteristic),
            RadioNotification::GattFailed { handle, reason } => {
                write!(f, "GattFailed {{ {}, reason: {} }}", handle, reason)
            }
            RadioNotification::CharacteristicValue {
                handle,
                characteristic,
                value,
            } => write!(
                f,
                "CharacteristicValue {{ {}, {}, value: {} }}",
                handle,
                characteristic,
                hex::encode(value)
            ),
        }
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Transport channel fault: {0}")]
    ChannelFault(String),

    #[error("Command rejected: {0}")]
    CommandRejected(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport not found: {0}")]
    NotFound(String),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),
}

/// Capability implemented once per kind of radio.
///
/// `open` hands back the notification stream; `send` only reports whether
/// the command was accepted, its completion arrives later as a notification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier the transport was configured with (serial port, adapter name...)
    fn transport_id(&self) -> String;

    /// Open the channel and return its notification stream
    async fn open(&mut self) -> Result<mpsc::Receiver<RadioNotification>, TransportError>;

    /// Issue one command
    async fn send(&self, command: RadioCommand) -> Result<(), TransportError>;

    /// Close the channel
    async fn close(&self);
}
