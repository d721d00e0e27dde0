//! GATT measurement subscription for served peers
//!
//! Once a link is encrypted the pool looks up the measurement service, then
//! the measurement characteristic inside it, and enables notifications on
//! that characteristic. Each step waits for the radio's answer to the one
//! before, so at most one GATT procedure runs per link.

use crate::transport::abstraction::{ConnectionHandle, EndpointId, RadioCommand};
use crate::transport::ble::advertisement::ServiceUuid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT: ServiceUuid = ServiceUuid::from_u16(0x2A37);

/// Attribute handle on the peer's GATT server; meaningful per connection only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeHandle(pub u16);

impl fmt::Display for AttributeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attr#{:#06x}", self.0)
    }
}

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Measurement value too short: {0} byte(s)")]
    ValueTooShort(usize),
}

/// Which characteristic to subscribe to, and the service that holds it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementProfile {
    pub service: ServiceUuid,
    pub characteristic: ServiceUuid,
}

impl MeasurementProfile {
    /// Heart Rate service and its measurement characteristic
    pub const fn heart_rate() -> Self {
        Self {
            service: ServiceUuid::HEART_RATE,
            characteristic: HEART_RATE_MEASUREMENT,
        }
    }
}

impl Default for MeasurementProfile {
    fn default() -> Self {
        Self::heart_rate()
    }
}

impl fmt::Display for MeasurementProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Decode a Heart Rate Measurement value into beats per minute.
///
/// Bit 0 of the flags byte selects a u8 or a little-endian u16 value.
pub fn parse_heart_rate(value: &[u8]) -> Result<u16, GattError> {
    let Some((&flags, rest)) = value.split_first() else {
        return Err(GattError::ValueTooShort(0));
    };
    let bpm = if flags & 0x01 == 0 {
        rest.first().map(|b| u16::from(*b))
    } else {
        rest.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    };
    bpm.ok_or(GattError::ValueTooShort(value.len()))
}

/// Where one link is in the subscription sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStage {
    /// Looking up the measurement service
    DiscoveringService,
    /// Looking up the characteristic inside `service`
    DiscoveringCharacteristic { service: AttributeHandle },
    /// Notifications requested on `characteristic`
    Subscribed { characteristic: AttributeHandle },
}

/// Subscription progress of every open link
#[derive(Debug, Default)]
pub struct MeasurementTracker {
    profile: Option<MeasurementProfile>,
    links: HashMap<(EndpointId, ConnectionHandle), GattStage>,
}

impl MeasurementTracker {
    /// `None` turns measurement subscription off
    pub fn new(profile: Option<MeasurementProfile>) -> Self {
        Self {
            profile,
            links: HashMap::new(),
        }
    }

    pub fn profile(&self) -> Option<&MeasurementProfile> {
        self.profile.as_ref()
    }

    pub fn stage(&self, endpoint: EndpointId, handle: ConnectionHandle) -> Option<GattStage> {
        self.links.get(&(endpoint, handle)).copied()
    }

    /// The link is encrypted. Returns the service lookup to issue, once per link.
    pub fn link_secured(&mut self, endpoint: EndpointId, handle: ConnectionHandle) -> Option<RadioCommand> {
        let profile = self.profile?;
        if self.links.contains_key(&(endpoint, handle)) {
            return None;
        }
        self.links.insert((endpoint, handle), GattStage::DiscoveringService);
        Some(RadioCommand::DiscoverService {
            handle,
            service: profile.service,
        })
    }

    /// The service was found; returns the characteristic lookup
    pub fn service_discovered(
        &mut self,
        endpoint: EndpointId,
        handle: ConnectionHandle,
        service: AttributeHandle,
    ) -> Option<RadioCommand> {
        let profile = self.profile?;
        let stage = self.links.get_mut(&(endpoint, handle))?;
        if *stage != GattStage::DiscoveringService {
            return None;
        }
        *stage = GattStage::DiscoveringCharacteristic { service };
        Some(RadioCommand::DiscoverCharacteristic {
            handle,
            service,
            characteristic: profile.characteristic,
        })
    }

    /// The characteristic was found; returns the notification request
    pub fn characteristic_discovered(
        &mut self,
        endpoint: EndpointId,
        handle: ConnectionHandle,
        characteristic: AttributeHandle,
    ) -> Option<RadioCommand> {
        let stage = self.links.get_mut(&(endpoint, handle))?;
        if !matches!(stage, GattStage::DiscoveringCharacteristic { .. }) {
            return None;
        }
        *stage = GattStage::Subscribed { characteristic };
        Some(RadioCommand::EnableNotifications {
            handle,
            characteristic,
        })
    }

    /// Whether a value on `characteristic` is the subscribed measurement
    pub fn accepts(&self, endpoint: EndpointId, handle: ConnectionHandle, characteristic: AttributeHandle) -> bool {
        self.stage(endpoint, handle) == Some(GattStage::Subscribed { characteristic })
    }

    /// The link closed or a procedure failed
    pub fn forget(&mut self, endpoint: EndpointId, handle: ConnectionHandle) -> Option<GattStage> {
        self.links.remove(&(endpoint, handle))
    }

    /// Every link of a faulted endpoint is gone
    pub fn forget_endpoint(&mut self, endpoint: EndpointId) {
        self.links.retain(|(ep, _), _| *ep != endpoint);
    }
}
