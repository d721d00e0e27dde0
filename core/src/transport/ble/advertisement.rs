//! Advertisement parsing and service filtering
//!
//! Radios hand over either the raw AD structures of an advertisement, the
//! service UUIDs their host stack already parsed out of it, or both. Discovery
//! only considers peers whose advertisement lists the configured service.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Incomplete list of 16-bit service class UUIDs
const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
/// Complete list of 16-bit service class UUIDs
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
/// Incomplete list of 128-bit service class UUIDs
const AD_TYPE_UUID128_INCOMPLETE: u8 = 0x06;
/// Complete list of 128-bit service class UUIDs
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;

/// Bluetooth base UUID, 0000xxxx-0000-1000-8000-00805F9B34FB
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Errors for advertisement operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementError {
    #[error("Invalid service UUID: {0}")]
    InvalidServiceUuid(String),
}

/// A GATT service UUID, 16-bit aliases expanded onto the Bluetooth base UUID.
///
/// Serialized in its display form (`180d` or a full UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceUuid(pub Uuid);

impl ServiceUuid {
    /// Heart Rate service, the service the reference peripherals advertise
    pub const HEART_RATE: ServiceUuid = ServiceUuid(Uuid::from_u128(
        BLUETOOTH_BASE_UUID | ((0x180D_u128) << 96),
    ));

    /// Expand a 16-bit assigned number
    pub const fn from_u16(short: u16) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
    }

    /// The 16-bit alias if this UUID lives on the Bluetooth base
    pub fn as_u16(&self) -> Option<u16> {
        let value = self.0.as_u128();
        let short = (value >> 96) as u16;
        if value == BLUETOOTH_BASE_UUID | ((short as u128) << 96) {
            Some(short)
        } else {
            None
        }
    }
}

impl fmt::Display for ServiceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(short) => write!(f, "{:04x}", short),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for ServiceUuid {
    type Err = AdvertisementError;

    /// Accepts `180d`, `0x180D` or a full hyphenated UUID
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() == 4 {
            return u16::from_str_radix(digits, 16)
                .map(Self::from_u16)
                .map_err(|_| AdvertisementError::InvalidServiceUuid(s.to_string()));
        }
        Uuid::parse_str(digits)
            .map(Self)
            .map_err(|_| AdvertisementError::InvalidServiceUuid(s.to_string()))
    }
}

impl Serialize for ServiceUuid {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceUuid {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One received advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Raw AD structures (length, type, payload)*
    pub data: Vec<u8>,
    /// Service UUIDs already decoded by the host stack
    pub services: Vec<ServiceUuid>,
}

impl Advertisement {
    pub fn from_raw(data: Vec<u8>) -> Self {
        Self {
            data,
            services: Vec::new(),
        }
    }

    pub fn from_services(services: Vec<ServiceUuid>) -> Self {
        Self {
            data: Vec::new(),
            services,
        }
    }

    /// Whether the advertisement lists `service`
    pub fn advertises(&self, service: &ServiceUuid) -> bool {
        self.services.contains(service) || find_service_in_ad_data(&self.data, service)
    }
}

/// Walk the AD structures looking for `service` in a service class UUID list.
///
/// Malformed data (a structure running past the end of the buffer) never matches.
pub fn find_service_in_ad_data(data: &[u8], service: &ServiceUuid) -> bool {
    let short = service.as_u16();
    let mut i = 0usize;
    while i < data.len() {
        let field_len = data[i] as usize;
        if field_len == 0 {
            // Zero length terminates significant data
            return false;
        }
        let end = i + 1 + field_len;
        if end > data.len() {
            return false;
        }
        let field_type = data[i + 1];
        let payload = &data[i + 2..end];
        match field_type {
            AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE => {
                if let Some(short) = short {
                    let found = payload
                        .chunks_exact(2)
                        .any(|c| u16::from_le_bytes([c[0], c[1]]) == short);
                    if found {
                        return true;
                    }
                }
            }
            AD_TYPE_UUID128_INCOMPLETE | AD_TYPE_UUID128_COMPLETE => {
                let found = payload.chunks_exact(16).any(|c| {
                    let mut be = [0u8; 16];
                    for (dst, src) in be.iter_mut().zip(c.iter().rev()) {
                        *dst = *src;
                    }
                    Uuid::from_bytes(be) == service.0
                });
                if found {
                    return true;
                }
            }
            _ => {}
        }
        i = end;
    }
    false
}
