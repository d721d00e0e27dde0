// Roaming pool configuration
//
// Passed explicitly to the coordinator at construction. Every field has a
// default so partial JSON files are accepted.

use crate::roaming::handoff::{HandoffPolicy, RSSI_FLOOR_DISABLED};
use crate::transport::abstraction::PeerAddress;
use crate::transport::ble::advertisement::ServiceUuid;
use crate::transport::ble::gatt::MeasurementProfile;
use crate::transport::ble::scanner::ScanConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoamingConfig {
    /// Transport identifiers, one endpoint each, in endpoint-id order
    pub transports: Vec<String>,

    /// Identity address every radio adopts
    pub identity_address: Option<PeerAddress>,

    /// Maximum concurrently served peers per endpoint
    pub endpoint_capacity: usize,

    /// Served samples below this open an analysis window (dBm)
    pub rssi_threshold_dbm: i8,

    /// Required improvement before a handoff (dB)
    pub handoff_margin_db: i8,

    /// Served samples below this close the link; -127 disables the floor
    pub rssi_disconnect_dbm: i8,

    pub scan_period_ms: u64,
    pub scan_duration_ms: u64,
    pub rssi_period_ms: u64,
    pub analysis_duration_ms: u64,
    pub connect_timeout_ms: u64,
    pub boot_timeout_ms: u64,

    /// Only peers advertising this service are discovered
    pub service_filter: Option<ServiceUuid>,

    /// Characteristic subscribed to on every secured link; `None` skips GATT
    pub measurement: Option<MeasurementProfile>,

    pub bonding_db_path: PathBuf,

    /// Wipe every bond before starting
    pub delete_bonds_on_start: bool,

    /// RSSI samples kept per peer
    pub rssi_history_len: usize,

    /// Unassigned peers unseen for this long are forgotten; `None` keeps them
    pub stale_peer_ttl_secs: Option<u64>,
}

impl Default for RoamingConfig {
    fn default() -> Self {
        Self {
            transports: Vec::new(),
            identity_address: None,
            endpoint_capacity: 1,
            rssi_threshold_dbm: -80,
            handoff_margin_db: 0,
            rssi_disconnect_dbm: RSSI_FLOOR_DISABLED,
            scan_period_ms: 30_000,
            scan_duration_ms: 3_000,
            rssi_period_ms: 10_000,
            analysis_duration_ms: 3_000,
            connect_timeout_ms: 3_000,
            boot_timeout_ms: 2_000,
            service_filter: None,
            measurement: Some(MeasurementProfile::heart_rate()),
            bonding_db_path: PathBuf::from("bonding_db.json"),
            delete_bonds_on_start: false,
            rssi_history_len: 16,
            stale_peer_ttl_secs: Some(300),
        }
    }
}

impl RoamingConfig {
    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint_capacity == 0 {
            return Err(invalid("endpoint_capacity", "must be at least 1"));
        }
        if self.handoff_margin_db < 0 {
            return Err(invalid("handoff_margin_db", "must not be negative"));
        }
        if self.rssi_disconnect_dbm > RSSI_FLOOR_DISABLED
            && self.rssi_disconnect_dbm >= self.rssi_threshold_dbm
        {
            return Err(invalid(
                "rssi_disconnect_dbm",
                format!(
                    "floor {} must be below the handoff threshold {}",
                    self.rssi_disconnect_dbm, self.rssi_threshold_dbm
                ),
            ));
        }
        self.scan_config()
            .validate()
            .map_err(|e| invalid("scan_duration_ms", e.to_string()))?;
        for (field, value) in [
            ("rssi_period_ms", self.rssi_period_ms),
            ("analysis_duration_ms", self.analysis_duration_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("boot_timeout_ms", self.boot_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.rssi_history_len == 0 {
            return Err(invalid("rssi_history_len", "must be at least 1"));
        }
        if self.transports.len() > usize::from(u16::MAX) {
            return Err(invalid("transports", "too many endpoints"));
        }
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            period_ms: self.scan_period_ms,
            duration_ms: self.scan_duration_ms,
        }
    }

    pub fn handoff_policy(&self) -> HandoffPolicy {
        HandoffPolicy {
            threshold_dbm: self.rssi_threshold_dbm,
            margin_db: self.handoff_margin_db,
            disconnect_floor_dbm: self.rssi_disconnect_dbm,
            analysis_duration: Duration::from_millis(self.analysis_duration_ms),
        }
    }

    pub fn rssi_period(&self) -> Duration {
        Duration::from_millis(self.rssi_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn stale_peer_ttl(&self) -> Option<Duration> {
        self.stale_peer_ttl_secs.map(Duration::from_secs)
    }
}
