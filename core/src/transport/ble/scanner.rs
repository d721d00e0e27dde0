//! Scan scheduling across the endpoint pool
//!
//! Each endpoint runs its own `Idle -> Scanning -> Idle` state machine. The
//! scheduler groups the endpoints that start scanning together into one scan
//! window so discovery results can be evaluated when the window closes.

use crate::transport::abstraction::EndpointId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Scan cadence configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Time between periodic discovery scans in milliseconds (default 30s)
    pub period_ms: u64,
    /// How long each discovery scan lasts in milliseconds (default 3s)
    pub duration_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            period_ms: 30_000,
            duration_ms: 3_000,
        }
    }
}

impl ScanConfig {
    /// Create a new scan configuration
    pub fn new(period_ms: u64, duration_ms: u64) -> Result<Self, ScannerError> {
        let config = Self {
            period_ms,
            duration_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.period_ms == 0 || self.duration_ms == 0 {
            return Err(ScannerError::InvalidScanConfig(
                "Scan period and duration must be > 0".to_string(),
            ));
        }
        if self.duration_ms > self.period_ms {
            return Err(ScannerError::InvalidScanConfig(
                "Scan duration must be <= scan period".to_string(),
            ));
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Errors for scanner operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Invalid scan configuration: {0}")]
    InvalidScanConfig(String),
}

/// Per-endpoint scanner state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Not scanning
    Idle,
    /// Scanning as part of the open discovery window
    Scanning,
}

/// One discovery scan shared by a set of endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWindow {
    pub id: u64,
    /// Endpoints still scanning in this window
    pub endpoints: BTreeSet<EndpointId>,
    pub started_at: Instant,
    pub deadline: Instant,
}

/// Why a window stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowClose {
    /// The configured duration elapsed
    Deadline,
    /// Every scanning endpoint was committed elsewhere before the deadline
    Drained,
}

/// Scan scheduler for the whole pool
#[derive(Debug)]
pub struct ScanScheduler {
    config: ScanConfig,
    states: BTreeMap<EndpointId, ScannerState>,
    window: Option<ScanWindow>,
    next_window_id: u64,
}

impl ScanScheduler {
    /// Create a scheduler for the given endpoints, all idle
    pub fn new(config: ScanConfig, endpoints: impl IntoIterator<Item = EndpointId>) -> Result<Self, ScannerError> {
        config.validate()?;
        Ok(Self {
            config,
            states: endpoints
                .into_iter()
                .map(|id| (id, ScannerState::Idle))
                .collect(),
            window: None,
            next_window_id: 1,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// The currently open discovery window, if any
    pub fn window(&self) -> Option<&ScanWindow> {
        self.window.as_ref()
    }

    pub fn is_window_open(&self) -> bool {
        self.window.is_some()
    }

    /// Open a discovery window on the given idle endpoints.
    ///
    /// Returns `None` when a window is already open or nobody can scan.
    /// Endpoints already scanning are skipped, so the call is idempotent.
    pub fn open_window(&mut self, idle: &[EndpointId], now: Instant) -> Option<ScanWindow> {
        if self.window.is_some() {
            return None;
        }
        let endpoints: BTreeSet<EndpointId> = idle
            .iter()
            .copied()
            .filter(|id| self.states.get(id) == Some(&ScannerState::Idle))
            .collect();
        if endpoints.is_empty() {
            return None;
        }
        for id in &endpoints {
            self.states.insert(*id, ScannerState::Scanning);
        }
        let window = ScanWindow {
            id: self.next_window_id,
            endpoints,
            started_at: now,
            deadline: now + self.config.duration(),
        };
        self.next_window_id += 1;
        self.window = Some(window.clone());
        Some(window)
    }

    /// Add idle endpoints to the open window without moving its deadline.
    ///
    /// Returns the endpoints that joined; empty when no window is open.
    pub fn join_window(&mut self, idle: &[EndpointId]) -> Vec<EndpointId> {
        let Some(window) = self.window.as_mut() else {
            return Vec::new();
        };
        let mut joined = Vec::new();
        for id in idle {
            if self.states.get(id) == Some(&ScannerState::Idle) {
                self.states.insert(*id, ScannerState::Scanning);
                window.endpoints.insert(*id);
                joined.push(*id);
            }
        }
        joined
    }

    /// Stop one endpoint early (it was committed to a connect or failed).
    ///
    /// Returns `true` if the endpoint was scanning. When that leaves the open
    /// window without scanners, `window_drained` reports it.
    pub fn stop_endpoint(&mut self, endpoint: EndpointId) -> bool {
        let was_scanning = self.states.get(&endpoint) == Some(&ScannerState::Scanning);
        if was_scanning {
            self.states.insert(endpoint, ScannerState::Idle);
        }
        if let Some(window) = self.window.as_mut() {
            window.endpoints.remove(&endpoint);
        }
        was_scanning
    }

    /// Whether the open window has lost all of its scanners
    pub fn window_drained(&self) -> bool {
        self.window
            .as_ref()
            .map(|w| w.endpoints.is_empty())
            .unwrap_or(false)
    }

    /// Close the window with the given id, returning it and the endpoints
    /// that were still scanning. Stale ids (an already-closed window) are ignored.
    pub fn close_window(&mut self, window_id: u64) -> Option<ScanWindow> {
        match &self.window {
            Some(window) if window.id == window_id => {}
            _ => return None,
        }
        let window = self.window.take()?;
        for id in &window.endpoints {
            self.states.insert(*id, ScannerState::Idle);
        }
        Some(window)
    }

    /// Drop an endpoint from scheduling (transport fault)
    pub fn remove_endpoint(&mut self, endpoint: EndpointId) {
        self.stop_endpoint(endpoint);
        self.states.remove(&endpoint);
    }

    /// Put an endpoint (back) under scheduling as idle
    pub fn add_endpoint(&mut self, endpoint: EndpointId) {
        self.states.insert(endpoint, ScannerState::Idle);
    }
}
