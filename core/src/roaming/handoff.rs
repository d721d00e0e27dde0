//! RSSI supervision & handoff engine
//!
//! Served links are sampled periodically. A sample below the threshold opens
//! an analysis window during which idle endpoints listen for that peer. When
//! the window closes the engine decides whether the peer should migrate.
//!
//! Migration is two independent commands (disconnect, then connect on the
//! new endpoint), so the peer is unserved in between.

use crate::transport::abstraction::{EndpointId, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Value at or below which the hard disconnect floor is disabled
pub const RSSI_FLOOR_DISABLED: i8 = -127;

/// Handoff tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPolicy {
    /// Samples below this open an analysis window (dBm)
    pub threshold_dbm: i8,
    /// Required improvement before migrating (dB)
    pub margin_db: i8,
    /// Samples below this close the link outright; -127 disables it
    pub disconnect_floor_dbm: i8,
    /// Analysis window length
    pub analysis_duration: Duration,
}

impl Default for HandoffPolicy {
    fn default() -> Self {
        Self {
            threshold_dbm: -80,
            margin_db: 0,
            disconnect_floor_dbm: RSSI_FLOOR_DISABLED,
            analysis_duration: Duration::from_secs(3),
        }
    }
}

/// `best > current + margin`, computed without overflow
pub fn should_handoff(best: i8, current: i8, margin: i8) -> bool {
    i16::from(best) > i16::from(current) + i16::from(margin)
}

/// What to do about one served-link RSSI sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleVerdict {
    /// Link is fine
    Healthy,
    /// Below threshold, an analysis window should open
    Analyze,
    /// Below threshold but the peer is already being analysed
    AlreadyAnalyzing,
    /// Below the hard floor, close the link
    Disconnect,
}

/// An open analysis window for one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub id: u64,
    pub peer: PeerId,
    pub serving: EndpointId,
    /// Latest sample taken on the serving link
    pub current: i8,
    /// Endpoints listening for the peer
    pub analyzers: BTreeSet<EndpointId>,
    /// Strongest report so far
    pub best: Option<(EndpointId, i8)>,
    pub opened_at: Instant,
    pub deadline: Instant,
}

/// Outcome of a closed analysis window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffDecision {
    /// Keep the current endpoint
    Stay { best: Option<i8>, current: i8 },
    /// Move the peer
    Migrate {
        from: EndpointId,
        to: EndpointId,
        best: i8,
        current: i8,
    },
}

/// Tracks open analysis windows, at most one per peer
#[derive(Debug)]
pub struct HandoffEngine {
    policy: HandoffPolicy,
    windows: HashMap<PeerId, AnalysisWindow>,
    next_id: u64,
}

impl HandoffEngine {
    pub fn new(policy: HandoffPolicy) -> Self {
        Self {
            policy,
            windows: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn policy(&self) -> &HandoffPolicy {
        &self.policy
    }

    /// Classify a served-link sample
    pub fn assess_sample(&self, peer: &PeerId, rssi: i8) -> SampleVerdict {
        if self.policy.disconnect_floor_dbm > RSSI_FLOOR_DISABLED
            && rssi < self.policy.disconnect_floor_dbm
        {
            return SampleVerdict::Disconnect;
        }
        if rssi >= self.policy.threshold_dbm {
            return SampleVerdict::Healthy;
        }
        if self.windows.contains_key(peer) {
            SampleVerdict::AlreadyAnalyzing
        } else {
            SampleVerdict::Analyze
        }
    }

    pub fn is_analyzing(&self, peer: &PeerId) -> bool {
        self.windows.contains_key(peer)
    }

    pub fn window(&self, peer: &PeerId) -> Option<&AnalysisWindow> {
        self.windows.get(peer)
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// Open a window for `peer`. Refused when one is already open or nobody
    /// is available to listen.
    pub fn open(
        &mut self,
        peer: PeerId,
        serving: EndpointId,
        current: i8,
        analyzers: BTreeSet<EndpointId>,
        now: Instant,
    ) -> Option<AnalysisWindow> {
        if self.windows.contains_key(&peer) || analyzers.is_empty() {
            return None;
        }
        let window = AnalysisWindow {
            id: self.next_id,
            peer,
            serving,
            current,
            analyzers,
            best: None,
            opened_at: now,
            deadline: now + self.policy.analysis_duration,
        };
        self.next_id += 1;
        debug!(peer = %peer, serving = %serving, analyzers = window.analyzers.len(), "analysis window opened");
        self.windows.insert(peer, window.clone());
        Some(window)
    }

    /// Feed a sample taken on the peer's link. Ignored unless `endpoint`
    /// is the window's serving endpoint.
    pub fn update_current(&mut self, peer: &PeerId, endpoint: EndpointId, rssi: i8) -> bool {
        match self.windows.get_mut(peer) {
            Some(window) if window.serving == endpoint => {
                window.current = rssi;
                true
            }
            _ => false,
        }
    }

    /// Feed a scan report. Only counted if `endpoint` analyses this peer.
    pub fn record(&mut self, peer: &PeerId, endpoint: EndpointId, rssi: i8) -> bool {
        let Some(window) = self.windows.get_mut(peer) else {
            return false;
        };
        if !window.analyzers.contains(&endpoint) {
            return false;
        }
        match window.best {
            Some((_, best)) if best >= rssi => {}
            _ => window.best = Some((endpoint, rssi)),
        }
        true
    }

    /// An analysing endpoint left (committed elsewhere or faulted).
    ///
    /// Its earlier reports are discarded since it can no longer take the peer.
    pub fn drop_analyzer(&mut self, endpoint: EndpointId) {
        for window in self.windows.values_mut() {
            if window.analyzers.remove(&endpoint) {
                if let Some((best_ep, _)) = window.best {
                    if best_ep == endpoint {
                        window.best = None;
                    }
                }
            }
        }
    }

    /// Close the window for `peer` if `window_id` matches and decide
    /// against the serving link's latest sample.
    pub fn close(&mut self, peer: &PeerId, window_id: u64) -> Option<(AnalysisWindow, HandoffDecision)> {
        match self.windows.get(peer) {
            Some(w) if w.id == window_id => {}
            _ => return None,
        }
        let window = self.windows.remove(peer)?;
        let current = window.current;
        let decision = match window.best {
            Some((to, best)) if should_handoff(best, current, self.policy.margin_db) => {
                HandoffDecision::Migrate {
                    from: window.serving,
                    to,
                    best,
                    current,
                }
            }
            best => HandoffDecision::Stay {
                best: best.map(|(_, rssi)| rssi),
                current,
            },
        };
        Some((window, decision))
    }

    /// Drop the window for a peer that lost its link
    pub fn abort(&mut self, peer: &PeerId) -> Option<AnalysisWindow> {
        self.windows.remove(peer)
    }
}
