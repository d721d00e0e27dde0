//! Peripheral registry: the authoritative table of known peers
//!
//! Tracks each peer's connection state, which endpoint it is assigned to and
//! a bounded window of recent RSSI samples per reporting endpoint. A peer has
//! a single `assigned` slot, so it can never be assigned to two endpoints.

use crate::transport::abstraction::{EndpointId, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Connection state of a peer as seen by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Referenced but never heard advertising
    Unknown,
    /// Heard advertising, not connected
    Discovered,
    /// A connect is in flight
    Connecting,
    /// Connected and served
    Served,
    /// Served, with an analysis window deciding on a handoff
    Analyzing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Discovered => write!(f, "Discovered"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Served => write!(f, "Served"),
            Self::Analyzing => write!(f, "Analyzing"),
        }
    }
}

/// Bonding status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondingStatus {
    None,
    /// Pairing in progress
    Pending,
    Bonded,
}

/// One RSSI measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiSample {
    pub endpoint: EndpointId,
    pub rssi: i8,
    pub at: Instant,
}

/// A peer known to the pool
#[derive(Debug, Clone)]
pub struct PeripheralDevice {
    pub id: PeerId,
    pub state: ConnectionState,
    pub assigned: Option<EndpointId>,
    pub bonding: BondingStatus,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Set when the peer lost service during a handoff, cleared once served again
    pub unserved_since: Option<Instant>,
    samples: VecDeque<RssiSample>,
}

impl PeripheralDevice {
    fn new(id: PeerId, now: Instant) -> Self {
        Self {
            id,
            state: ConnectionState::Unknown,
            assigned: None,
            bonding: BondingStatus::None,
            first_seen: now,
            last_seen: now,
            unserved_since: None,
            samples: VecDeque::new(),
        }
    }

    /// Recent samples, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &RssiSample> {
        self.samples.iter()
    }

    /// Most recent sample reported by `endpoint`
    pub fn latest_rssi(&self, endpoint: EndpointId) -> Option<i8> {
        self.samples
            .iter()
            .rev()
            .find(|s| s.endpoint == endpoint)
            .map(|s| s.rssi)
    }

    /// Strongest sample reported by `endpoint` at or after `since`
    pub fn best_rssi_since(&self, endpoint: EndpointId, since: Instant) -> Option<i8> {
        self.samples
            .iter()
            .filter(|s| s.endpoint == endpoint && s.at >= since)
            .map(|s| s.rssi)
            .max()
    }
}

/// Table of every peer the pool has seen
#[derive(Debug)]
pub struct PeripheralRegistry {
    peers: HashMap<PeerId, PeripheralDevice>,
    history_len: usize,
}

impl PeripheralRegistry {
    /// Create a registry keeping `history_len` RSSI samples per peer
    pub fn new(history_len: usize) -> Self {
        Self {
            peers: HashMap::new(),
            history_len: history_len.max(1),
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeripheralDevice> {
        self.peers.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeripheralDevice> {
        self.peers.get_mut(peer)
    }

    /// Get or create the entry for `peer`
    pub fn ensure(&mut self, peer: PeerId, now: Instant) -> &mut PeripheralDevice {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeripheralDevice::new(peer, now))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeripheralDevice> {
        self.peers.values()
    }

    /// Record an RSSI sample. Unknown peers become Discovered.
    ///
    /// Returns `true` when this made the peer Discovered.
    pub fn observe(&mut self, peer: PeerId, endpoint: EndpointId, rssi: i8, now: Instant) -> bool {
        let history_len = self.history_len;
        let device = self.ensure(peer, now);
        device.last_seen = now;
        device.samples.push_back(RssiSample {
            endpoint,
            rssi,
            at: now,
        });
        while device.samples.len() > history_len {
            device.samples.pop_front();
        }
        if device.state == ConnectionState::Unknown {
            device.state = ConnectionState::Discovered;
            debug!(peer = %peer, endpoint = %endpoint, rssi, "peer discovered");
            return true;
        }
        false
    }

    /// Record an RSSI sample taken on the peer's connection
    pub fn record_link_rssi(&mut self, peer: PeerId, endpoint: EndpointId, rssi: i8, now: Instant) {
        let history_len = self.history_len;
        if let Some(device) = self.peers.get_mut(&peer) {
            device.samples.push_back(RssiSample {
                endpoint,
                rssi,
                at: now,
            });
            while device.samples.len() > history_len {
                device.samples.pop_front();
            }
        }
    }

    /// Peer is being connected on `endpoint`
    pub fn mark_connecting(&mut self, peer: PeerId, endpoint: EndpointId, now: Instant) {
        let device = self.ensure(peer, now);
        device.state = ConnectionState::Connecting;
        device.assigned = Some(endpoint);
    }

    /// Peer is served on `endpoint`
    pub fn mark_served(&mut self, peer: PeerId, endpoint: EndpointId, now: Instant) {
        let device = self.ensure(peer, now);
        device.state = ConnectionState::Served;
        device.assigned = Some(endpoint);
        device.last_seen = now;
        device.unserved_since = None;
    }

    /// Peer was released by its serving endpoint and is being connected on
    /// `to`. It stays unserved until the new connection opens.
    pub fn begin_handoff(&mut self, peer: PeerId, to: EndpointId, now: Instant) {
        let device = self.ensure(peer, now);
        device.state = ConnectionState::Connecting;
        device.assigned = Some(to);
        device.unserved_since = Some(now);
    }

    pub fn set_bonding(&mut self, peer: &PeerId, status: BondingStatus) {
        if let Some(device) = self.peers.get_mut(peer) {
            device.bonding = status;
        }
    }

    /// Peer lost (or never got) its endpoint; back in the discovery pool
    pub fn mark_discovered(&mut self, peer: PeerId, now: Instant) {
        let device = self.ensure(peer, now);
        device.state = ConnectionState::Discovered;
        device.assigned = None;
    }

    /// Analysis window opened or closed for a served peer
    pub fn set_analyzing(&mut self, peer: &PeerId, analyzing: bool) {
        if let Some(device) = self.peers.get_mut(peer) {
            match (analyzing, device.state) {
                (true, ConnectionState::Served) => device.state = ConnectionState::Analyzing,
                (false, ConnectionState::Analyzing) => device.state = ConnectionState::Served,
                _ => {}
            }
        }
    }

    /// Peers the pool can still assign (Discovered, no endpoint)
    pub fn unassigned_discovered(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .values()
            .filter(|d| d.state == ConnectionState::Discovered && d.assigned.is_none())
            .map(|d| d.id)
            .collect();
        peers.sort();
        peers
    }

    /// Peers assigned to `endpoint`
    pub fn assigned_to(&self, endpoint: EndpointId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .values()
            .filter(|d| d.assigned == Some(endpoint))
            .map(|d| d.id)
            .collect();
        peers.sort();
        peers
    }

    /// When the peer lost service, if it is currently waiting for a new endpoint
    pub fn unserved_since(&self, peer: &PeerId) -> Option<Instant> {
        self.peers.get(peer).and_then(|d| d.unserved_since)
    }

    /// Evict unassigned peers not heard from within `ttl`.
    ///
    /// Bonded peers are evicted too; their keys live in the bonding store.
    pub fn evict_stale(&mut self, now: Instant, ttl: Duration) -> Vec<PeerId> {
        let mut evicted = Vec::new();
        self.peers.retain(|id, device| {
            let idle = matches!(
                device.state,
                ConnectionState::Unknown | ConnectionState::Discovered
            ) && device.assigned.is_none();
            let stale = now.saturating_duration_since(device.last_seen) > ttl;
            if idle && stale {
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        evicted.sort();
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::public([0xC0, 0, 0, 0, 0, n])
    }

    #[test]
    fn test_observe_discovers_once() {
        let mut reg = PeripheralRegistry::new(8);
        let now = Instant::now();
        assert!(reg.observe(peer(1), EndpointId(0), -60, now));
        assert!(!reg.observe(peer(1), EndpointId(1), -70, now));

        let device = reg.get(&peer(1)).expect("device");
        assert_eq!(device.state, ConnectionState::Discovered);
        assert_eq!(device.latest_rssi(EndpointId(0)), Some(-60));
        assert_eq!(device.latest_rssi(EndpointId(1)), Some(-70));
        assert_eq!(device.latest_rssi(EndpointId(2)), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut reg = PeripheralRegistry::new(3);
        let now = Instant::now();
        for rssi in [-10, -20, -30, -40, -50] {
            reg.observe(peer(1), EndpointId(0), rssi, now);
        }
        let samples: Vec<i8> = reg
            .get(&peer(1))
            .expect("device")
            .samples()
            .map(|s| s.rssi)
            .collect();
        assert_eq!(samples, vec![-30, -40, -50]);
    }

    #[test]
    fn test_best_rssi_since_ignores_old_samples() {
        let mut reg = PeripheralRegistry::new(8);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(30);
        reg.observe(peer(1), EndpointId(0), -40, t0);
        reg.observe(peer(1), EndpointId(0), -75, t1);
        reg.observe(peer(1), EndpointId(0), -70, t1);

        let device = reg.get(&peer(1)).expect("device");
        assert_eq!(device.best_rssi_since(EndpointId(0), t0), Some(-40));
        assert_eq!(device.best_rssi_since(EndpointId(0), t1), Some(-70));
    }

    #[test]
    fn test_assignment_lifecycle() {
        let mut reg = PeripheralRegistry::new(8);
        let now = Instant::now();
        reg.observe(peer(1), EndpointId(0), -50, now);
        assert_eq!(reg.unassigned_discovered(), vec![peer(1)]);

        reg.mark_connecting(peer(1), EndpointId(0), now);
        assert!(reg.unassigned_discovered().is_empty());
        assert_eq!(reg.assigned_to(EndpointId(0)), vec![peer(1)]);

        reg.mark_served(peer(1), EndpointId(0), now);
        reg.set_analyzing(&peer(1), true);
        assert_eq!(reg.get(&peer(1)).map(|d| d.state), Some(ConnectionState::Analyzing));
        reg.set_analyzing(&peer(1), false);
        assert_eq!(reg.get(&peer(1)).map(|d| d.state), Some(ConnectionState::Served));

        reg.mark_discovered(peer(1), now);
        assert!(reg.assigned_to(EndpointId(0)).is_empty());
    }

    #[test]
    fn test_reassignment_moves_single_slot() {
        let mut reg = PeripheralRegistry::new(8);
        let now = Instant::now();
        reg.mark_served(peer(1), EndpointId(0), now);
        reg.mark_connecting(peer(1), EndpointId(1), now);
        assert!(reg.assigned_to(EndpointId(0)).is_empty());
        assert_eq!(reg.assigned_to(EndpointId(1)), vec![peer(1)]);
    }

    #[test]
    fn test_handoff_gap_is_tracked_until_served() {
        let mut reg = PeripheralRegistry::new(8);
        let t0 = Instant::now();
        reg.mark_served(peer(1), EndpointId(0), t0);
        reg.begin_handoff(peer(1), EndpointId(1), t0);
        assert_eq!(reg.unserved_since(&peer(1)), Some(t0));
        assert_eq!(reg.assigned_to(EndpointId(1)), vec![peer(1)]);

        reg.mark_served(peer(1), EndpointId(1), t0 + Duration::from_millis(40));
        assert_eq!(reg.unserved_since(&peer(1)), None);
    }

    #[test]
    fn test_evict_stale_keeps_assigned_peers() {
        let mut reg = PeripheralRegistry::new(8);
        let t0 = Instant::now();
        reg.observe(peer(1), EndpointId(0), -50, t0);
        reg.observe(peer(2), EndpointId(0), -50, t0);
        reg.mark_served(peer(2), EndpointId(0), t0);
        reg.observe(peer(3), EndpointId(0), -50, t0 + Duration::from_secs(290));

        let evicted = reg.evict_stale(t0 + Duration::from_secs(301), Duration::from_secs(300));
        assert_eq!(evicted, vec![peer(1)]);
        assert_eq!(reg.len(), 2);
    }
}
