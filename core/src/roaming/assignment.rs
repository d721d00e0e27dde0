//! Discovery & assignment engine
//!
//! Turns the RSSI measurements gathered during a scan window into
//! peer → endpoint assignments with a greedy strongest-signal-first pass.

use crate::roaming::registry::PeripheralRegistry;
use crate::transport::abstraction::{EndpointId, PeerId};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Instant;

/// A measured (peer, endpoint) pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub peer: PeerId,
    pub endpoint: EndpointId,
    pub rssi: i8,
}

/// Best RSSI per (unassigned Discovered peer, idle endpoint) measured at or
/// after `since`. Pairs without a measurement are not candidates.
pub fn collect_candidates(
    registry: &PeripheralRegistry,
    idle_endpoints: &[EndpointId],
    since: Instant,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for peer in registry.unassigned_discovered() {
        let Some(device) = registry.get(&peer) else {
            continue;
        };
        for endpoint in idle_endpoints {
            if let Some(rssi) = device.best_rssi_since(*endpoint, since) {
                candidates.push(Candidate {
                    peer,
                    endpoint: *endpoint,
                    rssi,
                });
            }
        }
    }
    candidates
}

/// Greedy assignment: strongest triple first, each peer and each endpoint
/// used at most once per pass.
///
/// Ties are broken by endpoint id then peer identity so the outcome is
/// deterministic. The result is a maximal matching: any candidate left out
/// shares its peer or its endpoint with a chosen one.
pub fn greedy_assign(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by_key(|c| (Reverse(c.rssi), c.endpoint, c.peer));

    let mut taken_peers = HashSet::new();
    let mut taken_endpoints = HashSet::new();
    let mut chosen = Vec::new();
    for candidate in candidates {
        if taken_peers.contains(&candidate.peer) || taken_endpoints.contains(&candidate.endpoint) {
            continue;
        }
        taken_peers.insert(candidate.peer);
        taken_endpoints.insert(candidate.endpoint);
        chosen.push(candidate);
    }
    chosen
}
