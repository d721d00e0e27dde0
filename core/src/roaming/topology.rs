//! Topology snapshots and the events published to observers

use crate::roaming::registry::PeripheralRegistry;
use crate::transport::abstraction::{AddressType, EndpointId, PeerAddress, PeerId, TransportError};
use crate::transport::ble::advertisement::ServiceUuid;
use crate::transport::ble::gatt::{parse_heart_rate, HEART_RATE_MEASUREMENT};
use crate::transport::endpoint::{EndpointState, RadioEndpoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServedPeerView {
    pub peer_address: PeerAddress,
    pub address_type: AddressType,
    pub last_rssi: Option<i8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointView {
    pub state: EndpointState,
    pub served_peers: Vec<ServedPeerView>,
}

/// Full endpoint → served peers mapping at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub endpoints: BTreeMap<EndpointId, EndpointView>,
}

/// What a snapshot is compared on; RSSI changes alone are not a topology change
pub(crate) type TopologySignature = Vec<(EndpointId, EndpointState, Vec<PeerId>)>;

impl TopologySnapshot {
    pub fn capture<'a>(
        endpoints: impl IntoIterator<Item = &'a RadioEndpoint>,
        registry: &PeripheralRegistry,
    ) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|ep| {
                let served_peers = ep
                    .served_peers()
                    .into_iter()
                    .map(|peer| ServedPeerView {
                        peer_address: peer.address,
                        address_type: peer.address_type,
                        last_rssi: registry.get(&peer).and_then(|d| d.latest_rssi(ep.id())),
                    })
                    .collect();
                (
                    ep.id(),
                    EndpointView {
                        state: ep.state(),
                        served_peers,
                    },
                )
            })
            .collect();
        Self { endpoints }
    }

    pub(crate) fn signature(&self) -> TopologySignature {
        self.endpoints
            .iter()
            .map(|(id, view)| {
                let peers = view
                    .served_peers
                    .iter()
                    .map(|p| PeerId::new(p.peer_address, p.address_type))
                    .collect();
                (*id, view.state, peers)
            })
            .collect()
    }

    /// Endpoint currently serving `peer`
    pub fn endpoint_of(&self, peer: &PeerId) -> Option<EndpointId> {
        self.endpoints.iter().find_map(|(id, view)| {
            view.served_peers
                .iter()
                .any(|p| p.peer_address == peer.address && p.address_type == peer.address_type)
                .then_some(*id)
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for TopologySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (id, view) in &self.endpoints {
            if !first {
                write!(f, " | ")?;
            }
            first = false;
            write!(f, "{} {}", id, view.state)?;
            for peer in &view.served_peers {
                match peer.last_rssi {
                    Some(rssi) => write!(f, " [{} {}dBm]", peer.peer_address, rssi)?,
                    None => write!(f, " [{}]", peer.peer_address)?,
                }
            }
        }
        Ok(())
    }
}

/// Published on the coordinator's broadcast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoamEvent {
    /// The assignment table or an endpoint state changed
    TopologyChanged(TopologySnapshot),
    /// A migration began; the peer is unserved until it completes
    HandoffStarted {
        peer: PeerId,
        from: EndpointId,
        to: EndpointId,
        best: i8,
        current: i8,
    },
    /// The peer is served again on its new endpoint
    HandoffCompleted {
        peer: PeerId,
        endpoint: EndpointId,
        gap: Duration,
    },
    /// The new connect failed; the peer waits for the next scan cycle
    HandoffFailed {
        peer: PeerId,
        endpoint: EndpointId,
        reason: String,
    },
    EndpointDisabled {
        endpoint: EndpointId,
        error: TransportError,
    },
    EndpointRecovered {
        endpoint: EndpointId,
    },
    /// The subscribed characteristic of a served peer notified a value
    Measurement {
        peer: PeerId,
        endpoint: EndpointId,
        characteristic: ServiceUuid,
        value: Vec<u8>,
    },
}

impl fmt::Display for RoamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoamEvent::TopologyChanged(snapshot) => write!(f, "topology: {}", snapshot),
            RoamEvent::HandoffStarted {
                peer,
                from,
                to,
                best,
                current,
            } => write!(
                f,
                "handoff {} {} -> {} ({}dBm -> {}dBm)",
                peer, from, to, current, best
            ),
            RoamEvent::HandoffCompleted {
                peer,
                endpoint,
                gap,
            } => write!(f, "handoff {} done on {} after {:?} unserved", peer, endpoint, gap),
            RoamEvent::HandoffFailed {
                peer,
                endpoint,
                reason,
            } => write!(f, "handoff {} to {} failed: {}", peer, endpoint, reason),
            RoamEvent::EndpointDisabled { endpoint, error } => {
                write!(f, "{} disabled: {}", endpoint, error)
            }
            RoamEvent::EndpointRecovered { endpoint } => write!(f, "{} recovered", endpoint),
            RoamEvent::Measurement {
                peer,
                endpoint,
                characteristic,
                value,
            } => match parse_heart_rate(value) {
                Ok(bpm) if *characteristic == HEART_RATE_MEASUREMENT => {
                    write!(f, "heart rate {} on {}: {} BPM", peer, endpoint, bpm)
                }
                _ => write!(
                    f,
                    "measurement {} on {}: {} = {}",
                    peer,
                    endpoint,
                    characteristic,
                    hex::encode(value)
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::ConnectionHandle;
    use crate::transport::endpoint::EndpointLink;
    use std::time::Instant;

    #[test]
    fn test_capture_and_json_shape() {
        let peer = PeerId::public([0xAA, 0, 0, 0, 0, 1]);
        let mut registry = PeripheralRegistry::new(4);
        let now = Instant::now();
        registry.observe(peer, EndpointId(1), -61, now);
        registry.mark_served(peer, EndpointId(1), now);

        let (link0, _c0) = EndpointLink::detached();
        let (link1, _c1) = EndpointLink::detached();
        let ep0 = RadioEndpoint::new(EndpointId(0), "a", 1, link0);
        let mut ep1 = RadioEndpoint::new(EndpointId(1), "b", 1, link1);
        ep1.add_link(ConnectionHandle(9), peer);

        let snapshot = TopologySnapshot::capture([&ep0, &ep1], &registry);
        assert_eq!(snapshot.endpoint_of(&peer), Some(EndpointId(1)));

        let value: serde_json::Value =
            serde_json::from_str(&snapshot.to_json().expect("json")).expect("parse");
        assert_eq!(value["endpoints"]["0"]["state"], "Idle");
        assert_eq!(value["endpoints"]["1"]["state"], "Serving");
        assert_eq!(
            value["endpoints"]["1"]["served_peers"][0]["peer_address"],
            "AA:00:00:00:00:01"
        );
        assert_eq!(value["endpoints"]["1"]["served_peers"][0]["last_rssi"], -61);
    }

    #[test]
    fn test_measurement_display() {
        let peer = PeerId::public([0xAA, 0, 0, 0, 0, 1]);
        let event = |characteristic, value: &[u8]| RoamEvent::Measurement {
            peer,
            endpoint: EndpointId(2),
            characteristic,
            value: value.to_vec(),
        };
        assert_eq!(
            event(HEART_RATE_MEASUREMENT, &[0x00, 72]).to_string(),
            "heart rate AA:00:00:00:00:01 (public) on AP#2: 72 BPM"
        );
        assert_eq!(
            event(HEART_RATE_MEASUREMENT, &[0x01]).to_string(),
            "measurement AA:00:00:00:00:01 (public) on AP#2: 2a37 = 01"
        );
        assert_eq!(
            event(ServiceUuid::from_u16(0x2A1C), &[0x00, 0x10]).to_string(),
            "measurement AA:00:00:00:00:01 (public) on AP#2: 2a1c = 0010"
        );
    }

    #[test]
    fn test_signature_ignores_rssi() {
        let peer = PeerId::public([1; 6]);
        let view = |rssi| EndpointView {
            state: EndpointState::Serving,
            served_peers: vec![ServedPeerView {
                peer_address: peer.address,
                address_type: peer.address_type,
                last_rssi: Some(rssi),
            }],
        };
        let a = TopologySnapshot {
            endpoints: BTreeMap::from([(EndpointId(0), view(-50))]),
        };
        let b = TopologySnapshot {
            endpoints: BTreeMap::from([(EndpointId(0), view(-70))]),
        };
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a, b);
    }
}
