// Loopback radios: in-process simulated radios sharing one airspace
//
// Each `LoopbackRadio` implements `Transport`. Peers live in an `Airspace`
// that holds per-radio signal strengths, so moving a peer is a matter of
// changing numbers. Connects, disconnects, pairing and GATT lookups complete
// immediately.

use crate::transport::abstraction::{
    BondingFailure, CloseReason, ConnectionHandle, KeyMaterial, PeerAddress, PeerId,
    RadioCommand, RadioNotification, ScanMode, Transport, TransportError,
};
use crate::transport::ble::advertisement::{Advertisement, ServiceUuid};
use crate::transport::ble::gatt::AttributeHandle;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-radio notification queue depth
const NOTIFY_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct SimService {
    uuid: ServiceUuid,
    handle: AttributeHandle,
    characteristics: Vec<(ServiceUuid, AttributeHandle)>,
}

#[derive(Debug, Clone)]
struct SimPeer {
    advertisement: Advertisement,
    rssi: HashMap<String, i8>,
    connectable: bool,
    bond: Option<KeyMaterial>,
    link: Option<(String, ConnectionHandle)>,
    pairings: u32,
    services: Vec<SimService>,
    /// Characteristics with notifications on, for the current link only
    subscribed: BTreeSet<AttributeHandle>,
}

impl SimPeer {
    fn next_attribute(&self) -> u16 {
        self.services
            .iter()
            .flat_map(|s| std::iter::once(s.handle).chain(s.characteristics.iter().map(|(_, h)| *h)))
            .map(|h| h.0)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn characteristic(&self, uuid: ServiceUuid) -> Option<AttributeHandle> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|(u, _)| *u == uuid)
            .map(|(_, h)| *h)
    }
}

struct SimRadio {
    notify: mpsc::Sender<RadioNotification>,
    scan: Option<ScanMode>,
    identity: Option<PeerAddress>,
}

#[derive(Default)]
struct AirspaceState {
    peers: BTreeMap<PeerId, SimPeer>,
    radios: HashMap<String, SimRadio>,
    next_handle: u32,
}

impl AirspaceState {
    fn notify(&self, radio: &str, notification: RadioNotification) {
        if let Some(r) = self.radios.get(radio) {
            if let Err(e) = r.notify.try_send(notification) {
                warn!("loopback radio {} dropped a notification: {}", radio, e);
            }
        }
    }

    /// Report `peer` to `radio` if that radio is scanning for it
    fn report_if_scanning(&self, radio: &str, peer: &PeerId) {
        let (Some(r), Some(p)) = (self.radios.get(radio), self.peers.get(peer)) else {
            return;
        };
        let Some(rssi) = p.rssi.get(radio).copied() else {
            return;
        };
        let visible = match r.scan {
            Some(ScanMode::Discovery) => p.link.is_none(),
            Some(ScanMode::Targeted(target)) => target == *peer,
            None => false,
        };
        if visible {
            self.notify(
                radio,
                RadioNotification::ScanReport {
                    peer: *peer,
                    rssi,
                    advertisement: p.advertisement.clone(),
                },
            );
        }
    }

    fn peer_on_handle(&self, radio: &str, handle: ConnectionHandle) -> Option<PeerId> {
        self.peers.iter().find_map(|(id, p)| match &p.link {
            Some((r, h)) if r == radio && *h == handle => Some(*id),
            _ => None,
        })
    }

    fn close_link(&mut self, peer: &PeerId, reason: CloseReason) {
        let Some(p) = self.peers.get_mut(peer) else {
            return;
        };
        p.subscribed.clear();
        if let Some((radio, handle)) = p.link.take() {
            self.notify(&radio, RadioNotification::ConnectionClosed { handle, reason });
        }
    }

    fn pair(&mut self, radio: &str, handle: ConnectionHandle, peer: PeerId) {
        let key = KeyMaterial::new(rand::random::<[u8; 16]>().to_vec());
        if let Some(p) = self.peers.get_mut(&peer) {
            p.bond = Some(key.clone());
            p.pairings += 1;
        }
        self.notify(radio, RadioNotification::PairingCompleted { handle, key });
        self.notify(radio, RadioNotification::LinkSecured { handle });
    }

    fn gatt_failed(&self, radio: &str, handle: ConnectionHandle, reason: String) {
        self.notify(radio, RadioNotification::GattFailed { handle, reason });
    }
}

/// Shared radio environment for a set of loopback radios
#[derive(Clone, Default)]
pub struct Airspace {
    state: Arc<Mutex<AirspaceState>>,
}

impl Airspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// A radio attached to this airspace
    pub fn radio(&self, id: impl Into<String>) -> LoopbackRadio {
        LoopbackRadio {
            id: id.into(),
            airspace: self.clone(),
        }
    }

    /// Add an advertising, connectable peer that is out of range of every radio
    pub fn add_peer(&self, peer: PeerId, advertisement: Advertisement) {
        self.state.lock().peers.insert(
            peer,
            SimPeer {
                advertisement,
                rssi: HashMap::new(),
                connectable: true,
                bond: None,
                link: None,
                pairings: 0,
                services: Vec::new(),
                subscribed: BTreeSet::new(),
            },
        );
    }

    /// Give the peer a GATT service holding `characteristics`. Attribute
    /// handles are allocated in order, service first.
    pub fn add_gatt_service(&self, peer: PeerId, service: ServiceUuid, characteristics: &[ServiceUuid]) {
        let mut state = self.state.lock();
        let Some(p) = state.peers.get_mut(&peer) else {
            return;
        };
        let first = p.next_attribute();
        p.services.push(SimService {
            uuid: service,
            handle: AttributeHandle(first),
            characteristics: characteristics
                .iter()
                .zip(first + 1..)
                .map(|(uuid, h)| (*uuid, AttributeHandle(h)))
                .collect(),
        });
    }

    /// The peer notifies `value` on `characteristic`. Only delivered when
    /// the peer is connected and notifications are on; returns whether it was.
    pub fn notify_value(&self, peer: PeerId, characteristic: ServiceUuid, value: Vec<u8>) -> bool {
        let state = self.state.lock();
        let Some(p) = state.peers.get(&peer) else {
            return false;
        };
        let (Some((radio, handle)), Some(attribute)) = (&p.link, p.characteristic(characteristic)) else {
            return false;
        };
        if !p.subscribed.contains(&attribute) {
            return false;
        }
        state.notify(
            radio,
            RadioNotification::CharacteristicValue {
                handle: *handle,
                characteristic: attribute,
                value,
            },
        );
        true
    }

    /// Set the signal strength `radio` sees from `peer`; `None` is out of range.
    ///
    /// A scanning radio that can see the peer reports it straight away.
    pub fn set_rssi(&self, peer: PeerId, radio: &str, rssi: Option<i8>) {
        let mut state = self.state.lock();
        let Some(p) = state.peers.get_mut(&peer) else {
            return;
        };
        match rssi {
            Some(rssi) => {
                p.rssi.insert(radio.to_string(), rssi);
            }
            None => {
                p.rssi.remove(radio);
            }
        }
        state.report_if_scanning(radio, &peer);
    }

    /// Connect attempts to `peer` are accepted but never complete
    pub fn set_connectable(&self, peer: PeerId, connectable: bool) {
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            p.connectable = connectable;
        }
    }

    /// The peer forgets its bond, so a stored key no longer matches
    pub fn forget_bond(&self, peer: PeerId) {
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            p.bond = Some(KeyMaterial::new(rand::random::<[u8; 16]>().to_vec()));
        }
    }

    /// The peer drops its link (walks away, powers off)
    pub fn drop_link(&self, peer: PeerId) {
        self.state.lock().close_link(&peer, CloseReason::SupervisionTimeout);
    }

    /// Radio the peer is connected to
    pub fn connected_radio(&self, peer: &PeerId) -> Option<String> {
        self.state
            .lock()
            .peers
            .get(peer)
            .and_then(|p| p.link.as_ref().map(|(radio, _)| radio.clone()))
    }

    /// Full pairings the peer went through
    pub fn pairing_count(&self, peer: &PeerId) -> u32 {
        self.state
            .lock()
            .peers
            .get(peer)
            .map(|p| p.pairings)
            .unwrap_or(0)
    }

    /// Identity address a radio was told to use
    pub fn identity_of(&self, radio: &str) -> Option<PeerAddress> {
        self.state.lock().radios.get(radio).and_then(|r| r.identity)
    }
}

/// One simulated radio
pub struct LoopbackRadio {
    id: String,
    airspace: Airspace,
}

#[async_trait]
impl Transport for LoopbackRadio {
    fn transport_id(&self) -> String {
        self.id.clone()
    }

    async fn open(&mut self) -> Result<mpsc::Receiver<RadioNotification>, TransportError> {
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        let mut state = self.airspace.state.lock();
        state.radios.insert(
            self.id.clone(),
            SimRadio {
                notify: tx,
                scan: None,
                identity: None,
            },
        );
        debug!("loopback radio {} open", self.id);
        Ok(rx)
    }

    async fn send(&self, command: RadioCommand) -> Result<(), TransportError> {
        let radio = self.id.as_str();
        let mut state = self.airspace.state.lock();
        if !state.radios.contains_key(radio) {
            return Err(TransportError::ChannelFault(format!("{} is closed", radio)));
        }
        match command {
            RadioCommand::SetIdentityAddress { address } => {
                if let Some(r) = state.radios.get_mut(radio) {
                    r.identity = Some(address);
                }
            }
            RadioCommand::StartScan { mode } => {
                if let Some(r) = state.radios.get_mut(radio) {
                    r.scan = Some(mode);
                }
                let peers: Vec<PeerId> = state.peers.keys().copied().collect();
                for peer in peers {
                    state.report_if_scanning(radio, &peer);
                }
            }
            RadioCommand::StopScan => {
                if let Some(r) = state.radios.get_mut(radio) {
                    r.scan = None;
                }
            }
            RadioCommand::Connect { peer } => {
                let reachable = state
                    .peers
                    .get(&peer)
                    .map(|p| (p.link.is_none(), p.rssi.contains_key(radio), p.connectable));
                match reachable {
                    Some((true, true, true)) => {
                        state.next_handle += 1;
                        let handle = ConnectionHandle(state.next_handle);
                        if let Some(p) = state.peers.get_mut(&peer) {
                            p.link = Some((radio.to_string(), handle));
                        }
                        state.notify(radio, RadioNotification::ConnectionOpened { handle, peer });
                        state.notify(radio, RadioNotification::PairingKeyRequested { handle });
                    }
                    Some((_, _, false)) => {}
                    Some((false, _, _)) => {
                        return Err(TransportError::CommandRejected(format!(
                            "{} is already connected",
                            peer
                        )))
                    }
                    _ => state.notify(
                        radio,
                        RadioNotification::ConnectFailed {
                            peer,
                            reason: "peer out of range".to_string(),
                        },
                    ),
                }
            }
            RadioCommand::CancelConnect { .. } => {}
            RadioCommand::Disconnect { handle } => match state.peer_on_handle(radio, handle) {
                Some(peer) => state.close_link(&peer, CloseReason::LocalRequest),
                None => {
                    return Err(TransportError::CommandRejected(format!(
                        "unknown {}",
                        handle
                    )))
                }
            },
            RadioCommand::SampleRssi { handle } => {
                let Some(peer) = state.peer_on_handle(radio, handle) else {
                    return Err(TransportError::CommandRejected(format!("unknown {}", handle)));
                };
                match state.peers.get(&peer).and_then(|p| p.rssi.get(radio).copied()) {
                    Some(rssi) => state.notify(radio, RadioNotification::RssiSample { handle, rssi }),
                    None => state.close_link(&peer, CloseReason::SupervisionTimeout),
                }
            }
            RadioCommand::ProvideBondingData { handle, key } => {
                let Some(peer) = state.peer_on_handle(radio, handle) else {
                    return Ok(());
                };
                let stored = state.peers.get(&peer).and_then(|p| p.bond.clone());
                match (key, stored) {
                    (Some(offered), Some(stored)) if offered == stored => {
                        state.notify(radio, RadioNotification::LinkSecured { handle })
                    }
                    (Some(_), _) => state.notify(
                        radio,
                        RadioNotification::BondingFailed {
                            handle,
                            failure: BondingFailure::KeyMismatch,
                        },
                    ),
                    (None, _) => state.pair(radio, handle, peer),
                }
            }
            RadioCommand::RetryPairing { handle } => {
                if let Some(peer) = state.peer_on_handle(radio, handle) {
                    state.pair(radio, handle, peer);
                }
            }
            RadioCommand::DiscoverService { handle, service } => {
                let Some(peer) = state.peer_on_handle(radio, handle) else {
                    return Err(TransportError::CommandRejected(format!("unknown {}", handle)));
                };
                let found = state
                    .peers
                    .get(&peer)
                    .and_then(|p| p.services.iter().find(|s| s.uuid == service))
                    .map(|s| s.handle);
                match found {
                    Some(attribute) => state.notify(
                        radio,
                        RadioNotification::ServiceDiscovered {
                            handle,
                            service: attribute,
                        },
                    ),
                    None => state.gatt_failed(radio, handle, format!("service {} not found", service)),
                }
            }
            RadioCommand::DiscoverCharacteristic {
                handle,
                service,
                characteristic,
            } => {
                let Some(peer) = state.peer_on_handle(radio, handle) else {
                    return Err(TransportError::CommandRejected(format!("unknown {}", handle)));
                };
                let found = state
                    .peers
                    .get(&peer)
                    .and_then(|p| p.services.iter().find(|s| s.handle == service))
                    .and_then(|s| s.characteristics.iter().find(|(u, _)| *u == characteristic))
                    .map(|(_, h)| *h);
                match found {
                    Some(attribute) => state.notify(
                        radio,
                        RadioNotification::CharacteristicDiscovered {
                            handle,
                            characteristic: attribute,
                        },
                    ),
                    None => state.gatt_failed(
                        radio,
                        handle,
                        format!("characteristic {} not found in {}", characteristic, service),
                    ),
                }
            }
            RadioCommand::EnableNotifications {
                handle,
                characteristic,
            } => {
                let Some(peer) = state.peer_on_handle(radio, handle) else {
                    return Err(TransportError::CommandRejected(format!("unknown {}", handle)));
                };
                let Some(p) = state.peers.get_mut(&peer) else {
                    return Ok(());
                };
                let known = p
                    .services
                    .iter()
                    .any(|s| s.characteristics.iter().any(|(_, h)| *h == characteristic));
                if known {
                    p.subscribed.insert(characteristic);
                } else {
                    state.gatt_failed(radio, handle, format!("no characteristic at {}", characteristic));
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.airspace.state.lock();
        state.radios.remove(&self.id);
        for p in state.peers.values_mut() {
            if matches!(&p.link, Some((radio, _)) if *radio == self.id) {
                p.link = None;
                p.subscribed.clear();
            }
        }
        debug!("loopback radio {} closed", self.id);
    }
}
