// Scenario tests for the roaming pool
//
// The coordinator is driven directly: radio notifications are injected with
// explicit instants and the commands it issues are read back from detached
// endpoint links.

use roampool_core::roaming::{ConnectionState, CoordinatorEvent, NetworkCoordinator, RoamEvent};
use roampool_core::transport::ble::advertisement::{Advertisement, ServiceUuid};
use roampool_core::transport::ble::gatt::{AttributeHandle, GattStage, HEART_RATE_MEASUREMENT};
use roampool_core::transport::endpoint::{DetachedCommands, EndpointLink, RadioEndpoint};
use roampool_core::transport::{
    BondingFailure, CloseReason, ConnectionHandle, EndpointId, EndpointState, KeyMaterial, PeerId,
    RadioCommand, RadioNotification, ScanMode, TransportError,
};
use roampool_core::store::{BondBackend, BondRecord};
use roampool_core::{BondStoreError, BondingStore, RoamingConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Pool {
    coordinator: NetworkCoordinator,
    commands: Vec<DetachedCommands>,
    events: broadcast::Receiver<RoamEvent>,
    t0: Instant,
}

impl Pool {
    fn new(endpoints: u16, config: RoamingConfig) -> Self {
        Self::with_bonds(endpoints, config, BondingStore::in_memory())
    }

    fn with_bonds(endpoints: u16, config: RoamingConfig, bonds: BondingStore) -> Self {
        let mut radios = Vec::new();
        let mut commands = Vec::new();
        for n in 0..endpoints {
            let (link, rx) = EndpointLink::detached();
            radios.push(RadioEndpoint::new(
                EndpointId(n),
                format!("radio{}", n),
                config.endpoint_capacity,
                link,
            ));
            commands.push(rx);
        }
        let coordinator = NetworkCoordinator::new(config, radios, bonds).unwrap();
        let events = coordinator.subscribe();
        Self {
            coordinator,
            commands,
            events,
            t0: Instant::now(),
        }
    }

    fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    /// Start the pool and run the first discovery cycle
    fn start(&mut self) {
        self.coordinator.start(self.t0);
        self.coordinator.advance_to(self.t0);
    }

    fn advance(&mut self, ms: u64) {
        let now = self.at(ms);
        self.coordinator.advance_to(now);
    }

    fn radio(&mut self, endpoint: u16, notification: RadioNotification, ms: u64) {
        let now = self.at(ms);
        self.coordinator.handle_event(
            CoordinatorEvent::Radio {
                endpoint: EndpointId(endpoint),
                notification,
            },
            now,
        );
    }

    fn report(&mut self, endpoint: u16, peer: PeerId, rssi: i8, ms: u64) {
        self.radio(
            endpoint,
            RadioNotification::ScanReport {
                peer,
                rssi,
                advertisement: Advertisement::default(),
            },
            ms,
        );
    }

    fn drain(&mut self, endpoint: u16) -> Vec<RadioCommand> {
        self.commands[usize::from(endpoint)].drain()
    }

    fn drain_all(&mut self) {
        for rx in &mut self.commands {
            rx.drain();
        }
    }

    fn state_of(&self, endpoint: u16) -> EndpointState {
        self.coordinator.endpoint(EndpointId(endpoint)).unwrap().state()
    }

    fn peer_state(&self, peer: &PeerId) -> (ConnectionState, Option<EndpointId>) {
        let device = self.coordinator.registry().get(peer).unwrap();
        (device.state, device.assigned)
    }

    /// Non-topology events published so far
    fn roam_events(&mut self) -> Vec<RoamEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if !matches!(event, RoamEvent::TopologyChanged(_)) {
                out.push(event);
            }
        }
        out
    }

    /// Discover `peer` on endpoint 0 and serve it there with `handle`
    fn serve_on_first(&mut self, peer: PeerId, handle: ConnectionHandle) {
        self.start();
        self.report(0, peer, -50, 1_000);
        self.advance(3_000);
        self.radio(0, RadioNotification::ConnectionOpened { handle, peer }, 3_100);
        self.drain_all();
    }
}

/// Backend whose disk is full: loads nothing, every write fails
struct FullDisk;

impl BondBackend for FullDisk {
    fn load(&self) -> Result<Vec<BondRecord>, BondStoreError> {
        Ok(Vec::new())
    }

    fn persist(&self, _records: &[BondRecord]) -> Result<(), BondStoreError> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
    }

    fn wipe(&self) -> Result<(), BondStoreError> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
    }

    fn describe(&self) -> String {
        "full disk".to_string()
    }
}

fn peer(n: u8) -> PeerId {
    PeerId::public([0xC0, 0, 0, 0, 0, n])
}

// ============================================================================
// Discovery and assignment
// ============================================================================

#[test]
fn scenario_a_strongest_endpoint_wins() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.start();
    for ep in 0..2 {
        assert_eq!(
            pool.drain(ep),
            vec![RadioCommand::StartScan {
                mode: ScanMode::Discovery
            }]
        );
        assert_eq!(pool.state_of(ep), EndpointState::Scanning);
    }

    pool.report(0, peer(1), -50, 1_000);
    pool.report(1, peer(1), -80, 1_200);
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));

    pool.advance(3_000);
    assert_eq!(
        pool.drain(0),
        vec![
            RadioCommand::StopScan,
            RadioCommand::Connect { peer: peer(1) }
        ]
    );
    assert_eq!(pool.drain(1), vec![RadioCommand::StopScan]);
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Connecting, Some(EndpointId(0)))
    );
    assert_eq!(pool.state_of(0), EndpointState::Connecting);
    assert_eq!(pool.state_of(1), EndpointState::Idle);

    pool.radio(
        0,
        RadioNotification::ConnectionOpened {
            handle: ConnectionHandle(1),
            peer: peer(1),
        },
        3_200,
    );
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Served, Some(EndpointId(0)))
    );
    assert_eq!(pool.state_of(0), EndpointState::Serving);
    assert_eq!(
        pool.coordinator.topology().endpoint_of(&peer(1)),
        Some(EndpointId(0))
    );
}

#[test]
fn scenario_d_one_idle_endpoint_takes_the_stronger_peer() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    pool.start();
    pool.drain_all();

    pool.report(0, peer(1), -55, 500);
    pool.report(0, peer(2), -70, 600);
    pool.advance(3_000);

    assert_eq!(
        pool.drain(0),
        vec![
            RadioCommand::StopScan,
            RadioCommand::Connect { peer: peer(1) }
        ]
    );
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Connecting, Some(EndpointId(0)))
    );
    assert_eq!(pool.peer_state(&peer(2)), (ConnectionState::Discovered, None));
}

#[test]
fn reports_outside_a_window_are_ignored() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    pool.start();
    pool.advance(3_000);
    pool.report(0, peer(1), -40, 4_000);
    assert!(pool.coordinator.registry().get(&peer(1)).is_none());
}

#[test]
fn service_filter_drops_other_advertisers() {
    let config = RoamingConfig {
        service_filter: Some(ServiceUuid::HEART_RATE),
        ..RoamingConfig::default()
    };
    let mut pool = Pool::new(1, config);
    pool.start();

    pool.report(0, peer(1), -40, 100);
    pool.radio(
        0,
        RadioNotification::ScanReport {
            peer: peer(2),
            rssi: -60,
            advertisement: Advertisement::from_services(vec![ServiceUuid::HEART_RATE]),
        },
        200,
    );

    assert!(pool.coordinator.registry().get(&peer(1)).is_none());
    assert_eq!(pool.peer_state(&peer(2)), (ConnectionState::Discovered, None));
}

#[test]
fn endpoint_freed_during_a_window_joins_it() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));

    // The periodic cycle puts the idle endpoint to discovery
    pool.advance(30_000);
    pool.drain_all();
    assert_eq!(pool.state_of(1), EndpointState::Scanning);
    let window = pool.coordinator.scheduler().window().cloned().unwrap();

    pool.radio(
        0,
        RadioNotification::ConnectionClosed {
            handle: ConnectionHandle(1),
            reason: CloseReason::SupervisionTimeout,
        },
        31_000,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::StartScan {
            mode: ScanMode::Discovery
        }]
    );
    assert_eq!(pool.state_of(0), EndpointState::Scanning);
    let joined = pool.coordinator.scheduler().window().cloned().unwrap();
    assert_eq!(joined.id, window.id);
    assert_eq!(joined.deadline, window.deadline);

    // The peer is heard again and taken back when the window closes
    pool.report(0, peer(1), -55, 32_000);
    pool.advance(33_000);
    assert_eq!(
        pool.drain(0),
        vec![
            RadioCommand::StopScan,
            RadioCommand::Connect { peer: peer(1) }
        ]
    );
    assert_eq!(pool.drain(1), vec![RadioCommand::StopScan]);
}

#[test]
fn scan_cycle_during_an_open_window_runs_after_it() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));

    // Unexpected loss at 29s opens a window that is still running at 30s
    pool.radio(
        0,
        RadioNotification::ConnectionClosed {
            handle: ConnectionHandle(1),
            reason: CloseReason::SupervisionTimeout,
        },
        29_000,
    );
    pool.advance(30_000);
    pool.drain_all();

    pool.advance(32_000);
    for ep in 0..2 {
        assert_eq!(
            pool.drain(ep),
            vec![
                RadioCommand::StopScan,
                RadioCommand::StartScan {
                    mode: ScanMode::Discovery
                }
            ]
        );
        assert_eq!(pool.state_of(ep), EndpointState::Scanning);
    }
    assert_eq!(
        pool.coordinator.scheduler().window().map(|w| w.deadline),
        Some(pool.at(35_000))
    );
}

// ============================================================================
// Handoff
// ============================================================================

#[test]
fn scenario_b_weak_link_migrates_to_better_endpoint() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.roam_events();

    pool.advance(10_000);
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::SampleRssi {
            handle: ConnectionHandle(1)
        }]
    );

    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -85,
        },
        10_050,
    );
    assert_eq!(
        pool.drain(1),
        vec![RadioCommand::StartScan {
            mode: ScanMode::Targeted(peer(1))
        }]
    );
    assert_eq!(pool.state_of(1), EndpointState::Analyzing);
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Analyzing, Some(EndpointId(0)))
    );
    assert_eq!(pool.coordinator.handoff().open_windows(), 1);

    pool.report(1, peer(1), -60, 11_000);
    pool.advance(13_050);

    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::Disconnect {
            handle: ConnectionHandle(1)
        }]
    );
    assert_eq!(
        pool.drain(1),
        vec![
            RadioCommand::StopScan,
            RadioCommand::Connect { peer: peer(1) }
        ]
    );
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Connecting, Some(EndpointId(1)))
    );
    assert_eq!(
        pool.roam_events(),
        vec![RoamEvent::HandoffStarted {
            peer: peer(1),
            from: EndpointId(0),
            to: EndpointId(1),
            best: -60,
            current: -85,
        }]
    );

    // The old link's close confirmation is not an unexpected loss
    pool.radio(
        0,
        RadioNotification::ConnectionClosed {
            handle: ConnectionHandle(1),
            reason: CloseReason::LocalRequest,
        },
        13_100,
    );
    assert_eq!(pool.state_of(0), EndpointState::Idle);
    assert!(pool.drain(0).is_empty());

    pool.radio(
        1,
        RadioNotification::ConnectionOpened {
            handle: ConnectionHandle(1),
            peer: peer(1),
        },
        13_300,
    );
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Served, Some(EndpointId(1)))
    );
    assert_eq!(
        pool.coordinator.topology().endpoint_of(&peer(1)),
        Some(EndpointId(1))
    );
    assert_eq!(
        pool.roam_events(),
        vec![RoamEvent::HandoffCompleted {
            peer: peer(1),
            endpoint: EndpointId(1),
            gap: Duration::from_millis(250),
        }]
    );
}

#[test]
fn analysis_without_a_better_signal_stays() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.advance(10_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -85,
        },
        10_000,
    );
    pool.report(1, peer(1), -85, 11_000);
    pool.drain_all();

    pool.advance(13_000);
    assert!(pool.drain(0).is_empty());
    assert_eq!(pool.drain(1), vec![RadioCommand::StopScan]);
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Served, Some(EndpointId(0)))
    );
    assert_eq!(pool.coordinator.handoff().open_windows(), 0);
}

#[test]
fn busy_analysis_window_keeps_the_serving_sample() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.advance(10_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -81,
        },
        10_050,
    );
    pool.drain_all();
    pool.roam_events();

    // More analyser reports than the per-peer history holds
    let history = pool.coordinator.config().rssi_history_len as u64;
    for n in 0..history + 4 {
        pool.report(1, peer(1), -95, 11_000 + n * 50);
    }
    assert_eq!(
        pool.coordinator.handoff().window(&peer(1)).map(|w| w.current),
        Some(-81)
    );

    pool.advance(13_050);
    assert!(pool.drain(0).is_empty());
    assert_eq!(pool.drain(1), vec![RadioCommand::StopScan]);
    assert!(pool.roam_events().is_empty());
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Served, Some(EndpointId(0)))
    );
}

#[test]
fn served_sample_during_analysis_updates_the_comparison() {
    let config = RoamingConfig {
        analysis_duration_ms: 8_000,
        rssi_period_ms: 5_000,
        ..RoamingConfig::default()
    };
    let mut pool = Pool::new(2, config);
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.advance(5_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -90,
        },
        5_010,
    );
    pool.report(1, peer(1), -84, 6_000);
    // The link recovers before the window closes
    pool.advance(10_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -70,
        },
        10_010,
    );
    pool.roam_events();

    pool.advance(13_010);
    assert!(pool.roam_events().is_empty());
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Served, Some(EndpointId(0)))
    );
}

#[test]
fn handoff_margin_must_be_exceeded() {
    let config = RoamingConfig {
        handoff_margin_db: 10,
        ..RoamingConfig::default()
    };
    let mut pool = Pool::new(2, config);
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.advance(10_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -85,
        },
        10_000,
    );
    // 10 dB better is not strictly more than the margin
    pool.report(1, peer(1), -75, 11_000);
    pool.advance(13_000);
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Served, Some(EndpointId(0)))
    );
}

#[test]
fn weak_link_without_idle_endpoints_is_not_analysed() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.advance(10_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -90,
        },
        10_000,
    );
    assert_eq!(pool.coordinator.handoff().open_windows(), 0);
    assert_eq!(
        pool.peer_state(&peer(1)),
        (ConnectionState::Served, Some(EndpointId(0)))
    );
}

#[test]
fn sample_below_floor_closes_the_link() {
    let config = RoamingConfig {
        rssi_disconnect_dbm: -95,
        ..RoamingConfig::default()
    };
    let mut pool = Pool::new(1, config);
    pool.serve_on_first(peer(1), ConnectionHandle(4));
    pool.advance(10_000);
    pool.drain_all();

    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(4),
            rssi: -100,
        },
        10_010,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::Disconnect {
            handle: ConnectionHandle(4)
        }]
    );
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));
}

#[test]
fn failed_handoff_connect_returns_peer_to_pool() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.advance(10_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -85,
        },
        10_000,
    );
    pool.report(1, peer(1), -60, 11_000);
    pool.advance(13_000);
    pool.roam_events();

    pool.radio(
        1,
        RadioNotification::ConnectFailed {
            peer: peer(1),
            reason: "no response".to_string(),
        },
        13_500,
    );
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));
    assert_eq!(
        pool.roam_events(),
        vec![RoamEvent::HandoffFailed {
            peer: peer(1),
            endpoint: EndpointId(1),
            reason: "no response".to_string(),
        }]
    );
}

// ============================================================================
// Bonding
// ============================================================================
// ============================================================================

#[test]
fn scenario_c_reconnect_reuses_stored_key() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));

    pool.radio(
        0,
        RadioNotification::PairingKeyRequested {
            handle: ConnectionHandle(1),
        },
        3_200,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::ProvideBondingData {
            handle: ConnectionHandle(1),
            key: None
        }]
    );

    let key = KeyMaterial::new(vec![0x5A; 16]);
    pool.radio(
        0,
        RadioNotification::PairingCompleted {
            handle: ConnectionHandle(1),
            key: key.clone(),
        },
        3_400,
    );
    assert!(pool.coordinator.bonds().contains(&peer(1)));

    // Peer walks away and comes back
    pool.radio(
        0,
        RadioNotification::ConnectionClosed {
            handle: ConnectionHandle(1),
            reason: CloseReason::SupervisionTimeout,
        },
        5_000,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::StartScan {
            mode: ScanMode::Discovery
        }]
    );
    pool.report(0, peer(1), -52, 6_000);
    pool.advance(8_000);
    pool.radio(
        0,
        RadioNotification::ConnectionOpened {
            handle: ConnectionHandle(2),
            peer: peer(1),
        },
        8_100,
    );
    pool.drain_all();

    pool.radio(
        0,
        RadioNotification::PairingKeyRequested {
            handle: ConnectionHandle(2),
        },
        8_200,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::ProvideBondingData {
            handle: ConnectionHandle(2),
            key: Some(key)
        }]
    );
    assert_eq!(pool.coordinator.bonds().len(), 1);
}

#[test]
fn bonding_conflict_retries_pairing_once() {
    let mut bonds = BondingStore::in_memory();
    bonds.store(peer(1), KeyMaterial::new(vec![1; 16]));
    let mut pool = Pool::with_bonds(1, RoamingConfig::default(), bonds);
    pool.serve_on_first(peer(1), ConnectionHandle(1));

    pool.radio(
        0,
        RadioNotification::PairingKeyRequested {
            handle: ConnectionHandle(1),
        },
        3_200,
    );
    pool.drain_all();

    let mismatch = RadioNotification::BondingFailed {
        handle: ConnectionHandle(1),
        failure: BondingFailure::KeyMismatch,
    };
    pool.radio(0, mismatch.clone(), 3_300);
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::RetryPairing {
            handle: ConnectionHandle(1)
        }]
    );
    assert!(!pool.coordinator.bonds().contains(&peer(1)));

    pool.radio(0, mismatch, 3_400);
    assert!(pool.drain(0).is_empty());

    // A fresh pairing still gets stored
    pool.radio(
        0,
        RadioNotification::PairingCompleted {
            handle: ConnectionHandle(1),
            key: KeyMaterial::new(vec![2; 16]),
        },
        3_500,
    );
    assert!(pool.coordinator.bonds().contains(&peer(1)));
}

#[test]
fn delete_bonds_on_start_wipes_the_store() {
    let mut bonds = BondingStore::in_memory();
    bonds.store(peer(1), KeyMaterial::new(vec![1; 16]));
    let config = RoamingConfig {
        delete_bonds_on_start: true,
        ..RoamingConfig::default()
    };
    let pool = Pool::with_bonds(1, config, bonds);
    assert!(pool.coordinator.bonds().is_empty());
}

#[test]
fn unwritable_bond_store_keeps_pairing_in_memory() {
    let bonds = BondingStore::open_or_degraded(Arc::new(FullDisk));
    assert!(!bonds.is_degraded());

    let mut pool = Pool::with_bonds(1, RoamingConfig::default(), bonds);
    let link = ConnectionHandle(1);
    pool.serve_on_first(peer(1), link);

    let key = KeyMaterial::new(vec![0x5A; 16]);
    pool.radio(
        0,
        RadioNotification::PairingCompleted {
            handle: link,
            key: key.clone(),
        },
        3_400,
    );
    assert!(pool.coordinator.bonds().is_degraded());
    assert!(pool.coordinator.bonds().contains(&peer(1)));
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Served, Some(EndpointId(0))));

    // The in-memory bond still answers key requests
    pool.radio(0, RadioNotification::PairingKeyRequested { handle: link }, 3_500);
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::ProvideBondingData {
            handle: link,
            key: Some(key)
        }]
    );
}

// ============================================================================
// Measurement subscription
// ============================================================================

/// Serve `peer` on endpoint 0 and walk its link through to a subscription
fn subscribe_on_first(pool: &mut Pool, peer: PeerId, handle: ConnectionHandle) {
    pool.serve_on_first(peer, handle);
    pool.radio(0, RadioNotification::LinkSecured { handle }, 3_200);
    pool.radio(
        0,
        RadioNotification::ServiceDiscovered {
            handle,
            service: AttributeHandle(0x10),
        },
        3_250,
    );
    pool.radio(
        0,
        RadioNotification::CharacteristicDiscovered {
            handle,
            characteristic: AttributeHandle(0x12),
        },
        3_300,
    );
    pool.drain_all();
}

#[test]
fn secured_link_subscribes_to_heart_rate() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    let link = ConnectionHandle(1);
    pool.serve_on_first(peer(1), link);

    pool.radio(0, RadioNotification::LinkSecured { handle: link }, 3_200);
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::DiscoverService {
            handle: link,
            service: ServiceUuid::HEART_RATE,
        }]
    );

    pool.radio(
        0,
        RadioNotification::ServiceDiscovered {
            handle: link,
            service: AttributeHandle(0x10),
        },
        3_250,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::DiscoverCharacteristic {
            handle: link,
            service: AttributeHandle(0x10),
            characteristic: HEART_RATE_MEASUREMENT,
        }]
    );

    pool.radio(
        0,
        RadioNotification::CharacteristicDiscovered {
            handle: link,
            characteristic: AttributeHandle(0x12),
        },
        3_300,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::EnableNotifications {
            handle: link,
            characteristic: AttributeHandle(0x12),
        }]
    );

    pool.radio(
        0,
        RadioNotification::CharacteristicValue {
            handle: link,
            characteristic: AttributeHandle(0x12),
            value: vec![0x00, 64],
        },
        4_000,
    );
    assert_eq!(
        pool.roam_events(),
        vec![RoamEvent::Measurement {
            peer: peer(1),
            endpoint: EndpointId(0),
            characteristic: HEART_RATE_MEASUREMENT,
            value: vec![0x00, 64],
        }]
    );
}

#[test]
fn values_outside_the_subscription_are_dropped() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    let link = ConnectionHandle(1);
    subscribe_on_first(&mut pool, peer(1), link);
    pool.roam_events();

    // Another characteristic on the same link
    pool.radio(
        0,
        RadioNotification::CharacteristicValue {
            handle: link,
            characteristic: AttributeHandle(0x20),
            value: vec![0x00, 64],
        },
        4_000,
    );
    // A link nobody opened
    pool.radio(
        0,
        RadioNotification::CharacteristicValue {
            handle: ConnectionHandle(9),
            characteristic: AttributeHandle(0x12),
            value: vec![0x00, 64],
        },
        4_010,
    );
    assert!(pool.roam_events().is_empty());
}

#[test]
fn closed_link_forgets_its_subscription() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    let link = ConnectionHandle(1);
    subscribe_on_first(&mut pool, peer(1), link);
    assert_eq!(
        pool.coordinator.gatt().stage(EndpointId(0), link),
        Some(GattStage::Subscribed {
            characteristic: AttributeHandle(0x12)
        })
    );

    pool.radio(
        0,
        RadioNotification::ConnectionClosed {
            handle: link,
            reason: CloseReason::SupervisionTimeout,
        },
        4_000,
    );
    assert_eq!(pool.coordinator.gatt().stage(EndpointId(0), link), None);
    pool.roam_events();

    // A late value on the old handle is not reported
    pool.radio(
        0,
        RadioNotification::CharacteristicValue {
            handle: link,
            characteristic: AttributeHandle(0x12),
            value: vec![0x00, 64],
        },
        4_010,
    );
    assert!(pool
        .roam_events()
        .iter()
        .all(|event| !matches!(event, RoamEvent::Measurement { .. })));
}

#[test]
fn failed_lookup_leaves_the_link_served() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    let link = ConnectionHandle(1);
    pool.serve_on_first(peer(1), link);
    pool.radio(0, RadioNotification::LinkSecured { handle: link }, 3_200);
    pool.drain_all();

    pool.radio(
        0,
        RadioNotification::GattFailed {
            handle: link,
            reason: "service 180d not offered".to_string(),
        },
        3_250,
    );
    assert_eq!(pool.coordinator.gatt().stage(EndpointId(0), link), None);
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Served, Some(EndpointId(0))));
    assert!(pool.drain(0).is_empty());

    // A rejected lookup is forgotten the same way
    pool.radio(0, RadioNotification::LinkSecured { handle: link }, 3_300);
    pool.radio(
        0,
        RadioNotification::CommandRejected {
            command: RadioCommand::DiscoverService {
                handle: link,
                service: ServiceUuid::HEART_RATE,
            },
            reason: "busy".to_string(),
        },
        3_310,
    );
    assert_eq!(pool.coordinator.gatt().stage(EndpointId(0), link), None);
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Served, Some(EndpointId(0))));
}

#[test]
fn disabled_measurement_never_subscribes() {
    let config = RoamingConfig {
        measurement: None,
        ..RoamingConfig::default()
    };
    let mut pool = Pool::new(1, config);
    let link = ConnectionHandle(1);
    pool.serve_on_first(peer(1), link);

    pool.radio(0, RadioNotification::LinkSecured { handle: link }, 3_200);
    assert!(pool.drain(0).is_empty());
}

// ============================================================================
// Failure handling
// ============================================================================

#[test]
fn connect_timeout_reclaims_endpoint_and_undoes_late_success() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    pool.start();
    pool.report(0, peer(1), -50, 1_000);
    pool.advance(3_000);
    pool.drain_all();

    pool.advance(6_000);
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::CancelConnect { peer: peer(1) }]
    );
    assert_eq!(pool.state_of(0), EndpointState::Idle);
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));

    pool.radio(
        0,
        RadioNotification::ConnectionOpened {
            handle: ConnectionHandle(5),
            peer: peer(1),
        },
        6_500,
    );
    assert_eq!(
        pool.drain(0),
        vec![RadioCommand::Disconnect {
            handle: ConnectionHandle(5)
        }]
    );
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));

    pool.radio(
        0,
        RadioNotification::ConnectionClosed {
            handle: ConnectionHandle(5),
            reason: CloseReason::LocalRequest,
        },
        6_600,
    );
    assert_eq!(pool.state_of(0), EndpointState::Idle);
    assert!(pool.drain(0).is_empty());
}

#[test]
fn rejected_connect_returns_peer_to_pool() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    pool.start();
    pool.report(0, peer(1), -50, 1_000);
    pool.advance(3_000);

    pool.radio(
        0,
        RadioNotification::CommandRejected {
            command: RadioCommand::Connect { peer: peer(1) },
            reason: "busy".to_string(),
        },
        3_010,
    );
    assert_eq!(pool.state_of(0), EndpointState::Idle);
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));
    assert!(!pool.coordinator.timers().is_empty());
}

#[test]
fn endpoint_fault_releases_peers_until_reset() {
    let mut pool = Pool::new(2, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));
    pool.roam_events();

    let error = TransportError::ChannelFault("unplugged".to_string());
    pool.coordinator.handle_event(
        CoordinatorEvent::EndpointFault {
            endpoint: EndpointId(0),
            error: error.clone(),
        },
        pool.at(4_000),
    );
    assert_eq!(pool.state_of(0), EndpointState::Disabled);
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));
    assert_eq!(
        pool.roam_events(),
        vec![RoamEvent::EndpointDisabled {
            endpoint: EndpointId(0),
            error
        }]
    );
    // Coverage is restored on the healthy endpoint right away
    assert_eq!(
        pool.drain(1),
        vec![RadioCommand::StartScan {
            mode: ScanMode::Discovery
        }]
    );

    // Disabled endpoints are skipped by the periodic cycle
    pool.advance(30_000);
    assert!(pool.drain(0).is_empty());

    pool.coordinator.handle_event(
        CoordinatorEvent::ResetEndpoint {
            endpoint: EndpointId(0),
        },
        pool.at(31_000),
    );
    pool.coordinator.handle_event(
        CoordinatorEvent::EndpointReady {
            endpoint: EndpointId(0),
        },
        pool.at(31_100),
    );
    assert_eq!(pool.state_of(0), EndpointState::Idle);
    assert_eq!(
        pool.roam_events(),
        vec![RoamEvent::EndpointRecovered {
            endpoint: EndpointId(0)
        }]
    );
}

#[test]
fn topology_is_published_when_assignments_change() {
    let mut pool = Pool::new(1, RoamingConfig::default());
    pool.serve_on_first(peer(1), ConnectionHandle(1));

    let mut last = None;
    while let Ok(event) = pool.events.try_recv() {
        if let RoamEvent::TopologyChanged(snapshot) = event {
            last = Some(snapshot);
        }
    }
    let snapshot = last.unwrap();
    assert_eq!(snapshot.endpoint_of(&peer(1)), Some(EndpointId(0)));
    assert_eq!(
        snapshot.endpoints[&EndpointId(0)].state,
        EndpointState::Serving
    );

    // An RSSI sample alone does not republish
    pool.advance(10_000);
    pool.radio(
        0,
        RadioNotification::RssiSample {
            handle: ConnectionHandle(1),
            rssi: -52,
        },
        10_010,
    );
    assert!(pool.events.try_recv().is_err());
}

#[test]
fn stale_unassigned_peers_are_evicted() {
    let config = RoamingConfig {
        stale_peer_ttl_secs: Some(40),
        ..RoamingConfig::default()
    };
    let mut pool = Pool::new(1, config);
    pool.start();
    pool.report(0, peer(1), -50, 1_000);
    pool.advance(3_000);
    // Connect never completes
    pool.advance(6_000);
    assert_eq!(pool.peer_state(&peer(1)), (ConnectionState::Discovered, None));

    pool.advance(60_000);
    assert!(pool.coordinator.registry().get(&peer(1)).is_none());
}
