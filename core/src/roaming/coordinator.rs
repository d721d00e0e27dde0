//! Network coordinator: the single decision loop of the roaming pool
//!
//! Every radio notification, external request and timer expiry is handled
//! here, one at a time. Nothing else mutates the registry or the bonding
//! store, so neither needs a lock.

use crate::config::{ConfigError, RoamingConfig};
use crate::roaming::assignment::{collect_candidates, greedy_assign};
use crate::roaming::event::{CoordinatorEvent, TimerEvent};
use crate::roaming::handoff::{HandoffDecision, HandoffEngine, SampleVerdict};
use crate::roaming::registry::{BondingStatus, ConnectionState, PeripheralRegistry};
use crate::roaming::timers::TimerQueue;
use crate::roaming::topology::{RoamEvent, TopologySignature, TopologySnapshot};
use crate::store::bonding::BondingStore;
use crate::transport::abstraction::{
    BondingFailure, CloseReason, ConnectionHandle, EndpointId, KeyMaterial, PeerId,
    RadioCommand, RadioNotification, ScanMode, Transport, TransportError,
};
use crate::transport::ble::advertisement::Advertisement;
use crate::transport::ble::gatt::{AttributeHandle, MeasurementTracker};
use crate::transport::ble::scanner::{ScanScheduler, WindowClose};
use crate::transport::endpoint::{spawn_endpoint, RadioEndpoint};
use crate::RoamError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of the observer broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A migration whose new connect has not completed yet
#[derive(Debug, Clone, Copy)]
struct HandoffInFlight {
    from: EndpointId,
    to: EndpointId,
}

pub struct NetworkCoordinator {
    config: RoamingConfig,
    endpoints: BTreeMap<EndpointId, RadioEndpoint>,
    registry: PeripheralRegistry,
    scheduler: ScanScheduler,
    handoff: HandoffEngine,
    gatt: MeasurementTracker,
    bonds: BondingStore,
    timers: TimerQueue,
    observers: broadcast::Sender<RoamEvent>,
    last_topology: Option<TopologySignature>,
    handoffs: HashMap<PeerId, HandoffInFlight>,
    pairing_retried: HashSet<PeerId>,
    /// A scan cycle fired while a window was open; run it once that closes
    cycle_pending: bool,
    next_attempt: u64,
    started: bool,
}

impl NetworkCoordinator {
    /// Build a coordinator over already-linked endpoints.
    ///
    /// Bonds are wiped first when `delete_bonds_on_start` is set.
    pub fn new(
        config: RoamingConfig,
        endpoints: Vec<RadioEndpoint>,
        mut bonds: BondingStore,
    ) -> Result<Self, RoamError> {
        config.validate()?;
        let endpoints: BTreeMap<EndpointId, RadioEndpoint> =
            endpoints.into_iter().map(|ep| (ep.id(), ep)).collect();
        let scheduler = ScanScheduler::new(config.scan_config(), endpoints.keys().copied())?;
        if config.delete_bonds_on_start {
            bonds.delete_all();
        }
        let (observers, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            registry: PeripheralRegistry::new(config.rssi_history_len),
            handoff: HandoffEngine::new(config.handoff_policy()),
            gatt: MeasurementTracker::new(config.measurement),
            config,
            endpoints,
            scheduler,
            bonds,
            timers: TimerQueue::new(),
            observers,
            last_topology: None,
            handoffs: HashMap::new(),
            pairing_retried: HashSet::new(),
            cycle_pending: false,
            next_attempt: 1,
            started: false,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &RoamingConfig {
        &self.config
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&RadioEndpoint> {
        self.endpoints.get(&id)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &RadioEndpoint> {
        self.endpoints.values()
    }

    pub fn registry(&self) -> &PeripheralRegistry {
        &self.registry
    }

    pub fn bonds(&self) -> &BondingStore {
        &self.bonds
    }

    pub fn handoff(&self) -> &HandoffEngine {
        &self.handoff
    }

    pub fn scheduler(&self) -> &ScanScheduler {
        &self.scheduler
    }

    pub fn gatt(&self) -> &MeasurementTracker {
        &self.gatt
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn topology(&self) -> TopologySnapshot {
        TopologySnapshot::capture(self.endpoints.values(), &self.registry)
    }

    /// Observe topology and handoff events
    pub fn subscribe(&self) -> broadcast::Receiver<RoamEvent> {
        self.observers.subscribe()
    }

    // ------------------------------------------------------------------
    // Driving the loop
    // ------------------------------------------------------------------

    /// Arm the periodic timers; the first discovery cycle runs at `now`.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        info!(
            "Roaming pool starting with {} endpoint(s), {} bond(s)",
            self.endpoints.len(),
            self.bonds.len()
        );
        self.timers.schedule(now, TimerEvent::ScanCycle);
        self.timers
            .schedule(now + self.config.rssi_period(), TimerEvent::RssiTick);
        self.publish_topology();
    }

    /// Pop the earliest timer and handle it at its deadline
    pub fn fire_next_timer(&mut self) -> Option<(Instant, TimerEvent)> {
        let (deadline, timer) = self.timers.pop_next()?;
        self.handle_event(CoordinatorEvent::Timer(timer.clone()), deadline);
        Some((deadline, timer))
    }

    /// Fire every timer due at or before `now`, each at its own deadline
    pub fn advance_to(&mut self, now: Instant) {
        while let Some(deadline) = self.timers.next_deadline() {
            if deadline > now {
                break;
            }
            self.fire_next_timer();
        }
    }

    /// Apply one event
    pub fn handle_event(&mut self, event: CoordinatorEvent, now: Instant) {
        trace!("event: {}", event);
        match event {
            CoordinatorEvent::Radio {
                endpoint,
                notification,
            } => self.on_notification(endpoint, notification, now),
            CoordinatorEvent::EndpointReady { endpoint } => self.on_endpoint_ready(endpoint),
            CoordinatorEvent::EndpointFault { endpoint, error } => {
                self.on_endpoint_fault(endpoint, error, now)
            }
            CoordinatorEvent::ResetEndpoint { endpoint } => self.reset_endpoint(endpoint),
            CoordinatorEvent::Timer(timer) => self.on_timer(timer, now),
            CoordinatorEvent::Shutdown => self.shutdown(),
        }
        self.publish_topology();
    }

    /// Run until `Shutdown` or until every event sender is gone.
    ///
    /// Returns the coordinator so its final state can be inspected.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<CoordinatorEvent>) -> Self {
        self.start(clock_now());
        loop {
            let next = match self.timers.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        event = events.recv() => event,
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                            let now = clock_now();
                            while let Some(timer) = self.timers.pop_due(now) {
                                self.handle_event(CoordinatorEvent::Timer(timer), now);
                            }
                            continue;
                        }
                    }
                }
                None => events.recv().await,
            };
            match next {
                Some(CoordinatorEvent::Shutdown) | None => break,
                Some(event) => self.handle_event(event, clock_now()),
            }
        }
        self.shutdown();
        self
    }

    /// Close every link and stop scanning
    fn shutdown(&mut self) {
        info!("Roaming pool shutting down");
        for ep in self.endpoints.values_mut() {
            if ep.fault().is_some() {
                continue;
            }
            ep.stop_scan();
            let handles: Vec<ConnectionHandle> = ep.links().map(|(h, _)| h).collect();
            for handle in handles {
                ep.disconnect(handle);
            }
        }
        self.timers = TimerQueue::new();
    }

    // ------------------------------------------------------------------
    // Endpoint lifecycle
    // ------------------------------------------------------------------

    fn on_endpoint_ready(&mut self, endpoint: EndpointId) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        if ep.fault().is_some() {
            ep.enable();
            self.scheduler.add_endpoint(endpoint);
            info!(endpoint = %endpoint, "endpoint recovered");
            self.emit(RoamEvent::EndpointRecovered { endpoint });
        } else {
            debug!(endpoint = %endpoint, "endpoint ready");
        }
    }

    fn on_endpoint_fault(&mut self, endpoint: EndpointId, error: TransportError, now: Instant) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        warn!(endpoint = %endpoint, "{}", RoamError::Transport(error.clone()));
        let lost = ep.disable(error.clone());

        self.scheduler.remove_endpoint(endpoint);
        self.handoff.drop_analyzer(endpoint);
        self.gatt.forget_endpoint(endpoint);
        self.timers.cancel_where(
            |t| matches!(t, TimerEvent::ConnectTimeout { endpoint: e, .. } if *e == endpoint),
        );

        let mut lost_served = false;
        for peer in lost {
            if self.registry.get(&peer).and_then(|d| d.assigned) != Some(endpoint) {
                continue;
            }
            if self
                .registry
                .get(&peer)
                .map(|d| matches!(d.state, ConnectionState::Served | ConnectionState::Analyzing))
                .unwrap_or(false)
            {
                lost_served = true;
            }
            self.release_peer(peer, now, "endpoint fault");
        }

        self.emit(RoamEvent::EndpointDisabled { endpoint, error });
        self.close_window_if_drained(now);
        if lost_served {
            self.start_discovery(now);
        }
    }

    /// Ask a disabled endpoint's driver to reopen its transport
    pub fn reset_endpoint(&mut self, endpoint: EndpointId) {
        match self.endpoints.get(&endpoint) {
            Some(ep) if ep.fault().is_some() => {
                info!(endpoint = %endpoint, "resetting endpoint");
                ep.request_reset();
            }
            Some(_) => debug!(endpoint = %endpoint, "reset ignored, endpoint is healthy"),
            None => warn!("reset for unknown endpoint {}", endpoint),
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn on_timer(&mut self, timer: TimerEvent, now: Instant) {
        match timer {
            TimerEvent::ScanCycle => {
                self.timers
                    .schedule(now + self.scheduler.config().period(), TimerEvent::ScanCycle);
                self.evict_stale(now);
                if self.scheduler.is_window_open() {
                    self.cycle_pending = true;
                }
                self.start_discovery(now);
            }
            TimerEvent::ScanWindowClosed { window_id } => {
                self.close_window(window_id, WindowClose::Deadline, now)
            }
            TimerEvent::RssiTick => {
                self.timers
                    .schedule(now + self.config.rssi_period(), TimerEvent::RssiTick);
                for ep in self.endpoints.values() {
                    if ep.fault().is_some() {
                        continue;
                    }
                    for (handle, _) in ep.links() {
                        ep.send(RadioCommand::SampleRssi { handle });
                    }
                }
            }
            TimerEvent::AnalysisClosed { peer, window_id } => {
                self.close_analysis(peer, window_id, now)
            }
            TimerEvent::ConnectTimeout {
                endpoint,
                peer,
                attempt,
            } => self.on_connect_timeout(endpoint, peer, attempt, now),
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        let Some(ttl) = self.config.stale_peer_ttl() else {
            return;
        };
        let evicted = self.registry.evict_stale(now, ttl);
        if !evicted.is_empty() {
            debug!("evicted {} stale peer(s)", evicted.len());
            for peer in &evicted {
                self.pairing_retried.remove(peer);
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery & assignment
    // ------------------------------------------------------------------

    fn idle_endpoints(&self) -> Vec<EndpointId> {
        self.endpoints
            .values()
            .filter(|ep| ep.is_idle())
            .map(|ep| ep.id())
            .collect()
    }

    /// Put every idle endpoint to discovery. Endpoints freed while a window
    /// is open join it and stop with it.
    fn start_discovery(&mut self, now: Instant) {
        let idle = self.idle_endpoints();
        if self.scheduler.is_window_open() {
            for id in self.scheduler.join_window(&idle) {
                debug!(endpoint = %id, "joining open scan window");
                if let Some(ep) = self.endpoints.get_mut(&id) {
                    ep.start_scan(ScanMode::Discovery);
                }
            }
            return;
        }
        let Some(window) = self.scheduler.open_window(&idle, now) else {
            return;
        };
        debug!(window = window.id, endpoints = window.endpoints.len(), "scan window opened");
        for id in &window.endpoints {
            if let Some(ep) = self.endpoints.get_mut(id) {
                ep.start_scan(ScanMode::Discovery);
            }
        }
        self.timers.schedule(
            window.deadline,
            TimerEvent::ScanWindowClosed {
                window_id: window.id,
            },
        );
    }

    fn close_window_if_drained(&mut self, now: Instant) {
        if self.scheduler.window_drained() {
            if let Some(id) = self.scheduler.window().map(|w| w.id) {
                self.close_window(id, WindowClose::Drained, now);
            }
        }
    }

    fn close_window(&mut self, window_id: u64, reason: WindowClose, now: Instant) {
        let Some(window) = self.scheduler.close_window(window_id) else {
            return;
        };
        self.timers.cancel_where(
            |t| matches!(t, TimerEvent::ScanWindowClosed { window_id: id } if *id == window_id),
        );
        for id in &window.endpoints {
            if let Some(ep) = self.endpoints.get_mut(id) {
                ep.stop_scan();
            }
        }
        debug!(window = window_id, ?reason, "scan window closed");
        self.assign(window.started_at, now);
        if std::mem::take(&mut self.cycle_pending) {
            self.start_discovery(now);
        }
    }

    /// Greedy pass over everything measured since `since`
    fn assign(&mut self, since: Instant, now: Instant) {
        let idle = self.idle_endpoints();
        if idle.is_empty() {
            return;
        }
        let chosen = greedy_assign(collect_candidates(&self.registry, &idle, since));
        for pick in chosen {
            info!(peer = %pick.peer, endpoint = %pick.endpoint, rssi = pick.rssi, "assigning peer");
            self.registry.mark_connecting(pick.peer, pick.endpoint, now);
            self.connect(pick.peer, pick.endpoint, now);
        }
    }

    /// Commit `endpoint` to connecting `peer`; the registry must already
    /// point the peer at it.
    fn connect(&mut self, peer: PeerId, endpoint: EndpointId, now: Instant) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.scheduler.stop_endpoint(endpoint);
        self.handoff.drop_analyzer(endpoint);
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.begin_connect(peer, attempt, now);
        }
        self.timers.schedule(
            now + self.config.connect_timeout(),
            TimerEvent::ConnectTimeout {
                endpoint,
                peer,
                attempt,
            },
        );
        self.close_window_if_drained(now);
    }

    fn on_connect_timeout(&mut self, endpoint: EndpointId, peer: PeerId, attempt: u64, now: Instant) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        match ep.pending() {
            Some(p) if p.attempt == attempt => {}
            _ => return,
        }
        ep.clear_pending(&peer);
        ep.send(RadioCommand::CancelConnect { peer });
        let error = RoamError::Timeout(self.config.connect_timeout());
        warn!(peer = %peer, endpoint = %endpoint, "connect abandoned: {}", error);
        self.connect_failed(peer, endpoint, error.to_string(), now);
    }

    /// Return a peer whose connect on `endpoint` failed to the pool
    fn connect_failed(&mut self, peer: PeerId, endpoint: EndpointId, reason: String, now: Instant) {
        if self.registry.get(&peer).and_then(|d| d.assigned) == Some(endpoint) {
            self.registry.mark_discovered(peer, now);
        }
        if let Some(inflight) = self.handoffs.remove(&peer) {
            warn!(peer = %peer, from = %inflight.from, to = %inflight.to, "handoff failed: {}", reason);
            self.emit(RoamEvent::HandoffFailed {
                peer,
                endpoint,
                reason,
            });
        }
    }

    /// The peer lost its endpoint for good (fault or close)
    fn release_peer(&mut self, peer: PeerId, now: Instant, reason: &str) {
        self.stop_analysis(&peer);
        let endpoint = self.registry.get(&peer).and_then(|d| d.assigned);
        if let (Some(endpoint), Some(_)) = (endpoint, self.handoffs.get(&peer)) {
            self.connect_failed(peer, endpoint, reason.to_string(), now);
        } else {
            self.registry.mark_discovered(peer, now);
        }
    }

    // ------------------------------------------------------------------
    // Radio notifications
    // ------------------------------------------------------------------

    fn on_notification(&mut self, endpoint: EndpointId, notification: RadioNotification, now: Instant) {
        if !self.endpoints.contains_key(&endpoint) {
            warn!("notification from unknown endpoint {}", endpoint);
            return;
        }
        match notification {
            RadioNotification::ScanReport {
                peer,
                rssi,
                advertisement,
            } => self.on_scan_report(endpoint, peer, rssi, &advertisement, now),
            RadioNotification::ConnectionOpened { handle, peer } => {
                self.on_connection_opened(endpoint, handle, peer, now)
            }
            RadioNotification::ConnectFailed { peer, reason } => {
                self.on_connect_failed(endpoint, peer, reason, now)
            }
            RadioNotification::ConnectionClosed { handle, reason } => {
                self.on_connection_closed(endpoint, handle, reason, now)
            }
            RadioNotification::RssiSample { handle, rssi } => {
                self.on_rssi_sample(endpoint, handle, rssi, now)
            }
            RadioNotification::PairingKeyRequested { handle } => {
                self.on_pairing_key_requested(endpoint, handle)
            }
            RadioNotification::PairingCompleted { handle, key } => {
                self.on_pairing_completed(endpoint, handle, key)
            }
            RadioNotification::BondingFailed { handle, failure } => {
                self.on_bonding_failed(endpoint, handle, failure)
            }
            RadioNotification::CommandRejected { command, reason } => {
                self.on_command_rejected(endpoint, command, reason, now)
            }
            RadioNotification::LinkSecured { handle } => self.on_link_secured(endpoint, handle),
            RadioNotification::ServiceDiscovered { handle, service } => {
                let next = self.gatt.service_discovered(endpoint, handle, service);
                self.send_gatt(endpoint, next);
            }
            RadioNotification::CharacteristicDiscovered {
                handle,
                characteristic,
            } => {
                let next = self.gatt.characteristic_discovered(endpoint, handle, characteristic);
                if next.is_some() {
                    debug!(endpoint = %endpoint, "subscribing to {} on {}", characteristic, handle);
                }
                self.send_gatt(endpoint, next);
            }
            RadioNotification::GattFailed { handle, reason } => {
                if let Some(stage) = self.gatt.forget(endpoint, handle) {
                    warn!(endpoint = %endpoint, ?stage, "GATT procedure failed on {}: {}", handle, reason);
                }
            }
            RadioNotification::CharacteristicValue {
                handle,
                characteristic,
                value,
            } => self.on_characteristic_value(endpoint, handle, characteristic, value),
        }
    }

    fn on_scan_report(
        &mut self,
        endpoint: EndpointId,
        peer: PeerId,
        rssi: i8,
        advertisement: &Advertisement,
        now: Instant,
    ) {
        let Some(ep) = self.endpoints.get(&endpoint) else {
            return;
        };
        if ep.analyzing() == Some(peer) {
            self.registry.observe(peer, endpoint, rssi, now);
            self.handoff.record(&peer, endpoint, rssi);
            return;
        }
        if !ep.is_scanning() {
            trace!(endpoint = %endpoint, peer = %peer, "scan report outside a window");
            return;
        }
        if let Some(service) = &self.config.service_filter {
            if !advertisement.advertises(service) {
                trace!(peer = %peer, "filtered, does not advertise {}", service);
                return;
            }
        }
        self.registry.observe(peer, endpoint, rssi, now);
    }

    fn on_connection_opened(
        &mut self,
        endpoint: EndpointId,
        handle: ConnectionHandle,
        peer: PeerId,
        now: Instant,
    ) {
        let assigned_here = self.registry.get(&peer).and_then(|d| d.assigned) == Some(endpoint);
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        let expected = assigned_here && matches!(ep.pending(), Some(p) if p.peer == peer);
        let pending = if expected { ep.clear_pending(&peer) } else { None };
        let Some(pending) = pending else {
            // Cancelled, timed out or reassigned meanwhile
            info!(peer = %peer, endpoint = %endpoint, "undoing stale connection {}", handle);
            ep.add_link(handle, peer);
            ep.disconnect(handle);
            return;
        };

        ep.add_link(handle, peer);
        self.timers.cancel_where(
            |t| matches!(t, TimerEvent::ConnectTimeout { attempt, .. } if *attempt == pending.attempt),
        );

        let gap = self
            .registry
            .unserved_since(&peer)
            .map(|since| now.saturating_duration_since(since));
        self.registry.mark_served(peer, endpoint, now);
        info!(peer = %peer, endpoint = %endpoint, "peer served");

        if self.handoffs.remove(&peer).is_some() {
            let gap = gap.unwrap_or(Duration::ZERO);
            info!(peer = %peer, endpoint = %endpoint, "handoff complete, unserved for {:?}", gap);
            self.emit(RoamEvent::HandoffCompleted {
                peer,
                endpoint,
                gap,
            });
        }
    }

    fn on_connect_failed(&mut self, endpoint: EndpointId, peer: PeerId, reason: String, now: Instant) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        let Some(pending) = ep.clear_pending(&peer) else {
            debug!(peer = %peer, endpoint = %endpoint, "late connect failure ignored");
            return;
        };
        self.timers.cancel_where(
            |t| matches!(t, TimerEvent::ConnectTimeout { attempt, .. } if *attempt == pending.attempt),
        );
        warn!(peer = %peer, endpoint = %endpoint, "connect failed: {}", reason);
        self.connect_failed(peer, endpoint, reason, now);
    }

    fn on_connection_closed(
        &mut self,
        endpoint: EndpointId,
        handle: ConnectionHandle,
        reason: CloseReason,
        now: Instant,
    ) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        let Some((peer, intentional)) = ep.remove_link(handle) else {
            debug!(endpoint = %endpoint, "close for unknown {}", handle);
            return;
        };
        self.gatt.forget(endpoint, handle);
        if self.registry.get(&peer).and_then(|d| d.assigned) != Some(endpoint) {
            // Already moved on (handoff source or undone connection)
            debug!(peer = %peer, endpoint = %endpoint, "released link closed");
            return;
        }
        if ep.handle_for(&peer).is_some() || matches!(ep.pending(), Some(p) if p.peer == peer) {
            debug!(peer = %peer, endpoint = %endpoint, "old link closed, peer reconnected here");
            return;
        }

        self.release_peer(peer, now, "connection closed");
        if intentional {
            debug!(peer = %peer, endpoint = %endpoint, "link closed on request");
        } else {
            warn!(peer = %peer, endpoint = %endpoint, ?reason, "peer disconnected unexpectedly");
            self.start_discovery(now);
        }
    }

    fn on_rssi_sample(&mut self, endpoint: EndpointId, handle: ConnectionHandle, rssi: i8, now: Instant) {
        let Some(peer) = self.live_peer(endpoint, handle) else {
            return;
        };
        self.registry.record_link_rssi(peer, endpoint, rssi, now);
        self.handoff.update_current(&peer, endpoint, rssi);

        match self.handoff.assess_sample(&peer, rssi) {
            SampleVerdict::Healthy | SampleVerdict::AlreadyAnalyzing => {}
            SampleVerdict::Disconnect => {
                warn!(peer = %peer, endpoint = %endpoint, rssi, "below disconnect floor, closing link");
                self.stop_analysis(&peer);
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.disconnect(handle);
                }
                self.registry.mark_discovered(peer, now);
            }
            SampleVerdict::Analyze => self.open_analysis(peer, endpoint, rssi, now),
        }
    }

    fn on_pairing_key_requested(&mut self, endpoint: EndpointId, handle: ConnectionHandle) {
        let Some(ep) = self.endpoints.get(&endpoint) else {
            return;
        };
        let Some(peer) = ep.peer_for(handle) else {
            ep.send(RadioCommand::ProvideBondingData { handle, key: None });
            return;
        };
        let key = match self.bonds.lookup(&peer) {
            Ok(key) => {
                debug!(peer = %peer, "reusing stored bond");
                self.registry.set_bonding(&peer, BondingStatus::Bonded);
                Some(key.clone())
            }
            Err(_) => {
                debug!(peer = %peer, "no bond, pairing from scratch");
                self.registry.set_bonding(&peer, BondingStatus::Pending);
                None
            }
        };
        ep.send(RadioCommand::ProvideBondingData { handle, key });
    }

    fn on_pairing_completed(&mut self, endpoint: EndpointId, handle: ConnectionHandle, key: KeyMaterial) {
        let Some(peer) = self.endpoints.get(&endpoint).and_then(|ep| ep.peer_for(handle)) else {
            warn!(endpoint = %endpoint, "pairing completed on unknown {}", handle);
            return;
        };
        info!(peer = %peer, endpoint = %endpoint, "pairing completed, bond stored");
        self.bonds.store(peer, key);
        self.registry.set_bonding(&peer, BondingStatus::Bonded);
        self.pairing_retried.remove(&peer);
    }

    fn on_bonding_failed(&mut self, endpoint: EndpointId, handle: ConnectionHandle, failure: BondingFailure) {
        let Some(ep) = self.endpoints.get(&endpoint) else {
            return;
        };
        let Some(peer) = ep.peer_for(handle) else {
            return;
        };
        match failure {
            BondingFailure::KeyMismatch if self.pairing_retried.insert(peer) => {
                warn!(peer = %peer, "{}, re-pairing once", RoamError::BondingConflict(peer));
                self.bonds.delete(&peer);
                self.registry.set_bonding(&peer, BondingStatus::Pending);
                ep.send(RadioCommand::RetryPairing { handle });
            }
            BondingFailure::KeyMismatch => {
                warn!(peer = %peer, "{}, retry already used", RoamError::BondingConflict(peer));
                self.registry.set_bonding(&peer, BondingStatus::None);
            }
            BondingFailure::Other(code) => {
                warn!(peer = %peer, code, "bonding failed");
                self.registry.set_bonding(&peer, BondingStatus::None);
            }
        }
    }

    /// Peer on an open link; links being closed do not count
    fn live_peer(&self, endpoint: EndpointId, handle: ConnectionHandle) -> Option<PeerId> {
        self.endpoints
            .get(&endpoint)?
            .links()
            .find(|(h, _)| *h == handle)
            .map(|(_, peer)| peer)
    }

    fn on_link_secured(&mut self, endpoint: EndpointId, handle: ConnectionHandle) {
        let Some(peer) = self.live_peer(endpoint, handle) else {
            return;
        };
        debug!(peer = %peer, endpoint = %endpoint, "link secured");
        let next = self.gatt.link_secured(endpoint, handle);
        self.send_gatt(endpoint, next);
    }

    fn send_gatt(&self, endpoint: EndpointId, command: Option<RadioCommand>) {
        if let (Some(command), Some(ep)) = (command, self.endpoints.get(&endpoint)) {
            ep.send(command);
        }
    }

    fn on_characteristic_value(
        &mut self,
        endpoint: EndpointId,
        handle: ConnectionHandle,
        characteristic: AttributeHandle,
        value: Vec<u8>,
    ) {
        let peer = self.live_peer(endpoint, handle);
        let profile = self.gatt.profile().copied();
        let (Some(peer), Some(profile)) = (peer, profile) else {
            return;
        };
        if !self.gatt.accepts(endpoint, handle, characteristic) {
            trace!(peer = %peer, "value on unsubscribed {}", characteristic);
            return;
        }
        let event = RoamEvent::Measurement {
            peer,
            endpoint,
            characteristic: profile.characteristic,
            value,
        };
        info!("{}", event);
        self.emit(event);
    }

    fn on_command_rejected(
        &mut self,
        endpoint: EndpointId,
        command: RadioCommand,
        reason: String,
        now: Instant,
    ) {
        let error = RoamError::CommandRejected(reason);
        debug!(endpoint = %endpoint, "{} -> {}", command, error);
        match command {
            RadioCommand::Connect { peer } => {
                let cleared = self
                    .endpoints
                    .get_mut(&endpoint)
                    .and_then(|ep| ep.clear_pending(&peer));
                if let Some(pending) = cleared {
                    self.timers.cancel_where(
                        |t| matches!(t, TimerEvent::ConnectTimeout { attempt, .. } if *attempt == pending.attempt),
                    );
                    warn!(peer = %peer, endpoint = %endpoint, "connect refused: {}", error);
                    self.connect_failed(peer, endpoint, error.to_string(), now);
                }
            }
            RadioCommand::StartScan { mode } => {
                if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                    ep.stop_scan();
                }
                match mode {
                    ScanMode::Discovery => {
                        self.scheduler.stop_endpoint(endpoint);
                        self.close_window_if_drained(now);
                    }
                    ScanMode::Targeted(_) => self.handoff.drop_analyzer(endpoint),
                }
            }
            RadioCommand::DiscoverService { handle, .. }
            | RadioCommand::DiscoverCharacteristic { handle, .. }
            | RadioCommand::EnableNotifications { handle, .. } => {
                self.gatt.forget(endpoint, handle);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Handoff
    // ------------------------------------------------------------------

    fn open_analysis(&mut self, peer: PeerId, serving: EndpointId, rssi: i8, now: Instant) {
        let analyzers: BTreeSet<EndpointId> = self
            .idle_endpoints()
            .into_iter()
            .filter(|id| *id != serving)
            .collect();
        let Some(window) = self.handoff.open(peer, serving, rssi, analyzers, now) else {
            debug!(peer = %peer, rssi, "weak link but no idle endpoint to analyse with");
            return;
        };
        info!(peer = %peer, endpoint = %serving, rssi, "weak link, analysing alternatives");
        for id in &window.analyzers {
            if let Some(ep) = self.endpoints.get_mut(id) {
                ep.start_scan(ScanMode::Targeted(peer));
            }
        }
        self.registry.set_analyzing(&peer, true);
        self.timers.schedule(
            window.deadline,
            TimerEvent::AnalysisClosed {
                peer,
                window_id: window.id,
            },
        );
    }

    /// Abort any analysis of `peer` and release its analysers
    fn stop_analysis(&mut self, peer: &PeerId) {
        let Some(window) = self.handoff.abort(peer) else {
            return;
        };
        self.timers.cancel_where(
            |t| matches!(t, TimerEvent::AnalysisClosed { window_id, .. } if *window_id == window.id),
        );
        for id in &window.analyzers {
            if let Some(ep) = self.endpoints.get_mut(id) {
                if ep.analyzing() == Some(*peer) {
                    ep.stop_scan();
                }
            }
        }
        self.registry.set_analyzing(peer, false);
    }

    fn close_analysis(&mut self, peer: PeerId, window_id: u64, now: Instant) {
        let Some((window, decision)) = self.handoff.close(&peer, window_id) else {
            return;
        };
        let serving = window.serving;
        for id in &window.analyzers {
            if let Some(ep) = self.endpoints.get_mut(id) {
                if ep.analyzing() == Some(peer) {
                    ep.stop_scan();
                }
            }
        }
        self.registry.set_analyzing(&peer, false);

        match decision {
            HandoffDecision::Stay { best, current } => {
                debug!(peer = %peer, ?best, current, "staying on {}", serving);
            }
            HandoffDecision::Migrate {
                from,
                to,
                best,
                current,
            } => self.migrate(peer, from, to, best, current, now),
        }
    }

    /// Disconnect from `from` and connect on `to`. The two commands are
    /// independent; the peer is unserved in between.
    fn migrate(&mut self, peer: PeerId, from: EndpointId, to: EndpointId, best: i8, current: i8, now: Instant) {
        let still_served = self.registry.get(&peer).map(|d| (d.assigned, d.state))
            == Some((Some(from), ConnectionState::Served));
        let target_idle = self.endpoints.get(&to).map(|ep| ep.is_idle()).unwrap_or(false);
        let handle = self.endpoints.get(&from).and_then(|ep| ep.handle_for(&peer));
        let (true, true, Some(handle)) = (still_served, target_idle, handle) else {
            debug!(peer = %peer, from = %from, to = %to, "handoff no longer applicable");
            return;
        };

        info!(peer = %peer, from = %from, to = %to, best, current, "handing off");
        if let Some(ep) = self.endpoints.get_mut(&from) {
            ep.disconnect(handle);
        }
        self.registry.begin_handoff(peer, to, now);
        self.handoffs.insert(peer, HandoffInFlight { from, to });
        self.connect(peer, to, now);
        self.emit(RoamEvent::HandoffStarted {
            peer,
            from,
            to,
            best,
            current,
        });
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    fn emit(&self, event: RoamEvent) {
        // Nobody listening is fine
        let _ = self.observers.send(event);
    }

    fn publish_topology(&mut self) {
        let snapshot = self.topology();
        let signature = snapshot.signature();
        if self.last_topology.as_ref() == Some(&signature) {
            return;
        }
        self.last_topology = Some(signature);
        debug!("topology: {}", snapshot);
        self.emit(RoamEvent::TopologyChanged(snapshot));
    }
}

fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// A running pool: one driver task per radio plus the coordinator loop
pub struct RoamingNetwork {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    observers: broadcast::Sender<RoamEvent>,
    endpoint_count: usize,
    coordinator: JoinHandle<NetworkCoordinator>,
    drivers: Vec<JoinHandle<()>>,
}

impl RoamingNetwork {
    /// Spawn a driver per transport (endpoint ids follow the vector order)
    /// and the coordinator loop. Must be called inside a tokio runtime.
    pub fn start(
        config: RoamingConfig,
        transports: Vec<Box<dyn Transport>>,
        bonds: BondingStore,
    ) -> Result<Self, RoamError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut endpoints = Vec::with_capacity(transports.len());
        let mut drivers = Vec::with_capacity(transports.len());
        for (index, transport) in transports.into_iter().enumerate() {
            let id = EndpointId(u16::try_from(index).map_err(|_| {
                RoamError::Config(ConfigError::InvalidValue {
                    field: "transports",
                    reason: "too many endpoints".to_string(),
                })
            })?);
            let transport_id = transport.transport_id();
            let (link, driver) = spawn_endpoint(
                id,
                transport,
                events_tx.clone(),
                config.boot_timeout(),
                config.identity_address,
            );
            endpoints.push(RadioEndpoint::new(id, transport_id, config.endpoint_capacity, link));
            drivers.push(driver);
        }

        let endpoint_count = endpoints.len();
        let coordinator = NetworkCoordinator::new(config, endpoints, bonds)?;
        let observers = coordinator.observers.clone();
        let coordinator = tokio::spawn(coordinator.run(events_rx));
        Ok(Self {
            events: events_tx,
            observers,
            endpoint_count,
            coordinator,
            drivers,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoamEvent> {
        self.observers.subscribe()
    }

    pub fn reset_endpoint(&self, endpoint: EndpointId) -> Result<(), RoamError> {
        if usize::from(endpoint.0) >= self.endpoint_count {
            return Err(RoamError::UnknownEndpoint(endpoint));
        }
        self.events
            .send(CoordinatorEvent::ResetEndpoint { endpoint })
            .map_err(|_| RoamError::Stopped)
    }

    /// Stop the loop and hand back its final state. The drivers stop once
    /// the returned coordinator (which owns their links) is dropped.
    pub async fn shutdown(self) -> Result<NetworkCoordinator, RoamError> {
        let (coordinator, _drivers) = self.finish().await?;
        Ok(coordinator)
    }

    /// Stop the loop and wait for every driver to close its transport
    pub async fn stop(self) -> Result<(), RoamError> {
        let (coordinator, drivers) = self.finish().await?;
        drop(coordinator);
        for driver in drivers {
            let _ = driver.await;
        }
        Ok(())
    }

    async fn finish(self) -> Result<(NetworkCoordinator, Vec<JoinHandle<()>>), RoamError> {
        let _ = self.events.send(CoordinatorEvent::Shutdown);
        drop(self.events);
        let coordinator = self.coordinator.await.map_err(|_| RoamError::Stopped)?;
        Ok((coordinator, self.drivers))
    }
}
