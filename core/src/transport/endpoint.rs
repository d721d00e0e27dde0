//! Radio endpoint adapter
//!
//! Each radio gets one driver task that owns its `Transport`: it forwards
//! notifications into the coordinator's merged event stream and executes the
//! coordinator's fire-and-forget commands. The coordinator keeps a
//! `RadioEndpoint` per radio describing what that radio is doing.

use crate::roaming::event::CoordinatorEvent;
use crate::transport::abstraction::{
    ConnectionHandle, EndpointId, PeerAddress, PeerId, RadioCommand, RadioNotification,
    ScanMode, Transport, TransportError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Externally visible endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointState {
    /// Free capacity, nothing in flight
    Idle,
    /// Part of a discovery window
    Scanning,
    /// A connect is in flight
    Connecting,
    /// At capacity
    Serving,
    /// Measuring one peer for a handoff decision
    Analyzing,
    /// Transport fault, waiting for a reset
    Disabled,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Serving => write!(f, "Serving"),
            Self::Analyzing => write!(f, "Analyzing"),
            Self::Disabled => write!(f, "Disabled"),
        }
    }
}

enum DriverMessage {
    Command(RadioCommand),
    Reset,
}

/// Sending side of an endpoint driver
#[derive(Clone)]
pub struct EndpointLink {
    tx: mpsc::UnboundedSender<DriverMessage>,
}

impl EndpointLink {
    /// Queue a command; never blocks
    pub fn send(&self, command: RadioCommand) -> Result<(), TransportError> {
        self.tx
            .send(DriverMessage::Command(command))
            .map_err(|_| TransportError::ChannelFault("endpoint driver stopped".to_string()))
    }

    /// Ask the driver to reopen its transport
    pub fn reset(&self) -> Result<(), TransportError> {
        self.tx
            .send(DriverMessage::Reset)
            .map_err(|_| TransportError::ChannelFault("endpoint driver stopped".to_string()))
    }

    /// A link whose commands land in a plain receiver, for driving the
    /// coordinator without radios.
    pub fn detached() -> (Self, DetachedCommands) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DetachedCommands { rx })
    }
}

/// Receiving side of a detached link
pub struct DetachedCommands {
    rx: mpsc::UnboundedReceiver<DriverMessage>,
}

impl DetachedCommands {
    /// Drain every command queued so far; resets are skipped
    pub fn drain(&mut self) -> Vec<RadioCommand> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            if let DriverMessage::Command(command) = message {
                out.push(command);
            }
        }
        out
    }
}

/// A connect that has been issued but not completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConnect {
    pub peer: PeerId,
    pub attempt: u64,
    pub started_at: Instant,
}

/// Coordinator-side model of one radio
pub struct RadioEndpoint {
    id: EndpointId,
    transport_id: String,
    capacity: usize,
    link: EndpointLink,
    scanning: bool,
    analyzing: Option<PeerId>,
    pending: Option<PendingConnect>,
    links: BTreeMap<ConnectionHandle, PeerId>,
    closing: BTreeMap<ConnectionHandle, PeerId>,
    fault: Option<TransportError>,
}

impl RadioEndpoint {
    pub fn new(id: EndpointId, transport_id: impl Into<String>, capacity: usize, link: EndpointLink) -> Self {
        Self {
            id,
            transport_id: transport_id.into(),
            capacity: capacity.max(1),
            link,
            scanning: false,
            analyzing: None,
            pending: None,
            links: BTreeMap::new(),
            closing: BTreeMap::new(),
            fault: None,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current state, derived from what the endpoint is doing
    pub fn state(&self) -> EndpointState {
        if self.fault.is_some() {
            EndpointState::Disabled
        } else if self.pending.is_some() {
            EndpointState::Connecting
        } else if self.analyzing.is_some() {
            EndpointState::Analyzing
        } else if self.scanning {
            EndpointState::Scanning
        } else if self.occupied() >= self.capacity {
            EndpointState::Serving
        } else {
            EndpointState::Idle
        }
    }

    /// Links counted against capacity: open, closing and in flight
    pub fn occupied(&self) -> usize {
        self.links.len() + self.closing.len() + usize::from(self.pending.is_some())
    }

    pub fn is_idle(&self) -> bool {
        self.state() == EndpointState::Idle
    }

    pub fn fault(&self) -> Option<&TransportError> {
        self.fault.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingConnect> {
        self.pending.as_ref()
    }

    pub fn analyzing(&self) -> Option<PeerId> {
        self.analyzing
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Peers with an open (not closing) connection
    pub fn served_peers(&self) -> Vec<PeerId> {
        self.links.values().copied().collect()
    }

    pub fn links(&self) -> impl Iterator<Item = (ConnectionHandle, PeerId)> + '_ {
        self.links.iter().map(|(h, p)| (*h, *p))
    }

    pub fn handle_for(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        self.links
            .iter()
            .find(|(_, p)| *p == peer)
            .map(|(h, _)| *h)
    }

    /// Peer behind an open or closing handle
    pub fn peer_for(&self, handle: ConnectionHandle) -> Option<PeerId> {
        self.links
            .get(&handle)
            .or_else(|| self.closing.get(&handle))
            .copied()
    }

    /// Queue a command for the radio. Returns `false` when the driver is gone.
    pub fn send(&self, command: RadioCommand) -> bool {
        match self.link.send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %self.id, "command dropped: {}", e);
                false
            }
        }
    }

    pub fn start_scan(&mut self, mode: ScanMode) {
        if let ScanMode::Targeted(peer) = mode {
            self.analyzing = Some(peer);
        } else {
            self.scanning = true;
        }
        self.send(RadioCommand::StartScan { mode });
    }

    /// Stop any scan; a no-op when not scanning
    pub fn stop_scan(&mut self) {
        if self.scanning || self.analyzing.is_some() {
            self.scanning = false;
            self.analyzing = None;
            self.send(RadioCommand::StopScan);
        }
    }

    /// Commit to a connect: scanning stops first
    pub fn begin_connect(&mut self, peer: PeerId, attempt: u64, now: Instant) {
        self.stop_scan();
        self.pending = Some(PendingConnect {
            peer,
            attempt,
            started_at: now,
        });
        self.send(RadioCommand::Connect { peer });
    }

    /// Clear the pending connect for `peer`, if it is the one in flight
    pub fn clear_pending(&mut self, peer: &PeerId) -> Option<PendingConnect> {
        match self.pending {
            Some(p) if p.peer == *peer => self.pending.take(),
            _ => None,
        }
    }

    /// Record an open connection
    pub fn add_link(&mut self, handle: ConnectionHandle, peer: PeerId) {
        self.links.insert(handle, peer);
    }

    /// Ask the radio to close `handle`; the slot stays occupied until the
    /// close notification arrives.
    pub fn disconnect(&mut self, handle: ConnectionHandle) {
        if let Some(peer) = self.links.remove(&handle) {
            self.closing.insert(handle, peer);
        }
        self.send(RadioCommand::Disconnect { handle });
    }

    /// Forget a closed handle. Returns the peer and whether we asked for it.
    pub fn remove_link(&mut self, handle: ConnectionHandle) -> Option<(PeerId, bool)> {
        if let Some(peer) = self.closing.remove(&handle) {
            return Some((peer, true));
        }
        self.links.remove(&handle).map(|peer| (peer, false))
    }

    /// Transport fault: everything the endpoint had is gone
    pub fn disable(&mut self, error: TransportError) -> Vec<PeerId> {
        self.fault = Some(error);
        self.scanning = false;
        self.analyzing = None;
        let mut lost: Vec<PeerId> = self.links.values().copied().collect();
        if let Some(pending) = self.pending.take() {
            lost.push(pending.peer);
        }
        self.links.clear();
        self.closing.clear();
        lost
    }

    pub fn request_reset(&self) -> bool {
        match self.link.reset() {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %self.id, "reset dropped: {}", e);
                false
            }
        }
    }

    /// The transport reopened
    pub fn enable(&mut self) {
        self.fault = None;
    }
}

enum ServeExit {
    CoordinatorGone,
    Reset,
    Fault(TransportError),
}

/// Spawn the driver task for one radio.
///
/// The driver opens the transport (bounded by `boot_timeout`), adopts the
/// shared identity address, then shuttles commands and notifications until
/// the coordinator goes away. After a fault it drops commands until a reset.
pub fn spawn_endpoint(
    id: EndpointId,
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    boot_timeout: Duration,
    identity: Option<PeerAddress>,
) -> (EndpointLink, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_driver(id, transport, rx, events, boot_timeout, identity));
    (EndpointLink { tx }, handle)
}

async fn run_driver(
    id: EndpointId,
    mut transport: Box<dyn Transport>,
    mut control: mpsc::UnboundedReceiver<DriverMessage>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    boot_timeout: Duration,
    identity: Option<PeerAddress>,
) {
    let transport_id = transport.transport_id();
    loop {
        let opened = match tokio::time::timeout(boot_timeout, transport.open()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(boot_timeout)),
        };

        let exit = match opened {
            Ok(notifications) => {
                info!(endpoint = %id, transport = %transport_id, "endpoint booted");
                if events.send(CoordinatorEvent::EndpointReady { endpoint: id }).is_err() {
                    transport.close().await;
                    return;
                }
                let identity_result = match identity {
                    Some(address) => transport
                        .send(RadioCommand::SetIdentityAddress { address })
                        .await,
                    None => Ok(()),
                };
                match identity_result {
                    Ok(()) => serve(id, transport.as_ref(), &mut control, notifications, &events).await,
                    Err(e) => ServeExit::Fault(e),
                }
            }
            Err(e) => ServeExit::Fault(e),
        };

        transport.close().await;
        match exit {
            ServeExit::CoordinatorGone => return,
            ServeExit::Reset => {
                info!(endpoint = %id, "reopening transport");
                continue;
            }
            ServeExit::Fault(error) => {
                warn!(endpoint = %id, transport = %transport_id, "transport fault: {}", error);
                if events
                    .send(CoordinatorEvent::EndpointFault {
                        endpoint: id,
                        error,
                    })
                    .is_err()
                {
                    return;
                }
            }
        }

        // Disabled until somebody asks for a reset
        loop {
            match control.recv().await {
                Some(DriverMessage::Reset) => break,
                Some(DriverMessage::Command(command)) => {
                    debug!(endpoint = %id, "dropping {} while disabled", command);
                }
                None => return,
            }
        }
    }
}

async fn serve(
    id: EndpointId,
    transport: &dyn Transport,
    control: &mut mpsc::UnboundedReceiver<DriverMessage>,
    mut notifications: mpsc::Receiver<RadioNotification>,
    events: &mpsc::UnboundedSender<CoordinatorEvent>,
) -> ServeExit {
    loop {
        tokio::select! {
            message = control.recv() => match message {
                Some(DriverMessage::Command(command)) => {
                    debug!(endpoint = %id, "-> {}", command);
                    match transport.send(command.clone()).await {
                        Ok(()) => {}
                        Err(TransportError::CommandRejected(reason)) => {
                            let notification = RadioNotification::CommandRejected { command, reason };
                            if events.send(CoordinatorEvent::Radio { endpoint: id, notification }).is_err() {
                                return ServeExit::CoordinatorGone;
                            }
                        }
                        Err(e) => return ServeExit::Fault(e),
                    }
                }
                Some(DriverMessage::Reset) => return ServeExit::Reset,
                None => return ServeExit::CoordinatorGone,
            },
            notification = notifications.recv() => match notification {
                Some(notification) => {
                    if events.send(CoordinatorEvent::Radio { endpoint: id, notification }).is_err() {
                        return ServeExit::CoordinatorGone;
                    }
                }
                None => {
                    return ServeExit::Fault(TransportError::ChannelFault(
                        "notification stream closed".to_string(),
                    ))
                }
            },
        }
    }
}
