// Host BLE adapters as roaming pool radios (btleplug)
//
// Host stacks own pairing and key storage, so pairing notifications are
// never raised and bonding commands are accepted as no-ops. A link counts
// as secured as soon as it opens. The identity address cannot be changed
// from user space either.
//
// btleplug addresses GATT attributes by UUID, so attribute handles are
// numbered per connection in the order they are first found.

use async_trait::async_trait;
use btleplug::api::{
    AddressType as BtAddressType, Central, CentralEvent, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use roampool_core::transport::ble::advertisement::{Advertisement, ServiceUuid};
use roampool_core::transport::ble::gatt::AttributeHandle;
use roampool_core::transport::{
    AddressType, CloseReason, ConnectionHandle, PeerAddress, PeerId, RadioCommand,
    RadioNotification, ScanMode, Transport, TransportError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NOTIFY_CAPACITY: usize = 256;

fn fault(e: btleplug::Error) -> TransportError {
    TransportError::ChannelFault(e.to_string())
}

#[derive(Default)]
struct RadioState {
    scan: Option<ScanMode>,
    peripherals: HashMap<PeerId, PeripheralId>,
    handles: HashMap<ConnectionHandle, (PeerId, PeripheralId)>,
    closing: HashMap<ConnectionHandle, PeerId>,
    connecting: HashMap<PeerId, JoinHandle<()>>,
    attributes: HashMap<ConnectionHandle, Vec<ServiceUuid>>,
    notifying: HashMap<ConnectionHandle, JoinHandle<()>>,
    next_handle: u32,
}

impl RadioState {
    fn handle_of(&self, id: &PeripheralId) -> Option<ConnectionHandle> {
        self.handles
            .iter()
            .find(|(_, (_, pid))| pid == id)
            .map(|(h, _)| *h)
    }

    /// Handle for `uuid` on this connection, numbering it on first sight
    fn attribute(&mut self, handle: ConnectionHandle, uuid: ServiceUuid) -> AttributeHandle {
        let table = self.attributes.entry(handle).or_default();
        let index = match table.iter().position(|known| *known == uuid) {
            Some(index) => index,
            None => {
                table.push(uuid);
                table.len() - 1
            }
        };
        AttributeHandle(index as u16 + 1)
    }

    fn uuid_of(&self, handle: ConnectionHandle, attribute: AttributeHandle) -> Option<ServiceUuid> {
        let index = usize::from(attribute.0).checked_sub(1)?;
        self.attributes.get(&handle)?.get(index).copied()
    }

    /// Drop everything kept for a closed connection
    fn forget_link(&mut self, handle: ConnectionHandle) {
        self.attributes.remove(&handle);
        if let Some(task) = self.notifying.remove(&handle) {
            task.abort();
        }
    }
}

/// One host adapter, selected by its adapter info string (`hci0`, ...)
pub struct HostRadio {
    name: String,
    adapter: Option<Adapter>,
    notify: Option<mpsc::Sender<RadioNotification>>,
    state: Arc<Mutex<RadioState>>,
    events_task: Option<JoinHandle<()>>,
}

impl HostRadio {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            adapter: None,
            notify: None,
            state: Arc::new(Mutex::new(RadioState::default())),
            events_task: None,
        }
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter
            .as_ref()
            .ok_or_else(|| TransportError::ChannelFault(format!("{} is not open", self.name)))
    }

    fn notifier(&self) -> Result<mpsc::Sender<RadioNotification>, TransportError> {
        self.notify
            .clone()
            .ok_or_else(|| TransportError::ChannelFault(format!("{} is not open", self.name)))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RadioState>, TransportError> {
        lock_state(&self.state)
    }

    async fn emit(&self, notification: RadioNotification) -> Result<(), TransportError> {
        self.notifier()?
            .send(notification)
            .await
            .map_err(|_| TransportError::ChannelFault("receiver gone".to_string()))
    }

    /// Peripheral behind an open connection
    async fn linked_peripheral(&self, handle: ConnectionHandle) -> Result<Peripheral, TransportError> {
        let (_, id) = self
            .lock()?
            .handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| TransportError::CommandRejected(format!("unknown {}", handle)))?;
        self.adapter()?.peripheral(&id).await.map_err(fault)
    }

    async fn peripheral_for(&self, peer: &PeerId) -> Result<Peripheral, TransportError> {
        let id = self
            .lock()?
            .peripherals
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::CommandRejected(format!("{} not seen yet", peer)))?;
        self.adapter()?.peripheral(&id).await.map_err(fault)
    }
}

fn lock_state(state: &Mutex<RadioState>) -> Result<std::sync::MutexGuard<'_, RadioState>, TransportError> {
    state
        .lock()
        .map_err(|_| TransportError::ChannelFault("radio state poisoned".to_string()))
}

fn peer_of(address: btleplug::api::BDAddr, address_type: Option<BtAddressType>) -> PeerId {
    let address_type = match address_type {
        Some(BtAddressType::Random) => AddressType::Random,
        _ => AddressType::Public,
    };
    PeerId::new(PeerAddress(address.into_inner()), address_type)
}

fn clamp_rssi(rssi: i16) -> i8 {
    rssi.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8
}

/// Turn adapter events into notifications until the stream ends
async fn pump_events(
    adapter: Adapter,
    state: Arc<Mutex<RadioState>>,
    notify: mpsc::Sender<RadioNotification>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("adapter event stream unavailable: {}", e);
            return;
        }
    };
    while let Some(event) = events.next().await {
        let notification = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(rssi) = props.rssi else {
                    continue;
                };
                let peer = peer_of(props.address, props.address_type);
                let scan = match lock_state(&state) {
                    Ok(mut s) => {
                        s.peripherals.insert(peer, id.clone());
                        s.scan
                    }
                    Err(_) => return,
                };
                let visible = match scan {
                    Some(ScanMode::Discovery) => true,
                    Some(ScanMode::Targeted(target)) => target == peer,
                    None => false,
                };
                if !visible {
                    continue;
                }
                let services = props.services.into_iter().map(ServiceUuid).collect();
                RadioNotification::ScanReport {
                    peer,
                    rssi: clamp_rssi(rssi),
                    advertisement: Advertisement::from_services(services),
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let closed = match lock_state(&state) {
                    Ok(mut s) => s.handle_of(&id).map(|handle| {
                        s.handles.remove(&handle);
                        s.forget_link(handle);
                        let reason = if s.closing.remove(&handle).is_some() {
                            CloseReason::LocalRequest
                        } else {
                            CloseReason::SupervisionTimeout
                        };
                        (handle, reason)
                    }),
                    Err(_) => return,
                };
                match closed {
                    Some((handle, reason)) => RadioNotification::ConnectionClosed { handle, reason },
                    None => continue,
                }
            }
            _ => continue,
        };
        if notify.send(notification).await.is_err() {
            return;
        }
    }
    debug!("adapter event stream ended");
}

#[async_trait]
impl Transport for HostRadio {
    fn transport_id(&self) -> String {
        self.name.clone()
    }

    async fn open(&mut self) -> Result<mpsc::Receiver<RadioNotification>, TransportError> {
        let manager = Manager::new().await.map_err(fault)?;
        let mut found = None;
        for adapter in manager.adapters().await.map_err(fault)? {
            let info = adapter.adapter_info().await.map_err(fault)?;
            if info.contains(&self.name) {
                found = Some(adapter);
                break;
            }
        }
        let adapter = found.ok_or_else(|| TransportError::NotFound(self.name.clone()))?;

        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        *self.lock()? = RadioState::default();
        self.events_task = Some(tokio::spawn(pump_events(
            adapter.clone(),
            self.state.clone(),
            tx.clone(),
        )));
        self.adapter = Some(adapter);
        self.notify = Some(tx);
        Ok(rx)
    }

    async fn send(&self, command: RadioCommand) -> Result<(), TransportError> {
        match command {
            RadioCommand::SetIdentityAddress { address } => {
                warn!(radio = %self.name, "host adapter keeps its own address, ignoring {}", address);
            }
            RadioCommand::StartScan { mode } => {
                self.lock()?.scan = Some(mode);
                self.adapter()?
                    .start_scan(ScanFilter::default())
                    .await
                    .map_err(fault)?;
            }
            RadioCommand::StopScan => {
                self.lock()?.scan = None;
                self.adapter()?.stop_scan().await.map_err(fault)?;
            }
            RadioCommand::Connect { peer } => {
                let peripheral = self.peripheral_for(&peer).await?;
                let notify = self.notifier()?;
                let state = self.state.clone();
                let task = tokio::spawn(async move {
                    match peripheral.connect().await {
                        Ok(()) => {
                            let handle = match lock_state(&state) {
                                Ok(mut s) => {
                                    s.connecting.remove(&peer);
                                    s.next_handle += 1;
                                    let handle = ConnectionHandle(s.next_handle);
                                    s.handles.insert(handle, (peer, peripheral.id()));
                                    handle
                                }
                                Err(_) => return,
                            };
                            let opened = RadioNotification::ConnectionOpened { handle, peer };
                            if notify.send(opened).await.is_ok() {
                                let _ = notify.send(RadioNotification::LinkSecured { handle }).await;
                            }
                        }
                        Err(e) => {
                            if let Ok(mut s) = lock_state(&state) {
                                s.connecting.remove(&peer);
                            }
                            let failed = RadioNotification::ConnectFailed {
                                peer,
                                reason: e.to_string(),
                            };
                            let _ = notify.send(failed).await;
                        }
                    }
                });
                self.lock()?.connecting.insert(peer, task);
            }
            RadioCommand::CancelConnect { peer } => {
                if let Some(task) = self.lock()?.connecting.remove(&peer) {
                    task.abort();
                }
            }
            RadioCommand::Disconnect { handle } => {
                let id = {
                    let mut s = self.lock()?;
                    let (peer, id) = s
                        .handles
                        .get(&handle)
                        .cloned()
                        .ok_or_else(|| TransportError::CommandRejected(format!("unknown {}", handle)))?;
                    s.closing.insert(handle, peer);
                    id
                };
                let peripheral = self.adapter()?.peripheral(&id).await.map_err(fault)?;
                if let Err(e) = peripheral.disconnect().await {
                    return Err(TransportError::CommandRejected(e.to_string()));
                }
            }
            RadioCommand::SampleRssi { handle } => {
                let (peer, _) = self
                    .lock()?
                    .handles
                    .get(&handle)
                    .cloned()
                    .ok_or_else(|| TransportError::CommandRejected(format!("unknown {}", handle)))?;
                let peripheral = self.peripheral_for(&peer).await?;
                let rssi = peripheral
                    .properties()
                    .await
                    .map_err(fault)?
                    .and_then(|props| props.rssi);
                if let Some(rssi) = rssi {
                    self.emit(RadioNotification::RssiSample {
                        handle,
                        rssi: clamp_rssi(rssi),
                    })
                    .await?;
                }
            }
            RadioCommand::DiscoverService { handle, service } => {
                let peripheral = self.linked_peripheral(handle).await?;
                let notification = match peripheral.discover_services().await {
                    Ok(()) if peripheral.services().iter().any(|s| s.uuid == service.0) => {
                        RadioNotification::ServiceDiscovered {
                            handle,
                            service: self.lock()?.attribute(handle, service),
                        }
                    }
                    Ok(()) => RadioNotification::GattFailed {
                        handle,
                        reason: format!("service {} not offered", service),
                    },
                    Err(e) => RadioNotification::GattFailed {
                        handle,
                        reason: e.to_string(),
                    },
                };
                self.emit(notification).await?;
            }
            RadioCommand::DiscoverCharacteristic {
                handle,
                service,
                characteristic,
            } => {
                let peripheral = self.linked_peripheral(handle).await?;
                let service_uuid = self
                    .lock()?
                    .uuid_of(handle, service)
                    .ok_or_else(|| TransportError::CommandRejected(format!("unknown {}", service)))?;
                let found = peripheral.services().iter().any(|s| {
                    s.uuid == service_uuid.0 && s.characteristics.iter().any(|c| c.uuid == characteristic.0)
                });
                let notification = if found {
                    RadioNotification::CharacteristicDiscovered {
                        handle,
                        characteristic: self.lock()?.attribute(handle, characteristic),
                    }
                } else {
                    RadioNotification::GattFailed {
                        handle,
                        reason: format!("characteristic {} not in {}", characteristic, service_uuid),
                    }
                };
                self.emit(notification).await?;
            }
            RadioCommand::EnableNotifications { handle, characteristic } => {
                let peripheral = self.linked_peripheral(handle).await?;
                let uuid = self
                    .lock()?
                    .uuid_of(handle, characteristic)
                    .ok_or_else(|| TransportError::CommandRejected(format!("unknown {}", characteristic)))?;
                let Some(target) = peripheral.characteristics().into_iter().find(|c| c.uuid == uuid.0) else {
                    return self
                        .emit(RadioNotification::GattFailed {
                            handle,
                            reason: format!("characteristic {} gone", uuid),
                        })
                        .await;
                };
                if let Err(e) = peripheral.subscribe(&target).await {
                    return self
                        .emit(RadioNotification::GattFailed {
                            handle,
                            reason: e.to_string(),
                        })
                        .await;
                }
                let mut values = peripheral.notifications().await.map_err(fault)?;
                let notify = self.notifier()?;
                let task = tokio::spawn(async move {
                    while let Some(value) = values.next().await {
                        if value.uuid != uuid.0 {
                            continue;
                        }
                        let notification = RadioNotification::CharacteristicValue {
                            handle,
                            characteristic,
                            value: value.value,
                        };
                        if notify.send(notification).await.is_err() {
                            return;
                        }
                    }
                });
                if let Some(previous) = self.lock()?.notifying.insert(handle, task) {
                    previous.abort();
                }
            }
            // Pairing is handled by the host stack
            RadioCommand::ProvideBondingData { .. } | RadioCommand::RetryPairing { .. } => {}
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = &self.events_task {
            task.abort();
        }
        if let Ok(mut s) = self.lock() {
            let s = &mut *s;
            for task in s.connecting.drain().map(|(_, t)| t).chain(s.notifying.drain().map(|(_, t)| t)) {
                task.abort();
            }
        }
        if let Some(adapter) = &self.adapter {
            let _ = adapter.stop_scan().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rssi_clamp() {
        assert_eq!(clamp_rssi(-60), -60);
        assert_eq!(clamp_rssi(-300), i8::MIN);
        assert_eq!(clamp_rssi(200), i8::MAX);
    }

    #[test]
    fn test_attribute_handles_are_numbered_per_connection() {
        let mut state = RadioState::default();
        let link = ConnectionHandle(1);
        let measurement = ServiceUuid::from_u16(0x2A37);

        assert_eq!(state.attribute(link, ServiceUuid::HEART_RATE), AttributeHandle(1));
        assert_eq!(state.attribute(link, measurement), AttributeHandle(2));
        // Looking the same UUID up again keeps its handle
        assert_eq!(state.attribute(link, ServiceUuid::HEART_RATE), AttributeHandle(1));
        assert_eq!(state.attribute(ConnectionHandle(2), measurement), AttributeHandle(1));

        assert_eq!(state.uuid_of(link, AttributeHandle(2)), Some(measurement));
        assert_eq!(state.uuid_of(link, AttributeHandle(0)), None);
        assert_eq!(state.uuid_of(link, AttributeHandle(3)), None);

        state.forget_link(link);
        assert_eq!(state.uuid_of(link, AttributeHandle(1)), None);
    }

    #[test]
    fn test_peer_identity_from_adapter_address() {
        let address = btleplug::api::BDAddr::from([0xC0, 1, 2, 3, 4, 5]);
        let peer = peer_of(address, Some(BtAddressType::Random));
        assert_eq!(peer.address, PeerAddress([0xC0, 1, 2, 3, 4, 5]));
        assert_eq!(peer.address_type, AddressType::Random);
        assert_eq!(peer_of(address, None).address_type, AddressType::Public);
    }
}
