//! [`Transport`] over the host Bluetooth stack via btleplug
//!
//! btleplug hides ATT handles, so handles are synthesized per connection in
//! discovery order: each service takes one handle, each characteristic two
//! (declaration and value) plus one for its CCC descriptor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{
    AddressType, Advertisement, AttrHandle, CharProps, CharacteristicInfo, ScanParams,
    ServiceInfo, Transport, TransportError, TransportEvent,
};
use crate::{CCC_DESCRIPTOR, SERVICE};

/// First default adapter on the host
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

/// A device seen during a one-shot scan
#[derive(Debug, Clone, Serialize)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the UWB service, or matches the name filter
    pub is_anchor: bool,
}

/// Scan for `duration` and list everything seen
pub async fn scan(
    duration: Duration,
    name_filter: Option<&str>,
) -> Result<Vec<ScannedDevice>, TransportError> {
    let adapter = get_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let is_anchor = match name_filter.filter(|f| !f.is_empty()) {
                Some(filter) => props.local_name.as_deref() == Some(filter),
                None => props.services.contains(&SERVICE),
            };
            devices.push(ScannedDevice {
                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                is_anchor,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

struct Session {
    peripheral_id: PeripheralId,
    peripheral: Peripheral,
    by_handle: HashMap<AttrHandle, Characteristic>,
    by_uuid: HashMap<Uuid, AttrHandle>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct Shared {
    events: mpsc::UnboundedSender<TransportEvent>,
    scanning: AtomicBool,
    seen: Mutex<HashMap<String, PeripheralId>>,
    session: Mutex<Option<Session>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn peripheral(&self) -> Result<Peripheral, TransportError> {
        lock(&self.session)
            .as_ref()
            .map(|s| s.peripheral.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, handle: AttrHandle) -> Result<(Peripheral, Characteristic), TransportError> {
        let session = lock(&self.session);
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        let characteristic = session
            .by_handle
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownHandle(handle))?;
        Ok((session.peripheral.clone(), characteristic))
    }

    /// Drop the session if it belongs to `id`; true if one was dropped
    fn end_session(&self, id: Option<&PeripheralId>) -> bool {
        let mut session = lock(&self.session);
        let matches = match (session.as_ref(), id) {
            (Some(s), Some(id)) => &s.peripheral_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            *session = None;
        }
        matches
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    shared: Arc<Shared>,
    next_conn: AtomicU16,
    central_pump: JoinHandle<()>,
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.central_pump.abort();
    }
}

impl BtleplugTransport {
    /// Open the default adapter. Completions arrive on the returned receiver.
    pub async fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let adapter = get_adapter().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: tx,
            scanning: AtomicBool::new(false),
            seen: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
        });

        let central_events = adapter.events().await?;
        let central_pump = tokio::spawn(central_pump(adapter.clone(), shared.clone(), central_events));

        let transport = Arc::new(Self {
            adapter,
            shared,
            next_conn: AtomicU16::new(1),
            central_pump,
        });
        Ok((transport, rx))
    }
}

async fn central_pump(
    adapter: Adapter,
    shared: Arc<Shared>,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !shared.scanning.load(Ordering::Acquire) {
                    continue;
                }
                let props = match adapter.peripheral(&id).await {
                    Ok(p) => p.properties().await,
                    Err(e) => Err(e),
                };
                match props {
                    Ok(Some(props)) => {
                        let adv = advertisement(&props);
                        lock(&shared.seen).insert(adv.address.clone(), id);
                        shared.emit(TransportEvent::Advertisement(adv));
                    }
                    Ok(None) => {}
                    Err(e) => debug!(target: "BLE", error = %e, "advertisement properties unavailable"),
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if shared.end_session(Some(&id)) {
                    shared.emit(TransportEvent::Disconnected {
                        reason: "peer disconnected".to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    warn!(target: "BLE", "adapter event stream ended");
}

fn advertisement(props: &PeripheralProperties) -> Advertisement {
    Advertisement {
        address: props.address.to_string(),
        address_type: match props.address_type {
            Some(btleplug::api::AddressType::Random) => AddressType::Random,
            _ => AddressType::Public,
        },
        complete_name: props.local_name.clone(),
        short_name: None,
        services: props.services.clone(),
        rssi: props.rssi,
    }
}

fn char_props(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY) || flags.contains(CharPropFlags::INDICATE),
    }
}

async fn notification_pump(peripheral: Peripheral, shared: Arc<Shared>) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target: "BLE", error = %e, "notification stream unavailable");
            return;
        }
    };
    while let Some(n) = notifications.next().await {
        let handle = lock(&shared.session)
            .as_ref()
            .and_then(|s| s.by_uuid.get(&n.uuid).copied());
        match handle {
            Some(handle) => shared.emit(TransportEvent::Notification {
                handle,
                value: n.value,
            }),
            None => debug!(target: "BLE", uuid = %n.uuid, "notification before discovery"),
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn configure_scan(&self, params: &ScanParams) -> Result<(), TransportError> {
        // the host stack picks its own interval and window
        debug!(target: "BLE", ?params, "scan parameters");
        self.shared.emit(TransportEvent::ScanConfigured { ok: true });
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.shared.scanning.store(true, Ordering::Release);
        self.shared.emit(TransportEvent::ScanStarted { ok: true });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.shared.scanning.store(false, Ordering::Release);
        self.adapter.stop_scan().await?;
        self.shared.emit(TransportEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<(), TransportError> {
        let id = lock(&self.shared.seen)
            .get(&advertisement.address)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(advertisement.address.clone()))?;
        let peripheral = self.adapter.peripheral(&id).await?;
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.connect().await {
                shared.emit(TransportEvent::ConnectFailed {
                    reason: e.to_string(),
                });
                return;
            }
            let pump = tokio::spawn(notification_pump(peripheral.clone(), shared.clone()));
            *lock(&shared.session) = Some(Session {
                peripheral_id: id,
                peripheral,
                by_handle: HashMap::new(),
                by_uuid: HashMap::new(),
                pump: Some(pump),
            });
            shared.emit(TransportEvent::Connected { conn_id });
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let peripheral = self.shared.peripheral()?;
        let result = peripheral.disconnect().await;
        if self.shared.end_session(None) {
            self.shared.emit(TransportEvent::Disconnected {
                reason: "local host terminated".to_string(),
            });
        }
        result.map_err(Into::into)
    }

    async fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        // btleplug leaves the exchange to the OS, which negotiates on connect
        info!(target: "BLE", mtu, "assuming host-negotiated MTU");
        self.shared.emit(TransportEvent::MtuChanged { mtu });
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<ServiceInfo>, TransportError> {
        let peripheral = self.shared.peripheral()?;
        peripheral.discover_services().await?;

        let mut services = Vec::new();
        let mut by_handle = HashMap::new();
        let mut by_uuid = HashMap::new();
        let mut next: AttrHandle = 1;

        for service in peripheral.services() {
            let start_handle = next;
            next += 1;
            let mut characteristics = Vec::new();
            for c in &service.characteristics {
                let handle = next + 1;
                next += 2;
                let ccc_handle = c.descriptors.iter().any(|d| d.uuid == CCC_DESCRIPTOR).then(|| {
                    next += 1;
                    next - 1
                });
                characteristics.push(CharacteristicInfo {
                    handle,
                    uuid: c.uuid,
                    props: char_props(c.properties),
                    ccc_handle,
                });
                by_handle.insert(handle, c.clone());
                by_uuid.insert(c.uuid, handle);
            }
            services.push(ServiceInfo {
                uuid: service.uuid,
                start_handle,
                end_handle: next - 1,
                characteristics,
            });
        }

        let mut session = lock(&self.shared.session);
        let session = session.as_mut().ok_or(TransportError::NotConnected)?;
        session.by_handle = by_handle;
        session.by_uuid = by_uuid;
        Ok(services)
    }

    async fn enable_notifications(&self, characteristic: &CharacteristicInfo) -> Result<(), TransportError> {
        let (peripheral, c) = self.shared.characteristic(characteristic.handle)?;
        peripheral.subscribe(&c).await?;
        Ok(())
    }

    async fn write(&self, handle: AttrHandle, value: &[u8]) -> Result<(), TransportError> {
        let (peripheral, c) = self.shared.characteristic(handle)?;
        peripheral.write(&c, value, WriteType::WithResponse).await?;
        Ok(())
    }
}
