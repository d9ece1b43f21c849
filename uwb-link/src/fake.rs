//! In-memory transport for driving the link and correlator in tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uwb_proto::ble::CCC_ENABLE_NOTIFY;

use crate::correlator::Correlator;
use crate::link::{LinkConfig, LinkEvent, LinkHandle, LinkSnapshot, LinkState, link};
use crate::transport::{
    AddressType, Advertisement, AttrHandle, CharProps, CharacteristicInfo, ScanParams,
    ServiceInfo, Transport, TransportError, TransportEvent,
};
use crate::{CONFIG_CHAR, DATA_CHAR, SERVICE};

pub const DATA_HANDLE: AttrHandle = 0x2A;
pub const CONFIG_HANDLE: AttrHandle = 0x2D;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ConfigureScan,
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    RequestMtu(u16),
    Discover,
    EnableNotifications(AttrHandle),
    /// Descriptor write on a CCC handle
    WriteCcc(AttrHandle, [u8; 2]),
    Write(AttrHandle, Vec<u8>),
}

pub struct FakeOptions {
    pub name_filter: Option<String>,
    pub fail_connect: bool,
    /// Complete `connect` with `Connected`; otherwise the test does it
    pub auto_connect: bool,
    pub services: Vec<ServiceInfo>,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            name_filter: Some("UWB_ANCHOR_01".to_string()),
            fail_connect: false,
            auto_connect: true,
            services: anchor_services(),
        }
    }
}

/// GATT table of a well-behaved anchor
pub fn anchor_services() -> Vec<ServiceInfo> {
    vec![ServiceInfo {
        uuid: SERVICE,
        start_handle: 0x28,
        end_handle: 0x2E,
        characteristics: vec![
            CharacteristicInfo {
                handle: DATA_HANDLE,
                uuid: DATA_CHAR,
                props: CharProps {
                    read: true,
                    notify: true,
                    ..CharProps::default()
                },
                ccc_handle: Some(0x2B),
            },
            CharacteristicInfo {
                handle: CONFIG_HANDLE,
                uuid: CONFIG_CHAR,
                props: CharProps {
                    write: true,
                    notify: true,
                    ..CharProps::default()
                },
                ccc_handle: Some(0x2E),
            },
        ],
    }]
}

pub fn advertisement(name: &str) -> Advertisement {
    Advertisement {
        address: "AA:BB:CC:DD:EE:01".to_string(),
        address_type: AddressType::Public,
        complete_name: Some(name.to_string()),
        short_name: None,
        services: vec![SERVICE],
        rssi: Some(-60),
    }
}

pub struct FakeTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
    calls: Mutex<Vec<Call>>,
    services: Vec<ServiceInfo>,
    fail_connect: bool,
    auto_connect: bool,
    fail_writes: AtomicBool,
}

impl FakeTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Write(_, bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn configure_scan(&self, _params: &ScanParams) -> Result<(), TransportError> {
        self.record(Call::ConfigureScan);
        self.emit(TransportEvent::ScanConfigured { ok: true });
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StartScan);
        self.emit(TransportEvent::ScanStarted { ok: true });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StopScan);
        self.emit(TransportEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<(), TransportError> {
        self.record(Call::Connect(advertisement.address.clone()));
        if self.fail_connect {
            self.emit(TransportEvent::ConnectFailed {
                reason: "peer unreachable".to_string(),
            });
        } else if self.auto_connect {
            self.emit(TransportEvent::Connected { conn_id: 1 });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        self.emit(TransportEvent::Disconnected {
            reason: "local host terminated".to_string(),
        });
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        self.record(Call::RequestMtu(mtu));
        self.emit(TransportEvent::MtuChanged { mtu });
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<ServiceInfo>, TransportError> {
        self.record(Call::Discover);
        Ok(self.services.clone())
    }

    async fn enable_notifications(&self, characteristic: &CharacteristicInfo) -> Result<(), TransportError> {
        self.record(Call::EnableNotifications(characteristic.handle));
        let ccc = characteristic
            .ccc_handle
            .ok_or_else(|| TransportError::Other("no CCC descriptor".to_string()))?;
        self.record(Call::WriteCcc(ccc, CCC_ENABLE_NOTIFY));
        Ok(())
    }

    async fn write(&self, handle: AttrHandle, value: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Other("write rejected".to_string()));
        }
        self.record(Call::Write(handle, value.to_vec()));
        let _ = self.writes.send(value.to_vec());
        Ok(())
    }
}

/// A running link driver wired to a [`FakeTransport`]
pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub link: LinkHandle,
    /// Taken by [`Harness::correlator`]
    pub upstream: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    writes: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn start(options: FakeOptions) -> Harness {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(FakeTransport {
        events: events_tx.clone(),
        writes: writes_tx,
        calls: Mutex::new(Vec::new()),
        services: options.services,
        fail_connect: options.fail_connect,
        auto_connect: options.auto_connect,
        fail_writes: AtomicBool::new(false),
    });
    let config = LinkConfig {
        name_filter: options.name_filter,
        connect_backoff: Duration::from_millis(20),
        disconnect_backoff: Duration::from_millis(10),
        ..LinkConfig::default()
    };
    let (driver, handle, upstream) = link(transport.clone(), events_rx, config);
    tokio::spawn(driver.run());

    Harness {
        transport,
        link: handle,
        upstream: Some(upstream),
        events: events_tx,
        writes: writes_rx,
    }
}

impl Harness {
    pub fn inject(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }

    pub fn injector(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.events.clone()
    }

    pub async fn wait_state(&self, state: LinkState) -> LinkSnapshot {
        let mut rx = self.link.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .expect("driver gone")
            .clone()
    }

    /// Advertise `name` once scanning and wait until the link is up with
    /// the preferred MTU
    pub async fn bring_up(&self, name: &str) -> LinkSnapshot {
        self.wait_state(LinkState::Scanning).await;
        self.advertise(name);
        let mut rx = self.link.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.is_ready() && s.mtu == 247))
            .await
            .expect("link not ready")
            .expect("driver gone")
            .clone()
    }

    pub fn advertise(&self, name: &str) {
        self.inject(TransportEvent::Advertisement(advertisement(name)));
    }

    pub fn notify(&self, handle: AttrHandle, value: Vec<u8>) {
        self.inject(TransportEvent::Notification { handle, value });
    }

    /// Correlator with its router running on the link's events
    pub fn correlator(&mut self, first_id: u16) -> Arc<Correlator> {
        let upstream = self.upstream.take().expect("correlator already attached");
        let correlator = Arc::new(Correlator::starting_at(self.link.clone(), first_id));
        let router = correlator.clone();
        tokio::spawn(async move { router.route(upstream).await });
        correlator
    }

    pub async fn next_write(&mut self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), self.writes.recv())
            .await
            .expect("no write")
            .expect("transport dropped")
    }
}
