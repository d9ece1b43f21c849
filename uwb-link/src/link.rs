//! Connection lifecycle for the single anchor peripheral
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Discovering -> Subscribing -> Ready
//!            ^            |              |              |           |
//!            +------------+-----(Closing, backoff)------+-----------+
//! ```
//!
//! [`LinkDriver`] owns all connection state and is the only thing that
//! mutates it. Everyone else reads [`LinkSnapshot`]s through a [`LinkHandle`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use uwb_proto::ble::{DEFAULT_ATT_MTU, PREFERRED_ATT_MTU, max_write_payload};
use uwb_proto::{
    ConfigMessage, DataMessage, DataPacket, DecodeError, HeartbeatRecord, StateRecord, TlvFrame,
    decode_config, decode_data, hex_dump,
};

use crate::transport::{
    AddressType, Advertisement, AttrHandle, CharacteristicInfo, ScanParams, ServiceInfo,
    Transport, TransportEvent,
};
use crate::{CONFIG_CHAR, DATA_CHAR, Error, SERVICE};

/// Wait after a failed connect attempt before scanning again
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Wait after a disconnect before scanning again
pub const DISCONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Subscribing,
    Ready,
    Closing,
}

/// Identity of the peripheral currently associated with the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralHandle {
    pub address: String,
    pub address_type: AddressType,
    /// Known once the connection is established
    pub conn_id: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedChar {
    pub handle: AttrHandle,
    pub ccc_handle: Option<AttrHandle>,
}

impl From<&CharacteristicInfo> for ResolvedChar {
    fn from(c: &CharacteristicInfo) -> Self {
        Self {
            handle: c.handle,
            ccc_handle: c.ccc_handle,
        }
    }
}

/// Handles of the two logical characteristics; empty outside a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicMap {
    pub data: Option<ResolvedChar>,
    pub config: Option<ResolvedChar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub peripheral: Option<PeripheralHandle>,
    pub characteristics: CharacteristicMap,
    pub mtu: u16,
}

impl LinkSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Largest SET payload one write can carry at the current MTU
    pub fn write_capacity(&self) -> usize {
        max_write_payload(self.mtu)
    }
}

/// Latest informational traffic from the anchor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    pub last_state: Option<StateRecord>,
    pub last_heartbeat: Option<HeartbeatRecord>,
    pub last_packet: Option<DataPacket>,
    pub data_packets: u64,
    pub unrecognized_data: u64,
}

/// What the link forwards to the request correlator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Config(ConfigMessage),
    /// Records decoded before a TLV stream ran past its buffer
    TruncatedTlv(TlvFrame),
    /// The link left `Ready`
    Down,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Exact match against the advertised complete or short local name.
    /// `None` (or empty) accepts any advertiser exposing the UWB service.
    pub name_filter: Option<String>,
    pub scan: ScanParams,
    pub preferred_mtu: u16,
    pub connect_backoff: Duration,
    pub disconnect_backoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name_filter: None,
            scan: ScanParams::default(),
            preferred_mtu: PREFERRED_ATT_MTU,
            connect_backoff: CONNECT_BACKOFF,
            disconnect_backoff: DISCONNECT_BACKOFF,
        }
    }
}

/// Build a link. Spawn [`LinkDriver::run`], hand the [`LinkEvent`] receiver
/// to a correlator, and use the [`LinkHandle`] everywhere else.
pub fn link(
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    config: LinkConfig,
) -> (LinkDriver, LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
    let initial = LinkSnapshot {
        state: LinkState::Idle,
        peripheral: None,
        characteristics: CharacteristicMap::default(),
        mtu: DEFAULT_ATT_MTU,
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    let (telemetry_tx, telemetry_rx) = watch::channel(Telemetry::default());
    let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();

    let driver = LinkDriver {
        transport: transport.clone(),
        events,
        config,
        state: LinkState::Idle,
        scan: ScanPhase::Unconfigured,
        connecting: false,
        peripheral: None,
        chars: CharacteristicMap::default(),
        mtu: DEFAULT_ATT_MTU,
        rescan_at: None,
        snapshot_tx,
        telemetry_tx,
        upstream: upstream_tx,
    };
    let handle = LinkHandle {
        transport,
        snapshot: snapshot_rx,
        telemetry: telemetry_rx,
    };
    (driver, handle, upstream_rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Unconfigured,
    Off,
    Pending,
    Active,
}

/// Outcome of a guarded scan start; the guards are no-ops, not errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanStart {
    Issued,
    AlreadyRunning,
    Connecting,
    Failed,
}

pub struct LinkDriver {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    config: LinkConfig,
    state: LinkState,
    scan: ScanPhase,
    connecting: bool,
    peripheral: Option<PeripheralHandle>,
    chars: CharacteristicMap,
    mtu: u16,
    rescan_at: Option<Instant>,
    snapshot_tx: watch::Sender<LinkSnapshot>,
    telemetry_tx: watch::Sender<Telemetry>,
    upstream: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkDriver {
    /// Drive the link until the transport's event stream ends.
    /// Retries forever; transport failures never leave this loop.
    pub async fn run(mut self) {
        info!(target: "BLE", filter = ?self.config.name_filter, "link starting");
        self.configure_scan().await;

        loop {
            let rescan_at = self.rescan_at;
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(rescan_at.unwrap_or_else(Instant::now)), if rescan_at.is_some() => {
                    self.rescan_at = None;
                    self.begin_scan().await;
                }
            }
        }

        info!(target: "BLE", "transport closed; link stopping");
        if self.state != LinkState::Idle {
            self.clear_connection();
            self.set_state(LinkState::Idle);
        }
    }

    async fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ScanConfigured { ok } => self.on_scan_configured(ok).await,
            TransportEvent::ScanStarted { ok } => {
                info!(target: "BLE", ok, "scan start complete");
                if ok {
                    self.scan = ScanPhase::Active;
                } else {
                    self.scan = ScanPhase::Off;
                    self.schedule_rescan(self.config.connect_backoff);
                }
            }
            TransportEvent::ScanStopped => {
                if self.scan != ScanPhase::Unconfigured {
                    self.scan = ScanPhase::Off;
                }
            }
            TransportEvent::Advertisement(adv) => self.on_advertisement(adv).await,
            TransportEvent::Connected { conn_id } => self.on_connected(conn_id).await,
            TransportEvent::ConnectFailed { reason } => self.on_connect_failed(&reason),
            TransportEvent::Disconnected { reason } => self.on_disconnected(&reason),
            TransportEvent::MtuChanged { mtu } => {
                info!(target: "BLE", mtu, "ATT MTU");
                if self.peripheral.is_some() {
                    self.mtu = mtu;
                    self.publish();
                }
            }
            TransportEvent::Notification { handle, value } => self.on_notification(handle, value),
        }
    }

    async fn configure_scan(&mut self) {
        if let Err(e) = self.transport.configure_scan(&self.config.scan).await {
            warn!(target: "BLE", error = %e, "scan configuration failed");
            self.schedule_rescan(self.config.connect_backoff);
        }
    }

    async fn on_scan_configured(&mut self, ok: bool) {
        if !ok {
            warn!(target: "BLE", "scan parameters rejected");
            self.scan = ScanPhase::Unconfigured;
            self.schedule_rescan(self.config.connect_backoff);
            return;
        }
        if self.scan == ScanPhase::Unconfigured {
            self.scan = ScanPhase::Off;
        }
        if matches!(self.state, LinkState::Idle | LinkState::Scanning) {
            self.set_state(LinkState::Scanning);
            self.start_scan_guarded().await;
        }
    }

    /// Timer-driven entry back into scanning
    async fn begin_scan(&mut self) {
        if self.scan == ScanPhase::Unconfigured {
            self.configure_scan().await;
        } else {
            self.start_scan_guarded().await;
        }
    }

    async fn start_scan_guarded(&mut self) -> ScanStart {
        let outcome = if self.connecting {
            ScanStart::Connecting
        } else if matches!(self.scan, ScanPhase::Active | ScanPhase::Pending) {
            ScanStart::AlreadyRunning
        } else {
            match self.transport.start_scan().await {
                Ok(()) => {
                    self.scan = ScanPhase::Pending;
                    ScanStart::Issued
                }
                Err(e) => {
                    warn!(target: "BLE", error = %e, "scan start failed");
                    self.schedule_rescan(self.config.connect_backoff);
                    ScanStart::Failed
                }
            }
        };
        debug!(target: "BLE", ?outcome, "scan start (guarded)");
        outcome
    }

    async fn stop_scan(&mut self) {
        if !matches!(self.scan, ScanPhase::Active | ScanPhase::Pending) {
            return;
        }
        match self.transport.stop_scan().await {
            Ok(()) => self.scan = ScanPhase::Off,
            Err(e) => warn!(target: "BLE", error = %e, "scan stop failed"),
        }
    }

    fn advert_matches(&self, adv: &Advertisement) -> bool {
        match self.config.name_filter.as_deref().filter(|f| !f.is_empty()) {
            Some(filter) => {
                adv.complete_name.as_deref() == Some(filter)
                    || adv.short_name.as_deref() == Some(filter)
            }
            None => adv.services.contains(&SERVICE),
        }
    }

    async fn on_advertisement(&mut self, adv: Advertisement) {
        if self.state != LinkState::Scanning || self.connecting {
            return;
        }
        if !self.advert_matches(&adv) {
            return;
        }

        info!(
            target: "BLE",
            address = %adv.address,
            name = ?adv.complete_name.as_ref().or(adv.short_name.as_ref()),
            rssi = ?adv.rssi,
            "anchor found; connecting"
        );

        self.stop_scan().await;
        self.connecting = true;
        self.rescan_at = None;
        self.peripheral = Some(PeripheralHandle {
            address: adv.address.clone(),
            address_type: adv.address_type,
            conn_id: None,
        });
        self.set_state(LinkState::Connecting);

        if let Err(e) = self.transport.connect(&adv).await {
            self.on_connect_failed(&e.to_string());
        }
    }

    fn on_connect_failed(&mut self, reason: &str) {
        if self.state != LinkState::Connecting {
            debug!(target: "BLE", reason, "stray connect failure ignored");
            return;
        }
        warn!(target: "BLE", reason, "open failed; restart scan");
        self.clear_connection();
        self.set_state(LinkState::Scanning);
        self.schedule_rescan(self.config.connect_backoff);
    }

    async fn on_connected(&mut self, conn_id: u16) {
        if self.state != LinkState::Connecting {
            warn!(target: "BLE", conn_id, state = ?self.state, "unexpected connection event");
            return;
        }
        self.connecting = false;
        if let Some(p) = self.peripheral.as_mut() {
            p.conn_id = Some(conn_id);
        }
        info!(target: "BLE", conn_id, "connected");
        self.set_state(LinkState::Discovering);

        if let Err(e) = self.transport.request_mtu(self.config.preferred_mtu).await {
            debug!(target: "BLE", error = %e, "MTU request failed; keeping default");
        }

        if let Err(e) = self.discover_and_subscribe().await {
            warn!(target: "BLE", error = %e, "characteristic setup failed; disconnect");
            self.teardown().await;
        }
    }

    async fn discover_and_subscribe(&mut self) -> Result<(), Error> {
        let services = self.transport.discover().await?;
        let (data, config) = resolve_characteristics(&services)?;

        self.chars = CharacteristicMap {
            data: Some(ResolvedChar::from(&data)),
            config: Some(ResolvedChar::from(&config)),
        };
        info!(target: "BLE", data = data.handle, config = config.handle, "characteristics resolved");
        self.set_state(LinkState::Subscribing);

        for characteristic in [&data, &config] {
            self.transport.enable_notifications(characteristic).await?;
        }

        self.set_state(LinkState::Ready);
        Ok(())
    }

    /// Close a half-set-up connection; the Disconnected event finishes the job
    async fn teardown(&mut self) {
        self.set_state(LinkState::Closing);
        if let Err(e) = self.transport.disconnect().await {
            warn!(target: "BLE", error = %e, "disconnect failed");
            self.link_lost(self.config.disconnect_backoff);
        }
    }

    fn on_disconnected(&mut self, reason: &str) {
        if self.peripheral.is_none() && !self.connecting {
            debug!(target: "BLE", reason, "stray disconnect ignored");
            return;
        }
        warn!(target: "BLE", reason, "disconnected");
        self.link_lost(self.config.disconnect_backoff);
    }

    fn link_lost(&mut self, backoff: Duration) {
        if self.state != LinkState::Closing {
            self.set_state(LinkState::Closing);
        }
        self.clear_connection();
        self.set_state(LinkState::Scanning);
        self.schedule_rescan(backoff);
    }

    fn clear_connection(&mut self) {
        self.connecting = false;
        self.peripheral = None;
        self.chars = CharacteristicMap::default();
        self.mtu = DEFAULT_ATT_MTU;
        let _ = self.upstream.send(LinkEvent::Down);
    }

    fn on_notification(&mut self, handle: AttrHandle, value: Vec<u8>) {
        let is = |c: Option<ResolvedChar>| c.is_some_and(|c| c.handle == handle);

        if is(self.chars.config) {
            self.on_config_notification(&value);
        } else if is(self.chars.data) {
            self.on_data_notification(&value);
        } else {
            debug!(target: "BLE", handle, len = value.len(), "notification on unknown handle");
        }
    }

    fn on_config_notification(&mut self, value: &[u8]) {
        let message = match decode_config(value) {
            Ok(message) => message,
            Err(DecodeError::Truncated {
                decoded,
                offset,
                tag,
                needed,
                available,
            }) => {
                warn!(target: "CFG", offset, tag, needed, available, "TLV truncated");
                let _ = self.upstream.send(LinkEvent::TruncatedTlv(decoded));
                return;
            }
            Err(e) => {
                warn!(target: "CFG", error = %e, bytes = %hex_dump(value), "undecodable notification");
                return;
            }
        };

        match &message {
            ConfigMessage::Ack(ack) => debug!(target: "CFG", "{ack}"),
            ConfigMessage::State(state) => {
                info!(target: "CFG", "{state}");
                let state = *state;
                self.telemetry_tx.send_modify(|t| t.last_state = Some(state));
            }
            ConfigMessage::Heartbeat(hb) => {
                debug!(target: "CFG", "{hb}");
                let hb = *hb;
                self.telemetry_tx.send_modify(|t| t.last_heartbeat = Some(hb));
            }
            ConfigMessage::Tlv(frame) => {
                for record in frame {
                    debug!(target: "CFG", "{record}");
                }
            }
        }
        let _ = self.upstream.send(LinkEvent::Config(message));
    }

    fn on_data_notification(&mut self, value: &[u8]) {
        match decode_data(value) {
            DataMessage::Packet(packet) => {
                debug!(target: "DATA", "{packet}");
                self.telemetry_tx.send_modify(|t| {
                    t.last_packet = Some(packet);
                    t.data_packets += 1;
                });
            }
            DataMessage::Unrecognized(bytes) => {
                debug!(target: "DATA", len = bytes.len(), bytes = %hex_dump(&bytes), "unrecognized data frame");
                self.telemetry_tx.send_modify(|t| t.unrecognized_data += 1);
            }
        }
    }

    fn schedule_rescan(&mut self, delay: Duration) {
        self.rescan_at = Some(Instant::now() + delay);
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            info!(target: "BLE", from = ?self.state, to = ?state, "link state");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(LinkSnapshot {
            state: self.state,
            peripheral: self.peripheral.clone(),
            characteristics: self.chars,
            mtu: self.mtu,
        });
    }
}

/// Find the DATA and CFG characteristics.
///
/// Looks inside the UWB service's handle range, or the whole range when the
/// service is not advertised by UUID. Characteristics are matched by UUID
/// first; whatever is still missing falls back to properties: notify+read is
/// DATA, notify+write is CFG. The fallback can pick the wrong characteristic
/// on a peripheral with extra notifying characteristics.
pub fn resolve_characteristics(
    services: &[ServiceInfo],
) -> Result<(CharacteristicInfo, CharacteristicInfo), Error> {
    let (start, end) = match services.iter().find(|s| s.uuid == SERVICE) {
        Some(s) => (s.start_handle, s.end_handle),
        None => {
            warn!(target: "BLE", "service not found by UUID, fallback range 0x0001..0xFFFF");
            (0x0001, 0xFFFF)
        }
    };

    let candidates: Vec<&CharacteristicInfo> = services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .filter(|c| (start..=end).contains(&c.handle))
        .collect();

    let by_uuid = |uuid: Uuid| candidates.iter().find(|c| c.uuid == uuid).copied();
    let mut data = by_uuid(DATA_CHAR);
    let mut config = by_uuid(CONFIG_CHAR);

    if data.is_none() || config.is_none() {
        for c in candidates.iter().copied() {
            let taken = |picked: Option<&CharacteristicInfo>| picked.is_some_and(|p| p.handle == c.handle);
            if !c.props.notify || taken(data) || taken(config) {
                continue;
            }
            if data.is_none() && c.props.read {
                debug!(target: "BLE", handle = c.handle, "DATA char (by properties)");
                data = Some(c);
            } else if config.is_none() && c.props.writable() {
                debug!(target: "BLE", handle = c.handle, "CFG char (by properties)");
                config = Some(c);
            }
        }
    }

    match (data, config) {
        (Some(d), Some(c)) => Ok((d.clone(), c.clone())),
        (d, c) => Err(Error::DiscoveryIncomplete {
            data: d.is_some(),
            config: c.is_some(),
        }),
    }
}

/// Read side of the link, shared by every caller context
#[derive(Clone)]
pub struct LinkHandle {
    transport: Arc<dyn Transport>,
    snapshot: watch::Receiver<LinkSnapshot>,
    telemetry: watch::Receiver<Telemetry>,
}

impl LinkHandle {
    pub fn snapshot(&self) -> LinkSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.borrow().clone()
    }

    /// Change notifications for link snapshots
    pub fn watch(&self) -> watch::Receiver<LinkSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the link reaches `Ready`
    pub async fn wait_ready(&self, timeout: Duration) -> Result<LinkSnapshot, Error> {
        let mut rx = self.snapshot.clone();
        match tokio::time::timeout(timeout, rx.wait_for(LinkSnapshot::is_ready)).await {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            _ => Err(Error::LinkNotReady),
        }
    }

    /// Write raw bytes to the CFG characteristic. Only allowed in `Ready`.
    pub async fn send_config(&self, bytes: &[u8]) -> Result<(), Error> {
        let handle = {
            let snapshot = self.snapshot.borrow();
            match (snapshot.state, snapshot.characteristics.config) {
                (LinkState::Ready, Some(config)) => config.handle,
                _ => return Err(Error::LinkNotReady),
            }
        };
        self.transport.write(handle, bytes).await?;
        Ok(())
    }
}
