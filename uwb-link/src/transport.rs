//! The radio capability the link drives
//!
//! Calls on [`Transport`] only *issue* an operation. Their completions
//! (scan started, connected, disconnected, notifications) arrive later as
//! [`TransportEvent`]s on the channel handed to the link driver.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// GATT attribute handle
pub type AttrHandle = u16;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("not connected")]
    NotConnected,
    #[error("unknown peripheral {0}")]
    UnknownPeripheral(String),
    #[error("unknown attribute handle 0x{0:04X}")]
    UnknownHandle(AttrHandle),
    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
}

/// One advertising report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub address_type: AddressType,
    pub complete_name: Option<String>,
    pub short_name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Characteristic property bits the link cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharProps {
    pub fn writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub handle: AttrHandle,
    pub uuid: Uuid,
    pub props: CharProps,
    /// Client Characteristic Configuration descriptor, if the peripheral has one
    pub ccc_handle: Option<AttrHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub start_handle: AttrHandle,
    pub end_handle: AttrHandle,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Scan parameters, in 0.625 ms units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub active: bool,
    pub interval: u16,
    pub window: u16,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            active: true,
            interval: 0x50,
            window: 0x30,
        }
    }
}

/// Asynchronous completions and notifications from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ScanConfigured { ok: bool },
    ScanStarted { ok: bool },
    ScanStopped,
    Advertisement(Advertisement),
    Connected { conn_id: u16 },
    ConnectFailed { reason: String },
    Disconnected { reason: String },
    MtuChanged { mtu: u16 },
    Notification { handle: AttrHandle, value: Vec<u8> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Completion: [`TransportEvent::ScanConfigured`]
    async fn configure_scan(&self, params: &ScanParams) -> Result<(), TransportError>;

    /// Completion: [`TransportEvent::ScanStarted`]
    async fn start_scan(&self) -> Result<(), TransportError>;

    /// Completion: [`TransportEvent::ScanStopped`]
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Completion: [`TransportEvent::Connected`] or [`TransportEvent::ConnectFailed`]
    async fn connect(&self, advertisement: &Advertisement) -> Result<(), TransportError>;

    /// Completion: [`TransportEvent::Disconnected`]
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Best effort; completion: [`TransportEvent::MtuChanged`]
    async fn request_mtu(&self, mtu: u16) -> Result<(), TransportError>;

    /// Attribute database of the current connection
    async fn discover(&self) -> Result<Vec<ServiceInfo>, TransportError>;

    /// Write the CCC descriptor so the characteristic notifies
    async fn enable_notifications(&self, characteristic: &CharacteristicInfo) -> Result<(), TransportError>;

    /// Write with response
    async fn write(&self, handle: AttrHandle, value: &[u8]) -> Result<(), TransportError>;
}
