//! BLE link to a UWB anchor: the connection state machine, the radio
//! [`Transport`] it drives, and the [`Correlator`] that pairs commands with
//! their replies.

pub mod btleplug_transport;
pub mod correlator;
mod error;
pub mod link;
pub mod transport;

#[cfg(test)]
mod fake;

pub use btleplug_transport::BtleplugTransport;
pub use correlator::{Correlator, Reply, ReplyTiming};
pub use error::Error;
pub use link::{
    CharacteristicMap, LinkConfig, LinkDriver, LinkEvent, LinkHandle, LinkSnapshot, LinkState,
    PeripheralHandle, Telemetry, link,
};
pub use transport::{Transport, TransportError, TransportEvent};

use uuid::Uuid;

/// UWB anchor primary service
pub const SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_1234567890ab);

/// Ranging telemetry (notify)
pub const DATA_CHAR: Uuid = Uuid::from_u128(0xabcdef01_1234_5678_1234_1234567890ab);

/// Commands in (write), replies out (notify)
pub const CONFIG_CHAR: Uuid = Uuid::from_u128(0xabcdef02_1234_5678_1234_1234567890ab);

/// Client Characteristic Configuration descriptor
pub const CCC_DESCRIPTOR: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

#[cfg(test)]
mod tests {
    use super::*;
    use uwb_proto::ble;

    #[test]
    fn uuids_match_wire_constants() {
        assert_eq!(SERVICE.to_string(), ble::SERVICE_UUID);
        assert_eq!(DATA_CHAR.to_string(), ble::DATA_UUID);
        assert_eq!(CONFIG_CHAR.to_string(), ble::CONFIG_UUID);
        assert_eq!(CCC_DESCRIPTOR.to_string(), ble::CCC_UUID);
    }
}
