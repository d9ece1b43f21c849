//! BLE GATT constants for the UWB anchor peripheral
//!
//! The peripheral exposes one primary service with two characteristics:
//! DATA (telemetry, notify only) and CFG (write commands, notify replies).

/// UWB Service UUID: 12345678-1234-5678-1234-1234567890ab
pub const SERVICE_UUID: &str = "12345678-1234-5678-1234-1234567890ab";

/// DATA Characteristic UUID (read/notify, 20-byte telemetry packets)
pub const DATA_UUID: &str = "abcdef01-1234-5678-1234-1234567890ab";

/// CFG Characteristic UUID (write/notify, command frames and replies)
pub const CONFIG_UUID: &str = "abcdef02-1234-5678-1234-1234567890ab";

/// Client Characteristic Configuration descriptor (16-bit 0x2902)
pub const CCC_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// CCC value that enables notifications
pub const CCC_ENABLE_NOTIFY: [u8; 2] = [0x01, 0x00];

/// ATT MTU every connection starts with before negotiation
pub const DEFAULT_ATT_MTU: u16 = 23;

/// ATT MTU the anchor asks for
pub const PREFERRED_ATT_MTU: u16 = 247;

/// Bytes of each write that are not TLV payload (ATT header plus command header)
pub const WRITE_OVERHEAD: u16 = 7;

/// Largest SET payload that fits in one write at the given MTU
pub fn max_write_payload(mtu: u16) -> usize {
    mtu.saturating_sub(WRITE_OVERHEAD) as usize
}

#[cfg(test)]
mod tests {
    #[test]
    fn write_capacity() {
        assert_eq!(super::max_write_payload(super::PREFERRED_ATT_MTU), 240);
        assert_eq!(super::max_write_payload(super::DEFAULT_ATT_MTU), 16);
        assert_eq!(super::max_write_payload(3), 0);
    }
}
