//! DATA characteristic telemetry packets
//!
//! Unlike everything on the CFG characteristic, the fields of a telemetry
//! packet are little-endian. The timestamp is a 40-bit UWB device time.

use std::fmt;

use serde::Serialize;

/// First byte of every telemetry packet
pub const DATA_MARKER: u8 = 0xAB;

/// Exact size of a telemetry packet
pub const DATA_PACKET_LEN: usize = 20;

/// Valid bits of [`DataPacket::timestamp`]
pub const TIMESTAMP_MASK: u64 = (1 << 40) - 1;

/// 20-byte ranging packet: `{0xAB, version, sync_seq, tag_seq, anchor_id:LE32, tag_id:LE32, timestamp:LE40}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataPacket {
    pub version: u8,
    pub sync_seq: u8,
    pub tag_seq: u8,
    pub anchor_id: u32,
    pub tag_id: u32,
    pub timestamp: u64,
}

impl DataPacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != DATA_PACKET_LEN || data[0] != DATA_MARKER {
            return None;
        }
        let mut ts = [0u8; 8];
        ts[..5].copy_from_slice(&data[12..17]);
        Some(Self {
            version: data[1],
            sync_seq: data[2],
            tag_seq: data[3],
            anchor_id: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            tag_id: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            timestamp: u64::from_le_bytes(ts),
        })
    }

    /// Encode; timestamp bits above 40 are dropped and the tail is zero padded.
    pub fn to_bytes(&self) -> [u8; DATA_PACKET_LEN] {
        let mut buf = [0u8; DATA_PACKET_LEN];
        buf[0] = DATA_MARKER;
        buf[1] = self.version;
        buf[2] = self.sync_seq;
        buf[3] = self.tag_seq;
        buf[4..8].copy_from_slice(&self.anchor_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tag_id.to_le_bytes());
        buf[12..17].copy_from_slice(&(self.timestamp & TIMESTAMP_MASK).to_le_bytes()[..5]);
        buf
    }
}

impl fmt::Display for DataPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VER={} SYNC={} TAGSEQ={} ANCHOR_ID=0x{:08X} TAG_ID=0x{:08X} TIMESTAMP={} (0x{:010X})",
            self.version,
            self.sync_seq,
            self.tag_seq,
            self.anchor_id,
            self.tag_id,
            self.timestamp,
            self.timestamp
        )
    }
}

/// Anything received on the DATA characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    Packet(DataPacket),
    /// Kept only for a diagnostic dump
    Unrecognized(Vec<u8>),
}

pub fn decode_data(data: &[u8]) -> DataMessage {
    match DataPacket::parse(data) {
        Some(packet) => DataMessage::Packet(packet),
        None => DataMessage::Unrecognized(data.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_fields() {
        let bytes = [
            0xAB, 0x01, 0x00, 0x00, // marker, version, sync_seq, tag_seq
            0x01, 0x00, 0x00, 0x00, // anchor_id = 1
            0x02, 0x00, 0x00, 0x00, // tag_id = 2
            0x05, 0x04, 0x03, 0x02, 0x01, // timestamp LE40
            0x00, 0x00, 0x00,
        ];
        let packet = DataPacket::parse(&bytes).unwrap();
        assert_eq!(
            packet,
            DataPacket {
                version: 1,
                sync_seq: 0,
                tag_seq: 0,
                anchor_id: 1,
                tag_id: 2,
                timestamp: 0x01_0203_0405,
            }
        );
        assert_eq!(packet.to_bytes(), bytes);
    }

    #[test]
    fn rejects_wrong_marker_or_length() {
        let mut bytes = [0u8; DATA_PACKET_LEN];
        assert_eq!(decode_data(&bytes), DataMessage::Unrecognized(bytes.to_vec()));
        bytes[0] = DATA_MARKER;
        assert!(matches!(decode_data(&bytes), DataMessage::Packet(_)));
        assert!(matches!(decode_data(&bytes[..19]), DataMessage::Unrecognized(_)));
    }

    #[test]
    fn timestamp_is_limited_to_40_bits() {
        let packet = DataPacket {
            version: 1,
            sync_seq: 9,
            tag_seq: 3,
            anchor_id: 0xDEADBEEF,
            tag_id: 7,
            timestamp: u64::MAX,
        };
        let decoded = DataPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(decoded.timestamp, TIMESTAMP_MASK);
        assert_eq!(decoded.anchor_id, 0xDEADBEEF);
    }

    #[test]
    fn display() {
        let packet = DataPacket {
            version: 1,
            sync_seq: 2,
            tag_seq: 3,
            anchor_id: 1,
            tag_id: 2,
            timestamp: 0x10,
        };
        assert_eq!(
            packet.to_string(),
            "VER=1 SYNC=2 TAGSEQ=3 ANCHOR_ID=0x00000001 TAG_ID=0x00000002 TIMESTAMP=16 (0x0000000010)"
        );
    }
}
