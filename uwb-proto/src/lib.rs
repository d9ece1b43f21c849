//! UWB anchor wire protocol - command frames, replies and telemetry
//!
//! Host to peripheral (CFG write):
//!
//! ```text
//! [version=1][opcode][req_hi][req_lo][reserved][TLV payload (SET only)]
//! ```
//!
//! Peripheral to host (CFG notify) is one of ACK (6 bytes), STATE (17 bytes),
//! heartbeat (13 bytes) or a bare TLV stream. Everything on CFG is big-endian;
//! DATA packets (see [`data`]) are little-endian.

pub mod ble;
pub mod data;
pub mod tlv;

use std::fmt;

use serde::Serialize;

pub use data::{DataMessage, DataPacket, decode_data};
pub use tlv::{TlvFrame, TlvRecord, TlvValue, tags};

pub const PROTOCOL_VERSION: u8 = 1;

// Opcodes
pub const OP_SET: u8 = 0x01;
pub const OP_GET: u8 = 0x02;

// Reply types (second byte of ACK / STATE)
pub const MSG_ACK: u8 = 0x81;
pub const MSG_STATE: u8 = 0x90;

// Fixed sizes
pub const COMMAND_HEADER_LEN: usize = 5;
pub const ACK_LEN: usize = 6;
pub const STATE_LEN: usize = 17;
pub const HEARTBEAT_LEN: usize = 13;

// Reserved header byte: SET carries 0xFF ("TLV count not given"), GET carries 0
pub const RESERVED_GET: u8 = 0x00;
pub const RESERVED_SET: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error(
        "TLV truncated at offset {offset}: tag 0x{tag:02X} needs {needed} bytes, {available} left"
    )]
    Truncated {
        /// Records decoded before the truncation point
        decoded: TlvFrame,
        offset: usize,
        tag: u8,
        needed: usize,
        available: usize,
    },
    #[error("{what} too short: need {need} bytes, got {got}")]
    TooShort {
        what: &'static str,
        need: usize,
        got: usize,
    },
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("GET command carries {0} unexpected payload bytes")]
    UnexpectedPayload(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("TLV value for tag 0x{tag:02X} is {len} bytes, limit is 255")]
    ValueTooLong { tag: u8, len: usize },
    #[error("payload of {len} bytes exceeds write capacity of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Space separated upper-case hex, for diagnostics
pub fn hex_dump(bytes: &[u8]) -> String {
    let hex = data_encoding::HEXUPPER.encode(bytes);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or("??"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    Set,
    Get,
}

impl Opcode {
    pub fn code(self) -> u8 {
        match self {
            Opcode::Set => OP_SET,
            Opcode::Get => OP_GET,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            OP_SET => Some(Opcode::Set),
            OP_GET => Some(Opcode::Get),
            _ => None,
        }
    }
}

/// Command written to the CFG characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub version: u8,
    pub opcode: Opcode,
    pub request_id: u16,
    pub reserved: u8,
    /// Only encoded for SET
    pub payload: TlvFrame,
}

impl CommandFrame {
    pub fn get(request_id: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode: Opcode::Get,
            request_id,
            reserved: RESERVED_GET,
            payload: TlvFrame::new(),
        }
    }

    pub fn set(request_id: u16, payload: TlvFrame) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode: Opcode::Set,
            request_id,
            reserved: RESERVED_SET,
            payload,
        }
    }

    /// Build a frame for `opcode`; the payload is ignored for GET
    pub fn new(opcode: Opcode, request_id: u16, payload: TlvFrame) -> Self {
        match opcode {
            Opcode::Get => Self::get(request_id),
            Opcode::Set => Self::set(request_id, payload),
        }
    }

    /// Bytes of TLV payload that go on the wire
    pub fn payload_len(&self) -> usize {
        match self.opcode {
            Opcode::Set => self.payload.encoded_len(),
            Opcode::Get => 0,
        }
    }

    /// Reject a payload that does not fit in one write of `max` bytes
    pub fn check_capacity(&self, max: usize) -> Result<(), EncodeError> {
        let len = self.payload_len();
        if len > max {
            return Err(EncodeError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMMAND_HEADER_LEN + self.payload_len());
        buf.push(self.version);
        buf.push(self.opcode.code());
        buf.extend_from_slice(&self.request_id.to_be_bytes());
        buf.push(self.reserved);
        if self.opcode == Opcode::Set {
            buf.extend_from_slice(&self.payload.to_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < COMMAND_HEADER_LEN {
            return Err(DecodeError::TooShort {
                what: "command",
                need: COMMAND_HEADER_LEN,
                got: data.len(),
            });
        }
        if data[0] != PROTOCOL_VERSION {
            return Err(DecodeError::Version(data[0]));
        }
        let opcode = Opcode::from_code(data[1]).ok_or(DecodeError::UnknownOpcode(data[1]))?;
        let request_id = u16::from_be_bytes([data[2], data[3]]);
        let rest = &data[COMMAND_HEADER_LEN..];

        let payload = match opcode {
            Opcode::Get if !rest.is_empty() => {
                return Err(DecodeError::UnexpectedPayload(rest.len()));
            }
            Opcode::Get => TlvFrame::new(),
            Opcode::Set => TlvFrame::decode(rest)?,
        };

        Ok(Self {
            version: data[0],
            opcode,
            request_id,
            reserved: data[4],
            payload,
        })
    }
}

/// ACK: `[1, 0x81, req_hi, req_lo, status, applied_count]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AckRecord {
    pub request_id: u16,
    pub status: u8,
    pub applied_count: u8,
}

impl AckRecord {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != ACK_LEN || data[0] != PROTOCOL_VERSION || data[1] != MSG_ACK {
            return None;
        }
        Some(Self {
            request_id: u16::from_be_bytes([data[2], data[3]]),
            status: data[4],
            applied_count: data[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; ACK_LEN] {
        let [hi, lo] = self.request_id.to_be_bytes();
        [PROTOCOL_VERSION, MSG_ACK, hi, lo, self.status, self.applied_count]
    }
}

impl fmt::Display for AckRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ACK req={} status=0x{:02X} applied={}",
            self.request_id, self.status, self.applied_count
        )
    }
}

/// STATE snapshot: `[1, 0x90, status, sync_ms:BE16, uptime_ms:BE32, network_id:BE16, zone_id:BE16, anchor_id:BE32]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateRecord {
    pub status: u8,
    pub sync_ms: u16,
    pub uptime_ms: u32,
    pub network_id: u16,
    pub zone_id: u16,
    pub anchor_id: u32,
}

impl StateRecord {
    pub fn parse(d: &[u8]) -> Option<Self> {
        if d.len() != STATE_LEN || d[0] != PROTOCOL_VERSION || d[1] != MSG_STATE {
            return None;
        }
        Some(Self {
            status: d[2],
            sync_ms: u16::from_be_bytes([d[3], d[4]]),
            uptime_ms: u32::from_be_bytes([d[5], d[6], d[7], d[8]]),
            network_id: u16::from_be_bytes([d[9], d[10]]),
            zone_id: u16::from_be_bytes([d[11], d[12]]),
            anchor_id: u32::from_be_bytes([d[13], d[14], d[15], d[16]]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATE_LEN);
        buf.push(PROTOCOL_VERSION);
        buf.push(MSG_STATE);
        buf.push(self.status);
        buf.extend_from_slice(&self.sync_ms.to_be_bytes());
        buf.extend_from_slice(&self.uptime_ms.to_be_bytes());
        buf.extend_from_slice(&self.network_id.to_be_bytes());
        buf.extend_from_slice(&self.zone_id.to_be_bytes());
        buf.extend_from_slice(&self.anchor_id.to_be_bytes());
        buf
    }
}

impl fmt::Display for StateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATE st=0x{:02X} sync_ms={} up={} net={} zone=0x{:04X} anc=0x{:08X}",
            self.status, self.sync_ms, self.uptime_ms, self.network_id, self.zone_id, self.anchor_id
        )
    }
}

/// Heartbeat fast path, a fixed TLV triple:
/// `[01 01 status] [02 04 uptime_ms:BE32] [03 02 sync_ms:BE16]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeartbeatRecord {
    pub status: u8,
    pub uptime_ms: u32,
    pub sync_ms: u16,
}

impl HeartbeatRecord {
    pub fn parse(d: &[u8]) -> Option<Self> {
        let shaped = d.len() == HEARTBEAT_LEN
            && d[0] == tags::STATUS
            && d[1] == 0x01
            && d[3] == tags::UPTIME_MS
            && d[4] == 0x04
            && d[9] == tags::SYNC_MS
            && d[10] == 0x02;
        if !shaped {
            return None;
        }
        Some(Self {
            status: d[2],
            uptime_ms: u32::from_be_bytes([d[5], d[6], d[7], d[8]]),
            sync_ms: u16::from_be_bytes([d[11], d[12]]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let frame: TlvFrame = vec![
            TlvRecord::u8(tags::STATUS, self.status),
            TlvRecord::u32(tags::UPTIME_MS, self.uptime_ms),
            TlvRecord::u16(tags::SYNC_MS, self.sync_ms),
        ]
        .into();
        frame.to_bytes()
    }
}

impl fmt::Display for HeartbeatRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HB st=0x{:02X} up={} sync_ms={}",
            self.status, self.uptime_ms, self.sync_ms
        )
    }
}

/// A decoded CFG notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigMessage {
    Ack(AckRecord),
    State(StateRecord),
    Heartbeat(HeartbeatRecord),
    Tlv(TlvFrame),
}

/// Classify a CFG notification by exact length and leading bytes, in
/// priority order ACK, STATE, heartbeat; anything else is a TLV stream.
pub fn decode_config(data: &[u8]) -> Result<ConfigMessage, DecodeError> {
    if let Some(ack) = AckRecord::parse(data) {
        return Ok(ConfigMessage::Ack(ack));
    }
    if let Some(state) = StateRecord::parse(data) {
        return Ok(ConfigMessage::State(state));
    }
    if let Some(hb) = HeartbeatRecord::parse(data) {
        return Ok(ConfigMessage::Heartbeat(hb));
    }
    TlvFrame::decode(data).map(ConfigMessage::Tlv)
}
