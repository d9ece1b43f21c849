//! TLV records: `[tag, len, value..]`, self-delimited by a one-byte length
//!
//! The anchor reports its configuration as a stream of TLV records and accepts
//! the same records as the payload of a SET command. All multi-byte values are
//! big-endian.

use std::fmt;

use serde::Serialize;

use crate::{DecodeError, EncodeError, hex_dump};

/// Tag numbers understood by the anchor firmware
pub mod tags {
    pub const VER: u8 = 0x00;
    pub const STATUS: u8 = 0x01;
    pub const UPTIME_MS: u8 = 0x02;
    pub const SYNC_MS: u8 = 0x03;
    pub const NETWORK_ID: u8 = 0x10;
    pub const ZONE_ID: u8 = 0x11;
    pub const ANCHOR_ID: u8 = 0x12;
    pub const TX_ANT_DLY: u8 = 0x13;
    pub const RX_ANT_DLY: u8 = 0x14;
    pub const BIAS_TICKS: u8 = 0x16;
    pub const LOG_LEVEL: u8 = 0x1F;
    pub const HB_MS: u8 = 0x20;
    pub const PPM_MAX: u8 = 0x30;
    pub const JUMP_PPM: u8 = 0x31;
    pub const AB_GAP_MS: u8 = 0x32;
    pub const MS_EWMA_DEN: u8 = 0x33;
    pub const TK_EWMA_DEN: u8 = 0x34;
    pub const TK_MIN_MS: u8 = 0x35;
    pub const TK_MAX_MS: u8 = 0x36;
    pub const DTTX_MIN_MS: u8 = 0x37;
    pub const DTTX_MAX_MS: u8 = 0x38;
    pub const LOCK_NEED: u8 = 0x39;
    pub const PHY_CH: u8 = 0x40;
    pub const PHY_SFDTO: u8 = 0x49;
}

/// Maximum length of a single TLV value
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

/// Numeric type carried by a known tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    U8,
    U16,
    U32,
    I32,
}

impl ValueKind {
    pub fn width(self) -> usize {
        match self {
            ValueKind::U8 => 1,
            ValueKind::U16 => 2,
            ValueKind::U32 | ValueKind::I32 => 4,
        }
    }
}

/// Static description of a known tag
#[derive(Debug, Clone, Copy)]
pub struct TagInfo {
    pub tag: u8,
    pub name: &'static str,
    pub kind: ValueKind,
    /// Rendered as hex in logs and JSON
    pub hex: bool,
}

const fn info(tag: u8, name: &'static str, kind: ValueKind, hex: bool) -> TagInfo {
    TagInfo { tag, name, kind, hex }
}

/// Every tag the firmware defines, in tag order
pub const TAGS: &[TagInfo] = &[
    info(tags::VER, "VER", ValueKind::U8, false),
    info(tags::STATUS, "STATUS", ValueKind::U8, true),
    info(tags::UPTIME_MS, "UPTIME_MS", ValueKind::U32, false),
    info(tags::SYNC_MS, "SYNC_MS", ValueKind::U16, false),
    info(tags::NETWORK_ID, "NETWORK_ID", ValueKind::U16, false),
    info(tags::ZONE_ID, "ZONE_ID", ValueKind::U16, true),
    info(tags::ANCHOR_ID, "ANCHOR_ID", ValueKind::U32, true),
    info(tags::TX_ANT_DLY, "TX_ANT_DLY", ValueKind::I32, false),
    info(tags::RX_ANT_DLY, "RX_ANT_DLY", ValueKind::I32, false),
    info(tags::BIAS_TICKS, "BIAS_TICKS", ValueKind::I32, false),
    info(tags::LOG_LEVEL, "LOG_LEVEL", ValueKind::U8, false),
    info(tags::HB_MS, "HB_MS", ValueKind::U16, false),
    info(tags::PPM_MAX, "PPM_MAX", ValueKind::U16, false),
    info(tags::JUMP_PPM, "JUMP_PPM", ValueKind::U16, false),
    info(tags::AB_GAP_MS, "AB_GAP_MS", ValueKind::U16, false),
    info(tags::MS_EWMA_DEN, "MS_EWMA_DEN", ValueKind::U8, false),
    info(tags::TK_EWMA_DEN, "TK_EWMA_DEN", ValueKind::U8, false),
    info(tags::TK_MIN_MS, "TK_MIN_MS", ValueKind::U16, false),
    info(tags::TK_MAX_MS, "TK_MAX_MS", ValueKind::U16, false),
    info(tags::DTTX_MIN_MS, "DTTX_MIN_MS", ValueKind::U16, false),
    info(tags::DTTX_MAX_MS, "DTTX_MAX_MS", ValueKind::U16, false),
    info(tags::LOCK_NEED, "LOCK_NEED", ValueKind::U8, false),
    info(tags::PHY_CH, "PHY_CH", ValueKind::U8, false),
    info(tags::PHY_SFDTO, "PHY_SFDTO", ValueKind::U16, false),
];

/// Look up a tag in the firmware table
pub fn tag_info(tag: u8) -> Option<&'static TagInfo> {
    TAGS.iter().find(|t| t.tag == tag)
}

/// A record's value interpreted through the tag table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvValue<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    I32(i32),
    /// Unknown tag, or a known tag whose length does not match its type
    Raw(&'a [u8]),
}

/// One TLV record. The value is at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlvRecord {
    tag: u8,
    value: Vec<u8>,
}

impl TlvRecord {
    pub fn new(tag: u8, value: Vec<u8>) -> Result<Self, EncodeError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(EncodeError::ValueTooLong {
                tag,
                len: value.len(),
            });
        }
        Ok(Self { tag, value })
    }

    pub fn u8(tag: u8, v: u8) -> Self {
        Self { tag, value: vec![v] }
    }

    pub fn u16(tag: u8, v: u16) -> Self {
        Self {
            tag,
            value: v.to_be_bytes().to_vec(),
        }
    }

    pub fn u32(tag: u8, v: u32) -> Self {
        Self {
            tag,
            value: v.to_be_bytes().to_vec(),
        }
    }

    pub fn i32(tag: u8, v: i32) -> Self {
        Self {
            tag,
            value: v.to_be_bytes().to_vec(),
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Name from the tag table, if the tag is known
    pub fn name(&self) -> Option<&'static str> {
        tag_info(self.tag).map(|t| t.name)
    }

    /// Bytes this record occupies on the wire
    pub fn encoded_len(&self) -> usize {
        2 + self.value.len()
    }

    pub fn typed(&self) -> TlvValue<'_> {
        let v = self.value.as_slice();
        let Some(info) = tag_info(self.tag) else {
            return TlvValue::Raw(v);
        };
        if v.len() != info.kind.width() {
            return TlvValue::Raw(v);
        }
        match info.kind {
            ValueKind::U8 => TlvValue::U8(v[0]),
            ValueKind::U16 => TlvValue::U16(u16::from_be_bytes([v[0], v[1]])),
            ValueKind::U32 => TlvValue::U32(u32::from_be_bytes([v[0], v[1], v[2], v[3]])),
            ValueKind::I32 => TlvValue::I32(i32::from_be_bytes([v[0], v[1], v[2], v[3]])),
        }
    }

    /// Unsigned view of a numeric record, for schema mapping
    pub fn as_u32(&self) -> Option<u32> {
        match self.typed() {
            TlvValue::U8(v) => Some(v.into()),
            TlvValue::U16(v) => Some(v.into()),
            TlvValue::U32(v) => Some(v),
            TlvValue::I32(_) | TlvValue::Raw(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self.typed() {
            TlvValue::I32(v) => Some(v),
            _ => None,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag);
        buf.push(self.value.len() as u8);
        buf.extend_from_slice(&self.value);
    }
}

impl fmt::Display for TlvRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = tag_info(self.tag).is_some_and(|t| t.hex);
        let name = self.name();
        match (name, self.typed()) {
            (Some(n), TlvValue::U8(v)) if hex => write!(f, "{n}=0x{v:02X}"),
            (Some(n), TlvValue::U16(v)) if hex => write!(f, "{n}=0x{v:04X}"),
            (Some(n), TlvValue::U32(v)) if hex => write!(f, "{n}=0x{v:08X}"),
            (Some(n), TlvValue::U8(v)) => write!(f, "{n}={v}"),
            (Some(n), TlvValue::U16(v)) => write!(f, "{n}={v}"),
            (Some(n), TlvValue::U32(v)) => write!(f, "{n}={v}"),
            (Some(n), TlvValue::I32(v)) => write!(f, "{n}={v}"),
            (Some(n), TlvValue::Raw(v)) => write!(f, "{n}[len={}]: {}", v.len(), hex_dump(v)),
            (None, _) => write!(
                f,
                "TLV(0x{:02X})[len={}]: {}",
                self.tag,
                self.value.len(),
                hex_dump(&self.value)
            ),
        }
    }
}

/// An ordered sequence of TLV records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TlvFrame(Vec<TlvRecord>);

impl TlvFrame {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, record: TlvRecord) {
        self.0.push(record);
    }

    pub fn extend(&mut self, other: TlvFrame) {
        self.0.extend(other.0);
    }

    pub fn records(&self) -> &[TlvRecord] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TlvRecord> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last record with the given tag (later records override earlier ones)
    pub fn find(&self, tag: u8) -> Option<&TlvRecord> {
        self.0.iter().rev().find(|r| r.tag == tag)
    }

    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(TlvRecord::encoded_len).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        for record in &self.0 {
            record.write_to(&mut buf);
        }
        buf
    }

    /// Decode a TLV stream greedily.
    ///
    /// A record whose header or value runs past the end of `data` stops the
    /// decode with [`DecodeError::Truncated`], which carries every record
    /// decoded before it. Nothing past the buffer is ever read.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut records = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let tag = data[pos];
            let available = data.len() - pos;

            let Some(&len) = data.get(pos + 1) else {
                return Err(DecodeError::Truncated {
                    decoded: Self(records),
                    offset: pos,
                    tag,
                    needed: 2,
                    available,
                });
            };

            let needed = 2 + len as usize;
            if needed > available {
                return Err(DecodeError::Truncated {
                    decoded: Self(records),
                    offset: pos,
                    tag,
                    needed,
                    available,
                });
            }

            records.push(TlvRecord {
                tag,
                value: data[pos + 2..pos + needed].to_vec(),
            });
            pos += needed;
        }

        Ok(Self(records))
    }
}

impl From<Vec<TlvRecord>> for TlvFrame {
    fn from(records: Vec<TlvRecord>) -> Self {
        Self(records)
    }
}

impl FromIterator<TlvRecord> for TlvFrame {
    fn from_iter<I: IntoIterator<Item = TlvRecord>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TlvFrame {
    type Item = &'a TlvRecord;
    type IntoIter = std::slice::Iter<'a, TlvRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for TlvFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_preserves_known_and_unknown_records() {
        let bytes = [
            0x10, 0x02, 0x00, 0x01, // NETWORK_ID=1
            0x7E, 0x03, 0xAA, 0xBB, 0xCC, // unknown
            0x11, 0x01, 0x5A, // ZONE_ID with the wrong width
        ];
        let frame = TlvFrame::decode(&bytes).unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.records()[0].typed(), TlvValue::U16(1));
        assert_eq!(frame.records()[1].tag(), 0x7E);
        assert_eq!(frame.records()[1].value(), &[0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.records()[2].typed(), TlvValue::Raw(&[0x5A]));
        assert_eq!(frame.to_bytes(), bytes);
    }

    #[test]
    fn truncated_value_keeps_earlier_records() {
        let bytes = [0x10, 0x02, 0x00, 0x07, 0x12, 0x04, 0x00, 0x01];
        match TlvFrame::decode(&bytes) {
            Err(DecodeError::Truncated {
                decoded,
                offset,
                tag,
                needed,
                available,
            }) => {
                assert_eq!(decoded.len(), 1);
                assert_eq!(decoded.records()[0], TlvRecord::u16(tags::NETWORK_ID, 7));
                assert_eq!(offset, 4);
                assert_eq!(tag, tags::ANCHOR_ID);
                assert_eq!(needed, 6);
                assert_eq!(available, 4);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn lone_trailing_tag_is_truncation() {
        let err = TlvFrame::decode(&[0x1F, 0x01, 0x02, 0x20]).unwrap_err();
        match err {
            DecodeError::Truncated {
                decoded, needed, ..
            } => {
                assert_eq!(decoded.len(), 1);
                assert_eq!(needed, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_stream_and_empty_values() {
        assert!(TlvFrame::decode(&[]).unwrap().is_empty());
        let frame = TlvFrame::decode(&[0x55, 0x00]).unwrap();
        assert_eq!(frame.records()[0].value(), &[] as &[u8]);
    }

    #[test]
    fn signed_values_are_big_endian() {
        let record = TlvRecord::i32(tags::TX_ANT_DLY, -12);
        assert_eq!(record.value(), &[0xFF, 0xFF, 0xFF, 0xF4]);
        assert_eq!(record.as_i32(), Some(-12));
        assert_eq!(record.as_u32(), None);
    }

    #[test]
    fn value_length_limit() {
        assert!(TlvRecord::new(0x70, vec![0; 255]).is_ok());
        assert_eq!(
            TlvRecord::new(0x70, vec![0; 256]),
            Err(EncodeError::ValueTooLong { tag: 0x70, len: 256 })
        );
    }

    #[test]
    fn display_matches_firmware_log() {
        assert_eq!(TlvRecord::u16(tags::ZONE_ID, 0x5A31).to_string(), "ZONE_ID=0x5A31");
        assert_eq!(TlvRecord::u32(tags::ANCHOR_ID, 1).to_string(), "ANCHOR_ID=0x00000001");
        assert_eq!(TlvRecord::u16(tags::HB_MS, 5000).to_string(), "HB_MS=5000");
        assert_eq!(TlvRecord::i32(tags::BIAS_TICKS, -3).to_string(), "BIAS_TICKS=-3");
        assert_eq!(
            TlvRecord::new(0x7E, vec![1, 2]).unwrap().to_string(),
            "TLV(0x7E)[len=2]: 01 02"
        );
    }

    #[test]
    fn find_returns_last_occurrence() {
        let frame: TlvFrame = vec![
            TlvRecord::u8(tags::PHY_CH, 5),
            TlvRecord::u8(tags::PHY_CH, 9),
        ]
        .into();
        assert_eq!(frame.find(tags::PHY_CH).and_then(TlvRecord::as_u32), Some(9));
        assert!(frame.find(tags::HB_MS).is_none());
    }
}
