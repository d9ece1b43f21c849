//! JSON view of the anchor's configurable TLV fields

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uwb_proto::{TlvFrame, TlvRecord, TlvValue, hex_dump, tags};

/// Configurable anchor fields. Absent fields are left untouched by a SET.
///
/// Numbers may be given as JSON numbers, `"0x.."` hex strings or decimal
/// strings. Values that do not fit the field are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnchorConfig {
    #[serde(rename = "NETWORK_ID", default, deserialize_with = "flexible", skip_serializing_if = "Option::is_none")]
    pub network_id: Option<u16>,
    #[serde(
        rename = "ZONE_ID",
        default,
        deserialize_with = "flexible",
        serialize_with = "hex_u16",
        skip_serializing_if = "Option::is_none"
    )]
    pub zone_id: Option<u16>,
    #[serde(
        rename = "ANCHOR_ID",
        default,
        deserialize_with = "flexible",
        serialize_with = "hex_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub anchor_id: Option<u32>,
    #[serde(rename = "TX_ANT_DLY", default, deserialize_with = "flexible_i32", skip_serializing_if = "Option::is_none")]
    pub tx_ant_dly: Option<i32>,
    #[serde(rename = "RX_ANT_DLY", default, deserialize_with = "flexible_i32", skip_serializing_if = "Option::is_none")]
    pub rx_ant_dly: Option<i32>,
    #[serde(rename = "BIAS_TICKS", default, deserialize_with = "flexible_i32", skip_serializing_if = "Option::is_none")]
    pub bias_ticks: Option<i32>,
    #[serde(rename = "LOG_LEVEL", default, deserialize_with = "flexible", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<u8>,
    #[serde(rename = "HB_MS", default, deserialize_with = "flexible", skip_serializing_if = "Option::is_none")]
    pub hb_ms: Option<u16>,
    #[serde(rename = "PHY_CH", default, deserialize_with = "flexible", skip_serializing_if = "Option::is_none")]
    pub phy_ch: Option<u8>,
    #[serde(rename = "PHY_SFDTO", default, deserialize_with = "flexible", skip_serializing_if = "Option::is_none")]
    pub phy_sfdto: Option<u16>,
}

/// A record returned by the anchor that has no place in [`AnchorConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtherRecord {
    pub tag: u8,
    pub name: Option<&'static str>,
    pub len: usize,
    pub hex: String,
    /// Firmware log rendering of the record
    pub text: String,
}

impl From<&TlvRecord> for OtherRecord {
    fn from(r: &TlvRecord) -> Self {
        Self {
            tag: r.tag(),
            name: r.name(),
            len: r.value().len(),
            hex: hex_dump(r.value()),
            text: r.to_string(),
        }
    }
}

impl AnchorConfig {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// SET payload holding the present fields, in tag order
    pub fn to_tlv(&self) -> TlvFrame {
        let mut frame = TlvFrame::new();
        let mut put = |record: Option<TlvRecord>| {
            if let Some(record) = record {
                frame.push(record);
            }
        };
        put(self.network_id.map(|v| TlvRecord::u16(tags::NETWORK_ID, v)));
        put(self.zone_id.map(|v| TlvRecord::u16(tags::ZONE_ID, v)));
        put(self.anchor_id.map(|v| TlvRecord::u32(tags::ANCHOR_ID, v)));
        put(self.tx_ant_dly.map(|v| TlvRecord::i32(tags::TX_ANT_DLY, v)));
        put(self.rx_ant_dly.map(|v| TlvRecord::i32(tags::RX_ANT_DLY, v)));
        put(self.bias_ticks.map(|v| TlvRecord::i32(tags::BIAS_TICKS, v)));
        put(self.log_level.map(|v| TlvRecord::u8(tags::LOG_LEVEL, v)));
        put(self.hb_ms.map(|v| TlvRecord::u16(tags::HB_MS, v)));
        put(self.phy_ch.map(|v| TlvRecord::u8(tags::PHY_CH, v)));
        put(self.phy_sfdto.map(|v| TlvRecord::u16(tags::PHY_SFDTO, v)));
        frame
    }

    /// Pick the schema fields out of a GET reply. Later records win; records
    /// with an unknown tag or an unexpected length are returned as-is.
    pub fn from_tlv(frame: &TlvFrame) -> (Self, Vec<OtherRecord>) {
        let mut config = Self::default();
        let mut other = Vec::new();

        for record in frame {
            match (record.tag(), record.typed()) {
                (tags::NETWORK_ID, TlvValue::U16(v)) => config.network_id = Some(v),
                (tags::ZONE_ID, TlvValue::U16(v)) => config.zone_id = Some(v),
                (tags::ANCHOR_ID, TlvValue::U32(v)) => config.anchor_id = Some(v),
                (tags::TX_ANT_DLY, TlvValue::I32(v)) => config.tx_ant_dly = Some(v),
                (tags::RX_ANT_DLY, TlvValue::I32(v)) => config.rx_ant_dly = Some(v),
                (tags::BIAS_TICKS, TlvValue::I32(v)) => config.bias_ticks = Some(v),
                (tags::LOG_LEVEL, TlvValue::U8(v)) => config.log_level = Some(v),
                (tags::HB_MS, TlvValue::U16(v)) => config.hb_ms = Some(v),
                (tags::PHY_CH, TlvValue::U8(v)) => config.phy_ch = Some(v),
                (tags::PHY_SFDTO, TlvValue::U16(v)) => config.phy_sfdto = Some(v),
                _ => other.push(OtherRecord::from(record)),
            }
        }
        (config, other)
    }
}

/// Accept a number, a `0x` hex string or a decimal string
fn flexible<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let Some((n, _)) = integer(deserializer)? else {
        return Ok(None);
    };
    T::try_from(n)
        .map(Some)
        .map_err(|_| D::Error::custom(format!("{n} is out of range")))
}

/// Like [`flexible`], but a hex string is the 32-bit two's complement
/// pattern, so `"0xFFFFFFF4"` is -12
fn flexible_i32<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some((n, hex)) = integer(deserializer)? else {
        return Ok(None);
    };
    let v = if hex {
        u32::try_from(n).map(|v| v as i32).ok()
    } else {
        i32::try_from(n).ok()
    };
    v.map(Some)
        .ok_or_else(|| D::Error::custom(format!("{n} is out of range")))
}

/// The integer and whether it was written in hex
fn integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<(i64, bool)>, D::Error> {
    let Some(value) = Option::<serde_json::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match &value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|n| Some((n, false)))
            .ok_or_else(|| D::Error::custom(format!("{n} is not an integer"))),
        serde_json::Value::String(s) => parse_int(s).map(Some).map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected a number, got {other}"))),
    }
}

fn parse_int(s: &str) -> Result<(i64, bool), String> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    i64::from_str_radix(digits, radix)
        .map(|n| (n, radix == 16))
        .map_err(|_| format!("{s:?} is not a number"))
}

fn hex_u16<S: Serializer>(v: &Option<u16>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("0x{v:04X}")),
        None => s.serialize_none(),
    }
}

fn hex_u32<S: Serializer>(v: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("0x{v:08X}")),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_numbers_and_strings() {
        let config: AnchorConfig = serde_json::from_str(
            r#"{"NETWORK_ID": 2, "ZONE_ID": "0x5A31", "ANCHOR_ID": "0x00000001", "HB_MS": "5000", "TX_ANT_DLY": -16450}"#,
        )
        .unwrap();
        assert_eq!(config.network_id, Some(2));
        assert_eq!(config.zone_id, Some(0x5A31));
        assert_eq!(config.anchor_id, Some(1));
        assert_eq!(config.hb_ms, Some(5000));
        assert_eq!(config.tx_ant_dly, Some(-16450));
        assert_eq!(config.log_level, None);
    }

    #[test]
    fn signed_fields_take_twos_complement_hex() {
        let config: AnchorConfig = serde_json::from_str(
            r#"{"TX_ANT_DLY": "0xFFFFFFF4", "RX_ANT_DLY": "0x10", "BIAS_TICKS": "-3"}"#,
        )
        .unwrap();
        assert_eq!(config.tx_ant_dly, Some(-12));
        assert_eq!(config.rx_ant_dly, Some(16));
        assert_eq!(config.bias_ticks, Some(-3));

        assert!(serde_json::from_str::<AnchorConfig>(r#"{"TX_ANT_DLY": "0x100000000"}"#).is_err());
        assert!(serde_json::from_str::<AnchorConfig>(r#"{"TX_ANT_DLY": 4294967284}"#).is_err());
    }

    #[test]
    fn rejects_out_of_range_and_junk() {
        assert!(serde_json::from_str::<AnchorConfig>(r#"{"NETWORK_ID": 70000}"#).is_err());
        assert!(serde_json::from_str::<AnchorConfig>(r#"{"PHY_CH": -1}"#).is_err());
        assert!(serde_json::from_str::<AnchorConfig>(r#"{"HB_MS": "fast"}"#).is_err());
        assert!(serde_json::from_str::<AnchorConfig>(r#"{"HB_MS": 1.5}"#).is_err());
        assert!(serde_json::from_str::<AnchorConfig>(r#"{"NOT_A_FIELD": 1}"#).is_err());
    }

    #[test]
    fn renders_ids_as_hex() {
        let config = AnchorConfig {
            network_id: Some(1),
            zone_id: Some(0x5A31),
            anchor_id: Some(1),
            ..AnchorConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"NETWORK_ID": 1, "ZONE_ID": "0x5A31", "ANCHOR_ID": "0x00000001"})
        );
    }

    #[test]
    fn to_tlv_keeps_tag_order() {
        let config = AnchorConfig {
            hb_ms: Some(5000),
            network_id: Some(2),
            phy_ch: Some(5),
            ..AnchorConfig::default()
        };
        assert_eq!(
            config.to_tlv().to_bytes(),
            vec![0x10, 2, 0x00, 0x02, 0x20, 2, 0x13, 0x88, 0x40, 1, 5]
        );
        assert!(AnchorConfig::default().to_tlv().is_empty());
    }

    #[test]
    fn from_tlv_splits_known_and_other() {
        let frame = TlvFrame::decode(&[
            0x10, 2, 0x00, 0x01, // NETWORK_ID
            0x01, 1, 0x03, // STATUS, not configurable
            0x20, 1, 0x05, // HB_MS with the wrong width
            0x7E, 2, 0xAA, 0xBB, // unknown
            0x13, 4, 0xFF, 0xFF, 0xBF, 0xBE, // TX_ANT_DLY = -16450
        ])
        .unwrap();
        let (config, other) = AnchorConfig::from_tlv(&frame);
        assert_eq!(config.network_id, Some(1));
        assert_eq!(config.tx_ant_dly, Some(-16450));
        assert_eq!(config.hb_ms, None);
        let other_tags: Vec<u8> = other.iter().map(|o| o.tag).collect();
        assert_eq!(other_tags, vec![0x01, 0x20, 0x7E]);
        assert_eq!(other[2].hex, "AA BB");
        assert_eq!(other[0].name, Some("STATUS"));
    }
}
