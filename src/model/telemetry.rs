use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::device::Protocol;

/// TFMS90/Teltonika message discriminator (spec.md §3). `Other` covers TFMS90
/// types seen in the protocol doc but never explicitly handled (`DHR`, `GEO`,
/// `TMP`, `DID`, ...) — per spec.md §9's resolved Open Question, these are
/// stored as-seen with an otherwise-empty record rather than dropped, so the
/// device stops retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Td,
    Ts,
    Te,
    Hb,
    Flf,
    Fld,
    Ha2,
    Hb2,
    Hc2,
    Os3,
    Stat,
    Lg,
    Codec0x8,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Td => "TD",
            MessageType::Ts => "TS",
            MessageType::Te => "TE",
            MessageType::Hb => "HB",
            MessageType::Flf => "FLF",
            MessageType::Fld => "FLD",
            MessageType::Ha2 => "HA2",
            MessageType::Hb2 => "HB2",
            MessageType::Hc2 => "HC2",
            MessageType::Os3 => "OS3",
            MessageType::Stat => "STAT",
            MessageType::Lg => "LG",
            MessageType::Codec0x8 => "codec_0x8",
            MessageType::Other(s) => s.as_str(),
        }
    }

    /// Parses a TFMS90 message-type token into its known variant, falling
    /// back to `Other` for anything not named in spec.md §3.
    pub fn from_tfms90_token(token: &str) -> Self {
        match token {
            "TD" => MessageType::Td,
            "TS" => MessageType::Ts,
            "TE" => MessageType::Te,
            "HB" => MessageType::Hb,
            "FLF" => MessageType::Flf,
            "FLD" => MessageType::Fld,
            "HA2" => MessageType::Ha2,
            "HB2" => MessageType::Hb2,
            "HC2" => MessageType::Hc2,
            "OS3" => MessageType::Os3,
            "STAT" => MessageType::Stat,
            "LG" => MessageType::Lg,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-neutral parsed observation (spec.md §3). Top-level attributes are
/// the typed, queryable columns; `extras` is the sole free-form bag and is
/// NEVER expanded into columns by the Store Gateway (spec.md §4.1, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub canonical_device_key: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub satellites: Option<i32>,
    pub fuel_level: Option<f64>,
    pub ignition: Option<bool>,
    pub protocol: Protocol,
    pub message_type: MessageType,

    // TE promotion (spec.md §3, §4.2): only populated for `TE` records.
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub start_fuel: Option<f64>,
    pub end_fuel: Option<f64>,
    pub distance_km: Option<f64>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,

    #[serde(default)]
    pub extras: BTreeMap<String, Value>,
}

impl TelemetryRecord {
    /// A minimally-populated record: canonical key, timestamp, protocol and
    /// message type only, everything else null/empty. Used for TFMS90
    /// message types we recognize the frame for but have no payload
    /// semantics for (spec.md §9 Open Question resolution).
    pub fn empty(
        canonical_device_key: String,
        timestamp: DateTime<Utc>,
        protocol: Protocol,
        message_type: MessageType,
    ) -> Self {
        Self {
            canonical_device_key,
            timestamp,
            latitude: None,
            longitude: None,
            altitude: None,
            speed: None,
            heading: None,
            satellites: None,
            fuel_level: None,
            ignition: None,
            protocol,
            message_type,
            start_timestamp: None,
            end_timestamp: None,
            duration_seconds: None,
            start_fuel: None,
            end_fuel: None,
            distance_km: None,
            start_latitude: None,
            start_longitude: None,
            extras: BTreeMap::new(),
        }
    }

    /// True when the mirror view (external, §3 invariant) would skip this
    /// row: null or (0, 0) coordinates. The core still writes the row
    /// regardless — this is informational only.
    pub fn has_no_fix(&self) -> bool {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => lat == 0.0 && lon == 0.0,
            _ => true,
        }
    }
}
