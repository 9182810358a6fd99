use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The wire protocol a device speaks. Also doubles as the per-protocol
/// short-ID namespace (spec.md §3: short IDs are unique per protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tfms90,
    Teltonika,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tfms90 => "tfms90",
            Protocol::Teltonika => "teltonika",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical tracker, as persisted by the Store Gateway (spec.md §3).
///
/// `canonical_key` is the only identifier visible outside the core: the raw
/// IMEI until a TFMS90 device completes registration, `TFMS90_<short_id>`
/// afterwards, or the raw IMEI permanently for Teltonika devices.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub canonical_key: String,
    pub imei: Option<String>,
    pub protocol: Protocol,
    pub short_device_id: Option<i32>,
    pub firmware_version: Option<String>,
    pub sim_iccid: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Device {
    /// Builds the canonical key a TFMS90 device should carry once a short ID
    /// is assigned. Teltonika devices never leave the raw IMEI.
    pub fn tfms90_canonical_key(short_id: i32) -> String {
        format!("TFMS90_{short_id}")
    }
}

/// A patch applied to a Device row on first registration (spec.md §4.1
/// `RegisterDevice`). Fields are all-or-nothing: the Store Gateway writes
/// every field in one statement so allocation and registration commit
/// atomically from the device's point of view.
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub device_id: Uuid,
    pub canonical_key: String,
    pub short_id: i32,
    pub firmware_version: Option<String>,
    pub sim_iccid: Option<String>,
    pub last_seen: DateTime<Utc>,
}
