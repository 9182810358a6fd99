pub mod crc16;
pub mod teltonika;
pub mod tfms90;

use crate::model::telemetry::TelemetryRecord;

/// A fully parsed TFMS90 frame, before the Connection Handler resolves it
/// against the bound session (spec.md §4.2).
#[derive(Debug, Clone)]
pub enum Tfms90Message {
    Login(tfms90::LoginRequest),
    Data { record: TelemetryRecord, token: String },
}
