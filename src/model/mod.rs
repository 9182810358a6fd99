pub mod device;
pub mod telemetry;

pub use device::{Device, Protocol};
pub use telemetry::TelemetryRecord;
