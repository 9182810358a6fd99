//! Store Gateway (spec.md §4.1): the single narrow seam between the parsing
//! path and the relational store. All SQL/JSONB handling lives behind this
//! trait — codecs and the Connection Handler only ever see these five
//! operations (plus `registered_imeis`, used for protocol interplay
//! validation per spec.md §4.1's closing sentence).

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::error::StoreError;
use crate::model::device::{Device, DeviceRegistration, Protocol};
use crate::model::telemetry::TelemetryRecord;

#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// `LookupByIMEI` (spec.md §4.1). Absence is not an error — callers
    /// branch on `Ok(None)`.
    async fn lookup_by_imei(&self, imei: &str) -> Result<Option<Device>, StoreError>;

    /// `AllocateShortID` (spec.md §4.1). Strictly increasing per protocol,
    /// starting at 100, never reused (spec.md §3 invariant).
    async fn allocate_short_id(&self, protocol: Protocol) -> Result<i32, StoreError>;

    /// `RegisterDevice` (spec.md §4.1). Commits short ID, canonical key,
    /// firmware, ICCID, and last-seen atomically from the device's point of
    /// view — if this fails after a successful `allocate_short_id`, the
    /// allocated ID is lost (spec.md §4.1, no recycling).
    async fn register_device(&self, patch: DeviceRegistration) -> Result<(), StoreError>;

    /// `TouchLastSeen` (spec.md §4.1). Called at most once per coalesce
    /// interval per connection (spec.md §4.5) — the gateway itself has no
    /// rate limit, that's the Connection Handler's job.
    async fn touch_last_seen(&self, canonical_key: &str, ts: DateTime<Utc>) -> Result<(), StoreError>;

    /// `InsertTelemetry` (spec.md §4.1). Must not fail on unknown top-level
    /// keys; `extras` is stripped and written to its own JSON column, never
    /// auto-expanded (spec.md §4.1 "lesson paid in blood").
    async fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<i64, StoreError>;

    /// The set of currently registered IMEIs, used only for protocol
    /// interplay validation (spec.md §4.1) — never consulted by the hot
    /// parsing path.
    async fn registered_imeis(&self) -> Result<HashSet<String>, StoreError>;
}
