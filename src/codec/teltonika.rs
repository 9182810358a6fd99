//! Teltonika Codec 8E binary codec (spec.md §4.3). Two framings share one
//! stream: an initial two-byte-length IMEI greeting, then AVL batches
//! (preamble, length, codec id, records, trailing record count, CRC16/IBM).
//!
//! IO-element layout follows Codec 8E's 2-byte IDs and 2-byte per-width
//! counts (grounded on the `AVLEventIO`/`u16` id modeling in
//! `examples/other_examples/...nom-teltonika__src-protocol.rs.rs`, which
//! covers both Codec 8 and 8E in one type). Real Codec 8E also defines a
//! fifth variable-length ("NX") IO block; spec.md §4.3 names only the four
//! fixed-width blocks, so NX is out of scope here (see DESIGN.md).

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::error::CodecError;
use crate::model::device::Protocol;
use crate::model::telemetry::{MessageType, TelemetryRecord};

use super::crc16::crc16_ibm;

const EXPECTED_CODEC_ID: u8 = 0x8E;

// Minimum fixed IO-id -> attribute mapping (spec.md §4.3: "at minimum:
// ignition, fuel level, odometer, battery voltage"). Real deployments vary
// by device model; these are a reasonable default mapping, documented as an
// assumption in DESIGN.md since spec.md gives no worked Teltonika IO values.
const IO_ID_IGNITION: u16 = 239;
const IO_ID_FUEL_LEVEL: u16 = 84;
const IO_ID_ODOMETER: u16 = 16;
const IO_ID_BATTERY_VOLTAGE: u16 = 67;

#[derive(Debug, Clone)]
pub enum TeltonikaFrame {
    /// The IMEI greeting. The Connection Handler decides acceptance via
    /// `StoreGateway::lookup_by_imei` — the codec only parses the digits.
    Greeting { imei: String },
    /// A CRC-valid AVL batch. CRC-invalid batches surface as
    /// `CodecError::CrcMismatch` instead (spec.md §4.3/§8 property 7).
    AvlBatch { records: Vec<TelemetryRecord> },
}

enum State {
    AwaitingGreeting,
    AwaitingAvl,
}

pub struct TeltonikaCodec {
    buf: Vec<u8>,
    state: State,
}

impl Default for TeltonikaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TeltonikaCodec {
    pub fn new() -> Self {
        Self { buf: Vec::new(), state: State::AwaitingGreeting }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<TeltonikaFrame, CodecError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            let result = match self.state {
                State::AwaitingGreeting => self.try_parse_greeting(),
                State::AwaitingAvl => self.try_parse_avl(),
            };
            match result {
                Some(r) => out.push(r),
                None => break,
            }
        }

        out
    }

    fn try_parse_greeting(&mut self) -> Option<Result<TeltonikaFrame, CodecError>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let imei_bytes: Vec<u8> = self.buf[2..2 + len].to_vec();
        self.buf.drain(0..2 + len);
        self.state = State::AwaitingAvl;

        match std::str::from_utf8(&imei_bytes) {
            Ok(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                Some(Ok(TeltonikaFrame::Greeting { imei: s.to_string() }))
            }
            _ => Some(Err(CodecError::MalformedField("IMEI greeting is not ASCII digits".to_string()))),
        }
    }

    fn try_parse_avl(&mut self) -> Option<Result<TeltonikaFrame, CodecError>> {
        if self.buf.len() < 8 {
            return None;
        }
        if self.buf[0..4] != [0, 0, 0, 0] {
            // No self-synchronizing delimiter exists in binary AVL framing
            // (unlike TFMS90's `$`), so a corrupted preamble can't be
            // resynchronized within the session — this is treated as
            // connection-fatal by the handler, not a per-frame skip.
            self.buf.clear();
            return Some(Err(CodecError::MalformedField("expected zero preamble".to_string())));
        }

        let data_len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        let total_needed = 8 + data_len + 4;
        if self.buf.len() < total_needed {
            return None;
        }

        let data_field = self.buf[8..8 + data_len].to_vec();
        let crc_bytes = &self.buf[8 + data_len..total_needed];
        let expected_crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual_crc = crc16_ibm(&data_field) as u32;

        self.buf.drain(0..total_needed);

        if actual_crc != expected_crc {
            return Some(Err(CodecError::CrcMismatch { expected: expected_crc, actual: actual_crc }));
        }

        Some(parse_data_field(&data_field).map(|records| TeltonikaFrame::AvlBatch { records }))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::TooShort { needed: self.pos + n, have: self.buf.len() });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

fn parse_data_field(data: &[u8]) -> Result<Vec<TelemetryRecord>, CodecError> {
    let mut cursor = Cursor::new(data);
    let codec_id = cursor.u8()?;
    if codec_id != EXPECTED_CODEC_ID {
        return Err(CodecError::UnknownCodecId(codec_id));
    }
    let record_count = cursor.u8()? as usize;

    let mut records = Vec::with_capacity(record_count);
    for _ in 0..record_count {
        records.push(parse_record(&mut cursor)?);
    }

    let trailing_count = cursor.u8()? as usize;
    if trailing_count != record_count {
        return Err(CodecError::MalformedField(format!(
            "trailing record count {trailing_count} does not match leading count {record_count}"
        )));
    }

    Ok(records)
}

fn parse_record(cursor: &mut Cursor<'_>) -> Result<TelemetryRecord, CodecError> {
    let timestamp_ms = cursor.u64()? as i64;
    let timestamp = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or_else(|| CodecError::MalformedField(format!("unrepresentable timestamp {timestamp_ms}")))?;
    let priority = cursor.u8()?;
    let lat_raw = cursor.i32()?;
    let lon_raw = cursor.i32()?;
    let altitude = cursor.u16()?;
    let angle = cursor.u16()?;
    let satellites = cursor.u8()?;
    let speed = cursor.u16()?;

    let latitude = lat_raw as f64 / 1e7;
    let longitude = lon_raw as f64 / 1e7;

    // Event IO ID (which element triggered this record) + total count are
    // informational; the four fixed-width blocks carry the actual elements.
    let _event_io_id = cursor.u16()?;
    let _total_count = cursor.u16()?;

    let mut ignition = None;
    let mut fuel_level = None;
    let mut extras = BTreeMap::new();

    let n1 = cursor.u16()?;
    for _ in 0..n1 {
        let id = cursor.u16()?;
        let value = cursor.u8()? as u64;
        apply_io_element(id, value, &mut ignition, &mut fuel_level, &mut extras);
    }
    let n2 = cursor.u16()?;
    for _ in 0..n2 {
        let id = cursor.u16()?;
        let value = cursor.u16()? as u64;
        apply_io_element(id, value, &mut ignition, &mut fuel_level, &mut extras);
    }
    let n4 = cursor.u16()?;
    for _ in 0..n4 {
        let id = cursor.u16()?;
        let value = cursor.u32()? as u64;
        apply_io_element(id, value, &mut ignition, &mut fuel_level, &mut extras);
    }
    let n8 = cursor.u16()?;
    for _ in 0..n8 {
        let id = cursor.u16()?;
        let value = cursor.u64()?;
        apply_io_element(id, value, &mut ignition, &mut fuel_level, &mut extras);
    }

    extras.insert("priority".to_string(), serde_json::json!(priority));

    let mut record =
        TelemetryRecord::empty(String::new(), timestamp, Protocol::Teltonika, MessageType::Codec0x8);
    record.latitude = Some(latitude);
    record.longitude = Some(longitude);
    record.altitude = Some(altitude as f64);
    record.heading = Some(angle as f64);
    record.satellites = Some(satellites as i32);
    record.speed = Some(speed as f64);
    record.ignition = ignition;
    record.fuel_level = fuel_level;
    record.extras = extras;
    Ok(record)
}

fn apply_io_element(
    id: u16,
    value: u64,
    ignition: &mut Option<bool>,
    fuel_level: &mut Option<f64>,
    extras: &mut BTreeMap<String, serde_json::Value>,
) {
    match id {
        IO_ID_IGNITION => *ignition = Some(value != 0),
        IO_ID_FUEL_LEVEL => *fuel_level = Some(value as f64),
        IO_ID_ODOMETER => {
            extras.insert("odometer".to_string(), serde_json::json!(value));
        }
        IO_ID_BATTERY_VOLTAGE => {
            extras.insert("battery_voltage".to_string(), serde_json::json!(value));
        }
        other => {
            extras.insert(format!("io_{other}"), serde_json::json!(value));
        }
    }
}

/// Ack byte for the IMEI greeting: `0x01` accepted, `0x00` rejected
/// (spec.md §4.3).
pub fn encode_imei_ack(accepted: bool) -> u8 {
    if accepted {
        0x01
    } else {
        0x00
    }
}

/// Big-endian 32-bit accepted-record count (spec.md §4.3/§8 property 2).
/// `0` both for a CRC-invalid batch (property 7) and for any other
/// all-fail outcome.
pub fn encode_avl_ack(accepted_count: u32) -> [u8; 4] {
    accepted_count.to_be_bytes()
}
