//! TFMS90 text-framed codec (spec.md §4.2). Frames are ASCII, delimited by
//! `$` ... `#?` or `$` ... `#`, comma-separated fields. The parser tolerates
//! concatenated frames, partial frames split across reads, interleaved
//! whitespace/newlines, and leading garbage ahead of the next `$`.
//!
//! Field-offset note: spec.md describes the TD status-flags byte as "field
//! index 14, 0-based from the message-type slot," which is ambiguous against
//! its own prose. This implementation instead matches spec.md's own worked
//! examples (Scenario B/C) byte-for-byte: splitting the frame on `,` after
//! stripping the leading `$` (so the array's first element is the empty
//! string before the first comma) puts the status byte at array index 14.
//! That's what's implemented below, and what's tested against the scenarios.

use bitflags::bitflags;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::CodecError;
use crate::model::device::Protocol;
use crate::model::telemetry::{MessageType, TelemetryRecord};

use super::Tfms90Message;

/// `LG` payload: IMEI, firmware, ICCID (spec.md §4.2). Carries the frame's
/// token too, even though the LG ack format doesn't echo it — kept for
/// logging/correlation.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub token: String,
    pub imei: String,
    pub firmware: String,
    pub iccid: String,
}

pub struct Tfms90Codec {
    buf: Vec<u8>,
}

impl Default for Tfms90Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Tfms90Codec {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends `bytes` to the internal buffer and extracts every complete
    /// frame now available. Incomplete trailing bytes remain buffered for
    /// the next call — this is what makes fragmentation closure hold
    /// (spec.md §8 property 5): feeding a stream in one shot or split across
    /// two calls yields the same sequence of `Ok`/`Err` results.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Tfms90Message, CodecError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            match self.buf.iter().position(|&b| b == b'$') {
                Some(idx) => {
                    if idx > 0 {
                        self.buf.drain(0..idx);
                    }
                }
                None => {
                    // No frame start anywhere in the buffer: pure garbage.
                    self.buf.clear();
                    break;
                }
            }

            let Some(hash_idx) = self.buf.iter().skip(1).position(|&b| b == b'#').map(|p| p + 1)
            else {
                // Terminator not arrived yet; wait for more bytes.
                break;
            };

            let two_char_terminator = self.buf.get(hash_idx + 1) == Some(&b'?');
            let consumed = if two_char_terminator { hash_idx + 2 } else { hash_idx + 1 };
            let frame_bytes = self.buf[0..hash_idx].to_vec();
            self.buf.drain(0..consumed);

            out.push(parse_frame(&frame_bytes));
        }

        out
    }
}

fn parse_frame(frame_bytes: &[u8]) -> Result<Tfms90Message, CodecError> {
    let text = std::str::from_utf8(frame_bytes)
        .map_err(|_| CodecError::MalformedField("frame is not valid UTF-8/ASCII".to_string()))?;

    if !text.starts_with('$') {
        return Err(CodecError::MalformedField("frame missing leading $".to_string()));
    }
    let fields: Vec<&str> = text[1..].split(',').collect();

    // fields[0] is the empty string before the first comma (since the frame
    // is "$,token,type,...") — see the module doc comment on indexing.
    if fields.len() < 4 {
        return Err(CodecError::TooShort { needed: 4, have: fields.len() });
    }

    let token = fields[1].to_string();
    let message_type_token = fields[2];
    let device_id_or_imei = fields[3];

    if message_type_token == "LG" {
        if fields.len() < 6 {
            return Err(CodecError::TooShort { needed: 6, have: fields.len() });
        }
        return Ok(Tfms90Message::Login(LoginRequest {
            token,
            imei: device_id_or_imei.to_string(),
            firmware: fields[4].to_string(),
            iccid: fields[5].to_string(),
        }));
    }

    let message_type = MessageType::from_tfms90_token(message_type_token);
    let record = build_record(&message_type, device_id_or_imei, &fields)?;
    Ok(Tfms90Message::Data { record, token })
}

fn build_record(
    message_type: &MessageType,
    device_id_or_imei: &str,
    fields: &[&str],
) -> Result<TelemetryRecord, CodecError> {
    // Placeholder — the Connection Handler overwrites this with the
    // session's bound canonical key before insertion. Carrying the raw
    // wire identifier here is just a safe, inspectable default.
    let canonical_device_key = device_id_or_imei.to_string();

    match message_type {
        MessageType::Td => build_td(canonical_device_key, fields),
        MessageType::Te => build_te(canonical_device_key, fields),
        MessageType::Flf | MessageType::Fld => {
            build_fuel_event(canonical_device_key, message_type.clone(), fields)
        }
        MessageType::Ts | MessageType::Hb => build_basic_fix(canonical_device_key, message_type.clone(), fields),
        MessageType::Ha2 | MessageType::Hb2 | MessageType::Hc2 | MessageType::Os3 | MessageType::Stat => {
            build_event(canonical_device_key, message_type.clone(), fields)
        }
        MessageType::Other(_) => {
            // Unrecognized TFMS90 type: store as-seen with an empty
            // telemetry body (spec.md §9 Open Question, resolved in favor
            // of the "safer default" the spec itself names — this stops
            // the device from retrying a frame we'll never understand).
            let timestamp = timestamp_hex(fields.get(4).copied().unwrap_or("0")).unwrap_or_else(Utc::now);
            Ok(TelemetryRecord::empty(
                canonical_device_key,
                timestamp,
                Protocol::Tfms90,
                message_type.clone(),
            ))
        }
        MessageType::Lg | MessageType::Codec0x8 => unreachable!("handled by caller"),
    }
}

/// `$,<token>,TD,<id>,<seq>,<ts_hex>,<lat>,<lon>,<speed>,<heading>,<sats>,
///   <altitude>,<fuel>,<odometer>,<status_hex>,...,#?` — field positions
/// grounded on spec.md Scenario B/C's worked example.
fn build_td(canonical_device_key: String, fields: &[&str]) -> Result<TelemetryRecord, CodecError> {
    if fields.len() < 15 {
        return Err(CodecError::TooShort { needed: 15, have: fields.len() });
    }

    let timestamp = timestamp_hex(fields[5]).unwrap_or_else(Utc::now);
    let latitude = coord(fields[6], -90.0, 90.0);
    let longitude = coord(fields[7], -180.0, 180.0);
    let speed = fields[8].parse::<f64>().ok();
    let heading = fields[9].parse::<f64>().ok();
    let satellites = fields[10].parse::<i32>().ok();
    let altitude = fields[11].parse::<f64>().ok();
    let fuel_level = fields[12].parse::<f64>().ok();
    let ignition = status_flags_ignition(fields[14]);

    let mut extras = std::collections::BTreeMap::new();
    extras.insert("seq".to_string(), serde_json::Value::String(fields[4].to_string()));
    extras.insert("odometer".to_string(), serde_json::Value::String(fields[13].to_string()));
    if let Some(fuel) = fuel_level {
        extras.insert("fuel_level".to_string(), serde_json::json!(fuel));
    }
    for (i, value) in fields.iter().enumerate().skip(15) {
        if value.is_empty() {
            continue;
        }
        extras.insert(format!("field_{i}"), serde_json::Value::String(value.to_string()));
    }

    let mut record = TelemetryRecord::empty(canonical_device_key, timestamp, Protocol::Tfms90, MessageType::Td);
    record.latitude = latitude;
    record.longitude = longitude;
    record.altitude = altitude;
    record.speed = speed;
    record.heading = heading;
    record.satellites = satellites;
    record.fuel_level = fuel_level;
    record.ignition = ignition;
    record.extras = extras;
    Ok(record)
}

/// Generic fix-bearing frame (TS, HB): timestamp + position, no status byte
/// or fuel semantics are named in spec.md for these types.
fn build_basic_fix(
    canonical_device_key: String,
    message_type: MessageType,
    fields: &[&str],
) -> Result<TelemetryRecord, CodecError> {
    if fields.len() < 5 {
        return Err(CodecError::TooShort { needed: 5, have: fields.len() });
    }
    let timestamp = timestamp_hex(fields[4]).unwrap_or_else(Utc::now);
    let mut record = TelemetryRecord::empty(canonical_device_key, timestamp, Protocol::Tfms90, message_type);
    record.latitude = fields.get(5).and_then(|f| coord(f, -90.0, 90.0));
    record.longitude = fields.get(6).and_then(|f| coord(f, -180.0, 180.0));
    record.speed = fields.get(7).and_then(|f| f.parse().ok());
    record.heading = fields.get(8).and_then(|f| f.parse().ok());
    record.satellites = fields.get(9).and_then(|f| f.parse().ok());
    Ok(record)
}

/// `TE` (trip end). Field order follows the attribute list spec.md §4.2
/// gives for promotion, in that order: start_timestamp, end_timestamp,
/// duration_seconds, distance_km, start_fuel, end_fuel, start_latitude,
/// start_longitude — followed by the trip-end position, which the base
/// schema also needs for `latitude`/`longitude`.
fn build_te(canonical_device_key: String, fields: &[&str]) -> Result<TelemetryRecord, CodecError> {
    if fields.len() < 14 {
        return Err(CodecError::TooShort { needed: 14, have: fields.len() });
    }
    let start_timestamp = timestamp_hex(fields[4]);
    let end_timestamp = timestamp_hex(fields[5]).unwrap_or_else(Utc::now);
    let duration_seconds = fields[6].parse::<i64>().ok();
    let distance_km = fields[7].parse::<f64>().ok();
    let start_fuel = fields[8].parse::<f64>().ok();
    let end_fuel = fields[9].parse::<f64>().ok();
    let start_latitude = coord(fields[10], -90.0, 90.0);
    let start_longitude = coord(fields[11], -180.0, 180.0);
    let end_latitude = coord(fields[12], -90.0, 90.0);
    let end_longitude = coord(fields[13], -180.0, 180.0);

    let mut record =
        TelemetryRecord::empty(canonical_device_key, end_timestamp, Protocol::Tfms90, MessageType::Te);
    record.latitude = end_latitude;
    record.longitude = end_longitude;
    record.start_timestamp = start_timestamp;
    record.end_timestamp = Some(end_timestamp);
    record.duration_seconds = duration_seconds;
    record.distance_km = distance_km;
    record.start_fuel = start_fuel;
    record.end_fuel = end_fuel;
    record.start_latitude = start_latitude;
    record.start_longitude = start_longitude;
    Ok(record)
}

/// FLF/FLD (fuel fill/drain). Extras carry fuel_before, fuel_after, amount.
fn build_fuel_event(
    canonical_device_key: String,
    message_type: MessageType,
    fields: &[&str],
) -> Result<TelemetryRecord, CodecError> {
    if fields.len() < 8 {
        return Err(CodecError::TooShort { needed: 8, have: fields.len() });
    }
    let timestamp = timestamp_hex(fields[4]).unwrap_or_else(Utc::now);
    let fuel_before = fields[5].parse::<f64>().ok();
    let fuel_after = fields[6].parse::<f64>().ok();
    let amount = fields[7].parse::<f64>().ok();

    let mut record = TelemetryRecord::empty(canonical_device_key, timestamp, Protocol::Tfms90, message_type);
    let mut extras = std::collections::BTreeMap::new();
    if let Some(v) = fuel_before {
        extras.insert("fuel_before".to_string(), serde_json::json!(v));
    }
    if let Some(v) = fuel_after {
        extras.insert("fuel_after".to_string(), serde_json::json!(v));
    }
    if let Some(v) = amount {
        extras.insert("amount".to_string(), serde_json::json!(v));
    }
    record.extras = extras;
    Ok(record)
}

/// HA2/HB2/HC2/OS3/STAT: extras carry the event's numeric fields
/// positionally (spec.md names no fixed schema for these).
fn build_event(
    canonical_device_key: String,
    message_type: MessageType,
    fields: &[&str],
) -> Result<TelemetryRecord, CodecError> {
    if fields.len() < 5 {
        return Err(CodecError::TooShort { needed: 5, have: fields.len() });
    }
    let timestamp = timestamp_hex(fields[4]).unwrap_or_else(Utc::now);
    let mut record = TelemetryRecord::empty(canonical_device_key, timestamp, Protocol::Tfms90, message_type);
    let mut extras = std::collections::BTreeMap::new();
    for (i, value) in fields.iter().enumerate().skip(5) {
        if value.is_empty() {
            continue;
        }
        extras.insert(format!("field_{i}"), serde_json::Value::String(value.to_string()));
    }
    record.extras = extras;
    Ok(record)
}

/// Seconds since 2000-01-01 00:00:00 UTC, hex-encoded (spec.md §4.2).
fn timestamp_hex(hex: &str) -> Option<DateTime<Utc>> {
    let secs = u64::from_str_radix(hex, 16).ok()?;
    let epoch_2000 = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single()?;
    epoch_2000.checked_add_signed(chrono::Duration::seconds(secs as i64))
}

/// Decimal-degree coordinate; out-of-range or unparsable values fold to
/// `None` rather than failing the frame (spec.md §4.2, §8 property 6).
fn coord(raw: &str, min: f64, max: f64) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    if value < min || value > max {
        None
    } else {
        Some(value)
    }
}

bitflags! {
    /// TD status-flags byte (spec.md §4.2). Only bit 0 has defined meaning;
    /// the rest are carried for forward compatibility with firmware that
    /// sets reserved bits.
    struct TdStatusFlags: u8 {
        const IGNITION = 0b0000_0001;
    }
}

/// Bit 0 of the hex status-flags byte: ignition/ACC, 1 = ON. Invalid hex
/// folds to `None` (spec.md §4.2 — ignition is an explicit on/off/unknown
/// tri-state, never defaulted to a boolean, per spec.md §9's remedy).
fn status_flags_ignition(hex: &str) -> Option<bool> {
    let byte = u8::from_str_radix(hex, 16).ok()?;
    let flags = TdStatusFlags::from_bits_truncate(byte);
    Some(flags.contains(TdStatusFlags::IGNITION))
}

pub fn encode_login_ack(short_id: i32) -> Vec<u8> {
    format!("$,0,ACK,{short_id},#?").into_bytes()
}

pub fn encode_data_ack(token: &str, short_id: i32, record_count: usize) -> Vec<u8> {
    format!("$,{token},ACK,{short_id},{record_count},#?").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_login() {
        let mut codec = Tfms90Codec::new();
        let frame = b"$,0,LG,867762040399039,2.0.1,89970000000000000000,#?";
        let results = codec.feed(frame);
        assert_eq!(results.len(), 1);
        match results.into_iter().next().unwrap().unwrap() {
            Tfms90Message::Login(req) => {
                assert_eq!(req.imei, "867762040399039");
                assert_eq!(req.firmware, "2.0.1");
                assert_eq!(req.iccid, "89970000000000000000");
            }
            other => panic!("expected login, got {other:?}"),
        }
    }

    #[test]
    fn parses_td_with_ignition_on() {
        let mut codec = Tfms90Codec::new();
        let frame =
            b"$,0,TD,100,1,1A2B3C4D,13.067439,80.237617,45,270,12,1.2,45.5,123456,0F,03,0.0,12.8,22,#?";
        let results = codec.feed(frame);
        assert_eq!(results.len(), 1);
        match results.into_iter().next().unwrap().unwrap() {
            Tfms90Message::Data { record, token } => {
                assert_eq!(token, "0");
                assert_eq!(record.latitude, Some(13.067439));
                assert_eq!(record.longitude, Some(80.237617));
                assert_eq!(record.speed, Some(45.0));
                assert_eq!(record.heading, Some(270.0));
                assert_eq!(record.satellites, Some(12));
                assert_eq!(record.fuel_level, Some(45.5));
                assert_eq!(record.ignition, Some(true));
                assert_eq!(record.message_type.as_str(), "TD");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn parses_td_with_ignition_off() {
        let mut codec = Tfms90Codec::new();
        let frame =
            b"$,0,TD,100,1,1A2B3C4D,13.067439,80.237617,45,270,12,1.2,45.5,123456,0E,03,0.0,12.8,22,#?";
        let results = codec.feed(frame);
        match results.into_iter().next().unwrap().unwrap() {
            Tfms90Message::Data { record, .. } => assert_eq!(record.ignition, Some(false)),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn fragmentation_closure() {
        let frame =
            b"$,0,TD,100,1,1A2B3C4D,13.067439,80.237617,45,270,12,1.2,45.5,123456,0F,03,0.0,12.8,22,#?";

        let mut whole = Tfms90Codec::new();
        let whole_results = whole.feed(frame);

        let mut split = Tfms90Codec::new();
        let (a, b) = frame.split_at(10);
        let mut split_results = split.feed(a);
        split_results.extend(split.feed(b));

        assert_eq!(whole_results.len(), split_results.len());
        for (w, s) in whole_results.iter().zip(split_results.iter()) {
            match (w, s) {
                (Ok(Tfms90Message::Data { record: wr, token: wt }), Ok(Tfms90Message::Data { record: sr, token: st })) => {
                    assert_eq!(wt, st);
                    assert_eq!(wr.latitude, sr.latitude);
                    assert_eq!(wr.longitude, sr.longitude);
                    assert_eq!(wr.ignition, sr.ignition);
                }
                _ => panic!("fragmentation produced divergent results"),
            }
        }
    }

    #[test]
    fn tolerates_leading_garbage_and_concatenated_frames() {
        let mut codec = Tfms90Codec::new();
        let input = b"garbage-bytes-before-frame$,1,HB,100,1A2B3C4D,#?\n$,2,HB,100,1A2B3C4E,#?";
        let results = codec.feed(input);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
    }

    #[test]
    fn out_of_range_coordinates_null_but_not_dropped() {
        let mut codec = Tfms90Codec::new();
        let frame = b"$,0,TD,100,1,1A2B3C4D,999.0,80.237617,45,270,12,1.2,45.5,123456,0F,#?";
        let results = codec.feed(frame);
        match results.into_iter().next().unwrap().unwrap() {
            Tfms90Message::Data { record, .. } => {
                assert_eq!(record.latitude, None);
                assert_eq!(record.longitude, Some(80.237617));
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn ack_frames_match_spec_format() {
        assert_eq!(encode_login_ack(100), b"$,0,ACK,100,#?".to_vec());
        assert_eq!(encode_data_ack("1", 100, 1), b"$,1,ACK,100,1,#?".to_vec());
    }
}
