//! Decoding of upstream JSON batches into [`RawRecord`] values.
//!
//! A batch must be a top-level JSON array. Elements are decoded one at a
//! time; an element that cannot be decoded is dropped and counted, it never
//! fails the batch.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::{Category, Payload, RawBatch, RawRecord};
use crate::model::{
    Compound, DriverInfo, EntityId, Gap, Meeting, RaceControlMessage, Timestamp, Tyre,
};

/// Errors that reject a whole response body.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON array, got {kind}")]
    NotAnArray { kind: &'static str },
}

/// Errors that drop a single record.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("decoding record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unparseable timestamp {raw:?}")]
    InvalidTimestamp { raw: String },
}

/// Decode a response body for `category`.
///
/// Untimed categories are stamped with `received_at`. Stints are ordered by
/// stint number so that a driver's current stint is always the last one.
pub fn parse_batch(
    category: Category,
    body: &[u8],
    received_at: Timestamp,
) -> Result<RawBatch, PayloadError> {
    let items = top_level_array(body)?;

    let mut batch = RawBatch::empty(category, received_at);
    batch.records.reserve(items.len());

    match category {
        Category::Drivers => decode_batch::<DriverRecord>(&mut batch, items),
        Category::Position => decode_batch::<PositionRecord>(&mut batch, items),
        Category::Intervals => decode_batch::<IntervalRecord>(&mut batch, items),
        Category::Laps => decode_batch::<LapRecord>(&mut batch, items),
        Category::Stints => decode_batch::<StintRecord>(&mut batch, items),
        Category::Pit => decode_batch::<PitRecord>(&mut batch, items),
        Category::RaceControl => decode_batch::<RaceControlRecord>(&mut batch, items),
    }

    Ok(batch)
}

/// Decode one array element.
pub fn parse_record(
    category: Category,
    item: Value,
    received_at: Timestamp,
) -> Result<RawRecord, RecordError> {
    match category {
        Category::Drivers => decode::<DriverRecord>(item, received_at),
        Category::Position => decode::<PositionRecord>(item, received_at),
        Category::Intervals => decode::<IntervalRecord>(item, received_at),
        Category::Laps => decode::<LapRecord>(item, received_at),
        Category::Stints => decode::<StintRecord>(item, received_at),
        Category::Pit => decode::<PitRecord>(item, received_at),
        Category::RaceControl => decode::<RaceControlRecord>(item, received_at),
    }
}

/// Decode the meeting (event) description. Returns `None` for an empty array.
pub fn parse_meeting(body: &[u8]) -> Result<Option<Meeting>, PayloadError> {
    let Some(first) = top_level_array(body)?.into_iter().next() else {
        return Ok(None);
    };

    let meeting: MeetingRecord = serde_json::from_value(first)?;

    Ok(Some(Meeting {
        official_name: meeting.meeting_official_name.unwrap_or_default(),
        country: meeting.country_name.unwrap_or_default(),
        location: meeting.location.unwrap_or_default(),
        circuit: meeting.circuit_short_name.unwrap_or_default(),
    }))
}

/// Parse an upstream timestamp.
///
/// Accepts RFC 3339 with an offset, or a naive ISO 8601 timestamp which is
/// taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<Timestamp, RecordError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| RecordError::InvalidTimestamp {
            raw: raw.to_string(),
        })
}

fn top_level_array(body: &[u8]) -> Result<Vec<Value>, PayloadError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Array(items) => Ok(items),
        other => Err(PayloadError::NotAnArray {
            kind: value_kind(&other),
        }),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A category's wire record.
trait FeedRecord: DeserializeOwned {
    /// Ordering key within an untimed batch; later entries supersede earlier ones.
    fn sequence(&self) -> u32 {
        0
    }

    fn into_record(self, received_at: Timestamp) -> RawRecord;
}

fn decode<R: FeedRecord>(item: Value, received_at: Timestamp) -> Result<RawRecord, RecordError> {
    let record: R = serde_json::from_value(item)?;
    Ok(record.into_record(received_at))
}

/// Decode every element, dropping and counting the ones that fail.
fn decode_batch<R: FeedRecord>(batch: &mut RawBatch, items: Vec<Value>) {
    let mut decoded: Vec<R> = Vec::with_capacity(items.len());

    for item in items {
        match serde_json::from_value::<R>(item) {
            Ok(record) => decoded.push(record),
            Err(e) => {
                debug!(category = %batch.category, error = %e, "dropping malformed record");
                batch.dropped += 1;
            }
        }
    }

    // Stable, so equal keys keep upstream order.
    decoded.sort_by_key(R::sequence);

    let received_at = batch.received_at;
    batch
        .records
        .extend(decoded.into_iter().map(|r| r.into_record(received_at)));
}

// --- JSON record structures ---

#[derive(Deserialize)]
struct DriverRecord {
    driver_number: EntityId,
    name_acronym: String,
    full_name: Option<String>,
    team_name: Option<String>,
    session_key: Option<u64>,
}

impl FeedRecord for DriverRecord {
    fn into_record(self, received_at: Timestamp) -> RawRecord {
        RawRecord {
            entity_id: self.driver_number,
            timestamp: received_at,
            payload: Payload::Driver(DriverInfo {
                acronym: self.name_acronym,
                full_name: self.full_name.unwrap_or_default(),
                team: self.team_name.unwrap_or_default(),
                session_key: self.session_key,
            }),
        }
    }
}

#[derive(Deserialize)]
struct PositionRecord {
    driver_number: EntityId,
    #[serde(deserialize_with = "timestamp")]
    date: Timestamp,
    position: u32,
}

impl FeedRecord for PositionRecord {
    fn into_record(self, _: Timestamp) -> RawRecord {
        RawRecord {
            entity_id: self.driver_number,
            timestamp: self.date,
            payload: Payload::Position {
                position: self.position,
            },
        }
    }
}

#[derive(Deserialize)]
struct IntervalRecord {
    driver_number: EntityId,
    #[serde(deserialize_with = "timestamp")]
    date: Timestamp,
    #[serde(default, deserialize_with = "gap")]
    interval: Option<Gap>,
    #[serde(default, deserialize_with = "gap")]
    gap_to_leader: Option<Gap>,
}

impl FeedRecord for IntervalRecord {
    fn into_record(self, _: Timestamp) -> RawRecord {
        RawRecord {
            entity_id: self.driver_number,
            timestamp: self.date,
            payload: Payload::Interval {
                interval: self.interval,
                gap_to_leader: self.gap_to_leader,
            },
        }
    }
}

#[derive(Deserialize)]
struct LapRecord {
    driver_number: EntityId,
    #[serde(deserialize_with = "timestamp")]
    date_start: Timestamp,
    lap_number: u32,
    #[serde(default, deserialize_with = "seconds")]
    duration_sector_1: Option<Duration>,
    #[serde(default, deserialize_with = "seconds")]
    duration_sector_2: Option<Duration>,
    #[serde(default, deserialize_with = "seconds")]
    duration_sector_3: Option<Duration>,
    #[serde(default, deserialize_with = "seconds")]
    lap_duration: Option<Duration>,
    is_pit_out_lap: Option<bool>,
}

impl FeedRecord for LapRecord {
    fn into_record(self, _: Timestamp) -> RawRecord {
        RawRecord {
            entity_id: self.driver_number,
            timestamp: self.date_start,
            payload: Payload::Lap {
                lap_number: self.lap_number,
                sectors: [
                    self.duration_sector_1,
                    self.duration_sector_2,
                    self.duration_sector_3,
                ],
                duration: self.lap_duration,
                pit_out: self.is_pit_out_lap.unwrap_or(false),
            },
        }
    }
}

#[derive(Deserialize)]
struct StintRecord {
    driver_number: EntityId,
    stint_number: Option<u32>,
    compound: Option<String>,
    tyre_age_at_start: Option<u32>,
    lap_start: Option<u32>,
    lap_end: Option<u32>,
}

impl FeedRecord for StintRecord {
    fn sequence(&self) -> u32 {
        self.stint_number.unwrap_or(0)
    }

    fn into_record(self, received_at: Timestamp) -> RawRecord {
        let laps_in_stint = match (self.lap_start, self.lap_end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        };

        RawRecord {
            entity_id: self.driver_number,
            timestamp: received_at,
            payload: Payload::Stint(Tyre {
                compound: self
                    .compound
                    .as_deref()
                    .map(Compound::from_label)
                    .unwrap_or(Compound::Unknown),
                age_laps: self
                    .tyre_age_at_start
                    .unwrap_or(0)
                    .saturating_add(laps_in_stint),
            }),
        }
    }
}

#[derive(Deserialize)]
struct PitRecord {
    driver_number: EntityId,
    #[serde(deserialize_with = "timestamp")]
    date: Timestamp,
    lap_number: Option<u32>,
    #[serde(default, deserialize_with = "seconds")]
    pit_duration: Option<Duration>,
}

impl FeedRecord for PitRecord {
    fn into_record(self, _: Timestamp) -> RawRecord {
        RawRecord {
            entity_id: self.driver_number,
            timestamp: self.date,
            payload: Payload::Pit {
                lap_number: self.lap_number,
                duration: self.pit_duration,
            },
        }
    }
}

#[derive(Deserialize)]
struct RaceControlRecord {
    #[serde(deserialize_with = "timestamp")]
    date: Timestamp,
    driver_number: Option<EntityId>,
    category: Option<String>,
    flag: Option<String>,
    message: String,
    lap_number: Option<u32>,
}

impl FeedRecord for RaceControlRecord {
    fn into_record(self, _: Timestamp) -> RawRecord {
        let entity_id = self.driver_number.unwrap_or(0);

        RawRecord {
            entity_id,
            timestamp: self.date,
            payload: Payload::RaceControl(RaceControlMessage {
                timestamp: self.date,
                category: self.category.unwrap_or_else(|| "Other".to_string()),
                flag: self.flag,
                message: self.message,
                driver: (entity_id != 0).then_some(entity_id),
                lap_number: self.lap_number,
            }),
        }
    }
}

#[derive(Deserialize)]
struct MeetingRecord {
    meeting_official_name: Option<String>,
    country_name: Option<String>,
    location: Option<String>,
    circuit_short_name: Option<String>,
}

/// Gap as sent upstream: seconds, or a lapped label such as `"+1 LAP"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireGap {
    Seconds(f64),
    Label(String),
}

fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(de::Error::custom)
}

fn duration_from_secs<E: de::Error>(secs: f64) -> Result<Duration, E> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| E::custom(format!("invalid duration of {secs} seconds")))
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Option::<f64>::deserialize(deserializer)?
        .map(duration_from_secs)
        .transpose()
}

fn gap<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Gap>, D::Error> {
    match Option::<WireGap>::deserialize(deserializer)? {
        None => Ok(None),
        Some(WireGap::Seconds(secs)) => duration_from_secs(secs).map(|d| Some(Gap::Time(d))),
        Some(WireGap::Label(label)) => Gap::parse_laps(&label)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unrecognised gap {label:?}"))),
    }
}
