pub mod client;
pub mod parse;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::model::{DriverInfo, EntityId, Gap, RaceControlMessage, Timestamp, Tyre};

pub use self::client::{FetchCause, FetchError, Fetcher, HttpTransport, Transport, TransportError};

/// One class of upstream event, polled and reconciled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Drivers,
    Position,
    Intervals,
    Laps,
    Stints,
    Pit,
    RaceControl,
}

/// How a category's batches are turned into registry updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryKind {
    /// Establishes the entity set; the only kind allowed to create entities.
    Roster,
    /// One record per entity per tick; reconciled from complete snapshots.
    Snapshot,
    /// Sparse events; every new record is applied in order.
    Event,
}

impl Category {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drivers => "drivers",
            Self::Position => "position",
            Self::Intervals => "intervals",
            Self::Laps => "laps",
            Self::Stints => "stints",
            Self::Pit => "pit",
            Self::RaceControl => "race_control",
        }
    }

    /// Upstream API path segment.
    pub const fn endpoint(self) -> &'static str {
        self.as_str()
    }

    /// Field holding the record timestamp, or `None` for categories the
    /// upstream cannot filter by time.
    pub const fn time_field(self) -> Option<&'static str> {
        match self {
            Self::Drivers | Self::Stints => None,
            Self::Laps => Some("date_start"),
            Self::Position | Self::Intervals | Self::Pit | Self::RaceControl => Some("date"),
        }
    }

    pub const fn kind(self) -> CategoryKind {
        match self {
            Self::Drivers => CategoryKind::Roster,
            Self::Position | Self::Intervals | Self::Laps | Self::Stints => CategoryKind::Snapshot,
            Self::Pit | Self::RaceControl => CategoryKind::Event,
        }
    }

    /// Return all categories in polling priority order.
    pub fn all() -> &'static [Self] {
        &[
            Self::Drivers,
            Self::Position,
            Self::Intervals,
            Self::Laps,
            Self::Stints,
            Self::Pit,
            Self::RaceControl,
        ]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded category-specific fields of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Driver(DriverInfo),
    Position {
        position: u32,
    },
    Interval {
        interval: Option<Gap>,
        gap_to_leader: Option<Gap>,
    },
    Lap {
        lap_number: u32,
        sectors: [Option<Duration>; 3],
        duration: Option<Duration>,
        pit_out: bool,
    },
    Stint(Tyre),
    Pit {
        lap_number: Option<u32>,
        duration: Option<Duration>,
    },
    RaceControl(RaceControlMessage),
}

impl Payload {
    /// Category this payload shape belongs to.
    pub const fn category(&self) -> Category {
        match self {
            Self::Driver(_) => Category::Drivers,
            Self::Position { .. } => Category::Position,
            Self::Interval { .. } => Category::Intervals,
            Self::Lap { .. } => Category::Laps,
            Self::Stint(_) => Category::Stints,
            Self::Pit { .. } => Category::Pit,
            Self::RaceControl(_) => Category::RaceControl,
        }
    }
}

/// One usable upstream event.
///
/// Race-control messages that are not tied to a car carry entity id 0,
/// which is never a valid car number.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub entity_id: EntityId,
    pub timestamp: Timestamp,
    pub payload: Payload,
}

/// Records returned by one fetch, in upstream order.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub category: Category,
    pub records: Vec<RawRecord>,
    /// Elements dropped because they could not be decoded.
    pub dropped: usize,
    pub received_at: Timestamp,
}

impl RawBatch {
    pub fn empty(category: Category, received_at: Timestamp) -> Self {
        Self {
            category,
            records: Vec::new(),
            dropped: 0,
            received_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Number of distinct entity ids present in the batch.
    pub fn distinct_entities(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.entity_id)
            .collect::<BTreeSet<_>>()
            .len()
    }
}
