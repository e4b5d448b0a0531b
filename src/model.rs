//! Domain value types shared by the feed decoder, the registry and the renderer.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Upstream record timestamp. Always UTC.
pub type Timestamp = DateTime<Utc>;

/// Stable car/driver number used as the entity identifier.
pub type EntityId = u32;

/// Distance to a car ahead or to the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gap {
    /// Time gap.
    Time(Duration),
    /// Gap expressed in whole laps ("+1 LAP").
    Laps(u32),
}

impl Gap {
    /// Parse a lapped gap string such as `"+1 LAP"` or `"+2 LAPS"`.
    pub fn parse_laps(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches('+').trim();
        let digits = trimmed
            .strip_suffix("LAPS")
            .or_else(|| trimmed.strip_suffix("LAP"))?
            .trim();

        digits.parse::<u32>().ok().map(Self::Laps)
    }
}

/// Sector and total times for one completed lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LapTime {
    pub lap_number: u32,
    pub sectors: [Option<Duration>; 3],
    pub total: Duration,
}

/// Tyre compound as reported by the stint feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compound {
    Soft,
    Medium,
    Hard,
    Intermediate,
    Wet,
    Unknown,
}

impl Compound {
    /// Map the upstream compound label. Unrecognised labels become `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "SOFT" => Self::Soft,
            "MEDIUM" => Self::Medium,
            "HARD" => Self::Hard,
            "INTERMEDIATE" => Self::Intermediate,
            "WET" => Self::Wet,
            _ => Self::Unknown,
        }
    }

    /// Single-letter marker used in the standings table.
    pub const fn short(self) -> &'static str {
        match self {
            Self::Soft => "S",
            Self::Medium => "M",
            Self::Hard => "H",
            Self::Intermediate => "I",
            Self::Wet => "W",
            Self::Unknown => "?",
        }
    }
}

/// Current tyre set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tyre {
    pub compound: Compound,
    /// Age of the set in laps, including laps run before this stint.
    pub age_laps: u32,
}

/// Pit lane status of a car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PitStatus {
    #[default]
    None,
    InPit,
    OutLap,
}

impl PitStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::InPit => "IN PITS",
            Self::OutLap => "OUT LAP",
        }
    }
}

/// Roster details for one driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub acronym: String,
    pub full_name: String,
    pub team: String,
    pub session_key: Option<u64>,
}

/// Event (meeting) the monitored session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Meeting {
    pub official_name: String,
    pub country: String,
    pub location: String,
    pub circuit: String,
}

impl Meeting {
    /// Location labels for the header line, with duplicates hidden.
    pub fn location_labels(&self) -> Vec<&str> {
        let mut labels = vec![self.country.as_str()];

        if self.location != self.country {
            labels.push(self.location.as_str());
        }

        if self.circuit != self.country && self.circuit != self.location {
            labels.push(self.circuit.as_str());
        }

        labels.retain(|label| !label.is_empty());
        labels
    }
}

/// One message from race control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceControlMessage {
    pub timestamp: Timestamp,
    pub category: String,
    pub flag: Option<String>,
    pub message: String,
    pub driver: Option<EntityId>,
    pub lap_number: Option<u32>,
}

impl fmt::Display for RaceControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.timestamp.format("%H:%M:%S"))?;

        if let Some(lap) = self.lap_number {
            write!(f, "L{lap} ")?;
        }

        f.write_str(&self.message)
    }
}
