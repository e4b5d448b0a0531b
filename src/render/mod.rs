//! Plain-text standings table.

use std::io::{self, Write};
use std::time::Duration;

use crate::model::{Gap, LapTime};
use crate::registry::{EntityView, RegistryView};

const COLUMNS: [(&str, usize); 12] = [
    ("POS", 3),
    ("DRIVER", 22),
    ("INTERVAL", 9),
    ("TO LEAD", 9),
    ("S1", 7),
    ("S2", 7),
    ("S3", 7),
    ("LAST LAP", 9),
    ("BEST LAP", 9),
    ("PIT/OUT", 7),
    ("TYRE", 4),
    ("AGE", 3),
];

/// Format a duration as `SS.mmm`, or `M:SS.mmm` from one minute up.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    let minutes = millis / 60_000;
    let seconds = (millis / 1000) % 60;
    let rest = millis % 1000;

    if minutes > 0 {
        format!("{minutes}:{seconds:02}.{rest:03}")
    } else {
        format!("{seconds:02}.{rest:03}")
    }
}

/// Format a gap with a leading `+`. Lapped gaps render as `+N LAP`.
pub fn format_gap(gap: Option<Gap>) -> String {
    match gap {
        None => String::new(),
        Some(Gap::Laps(n)) => format!("+{n} LAP"),
        Some(Gap::Time(d)) => format!("+{}", format_duration(d)),
    }
}

fn format_opt(d: Option<Duration>) -> String {
    d.map(format_duration).unwrap_or_default()
}

/// Writes the standings table whenever a new view version is offered.
pub struct TableRenderer<W> {
    out: W,
    last_version: Option<u64>,
}

impl<W: Write> TableRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_version: None,
        }
    }

    /// Render `view` unless its version was already rendered.
    /// Returns whether anything was written.
    pub fn render(&mut self, view: &RegistryView) -> io::Result<bool> {
        if self.last_version == Some(view.version) {
            return Ok(false);
        }

        write_table(&mut self.out, view)?;
        self.out.flush()?;
        self.last_version = Some(view.version);
        Ok(true)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Write the header, one line per entity and the race-control ticker.
pub fn write_table(out: &mut impl Write, view: &RegistryView) -> io::Result<()> {
    if let Some(meeting) = &view.meeting {
        if !meeting.official_name.is_empty() {
            writeln!(out, "{}", meeting.official_name)?;
        }
        writeln!(out, "{}", meeting.location_labels().join(" -- "))?;
    }

    let header: Vec<String> = COLUMNS
        .iter()
        .map(|(name, width)| format!("{name:<width$}"))
        .collect();
    writeln!(out, "{}", header.join(" ").trim_end())?;

    for row in &view.rows {
        writeln!(out, "{}", format_row(row).trim_end())?;
    }

    if !view.race_control.is_empty() {
        writeln!(out)?;
        for msg in &view.race_control {
            writeln!(out, "{msg}")?;
        }
    }

    Ok(())
}

fn format_row(row: &EntityView) -> String {
    let entity = &row.entity;
    let state = &entity.state;

    let mut driver = if entity.team.is_empty() {
        entity.name.clone()
    } else {
        format!("{} [{}]", entity.name, entity.team)
    };
    if row.is_stale() {
        driver.push_str(" *");
    }

    let sectors = |lap: Option<LapTime>, i: usize| format_opt(lap.and_then(|l| l.sectors[i]));

    let cells = [
        state.position.map(|p| p.to_string()).unwrap_or_default(),
        driver,
        format_gap(state.interval),
        format_gap(state.gap),
        sectors(state.last_lap, 0),
        sectors(state.last_lap, 1),
        sectors(state.last_lap, 2),
        format_opt(state.last_lap.map(|l| l.total)),
        format_opt(state.best_lap.map(|l| l.total)),
        state.pit_status.as_str().to_string(),
        state.tyre.map(|t| t.compound.short().to_string()).unwrap_or_default(),
        state.tyre.map(|t| t.age_laps.to_string()).unwrap_or_default(),
    ];

    cells
        .iter()
        .zip(COLUMNS.iter())
        .map(|(cell, (_, width))| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::feed::Category;
    use crate::model::{Compound, Meeting, PitStatus, RaceControlMessage, Tyre};
    use crate::registry::Entity;

    fn row(id: u32, name: &str, position: u32) -> EntityView {
        let mut entity = Entity::placeholder(id);
        entity.name = name.to_string();
        entity.team = "McLaren".to_string();
        entity.state.position = Some(position);
        EntityView {
            entity,
            stale: Vec::new(),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(28_512)), "28.512");
        assert_eq!(format_duration(Duration::from_millis(5_004)), "05.004");
        assert_eq!(format_duration(Duration::from_millis(81_234)), "1:21.234");
        assert_eq!(format_duration(Duration::from_millis(600_000)), "10:00.000");
    }

    #[test]
    fn test_format_gap() {
        assert_eq!(format_gap(None), "");
        assert_eq!(format_gap(Some(Gap::Time(Duration::from_millis(1_250)))), "+01.250");
        assert_eq!(format_gap(Some(Gap::Time(Duration::from_millis(5_250)))), "+05.250");
        assert_eq!(format_gap(Some(Gap::Time(Duration::from_secs(75)))), "+1:15.000");
        assert_eq!(format_gap(Some(Gap::Laps(1))), "+1 LAP");
        assert_eq!(format_gap(Some(Gap::Laps(2))), "+2 LAP");
    }

    #[test]
    fn test_table_contents() {
        let mut leader = row(4, "NOR", 1);
        leader.entity.state.tyre = Some(Tyre {
            compound: Compound::Medium,
            age_laps: 12,
        });
        leader.entity.state.best_lap = Some(LapTime {
            lap_number: 9,
            sectors: [
                Some(Duration::from_millis(28_100)),
                Some(Duration::from_millis(31_200)),
                Some(Duration::from_millis(22_400)),
            ],
            total: Duration::from_millis(81_700),
        });

        let mut second = row(81, "PIA", 2);
        second.entity.state.interval = Some(Gap::Time(Duration::from_millis(2_345)));
        second.entity.state.pit_status = PitStatus::InPit;
        second.stale = vec![Category::Intervals];

        let view = RegistryView {
            version: 3,
            meeting: Some(Meeting {
                official_name: "FORMULA 1 GRAND PRIX".to_string(),
                country: "Italy".to_string(),
                location: "Monza".to_string(),
                circuit: "Monza".to_string(),
            }),
            rows: vec![leader, second],
            race_control: vec![RaceControlMessage {
                timestamp: Utc.with_ymd_and_hms(2024, 9, 1, 13, 4, 0).unwrap(),
                category: "Flag".to_string(),
                flag: Some("GREEN".to_string()),
                message: "GREEN LIGHT - PIT EXIT OPEN".to_string(),
                driver: None,
                lap_number: Some(1),
            }],
            ..Default::default()
        };

        let mut out = Vec::new();
        write_table(&mut out, &view).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "FORMULA 1 GRAND PRIX");
        assert_eq!(lines[1], "Italy -- Monza");
        assert!(lines[2].starts_with("POS DRIVER"));
        assert!(lines[3].starts_with("1   NOR [McLaren]"));
        assert!(lines[3].contains("1:21.700"));
        assert!(lines[3].ends_with("M    12"));
        assert!(lines[4].contains("PIA [McLaren] *"));
        assert!(lines[4].contains("+02.345"));
        assert!(lines[4].contains("IN PITS"));
        assert_eq!(lines.last().copied(), Some("13:04:00 L1 GREEN LIGHT - PIT EXIT OPEN"));
    }

    #[test]
    fn test_renderer_skips_unchanged_version() {
        let mut renderer = TableRenderer::new(Vec::new());
        let view = RegistryView {
            version: 1,
            rows: vec![row(1, "VER", 1)],
            ..Default::default()
        };

        assert!(renderer.render(&view).expect("render"));
        assert!(!renderer.render(&view).expect("render"));

        let next = RegistryView {
            version: 2,
            ..view
        };
        assert!(renderer.render(&next).expect("render"));

        let text = String::from_utf8(renderer.into_inner()).expect("utf8");
        assert_eq!(text.matches("POS DRIVER").count(), 2);
    }
}
