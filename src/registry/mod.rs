pub mod view;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::feed::Category;
use crate::model::{
    DriverInfo, EntityId, Gap, LapTime, Meeting, PitStatus, RaceControlMessage, Timestamp, Tyre,
};

pub use self::view::{EntityView, RegistryView, ViewHandle};

/// Aggregated per-entity state assembled from independent categories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    /// Rank, unique across entities at any instant.
    pub position: Option<u32>,
    /// Gap to the car ahead.
    pub interval: Option<Gap>,
    /// Gap to the leader.
    pub gap: Option<Gap>,
    pub lap_number: Option<u32>,
    pub last_lap: Option<LapTime>,
    pub best_lap: Option<LapTime>,
    pub tyre: Option<Tyre>,
    pub pit_status: PitStatus,
}

/// One tracked participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub full_name: String,
    pub team: String,
    pub state: State,
}

impl Entity {
    /// Placeholder created by the roster before its details are applied.
    pub fn placeholder(id: EntityId) -> Self {
        Self {
            id,
            name: id.to_string(),
            full_name: String::new(),
            team: String::new(),
            state: State::default(),
        }
    }

    pub fn from_driver(id: EntityId, info: &DriverInfo) -> Self {
        let mut entity = Self::placeholder(id);
        entity.apply_driver(info);
        entity
    }

    pub(crate) fn apply_driver(&mut self, info: &DriverInfo) {
        self.name = info.acronym.clone();
        self.full_name = info.full_name.clone();
        self.team = info.team.clone();
    }
}

/// Canonical set of tracked entities for one session.
///
/// Only the reconciler writes to a registry; everyone else reads published
/// [`RegistryView`] copies.
#[derive(Debug, Clone)]
pub struct Registry {
    session_key: Option<u64>,
    meeting: Option<Meeting>,
    pub(crate) entities: BTreeMap<EntityId, Entity>,
    watermarks: HashMap<Category, Timestamp>,
    stale: BTreeSet<Category>,
    race_control: VecDeque<RaceControlMessage>,
    race_control_capacity: usize,
    version: u64,
}

impl Registry {
    pub fn new(race_control_capacity: usize) -> Self {
        Self {
            session_key: None,
            meeting: None,
            entities: BTreeMap::new(),
            watermarks: HashMap::new(),
            stale: BTreeSet::new(),
            race_control: VecDeque::with_capacity(race_control_capacity),
            race_control_capacity: race_control_capacity.max(1),
            version: 0,
        }
    }

    pub fn session_key(&self) -> Option<u64> {
        self.session_key
    }

    pub fn meeting(&self) -> Option<&Meeting> {
        self.meeting.as_ref()
    }

    pub fn set_meeting(&mut self, meeting: Meeting) {
        self.meeting = Some(meeting);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Timestamp below which `category` has been reconciled.
    pub fn watermark(&self, category: Category) -> Option<Timestamp> {
        self.watermarks.get(&category).copied()
    }

    /// Move the watermark forward. Never moves it back.
    pub(crate) fn advance_watermark(&mut self, category: Category, ts: Timestamp) {
        self.watermarks
            .entry(category)
            .and_modify(|current| {
                if ts > *current {
                    *current = ts;
                }
            })
            .or_insert(ts);
    }

    /// Replace all session-scoped state after the upstream session changed.
    pub(crate) fn reset_session(&mut self, session_key: Option<u64>) {
        self.session_key = session_key;
        self.entities.clear();
        self.watermarks.clear();
        self.stale.clear();
        self.race_control.clear();
    }

    pub(crate) fn set_session_key(&mut self, session_key: u64) {
        self.session_key = Some(session_key);
    }

    pub fn is_stale(&self, category: Category) -> bool {
        self.stale.contains(&category)
    }

    /// Flag or clear persistent incompleteness. Returns whether it changed.
    pub(crate) fn set_stale(&mut self, category: Category, stale: bool) -> bool {
        if stale {
            self.stale.insert(category)
        } else {
            self.stale.remove(&category)
        }
    }

    pub(crate) fn push_race_control(&mut self, msg: RaceControlMessage) {
        while self.race_control.len() >= self.race_control_capacity {
            self.race_control.pop_front();
        }
        self.race_control.push_back(msg);
    }

    pub fn race_control(&self) -> impl Iterator<Item = &RaceControlMessage> {
        self.race_control.iter()
    }

    pub(crate) fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Take a consistent copy for readers.
    pub fn view(&self) -> RegistryView {
        let stale: Vec<Category> = self.stale.iter().copied().collect();

        let mut rows: Vec<EntityView> = self
            .entities
            .values()
            .map(|entity| EntityView {
                entity: entity.clone(),
                stale: stale.clone(),
            })
            .collect();
        view::sort_rows(&mut rows);

        let mut watermarks: Vec<(Category, Timestamp)> =
            self.watermarks.iter().map(|(c, ts)| (*c, *ts)).collect();
        watermarks.sort_by_key(|(c, _)| *c);

        RegistryView {
            version: self.version,
            session_key: self.session_key,
            meeting: self.meeting.clone(),
            rows,
            race_control: self.race_control.iter().cloned().collect(),
            watermarks,
            stale_categories: stale,
        }
    }
}
