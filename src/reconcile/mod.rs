//! Merging of extracted snapshots and event runs into the registry.
//!
//! The reconciler is the registry's only writer. Every merge is staged on a
//! copy of the registry and swapped in only after all writes succeeded, so a
//! rejected snapshot leaves both the entities and the category watermark
//! untouched.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::extract::Snapshot;
use crate::feed::{Category, CategoryKind, Payload, RawRecord};
use crate::model::{EntityId, LapTime, Meeting, PitStatus, Timestamp};
use crate::registry::{Entity, Registry, RegistryView, ViewHandle};

/// Reasons a whole snapshot is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("entity {entity}: rank must be at least 1")]
    InvalidRank { entity: EntityId },

    #[error("{category} merge holds a {found} record for entity {entity}")]
    CategoryMismatch {
        category: Category,
        found: Category,
        entity: EntityId,
    },

    #[error("{category} cannot be merged as a {expected}")]
    WrongKind {
        category: Category,
        expected: &'static str,
    },
}

/// Outcome of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Entities whose state was written, ascending.
    pub applied: Vec<EntityId>,
    /// Ids referenced by the merge but not in the registry; skipped.
    pub unknown: Vec<EntityId>,
    /// Category watermark after the merge.
    pub watermark: Option<Timestamp>,
    /// The roster reported a different session and the registry was replaced.
    pub session_changed: bool,
    /// Version of the view published by this merge.
    pub version: u64,
}

/// Single writer for the entity registry.
pub struct Reconciler {
    registry: Mutex<Registry>,
    view: ViewHandle,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("view", &self.view)
            .finish()
    }
}

impl Reconciler {
    pub fn new(registry: Registry) -> Self {
        let view = ViewHandle::new(registry.view());
        Self {
            registry: Mutex::new(registry),
            view,
        }
    }

    /// Handle readers use to load the latest published view.
    pub fn view_handle(&self) -> ViewHandle {
        self.view.clone()
    }

    pub fn view(&self) -> std::sync::Arc<RegistryView> {
        self.view.load()
    }

    pub fn watermark(&self, category: Category) -> Option<Timestamp> {
        self.registry.lock().watermark(category)
    }

    /// Number of entities currently tracked.
    pub fn entity_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Ids of the entities currently tracked.
    pub fn entity_ids(&self) -> BTreeSet<EntityId> {
        self.registry.lock().entities().map(|e| e.id).collect()
    }

    /// Merge a complete snapshot for a roster or snapshot category.
    ///
    /// On success the category watermark advances to the snapshot timestamp
    /// and a new view is published. On error nothing is written.
    pub fn reconcile(
        &self,
        category: Category,
        snapshot: &Snapshot,
    ) -> Result<Reconciled, ReconcileError> {
        if category.kind() == CategoryKind::Event {
            return Err(ReconcileError::WrongKind {
                category,
                expected: "snapshot",
            });
        }

        let mut registry = self.registry.lock();
        let mut staged = registry.clone();
        let mut session_changed = false;

        if category.kind() == CategoryKind::Roster {
            session_changed = stage_session(&mut staged, snapshot);
        }

        // Oldest first so the newest assignment of a contested rank wins.
        let mut records: Vec<&RawRecord> = snapshot.records().map(|(_, r)| r).collect();
        records.sort_by_key(|r| (r.timestamp, r.entity_id));

        let mut applied = Vec::with_capacity(records.len());
        let mut unknown = Vec::new();

        for record in records {
            if stage_record(&mut staged, category, record)? {
                applied.push(record.entity_id);
            } else {
                unknown.push(record.entity_id);
            }
        }

        staged.advance_watermark(category, snapshot.timestamp());
        let outcome = self.commit(&mut registry, staged, category, applied, unknown, session_changed);

        debug!(
            %category,
            applied = outcome.applied.len(),
            unknown = outcome.unknown.len(),
            watermark = ?outcome.watermark,
            "snapshot reconciled",
        );

        Ok(outcome)
    }

    /// Merge sparse event records, given in ascending time order.
    ///
    /// Records at or below the current watermark are ignored.
    pub fn reconcile_events(
        &self,
        category: Category,
        records: &[RawRecord],
    ) -> Result<Reconciled, ReconcileError> {
        if category.kind() != CategoryKind::Event {
            return Err(ReconcileError::WrongKind {
                category,
                expected: "event run",
            });
        }

        let mut registry = self.registry.lock();
        let mut staged = registry.clone();
        let watermark = staged.watermark(category);

        let mut applied = Vec::new();
        let mut unknown = Vec::new();

        for record in records {
            if watermark.is_some_and(|w| record.timestamp <= w) {
                continue;
            }

            if stage_record(&mut staged, category, record)? {
                if record.entity_id != 0 {
                    applied.push(record.entity_id);
                }
            } else {
                unknown.push(record.entity_id);
            }

            staged.advance_watermark(category, record.timestamp);
        }

        applied.sort_unstable();
        applied.dedup();

        let outcome = self.commit(&mut registry, staged, category, applied, unknown, false);

        debug!(
            %category,
            applied = outcome.applied.len(),
            watermark = ?outcome.watermark,
            "events reconciled",
        );

        Ok(outcome)
    }

    /// Flag or clear persistent incompleteness for a category.
    /// Publishes a new view only when the flag changes.
    pub fn set_stale(&self, category: Category, stale: bool) -> bool {
        let mut registry = self.registry.lock();
        if !registry.set_stale(category, stale) {
            return false;
        }

        registry.bump_version();
        self.view.publish(registry.view());
        true
    }

    pub fn set_meeting(&self, meeting: Meeting) {
        let mut registry = self.registry.lock();
        registry.set_meeting(meeting);
        registry.bump_version();
        self.view.publish(registry.view());
    }

    fn commit(
        &self,
        registry: &mut Registry,
        staged: Registry,
        category: Category,
        mut applied: Vec<EntityId>,
        unknown: Vec<EntityId>,
        session_changed: bool,
    ) -> Reconciled {
        *registry = staged;
        let version = registry.bump_version();
        self.view.publish(registry.view());

        for id in &unknown {
            warn!(%category, entity = id, "skipping record for unknown entity");
        }

        applied.sort_unstable();

        Reconciled {
            applied,
            unknown,
            watermark: registry.watermark(category),
            session_changed,
            version,
        }
    }
}

/// Detect a session change in a roster snapshot. Resets the staged registry
/// when the session differs from the current one.
fn stage_session(staged: &mut Registry, snapshot: &Snapshot) -> bool {
    let reported = snapshot.records().find_map(|(_, r)| match &r.payload {
        Payload::Driver(info) => info.session_key,
        _ => None,
    });

    match (staged.session_key(), reported) {
        (Some(current), Some(new)) if current != new => {
            info!(previous = current, session = new, "session changed, replacing registry");
            staged.reset_session(Some(new));
            true
        }
        (None, Some(new)) => {
            staged.set_session_key(new);
            false
        }
        _ => false,
    }
}

/// Apply one record to the staged registry.
///
/// Returns `Ok(false)` when the record references an unknown entity and was
/// skipped.
fn stage_record(
    staged: &mut Registry,
    category: Category,
    record: &RawRecord,
) -> Result<bool, ReconcileError> {
    let found = record.payload.category();
    if found != category {
        return Err(ReconcileError::CategoryMismatch {
            category,
            found,
            entity: record.entity_id,
        });
    }

    let id = record.entity_id;

    match &record.payload {
        Payload::Driver(info) => {
            staged
                .entities
                .entry(id)
                .and_modify(|entity| entity.apply_driver(info))
                .or_insert_with(|| Entity::from_driver(id, info));
            Ok(true)
        }
        Payload::Position { position } => {
            if *position == 0 {
                return Err(ReconcileError::InvalidRank { entity: id });
            }
            if !staged.entities.contains_key(&id) {
                return Ok(false);
            }
            assign_position(&mut staged.entities, id, *position);
            Ok(true)
        }
        Payload::RaceControl(msg) => {
            staged.push_race_control(msg.clone());
            Ok(true)
        }
        payload => {
            let Some(entity) = staged.entities.get_mut(&id) else {
                return Ok(false);
            };
            apply_entity_payload(entity, payload);
            Ok(true)
        }
    }
}

/// Give `id` the rank, invalidating any other entity still holding it.
fn assign_position(entities: &mut BTreeMap<EntityId, Entity>, id: EntityId, rank: u32) {
    for (other_id, other) in entities.iter_mut() {
        if *other_id != id && other.state.position == Some(rank) {
            other.state.position = None;
        }
    }

    if let Some(entity) = entities.get_mut(&id) {
        entity.state.position = Some(rank);
    }
}

fn apply_entity_payload(entity: &mut Entity, payload: &Payload) {
    let state = &mut entity.state;

    match payload {
        Payload::Interval {
            interval,
            gap_to_leader,
        } => {
            state.interval = *interval;
            state.gap = *gap_to_leader;
        }
        Payload::Lap {
            lap_number,
            sectors,
            duration,
            pit_out,
        } => {
            state.lap_number = Some(*lap_number);

            if let Some(total) = *duration {
                let lap = LapTime {
                    lap_number: *lap_number,
                    sectors: *sectors,
                    total,
                };
                state.last_lap = Some(lap);

                if state.best_lap.map_or(true, |best| total < best.total) {
                    state.best_lap = Some(lap);
                }
            }

            state.pit_status = match (*pit_out, state.pit_status) {
                (true, _) => PitStatus::OutLap,
                (false, PitStatus::OutLap) => PitStatus::None,
                (false, current) => current,
            };
        }
        Payload::Stint(tyre) => {
            state.tyre = Some(*tyre);
        }
        Payload::Pit { lap_number, .. } => {
            let current_lap = state.lap_number.unwrap_or(0);
            if lap_number.map_or(true, |lap| lap >= current_lap) {
                state.pit_status = PitStatus::InPit;
            }
        }
        Payload::Driver(_) | Payload::Position { .. } | Payload::RaceControl(_) => {}
    }
}
