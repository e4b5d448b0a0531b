//! Latest-set extraction.
//!
//! Walks a batch from the temporally newest record backward and collects the
//! newest record per entity until the expected number of distinct entities
//! is reached. A batch that cannot supply that many entities yields
//! [`Extraction::Incomplete`]; a partial cross-section is never returned.
//! Records for entities outside the known set never count toward
//! completeness.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::feed::RawRecord;
use crate::model::{EntityId, Timestamp};

/// Order of records within an upstream response.
///
/// Only consulted to break ties between records sharing a timestamp: the
/// record that arrived later in an oldest-first stream is the newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// A complete, one-record-per-entity cross-section of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    records: BTreeMap<EntityId, RawRecord>,
    newest: Timestamp,
    oldest: Timestamp,
}

impl Snapshot {
    /// Number of distinct entities in the snapshot.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Timestamp the snapshot represents: its newest record.
    pub fn timestamp(&self) -> Timestamp {
        self.newest
    }

    /// Oldest record that had to be included to reach completeness.
    pub fn oldest(&self) -> Timestamp {
        self.oldest
    }

    pub fn get(&self, id: EntityId) -> Option<&RawRecord> {
        self.records.get(&id)
    }

    /// Records in ascending entity id order.
    pub fn records(&self) -> impl Iterator<Item = (EntityId, &RawRecord)> + '_ {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.records.keys().copied()
    }
}

/// Result of one extraction pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Snapshot(Snapshot),
    /// Fewer than the expected number of entities could be assembled.
    Incomplete { captured: usize, expected: usize },
}

/// Extract the newest complete cross-section of `records`.
///
/// Records sharing the newest timestamp form the first group. If that group
/// does not cover `expected` entities, the walk widens one distinct
/// timestamp at a time, only adding entities not already captured. Within
/// the walk the first record seen for an entity (the newest one) wins.
///
/// With `known` set, records for any other entity are skipped; use
/// [`unknown_ids`] to report them.
///
/// The result is deterministic for a given input and order.
pub fn extract(
    records: &[RawRecord],
    expected: usize,
    known: Option<&BTreeSet<EntityId>>,
    order: BatchOrder,
) -> Extraction {
    if records.is_empty() || expected == 0 {
        return Extraction::Incomplete {
            captured: 0,
            expected,
        };
    }

    let mut captured: BTreeMap<EntityId, RawRecord> = BTreeMap::new();
    let mut newest: Option<Timestamp> = None;
    let mut oldest: Option<Timestamp> = None;

    for idx in newest_first(records, order) {
        let record = &records[idx];

        if captured.contains_key(&record.entity_id) {
            continue;
        }

        if known.is_some_and(|ids| !ids.contains(&record.entity_id)) {
            continue;
        }

        newest.get_or_insert(record.timestamp);
        oldest = Some(record.timestamp);
        captured.insert(record.entity_id, record.clone());

        if captured.len() == expected {
            break;
        }
    }

    match (newest, oldest) {
        (Some(newest), Some(oldest)) if captured.len() == expected => {
            Extraction::Snapshot(Snapshot {
                records: captured,
                newest,
                oldest,
            })
        }
        _ => Extraction::Incomplete {
            captured: captured.len(),
            expected,
        },
    }
}

/// Distinct entity ids in `records` that are not in `known`.
pub fn unknown_ids(records: &[RawRecord], known: &BTreeSet<EntityId>) -> BTreeSet<EntityId> {
    records
        .iter()
        .map(|r| r.entity_id)
        .filter(|id| !known.contains(id))
        .collect()
}

/// Records of a sparse event category in ascending time order.
///
/// Ties keep their arrival order as adjusted for `order`.
pub fn events_in_order(records: &[RawRecord], order: BatchOrder) -> Vec<RawRecord> {
    let mut indices = newest_first(records, order);
    indices.reverse();
    indices.into_iter().map(|i| records[i].clone()).collect()
}

/// Indices of `records` ordered from temporally newest to oldest.
fn newest_first(records: &[RawRecord], order: BatchOrder) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..records.len()).collect();

    indices.sort_by(|&a, &b| {
        records[b]
            .timestamp
            .cmp(&records[a].timestamp)
            .then_with(|| arrival_recency(a, b, order))
    });

    indices
}

/// Compare two equal-timestamp records by which one arrived as the newer.
fn arrival_recency(a: usize, b: usize, order: BatchOrder) -> Ordering {
    match order {
        BatchOrder::OldestFirst => b.cmp(&a),
        BatchOrder::NewestFirst => a.cmp(&b),
    }
}
