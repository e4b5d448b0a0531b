use std::cmp::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::Entity;
use crate::feed::Category;
use crate::model::{Meeting, RaceControlMessage, Timestamp};

/// One row of the published standings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityView {
    pub entity: Entity,
    /// Categories currently flagged persistently incomplete.
    pub stale: Vec<Category>,
}

impl EntityView {
    pub fn is_stale(&self) -> bool {
        !self.stale.is_empty()
    }
}

/// Immutable copy of the registry handed to readers.
#[derive(Debug, Clone, Default)]
pub struct RegistryView {
    /// Increments on every publish.
    pub version: u64,
    pub session_key: Option<u64>,
    pub meeting: Option<Meeting>,
    /// Sorted by position ascending, ties by entity id; unranked last.
    pub rows: Vec<EntityView>,
    /// Newest last.
    pub race_control: Vec<RaceControlMessage>,
    pub watermarks: Vec<(Category, Timestamp)>,
    pub stale_categories: Vec<Category>,
}

impl RegistryView {
    pub fn row(&self, id: u32) -> Option<&EntityView> {
        self.rows.iter().find(|row| row.entity.id == id)
    }

    pub fn watermark(&self, category: Category) -> Option<Timestamp> {
        self.watermarks
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, ts)| *ts)
    }
}

/// Sort rows for display.
pub(crate) fn sort_rows(rows: &mut [EntityView]) {
    rows.sort_by(|a, b| {
        let (a, b) = (&a.entity, &b.entity);
        match (a.state.position, b.state.position) {
            (Some(pa), Some(pb)) => pa.cmp(&pb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.id.cmp(&b.id))
    });
}

/// Shared handle to the latest published view.
///
/// Loads are lock-free; a reader holding an `Arc<RegistryView>` never
/// observes later publishes.
#[derive(Clone)]
pub struct ViewHandle {
    inner: Arc<ArcSwap<RegistryView>>,
}

impl ViewHandle {
    pub fn new(initial: RegistryView) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Returns the current view.
    pub fn load(&self) -> Arc<RegistryView> {
        self.inner.load_full()
    }

    pub(crate) fn publish(&self, view: RegistryView) {
        self.inner.store(Arc::new(view));
    }
}

impl std::fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("version", &self.inner.load().version)
            .finish()
    }
}
