//! Per-category poll loops.
//!
//! Each enabled category runs its own fetch, extract and reconcile cycle on a
//! fixed cadence in a dedicated task. A category never runs two cycles at
//! once, and a failing or incomplete category never holds up another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::extract::{self, BatchOrder, Extraction};
use crate::feed::{Category, CategoryKind, Fetcher, RawBatch, Transport};
use crate::model::{EntityId, Timestamp};
use crate::reconcile::{Reconciled, Reconciler};

/// Where a category is within its poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    #[default]
    Idle,
    Fetching,
    Extracting,
    Reconciling,
    /// Last cycle failed or was incomplete; the next cycle retries the
    /// same window.
    Backoff,
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A snapshot or event run was merged.
    Applied,
    /// Nothing new upstream.
    Empty,
    /// Fewer than the expected number of entities could be assembled.
    Incomplete,
    FetchFailed,
    /// The reconciler refused the snapshot.
    Rejected,
}

impl CycleOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Empty => "empty",
            Self::Incomplete => "incomplete",
            Self::FetchFailed => "fetch_failed",
            Self::Rejected => "rejected",
        }
    }

    /// Whether the cycle leaves the category in backoff.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Incomplete | Self::FetchFailed | Self::Rejected)
    }
}

/// Diagnostic state of one category's poll loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryStatus {
    pub phase: CyclePhase,
    pub last_outcome: Option<CycleOutcome>,
    /// Lower bound used by the most recent fetch.
    pub last_since: Option<Timestamp>,
    pub cycles: u64,
    pub stale: bool,
}

/// Shared table of per-category poll status.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<BTreeMap<Category, CategoryStatus>>,
}

impl StatusBoard {
    pub fn get(&self, category: Category) -> CategoryStatus {
        self.inner.lock().get(&category).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<(Category, CategoryStatus)> {
        self.inner
            .lock()
            .iter()
            .map(|(c, s)| (*c, s.clone()))
            .collect()
    }

    fn update(&self, category: Category, f: impl FnOnce(&mut CategoryStatus)) {
        f(self.inner.lock().entry(category).or_default());
    }
}

/// Settings shared by every poll loop.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Entities a complete snapshot must hold; `None` derives it from the
    /// roster.
    pub expected_entities: Option<usize>,
    pub max_incomplete_window: Duration,
    pub batch_order: BatchOrder,
}

impl PollSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            expected_entities: cfg.expected_entities,
            max_incomplete_window: cfg.max_incomplete_window,
            batch_order: cfg.api.batch_order,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            expected_entities: None,
            max_incomplete_window: Duration::from_secs(30),
            batch_order: BatchOrder::OldestFirst,
        }
    }
}

/// Drives the poll loops for all categories.
pub struct Scheduler<T> {
    fetcher: Arc<Fetcher<T>>,
    reconciler: Arc<Reconciler>,
    settings: PollSettings,
    health: Option<Arc<HealthMetrics>>,
    status: Arc<StatusBoard>,
}

impl<T: Transport + 'static> Scheduler<T> {
    pub fn new(fetcher: Arc<Fetcher<T>>, reconciler: Arc<Reconciler>, settings: PollSettings) -> Self {
        Self {
            fetcher,
            reconciler,
            settings,
            health: None,
            status: Arc::new(StatusBoard::default()),
        }
    }

    /// Record cycle outcomes in the given health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn status(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.status)
    }

    /// Build the poll loop for one category.
    pub fn poller(&self, category: Category) -> Poller<T> {
        Poller {
            category,
            fetcher: Arc::clone(&self.fetcher),
            reconciler: Arc::clone(&self.reconciler),
            settings: self.settings,
            health: self.health.clone(),
            status: Arc::clone(&self.status),
            incomplete_since: None,
        }
    }

    /// Populate the registry from the roster before any timing category runs.
    ///
    /// Tries up to `attempts` times, waiting `retry_delay` between tries.
    /// Fails when no entities could be established.
    pub async fn bootstrap(&self, attempts: u32, retry_delay: Duration) -> Result<usize> {
        let mut poller = self.poller(Category::Drivers);

        for attempt in 1..=attempts {
            let outcome = poller.run_cycle().await;
            let count = self.reconciler.entity_count();

            if outcome == CycleOutcome::Applied && count > 0 {
                info!(entities = count, attempt, "roster established");
                return Ok(count);
            }

            warn!(
                attempt,
                attempts,
                outcome = outcome.as_str(),
                "initial roster fetch did not produce entities",
            );

            if attempt < attempts {
                tokio::time::sleep(retry_delay).await;
            }
        }

        bail!("no entities after {attempts} roster fetch attempts")
    }

    /// Spawn one poll task per `(category, interval)` pair.
    pub fn spawn(
        &self,
        categories: &[(Category, Duration)],
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        categories
            .iter()
            .map(|&(category, interval)| {
                let poller = self.poller(category);
                let cancel = cancel.child_token();
                tokio::spawn(poller.run(interval, cancel))
            })
            .collect()
    }
}

/// Poll loop state for a single category.
pub struct Poller<T> {
    category: Category,
    fetcher: Arc<Fetcher<T>>,
    reconciler: Arc<Reconciler>,
    settings: PollSettings,
    health: Option<Arc<HealthMetrics>>,
    status: Arc<StatusBoard>,
    /// Start of the current run of failed or incomplete cycles.
    incomplete_since: Option<Instant>,
}

impl<T: Transport> Poller<T> {
    pub fn category(&self) -> Category {
        self.category
    }

    /// Run cycles every `interval` until cancelled.
    ///
    /// Cancellation abandons an in-flight fetch; it never reaches the
    /// reconciler, so the watermark is unaffected.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(category = %self.category, ?interval, "poll loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.run_cycle() => {}
                    }
                }
            }
        }

        debug!(category = %self.category, "poll loop stopped");
    }

    /// Fetch, extract and reconcile once.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let category = self.category;
        let since = match category.time_field() {
            Some(_) => self.reconciler.watermark(category),
            None => None,
        };

        self.set_phase(CyclePhase::Fetching);
        self.status.update(category, |s| s.last_since = since);

        let outcome = match self.fetcher.fetch(category, since, None).await {
            Ok(batch) => self.process(batch),
            Err(e) => {
                warn!(%category, since = ?since, error = %e, "fetch failed");
                CycleOutcome::FetchFailed
            }
        };

        self.finish(outcome);
        outcome
    }

    fn process(&mut self, batch: RawBatch) -> CycleOutcome {
        let category = self.category;

        if batch.dropped > 0 {
            if let Some(health) = &self.health {
                health
                    .records_dropped
                    .with_label_values(&[category.as_str()])
                    .inc_by(batch.dropped as f64);
            }
        }

        if batch.is_empty() {
            debug!(%category, "no new records");
            return CycleOutcome::Empty;
        }

        self.set_phase(CyclePhase::Extracting);

        let result = match category.kind() {
            CategoryKind::Event => {
                let records = extract::events_in_order(&batch.records, self.batch_order());
                self.set_phase(CyclePhase::Reconciling);
                self.reconciler.reconcile_events(category, &records)
            }
            CategoryKind::Roster | CategoryKind::Snapshot => {
                let expected = self.expected_entities(&batch);
                let known = match category.kind() {
                    CategoryKind::Roster => None,
                    _ => Some(self.known_entities(&batch)),
                };
                let order = self.batch_order();
                match extract::extract(&batch.records, expected, known.as_ref(), order) {
                    Extraction::Incomplete { captured, expected } => {
                        debug!(%category, captured, expected, records = batch.len(), "snapshot incomplete");
                        return CycleOutcome::Incomplete;
                    }
                    Extraction::Snapshot(snapshot) => {
                        self.set_phase(CyclePhase::Reconciling);
                        self.reconciler.reconcile(category, &snapshot)
                    }
                }
            }
        };

        match result {
            Ok(reconciled) => {
                self.record_applied(&reconciled);
                CycleOutcome::Applied
            }
            Err(e) => {
                warn!(%category, error = %e, "snapshot rejected");
                if let Some(health) = &self.health {
                    health
                        .snapshots_rejected
                        .with_label_values(&[category.as_str()])
                        .inc();
                }
                CycleOutcome::Rejected
            }
        }
    }

    /// Registry ids a snapshot may cover. References to other ids are
    /// logged and counted.
    fn known_entities(&self, batch: &RawBatch) -> BTreeSet<EntityId> {
        let category = self.category;
        let known = self.reconciler.entity_ids();
        let unknown = extract::unknown_ids(&batch.records, &known);

        if !unknown.is_empty() {
            warn!(%category, ids = ?unknown, "skipping records for unknown entities");
            if let Some(health) = &self.health {
                health
                    .unknown_entity_refs
                    .with_label_values(&[category.as_str()])
                    .inc_by(unknown.len() as f64);
            }
        }

        known
    }

    /// Untimed batches are put in oldest-first order when decoded.
    fn batch_order(&self) -> BatchOrder {
        match self.category.time_field() {
            Some(_) => self.settings.batch_order,
            None => BatchOrder::OldestFirst,
        }
    }

    /// Number of distinct entities a complete snapshot must hold.
    fn expected_entities(&self, batch: &RawBatch) -> usize {
        if let Some(expected) = self.settings.expected_entities {
            return expected;
        }

        match self.category.kind() {
            CategoryKind::Roster => batch.distinct_entities(),
            _ => self.reconciler.entity_count(),
        }
    }

    fn finish(&mut self, outcome: CycleOutcome) {
        let category = self.category;

        if outcome.is_failure() {
            self.note_failure();
        } else if outcome == CycleOutcome::Applied {
            self.incomplete_since = None;
            self.mark_stale(false);
        }

        let phase = if outcome.is_failure() {
            CyclePhase::Backoff
        } else {
            CyclePhase::Idle
        };

        self.status.update(category, |s| {
            s.phase = phase;
            s.last_outcome = Some(outcome);
            s.cycles += 1;
        });

        if let Some(health) = &self.health {
            health
                .poll_cycles
                .with_label_values(&[category.as_str(), outcome.as_str()])
                .inc();
        }
    }

    /// Start or continue the incompleteness clock, flagging the category
    /// once it exceeds the configured window.
    fn note_failure(&mut self) {
        let started = *self.incomplete_since.get_or_insert_with(Instant::now);

        if started.elapsed() >= self.settings.max_incomplete_window {
            self.mark_stale(true);
        }
    }

    fn mark_stale(&self, stale: bool) {
        let category = self.category;

        if !self.reconciler.set_stale(category, stale) {
            return;
        }

        if stale {
            info!(
                %category,
                window = ?self.settings.max_incomplete_window,
                "category persistently incomplete, marking stale",
            );
        } else {
            info!(%category, "category recovered");
        }

        self.status.update(category, |s| s.stale = stale);

        if let Some(health) = &self.health {
            health
                .category_stale
                .with_label_values(&[category.as_str()])
                .set(if stale { 1.0 } else { 0.0 });
            health.view_publishes.inc();
        }
    }

    fn record_applied(&self, reconciled: &Reconciled) {
        let category = self.category;

        debug!(
            %category,
            applied = reconciled.applied.len(),
            version = reconciled.version,
            "cycle applied",
        );

        let Some(health) = &self.health else {
            return;
        };

        health.view_publishes.inc();
        health
            .entities_tracked
            .set(self.reconciler.entity_count() as f64);

        if !reconciled.unknown.is_empty() {
            health
                .unknown_entity_refs
                .with_label_values(&[category.as_str()])
                .inc_by(reconciled.unknown.len() as f64);
        }

        if let Some(watermark) = reconciled.watermark {
            health
                .watermark
                .with_label_values(&[category.as_str()])
                .set(watermark.timestamp_millis() as f64 / 1000.0);
        }
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.status.update(self.category, |s| s.phase = phase);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::feed::TransportError;
    use crate::model::Compound;
    use crate::registry::Registry;

    /// Transport answering per endpoint from a queue; `[]` once drained.
    #[derive(Default)]
    struct EndpointTransport {
        responses: Mutex<HashMap<String, VecDeque<Result<String, TransportError>>>>,
        requests: Mutex<Vec<String>>,
    }

    impl EndpointTransport {
        fn push(&self, endpoint: &str, response: Result<String, TransportError>) {
            self.responses
                .lock()
                .entry(endpoint.to_string())
                .or_default()
                .push_back(response);
        }

        fn requests_for(&self, endpoint: &str) -> Vec<String> {
            let prefix = format!("http://feed.test/{endpoint}?");
            self.requests
                .lock()
                .iter()
                .filter(|u| u.starts_with(&prefix))
                .cloned()
                .collect()
        }
    }

    impl Transport for Arc<EndpointTransport> {
        async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            self.requests.lock().push(url.to_string());

            let endpoint = url
                .trim_start_matches("http://feed.test/")
                .split('?')
                .next()
                .unwrap_or_default()
                .to_string();

            self.responses
                .lock()
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok("[]".to_string()))
                .map(String::into_bytes)
        }
    }

    fn roster(ids: &[u32]) -> String {
        let items: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"driver_number":{id},"name_acronym":"D{id:02}","full_name":"Driver {id}","team_name":"Team","session_key":9590}}"#
                )
            })
            .collect();
        format!("[{}]", items.join(","))
    }

    fn positions(at: &str, ids: &[u32]) -> String {
        let items: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(r#"{{"driver_number":{id},"date":"2024-09-01T14:00:{at}","position":{id}}}"#)
            })
            .collect();
        format!("[{}]", items.join(","))
    }

    fn unavailable() -> Result<String, TransportError> {
        Err(TransportError::Status {
            status: 503,
            body: "unavailable".to_string(),
        })
    }

    fn setup(settings: PollSettings) -> (Arc<EndpointTransport>, Scheduler<Arc<EndpointTransport>>) {
        let transport = Arc::new(EndpointTransport::default());
        let fetcher = Arc::new(Fetcher::new(Arc::clone(&transport), "http://feed.test", "9590"));
        let reconciler = Arc::new(Reconciler::new(Registry::new(8)));
        (transport, Scheduler::new(fetcher, reconciler, settings))
    }

    async fn seeded(ids: &[u32], settings: PollSettings) -> (Arc<EndpointTransport>, Scheduler<Arc<EndpointTransport>>) {
        let (transport, scheduler) = setup(settings);
        transport.push("drivers", Ok(roster(ids)));
        scheduler
            .bootstrap(1, Duration::from_secs(1))
            .await
            .expect("roster");
        (transport, scheduler)
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_since_bound() {
        let (transport, scheduler) = seeded(&[1, 2], PollSettings::default()).await;
        transport.push("position", Ok(positions("10.000", &[1, 2])));
        transport.push("position", unavailable());
        transport.push("position", Ok(positions("12.000", &[1, 2])));

        let mut poller = scheduler.poller(Category::Position);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Applied);
        let watermark = scheduler.reconciler.watermark(Category::Position);

        assert_eq!(poller.run_cycle().await, CycleOutcome::FetchFailed);
        assert_eq!(scheduler.reconciler.watermark(Category::Position), watermark);
        assert_eq!(scheduler.status().get(Category::Position).phase, CyclePhase::Backoff);

        assert_eq!(poller.run_cycle().await, CycleOutcome::Applied);

        let requests = transport.requests_for("position");
        assert_eq!(requests.len(), 3);
        assert!(!requests[0].contains("date%3E"));
        assert!(requests[1].contains("date%3E2024-09-01T14:00:10.000000"));
        assert_eq!(requests[1], requests[2]);
    }

    #[tokio::test]
    async fn test_incomplete_keeps_watermark_and_retries_same_window() {
        let (transport, scheduler) = seeded(&[1, 2, 3], PollSettings::default()).await;
        transport.push("position", Ok(positions("10.000", &[1, 2, 3])));
        transport.push("position", Ok(positions("11.000", &[1, 2])));

        let mut poller = scheduler.poller(Category::Position);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Applied);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Incomplete);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Empty);

        let requests = transport.requests_for("position");
        assert_eq!(requests[1], requests[2]);

        let status = scheduler.status().get(Category::Position);
        assert_eq!(status.cycles, 3);
        assert_eq!(status.last_outcome, Some(CycleOutcome::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_incompleteness_marks_stale() {
        let settings = PollSettings {
            max_incomplete_window: Duration::from_secs(10),
            ..Default::default()
        };
        let (transport, scheduler) = seeded(&[1, 2], settings).await;
        let mut poller = scheduler.poller(Category::Position);

        transport.push("position", Ok(positions("10.000", &[1])));
        assert_eq!(poller.run_cycle().await, CycleOutcome::Incomplete);
        assert!(!scheduler.status().get(Category::Position).stale);

        tokio::time::advance(Duration::from_secs(11)).await;
        transport.push("position", Ok(positions("20.000", &[2])));
        assert_eq!(poller.run_cycle().await, CycleOutcome::Incomplete);

        assert!(scheduler.status().get(Category::Position).stale);
        let view = scheduler.reconciler.view();
        assert_eq!(view.stale_categories, vec![Category::Position]);
        assert!(view.rows.iter().all(|row| row.is_stale()));

        transport.push("position", Ok(positions("30.000", &[1, 2])));
        assert_eq!(poller.run_cycle().await, CycleOutcome::Applied);
        assert!(!scheduler.status().get(Category::Position).stale);
        assert!(scheduler.reconciler.view().stale_categories.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batches_do_not_start_stale_clock() {
        let settings = PollSettings {
            max_incomplete_window: Duration::from_secs(5),
            ..Default::default()
        };
        let (_transport, scheduler) = seeded(&[1, 2], settings).await;
        let mut poller = scheduler.poller(Category::Position);

        for _ in 0..3 {
            assert_eq!(poller.run_cycle().await, CycleOutcome::Empty);
            tokio::time::advance(Duration::from_secs(4)).await;
        }

        assert!(!scheduler.status().get(Category::Position).stale);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_without_entities() {
        let (transport, scheduler) = setup(PollSettings::default());
        transport.push("drivers", unavailable());
        transport.push("drivers", Ok("[]".to_string()));

        let err = scheduler
            .bootstrap(2, Duration::from_millis(1))
            .await
            .expect_err("no roster");
        assert!(err.to_string().contains("2 roster fetch attempts"));
        assert_eq!(transport.requests_for("drivers").len(), 2);
    }

    #[tokio::test]
    async fn test_configured_expected_count_overrides_roster() {
        let settings = PollSettings {
            expected_entities: Some(3),
            ..Default::default()
        };
        let (transport, scheduler) = setup(settings);
        transport.push("drivers", Ok(roster(&[1, 2])));

        // Two roster entries cannot satisfy an expected count of three.
        assert!(scheduler.bootstrap(1, Duration::from_millis(1)).await.is_err());

        transport.push("drivers", Ok(roster(&[1, 2, 3])));
        assert_eq!(
            scheduler.bootstrap(1, Duration::from_millis(1)).await.expect("roster"),
            3
        );
    }

    #[tokio::test]
    async fn test_event_category_applies_without_completeness() {
        let (transport, scheduler) = seeded(&[1, 2], PollSettings::default()).await;
        transport.push(
            "race_control",
            Ok(r#"[{"date":"2024-09-01T14:00:05","category":"Flag","flag":"GREEN","message":"GREEN LIGHT - PIT EXIT OPEN"}]"#.to_string()),
        );

        let mut poller = scheduler.poller(Category::RaceControl);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Applied);

        let view = scheduler.reconciler.view();
        assert_eq!(view.race_control.len(), 1);
        assert_eq!(view.race_control[0].message, "GREEN LIGHT - PIT EXIT OPEN");
    }

    #[tokio::test]
    async fn test_rejected_snapshot_enters_backoff() {
        let (transport, scheduler) = seeded(&[1, 2], PollSettings::default()).await;
        transport.push(
            "position",
            Ok(r#"[{"driver_number":1,"date":"2024-09-01T14:00:10","position":0},
                   {"driver_number":2,"date":"2024-09-01T14:00:10","position":1}]"#
                .to_string()),
        );

        let mut poller = scheduler.poller(Category::Position);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Rejected);
        assert_eq!(scheduler.reconciler.watermark(Category::Position), None);
        assert_eq!(scheduler.status().get(Category::Position).phase, CyclePhase::Backoff);
    }

    #[tokio::test]
    async fn test_unknown_entity_does_not_displace_known_one() {
        let (transport, scheduler) = seeded(&[1, 2, 3], PollSettings::default()).await;
        transport.push(
            "position",
            Ok(r#"[{"driver_number":3,"date":"2024-09-01T14:00:09","position":3},
                   {"driver_number":1,"date":"2024-09-01T14:00:10","position":1},
                   {"driver_number":2,"date":"2024-09-01T14:00:10","position":2},
                   {"driver_number":99,"date":"2024-09-01T14:00:10","position":4}]"#
                .to_string()),
        );

        let mut poller = scheduler.poller(Category::Position);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Applied);

        let view = scheduler.reconciler.view();
        let ranks: Vec<(EntityId, Option<u32>)> = view
            .rows
            .iter()
            .map(|row| (row.entity.id, row.entity.state.position))
            .collect();
        assert_eq!(ranks, vec![(1, Some(1)), (2, Some(2)), (3, Some(3))]);
        assert_eq!(
            scheduler.reconciler.watermark(Category::Position),
            view.watermark(Category::Position)
        );
        assert_eq!(
            view.watermark(Category::Position).map(|w| w.to_rfc3339()),
            Some("2024-09-01T14:00:10+00:00".to_string())
        );
        assert_eq!(scheduler.reconciler.entity_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_entities_alone_leave_snapshot_incomplete() {
        let (transport, scheduler) = seeded(&[1, 2], PollSettings::default()).await;
        transport.push("position", Ok(positions("10.000", &[1, 99])));

        let mut poller = scheduler.poller(Category::Position);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Incomplete);
        assert_eq!(scheduler.reconciler.watermark(Category::Position), None);
    }

    #[tokio::test]
    async fn test_latest_stint_wins_regardless_of_batch_order() {
        let settings = PollSettings {
            batch_order: BatchOrder::NewestFirst,
            ..Default::default()
        };
        let (transport, scheduler) = seeded(&[44], settings).await;
        transport.push(
            "stints",
            Ok(r#"[{"driver_number":44,"stint_number":1,"compound":"SOFT","lap_start":1,"lap_end":18,"tyre_age_at_start":0},
                   {"driver_number":44,"stint_number":2,"compound":"HARD","lap_start":19,"lap_end":25,"tyre_age_at_start":0}]"#
                .to_string()),
        );

        let mut poller = scheduler.poller(Category::Stints);
        assert_eq!(poller.run_cycle().await, CycleOutcome::Applied);

        let view = scheduler.reconciler.view();
        let tyre = view.rows[0].entity.state.tyre.expect("tyre");
        assert_eq!(tyre.compound, Compound::Hard);
        assert_eq!(tyre.age_laps, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loops_stop_on_cancel() {
        let (transport, scheduler) = seeded(&[1, 2], PollSettings::default()).await;
        let cancel = CancellationToken::new();

        let handles = scheduler.spawn(
            &[
                (Category::Position, Duration::from_secs(4)),
                (Category::Laps, Duration::from_secs(5)),
            ],
            &cancel,
        );

        tokio::time::sleep(Duration::from_secs(9)).await;
        cancel.cancel();
        for handle in handles {
            handle.await.expect("poll task");
        }

        // Ticks at 0s, 4s and 8s.
        assert_eq!(transport.requests_for("position").len(), 3);
        assert_eq!(transport.requests_for("laps").len(), 2);
    }
}
