use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::feed::{Fetcher, HttpTransport, Transport};
use crate::reconcile::Reconciler;
use crate::registry::{Registry, ViewHandle};
use crate::render::TableRenderer;
use crate::scheduler::{PollSettings, Scheduler, StatusBoard};

/// Delay between initial roster fetch attempts.
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Monitor wires the fetcher, reconciler, poll loops, renderer and health
/// server together for one session.
pub struct Monitor {
    cfg: Config,
    health: Arc<HealthMetrics>,
    view: Option<ViewHandle>,
    status: Option<Arc<StatusBoard>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Monitor {
    /// Creates a new Monitor, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            view: None,
            status: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start monitoring the configured session over HTTP.
    pub async fn start(&mut self) -> Result<()> {
        let transport = HttpTransport::new(&self.cfg.api).context("creating HTTP transport")?;
        self.start_with(transport).await
    }

    /// Start monitoring using the given transport.
    ///
    /// Fails only when the initial roster cannot be established.
    pub async fn start_with<T: Transport + 'static>(&mut self, transport: T) -> Result<()> {
        // 0. Start health metrics server so health checks respond during bootstrap.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Fetcher and registry.
        let fetcher = Arc::new(self.create_fetcher(transport));
        let reconciler = Arc::new(Reconciler::new(Registry::new(
            self.cfg.race_control_log_size,
        )));

        // 2. Meeting header (continue without it on failure).
        match fetcher.fetch_meeting().await {
            Ok(Some(meeting)) => {
                info!(
                    meeting = %meeting.official_name,
                    country = %meeting.country,
                    circuit = %meeting.circuit,
                    "fetched meeting",
                );
                reconciler.set_meeting(meeting);
            }
            Ok(None) => warn!("no meeting reported upstream"),
            Err(e) => warn!(error = %e, "failed to fetch meeting, continuing without header"),
        }

        // 3. Establish the roster; nothing can be shown without it.
        let scheduler = Scheduler::new(
            fetcher,
            Arc::clone(&reconciler),
            PollSettings::from_config(&self.cfg),
        )
        .with_health(Arc::clone(&self.health));

        let entities = scheduler
            .bootstrap(self.cfg.startup_attempts, STARTUP_RETRY_DELAY)
            .await
            .context("establishing roster")?;
        self.health.entities_tracked.set(entities as f64);

        // 4. Poll loops.
        let categories = self.cfg.categories.enabled();
        info!(
            categories = ?categories.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>(),
            "starting poll loops",
        );
        self.tasks.extend(scheduler.spawn(&categories, &self.cancel));
        self.status = Some(scheduler.status());

        // 5. Renderer.
        let view = reconciler.view_handle();
        if self.cfg.render.enabled {
            self.spawn_renderer(view.clone());
        }
        self.view = Some(view);

        info!(entities, "monitor fully started");

        Ok(())
    }

    /// Latest published registry view, once started.
    pub fn view(&self) -> Option<ViewHandle> {
        self.view.clone()
    }

    /// Per-category poll status, once started.
    pub fn status(&self) -> Option<Arc<StatusBoard>> {
        self.status.clone()
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all poll loops to stop; in-flight fetches are abandoned.
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "poll task failed");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Create a fetcher with metrics callback.
    fn create_fetcher<T: Transport>(&self, transport: T) -> Fetcher<T> {
        let health = Arc::clone(&self.health);

        Fetcher::new(transport, &self.cfg.api.endpoint, &self.cfg.api.session_key).with_metrics(
            Box::new(move |category, status, duration| {
                health
                    .fetch_requests
                    .with_label_values(&[category.as_str(), status])
                    .inc();
                health
                    .fetch_duration
                    .with_label_values(&[category.as_str()])
                    .observe(duration.as_secs_f64());
            }),
        )
    }

    /// Spawn the table renderer, redrawing only when the view changed.
    fn spawn_renderer(&mut self, view: ViewHandle) {
        let cancel = self.cancel.clone();
        let interval = self.cfg.render.interval;

        self.tasks.push(tokio::spawn(async move {
            let mut renderer = TableRenderer::new(io::stdout());
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = renderer.render(&view.load()) {
                            warn!(error = %e, "rendering table failed");
                        }
                    }
                }
            }
        }));
    }
}
