//! Batch sync orchestration: the per-geometry decision state machine, the
//! single-worker queue that serializes batches against the upstream, and the
//! cron-driven refresh job.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use verdi_core::{
    area_m2, content_key, plus_one_day, start_of_day, Bbox, DateEntry, Geometry, ImageRecord,
    SeasonWindow, ValidationError,
};
use verdi_providers::{
    classify_raster, fetch_classified_raster, fetch_date_entries, ClassifyError,
    HttpImageProvider, HttpStatisticsProvider, ImageProvider, ProviderConfig, ProviderError,
    StaticTokenProvider, StatisticsProvider, TokenProvider, DEFAULT_PROCESS_URL,
    DEFAULT_STATISTICS_URL,
};
use verdi_storage::{ImageStore, StoreError, TimeSeriesStore};

pub const CRATE_NAME: &str = "verdi-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub statistics_url: String,
    pub process_url: String,
    pub auth_token: Option<String>,
    pub data_dir: PathBuf,
    pub areas_file: PathBuf,
    pub season: SeasonWindow,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            statistics_url: std::env::var("VERDI_STATS_URL")
                .unwrap_or_else(|_| DEFAULT_STATISTICS_URL.to_string()),
            process_url: std::env::var("VERDI_PROCESS_URL")
                .unwrap_or_else(|_| DEFAULT_PROCESS_URL.to_string()),
            auth_token: std::env::var("VERDI_AUTH_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            data_dir: std::env::var("VERDI_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            areas_file: std::env::var("VERDI_AREAS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./areas.yaml")),
            season: season_from_env(),
            scheduler_enabled: std::env::var("VERDI_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("VERDI_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 4 * * *".to_string()),
            user_agent: std::env::var("VERDI_USER_AGENT")
                .unwrap_or_else(|_| "verdi-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("VERDI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            statistics_url: self.statistics_url.clone(),
            process_url: self.process_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parse_month_day(value: &str) -> Option<(u32, u32)> {
    let (month, day) = value.split_once('-')?;
    Some((month.parse().ok()?, day.parse().ok()?))
}

/// Season bounds come as `MM-DD` pairs; the default window applies unless
/// both ends are present and well formed.
fn season_from_env() -> SeasonWindow {
    let start = std::env::var("VERDI_SEASON_START")
        .ok()
        .and_then(|v| parse_month_day(&v));
    let end = std::env::var("VERDI_SEASON_END")
        .ok()
        .and_then(|v| parse_month_day(&v));
    match (start, end) {
        (Some((start_month, start_day)), Some((end_month, end_day))) => {
            SeasonWindow::new(start_month, start_day, end_month, end_day)
        }
        _ => SeasonWindow::default(),
    }
}

/// On-disk registry of named areas to keep in sync.
#[derive(Debug, Clone, Deserialize)]
pub struct AreaRegistry {
    pub areas: Vec<AreaConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaConfig {
    pub name: String,
    pub enabled: bool,
    pub geometry: Geometry,
}

impl AreaRegistry {
    /// A batch over the enabled areas, all sharing one observation window.
    pub fn batch(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> SyncBatch {
        SyncBatch {
            from,
            to,
            areas: self
                .areas
                .iter()
                .filter(|area| area.enabled)
                .map(|area| SyncArea {
                    name: Some(area.name.clone()),
                    geometry: area.geometry.clone(),
                })
                .collect(),
        }
    }
}

pub async fn load_area_registry(path: &Path) -> Result<AreaRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// One geometry inside a batch. Repeated geometries are not deduplicated;
/// each occurrence is planned and fetched on its own.
#[derive(Debug, Clone)]
pub struct SyncArea {
    pub name: Option<String>,
    pub geometry: Geometry,
}

/// A set of geometries to bring up to date over a shared window.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub areas: Vec<SyncArea>,
}

impl SyncBatch {
    pub fn single(geometry: Geometry, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            areas: vec![SyncArea {
                name: None,
                geometry,
            }],
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error("series {0} disappeared before its dates were persisted")]
    SeriesVanished(String),
}

/// How one geometry came out of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// First sync; the series was created.
    Created,
    /// The existing series gained newer observation dates.
    Extended,
    /// The stored series already covered the requested window.
    UpToDate,
    /// The window ends outside the growing season; nothing was touched.
    OutOfSeason,
    /// The series exists but holds no observations to extend from.
    Empty,
    /// Provider or store failure; previously stored state was left as it was.
    Failed,
}

impl SyncOutcome {
    fn fills_images(self) -> bool {
        matches!(
            self,
            SyncOutcome::Created | SyncOutcome::Extended | SyncOutcome::UpToDate
        )
    }
}

/// The decision for one geometry, computed before any store write.
#[derive(Debug)]
pub struct SyncPlan {
    pub key: String,
    pub geometry: Geometry,
    pub action: PlanAction,
}

#[derive(Debug)]
pub enum PlanAction {
    /// No series yet; `entries` hold the first window, newest-first.
    Create { area: f64, entries: Vec<DateEntry> },
    /// The series lags the window; `entries` are the missing head.
    Extend { entries: Vec<DateEntry> },
    /// The series already covers the window; only missing rasters remain.
    Backfill,
    /// Nothing to do; the outcome says why.
    Skip(SyncOutcome),
}

impl SyncPlan {
    /// Observation dates this plan would add to the series.
    pub fn new_dates(&self) -> usize {
        match &self.action {
            PlanAction::Create { entries, .. } | PlanAction::Extend { entries } => entries.len(),
            PlanAction::Backfill | PlanAction::Skip(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeometrySyncReport {
    pub name: Option<String>,
    /// Content key, absent only when the geometry was rejected before it got
    /// an identity.
    pub key: Option<String>,
    pub outcome: SyncOutcome,
    pub new_dates: usize,
    pub images_saved: usize,
    pub images_deferred: usize,
    pub error: Option<String>,
}

impl GeometrySyncReport {
    fn bare(name: Option<String>, key: Option<String>, outcome: SyncOutcome) -> Self {
        Self {
            name,
            key,
            outcome,
            new_dates: 0,
            images_saved: 0,
            images_deferred: 0,
            error: None,
        }
    }

    fn failed(name: Option<String>, key: Option<String>, error: &SyncError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::bare(name, key, SyncOutcome::Failed)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub geometries: usize,
    pub created: usize,
    pub extended: usize,
    pub skipped: usize,
    pub failed: usize,
    pub images_saved: usize,
    pub images_deferred: usize,
    pub reports: Vec<GeometrySyncReport>,
}

fn summarize(
    batch_id: Uuid,
    started_at: DateTime<Utc>,
    reports: Vec<GeometrySyncReport>,
) -> BatchSummary {
    let mut summary = BatchSummary {
        batch_id,
        started_at,
        finished_at: Utc::now(),
        geometries: reports.len(),
        created: 0,
        extended: 0,
        skipped: 0,
        failed: 0,
        images_saved: 0,
        images_deferred: 0,
        reports,
    };
    for report in &summary.reports {
        match report.outcome {
            SyncOutcome::Created => summary.created += 1,
            SyncOutcome::Extended => summary.extended += 1,
            SyncOutcome::UpToDate | SyncOutcome::OutOfSeason | SyncOutcome::Empty => {
                summary.skipped += 1
            }
            SyncOutcome::Failed => summary.failed += 1,
        }
        summary.images_saved += report.images_saved;
        summary.images_deferred += report.images_deferred;
    }
    summary
}

/// Counts for one geometry's raster pass. `aborted` carries the failure that
/// stopped the pass early; everything saved before it stays saved.
#[derive(Debug, Clone, Default)]
pub struct ImagePhaseReport {
    pub saved: usize,
    pub deferred: usize,
    pub aborted: Option<String>,
}

/// Drives geometries through the three sync phases: decide and fetch
/// statistics, persist the series, then fill in missing rasters.
#[derive(Clone)]
pub struct SyncOrchestrator {
    series: Arc<dyn TimeSeriesStore>,
    images: Arc<dyn ImageStore>,
    statistics: Arc<dyn StatisticsProvider>,
    renderer: Arc<dyn ImageProvider>,
    season: SeasonWindow,
}

impl SyncOrchestrator {
    pub fn new(
        series: Arc<dyn TimeSeriesStore>,
        images: Arc<dyn ImageStore>,
        statistics: Arc<dyn StatisticsProvider>,
        renderer: Arc<dyn ImageProvider>,
        season: SeasonWindow,
    ) -> Self {
        Self {
            series,
            images,
            statistics,
            renderer,
            season,
        }
    }

    /// Decides what the window means for one geometry and fetches the
    /// statistics that decision needs. No store writes happen here.
    ///
    /// A first sync is never season-gated; an existing non-empty series is
    /// only touched while `to` falls inside the season window.
    pub async fn plan(
        &self,
        geometry: &Geometry,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SyncPlan, SyncError> {
        geometry.validate()?;
        if from >= to {
            return Err(ValidationError::EmptyRange { from, to }.into());
        }
        let key = content_key(geometry)?;
        let action = match self.series.get_series(&key).await? {
            None => {
                let entries =
                    fetch_date_entries(self.statistics.as_ref(), geometry, &key, from, to).await?;
                PlanAction::Create {
                    area: area_m2(geometry),
                    entries,
                }
            }
            Some(record) => match record.newest_date() {
                None => {
                    debug!(%key, "series holds no observations; nothing to extend");
                    PlanAction::Skip(SyncOutcome::Empty)
                }
                Some(_) if !self.season.contains(to) => {
                    debug!(%key, %to, "window ends outside the growing season");
                    PlanAction::Skip(SyncOutcome::OutOfSeason)
                }
                Some(newest) if newest >= start_of_day(to) => {
                    debug!(%key, %newest, "series already covers the window");
                    PlanAction::Backfill
                }
                Some(newest) => {
                    let entries = fetch_date_entries(
                        self.statistics.as_ref(),
                        geometry,
                        &key,
                        plus_one_day(newest),
                        to,
                    )
                    .await?;
                    PlanAction::Extend { entries }
                }
            },
        };
        Ok(SyncPlan {
            key,
            geometry: geometry.clone(),
            action,
        })
    }

    /// Applies a plan's store writes. A create with zero entries still
    /// creates the series; an extend with zero entries is a no-op.
    pub async fn persist(&self, plan: &SyncPlan) -> Result<SyncOutcome, SyncError> {
        match &plan.action {
            PlanAction::Create { area, entries } => {
                if !self
                    .series
                    .create_series(&plan.key, &plan.geometry, *area)
                    .await?
                {
                    debug!(key = %plan.key, "series appeared since planning; redundant create dropped");
                    return Ok(SyncOutcome::UpToDate);
                }
                if !entries.is_empty() && !self.series.prepend_dates(&plan.key, entries).await? {
                    return Err(SyncError::SeriesVanished(plan.key.clone()));
                }
                info!(key = %plan.key, dates = entries.len(), "series created");
                Ok(SyncOutcome::Created)
            }
            PlanAction::Extend { entries } => {
                if entries.is_empty() {
                    debug!(key = %plan.key, "window added no observation dates");
                    return Ok(SyncOutcome::UpToDate);
                }
                if !self.series.prepend_dates(&plan.key, entries).await? {
                    return Err(SyncError::SeriesVanished(plan.key.clone()));
                }
                info!(key = %plan.key, dates = entries.len(), "series extended");
                Ok(SyncOutcome::Extended)
            }
            PlanAction::Backfill => Ok(SyncOutcome::UpToDate),
            PlanAction::Skip(outcome) => Ok(*outcome),
        }
    }

    /// Fetches, classifies, and saves the raster for every series date whose
    /// image record is missing, newest first. A date left behind by an
    /// earlier interrupted pass is picked up here like any other.
    ///
    /// A rate-limited date is deferred and the pass moves on; any other
    /// failure aborts the remaining dates of this geometry only.
    pub async fn fill_images(&self, key: &str) -> ImagePhaseReport {
        let mut report = ImagePhaseReport::default();
        let record = match self.series.get_series(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return report,
            Err(e) => {
                report.aborted = Some(e.to_string());
                return report;
            }
        };
        let bbox = match record.geometry.bbox() {
            Ok(bbox) => bbox,
            Err(e) => {
                report.aborted = Some(e.to_string());
                return report;
            }
        };
        for entry in &record.dates {
            match self.fill_one(&record.geometry, bbox, entry).await {
                Ok(true) => report.saved += 1,
                Ok(false) => {}
                Err(SyncError::Provider(e)) if e.is_rate_limited() => {
                    warn!(key, date = %entry.generation_time, "render rate limited; leaving the date for a later pass");
                    report.deferred += 1;
                }
                Err(e) => {
                    warn!(key, date = %entry.generation_time, error = %e, "raster pass aborted");
                    report.aborted = Some(e.to_string());
                    break;
                }
            }
        }
        report
    }

    async fn fill_one(
        &self,
        geometry: &Geometry,
        bbox: Bbox,
        entry: &DateEntry,
    ) -> Result<bool, SyncError> {
        if self.images.has_image(&entry.image_id).await? {
            return Ok(false);
        }
        let raster =
            fetch_classified_raster(self.renderer.as_ref(), geometry, bbox, entry.generation_time)
                .await?;
        let histogram = classify_raster(&raster)?;
        let saved = self
            .images
            .save_image(ImageRecord {
                id: entry.image_id.clone(),
                stats: entry.stats,
                bbox,
                raster,
                histogram,
            })
            .await?;
        Ok(saved)
    }

    /// Runs a whole batch: planning fans out one task per geometry and joins,
    /// series are persisted one at a time, then the raster passes fan out per
    /// geometry. A failure in one geometry never touches its siblings.
    pub async fn run_batch(&self, batch: SyncBatch) -> BatchSummary {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let (from, to) = (batch.from, batch.to);
        let total = batch.areas.len();
        info!(%batch_id, geometries = total, %from, %to, "sync batch started");

        let mut reports: Vec<Option<GeometrySyncReport>> = Vec::new();
        reports.resize_with(total, || None);

        let mut planning = JoinSet::new();
        for (index, area) in batch.areas.into_iter().enumerate() {
            let this = self.clone();
            planning.spawn(async move {
                let plan = this.plan(&area.geometry, from, to).await;
                (index, area, plan)
            });
        }
        let mut planned = Vec::new();
        while let Some(joined) = planning.join_next().await {
            match joined {
                Ok((index, area, Ok(plan))) => planned.push((index, area, plan)),
                Ok((index, area, Err(e))) => {
                    warn!(area = area.name.as_deref().unwrap_or("unnamed"), error = %e, "planning failed");
                    reports[index] = Some(GeometrySyncReport::failed(area.name, None, &e));
                }
                Err(join_error) => error!(%join_error, "planning task aborted"),
            }
        }
        planned.sort_by_key(|(index, _, _)| *index);

        let mut persisted = Vec::new();
        for (index, area, plan) in planned {
            let new_dates = plan.new_dates();
            match self.persist(&plan).await {
                Ok(outcome) => persisted.push(Persisted {
                    index,
                    name: area.name,
                    key: plan.key,
                    outcome,
                    new_dates,
                }),
                Err(e) => {
                    warn!(key = %plan.key, error = %e, "persist failed");
                    reports[index] =
                        Some(GeometrySyncReport::failed(area.name, Some(plan.key), &e));
                }
            }
        }

        let mut filling = JoinSet::new();
        for entry in persisted {
            if !entry.outcome.fills_images() {
                let index = entry.index;
                reports[index] = Some(entry.into_report(ImagePhaseReport::default()));
                continue;
            }
            let this = self.clone();
            filling.spawn(async move {
                let images = this.fill_images(&entry.key).await;
                (entry, images)
            });
        }
        while let Some(joined) = filling.join_next().await {
            match joined {
                Ok((entry, images)) => {
                    let index = entry.index;
                    reports[index] = Some(entry.into_report(images));
                }
                Err(join_error) => error!(%join_error, "raster task aborted"),
            }
        }

        let reports = reports
            .into_iter()
            .map(|report| {
                report.unwrap_or_else(|| GeometrySyncReport {
                    error: Some("sync task aborted before reporting".to_string()),
                    ..GeometrySyncReport::bare(None, None, SyncOutcome::Failed)
                })
            })
            .collect();

        let summary = summarize(batch_id, started_at, reports);
        info!(
            %batch_id,
            created = summary.created,
            extended = summary.extended,
            skipped = summary.skipped,
            failed = summary.failed,
            images_saved = summary.images_saved,
            images_deferred = summary.images_deferred,
            "sync batch finished"
        );
        summary
    }

    /// All three phases for a single geometry.
    pub async fn sync(
        &self,
        geometry: &Geometry,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GeometrySyncReport {
        let summary = self
            .run_batch(SyncBatch::single(geometry.clone(), from, to))
            .await;
        summary
            .reports
            .into_iter()
            .next()
            .unwrap_or_else(|| GeometrySyncReport {
                error: Some("batch produced no report".to_string()),
                ..GeometrySyncReport::bare(None, None, SyncOutcome::Failed)
            })
    }
}

struct Persisted {
    index: usize,
    name: Option<String>,
    key: String,
    outcome: SyncOutcome,
    new_dates: usize,
}

impl Persisted {
    fn into_report(self, images: ImagePhaseReport) -> GeometrySyncReport {
        GeometrySyncReport {
            name: self.name,
            key: Some(self.key),
            outcome: self.outcome,
            new_dates: self.new_dates,
            images_saved: images.saved,
            images_deferred: images.deferred,
            error: images.aborted,
        }
    }
}

/// FIFO queue with a single worker, so batches hit the upstream strictly one
/// at a time. Shared state is the channel, a pending-batch counter, and a
/// notifier for idle waits.
#[derive(Clone)]
pub struct SyncScheduler {
    queue: mpsc::UnboundedSender<SyncBatch>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl SyncScheduler {
    /// Spawns the worker task and hands back the submission handle.
    pub fn spawn(orchestrator: SyncOrchestrator) -> Self {
        let (queue, mut inbox) = mpsc::unbounded_channel::<SyncBatch>();
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let worker_pending = Arc::clone(&pending);
        let worker_drained = Arc::clone(&drained);
        tokio::spawn(async move {
            while let Some(batch) = inbox.recv().await {
                let summary = orchestrator.run_batch(batch).await;
                let remaining = worker_pending.fetch_sub(1, Ordering::AcqRel) - 1;
                debug!(batch_id = %summary.batch_id, remaining, "batch drained");
                if remaining == 0 {
                    worker_drained.notify_waiters();
                }
            }
        });
        Self {
            queue,
            pending,
            drained,
        }
    }

    /// Enqueues a batch behind everything already submitted. Returns false
    /// when the worker has shut down.
    pub fn submit(&self, batch: SyncBatch) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(batch).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// True while no submitted batch is queued or being processed.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    /// Resolves once every submitted batch has been fully processed.
    pub async fn wait_until_idle(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// A batch covering every stored series over the year up to `to`, for the
/// scheduled refresh. Incremental syncs only read the window's far end, so
/// the generous `from` costs nothing for series that already hold dates.
pub async fn build_refresh_batch(
    series: &dyn TimeSeriesStore,
    to: DateTime<Utc>,
) -> Result<SyncBatch, SyncError> {
    let stored = series.list_series().await?;
    Ok(SyncBatch {
        from: to - chrono::Duration::days(365),
        to,
        areas: stored
            .into_iter()
            .map(|record| SyncArea {
                name: None,
                geometry: record.geometry,
            })
            .collect(),
    })
}

/// Starts the cron-driven refresher when enabled: each tick lists the stored
/// series and submits one refresh batch ending now.
pub async fn maybe_start_refresher(
    config: &SyncConfig,
    scheduler: SyncScheduler,
    series: Arc<dyn TimeSeriesStore>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let jobs = JobScheduler::new().await.context("creating job scheduler")?;
    let cron = config.refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let scheduler = scheduler.clone();
        let series = Arc::clone(&series);
        Box::pin(async move {
            match build_refresh_batch(series.as_ref(), Utc::now()).await {
                Ok(batch) if batch.areas.is_empty() => {
                    debug!("refresh tick found no stored series")
                }
                Ok(batch) => {
                    info!(
                        areas = batch.areas.len(),
                        "submitting scheduled refresh batch"
                    );
                    if !scheduler.submit(batch) {
                        warn!("sync worker is gone; refresh batch dropped");
                    }
                }
                Err(e) => warn!(error = %e, "refresh tick could not list stored series"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {cron}"))?;
    jobs.add(job).await.context("adding refresh job")?;
    jobs.start().await.context("starting job scheduler")?;
    Ok(Some(jobs))
}

/// Removes a geometry's series and every raster its dates reference.
/// `Ok(false)` when no series exists for the geometry.
pub async fn delete_geometry(
    series: &dyn TimeSeriesStore,
    images: &dyn ImageStore,
    geometry: &Geometry,
) -> Result<bool, SyncError> {
    let key = content_key(geometry)?;
    let Some(record) = series.get_series(&key).await? else {
        return Ok(false);
    };
    for entry in &record.dates {
        let removed = images.delete_image(&entry.image_id).await?;
        debug!(image = %entry.image_id, removed, "image record removed");
    }
    Ok(series.delete_series(&key).await?)
}

/// Wires an orchestrator against the live HTTP providers.
pub fn build_orchestrator(
    config: &SyncConfig,
    series: Arc<dyn TimeSeriesStore>,
    images: Arc<dyn ImageStore>,
) -> Result<SyncOrchestrator> {
    let tokens: Arc<dyn TokenProvider> =
        Arc::new(StaticTokenProvider::from_optional(config.auth_token.clone()));
    let providers = config.provider_config();
    let statistics = HttpStatisticsProvider::new(&providers, Arc::clone(&tokens))
        .context("building statistics provider")?;
    let renderer = HttpImageProvider::new(&providers, tokens).context("building image provider")?;
    Ok(SyncOrchestrator::new(
        series,
        images,
        Arc::new(statistics),
        Arc::new(renderer),
        config.season,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use verdi_storage::MemoryStore;

    #[test]
    fn registry_yaml_skips_disabled_areas() {
        let text = r#"
areas:
  - name: north-field
    enabled: true
    geometry:
      type: Polygon
      coordinates: [[[30.0, 50.0], [30.1, 50.0], [30.1, 50.1], [30.0, 50.0]]]
  - name: fallow-strip
    enabled: false
    geometry:
      type: Polygon
      coordinates: [[[31.0, 50.0], [31.1, 50.0], [31.1, 50.1], [31.0, 50.0]]]
"#;
        let registry: AreaRegistry = serde_yaml::from_str(text).unwrap();
        assert_eq!(registry.areas.len(), 2);

        let from = Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).single().unwrap();
        let to = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).single().unwrap();
        let batch = registry.batch(from, to);
        assert_eq!(batch.areas.len(), 1);
        assert_eq!(batch.areas[0].name.as_deref(), Some("north-field"));
        assert_eq!(batch.from, from);
        assert_eq!(batch.to, to);
    }

    #[test]
    fn season_bounds_parse_from_month_day_strings() {
        assert_eq!(parse_month_day("04-01"), Some((4, 1)));
        assert_eq!(parse_month_day("9-30"), Some((9, 30)));
        assert_eq!(parse_month_day("April"), None);
        assert_eq!(parse_month_day("04"), None);
    }

    #[test]
    fn summaries_bucket_outcomes() {
        let reports = vec![
            GeometrySyncReport::bare(None, None, SyncOutcome::Created),
            GeometrySyncReport::bare(None, None, SyncOutcome::Extended),
            GeometrySyncReport::bare(None, None, SyncOutcome::UpToDate),
            GeometrySyncReport::bare(None, None, SyncOutcome::OutOfSeason),
            GeometrySyncReport::bare(None, None, SyncOutcome::Empty),
            GeometrySyncReport::bare(None, None, SyncOutcome::Failed),
        ];
        let summary = summarize(Uuid::new_v4(), Utc::now(), reports);
        assert_eq!(summary.geometries, 6);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.extended, 1);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn refresh_batches_span_the_trailing_year() {
        let store = MemoryStore::new();
        let geometry = Geometry::Polygon {
            coordinates: vec![vec![
                vec![30.0, 50.0],
                vec![30.1, 50.0],
                vec![30.1, 50.1],
                vec![30.0, 50.0],
            ]],
        };
        let key = content_key(&geometry).unwrap();
        assert!(store.create_series(&key, &geometry, 1.0).await.unwrap());

        let to = Utc.with_ymd_and_hms(2023, 6, 20, 8, 0, 0).single().unwrap();
        let batch = build_refresh_batch(&store, to).await.unwrap();
        assert_eq!(batch.to, to);
        assert_eq!(batch.from, to - chrono::Duration::days(365));
        assert_eq!(batch.areas.len(), 1);
        assert_eq!(batch.areas[0].geometry, geometry);
    }
}
