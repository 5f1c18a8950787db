//! End-to-end sync flows over the in-memory store with scripted providers.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use image::{ImageFormat, Rgba, RgbaImage};
use verdi_core::{content_key, image_id, plus_one_day, Bbox, Geometry, HealthBand, SeasonWindow};
use verdi_providers::{DailyStatistic, ImageProvider, ProviderError, StatisticsProvider};
use verdi_storage::{ImageStore, MemoryStore, TimeSeriesStore};
use verdi_sync::{
    build_refresh_batch, delete_geometry, SyncArea, SyncBatch, SyncOrchestrator, SyncOutcome,
    SyncScheduler,
};

const SPARSE_RED: [u8; 4] = [244, 67, 54, 255];

fn polygon(x0: f64, y0: f64) -> Geometry {
    Geometry::Polygon {
        coordinates: vec![vec![
            vec![x0, y0],
            vec![x0 + 0.1, y0],
            vec![x0 + 0.1, y0 + 0.1],
            vec![x0, y0 + 0.1],
            vec![x0, y0],
        ]],
    }
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 6, d, 0, 0, 0).single().unwrap()
}

fn sample(at: DateTime<Utc>, mean: f64) -> DailyStatistic {
    DailyStatistic {
        date: at,
        mean,
        max: mean + 0.2,
        min: mean - 0.05,
        std_dev: 0.03,
    }
}

fn tiny_png() -> Vec<u8> {
    let mut img = RgbaImage::new(2, 2);
    for pixel in img.pixels_mut() {
        *pixel = Rgba(SPARSE_RED);
    }
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Statistics provider that serves a fixed sample set clipped to the
/// requested window and records every window it was asked for.
#[derive(Default)]
struct ScriptedStatistics {
    samples: Vec<DailyStatistic>,
    fail_with_status: Option<u16>,
    requested: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl ScriptedStatistics {
    fn with_samples(samples: Vec<DailyStatistic>) -> Self {
        Self {
            samples,
            ..Self::default()
        }
    }

    fn requested_windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatisticsProvider for ScriptedStatistics {
    async fn daily_statistics(
        &self,
        _geometry: &Geometry,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyStatistic>, ProviderError> {
        self.requested.lock().unwrap().push((from, to));
        if let Some(status) = self.fail_with_status {
            return Err(ProviderError::HttpStatus {
                status,
                url: "http://stats.test/".into(),
            });
        }
        Ok(self
            .samples
            .iter()
            .filter(|sample| sample.date >= from && sample.date < to)
            .copied()
            .collect())
    }
}

/// Renderer that returns a solid red tile, with scripted failures per date.
#[derive(Default)]
struct ScriptedRenderer {
    rate_limited: HashSet<DateTime<Utc>>,
    failing: Option<(Geometry, DateTime<Utc>)>,
    rendered: Mutex<Vec<DateTime<Utc>>>,
}

#[async_trait]
impl ImageProvider for ScriptedRenderer {
    async fn render(
        &self,
        geometry: &Geometry,
        _bbox: Bbox,
        date: DateTime<Utc>,
        _width: u32,
        _height: u32,
    ) -> Result<Vec<u8>, ProviderError> {
        if self.rate_limited.contains(&date) {
            return Err(ProviderError::RateLimited {
                url: "http://render.test/".into(),
            });
        }
        if let Some((failing_geometry, failing_date)) = &self.failing {
            if failing_geometry == geometry && *failing_date == date {
                return Err(ProviderError::HttpStatus {
                    status: 502,
                    url: "http://render.test/".into(),
                });
            }
        }
        self.rendered.lock().unwrap().push(date);
        Ok(tiny_png())
    }
}

struct Rig {
    store: Arc<MemoryStore>,
    statistics: Arc<ScriptedStatistics>,
    renderer: Arc<ScriptedRenderer>,
    orchestrator: SyncOrchestrator,
}

fn rig(statistics: ScriptedStatistics, renderer: ScriptedRenderer) -> Rig {
    let store = Arc::new(MemoryStore::new());
    let statistics = Arc::new(statistics);
    let renderer = Arc::new(renderer);
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        store.clone(),
        statistics.clone(),
        renderer.clone(),
        SeasonWindow::default(),
    );
    Rig {
        store,
        statistics,
        renderer,
        orchestrator,
    }
}

#[tokio::test]
async fn first_sync_creates_series_and_rasters() {
    let geometry = polygon(30.0, 50.0);
    let statistics = ScriptedStatistics::with_samples(vec![
        sample(day(10), 0.42),
        sample(day(12), 0.05),
        sample(day(14), 0.31),
    ]);
    let rig = rig(statistics, ScriptedRenderer::default());

    let report = rig.orchestrator.sync(&geometry, day(1), day(15)).await;

    let key = content_key(&geometry).unwrap();
    assert_eq!(report.outcome, SyncOutcome::Created);
    assert_eq!(report.key.as_deref(), Some(key.as_str()));
    assert_eq!(report.new_dates, 2);
    assert_eq!(report.images_saved, 2);
    assert!(report.error.is_none());

    let record = rig.store.get_series(&key).await.unwrap().unwrap();
    assert_eq!(record.dates.len(), 2);
    assert_eq!(record.dates[0].generation_time, day(14));
    assert_eq!(record.dates[1].generation_time, day(10));
    assert!(record.area > 0.0);
    for entry in &record.dates {
        assert!(rig.store.has_image(&entry.image_id).await.unwrap());
    }

    let image = rig
        .store
        .get_image(&record.dates[0].image_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(image.histogram.len(), 1);
    assert_eq!(image.histogram[0].band, HealthBand::Sparse);
    assert_eq!(image.histogram[0].percent, 100);
    assert_eq!(image.stats.average, 0.31);
}

#[tokio::test]
async fn first_sync_with_no_observations_still_creates_the_series() {
    let geometry = polygon(31.0, 50.0);
    let rig = rig(ScriptedStatistics::default(), ScriptedRenderer::default());

    let report = rig.orchestrator.sync(&geometry, day(1), day(15)).await;

    assert_eq!(report.outcome, SyncOutcome::Created);
    assert_eq!(report.new_dates, 0);
    assert_eq!(report.images_saved, 0);

    let key = content_key(&geometry).unwrap();
    let record = rig.store.get_series(&key).await.unwrap().unwrap();
    assert!(record.dates.is_empty());
    assert!(rig.renderer.rendered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_first_fetch_leaves_no_record() {
    let geometry = polygon(32.0, 50.0);
    let statistics = ScriptedStatistics {
        fail_with_status: Some(500),
        ..ScriptedStatistics::default()
    };
    let rig = rig(statistics, ScriptedRenderer::default());

    let report = rig.orchestrator.sync(&geometry, day(1), day(15)).await;

    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert!(report.error.is_some());
    let key = content_key(&geometry).unwrap();
    assert!(rig.store.get_series(&key).await.unwrap().is_none());
    assert!(rig.renderer.rendered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn first_sync_runs_even_out_of_season() {
    let geometry = polygon(33.0, 50.0);
    let november = Utc.with_ymd_and_hms(2023, 11, 20, 0, 0, 0).single().unwrap();
    let statistics = ScriptedStatistics::with_samples(vec![sample(november, 0.22)]);
    let rig = rig(statistics, ScriptedRenderer::default());

    let from = Utc.with_ymd_and_hms(2023, 11, 1, 0, 0, 0).single().unwrap();
    let to = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).single().unwrap();
    let report = rig.orchestrator.sync(&geometry, from, to).await;

    assert_eq!(report.outcome, SyncOutcome::Created);
    assert_eq!(report.new_dates, 1);
}

#[tokio::test]
async fn incremental_sync_requests_only_the_missing_tail() {
    let geometry = polygon(34.0, 50.0);
    let statistics = ScriptedStatistics::with_samples(vec![
        sample(day(10), 0.40),
        sample(day(12), 0.35),
        sample(day(14), 0.28),
    ]);
    let rig = rig(statistics, ScriptedRenderer::default());

    let first = rig.orchestrator.sync(&geometry, day(1), day(11)).await;
    assert_eq!(first.outcome, SyncOutcome::Created);
    assert_eq!(first.new_dates, 1);

    let second = rig.orchestrator.sync(&geometry, day(1), day(15)).await;
    assert_eq!(second.outcome, SyncOutcome::Extended);
    assert_eq!(second.new_dates, 2);

    let requested = rig.statistics.requested_windows();
    assert_eq!(requested.len(), 2);
    assert_eq!(requested[1], (plus_one_day(day(10)), day(15)));

    let key = content_key(&geometry).unwrap();
    let record = rig.store.get_series(&key).await.unwrap().unwrap();
    let dates: Vec<_> = record
        .dates
        .iter()
        .map(|entry| entry.generation_time)
        .collect();
    assert_eq!(dates, vec![day(14), day(12), day(10)]);
}

#[tokio::test]
async fn current_series_skips_statistics_but_backfills_missing_rasters() {
    let geometry = polygon(35.0, 50.0);
    let statistics =
        ScriptedStatistics::with_samples(vec![sample(day(10), 0.40), sample(day(14), 0.33)]);
    let rig = rig(statistics, ScriptedRenderer::default());

    let first = rig.orchestrator.sync(&geometry, day(1), day(15)).await;
    assert_eq!(first.images_saved, 2);

    let key = content_key(&geometry).unwrap();
    let dropped = image_id(day(10), &key);
    assert!(rig.store.delete_image(&dropped).await.unwrap());

    let to = Utc.with_ymd_and_hms(2023, 6, 14, 10, 30, 0).single().unwrap();
    let second = rig.orchestrator.sync(&geometry, day(1), to).await;

    assert_eq!(second.outcome, SyncOutcome::UpToDate);
    assert_eq!(second.new_dates, 0);
    assert_eq!(second.images_saved, 1);
    assert_eq!(rig.statistics.requested_windows().len(), 1);
    assert!(rig.store.has_image(&dropped).await.unwrap());
}

#[tokio::test]
async fn out_of_season_window_leaves_everything_untouched() {
    let geometry = polygon(36.0, 50.0);
    let statistics = ScriptedStatistics::with_samples(vec![sample(day(10), 0.40)]);
    let rig = rig(statistics, ScriptedRenderer::default());

    rig.orchestrator.sync(&geometry, day(1), day(15)).await;
    let key = content_key(&geometry).unwrap();
    let dropped = image_id(day(10), &key);
    assert!(rig.store.delete_image(&dropped).await.unwrap());

    let december = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).single().unwrap();
    let report = rig.orchestrator.sync(&geometry, day(1), december).await;

    assert_eq!(report.outcome, SyncOutcome::OutOfSeason);
    assert_eq!(report.images_saved, 0);
    assert_eq!(rig.statistics.requested_windows().len(), 1);
    assert!(!rig.store.has_image(&dropped).await.unwrap());
}

#[tokio::test]
async fn series_without_observations_is_left_alone() {
    let geometry = polygon(37.0, 50.0);
    let rig = rig(ScriptedStatistics::default(), ScriptedRenderer::default());
    let key = content_key(&geometry).unwrap();
    assert!(rig
        .store
        .create_series(&key, &geometry, 1000.0)
        .await
        .unwrap());

    let report = rig.orchestrator.sync(&geometry, day(1), day(15)).await;

    assert_eq!(report.outcome, SyncOutcome::Empty);
    assert!(rig.statistics.requested_windows().is_empty());
    assert!(rig.renderer.rendered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rate_limited_render_defers_one_date_and_continues() {
    let geometry = polygon(38.0, 50.0);
    let statistics = ScriptedStatistics::with_samples(vec![
        sample(day(10), 0.40),
        sample(day(12), 0.35),
        sample(day(14), 0.30),
    ]);
    let mut renderer = ScriptedRenderer::default();
    renderer.rate_limited.insert(day(12));
    let rig = rig(statistics, renderer);

    let report = rig.orchestrator.sync(&geometry, day(1), day(15)).await;

    assert_eq!(report.outcome, SyncOutcome::Created);
    assert_eq!(report.images_saved, 2);
    assert_eq!(report.images_deferred, 1);
    assert!(report.error.is_none());

    let key = content_key(&geometry).unwrap();
    assert!(!rig.store.has_image(&image_id(day(12), &key)).await.unwrap());
    assert!(rig.store.has_image(&image_id(day(10), &key)).await.unwrap());
    assert!(rig.store.has_image(&image_id(day(14), &key)).await.unwrap());
}

#[tokio::test]
async fn render_failure_aborts_one_geometry_without_touching_siblings() {
    let healthy = polygon(39.0, 50.0);
    let broken = polygon(40.0, 50.0);
    let statistics =
        ScriptedStatistics::with_samples(vec![sample(day(10), 0.40), sample(day(14), 0.30)]);
    let mut renderer = ScriptedRenderer::default();
    renderer.failing = Some((broken.clone(), day(14)));
    let rig = rig(statistics, renderer);

    let batch = SyncBatch {
        from: day(1),
        to: day(15),
        areas: vec![
            SyncArea {
                name: Some("healthy".into()),
                geometry: healthy.clone(),
            },
            SyncArea {
                name: Some("broken".into()),
                geometry: broken.clone(),
            },
        ],
    };
    let summary = rig.orchestrator.run_batch(batch).await;

    assert_eq!(summary.geometries, 2);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.images_saved, 2);

    let broken_key = content_key(&broken).unwrap();
    let broken_report = summary
        .reports
        .iter()
        .find(|report| report.key.as_deref() == Some(broken_key.as_str()))
        .unwrap();
    assert_eq!(broken_report.images_saved, 0);
    assert!(broken_report.error.is_some());

    // The broken geometry keeps its series; rasters arrive on a later pass.
    let broken_record = rig.store.get_series(&broken_key).await.unwrap().unwrap();
    assert_eq!(broken_record.dates.len(), 2);

    let healthy_key = content_key(&healthy).unwrap();
    for entry in &rig.store.get_series(&healthy_key).await.unwrap().unwrap().dates {
        assert!(rig.store.has_image(&entry.image_id).await.unwrap());
    }
    assert_eq!(rig.renderer.rendered.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn queued_batches_drain_strictly_in_order() {
    let geometry_a = polygon(41.0, 50.0);
    let geometry_b = polygon(42.0, 50.0);
    let statistics = ScriptedStatistics::with_samples(vec![sample(day(10), 0.40)]);
    let rig = rig(statistics, ScriptedRenderer::default());
    let scheduler = SyncScheduler::spawn(rig.orchestrator.clone());

    assert!(scheduler.is_idle());
    assert!(scheduler.submit(SyncBatch::single(geometry_a, day(1), day(11))));
    assert!(scheduler.submit(SyncBatch::single(geometry_b, day(1), day(15))));
    assert!(!scheduler.is_idle());

    scheduler.wait_until_idle().await;
    assert!(scheduler.is_idle());

    let requested = rig.statistics.requested_windows();
    assert_eq!(requested, vec![(day(1), day(11)), (day(1), day(15))]);
}

#[tokio::test]
async fn refresh_batches_cover_every_stored_series() {
    let geometry_a = polygon(43.0, 50.0);
    let geometry_b = polygon(44.0, 50.0);
    let statistics = ScriptedStatistics::with_samples(vec![sample(day(10), 0.40)]);
    let rig = rig(statistics, ScriptedRenderer::default());
    rig.orchestrator.sync(&geometry_a, day(1), day(15)).await;
    rig.orchestrator.sync(&geometry_b, day(1), day(15)).await;

    let now = Utc.with_ymd_and_hms(2023, 6, 20, 8, 0, 0).single().unwrap();
    let batch = build_refresh_batch(&*rig.store, now).await.unwrap();

    assert_eq!(batch.to, now);
    assert_eq!(batch.from, now - chrono::Duration::days(365));
    assert_eq!(batch.areas.len(), 2);

    // Nothing new upstream, so the refresh leaves both series as they were.
    let summary = rig.orchestrator.run_batch(batch).await;
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn delete_geometry_removes_series_and_rasters() {
    let geometry = polygon(45.0, 50.0);
    let statistics =
        ScriptedStatistics::with_samples(vec![sample(day(10), 0.40), sample(day(14), 0.30)]);
    let rig = rig(statistics, ScriptedRenderer::default());
    rig.orchestrator.sync(&geometry, day(1), day(15)).await;

    let key = content_key(&geometry).unwrap();
    let image_ids: Vec<String> = rig
        .store
        .get_series(&key)
        .await
        .unwrap()
        .unwrap()
        .dates
        .iter()
        .map(|entry| entry.image_id.clone())
        .collect();
    assert_eq!(image_ids.len(), 2);

    assert!(delete_geometry(&*rig.store, &*rig.store, &geometry)
        .await
        .unwrap());

    assert!(rig.store.get_series(&key).await.unwrap().is_none());
    for id in image_ids {
        assert!(!rig.store.has_image(&id).await.unwrap());
    }
    assert!(!delete_geometry(&*rig.store, &*rig.store, &geometry)
        .await
        .unwrap());
}
