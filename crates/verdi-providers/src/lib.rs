//! Upstream imagery-provider boundary: the bearer-token capability, the
//! daily-statistics and raster-rendering endpoints, and reduction of
//! rendered rasters into per-band percentage histograms.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use verdi_core::{
    render_dimensions, BandShare, BandStats, Bbox, DateEntry, Geometry, PALETTE,
};

pub const CRATE_NAME: &str = "verdi-providers";

pub const DEFAULT_STATISTICS_URL: &str = "https://services.sentinel-hub.com/api/v1/statistics";
pub const DEFAULT_PROCESS_URL: &str = "https://services.sentinel-hub.com/api/v1/process";

/// Cloud-cover ceiling sent with every statistics request, in percent.
pub const CLOUD_COVER_MAX: u8 = 20;

/// Days whose mean NDVI falls below this are dropped as signal-free.
pub const MIN_MEAN_NDVI: f64 = 0.10;

/// Render script sent with every raster request. Output colors below the
/// healthy range match the legend palette exactly; the healthy range fans
/// out into darker shades the classifier folds back into one band.
pub const NDVI_EVALSCRIPT: &str = r#"//VERSION=3
function setup() {
    return {
        input: ["B04", "B08", "dataMask"],
        output: [
            { id: "default", bands: 4 },
            { id: "index", bands: 1, sampleType: "FLOAT32" },
            { id: "dataMask", bands: 1 }
        ]
    };
}

function evaluatePixel(samples) {
    let val = index(samples.B08, samples.B04);
    let imgVals = null;
    const indexVal = samples.dataMask === 1 ? val : NaN;

    if (val < 0.30) imgVals = [0.9568627450980393, 0.2627450980392157, 0.21176470588235294, samples.dataMask];
    else if (val < 0.45) imgVals = [1.0, 0.596078431372549, 0.0, samples.dataMask];
    else if (val < 0.60) imgVals = [1.0, 0.9215686274509803, 0.23137254901960785, samples.dataMask];
    else if (val < 0.65) imgVals = [0.31, 0.54, 0.18, samples.dataMask];
    else if (val < 0.70) imgVals = [0.25, 0.49, 0.14, samples.dataMask];
    else if (val < 0.75) imgVals = [0.19, 0.43, 0.11, samples.dataMask];
    else if (val < 0.80) imgVals = [0.13, 0.38, 0.07, samples.dataMask];
    else if (val < 0.85) imgVals = [0.06, 0.33, 0.04, samples.dataMask];
    else imgVals = [0, 0.27, 0, samples.dataMask];
    return {
        default: imgVals,
        index: [indexVal],
        dataMask: [samples.dataMask]
    };
}
"#;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no bearer token configured")]
    MissingToken,
    #[error("authorization rejected: http status {status} for {url}")]
    Auth { status: u16, url: String },
    #[error("rate limited by the upstream for {url}")]
    RateLimited { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ProviderError {
    /// The one recoverable upstream signal: skip the current unit of work
    /// and keep going.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

fn status_error(status: StatusCode, url: String) -> ProviderError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ProviderError::Auth {
            status: status.as_u16(),
            url,
        }
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited { url }
    } else {
        ProviderError::HttpStatus {
            status: status.as_u16(),
            url,
        }
    }
}

/// A currently-valid bearer credential for the upstream. Refresh policy
/// lives behind this seam; fetchers only ever ask for a usable token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, ProviderError>;
}

/// Token provider backed by a value fixed at construction time, typically
/// sourced from the environment.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self::from_optional(Some(token.into()))
    }

    /// Empty and whitespace-only values count as absent, so a blank
    /// environment variable fails loudly at request time instead of
    /// producing a bogus `Authorization` header.
    pub fn from_optional(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, ProviderError> {
        self.token.clone().ok_or(ProviderError::MissingToken)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub statistics_url: String,
    pub process_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            statistics_url: DEFAULT_STATISTICS_URL.to_string(),
            process_url: DEFAULT_PROCESS_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

fn build_client(config: &ProviderConfig) -> Result<reqwest::Client, ProviderError> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    Ok(builder.build()?)
}

/// One per-day aggregate as reported by the upstream, oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatistic {
    pub date: DateTime<Utc>,
    pub mean: f64,
    pub max: f64,
    pub min: f64,
    pub std_dev: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsRequest<'a> {
    geometry: &'a Geometry,
    from_time: DateTime<Utc>,
    to_time: DateTime<Utc>,
    daily_aggregation: bool,
    cloud_cover_max: u8,
}

#[derive(Debug, Deserialize)]
struct StatisticsResponse {
    data: Vec<DailyStatistic>,
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    geometry: &'a Geometry,
    bbox: [f64; 4],
    date: DateTime<Utc>,
    width: u32,
    height: u32,
    evalscript: &'a str,
}

/// Daily aggregate NDVI statistics for a geometry over `[from, to)`.
#[async_trait]
pub trait StatisticsProvider: Send + Sync {
    async fn daily_statistics(
        &self,
        geometry: &Geometry,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyStatistic>, ProviderError>;
}

/// Classified raster rendering for a single observation date.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn render(
        &self,
        geometry: &Geometry,
        bbox: Bbox,
        date: DateTime<Utc>,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, ProviderError>;
}

pub struct HttpStatisticsProvider {
    client: reqwest::Client,
    url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpStatisticsProvider {
    pub fn new(
        config: &ProviderConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config)?,
            url: config.statistics_url.clone(),
            tokens,
        })
    }
}

#[async_trait]
impl StatisticsProvider for HttpStatisticsProvider {
    async fn daily_statistics(
        &self,
        geometry: &Geometry,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyStatistic>, ProviderError> {
        let token = self.tokens.bearer_token().await?;
        let request = StatisticsRequest {
            geometry,
            from_time: from,
            to_time: to,
            daily_aggregation: true,
            cloud_cover_max: CLOUD_COVER_MAX,
        };
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            return Err(status_error(status, url));
        }
        let parsed: StatisticsResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Decode {
                    url,
                    message: e.to_string(),
                })?;
        Ok(parsed.data)
    }
}

pub struct HttpImageProvider {
    client: reqwest::Client,
    url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpImageProvider {
    pub fn new(
        config: &ProviderConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config)?,
            url: config.process_url.clone(),
            tokens,
        })
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    async fn render(
        &self,
        geometry: &Geometry,
        bbox: Bbox,
        date: DateTime<Utc>,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, ProviderError> {
        let token = self.tokens.bearer_token().await?;
        let request = RenderRequest {
            geometry,
            bbox: bbox.to_array(),
            date,
            width,
            height,
            evalscript: NDVI_EVALSCRIPT,
        };
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            return Err(status_error(status, url));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Turns the upstream's oldest-first day samples into newest-first date
/// entries, dropping days whose mean falls under [`MIN_MEAN_NDVI`].
pub fn to_date_entries(samples: &[DailyStatistic], geometry_key: &str) -> Vec<DateEntry> {
    samples
        .iter()
        .rev()
        .filter(|sample| sample.mean >= MIN_MEAN_NDVI)
        .map(|sample| {
            DateEntry::new(
                sample.date,
                BandStats {
                    average: sample.mean,
                    max: sample.max,
                    min: sample.min,
                    std_dev: sample.std_dev,
                },
                geometry_key,
            )
        })
        .collect()
}

/// Fetches and filters one window of daily statistics. An empty upstream
/// response is not an error; it is logged and yields an empty series.
pub async fn fetch_date_entries(
    provider: &dyn StatisticsProvider,
    geometry: &Geometry,
    geometry_key: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<DateEntry>, ProviderError> {
    let samples = provider.daily_statistics(geometry, from, to).await?;
    if samples.is_empty() {
        info!(
            geometry = geometry_key,
            %from,
            %to,
            "upstream reported no observations for the window"
        );
    }
    Ok(to_date_entries(&samples, geometry_key))
}

/// Renders the classified raster for one observation date at the capped,
/// aspect-correct resolution derived from the bbox.
pub async fn fetch_classified_raster(
    provider: &dyn ImageProvider,
    geometry: &Geometry,
    bbox: Bbox,
    date: DateTime<Utc>,
) -> Result<Vec<u8>, ProviderError> {
    let (width, height) = render_dimensions(bbox);
    provider.render(geometry, bbox, date, width, height).await
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("raster is not a decodable png: {0}")]
    UndecodableRaster(#[from] image::ImageError),
}

/// Reduces a rendered RGBA raster to per-band percentage shares.
///
/// Fully transparent pixels sit outside the area of interest and are
/// excluded from the denominator. Every color that is not one of the
/// lower palette colors counts toward the healthy catch-all. The result
/// carries only the bands that received pixels, in palette order, and sums
/// to 100 after a single ±1 rounding correction.
pub fn classify_raster(png: &[u8]) -> Result<Vec<BandShare>, ClassifyError> {
    let rgba = image::load_from_memory_with_format(png, ImageFormat::Png)?.to_rgba8();

    let mut total: u64 = 0;
    let mut color_counts: HashMap<[u8; 3], u64> = HashMap::new();
    for pixel in rgba.pixels() {
        let [r, g, b, a] = pixel.0;
        if a == 0 {
            continue;
        }
        total += 1;
        *color_counts.entry([r, g, b]).or_insert(0) += 1;
    }
    if total == 0 {
        return Ok(Vec::new());
    }

    let catch_all = PALETTE.len() - 1;
    let mut bucket_counts = [0u64; PALETTE.len()];
    for (color, count) in color_counts {
        let bucket = PALETTE[..catch_all]
            .iter()
            .position(|entry| entry.color == color)
            .unwrap_or(catch_all);
        bucket_counts[bucket] += count;
    }

    let mut shares: Vec<BandShare> = PALETTE
        .iter()
        .zip(bucket_counts.iter())
        .filter(|(_, &count)| count > 0)
        .map(|(entry, &count)| BandShare {
            band: entry.band,
            color: entry.color,
            percent: ((count as f64 / total as f64) * 100.0).round() as u8,
        })
        .collect();

    // Only one unit is ever moved, even when |error| > 1.
    let sum: i32 = shares.iter().map(|share| i32::from(share.percent)).sum();
    let error = 100 - sum;
    if error > 0 {
        let index = first_extreme(&shares, |candidate, best| candidate < best);
        shares[index].percent += 1;
    } else if error < 0 {
        let index = first_extreme(&shares, |candidate, best| candidate > best);
        shares[index].percent -= 1;
    }
    Ok(shares)
}

fn first_extreme(shares: &[BandShare], better: impl Fn(u8, u8) -> bool) -> usize {
    let mut best = 0;
    for (index, share) in shares.iter().enumerate().skip(1) {
        if better(share.percent, shares[best].percent) {
            best = index;
        }
    }
    best
}
