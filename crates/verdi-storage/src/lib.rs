//! Persistence interfaces and stores for VERDI series and raster records.
//!
//! Logical rejections (a record that already exists, an id that does not)
//! come back as `Ok(false)`; `Err` is reserved for storage failures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use verdi_core::{Bbox, BandShare, BandStats, DateEntry, Geometry, GeometryRecord, ImageRecord};

pub const CRATE_NAME: &str = "verdi-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record {id} failed to encode: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record at {path} failed to decode: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Per-geometry time series persistence. `dates` inside a record is
/// newest-first and grows only at the head.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn get_series(&self, id: &str) -> Result<Option<GeometryRecord>, StoreError>;

    /// Creates an empty series for the geometry. `Ok(false)` when a series
    /// with this id already exists; nothing is overwritten.
    async fn create_series(
        &self,
        id: &str,
        geometry: &Geometry,
        area: f64,
    ) -> Result<bool, StoreError>;

    /// Inserts `entries` (given newest-first) ahead of the existing dates,
    /// preserving their order. `Ok(false)` when the series does not exist.
    async fn prepend_dates(&self, id: &str, entries: &[DateEntry]) -> Result<bool, StoreError>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete_series(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_series(&self) -> Result<Vec<GeometryRecord>, StoreError>;
}

/// Classified raster persistence. Records are created once and never
/// mutated; re-saving an existing id is a no-op.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// `Ok(false)` when a record with this id already exists.
    async fn save_image(&self, record: ImageRecord) -> Result<bool, StoreError>;

    async fn get_image(&self, id: &str) -> Result<Option<ImageRecord>, StoreError>;

    async fn has_image(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.get_image(id).await?.is_some())
    }

    /// `Ok(false)` when there was nothing to delete.
    async fn delete_image(&self, id: &str) -> Result<bool, StoreError>;
}

/// In-memory store used as the default backend in tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: Mutex<HashMap<String, GeometryRecord>>,
    images: Mutex<HashMap<String, ImageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn get_series(&self, id: &str) -> Result<Option<GeometryRecord>, StoreError> {
        Ok(self.series.lock().await.get(id).cloned())
    }

    async fn create_series(
        &self,
        id: &str,
        geometry: &Geometry,
        area: f64,
    ) -> Result<bool, StoreError> {
        let mut series = self.series.lock().await;
        if series.contains_key(id) {
            return Ok(false);
        }
        series.insert(
            id.to_string(),
            GeometryRecord {
                id: id.to_string(),
                geometry: geometry.clone(),
                area,
                dates: Vec::new(),
            },
        );
        Ok(true)
    }

    async fn prepend_dates(&self, id: &str, entries: &[DateEntry]) -> Result<bool, StoreError> {
        let mut series = self.series.lock().await;
        let Some(record) = series.get_mut(id) else {
            return Ok(false);
        };
        record.dates.splice(0..0, entries.iter().cloned());
        Ok(true)
    }

    async fn delete_series(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.series.lock().await.remove(id).is_some())
    }

    async fn list_series(&self) -> Result<Vec<GeometryRecord>, StoreError> {
        Ok(self.series.lock().await.values().cloned().collect())
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn save_image(&self, record: ImageRecord) -> Result<bool, StoreError> {
        let mut images = self.images.lock().await;
        if images.contains_key(&record.id) {
            return Ok(false);
        }
        images.insert(record.id.clone(), record);
        Ok(true)
    }

    async fn get_image(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.images.lock().await.get(id).cloned())
    }

    async fn has_image(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.images.lock().await.contains_key(id))
    }

    async fn delete_image(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.images.lock().await.remove(id).is_some())
    }
}

/// Raster metadata persisted next to the PNG payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredImageMeta {
    id: String,
    stats: BandStats,
    bbox: Bbox,
    histogram: Vec<BandShare>,
}

/// File-backed store: series records under `series/`, raster records under
/// `images/` as a PNG payload plus a JSON metadata file. All writes go
/// through a temp file followed by a rename.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_dir(&self) -> PathBuf {
        self.root.join("series")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn series_path(&self, id: &str) -> PathBuf {
        self.series_dir().join(format!("{}.json", sanitize_id(id)))
    }

    fn image_meta_path(&self, id: &str) -> PathBuf {
        self.images_dir().join(format!("{}.json", sanitize_id(id)))
    }

    fn image_raster_path(&self, id: &str) -> PathBuf {
        self.images_dir().join(format!("{}.png", sanitize_id(id)))
    }

    async fn write_series(&self, record: &GeometryRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Encode {
            id: record.id.clone(),
            source,
        })?;
        write_atomic(
            &self.series_dir(),
            &format!("{}.json", sanitize_id(&record.id)),
            &bytes,
        )
        .await
    }
}

/// Conservative file-name form of a record id; timestamps carry `:` which
/// not every filesystem accepts.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

async fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| io_error("creating directory", dir, e))?;

    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let final_path = dir.join(file_name);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| io_error("opening temp file", &temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| io_error("writing temp file", &temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| io_error("flushing temp file", &temp_path, e))?;
    drop(file);

    match fs::rename(&temp_path, &final_path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(io_error("renaming temp file", &final_path, err))
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error("reading record", path, err)),
    }
}

async fn remove_if_present(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error("removing record", path, err)),
    }
}

#[async_trait]
impl TimeSeriesStore for FsStore {
    async fn get_series(&self, id: &str) -> Result<Option<GeometryRecord>, StoreError> {
        read_json(&self.series_path(id)).await
    }

    async fn create_series(
        &self,
        id: &str,
        geometry: &Geometry,
        area: f64,
    ) -> Result<bool, StoreError> {
        let path = self.series_path(id);
        match fs::try_exists(&path).await {
            Ok(true) => return Ok(false),
            Ok(false) => {}
            Err(err) => return Err(io_error("checking record", &path, err)),
        }
        let record = GeometryRecord {
            id: id.to_string(),
            geometry: geometry.clone(),
            area,
            dates: Vec::new(),
        };
        self.write_series(&record).await?;
        debug!(id, "created series");
        Ok(true)
    }

    async fn prepend_dates(&self, id: &str, entries: &[DateEntry]) -> Result<bool, StoreError> {
        let Some(mut record) = self.get_series(id).await? else {
            return Ok(false);
        };
        record.dates.splice(0..0, entries.iter().cloned());
        self.write_series(&record).await?;
        Ok(true)
    }

    async fn delete_series(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = remove_if_present(&self.series_path(id)).await?;
        if deleted {
            debug!(id, "deleted series");
        }
        Ok(deleted)
    }

    async fn list_series(&self) -> Result<Vec<GeometryRecord>, StoreError> {
        let dir = self.series_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("listing series", &dir, err)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing series", &dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json::<GeometryRecord>(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ImageStore for FsStore {
    async fn save_image(&self, record: ImageRecord) -> Result<bool, StoreError> {
        let meta_path = self.image_meta_path(&record.id);
        match fs::try_exists(&meta_path).await {
            Ok(true) => return Ok(false),
            Ok(false) => {}
            Err(err) => return Err(io_error("checking record", &meta_path, err)),
        }

        let meta = StoredImageMeta {
            id: record.id.clone(),
            stats: record.stats,
            bbox: record.bbox,
            histogram: record.histogram.clone(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).map_err(|source| StoreError::Encode {
            id: record.id.clone(),
            source,
        })?;
        let stem = sanitize_id(&record.id);

        // The metadata file is written last and acts as the commit marker.
        write_atomic(&self.images_dir(), &format!("{stem}.png"), &record.raster).await?;
        write_atomic(&self.images_dir(), &format!("{stem}.json"), &meta_bytes).await?;
        debug!(id = record.id, bytes = record.raster.len(), "saved image");
        Ok(true)
    }

    async fn get_image(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        let Some(meta) = read_json::<StoredImageMeta>(&self.image_meta_path(id)).await? else {
            return Ok(None);
        };
        let raster_path = self.image_raster_path(id);
        let raster = fs::read(&raster_path)
            .await
            .map_err(|e| io_error("reading raster", &raster_path, e))?;
        Ok(Some(ImageRecord {
            id: meta.id,
            stats: meta.stats,
            bbox: meta.bbox,
            raster,
            histogram: meta.histogram,
        }))
    }

    async fn has_image(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.image_meta_path(id);
        fs::try_exists(&path)
            .await
            .map_err(|e| io_error("checking record", &path, e))
    }

    async fn delete_image(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = remove_if_present(&self.image_meta_path(id)).await?;
        let _ = remove_if_present(&self.image_raster_path(id)).await;
        Ok(deleted)
    }
}
