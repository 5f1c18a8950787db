//! Core domain model for VERDI: polygonal areas of interest, their derived
//! content identity, and the per-date vegetation records shared by every
//! other crate.

use chrono::{DateTime, Datelike, Duration, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "verdi-core";

/// Longest edge, in pixels, of a rendered raster request.
pub const MAX_RENDER_EDGE: u32 = 512;

/// Equatorial radius used for great-circle edge lengths, in kilometers.
const EARTH_EQUATORIAL_RADIUS_KM: f64 = 6378.137;

/// Mean radius used for spherical polygon areas, in meters.
const EARTH_MEAN_RADIUS_M: f64 = 6_371_008.8;

/// Input rejected before any upstream call is made.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("geometry has no positions")]
    EmptyGeometry,
    #[error("ring {ring} position {position} has fewer than two coordinates")]
    ShortPosition { ring: usize, position: usize },
    #[error("ring {ring} position {position} has a non-finite coordinate")]
    NonFiniteCoordinate { ring: usize, position: usize },
    #[error("date range is empty: {from} is not before {to}")]
    EmptyRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    #[error("geometry could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// GeoJSON-shaped polygonal geometry. Positions carry at least `[x, y]`;
/// trailing coordinates are preserved but never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon {
        coordinates: Vec<Vec<Vec<f64>>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Vec<f64>>>>,
    },
}

impl Geometry {
    fn rings(&self) -> Vec<&[Vec<f64>]> {
        match self {
            Geometry::Polygon { coordinates } => {
                coordinates.iter().map(|ring| ring.as_slice()).collect()
            }
            Geometry::MultiPolygon { coordinates } => coordinates
                .iter()
                .flat_map(|polygon| polygon.iter().map(|ring| ring.as_slice()))
                .collect(),
        }
    }

    fn polygon_ring_sets(&self) -> Vec<&[Vec<Vec<f64>>]> {
        match self {
            Geometry::Polygon { coordinates } => vec![coordinates.as_slice()],
            Geometry::MultiPolygon { coordinates } => coordinates
                .iter()
                .map(|polygon| polygon.as_slice())
                .collect(),
        }
    }

    /// Rejects geometries that cannot be measured or rendered: no positions
    /// at all, positions shorter than `[x, y]`, or non-finite coordinates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen_position = false;
        for (ring_index, ring) in self.rings().into_iter().enumerate() {
            for (position_index, position) in ring.iter().enumerate() {
                seen_position = true;
                if position.len() < 2 {
                    return Err(ValidationError::ShortPosition {
                        ring: ring_index,
                        position: position_index,
                    });
                }
                if position.iter().any(|coordinate| !coordinate.is_finite()) {
                    return Err(ValidationError::NonFiniteCoordinate {
                        ring: ring_index,
                        position: position_index,
                    });
                }
            }
        }
        if !seen_position {
            return Err(ValidationError::EmptyGeometry);
        }
        Ok(())
    }

    /// Axis-aligned bounds over every position in every ring.
    pub fn bbox(&self) -> Result<Bbox, ValidationError> {
        let mut bounds: Option<Bbox> = None;
        for ring in self.rings() {
            for position in ring {
                let (x, y) = xy(position);
                bounds = Some(match bounds {
                    None => Bbox {
                        min_x: x,
                        min_y: y,
                        max_x: x,
                        max_y: y,
                    },
                    Some(b) => Bbox {
                        min_x: b.min_x.min(x),
                        min_y: b.min_y.min(y),
                        max_x: b.max_x.max(x),
                        max_y: b.max_y.max(y),
                    },
                });
            }
        }
        bounds.ok_or(ValidationError::EmptyGeometry)
    }
}

fn xy(position: &[f64]) -> (f64, f64) {
    (
        position.first().copied().unwrap_or(f64::NAN),
        position.get(1).copied().unwrap_or(f64::NAN),
    )
}

/// Identity of a geometry: hex SHA-256 over this crate's JSON serialization
/// of the value. The contract is byte-level on purpose; two structurally
/// equal geometries that were serialized differently elsewhere are distinct
/// identities, and no canonical form is computed.
pub fn content_key(geometry: &Geometry) -> Result<String, ValidationError> {
    let encoded = serde_json::to_string(geometry)?;
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Identifier of the raster generated for one observation date of one
/// geometry: the RFC 3339 UTC timestamp joined to the geometry key.
pub fn image_id(generation_time: DateTime<Utc>, geometry_key: &str) -> String {
    format!(
        "{}_{}",
        generation_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        geometry_key
    )
}

/// Axis-aligned bounding box in geometry coordinate order `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bbox {
    pub fn to_array(self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }
}

/// Great-circle distance between two `(lat, lon)` pairs in meters,
/// haversine over the equatorial radius.
pub fn great_circle_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_EQUATORIAL_RADIUS_KM * c * 1000.0
}

/// Raster dimensions for a bbox: the longer axis is capped at
/// [`MAX_RENDER_EDGE`] and the shorter axis follows the ground aspect
/// ratio, where horizontal extent is the longer of the top and bottom
/// edges and vertical extent is the left edge.
pub fn render_dimensions(bbox: Bbox) -> (u32, u32) {
    let top = great_circle_m(bbox.max_y, bbox.min_x, bbox.max_y, bbox.max_x);
    let bottom = great_circle_m(bbox.min_y, bbox.min_x, bbox.min_y, bbox.max_x);
    let left = great_circle_m(bbox.min_y, bbox.min_x, bbox.max_y, bbox.min_x);
    let ratio = top.max(bottom) / left;
    let mut width = f64::from(MAX_RENDER_EDGE);
    let mut height = (width / ratio).round();
    if height > f64::from(MAX_RENDER_EDGE) {
        height = f64::from(MAX_RENDER_EDGE);
        width = (height * ratio).round();
    }
    (width as u32, height as u32)
}

/// Spherical polygon area in square meters over the mean earth radius,
/// outer rings minus holes, summed across polygons.
pub fn area_m2(geometry: &Geometry) -> f64 {
    geometry
        .polygon_ring_sets()
        .into_iter()
        .map(polygon_area)
        .sum()
}

fn polygon_area(rings: &[Vec<Vec<f64>>]) -> f64 {
    let mut total = 0.0;
    if let Some(outer) = rings.first() {
        total += ring_area(outer).abs();
        for hole in &rings[1..] {
            total -= ring_area(hole).abs();
        }
    }
    total
}

fn ring_area(ring: &[Vec<f64>]) -> f64 {
    let n = ring.len();
    if n <= 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..n {
        let (lower, middle, upper) = if i == n - 2 {
            (n - 2, n - 1, 0)
        } else if i == n - 1 {
            (n - 1, 0, 1)
        } else {
            (i, i + 1, i + 2)
        };
        let (x1, _) = xy(&ring[lower]);
        let (_, y2) = xy(&ring[middle]);
        let (x3, _) = xy(&ring[upper]);
        total += (x3.to_radians() - x1.to_radians()) * y2.to_radians().sin();
    }
    total * EARTH_MEAN_RADIUS_M * EARTH_MEAN_RADIUS_M / 2.0
}

/// Day-of-year window in which observations are worth requesting, inclusive
/// on both ends. The window does not wrap across the new year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonWindow {
    pub start_month: u32,
    pub start_day: u32,
    pub end_month: u32,
    pub end_day: u32,
}

impl SeasonWindow {
    pub fn new(start_month: u32, start_day: u32, end_month: u32, end_day: u32) -> Self {
        Self {
            start_month,
            start_day,
            end_month,
            end_day,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let month = at.month();
        let day = at.day();
        if month < self.start_month || month > self.end_month {
            return false;
        }
        if month == self.start_month && day < self.start_day {
            return false;
        }
        if month == self.end_month && day > self.end_day {
            return false;
        }
        true
    }
}

impl Default for SeasonWindow {
    /// April 1 through September 30.
    fn default() -> Self {
        Self::new(4, 1, 9, 30)
    }
}

/// Midnight at the start of the timestamp's UTC day.
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub fn plus_one_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at + Duration::days(1)
}

/// Aggregate NDVI statistics for one observation day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    pub average: f64,
    pub max: f64,
    pub min: f64,
    pub std_dev: f64,
}

/// One observation date of a series. Immutable once stored; `image_id`
/// names the raster record even while that record does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateEntry {
    pub generation_time: DateTime<Utc>,
    pub stats: BandStats,
    pub image_id: String,
}

impl DateEntry {
    pub fn new(generation_time: DateTime<Utc>, stats: BandStats, geometry_key: &str) -> Self {
        Self {
            generation_time,
            stats,
            image_id: image_id(generation_time, geometry_key),
        }
    }
}

/// Persisted time series for one geometry. `dates` is newest-first and only
/// ever grows by prepending newer entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    pub id: String,
    pub geometry: Geometry,
    pub area: f64,
    pub dates: Vec<DateEntry>,
}

impl GeometryRecord {
    /// Timestamp of the newest stored observation, if any.
    pub fn newest_date(&self) -> Option<DateTime<Utc>> {
        self.dates.first().map(|entry| entry.generation_time)
    }
}

/// Classified raster for one observation date, created once and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub stats: BandStats,
    pub bbox: Bbox,
    pub raster: Vec<u8>,
    pub histogram: Vec<BandShare>,
}

/// Vegetation health classes in ascending NDVI order. The set is closed;
/// renderer output that matches none of the lower bands is counted as
/// [`HealthBand::Healthy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBand {
    Sparse,
    Stressed,
    Moderate,
    Healthy,
}

/// Display palette entry: the band, its legend color, and the NDVI value
/// the band starts at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub band: HealthBand,
    pub color: [u8; 3],
    pub ndvi_from: f64,
}

/// Legend palette in band order. The last entry is the catch-all.
pub const PALETTE: [PaletteEntry; 4] = [
    PaletteEntry {
        band: HealthBand::Sparse,
        color: [244, 67, 54],
        ndvi_from: 0.15,
    },
    PaletteEntry {
        band: HealthBand::Stressed,
        color: [255, 152, 0],
        ndvi_from: 0.30,
    },
    PaletteEntry {
        band: HealthBand::Moderate,
        color: [255, 235, 59],
        ndvi_from: 0.45,
    },
    PaletteEntry {
        band: HealthBand::Healthy,
        color: [76, 175, 80],
        ndvi_from: 0.60,
    },
];

/// Share of classified pixels falling into one band, in whole percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandShare {
    pub band: HealthBand,
    pub color: [u8; 3],
    pub percent: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn unit_square() -> Geometry {
        Geometry::Polygon {
            coordinates: vec![vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
                vec![0.0, 1.0],
                vec![0.0, 0.0],
            ]],
        }
    }

    #[test]
    fn content_key_is_stable_and_sensitive() {
        let a = content_key(&unit_square()).unwrap();
        let b = content_key(&unit_square()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut shifted = unit_square();
        if let Geometry::Polygon { coordinates } = &mut shifted {
            coordinates[0][1][0] = 1.5;
        }
        assert_ne!(a, content_key(&shifted).unwrap());
    }

    #[test]
    fn geometry_type_participates_in_identity() {
        let single = unit_square();
        let wrapped = match &single {
            Geometry::Polygon { coordinates } => Geometry::MultiPolygon {
                coordinates: vec![coordinates.clone()],
            },
            _ => unreachable!(),
        };
        assert_ne!(
            content_key(&single).unwrap(),
            content_key(&wrapped).unwrap()
        );
    }

    #[test]
    fn validation_rejects_bad_positions() {
        let short = Geometry::Polygon {
            coordinates: vec![vec![vec![0.0]]],
        };
        assert!(matches!(
            short.validate(),
            Err(ValidationError::ShortPosition { .. })
        ));

        let non_finite = Geometry::Polygon {
            coordinates: vec![vec![vec![0.0, f64::NAN]]],
        };
        assert!(matches!(
            non_finite.validate(),
            Err(ValidationError::NonFiniteCoordinate { .. })
        ));

        let empty = Geometry::Polygon {
            coordinates: vec![],
        };
        assert!(matches!(
            empty.validate(),
            Err(ValidationError::EmptyGeometry)
        ));

        assert!(unit_square().validate().is_ok());
    }

    #[test]
    fn bbox_spans_all_polygons() {
        let geometry = Geometry::MultiPolygon {
            coordinates: vec![
                vec![vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0]]],
                vec![vec![vec![3.0, -2.0], vec![4.0, 5.0], vec![3.5, 0.5]]],
            ],
        };
        let bbox = geometry.bbox().unwrap();
        assert_eq!(bbox.to_array(), [0.0, -2.0, 4.0, 5.0]);
    }

    #[test]
    fn great_circle_matches_equatorial_degree() {
        let d = great_circle_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_319.49).abs() < 1.0, "got {d}");
    }

    #[test]
    fn render_dimensions_cap_the_long_edge() {
        // Wide strip on the equator: 2 degrees across, 0.5 tall.
        let wide = Bbox {
            min_x: 10.0,
            min_y: 0.0,
            max_x: 12.0,
            max_y: 0.5,
        };
        let (w, h) = render_dimensions(wide);
        assert_eq!(w, 512);
        assert_eq!(h, 128);

        // Tall strip: the flip path re-derives width from the ratio.
        let tall = Bbox {
            min_x: 10.0,
            min_y: 0.0,
            max_x: 10.5,
            max_y: 2.0,
        };
        let (w, h) = render_dimensions(tall);
        assert_eq!(h, 512);
        assert_eq!(w, 128);
    }

    #[test]
    fn area_of_equatorial_square_is_known() {
        let area = area_m2(&unit_square());
        assert!((area - 1.2364e10).abs() < 5.0e6, "got {area}");
    }

    #[test]
    fn holes_reduce_area() {
        let solid = area_m2(&unit_square());
        let holed = Geometry::Polygon {
            coordinates: vec![
                vec![
                    vec![0.0, 0.0],
                    vec![1.0, 0.0],
                    vec![1.0, 1.0],
                    vec![0.0, 1.0],
                    vec![0.0, 0.0],
                ],
                vec![
                    vec![0.25, 0.25],
                    vec![0.75, 0.25],
                    vec![0.75, 0.75],
                    vec![0.25, 0.75],
                    vec![0.25, 0.25],
                ],
            ],
        };
        let with_hole = area_m2(&holed);
        assert!(with_hole < solid);
        assert!(with_hole > 0.0);
    }

    #[test]
    fn season_window_is_inclusive_and_does_not_wrap() {
        let window = SeasonWindow::default();
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap();
        assert!(window.contains(at(2023, 4, 1)));
        assert!(window.contains(at(2023, 6, 15)));
        assert!(window.contains(at(2023, 9, 30)));
        assert!(!window.contains(at(2023, 3, 31)));
        assert!(!window.contains(at(2023, 10, 1)));
        assert!(!window.contains(at(2023, 12, 1)));
    }

    #[test]
    fn day_helpers_bucket_by_utc_day() {
        let at = Utc.with_ymd_and_hms(2023, 6, 30, 17, 45, 9).unwrap();
        let start = start_of_day(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 6, 30, 0, 0, 0).unwrap());
        assert_eq!(
            plus_one_day(start),
            Utc.with_ymd_and_hms(2023, 7, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn image_ids_join_timestamp_and_key() {
        let at = Utc.with_ymd_and_hms(2023, 6, 12, 0, 0, 0).unwrap();
        assert_eq!(image_id(at, "abc123"), "2023-06-12T00:00:00Z_abc123");
    }

    #[test]
    fn newest_date_reads_the_head() {
        let key = "k";
        let stats = BandStats {
            average: 0.5,
            max: 0.9,
            min: 0.1,
            std_dev: 0.05,
        };
        let newer = Utc.with_ymd_and_hms(2023, 6, 20, 0, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2023, 6, 12, 0, 0, 0).unwrap();
        let record = GeometryRecord {
            id: key.into(),
            geometry: unit_square(),
            area: 1.0,
            dates: vec![
                DateEntry::new(newer, stats, key),
                DateEntry::new(older, stats, key),
            ],
        };
        assert_eq!(record.newest_date(), Some(newer));
    }
}
