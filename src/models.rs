use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Canonical timestamp layout stored in the catalog
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Timestamp persisted when an image carries no usable observation date
pub const EPOCH_DATE: &str = "1970-01-01T00:00:00";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub base_dir: String,
    pub date: String,
    pub status: ProjectStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Archived => "archived",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "archived" => ProjectStatus::Archived,
            _ => ProjectStatus::Active,
        }
    }
}

/// Star-quality and background figures for one frame, all rounded to 2 dp
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct FrameMeasurement {
    pub fwhm: f64,
    pub eccentricity: f64,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
}

impl FrameMeasurement {
    /// Result reported when a frame has no usable sources
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

/// One cataloged exposure.
///
/// Header-derived fields are `None` when the header did not provide them and no
/// default was configured; the catalog store writes its own zero-equivalent value
/// for those on insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogRecord {
    pub object: Option<String>,
    #[serde(with = "optional_date")]
    pub date_obs: Option<NaiveDateTime>,
    pub filter: Option<String>,
    pub exposure: Option<f64>,
    pub ccd_temp: Option<f64>,
    pub frame_type: Option<String>,
    pub binning: Option<i64>,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub alt: Option<f64>,
    pub az: Option<f64>,
    pub gain: Option<i64>,
    pub offset: Option<i64>,
    pub measurement: FrameMeasurement,
    pub file: String,
    pub size_mb: f64,
    pub site_lat: Option<f64>,
    pub site_long: Option<f64>,
    pub moon_phase: f64,
    pub moon_separation: f64,
    pub project_id: i64,
}

impl CatalogRecord {
    pub fn date_string(&self) -> String {
        self.date_obs
            .map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| EPOCH_DATE.to_string())
    }
}

mod optional_date {
    use super::DATE_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => serializer.serialize_str(&date.format(DATE_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| NaiveDateTime::parse_from_str(&s, DATE_FORMAT))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
