use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Normalized attribute that may come from several header keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Object,
    DateObs,
    Filter,
    Exposure,
    CcdTemp,
    FrameType,
    Binning,
    Ra,
    Dec,
    Alt,
    Az,
    Gain,
    Offset,
    SiteLat,
    SiteLong,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 15] = [
        CanonicalField::Object,
        CanonicalField::DateObs,
        CanonicalField::Filter,
        CanonicalField::Exposure,
        CanonicalField::CcdTemp,
        CanonicalField::FrameType,
        CanonicalField::Binning,
        CanonicalField::Ra,
        CanonicalField::Dec,
        CanonicalField::Alt,
        CanonicalField::Az,
        CanonicalField::Gain,
        CanonicalField::Offset,
        CanonicalField::SiteLat,
        CanonicalField::SiteLong,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CanonicalField::Object => "object",
            CanonicalField::DateObs => "date_obs",
            CanonicalField::Filter => "filter",
            CanonicalField::Exposure => "exposure",
            CanonicalField::CcdTemp => "ccd_temp",
            CanonicalField::FrameType => "frame_type",
            CanonicalField::Binning => "binning",
            CanonicalField::Ra => "ra",
            CanonicalField::Dec => "dec",
            CanonicalField::Alt => "alt",
            CanonicalField::Az => "az",
            CanonicalField::Gain => "gain",
            CanonicalField::Offset => "offset",
            CanonicalField::SiteLat => "site_lat",
            CanonicalField::SiteLong => "site_long",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Int,
    Float,
    Angle,
    Date,
    Filter,
}

/// Unit of an angle value as written in the header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleUnit {
    #[default]
    Degrees,
    Hours,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Header keywords tried in order; the first one present wins
    pub aliases: Vec<String>,
    pub kind: ValueKind,
    #[serde(default)]
    pub unit: AngleUnit,
    /// Raw value substituted when no alias is present, coerced like a header value
    #[serde(default)]
    pub default: Option<String>,
}

impl FieldRule {
    fn new(aliases: &[&str], kind: ValueKind) -> Self {
        Self {
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            kind,
            unit: AngleUnit::Degrees,
            default: None,
        }
    }

    fn in_hours(mut self) -> Self {
        self.unit = AngleUnit::Hours;
        self
    }
}

/// Keyword alias table consumed by the header extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordAliasTable {
    pub fields: BTreeMap<CanonicalField, FieldRule>,
    /// Canonical filter code to the spellings imaging software writes for it
    pub filters: BTreeMap<String, Vec<String>>,
}

impl Default for KeywordAliasTable {
    fn default() -> Self {
        use CanonicalField::*;
        use ValueKind as K;

        let fields = BTreeMap::from([
            (Object, FieldRule::new(&["OBJECT", "OBJ", "TARGET"], K::Text)),
            (DateObs, FieldRule::new(&["DATE-OBS", "DATE"], K::Date)),
            (Filter, FieldRule::new(&["FILTER"], K::Filter)),
            (Exposure, FieldRule::new(&["EXPOSURE", "EXPTIME"], K::Float)),
            (CcdTemp, FieldRule::new(&["CCD-TEMP"], K::Float)),
            (FrameType, FieldRule::new(&["IMAGETYP", "FRAME"], K::Text)),
            (Binning, FieldRule::new(&["XBINNING"], K::Int)),
            (Ra, FieldRule::new(&["OBJECT-RA", "OBJCTRA"], K::Angle).in_hours()),
            (Dec, FieldRule::new(&["OBJECT-DEC", "OBJCTDEC"], K::Angle)),
            (Alt, FieldRule::new(&["OBJECT-ALT", "OBJCTALT"], K::Angle)),
            (Az, FieldRule::new(&["OBJECT-AZ", "OBJCTAZ"], K::Angle)),
            (Gain, FieldRule::new(&["GAIN"], K::Int)),
            (Offset, FieldRule::new(&["OFFSET"], K::Int)),
            (SiteLat, FieldRule::new(&["SITELAT", "LAT-OBS"], K::Angle)),
            (SiteLong, FieldRule::new(&["SITELONG", "LONG-OBS"], K::Angle)),
        ]);

        let filter_aliases: [(&str, &[&str]); 8] = [
            ("L", &["Luminance", "luminance", "Lum", "lum", "L", "l"]),
            ("R", &["Red", "R", "r", "red"]),
            ("G", &["Green", "G", "g", "green"]),
            ("B", &["Blue", "B", "b", "blue"]),
            (
                "Ha",
                &["Ha", "ha", "Halpha", "halpha", "H_alpha", "h_alpha", "H_Alpha", "h_Alpha"],
            ),
            ("Sii", &["SII", "Sii", "sii", "s2"]),
            ("Oiii", &["OIII", "Oiii", "oiii", "O3"]),
            ("LPR", &["Lpr", "LPR", "lpr"]),
        ];
        let filters = filter_aliases
            .iter()
            .map(|(code, names)| {
                (
                    code.to_string(),
                    names.iter().map(|n| n.to_string()).collect(),
                )
            })
            .collect();

        Self { fields, filters }
    }
}

impl KeywordAliasTable {
    pub fn rule(&self, field: CanonicalField) -> Option<&FieldRule> {
        self.fields.get(&field)
    }

    /// Map a raw filter name to its canonical code; unknown names pass through unchanged
    pub fn canonical_filter(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if let Some(code) = self
            .filters
            .iter()
            .find(|(_, names)| names.iter().any(|n| n == trimmed))
            .map(|(code, _)| code)
        {
            return code.clone();
        }
        self.filters
            .iter()
            .find(|(_, names)| names.iter().any(|n| n.eq_ignore_ascii_case(trimmed)))
            .map(|(code, _)| code.clone())
            .unwrap_or_else(|| trimmed.to_string())
    }
}

/// Tunables of the photometric analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// The centered crop keeps `1 / crop_factor` of each dimension; 1 or less disables it
    pub crop_factor: usize,
    /// Number of brightest candidates kept for PSF fitting
    pub max_stars: usize,
    /// Detection threshold as a multiple of the background standard deviation
    pub threshold: f64,
    /// Expected stellar FWHM (pixels) the detection kernel is tuned to
    pub detection_fwhm: f64,
    pub bit_depth: u32,
    pub binning: usize,
    /// Aperture radius in unbinned pixels
    pub radius: usize,
    /// Saturation ceiling as a percentage of `2^bit_depth`
    pub saturation_limit: f64,
    pub max_roundness: f64,
    pub sharpness_low: f64,
    pub sharpness_high: f64,
    pub clip_sigma: f64,
    pub clip_max_iterations: usize,
    /// Surround median, relative to the global median, above which a star is
    /// considered to sit on extended emission
    pub contamination_ratio: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            crop_factor: 2,
            max_stars: 30,
            threshold: 20.0,
            detection_fwhm: 3.0,
            bit_depth: 16,
            binning: 1,
            radius: 7,
            saturation_limit: 95.0,
            max_roundness: 0.5,
            sharpness_low: 0.2,
            sharpness_high: 1.0,
            clip_sigma: 3.0,
            clip_max_iterations: 10,
            contamination_ratio: 2.0,
        }
    }
}

impl AnalyzerSettings {
    pub fn saturation_ceiling(&self) -> f64 {
        2f64.powi(self.bit_depth as i32) * self.saturation_limit / 100.0
    }

    /// Aperture radius scaled by binning
    pub fn aperture_radius(&self) -> usize {
        self.radius * self.binning.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Image file extensions picked up by the scanner, compared case-insensitively
    pub extensions: Vec<String>,
    pub keywords: KeywordAliasTable,
    pub analyzer: AnalyzerSettings,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["fits".to_string(), "fit".to_string(), "fts".to_string()],
            keywords: KeywordAliasTable::default(),
            analyzer: AnalyzerSettings::default(),
        }
    }
}

impl CatalogConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load `path` when given, otherwise fall back to the built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}
