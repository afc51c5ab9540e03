use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Timelike};
use std::path::Path;
use tracing::{debug, warn};

use crate::astrometry::{horizontal_coordinates, moon_illumination, moon_separation, parse_angle};
use crate::config::{CanonicalField, FieldRule, KeywordAliasTable, ValueKind};
use crate::fits::{read_header, FitsHeader};
use crate::models::{CatalogRecord, EPOCH_DATE, DATE_FORMAT};
use crate::utils::{round_to, size_in_mb};

/// Accepted observation date layouts, tried in order
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Normalized value of one canonical field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Float(f64),
    Date(NaiveDateTime),
}

impl FieldValue {
    fn into_text(self) -> String {
        match self {
            FieldValue::Text(s) => s,
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Date(d) => d.format(DATE_FORMAT).to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Date(_) => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Float(v) => Some(v.trunc() as i64),
            FieldValue::Text(s) => parse_int(s),
            FieldValue::Date(_) => None,
        }
    }

    fn as_date(&self) -> Option<NaiveDateTime> {
        match self {
            FieldValue::Date(d) => Some(*d),
            FieldValue::Text(s) => parse_date(s),
            _ => None,
        }
    }
}

/// Parse an observation timestamp, dropping sub-seconds and any trailing `Z`
pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    let trimmed = text.trim().trim_end_matches('Z');
    let parsed = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    parsed.with_nanosecond(0)
}

/// Integer from integer or float text; floats are truncated toward zero
pub fn parse_int(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    trimmed.parse::<i64>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v.trunc() as i64)
    })
}

/// Builds catalog records from FITS headers using an injected alias table
pub struct HeaderExtractor {
    table: KeywordAliasTable,
}

impl HeaderExtractor {
    pub fn new(table: KeywordAliasTable) -> Self {
        Self { table }
    }

    /// Read one file's header into a record. Star measurements are left at zero.
    pub fn extract(&self, path: &Path, project_id: i64) -> Result<CatalogRecord> {
        let header = read_header(path)?;
        let size = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let absolute = std::path::absolute(path)
            .with_context(|| format!("Failed to resolve {}", path.display()))?;

        let mut record = self.record_from_header(&header);
        record.file = absolute.to_string_lossy().to_string();
        record.size_mb = size_in_mb(size);
        record.project_id = project_id;
        Ok(record)
    }

    /// Normalize header values and derive the astronomical quantities
    pub fn record_from_header(&self, header: &FitsHeader) -> CatalogRecord {
        use CanonicalField::*;

        let text = |field| self.resolve(header, field).map(FieldValue::into_text);
        let float = |field| self.resolve(header, field).and_then(|v| v.as_f64());
        let int = |field| self.resolve(header, field).and_then(|v| v.as_i64());

        let mut record = CatalogRecord {
            object: text(Object),
            date_obs: self.resolve(header, DateObs).and_then(|v| v.as_date()),
            filter: text(Filter),
            exposure: float(Exposure),
            ccd_temp: float(CcdTemp),
            frame_type: text(FrameType),
            binning: int(Binning),
            ra: float(Ra),
            dec: float(Dec),
            alt: self.lookup(header, Alt).and_then(|v| v.as_f64()),
            az: self.lookup(header, Az).and_then(|v| v.as_f64()),
            gain: int(Gain),
            offset: int(Offset),
            site_lat: float(SiteLat),
            site_long: float(SiteLong),
            ..Default::default()
        };

        let time = record.date_obs.unwrap_or_else(epoch);

        if record.alt.is_none() || record.az.is_none() {
            debug!("Altitude/azimuth missing, computing from RA/Dec");
            let ra = or_zero(record.ra, "RA");
            let dec = or_zero(record.dec, "Dec");
            let long = or_zero(record.site_long, "site longitude");
            let lat = or_zero(record.site_lat, "site latitude");
            if record.date_obs.is_none() {
                warn!("Observation date missing, using {} for altitude/azimuth", EPOCH_DATE);
            }
            if let Some(hz) = horizontal_coordinates(ra, dec, &time, long, lat) {
                record.alt = record.alt.or(Some(hz.alt));
                record.az = record.az.or(Some(hz.az));
            }
        }
        if record.alt.is_none() {
            record.alt = self.default_value(Alt).and_then(|v| v.as_f64());
        }
        if record.az.is_none() {
            record.az = self.default_value(Az).and_then(|v| v.as_f64());
        }

        let ra = record.ra.unwrap_or(0.0);
        let dec = record.dec.unwrap_or(0.0);
        let long = record.site_long.unwrap_or(0.0);
        let lat = record.site_lat.unwrap_or(0.0);
        record.moon_phase = moon_illumination(&time, long, lat);
        record.moon_separation = moon_separation(&time, ra, dec, long, lat);

        record
    }

    /// Header value of a field, falling back to its configured default
    pub fn resolve(&self, header: &FitsHeader, field: CanonicalField) -> Option<FieldValue> {
        match self.lookup_raw(header, field) {
            Lookup::Found(value) => value,
            Lookup::Absent => self.default_value(field),
        }
    }

    /// Header value of a field, without defaults
    fn lookup(&self, header: &FitsHeader, field: CanonicalField) -> Option<FieldValue> {
        match self.lookup_raw(header, field) {
            Lookup::Found(value) => value,
            Lookup::Absent => None,
        }
    }

    fn lookup_raw(&self, header: &FitsHeader, field: CanonicalField) -> Lookup {
        let Some(rule) = self.table.rule(field) else {
            return Lookup::Absent;
        };
        let Some((alias, raw)) = rule
            .aliases
            .iter()
            .find_map(|alias| header.get(alias).map(|raw| (alias, raw)))
        else {
            return Lookup::Absent;
        };

        if raw.trim().is_empty() {
            debug!("{} is present but empty", alias);
            return Lookup::Found(None);
        }
        Lookup::Found(self.coerce(field, rule, raw))
    }

    fn default_value(&self, field: CanonicalField) -> Option<FieldValue> {
        let rule = self.table.rule(field)?;
        let raw = rule.default.as_deref()?;
        self.coerce(field, rule, raw)
    }

    fn coerce(&self, field: CanonicalField, rule: &FieldRule, raw: &str) -> Option<FieldValue> {
        let value = match rule.kind {
            ValueKind::Text => Some(FieldValue::Text(raw.trim().to_string())),
            ValueKind::Filter => Some(FieldValue::Text(self.table.canonical_filter(raw))),
            ValueKind::Int => parse_int(raw).map(FieldValue::Int),
            ValueKind::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| FieldValue::Float(round_to(v, 2))),
            ValueKind::Angle => parse_angle(raw, rule.unit).map(FieldValue::Float),
            ValueKind::Date => parse_date(raw).map(FieldValue::Date),
        };
        if value.is_none() {
            warn!("Cannot parse {} value '{}' as {:?}", field.name(), raw, rule.kind);
        }
        value
    }
}

enum Lookup {
    /// An alias was present; `None` when its value was empty or unparseable
    Found(Option<FieldValue>),
    Absent,
}

fn epoch() -> NaiveDateTime {
    NaiveDateTime::default()
}

fn or_zero(value: Option<f64>, name: &str) -> f64 {
    value.unwrap_or_else(|| {
        warn!("{} missing, using 0 for altitude/azimuth", name);
        0.0
    })
}
