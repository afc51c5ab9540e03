//! Positional astronomy for catalog records: horizontal coordinates, lunar
//! illumination and lunar separation. Timestamps are naive and taken as UTC.
//! None of these functions fail; invalid input yields the documented fallback.

use std::f64::consts::PI;

use astro::{
    angle::{anglr_sepr, limit_to_two_PI},
    coords::{alt_frm_eq, az_frm_eq},
    time::{julian_day, mn_sidr, CalType, Date},
};
use chrono::{Datelike, NaiveDateTime, Timelike};
use tracing::warn;

use crate::config::AngleUnit;
use crate::utils::round_to;

const EARTH_EQUATORIAL_RADIUS_KM: f64 = 6378.14;
const KM_PER_AU: f64 = 149_597_870.7;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Horizontal {
    /// Degrees above the horizon
    pub alt: f64,
    /// Degrees clockwise from north
    pub az: f64,
}

fn inputs_valid(context: &str, values: &[f64], lat: f64) -> bool {
    if values.iter().any(|v| !v.is_finite()) || !lat.is_finite() {
        warn!("{}: non-finite input, using fallback", context);
        return false;
    }
    if lat.abs() > 90.0 {
        warn!("{}: latitude {} out of range, using fallback", context, lat);
        return false;
    }
    true
}

/// `None` when the year does not fit the calendar arithmetic
fn julian_day_of(time: &NaiveDateTime, with_time_of_day: bool) -> Option<f64> {
    let year = match i16::try_from(time.date().year()) {
        Ok(year) => year,
        Err(_) => {
            warn!("year {} out of range, using fallback", time.date().year());
            return None;
        }
    };
    let day_fraction = if with_time_of_day {
        time.time().num_seconds_from_midnight() as f64 / 86_400.0
    } else {
        0.0
    };
    let date = Date {
        year,
        month: time.date().month() as u8,
        decimal_day: time.date().day() as f64 + day_fraction,
        cal_type: CalType::Gregorian,
    };
    Some(julian_day(&date))
}

/// Greenwich mean sidereal time, radians
fn greenwich_mean_sidereal_time(time: &NaiveDateTime) -> Option<f64> {
    let jd = julian_day_of(time, false)?;
    let utc_hours = time.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;

    Some(limit_to_two_PI((gmst_hours * 15.0).to_radians()))
}

/// Altitude and azimuth (degrees, 4 dp) of a target seen from a site.
/// All angles are decimal degrees; longitude is positive east.
pub fn horizontal_coordinates(
    ra: f64,
    dec: f64,
    time: &NaiveDateTime,
    long: f64,
    lat: f64,
) -> Option<Horizontal> {
    if !inputs_valid("horizontal coordinates", &[ra, dec, long], lat) {
        return None;
    }

    let gmst = greenwich_mean_sidereal_time(time)?;
    let hour_angle = gmst + long.to_radians() - ra.to_radians();
    let lat = lat.to_radians();
    let dec = dec.to_radians();

    // Meeus measures azimuth from the south
    let az = limit_to_two_PI(az_frm_eq(hour_angle, dec, lat) + PI);
    let alt = alt_frm_eq(hour_angle, dec, lat);

    Some(Horizontal {
        alt: round_to(alt.to_degrees(), 4),
        az: round_to(az.to_degrees(), 4),
    })
}

/// Geocentric ecliptic (longitude, latitude) to equatorial (ra, dec), radians
fn ecliptic_to_equatorial(long: f64, lat: f64, obliquity: f64) -> (f64, f64) {
    let ra = (long.sin() * obliquity.cos() - lat.tan() * obliquity.sin()).atan2(long.cos());
    let dec = (lat.sin() * obliquity.cos() + lat.cos() * obliquity.sin() * long.sin()).asin();
    (limit_to_two_PI(ra), dec)
}

/// Illuminated fraction of the lunar disk in percent (0 to 100, 2 dp).
///
/// The site does not measurably change the phase; it is only validated.
pub fn moon_illumination(time: &NaiveDateTime, long: f64, lat: f64) -> f64 {
    if !inputs_valid("moon illumination", &[long], lat) {
        return 0.0;
    }

    let Some(jd) = julian_day_of(time, true) else {
        return 0.0;
    };
    let (moon, moon_dist_km) = astro::lunar::geocent_ecl_pos(jd);
    let (sun, sun_dist_au) = astro::sun::geocent_ecl_pos(jd);
    let sun_dist_km = sun_dist_au * KM_PER_AU;

    // Geocentric elongation of the Moon from the Sun
    let elongation = (moon.lat.cos() * (moon.long - sun.long).cos()).clamp(-1.0, 1.0).acos();
    let phase_angle = (sun_dist_km * elongation.sin())
        .atan2(moon_dist_km - sun_dist_km * elongation.cos());
    let fraction = (1.0 + phase_angle.cos()) / 2.0;

    round_to(fraction * 100.0, 2)
}

/// Topocentric Moon position (ra, dec), radians
fn topocentric_moon(time: &NaiveDateTime, long: f64, lat: f64) -> Option<(f64, f64)> {
    let jd = julian_day_of(time, true)?;
    let (moon, moon_dist_km) = astro::lunar::geocent_ecl_pos(jd);
    let obliquity = astro::ecliptic::mn_oblq_IAU(jd);
    let (ra, dec) = ecliptic_to_equatorial(moon.long, moon.lat, obliquity);

    let sin_parallax = EARTH_EQUATORIAL_RADIUS_KM / moon_dist_km;
    let hour_angle = greenwich_mean_sidereal_time(time)? + long - ra;
    // Spherical Earth, observer at sea level
    let rho_cos = lat.cos();
    let rho_sin = lat.sin();

    let denom = dec.cos() - rho_cos * sin_parallax * hour_angle.cos();
    let delta_ra = (-rho_cos * sin_parallax * hour_angle.sin()).atan2(denom);
    let topo_dec = ((dec.sin() - rho_sin * sin_parallax) * delta_ra.cos()).atan2(denom);

    Some((limit_to_two_PI(ra + delta_ra), topo_dec))
}

/// Angular distance in degrees (0 to 180, 2 dp) between the Moon, as seen from the
/// site, and the target.
pub fn moon_separation(time: &NaiveDateTime, ra: f64, dec: f64, long: f64, lat: f64) -> f64 {
    if !inputs_valid("moon separation", &[ra, dec, long], lat) {
        return 0.0;
    }

    let Some((moon_ra, moon_dec)) = topocentric_moon(time, long.to_radians(), lat.to_radians())
    else {
        return 0.0;
    };
    let separation = anglr_sepr(moon_ra, moon_dec, ra.to_radians(), dec.to_radians());

    round_to(separation.to_degrees(), 2)
}

fn is_angle_separator(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            ':' | 'h' | 'H' | 'd' | 'D' | 'm' | 'M' | 's' | 'S' | '°' | '\'' | '"'
        )
}

/// Parse a decimal or sexagesimal angle into decimal degrees (4 dp).
///
/// Components may be separated by `:`, spaces, or `h m s` / `d m s` markers. The sign
/// is read from the text, so `-00 30 00` is negative. With `AngleUnit::Hours` the
/// value is multiplied by 15.
pub fn parse_angle(text: &str, unit: AngleUnit) -> Option<f64> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let parts: Vec<&str> = body
        .split(is_angle_separator)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut value = 0.0;
    for (i, part) in parts.iter().enumerate() {
        if part.starts_with('-') || part.starts_with('+') {
            return None;
        }
        let component: f64 = part.parse().ok()?;
        if !component.is_finite() {
            return None;
        }
        value += component / 60f64.powi(i as i32);
    }

    if negative {
        value = -value;
    }
    if unit == AngleUnit::Hours {
        value *= 15.0;
    }
    Some(round_to(value, 4))
}

/// Format decimal degrees as `±DD:MM:SS.ss` (or `HH:MM:SS.ss` for hours)
pub fn format_sexagesimal(degrees: f64, unit: AngleUnit) -> String {
    let value = match unit {
        AngleUnit::Hours => degrees / 15.0,
        AngleUnit::Degrees => degrees,
    };
    let sign = if value < 0.0 { "-" } else { "" };
    let total_hundredths = (value.abs() * 360_000.0).round() as u64;
    let whole = total_hundredths / 360_000;
    let minutes = (total_hundredths / 6_000) % 60;
    let seconds = (total_hundredths % 6_000) as f64 / 100.0;

    format!("{}{:02}:{:02}:{:05.2}", sign, whole, minutes, seconds)
}
