use anyhow::{Context, Result};
use bumpalo::Bump;
use fitrs::{Fits, FitsData, FitsDataArray};
use std::path::Path;

/// Outlier-resistant background figures of a set of pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct BackgroundStats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
}

/// Single-plane image with physical pixel values, row-major
#[derive(Debug, Clone)]
pub struct FitsImage {
    pub width: usize,
    pub height: usize,
    pub bit_depth: i32,
    pub data: Vec<f64>,
}

fn header_number(hdu: &fitrs::Hdu, key: &str) -> Option<f64> {
    match hdu.value(key)? {
        fitrs::HeaderValue::IntegerNumber(n) => Some(*n as f64),
        fitrs::HeaderValue::RealFloatingNumber(f) => Some(*f),
        _ => None,
    }
}

fn header_int(hdu: &fitrs::Hdu, key: &str) -> Result<i64> {
    match hdu.value(key) {
        Some(fitrs::HeaderValue::IntegerNumber(n)) => Ok(*n as i64),
        Some(_) => Err(anyhow::anyhow!("{} is not an integer", key)),
        None => Err(anyhow::anyhow!("Missing {} header", key)),
    }
}

impl FitsImage {
    /// Load the primary image of a FITS file, applying BZERO/BSCALE
    pub fn from_file(path: &Path) -> Result<Self> {
        // fitrs panics on some malformed files; validate the header first
        crate::fits::read_header(path)?;

        let fits = Fits::open(path)
            .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;

        let hdu = fits
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("No primary HDU found in FITS file"))?;

        let naxis = header_int(&hdu, "NAXIS")?;
        if naxis < 2 {
            return Err(anyhow::anyhow!(
                "FITS file does not contain 2D image data (NAXIS={})",
                naxis
            ));
        }
        let width = header_int(&hdu, "NAXIS1")? as usize;
        let height = header_int(&hdu, "NAXIS2")? as usize;
        let bit_depth = header_int(&hdu, "BITPIX")? as i32;

        let bzero = header_number(&hdu, "BZERO").unwrap_or(0.0);
        let bscale = header_number(&hdu, "BSCALE").unwrap_or(1.0);
        let scale = |raw: f64| bzero + bscale * raw;

        let data: Vec<f64> = match hdu.read_data() {
            FitsData::Characters(_) => {
                return Err(anyhow::anyhow!(
                    "FITS file contains character data, not image data"
                ));
            }
            FitsData::IntegersI32(FitsDataArray { data, .. }) => data
                .iter()
                .map(|v| match v {
                    Some(raw) => scale(*raw as f64),
                    None => 0.0,
                })
                .collect(),
            // Unsigned data comes back with the offset already applied
            FitsData::IntegersU32(FitsDataArray { data, .. }) => data
                .iter()
                .map(|v| match v {
                    Some(raw) => *raw as f64,
                    None => 0.0,
                })
                .collect(),
            FitsData::FloatingPoint32(FitsDataArray { data, .. }) => {
                data.iter().map(|&v| scale(v as f64)).collect()
            }
            FitsData::FloatingPoint64(FitsDataArray { data, .. }) => {
                data.iter().map(|&v| scale(v)).collect()
            }
        };

        // Extra planes (e.g. RGB cubes) are ignored; keep the first
        if data.len() < width * height {
            return Err(anyhow::anyhow!(
                "Data size mismatch: expected {} pixels, got {}",
                width * height,
                data.len()
            ));
        }
        let mut data = data;
        data.truncate(width * height);

        Ok(FitsImage {
            width,
            height,
            bit_depth,
            data,
        })
    }

    pub fn from_pixels(width: usize, height: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != width * height {
            return Err(anyhow::anyhow!(
                "Data size mismatch: expected {} pixels, got {}",
                width * height,
                data.len()
            ));
        }
        Ok(FitsImage {
            width,
            height,
            bit_depth: -64,
            data,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    /// Centered sub-image of `width / factor` by `height / factor`
    pub fn crop_center(&self, factor: usize) -> FitsImage {
        if factor <= 1 || self.data.is_empty() {
            return self.clone();
        }
        let crop_w = (self.width / factor).max(1);
        let crop_h = (self.height / factor).max(1);
        let start_x = self.width.saturating_sub(crop_w) / 2;
        let start_y = self.height.saturating_sub(crop_h) / 2;
        FitsImage {
            width: crop_w,
            height: crop_h,
            bit_depth: self.bit_depth,
            data: self.region(start_x, start_y, start_x + crop_w, start_y + crop_h),
        }
    }

    /// Pixels of `[x0, x1) × [y0, y1)`, with bounds clamped to the image
    pub fn region(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> Vec<f64> {
        let x1 = x1.min(self.width);
        let y1 = y1.min(self.height);
        if x0 >= x1 || y0 >= y1 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity((x1 - x0) * (y1 - y0));
        for y in y0..y1 {
            let row = y * self.width;
            out.extend_from_slice(&self.data[row + x0..row + x1]);
        }
        out
    }

    pub fn background(&self, sigma: f64, max_iterations: usize) -> BackgroundStats {
        sigma_clipped_stats(&self.data, sigma, max_iterations)
    }
}

/// Median of a sorted slice
fn sorted_median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

pub fn median(values: &[f64]) -> f64 {
    let arena = Bump::new();
    let mut sorted = bumpalo::vec![in &arena];
    sorted.extend(values.iter().copied().filter(|v| v.is_finite()));
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted_median(&sorted)
}

/// Iteratively reject values further than `sigma` standard deviations from the
/// mean of the survivors, until nothing is rejected or `max_iterations` is reached.
///
/// Non-finite values are ignored. Std is the population standard deviation.
pub fn sigma_clipped_stats(values: &[f64], sigma: f64, max_iterations: usize) -> BackgroundStats {
    let arena = Bump::new();
    let mut kept = bumpalo::vec![in &arena];
    kept.extend(values.iter().copied().filter(|v| v.is_finite()));
    if kept.is_empty() {
        return BackgroundStats::default();
    }

    let (mut mean, mut std) = mean_std(&kept);
    for _ in 0..max_iterations {
        if std == 0.0 {
            break;
        }
        let lo = mean - sigma * std;
        let hi = mean + sigma * std;
        let before = kept.len();
        kept.retain(|v| *v >= lo && *v <= hi);
        if kept.len() == before || kept.is_empty() {
            break;
        }
        (mean, std) = mean_std(&kept);
    }

    kept.sort_by(|a, b| a.total_cmp(b));
    BackgroundStats {
        mean,
        median: sorted_median(&kept),
        std,
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{write_fits, SyntheticImage};
    use tempfile::tempdir;

    #[test]
    fn test_crop_center() {
        let data: Vec<f64> = (0..64).map(|v| v as f64).collect();
        let image = FitsImage::from_pixels(8, 8, data).unwrap();

        let cropped = image.crop_center(2);
        assert_eq!((cropped.width, cropped.height), (4, 4));
        // Starts at (2, 2)
        assert_eq!(cropped.get(0, 0), 18.0);
        assert_eq!(cropped.get(3, 3), 45.0);

        let same = image.crop_center(1);
        assert_eq!(same.data, image.data);

        let empty = FitsImage::from_pixels(0, 0, Vec::new()).unwrap().crop_center(2);
        assert_eq!((empty.width, empty.height), (0, 0));
        let no_rows = FitsImage::from_pixels(5, 0, Vec::new()).unwrap().crop_center(2);
        assert!(no_rows.data.is_empty());
    }

    #[test]
    fn test_region_clamps() {
        let data: Vec<f64> = (0..16).map(|v| v as f64).collect();
        let image = FitsImage::from_pixels(4, 4, data).unwrap();
        assert_eq!(image.region(2, 2, 10, 10), vec![10.0, 11.0, 14.0, 15.0]);
        assert!(image.region(5, 0, 8, 2).is_empty());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_sigma_clip_rejects_outliers() {
        let mut values = vec![10.0; 50];
        values.extend(vec![12.0; 50]);
        values.push(10_000.0);

        let stats = sigma_clipped_stats(&values, 3.0, 10);
        assert!((stats.mean - 11.0).abs() < 1e-9);
        assert!((stats.std - 1.0).abs() < 1e-9);
        assert_eq!(stats.median, 11.0);
    }

    #[test]
    fn test_sigma_clip_constant() {
        let stats = sigma_clipped_stats(&[5.0; 20], 3.0, 10);
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.median, 5.0);
    }

    #[test]
    fn test_background_of_noisy_image() {
        let mut image = SyntheticImage::new(200, 200, 1000.0, 7);
        image.add_gaussian_noise(15.0);
        image.add_gaussian_star(100.0, 100.0, 20_000.0, 1.5);

        let stats = image.to_fits_image().background(3.0, 10);
        assert!((stats.median - 1000.0).abs() < 2.0, "median {}", stats.median);
        assert!((stats.std - 15.0).abs() < 2.0, "std {}", stats.std);
    }

    #[test]
    fn test_load_written_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ramp.fits");
        let pixels: Vec<f64> = (0..30).map(|v| v as f64 * 1.5).collect();
        write_fits(&path, 6, 5, &pixels, &[]).unwrap();

        let image = FitsImage::from_file(&path).unwrap();
        assert_eq!((image.width, image.height), (6, 5));
        assert_eq!(image.bit_depth, -32);
        assert_eq!(image.get(1, 0), 1.5);
        assert_eq!(image.get(0, 1), 9.0);
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.fits");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(FitsImage::from_file(&path).is_err());
    }
}
