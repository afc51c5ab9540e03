use anyhow::Result;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::AnalyzerSettings;
use crate::image_analysis::{sigma_clipped_stats, BackgroundStats, FitsImage};
use crate::models::FrameMeasurement;
use crate::psf_fitting::{fit_circular_gaussian, PSFModel};
use crate::star_detection::{DaoFinder, StarCandidate};
use crate::utils::round_to;

/// Why a frame produced the all-zero measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SkipReason {
    /// Background standard deviation is zero
    Degenerate,
    NoDetections,
    /// Every detection was saturated or elongated
    AllRejected,
    /// No candidate survived the edge and contamination checks and a PSF fit
    NoFittableStars,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::Degenerate => "degenerate image (zero background deviation)",
            SkipReason::NoDetections => "no stars detected",
            SkipReason::AllRejected => "all detections saturated or elongated",
            SkipReason::NoFittableStars => "no fittable stars",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RejectionCounts {
    pub saturated: usize,
    pub elongated: usize,
    pub near_edge: usize,
    pub contaminated: usize,
    pub fit_failed: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FittedStar {
    pub candidate: StarCandidate,
    pub peak_median_ratio: f64,
    pub psf: PSFModel,
    /// Sigma-clipped median of the wide surround
    pub surround_median: f64,
}

impl FittedStar {
    pub fn fwhm(&self) -> f64 {
        self.psf.fwhm
    }
}

/// Full breakdown of one frame's analysis
#[derive(Debug, Clone, serde::Serialize)]
pub struct StarAnalysis {
    /// Size of the analyzed (cropped) region
    pub width: usize,
    pub height: usize,
    pub background: BackgroundStats,
    /// Every detection
    pub candidates: Vec<StarCandidate>,
    /// Detections that passed the saturation and roundness filters, brightest first
    pub accepted: Vec<StarCandidate>,
    pub fitted: Vec<FittedStar>,
    pub rejected: RejectionCounts,
    pub measurement: FrameMeasurement,
    pub skip: Option<SkipReason>,
}

impl StarAnalysis {
    fn skipped(width: usize, height: usize, background: BackgroundStats, reason: SkipReason) -> Self {
        Self {
            width,
            height,
            background,
            candidates: Vec::new(),
            accepted: Vec::new(),
            fitted: Vec::new(),
            rejected: RejectionCounts::default(),
            measurement: FrameMeasurement::zero(),
            skip: Some(reason),
        }
    }
}

pub struct PhotometricAnalyzer {
    settings: AnalyzerSettings,
}

impl PhotometricAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    /// Load a FITS file and analyze it. Only loading can fail.
    pub fn analyze_file(&self, path: &Path) -> Result<StarAnalysis> {
        let image = FitsImage::from_file(path)?;
        Ok(self.analyze(&image))
    }

    pub fn analyze(&self, image: &FitsImage) -> StarAnalysis {
        let s = &self.settings;
        let image = image.crop_center(s.crop_factor);
        let (width, height) = (image.width, image.height);
        if image.data.is_empty() {
            return StarAnalysis::skipped(width, height, BackgroundStats::default(), SkipReason::Degenerate);
        }

        let background = image.background(s.clip_sigma, s.clip_max_iterations);
        debug!(
            "Background: mean={:.2} median={:.2} std={:.2}",
            background.mean, background.median, background.std
        );
        if background.std == 0.0 {
            warn!("Skipping measurement: {}", SkipReason::Degenerate);
            return StarAnalysis::skipped(width, height, background, SkipReason::Degenerate);
        }

        let residual: Vec<f64> = image.data.iter().map(|v| v - background.median).collect();
        let finder = DaoFinder::new(s.detection_fwhm, s.threshold * background.std)
            .with_sharpness(s.sharpness_low, s.sharpness_high);
        let candidates = finder.find(&residual, width, height);
        info!("Number of stars detected: {}", candidates.len());

        let mut analysis = StarAnalysis {
            width,
            height,
            background,
            candidates,
            accepted: Vec::new(),
            fitted: Vec::new(),
            rejected: RejectionCounts::default(),
            measurement: FrameMeasurement::zero(),
            skip: None,
        };
        if analysis.candidates.is_empty() {
            return finish_skipped(analysis, SkipReason::NoDetections);
        }

        let ceiling = s.saturation_ceiling();
        for candidate in &analysis.candidates {
            if candidate.peak >= ceiling {
                analysis.rejected.saturated += 1;
            } else if candidate.roundness.abs() > s.max_roundness {
                analysis.rejected.elongated += 1;
            } else {
                analysis.accepted.push(candidate.clone());
            }
        }
        debug!(
            "Non-saturated round stars (< {}% peak): {}",
            s.saturation_limit,
            analysis.accepted.len()
        );
        if analysis.accepted.is_empty() {
            return finish_skipped(analysis, SkipReason::AllRejected);
        }

        let median = background.median;
        analysis
            .accepted
            .sort_by(|a, b| peak_ratio(b.peak, median).total_cmp(&peak_ratio(a.peak, median)));

        let r = s.aperture_radius();
        let rf = r as f64;
        for candidate in analysis.accepted.iter().take(s.max_stars) {
            let (x, y) = (candidate.x, candidate.y);
            if !(x > rf && x < width as f64 - rf && y > rf && y < height as f64 - rf) {
                analysis.rejected.near_edge += 1;
                continue;
            }

            let x0 = (x - rf) as usize;
            let y0 = (y - rf) as usize;
            let star_cutout = image.region(x0, y0, (x + rf) as usize, (y + rf) as usize);
            let cutout_width = (x + rf) as usize - x0;

            let wide = 10.0 * rf;
            let surround = image.region(
                (x - wide).max(0.0) as usize,
                (y - wide).max(0.0) as usize,
                (x + wide) as usize,
                (y + wide) as usize,
            );
            let cutout_stats = sigma_clipped_stats(&star_cutout, s.clip_sigma, s.clip_max_iterations);
            let surround_stats = sigma_clipped_stats(&surround, s.clip_sigma, s.clip_max_iterations);

            // Only meaningful for a positive background level
            if median > 0.0 && surround_stats.median >= s.contamination_ratio * median {
                debug!(
                    "Star at ({:.1}, {:.1}) sits on extended emission: surround median {:.2}",
                    x, y, surround_stats.median
                );
                analysis.rejected.contaminated += 1;
                continue;
            }

            let subtracted: Vec<f64> = star_cutout.iter().map(|v| v - median).collect();
            match fit_circular_gaussian(&subtracted, cutout_width) {
                Ok(psf) => {
                    debug!(
                        "Star at ({:.1}, {:.1}): FWHM {:.2}, peak {:.1}, cutout median {:.2}",
                        x, y, psf.fwhm, candidate.peak, cutout_stats.median
                    );
                    analysis.fitted.push(FittedStar {
                        candidate: candidate.clone(),
                        peak_median_ratio: peak_ratio(candidate.peak, median),
                        psf,
                        surround_median: surround_stats.median,
                    });
                }
                Err(e) => {
                    debug!("Fit failed for star at ({:.1}, {:.1}): {}", x, y, e);
                    analysis.rejected.fit_failed += 1;
                }
            }
        }

        if analysis.fitted.is_empty() {
            return finish_skipped(analysis, SkipReason::NoFittableStars);
        }

        let fwhm = analysis.fitted.iter().map(|f| f.fwhm()).sum::<f64>() / analysis.fitted.len() as f64;
        let eccentricity = analysis
            .accepted
            .iter()
            .map(|c| c.roundness.abs())
            .sum::<f64>()
            / analysis.accepted.len() as f64;

        analysis.measurement = FrameMeasurement {
            fwhm: round_to(fwhm, 2),
            eccentricity: round_to(eccentricity, 2),
            mean: round_to(background.mean, 2),
            median: round_to(background.median, 2),
            std: round_to(background.std, 2),
        };
        info!(
            "Measured {} stars: FWHM {:.2}, eccentricity {:.2}",
            analysis.fitted.len(),
            analysis.measurement.fwhm,
            analysis.measurement.eccentricity
        );
        analysis
    }
}

fn peak_ratio(peak: f64, median: f64) -> f64 {
    if median != 0.0 {
        peak / median
    } else {
        peak
    }
}

fn finish_skipped(mut analysis: StarAnalysis, reason: SkipReason) -> StarAnalysis {
    warn!("Skipping measurement: {}", reason);
    analysis.measurement = FrameMeasurement::zero();
    analysis.skip = Some(reason);
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SyntheticImage;

    fn uncropped() -> AnalyzerSettings {
        AnalyzerSettings {
            crop_factor: 1,
            ..AnalyzerSettings::default()
        }
    }

    fn star_field(seed: u64) -> SyntheticImage {
        let mut image = SyntheticImage::new(400, 400, 100.0, seed);
        image.add_uniform_noise(10.0);
        for (x, y) in [(60.0, 70.0), (200.3, 150.6), (310.0, 320.0), (120.5, 300.2), (330.0, 80.0)] {
            image.add_gaussian_star(x, y, 5000.0, 1.3);
        }
        image
    }

    #[test]
    fn test_measures_star_field() {
        let image = star_field(1).to_fits_image();
        let analysis = PhotometricAnalyzer::new(uncropped()).analyze(&image);

        assert_eq!(analysis.skip, None);
        assert_eq!(analysis.fitted.len(), 5);
        let m = analysis.measurement;
        let expected = 1.3 * crate::psf_fitting::GAUSSIAN_SIGMA_TO_FWHM;
        assert!((m.fwhm - expected).abs() < 0.3, "fwhm {}", m.fwhm);
        assert!(m.eccentricity < 0.2, "eccentricity {}", m.eccentricity);
        assert!((m.median - 100.0).abs() < 1.0);
        assert!((m.std - 5.77).abs() < 0.5, "std {}", m.std);
        assert_eq!(m.fwhm, round_to(m.fwhm, 2));
    }

    #[test]
    fn test_crop_keeps_center() {
        let image = star_field(2).to_fits_image();
        let analysis = PhotometricAnalyzer::new(AnalyzerSettings::default()).analyze(&image);

        // Only the star at (200.3, 150.6) lies in the central 200x200 region
        assert_eq!((analysis.width, analysis.height), (200, 200));
        assert_eq!(analysis.fitted.len(), 1);
        let star = &analysis.fitted[0].candidate;
        assert!((star.x - 100.3).abs() < 0.5);
        assert!((star.y - 50.6).abs() < 0.5);
    }

    #[test]
    fn test_saturated_star_is_rejected() {
        let mut image = star_field(3);
        image.add_gaussian_star(250.0, 250.0, 64_000.0, 1.3);
        let analysis = PhotometricAnalyzer::new(uncropped()).analyze(&image.to_fits_image());

        let ceiling = uncropped().saturation_ceiling();
        assert!(analysis.candidates.iter().any(|c| c.peak >= ceiling));
        assert!(analysis.accepted.iter().all(|c| c.peak < ceiling));
        assert!(analysis
            .fitted
            .iter()
            .all(|f| (f.candidate.x - 250.0).abs() > 3.0 || (f.candidate.y - 250.0).abs() > 3.0));
        assert_eq!(analysis.rejected.saturated, 1);
        assert_eq!(analysis.fitted.len(), 5);
    }

    #[test]
    fn test_star_on_nebula_is_rejected() {
        let mut image = SyntheticImage::new(600, 600, 100.0, 4);
        image.add_uniform_noise(10.0);
        image.add_gaussian_star(150.0, 150.0, 500.0, 50.0);
        image.add_gaussian_star(150.0, 150.0, 5000.0, 1.3);
        image.add_gaussian_star(450.0, 450.0, 5000.0, 1.3);

        let analysis = PhotometricAnalyzer::new(uncropped()).analyze(&image.to_fits_image());

        assert_eq!(analysis.rejected.contaminated, 1);
        assert_eq!(analysis.fitted.len(), 1);
        let kept = &analysis.fitted[0].candidate;
        assert!((kept.x - 450.0).abs() < 1.0 && (kept.y - 450.0).abs() < 1.0);
        assert!(analysis
            .fitted
            .iter()
            .all(|f| (f.candidate.x - 150.0).abs() > 3.0 || (f.candidate.y - 150.0).abs() > 3.0));
    }

    #[test]
    fn test_edge_star_is_rejected() {
        let mut image = SyntheticImage::new(200, 200, 100.0, 5);
        image.add_uniform_noise(10.0);
        image.add_gaussian_star(5.0, 100.0, 5000.0, 1.3);
        image.add_gaussian_star(100.0, 100.0, 5000.0, 1.3);

        let analysis = PhotometricAnalyzer::new(uncropped()).analyze(&image.to_fits_image());
        assert_eq!(analysis.rejected.near_edge, 1);
        assert_eq!(analysis.fitted.len(), 1);
    }

    #[test]
    fn test_starless_frame_is_zero() {
        let mut image = SyntheticImage::new(300, 300, 100.0, 6);
        image.add_uniform_noise(10.0);
        let analysis = PhotometricAnalyzer::new(AnalyzerSettings::default()).analyze(&image.to_fits_image());

        assert_eq!(analysis.skip, Some(SkipReason::NoDetections));
        assert!(analysis.measurement.is_zero());
    }

    #[test]
    fn test_constant_frame_is_degenerate() {
        let image = SyntheticImage::new(100, 100, 500.0, 7).to_fits_image();
        let analysis = PhotometricAnalyzer::new(AnalyzerSettings::default()).analyze(&image);

        assert_eq!(analysis.skip, Some(SkipReason::Degenerate));
        assert!(analysis.measurement.is_zero());
        assert!(analysis.candidates.is_empty());
    }

    #[test]
    fn test_empty_image_is_degenerate() {
        let image = FitsImage::from_pixels(0, 0, Vec::new()).unwrap();
        let analysis = PhotometricAnalyzer::new(AnalyzerSettings::default()).analyze(&image);

        assert_eq!(analysis.skip, Some(SkipReason::Degenerate));
        assert!(analysis.measurement.is_zero());
        assert_eq!((analysis.width, analysis.height), (0, 0));

        let no_columns = FitsImage::from_pixels(0, 7, Vec::new()).unwrap();
        let analysis = PhotometricAnalyzer::new(AnalyzerSettings::default()).analyze(&no_columns);
        assert_eq!(analysis.skip, Some(SkipReason::Degenerate));
    }

    #[test]
    fn test_elongated_source_is_rejected() {
        let mut image = SyntheticImage::new(200, 200, 100.0, 9);
        image.add_uniform_noise(10.0);
        image.add_gaussian_star(60.0, 100.0, 5000.0, 1.3);
        // Marginal roundness near -0.75: still a candidate, too elongated to accept
        image.add_elliptical_star(140.0, 100.0, 5000.0, 2.0, 1.3);

        let analysis = PhotometricAnalyzer::new(uncropped()).analyze(&image.to_fits_image());

        assert_eq!(analysis.candidates.len(), 2, "{:?}", analysis.candidates);
        assert_eq!(analysis.rejected.elongated, 1);
        assert_eq!(analysis.accepted.len(), 1);
        let kept = &analysis.accepted[0];
        assert!((kept.x - 60.0).abs() < 1.0 && (kept.y - 100.0).abs() < 1.0);
        assert!(analysis.accepted.iter().all(|c| (c.x - 140.0).abs() > 3.0));
        assert_eq!(analysis.fitted.len(), 1);
    }

    #[test]
    fn test_top_n_limits_fitting() {
        let image = star_field(8).to_fits_image();
        let settings = AnalyzerSettings {
            max_stars: 2,
            ..uncropped()
        };
        let analysis = PhotometricAnalyzer::new(settings).analyze(&image);

        assert_eq!(analysis.fitted.len(), 2);
        // Eccentricity still averages every accepted candidate
        assert_eq!(analysis.accepted.len(), 5);
    }
}
