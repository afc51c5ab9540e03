//! DAOFIND-style point source detection.
//!
//! The image is convolved with a zero-sum Gaussian kernel matched to the expected
//! stellar FWHM, so each convolved value is a least-squares estimate of the amplitude
//! of a Gaussian centered on that pixel. Local maxima of the convolved image above the
//! threshold become candidates, filtered on sharpness and roundness.

use tracing::debug;

/// `sigma = fwhm * GAUSSIAN_FWHM_TO_SIGMA`
pub const GAUSSIAN_FWHM_TO_SIGMA: f64 = 0.424_660_900_144_009_5;

/// Kernel extent in units of sigma
const SIGMA_RADIUS: f64 = 1.5;

/// A detected point source
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StarCandidate {
    /// Intensity-weighted centroid, pixels
    pub x: f64,
    pub y: f64,
    /// Maximum background-subtracted value in the detection box
    pub peak: f64,
    /// Amplitude estimate from the matched kernel
    pub amplitude: f64,
    pub sharpness: f64,
    /// `2 (hx - hy) / (hx + hy)` from Gaussian fits to the marginal profiles
    pub roundness: f64,
}

/// Zero-sum Gaussian detection kernel
#[derive(Debug, Clone)]
pub struct DetectionKernel {
    /// Half-width of the square box
    pub half: usize,
    /// Unmasked Gaussian values, row-major over the box
    gaussian: Vec<f64>,
    /// Normalized zero-sum weights, 0 outside the mask
    weights: Vec<f64>,
    mask: Vec<bool>,
    sigma: f64,
}

impl DetectionKernel {
    pub fn new(fwhm: f64) -> Self {
        let sigma = fwhm * GAUSSIAN_FWHM_TO_SIGMA;
        let radius = SIGMA_RADIUS * sigma;
        let half = (radius.max(2.0)) as usize;
        let size = 2 * half + 1;

        let mut gaussian = Vec::with_capacity(size * size);
        let mut mask = Vec::with_capacity(size * size);
        for j in 0..size {
            for i in 0..size {
                let dx = i as f64 - half as f64;
                let dy = j as f64 - half as f64;
                let r2 = dx * dx + dy * dy;
                gaussian.push((-r2 / (2.0 * sigma * sigma)).exp());
                mask.push(r2 <= radius * radius);
            }
        }

        let npix = mask.iter().filter(|&&m| m).count() as f64;
        let g_mean = gaussian
            .iter()
            .zip(&mask)
            .filter(|(_, &m)| m)
            .map(|(g, _)| g)
            .sum::<f64>()
            / npix;
        let denom: f64 = gaussian
            .iter()
            .zip(&mask)
            .filter(|(_, &m)| m)
            .map(|(g, _)| (g - g_mean).powi(2))
            .sum();

        let weights = gaussian
            .iter()
            .zip(&mask)
            .map(|(g, &m)| if m { (g - g_mean) / denom } else { 0.0 })
            .collect();

        Self {
            half,
            gaussian,
            weights,
            mask,
            sigma,
        }
    }

    pub fn size(&self) -> usize {
        2 * self.half + 1
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Amplitude estimate at every pixel; pixels whose box leaves the image get 0
    pub fn convolve(&self, data: &[f64], width: usize, height: usize) -> Vec<f64> {
        let size = self.size();
        let half = self.half;
        let mut out = vec![0.0; data.len()];
        if width < size || height < size {
            return out;
        }
        for y in half..height - half {
            for x in half..width - half {
                let mut acc = 0.0;
                for j in 0..size {
                    let row = (y + j - half) * width + x - half;
                    let k_row = j * size;
                    for i in 0..size {
                        acc += self.weights[k_row + i] * data[row + i];
                    }
                }
                out[y * width + x] = acc;
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct DaoFinder {
    kernel: DetectionKernel,
    threshold: f64,
    sharpness_low: f64,
    sharpness_high: f64,
    roundness_low: f64,
    roundness_high: f64,
}

impl DaoFinder {
    /// `threshold` is an absolute amplitude, usually a multiple of the background std
    pub fn new(fwhm: f64, threshold: f64) -> Self {
        Self {
            kernel: DetectionKernel::new(fwhm),
            threshold,
            sharpness_low: 0.2,
            sharpness_high: 1.0,
            roundness_low: -1.0,
            roundness_high: 1.0,
        }
    }

    pub fn with_sharpness(mut self, low: f64, high: f64) -> Self {
        self.sharpness_low = low;
        self.sharpness_high = high;
        self
    }

    /// Find sources in background-subtracted data
    pub fn find(&self, data: &[f64], width: usize, height: usize) -> Vec<StarCandidate> {
        let convolved = self.kernel.convolve(data, width, height);
        let half = self.kernel.half;
        let size = self.kernel.size();
        if width < size || height < size {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        let mut peaks = 0usize;
        for y in half..height - half {
            for x in half..width - half {
                let value = convolved[y * width + x];
                if value <= self.threshold || !self.is_local_max(&convolved, width, x, y) {
                    continue;
                }
                peaks += 1;

                if let Some(candidate) = self.measure(data, width, x, y, value) {
                    candidates.push(candidate);
                }
            }
        }

        debug!(
            "Detection: {} peaks above {:.2}, {} passed shape filters",
            peaks,
            self.threshold,
            candidates.len()
        );
        candidates
    }

    fn is_local_max(&self, convolved: &[f64], width: usize, x: usize, y: usize) -> bool {
        let half = self.kernel.half;
        let size = self.kernel.size();
        let center = convolved[y * width + x];
        for j in 0..size {
            for i in 0..size {
                if !self.kernel.mask[j * size + i] || (i == half && j == half) {
                    continue;
                }
                let other = convolved[(y + j - half) * width + x + i - half];
                // Plateaus resolve to their first pixel in raster order
                let before = j < half || (j == half && i < half);
                if other > center || (before && other == center) {
                    return false;
                }
            }
        }
        true
    }

    fn measure(
        &self,
        data: &[f64],
        width: usize,
        x: usize,
        y: usize,
        amplitude: f64,
    ) -> Option<StarCandidate> {
        let half = self.kernel.half;
        let size = self.kernel.size();
        let mut cutout = Vec::with_capacity(size * size);
        for j in 0..size {
            let row = (y + j - half) * width + x - half;
            cutout.extend_from_slice(&data[row..row + size]);
        }

        let center = cutout[half * size + half];
        let (sum_masked, n_masked) = cutout
            .iter()
            .zip(&self.kernel.mask)
            .filter(|(_, &m)| m)
            .fold((0.0, 0usize), |(s, n), (v, _)| (s + v, n + 1));
        if n_masked < 2 {
            return None;
        }
        let others_mean = (sum_masked - center) / (n_masked - 1) as f64;
        let sharpness = (center - others_mean) / amplitude;
        if !(self.sharpness_low..=self.sharpness_high).contains(&sharpness) {
            return None;
        }

        let roundness = self.marginal_roundness(&cutout)?;
        if !(self.roundness_low..=self.roundness_high).contains(&roundness) {
            return None;
        }

        let peak = cutout.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut wsum = 0.0;
        let mut wx = 0.0;
        let mut wy = 0.0;
        for j in 0..size {
            for i in 0..size {
                let v = cutout[j * size + i];
                if v > 0.0 {
                    wsum += v;
                    wx += v * i as f64;
                    wy += v * j as f64;
                }
            }
        }
        if wsum <= 0.0 {
            return None;
        }

        Some(StarCandidate {
            x: (x - half) as f64 + wx / wsum,
            y: (y - half) as f64 + wy / wsum,
            peak,
            amplitude,
            sharpness,
            roundness,
        })
    }

    /// Roundness from least-squares Gaussian amplitudes of the x and y marginals
    fn marginal_roundness(&self, cutout: &[f64]) -> Option<f64> {
        let size = self.kernel.size();
        let mut marginal_x = vec![0.0; size];
        let mut marginal_y = vec![0.0; size];
        for j in 0..size {
            for i in 0..size {
                let v = cutout[j * size + i];
                marginal_x[i] += v;
                marginal_y[j] += v;
            }
        }

        // The middle row of the unmasked kernel is the 1D profile
        let half = self.kernel.half;
        let profile = &self.kernel.gaussian[half * size..(half + 1) * size];
        let hx = profile_amplitude(profile, &marginal_x);
        let hy = profile_amplitude(profile, &marginal_y);
        if hx <= 0.0 || hy <= 0.0 {
            return None;
        }
        Some(2.0 * (hx - hy) / (hx + hy))
    }
}

fn profile_amplitude(profile: &[f64], values: &[f64]) -> f64 {
    let n = profile.len() as f64;
    let p_mean = profile.iter().sum::<f64>() / n;
    let v_mean = values.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (p, v) in profile.iter().zip(values) {
        cov += (p - p_mean) * (v - v_mean);
        var += (p - p_mean).powi(2);
    }
    if var > 0.0 {
        cov / var
    } else {
        0.0
    }
}
