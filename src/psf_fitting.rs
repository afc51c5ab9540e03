/// PSF fitting module
/// Circular Gaussian plus constant background, fitted with Levenberg-Marquardt
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// FWHM of a Gaussian in units of its sigma, `2 sqrt(2 ln 2)`
pub const GAUSSIAN_SIGMA_TO_FWHM: f64 = 2.354_820_045_030_949_3;

#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    #[error("not enough data points for fitting ({points} points, {params} parameters)")]
    NotEnoughData { points: usize, params: usize },
    #[error("cutout has no signal above background")]
    NoSignal,
    #[error("fit did not converge to a usable model: {0}")]
    Unusable(String),
}

/// Trait for PSF models
pub trait PSFFunction: Send + Sync {
    fn n_params(&self) -> usize;

    /// Evaluate PSF at given position with parameters
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64;

    /// Calculate gradient (Jacobian row) of PSF with respect to parameters
    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]);
}

/// Circular Gaussian, parameters `[A, B, x0, y0, sigma]`
pub struct CircularGaussianPSF;

impl PSFFunction for CircularGaussianPSF {
    fn n_params(&self) -> usize {
        5
    }

    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let a = params[0]; // Amplitude
        let b = params[1]; // Background
        let dx = x - params[2];
        let dy = y - params[3];
        let sigma = params[4];

        b + a * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let dx = x - params[2];
        let dy = y - params[3];
        let sigma = params[4];
        let s2 = sigma * sigma;
        let r2 = dx * dx + dy * dy;
        let exp_arg = (-r2 / (2.0 * s2)).exp();

        // d/dA
        grad[0] = exp_arg;
        // d/dB
        grad[1] = 1.0;
        // d/dx0
        grad[2] = a * exp_arg * dx / s2;
        // d/dy0
        grad[3] = a * exp_arg * dy / s2;
        // d/dsigma
        grad[4] = a * exp_arg * r2 / (s2 * sigma);
    }
}

/// Fitted circular Gaussian
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PSFModel {
    pub amplitude: f64,
    pub background: f64,
    /// Center, in cutout pixel coordinates
    pub x0: f64,
    pub y0: f64,
    pub sigma: f64,
    pub fwhm: f64,
    pub rmse: f64,
}

/// Simple Levenberg-Marquardt optimizer for PSF fitting
pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            lambda: 0.01,
            lambda_factor: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    fn sum_squares(psf: &dyn PSFFunction, positions: &[(f64, f64)], values: &[f64], params: &[f64]) -> f64 {
        positions
            .iter()
            .zip(values)
            .map(|((x, y), observed)| (observed - psf.value(*x, *y, params)).powi(2))
            .sum()
    }

    /// Fit PSF model to data; parameters are clamped to the bounds after every step
    pub fn fit(
        &mut self,
        psf: &dyn PSFFunction,
        positions: &[(f64, f64)],
        values: &[f64],
        initial_params: &[f64],
        lower_bounds: &[f64],
        upper_bounds: &[f64],
    ) -> Result<Vec<f64>, FitError> {
        let n_params = initial_params.len();
        let n_points = positions.len();

        if n_points <= n_params {
            return Err(FitError::NotEnoughData {
                points: n_points,
                params: n_params,
            });
        }

        let mut params = initial_params.to_vec();
        let mut current_error = Self::sum_squares(psf, positions, values, &params);

        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];

        for _iter in 0..self.max_iterations {
            for (i, ((x, y), observed)) in positions.iter().zip(values.iter()).enumerate() {
                residuals[i] = observed - psf.value(*x, *y, &params);
                psf.gradient(*x, *y, &params, &mut gradient);
                for (j, &grad) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = grad;
                }
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            let mut improved = false;
            while self.lambda <= 1e10 {
                // Marquardt scaling of the diagonal
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += self.lambda * jtj[(i, i)].max(1e-12);
                }

                let Some(delta) = h.lu().solve(&jtr) else {
                    self.lambda *= self.lambda_factor;
                    continue;
                };

                let new_params: Vec<f64> = (0..n_params)
                    .map(|i| (params[i] + delta[i]).clamp(lower_bounds[i], upper_bounds[i]))
                    .collect();
                let new_error = Self::sum_squares(psf, positions, values, &new_params);

                if new_error.is_finite() && new_error < current_error {
                    let relative_change = (current_error - new_error) / current_error.max(f64::MIN_POSITIVE);
                    params = new_params;
                    current_error = new_error;
                    self.lambda /= self.lambda_factor;
                    improved = relative_change > self.tolerance;
                    break;
                }
                self.lambda *= self.lambda_factor;
            }

            if !improved {
                break;
            }
        }

        Ok(params)
    }
}

/// Fit a circular Gaussian plus constant to a background-subtracted cutout.
///
/// `cutout` is row-major with the given width. The returned center is in cutout
/// pixel coordinates.
pub fn fit_circular_gaussian(cutout: &[f64], width: usize) -> Result<PSFModel, FitError> {
    if width == 0 || cutout.is_empty() {
        return Err(FitError::NotEnoughData {
            points: cutout.len(),
            params: 5,
        });
    }
    let height = cutout.len() / width;

    let mut positions = Vec::with_capacity(cutout.len());
    let mut values = Vec::with_capacity(cutout.len());
    for (idx, &v) in cutout.iter().enumerate() {
        if v.is_finite() {
            positions.push(((idx % width) as f64, (idx / width) as f64));
            values.push(v);
        }
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return Err(FitError::NoSignal);
    }

    // Start at the brightest pixel
    let brightest = values
        .iter()
        .position(|&v| v == max)
        .map(|i| positions[i])
        .unwrap_or((width as f64 / 2.0, height as f64 / 2.0));

    let half_extent = width.min(height) as f64 / 2.0;
    let initial_params = [max - min, min, brightest.0, brightest.1, 1.5];
    let lower_bounds = [0.0, min - (max - min), 0.0, 0.0, 0.3];
    let upper_bounds = [
        2.0 * (max - min),
        max,
        (width - 1) as f64,
        (height.max(1) - 1) as f64,
        half_extent,
    ];

    let psf = CircularGaussianPSF;
    let mut optimizer = LevenbergMarquardt::default();
    let params = optimizer.fit(
        &psf,
        &positions,
        &values,
        &initial_params,
        &lower_bounds,
        &upper_bounds,
    )?;

    if params.iter().any(|p| !p.is_finite()) {
        return Err(FitError::Unusable("non-finite parameters".to_string()));
    }
    let sigma = params[4].abs();
    if params[0] <= 0.0 {
        return Err(FitError::Unusable("zero amplitude".to_string()));
    }
    if sigma >= half_extent {
        return Err(FitError::Unusable(format!("sigma {:.2} hit the cutout size", sigma)));
    }

    let sum_squared_residuals = LevenbergMarquardt::sum_squares(&psf, &positions, &values, &params);
    Ok(PSFModel {
        amplitude: params[0],
        background: params[1],
        x0: params[2],
        y0: params[3],
        sigma,
        fwhm: sigma * GAUSSIAN_SIGMA_TO_FWHM,
        rmse: (sum_squared_residuals / positions.len() as f64).sqrt(),
    })
}
