//! Shared helpers for unit and end-to-end tests

use anyhow::Result;
use rand::prelude::*;
use std::path::Path;

use crate::image_analysis::FitsImage;

/// Synthetic float image with seeded noise and Gaussian stars
pub struct SyntheticImage {
    pub data: Vec<f64>,
    pub width: usize,
    pub height: usize,
    rng: StdRng,
}

impl SyntheticImage {
    pub fn new(width: usize, height: usize, background: f64, seed: u64) -> Self {
        SyntheticImage {
            data: vec![background; width * height],
            width,
            height,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform noise in `[-amplitude, amplitude]`
    pub fn add_uniform_noise(&mut self, amplitude: f64) {
        for pixel in self.data.iter_mut() {
            *pixel += (self.rng.gen::<f64>() * 2.0 - 1.0) * amplitude;
        }
    }

    /// Normal noise via Box-Muller
    pub fn add_gaussian_noise(&mut self, sigma: f64) {
        for pixel in self.data.iter_mut() {
            let u1: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
            let u2: f64 = self.rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            *pixel += z * sigma;
        }
    }

    pub fn add_gaussian_star(&mut self, x: f64, y: f64, amplitude: f64, sigma: f64) {
        self.add_elliptical_star(x, y, amplitude, sigma, sigma);
    }

    pub fn add_elliptical_star(&mut self, x: f64, y: f64, amplitude: f64, sigma_x: f64, sigma_y: f64) {
        let reach_x = (5.0 * sigma_x).ceil();
        let reach_y = (5.0 * sigma_y).ceil();
        let x0 = (x - reach_x).max(0.0) as usize;
        let x1 = ((x + reach_x).max(0.0) as usize).min(self.width.saturating_sub(1));
        let y0 = (y - reach_y).max(0.0) as usize;
        let y1 = ((y + reach_y).max(0.0) as usize).min(self.height.saturating_sub(1));

        for py in y0..=y1 {
            for px in x0..=x1 {
                let dx = px as f64 - x;
                let dy = py as f64 - y;
                let arg = dx * dx / (2.0 * sigma_x * sigma_x) + dy * dy / (2.0 * sigma_y * sigma_y);
                self.data[py * self.width + px] += amplitude * (-arg).exp();
            }
        }
    }

    pub fn to_fits_image(&self) -> FitsImage {
        FitsImage {
            width: self.width,
            height: self.height,
            bit_depth: -32,
            data: self.data.clone(),
        }
    }
}

/// One 2880-byte header block from `(keyword, value)` cards, terminated by END
pub fn header_block(cards: &[(&str, &str)]) -> Vec<u8> {
    let mut text = String::new();
    for (key, value) in cards {
        let card = if value.starts_with('\'') {
            format!("{:<8}= {:<20}", key, value)
        } else {
            format!("{:<8}= {:>20}", key, value)
        };
        text.push_str(&format!("{:<80}", card));
    }
    text.push_str(&format!("{:<80}", "END"));

    let mut bytes = text.into_bytes();
    let padded = bytes.len().div_ceil(2880) * 2880;
    bytes.resize(padded, b' ');
    bytes
}

/// Write a single-plane 32-bit float FITS file
pub fn write_fits(
    path: &Path,
    width: usize,
    height: usize,
    pixels: &[f64],
    extra_cards: &[(&str, &str)],
) -> Result<()> {
    anyhow::ensure!(pixels.len() == width * height, "pixel count mismatch");

    let naxis1 = width.to_string();
    let naxis2 = height.to_string();
    let mut cards: Vec<(&str, &str)> = vec![
        ("SIMPLE", "T"),
        ("BITPIX", "-32"),
        ("NAXIS", "2"),
        ("NAXIS1", &naxis1),
        ("NAXIS2", &naxis2),
    ];
    cards.extend_from_slice(extra_cards);

    let mut bytes = header_block(&cards);
    let data_start = bytes.len();
    for &v in pixels {
        bytes.extend_from_slice(&(v as f32).to_be_bytes());
    }
    let data_len = bytes.len() - data_start;
    let padded = data_len.div_ceil(2880) * 2880;
    bytes.resize(data_start + padded, 0);

    std::fs::write(path, bytes)?;
    Ok(())
}

/// Write a synthetic star field with the given header cards
pub fn write_star_frame(path: &Path, seed: u64, extra_cards: &[(&str, &str)]) -> Result<()> {
    let mut image = SyntheticImage::new(200, 200, 1000.0, seed);
    image.add_uniform_noise(10.0);
    image.add_gaussian_star(90.0, 95.0, 8000.0, 1.3);
    image.add_gaussian_star(110.5, 104.2, 6000.0, 1.3);
    write_fits(path, image.width, image.height, &image.data, extra_cards)
}
