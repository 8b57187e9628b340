//! Image edge masks and score maps.
//!
//! The calibrator only needs `(mask, score)` per frame, where score is a
//! per-pixel edge strength in `[0, 1]`. Two sources are supported: a
//! built-in Canny detector, and precomputed structured-edge score maps
//! loaded from disk (the trained edge forest itself is an external
//! artifact).

use serde::{Deserialize, Serialize};

use crate::{CalibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMethod {
    /// Structured edge detection: consume a precomputed score map.
    Sed,
    /// Built-in Canny on the grayscale image.
    Canny,
}

#[derive(Debug, Clone, Copy)]
pub struct CannyParams {
    /// Gaussian pre-smoothing sigma in pixels.
    pub sigma: f64,
    /// Lower hysteresis threshold on gradient magnitude.
    pub low: f64,
    /// Upper hysteresis threshold on gradient magnitude.
    pub high: f64,
}

impl Default for CannyParams {
    fn default() -> Self {
        Self {
            sigma: 1.4,
            low: 100.0,
            high: 200.0,
        }
    }
}

/// Binary edge mask plus edge-strength scores for one image, row-major.
#[derive(Debug, Clone)]
pub struct ImageEdges {
    pub width: usize,
    pub height: usize,
    pub mask: Vec<bool>,
    pub score: Vec<f64>,
}

impl ImageEdges {
    /// Build from an externally computed score map by thresholding.
    pub fn from_score_map(score: Vec<f64>, width: usize, height: usize, thr: f64) -> Result<Self> {
        if score.len() != width * height {
            return Err(CalibError::InvalidConfig(format!(
                "score map has {} entries for {width}x{height} image",
                score.len()
            )));
        }
        let mask = score.iter().map(|&s| s >= thr).collect();
        Ok(Self {
            width,
            height,
            mask,
            score,
        })
    }

    pub fn is_edge(&self, x: usize, y: usize) -> bool {
        self.mask[y * self.width + x]
    }

    pub fn score_at(&self, x: usize, y: usize) -> f64 {
        self.score[y * self.width + x]
    }

    pub fn num_edges(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Canny edge detection on a grayscale image (values in `[0, 255]`).
    ///
    /// Blur, Sobel, non-maximum suppression along the quantized gradient
    /// direction, then double-threshold hysteresis. The score map is the
    /// gradient magnitude of surviving pixels normalized to `[0, 1]`.
    pub fn canny(gray: &[f64], width: usize, height: usize, params: &CannyParams) -> Self {
        let blurred = gaussian_blur(gray, width, height, params.sigma);
        let (mag, dir) = sobel(&blurred, width, height);
        let thin = non_maximum_suppression(&mag, &dir, width, height);
        let mask = hysteresis(&thin, width, height, params.low, params.high);

        let max_mag = mag.iter().cloned().fold(0.0f64, f64::max);
        let score = mask
            .iter()
            .zip(mag.iter())
            .map(|(&m, &g)| if m && max_mag > 0.0 { g / max_mag } else { 0.0 })
            .collect();
        Self {
            width,
            height,
            mask,
            score,
        }
    }
}

fn gaussian_blur(gray: &[f64], width: usize, height: usize, sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 {
        return gray.to_vec();
    }
    let radius = (3.0 * sigma).ceil() as i64;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let ksum: f64 = kernel.iter().sum();

    let w = width as i64;
    let h = height as i64;
    let mut tmp = vec![0.0; gray.len()];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (ki, kv) in kernel.iter().enumerate() {
                let xx = (x + ki as i64 - radius).clamp(0, w - 1);
                acc += kv * gray[(y * w + xx) as usize];
            }
            tmp[(y * w + x) as usize] = acc / ksum;
        }
    }
    let mut out = vec![0.0; gray.len()];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (ki, kv) in kernel.iter().enumerate() {
                let yy = (y + ki as i64 - radius).clamp(0, h - 1);
                acc += kv * tmp[(yy * w + x) as usize];
            }
            out[(y * w + x) as usize] = acc / ksum;
        }
    }
    out
}

/// Sobel gradient magnitude and direction (radians).
fn sobel(gray: &[f64], width: usize, height: usize) -> (Vec<f64>, Vec<f64>) {
    let mut mag = vec![0.0; gray.len()];
    let mut dir = vec![0.0; gray.len()];
    if width < 3 || height < 3 {
        return (mag, dir);
    }
    let at = |x: usize, y: usize| gray[y * width + x];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = -at(x - 1, y - 1) + at(x + 1, y - 1) - 2.0 * at(x - 1, y)
                + 2.0 * at(x + 1, y)
                - at(x - 1, y + 1)
                + at(x + 1, y + 1);
            let gy = -at(x - 1, y - 1) - 2.0 * at(x, y - 1) - at(x + 1, y - 1)
                + at(x - 1, y + 1)
                + 2.0 * at(x, y + 1)
                + at(x + 1, y + 1);
            mag[y * width + x] = (gx * gx + gy * gy).sqrt();
            dir[y * width + x] = gy.atan2(gx);
        }
    }
    (mag, dir)
}

fn non_maximum_suppression(mag: &[f64], dir: &[f64], width: usize, height: usize) -> Vec<f64> {
    let mut out = vec![0.0; mag.len()];
    if width < 3 || height < 3 {
        return out;
    }
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let i = y * width + x;
            // quantize the gradient direction to 0, 45, 90 or 135 degrees
            let angle = (dir[i].to_degrees() + 180.0) % 180.0;
            let (a, b) = if !(22.5..157.5).contains(&angle) {
                (mag[i - 1], mag[i + 1])
            } else if angle < 67.5 {
                (mag[i - width + 1], mag[i + width - 1])
            } else if angle < 112.5 {
                (mag[i - width], mag[i + width])
            } else {
                (mag[i - width - 1], mag[i + width + 1])
            };
            if mag[i] >= a && mag[i] >= b {
                out[i] = mag[i];
            }
        }
    }
    out
}

fn hysteresis(mag: &[f64], width: usize, height: usize, low: f64, high: f64) -> Vec<bool> {
    let mut mask = vec![false; mag.len()];
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for y in 0..height {
        for x in 0..width {
            if mag[y * width + x] >= high && !mask[y * width + x] {
                mask[y * width + x] = true;
                stack.push((x, y));
            }
        }
    }
    // grow strong edges through connected weak pixels
    while let Some((x, y)) = stack.pop() {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                    continue;
                }
                let j = ny as usize * width + nx as usize;
                if !mask[j] && mag[j] >= low {
                    mask[j] = true;
                    stack.push((nx as usize, ny as usize));
                }
            }
        }
    }
    mask
}
