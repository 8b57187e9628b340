//! Mutual information between camera grayscale and lidar reflectance.
//!
//! Grayscale is sampled at every in-frustum projected point and paired
//! with that point's reflectance (rescaled to `[0, 255]`). Marginal and
//! joint densities are estimated by Gaussian kernel density estimation
//! with Silverman bandwidths on a 510-point grid over `[0, 255]`; the
//! cost is the negated mutual information in bits.

use crate::frame::Frame;
use crate::project::FrameTables;

/// Number of evaluation points along each axis of the KDE grid.
pub const MI_GRID: usize = 510;

const INTENSITY_RANGE: f64 = 255.0;

/// Negated mutual information for one frame. Returns 0 when fewer than
/// five valid samples exist; never fails.
pub fn mutual_info_cost(frame: &Frame, tables: &FrameTables) -> f64 {
    let mut gray = Vec::with_capacity(tables.n_in_frustum);
    let mut refl = Vec::with_capacity(tables.n_in_frustum);
    for (i, &inside) in tables.in_frustum.iter().enumerate() {
        if !inside {
            continue;
        }
        let px = tables.pixels[i];
        if let Some(g) = frame.gray_at(px.x.round() as i64, px.y.round() as i64) {
            gray.push(g);
            refl.push((frame.reflectance[i] * INTENSITY_RANGE).clamp(0.0, INTENSITY_RANGE));
        }
    }
    let n = gray.len();
    if n < 5 {
        return 0.0;
    }

    let step = INTENSITY_RANGE / (MI_GRID - 1) as f64;
    let nf = n as f64;

    // Silverman bandwidths: 1.06 s n^(-1/5) for the marginals,
    // s n^(-1/6) per axis for the joint.
    let h_g1 = (1.06 * std_dev(&gray) * nf.powf(-0.2)).max(0.5 * step);
    let h_r1 = (1.06 * std_dev(&refl) * nf.powf(-0.2)).max(0.5 * step);
    let h_g2 = (std_dev(&gray) * nf.powf(-1.0 / 6.0)).max(0.5 * step);
    let h_r2 = (std_dev(&refl) * nf.powf(-1.0 / 6.0)).max(0.5 * step);

    let bin = |v: f64| ((v / step).round() as usize).min(MI_GRID - 1);

    let mut hist_g = vec![0.0f64; MI_GRID];
    let mut hist_r = vec![0.0f64; MI_GRID];
    let mut hist_gr = vec![0.0f64; MI_GRID * MI_GRID];
    for (&g, &r) in gray.iter().zip(refl.iter()) {
        hist_g[bin(g)] += 1.0;
        hist_r[bin(r)] += 1.0;
        hist_gr[bin(g) * MI_GRID + bin(r)] += 1.0;
    }

    let p_g = normalize(smooth_1d(&hist_g, h_g1 / step));
    let p_r = normalize(smooth_1d(&hist_r, h_r1 / step));
    let p_gr = {
        let rows: Vec<f64> = hist_gr
            .chunks(MI_GRID)
            .flat_map(|row| smooth_1d(row, h_r2 / step))
            .collect();
        let mut cols = vec![0.0; MI_GRID * MI_GRID];
        for x in 0..MI_GRID {
            let col: Vec<f64> = (0..MI_GRID).map(|y| rows[y * MI_GRID + x]).collect();
            for (y, v) in smooth_1d(&col, h_g2 / step).into_iter().enumerate() {
                cols[y * MI_GRID + x] = v;
            }
        }
        normalize(cols)
    };

    let mi = entropy(&p_g) + entropy(&p_r) - entropy(&p_gr);
    -mi
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

/// Discrete convolution with a truncated Gaussian, sigma in bins.
fn smooth_1d(values: &[f64], sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 {
        return values.to_vec();
    }
    let radius = ((4.0 * sigma).ceil() as usize).min(values.len());
    let kernel: Vec<f64> = (0..=radius)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let mut out = vec![0.0; values.len()];
    for (i, &v) in values.iter().enumerate() {
        if v == 0.0 {
            continue;
        }
        out[i] += v * kernel[0];
        for d in 1..=radius {
            if i >= d {
                out[i - d] += v * kernel[d];
            }
            if i + d < values.len() {
                out[i + d] += v * kernel[d];
            }
        }
    }
    out
}

fn normalize(mut values: Vec<f64>) -> Vec<f64> {
    let sum: f64 = values.iter().sum();
    if sum > 0.0 {
        for v in &mut values {
            *v /= sum;
        }
    }
    values
}

/// Shannon entropy of a probability mass in bits.
fn entropy(p: &[f64]) -> f64 {
    -p.iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| v * v.log2())
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::FrameTables;
    use image::{Rgb, RgbImage};
    use nalgebra::{Point2, Point3, Vector3};
    use rand::{Rng, SeedableRng};

    fn frame_and_tables(gray_vals: &[u8], refl: Vec<f64>, side: u32) -> (Frame, FrameTables) {
        let mut img = RgbImage::new(side, side);
        for (i, &g) in gray_vals.iter().enumerate() {
            let (x, y) = (i as u32 % side, i as u32 / side);
            img.put_pixel(x, y, Rgb([g, g, g]));
        }
        let n = refl.len();
        let points = vec![Point3::new(0.0, 0.0, 1.0); n];
        let frame = Frame::new(img, points, refl).unwrap();
        let pixels: Vec<Point2<f64>> = (0..n)
            .map(|i| Point2::new((i as u32 % side) as f64, (i as u32 / side) as f64))
            .collect();
        let tables = FrameTables {
            cam_points: vec![Vector3::new(0.0, 0.0, 1.0); n],
            pixels,
            in_frustum: vec![true; n],
            n_in_frustum: n,
        };
        (frame, tables)
    }

    #[test]
    fn uncorrelated_noise_has_near_zero_mi() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
        let side = 70u32;
        let n = (side * side) as usize;
        let gray: Vec<u8> = (0..n).map(|_| rng.random_range(0..=255u8)).collect();
        let refl: Vec<f64> = (0..n).map(|_| rng.random_range(0.0..1.0)).collect();
        let (frame, tables) = frame_and_tables(&gray, refl, side);
        let mi = -mutual_info_cost(&frame, &tables);
        assert!(mi.abs() < 0.05, "expected |MI| < 0.05 bits, got {mi}");
    }

    #[test]
    fn identical_signals_have_high_mi() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(13);
        let side = 50u32;
        let n = (side * side) as usize;
        let gray: Vec<u8> = (0..n).map(|_| rng.random_range(0..=255u8)).collect();
        let refl: Vec<f64> = gray.iter().map(|&g| g as f64 / 255.0).collect();
        let (frame, tables) = frame_and_tables(&gray, refl, side);
        let mi = -mutual_info_cost(&frame, &tables);
        assert!(mi > 0.5, "expected strong dependence, got {mi} bits");
    }

    #[test]
    fn too_few_samples_is_zero() {
        let (frame, mut tables) = frame_and_tables(&[0, 50, 100, 150], vec![0.1; 4], 2);
        assert_eq!(mutual_info_cost(&frame, &tables), 0.0);
        tables.in_frustum = vec![false; 4];
        tables.n_in_frustum = 0;
        assert_eq!(mutual_info_cost(&frame, &tables), 0.0);
    }

    #[test]
    fn entropy_of_uniform_mass() {
        let p = vec![0.25; 4];
        approx::assert_relative_eq!(entropy(&p), 2.0);
    }
}
