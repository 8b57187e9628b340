//! Chamfer misalignment between projected lidar edges and image edges.
//!
//! The L2 distance transform of the inverted image edge mask (edge pixels
//! at zero, distance growing away from them) is sampled at every
//! in-frustum projected lidar edge pixel; the mean over all samples in
//! all frames is the cost. Exact transform via the two-pass
//! Felzenszwalb-Huttenlocher lower-envelope algorithm.

use crate::image_edge::ImageEdges;
use crate::pc_edge::PcEdges;
use crate::project::FrameTables;

/// Exact Euclidean distance to the nearest edge pixel, row-major.
/// `f64::INFINITY` everywhere when the mask is empty.
pub fn distance_transform(edges: &ImageEdges) -> Vec<f64> {
    let (w, h) = (edges.width, edges.height);
    let mut dt: Vec<f64> = edges
        .mask
        .iter()
        .map(|&m| if m { 0.0 } else { f64::INFINITY })
        .collect();

    let mut row = vec![0.0; w.max(h)];
    for y in 0..h {
        row[..w].copy_from_slice(&dt[y * w..(y + 1) * w]);
        dt_1d(&row[..w], &mut dt[y * w..(y + 1) * w]);
    }
    let mut col_in = vec![0.0; h];
    let mut col_out = vec![0.0; h];
    for x in 0..w {
        for y in 0..h {
            col_in[y] = dt[y * w + x];
        }
        dt_1d(&col_in, &mut col_out);
        for y in 0..h {
            dt[y * w + x] = col_out[y];
        }
    }
    for v in &mut dt {
        *v = v.sqrt();
    }
    dt
}

/// One-dimensional squared-distance transform by the lower envelope of
/// parabolas rooted at the input values.
fn dt_1d(f: &[f64], out: &mut [f64]) {
    let n = f.len();
    if n == 0 {
        return;
    }
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let mut k = 0usize;
    v[0] = 0;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;

    for q in 1..n {
        if f[q] == f64::INFINITY {
            continue;
        }
        loop {
            let p = v[k];
            let s = if f[p] == f64::INFINITY {
                // any parabola undercuts an infinite one everywhere
                f64::NEG_INFINITY
            } else {
                ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64)) / (2 * q - 2 * p) as f64
            };
            if s > z[k] {
                k += 1;
                v[k] = q;
                z[k] = s;
                z[k + 1] = f64::INFINITY;
                break;
            }
            if k == 0 {
                v[0] = q;
                z[0] = f64::NEG_INFINITY;
                z[1] = f64::INFINITY;
                break;
            }
            k -= 1;
        }
    }

    k = 0;
    for i in 0..n {
        while z[k + 1] < i as f64 {
            k += 1;
        }
        let p = v[k];
        let d = i as f64 - p as f64;
        out[i] = if f[p] == f64::INFINITY {
            f64::INFINITY
        } else {
            d * d + f[p]
        };
    }
}

/// Mean distance-to-image-edge over all projected lidar edge pixels of
/// all frames. Zero when nothing projects (or no image edges exist);
/// lower means the edge sets overlap better.
pub fn chamfer_cost(per_frame: &[(&FrameTables, &PcEdges, &ImageEdges, &[f64])]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (tables, pc_edges, img_edges, dt) in per_frame {
        for &j in &pc_edges.idxs {
            if !tables.in_frustum[j] {
                continue;
            }
            let px = tables.pixels[j];
            let x = (px.x.round() as usize).min(img_edges.width - 1);
            let y = (px.y.round() as usize).min(img_edges.height - 1);
            let d = dt[y * img_edges.width + x];
            if d.is_finite() {
                sum += d;
                count += 1;
            }
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Vector3};

    fn edges_with(pixels: &[(usize, usize)], w: usize, h: usize) -> ImageEdges {
        let mut mask = vec![false; w * h];
        let mut score = vec![0.0; w * h];
        for &(x, y) in pixels {
            mask[y * w + x] = true;
            score[y * w + x] = 1.0;
        }
        ImageEdges {
            width: w,
            height: h,
            mask,
            score,
        }
    }

    #[test]
    fn distance_from_single_edge_pixel() {
        let edges = edges_with(&[(5, 5)], 16, 16);
        let dt = distance_transform(&edges);
        assert_relative_eq!(dt[5 * 16 + 5], 0.0);
        assert_relative_eq!(dt[5 * 16 + 8], 3.0);
        assert_relative_eq!(dt[9 * 16 + 8], 5.0); // 3-4-5 triangle
        assert_relative_eq!(dt[5 * 16 + 0], 5.0);
    }

    #[test]
    fn distance_picks_nearest_of_two() {
        let edges = edges_with(&[(0, 0), (10, 0)], 16, 1);
        let dt = distance_transform(&edges);
        assert_relative_eq!(dt[4], 4.0);
        assert_relative_eq!(dt[6], 4.0);
        assert_relative_eq!(dt[15], 5.0);
    }

    #[test]
    fn empty_mask_is_infinite() {
        let edges = edges_with(&[], 8, 8);
        let dt = distance_transform(&edges);
        assert!(dt.iter().all(|d| d.is_infinite()));
    }

    fn tables_at(pixels: &[(f64, f64)]) -> (FrameTables, PcEdges) {
        let n = pixels.len();
        let tables = FrameTables {
            cam_points: vec![Vector3::new(0.0, 0.0, 5.0); n],
            pixels: pixels.iter().map(|&(x, y)| Point2::new(x, y)).collect(),
            in_frustum: vec![true; n],
            n_in_frustum: n,
        };
        let pc_edges = PcEdges {
            scores: vec![1.0; n],
            mask: vec![true; n],
            idxs: (0..n).collect(),
        };
        (tables, pc_edges)
    }

    #[test]
    fn coincident_edges_cost_zero_and_shift_grows() {
        let edges = edges_with(&[(4, 4), (12, 4), (20, 4)], 32, 16);
        let dt = distance_transform(&edges);

        let (aligned, pc) = tables_at(&[(4.0, 4.0), (12.0, 4.0), (20.0, 4.0)]);
        let cost0 = chamfer_cost(&[(&aligned, &pc, &edges, dt.as_slice())]);
        assert_relative_eq!(cost0, 0.0);

        let mut prev = cost0;
        for shift in [1.0, 2.0, 3.0] {
            let (shifted, pc) = tables_at(&[
                (4.0 + shift, 4.0),
                (12.0 + shift, 4.0),
                (20.0 + shift, 4.0),
            ]);
            let cost = chamfer_cost(&[(&shifted, &pc, &edges, dt.as_slice())]);
            assert!(cost > prev, "shift {shift}: {cost} <= {prev}");
            prev = cost;
        }
    }
}
