//! Gaussian-kernel alignment cost between projected lidar edges and image
//! edge score maps, with its closed-form gradient.
//!
//! Every in-frustum lidar edge point spreads a Gaussian kernel over the
//! image-edge pixels inside its 3-sigma window; kernel mass accumulated on
//! strong image edges rewards alignment. The total is negated so the
//! optimizer minimizes.

use nalgebra::{Matrix3, Point3, Vector3, Vector6};

use crate::image_edge::ImageEdges;
use crate::pc_edge::PcEdges;
use crate::project::{FrameTables, Intrinsics, MIN_CAMERA_Z};
use crate::transform::{left_jacobian, skew, tau_to_rt, Tau};

#[derive(Debug, Clone, Copy)]
pub struct EdgeAlignParams {
    /// Kernel width in pixels (before optional depth scaling).
    pub sigma: f64,
    /// When set, the kernel tightens with range: `sigma / |cam_point|`.
    /// Distant points cover fewer pixels, so their kernels should too.
    pub scale_by_depth: bool,
}

impl EdgeAlignParams {
    fn sigma_for(&self, cam_point: &Vector3<f64>) -> f64 {
        if self.scale_by_depth {
            let range = cam_point.norm();
            if range > f64::EPSILON {
                return self.sigma / range;
            }
        }
        self.sigma
    }
}

struct Window {
    min_x: usize,
    max_x: usize,
    min_y: usize,
    max_y: usize,
}

fn kernel_window(mu_x: f64, mu_y: f64, sigma: f64, width: usize, height: usize) -> Window {
    let reach = 3.0 * sigma;
    Window {
        min_x: (mu_x - reach).floor().max(0.0) as usize,
        max_x: (((mu_x + reach).ceil() as usize) + 1).min(width),
        min_y: (mu_y - reach).floor().max(0.0) as usize,
        max_y: (((mu_y + reach).ceil() as usize) + 1).min(height),
    }
}

fn gaussian(dx: f64, dy: f64, sigma: f64) -> f64 {
    let norm = 1.0 / (sigma * (2.0 * std::f64::consts::PI).sqrt());
    norm * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
}

/// Alignment cost for one frame. More negative is better aligned.
pub fn edge_alignment_cost(
    tables: &FrameTables,
    pc_edges: &PcEdges,
    img_edges: &ImageEdges,
    params: &EdgeAlignParams,
) -> f64 {
    let mut total = 0.0;
    for &j in &pc_edges.idxs {
        if !tables.in_frustum[j] {
            continue;
        }
        let mu = tables.pixels[j];
        let sigma = params.sigma_for(&tables.cam_points[j]);
        if !(sigma.is_finite() && sigma > 0.0) {
            continue;
        }
        let win = kernel_window(mu.x, mu.y, sigma, img_edges.width, img_edges.height);

        let mut n_edge = 0usize;
        for y in win.min_y..win.max_y {
            for x in win.min_x..win.max_x {
                n_edge += img_edges.is_edge(x, y) as usize;
            }
        }
        if n_edge == 0 {
            continue;
        }

        let w_i = pc_edges.scores[j];
        let mut acc = 0.0;
        for y in win.min_y..win.max_y {
            for x in win.min_x..win.max_x {
                if !img_edges.is_edge(x, y) {
                    continue;
                }
                let w_ij = 0.5 * (w_i + img_edges.score_at(x, y)) / n_edge as f64;
                acc += w_ij * gaussian(x as f64 - mu.x, y as f64 - mu.y, sigma);
            }
        }
        // bound each projection's contribution
        total += acc / (2.0 * n_edge as f64);
    }
    -total
}

/// Gradient of [`edge_alignment_cost`] with respect to tau, by chain rule
/// through the rotation (via the SO(3) left Jacobian), the pinhole
/// projection and the kernel mean. Same weights as the cost; returned
/// with the cost's sign so it is the true derivative of the negated sum.
pub fn edge_alignment_gradient(
    tau: &Tau,
    points: &[Point3<f64>],
    tables: &FrameTables,
    pc_edges: &PcEdges,
    img_edges: &ImageEdges,
    k: &Intrinsics,
    params: &EdgeAlignParams,
) -> Vector6<f64> {
    let (rot, _trans) = tau_to_rt(tau);
    let omega = Vector3::new(tau[0], tau[1], tau[2]);
    let jac_l = left_jacobian(&omega);

    let mut grad = Vector6::zeros();
    for &j in &pc_edges.idxs {
        if !tables.in_frustum[j] {
            continue;
        }
        let mu = tables.pixels[j];
        let cam = tables.cam_points[j];
        let sigma = params.sigma_for(&cam);
        if !(sigma.is_finite() && sigma > 0.0) {
            continue;
        }
        let win = kernel_window(mu.x, mu.y, sigma, img_edges.width, img_edges.height);

        let mut n_edge = 0usize;
        for y in win.min_y..win.max_y {
            for x in win.min_x..win.max_x {
                n_edge += img_edges.is_edge(x, y) as usize;
            }
        }
        if n_edge == 0 {
            continue;
        }

        // d(cam)/d(tau): rotation block -[R p]_x J_L, translation block I.
        let m: Matrix3<f64> = -skew(&(rot * points[j].coords)) * jac_l;
        let row = |r: usize, t: usize| {
            let mut d = Vector6::zeros();
            d[0] = m[(r, 0)];
            d[1] = m[(r, 1)];
            d[2] = m[(r, 2)];
            d[t] = 1.0;
            d
        };
        let dxc_dtau = row(0, 3);
        let dyc_dtau = row(1, 4);
        let dzc_dtau = row(2, 5);

        let z = cam.z.max(MIN_CAMERA_Z);
        let du_dxc = k.fx / z;
        let du_dzc = -k.fx * cam.x / (z * z);
        let dv_dyc = k.fy / z;
        let dv_dzc = -k.fy * cam.y / (z * z);

        let du_dtau = dxc_dtau * du_dxc + dzc_dtau * du_dzc;
        let dv_dtau = dyc_dtau * dv_dyc + dzc_dtau * dv_dzc;

        let w_i = pc_edges.scores[j];
        let mut acc = Vector6::zeros();
        for y in win.min_y..win.max_y {
            for x in win.min_x..win.max_x {
                if !img_edges.is_edge(x, y) {
                    continue;
                }
                let dx = x as f64 - mu.x;
                let dy = y as f64 - mu.y;
                let g = gaussian(dx, dy, sigma);
                let w_ij = 0.5 * (w_i + img_edges.score_at(x, y)) / n_edge as f64;
                // d g / d mu
                let dg_du = g * dx / (sigma * sigma);
                let dg_dv = g * dy / (sigma * sigma);
                acc += (du_dtau * dg_du + dv_dtau * dg_dv) * w_ij;
            }
        }
        grad += acc / (2.0 * n_edge as f64);
    }
    -grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    fn single_point_tables(pixel: Point2<f64>, cam: Vector3<f64>) -> FrameTables {
        FrameTables {
            cam_points: vec![cam],
            pixels: vec![pixel],
            in_frustum: vec![true],
            n_in_frustum: 1,
        }
    }

    fn unit_edges() -> PcEdges {
        PcEdges {
            scores: vec![1.0],
            mask: vec![true],
            idxs: vec![0],
        }
    }

    fn single_pixel_image(w: usize, h: usize, x: usize, y: usize) -> ImageEdges {
        let mut mask = vec![false; w * h];
        let mut score = vec![0.0; w * h];
        mask[y * w + x] = true;
        score[y * w + x] = 1.0;
        ImageEdges {
            width: w,
            height: h,
            mask,
            score,
        }
    }

    #[test]
    fn single_point_kernel_value() {
        // A perfectly aligned unit-score pair with sigma 2 contributes
        // -(1 / (sigma sqrt(2 pi))) / 2.
        let tables = single_point_tables(Point2::new(10.0, 10.0), Vector3::new(0.0, 0.0, 1.0));
        let params = EdgeAlignParams {
            sigma: 2.0,
            scale_by_depth: false,
        };
        let img = single_pixel_image(32, 32, 10, 10);
        let cost = edge_alignment_cost(&tables, &unit_edges(), &img, &params);
        let expected = -1.0 / (2.0 * (2.0 * std::f64::consts::PI).sqrt()) / 2.0;
        assert_relative_eq!(cost, expected, epsilon = 1e-4);
        assert_relative_eq!(cost, -0.0997, epsilon = 5e-5);
    }

    #[test]
    fn depth_scaling_tightens_kernel() {
        let params = EdgeAlignParams {
            sigma: 2.0,
            scale_by_depth: true,
        };
        // range 2 halves sigma, raising the peak value
        let tables = single_point_tables(Point2::new(10.0, 10.0), Vector3::new(0.0, 0.0, 2.0));
        let img = single_pixel_image(32, 32, 10, 10);
        let cost = edge_alignment_cost(&tables, &unit_edges(), &img, &params);
        let expected = -1.0 / (1.0 * (2.0 * std::f64::consts::PI).sqrt()) / 2.0;
        assert_relative_eq!(cost, expected, epsilon = 1e-9);
    }

    #[test]
    fn empty_edge_set_contributes_zero() {
        let tables = single_point_tables(Point2::new(10.0, 10.0), Vector3::new(0.0, 0.0, 1.0));
        let params = EdgeAlignParams {
            sigma: 2.0,
            scale_by_depth: false,
        };
        let img = ImageEdges {
            width: 32,
            height: 32,
            mask: vec![false; 32 * 32],
            score: vec![0.0; 32 * 32],
        };
        assert_eq!(
            edge_alignment_cost(&tables, &unit_edges(), &img, &params),
            0.0
        );
        let empty = PcEdges::empty(1);
        let img2 = single_pixel_image(32, 32, 10, 10);
        assert_eq!(edge_alignment_cost(&tables, &empty, &img2, &params), 0.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        // One edge point, several image edge pixels, fixed sigma. The
        // kernel mean is kept away from half-integer window boundaries so
        // the window contents do not change under the probe step.
        let k = Intrinsics {
            fx: 100.0,
            fy: 100.0,
            cx: 16.0,
            cy: 16.0,
        };
        let points = vec![Point3::new(0.3, -0.2, 5.0)];
        let tau = Tau::new(0.02, -0.01, 0.03, 0.1, -0.05, 0.2);
        let params = EdgeAlignParams {
            sigma: 2.0,
            scale_by_depth: false,
        };

        let mut img = single_pixel_image(64, 64, 20, 12);
        img.mask[13 * 64 + 21] = true;
        img.score[13 * 64 + 21] = 0.7;
        img.mask[11 * 64 + 19] = true;
        img.score[11 * 64 + 19] = 0.4;

        let edges = unit_edges();
        let cost_at = |t: &Tau| {
            let tables = crate::project::project_frame(t, &k, 64, 64, &points);
            edge_alignment_cost(&tables, &edges, &img, &params)
        };

        let tables = crate::project::project_frame(&tau, &k, 64, 64, &points);
        assert!(tables.in_frustum[0]);
        let grad = edge_alignment_gradient(&tau, &points, &tables, &edges, &img, &k, &params);

        let h = 1e-6;
        for i in 0..6 {
            let mut lo = tau;
            let mut hi = tau;
            lo[i] -= h;
            hi[i] += h;
            let fd = (cost_at(&hi) - cost_at(&lo)) / (2.0 * h);
            assert_relative_eq!(grad[i], fd, epsilon = 1e-6, max_relative = 1e-4);
        }
    }
}
