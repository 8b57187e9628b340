//! Reprojection cost over hand-picked 2D/3D correspondences.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::project::{Intrinsics, MIN_CAMERA_Z};
use crate::transform::{tau_to_rt, Tau};
use crate::{CalibError, Result};

/// User-picked pixel/point pairs for one frame. Immutable after
/// selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Correspondences {
    pub pixels: Vec<[f64; 2]>,
    pub points: Vec<[f64; 3]>,
}

impl Correspondences {
    pub fn new(pixels: Vec<[f64; 2]>, points: Vec<[f64; 3]>) -> Result<Self> {
        if pixels.len() != points.len() {
            return Err(CalibError::InvalidConfig(format!(
                "{} picked pixels but {} picked points",
                pixels.len(),
                points.len()
            )));
        }
        Ok(Self { pixels, points })
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Soft-L1 robustifier: linear up to 5 px, quadratic beyond. Gross
/// misalignment is penalized hard, sub-pixel jitter barely at all.
fn soft_l1(d: f64) -> f64 {
    if d <= 5.0 {
        d
    } else {
        d * d
    }
}

/// Correspondence cost for one frame.
///
/// Per pair, the L1 distance between the picked pixel and the projection
/// of the picked lidar point; the robustified average is offset by
/// `-3 sqrt(W^2 + H^2)` so the term stays negative and in scale with the
/// other costs. Empty correspondences contribute zero.
pub fn correspondence_cost(
    corr: &Correspondences,
    tau: &Tau,
    k: &Intrinsics,
    width: usize,
    height: usize,
) -> f64 {
    if corr.is_empty() {
        return 0.0;
    }
    let (rot, trans) = tau_to_rt(tau);
    let mut sum = 0.0;
    for (pix, pt) in corr.pixels.iter().zip(corr.points.iter()) {
        let p = Point3::new(pt[0], pt[1], pt[2]);
        let c = rot * p.coords + trans;
        let z = c.z.max(MIN_CAMERA_Z);
        let proj = Point2::new(k.fx * c.x / z + k.cx, k.fy * c.y / z + k.cy);
        let d = (pix[0] - proj.x).abs() + (pix[1] - proj.y).abs();
        sum += soft_l1(d);
    }
    let avg = sum / corr.len() as f64;
    let offset = 3.0 * ((width * width + height * height) as f64).sqrt();
    -offset + 3.0 * avg
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn k() -> Intrinsics {
        Intrinsics {
            fx: 100.0,
            fy: 100.0,
            cx: 50.0,
            cy: 50.0,
        }
    }

    #[test]
    fn perfect_pair_hits_the_offset() {
        let tau = Tau::zeros();
        // point at (0.1, 0.2, 1.0) projects to (60, 70)
        let corr = Correspondences::new(vec![[60.0, 70.0]], vec![[0.1, 0.2, 1.0]]).unwrap();
        let cost = correspondence_cost(&corr, &tau, &k(), 100, 80);
        let expected = -3.0 * ((100.0f64 * 100.0 + 80.0 * 80.0).sqrt());
        assert_relative_eq!(cost, expected, epsilon = 1e-9);
    }

    #[test]
    fn large_residuals_go_quadratic() {
        let tau = Tau::zeros();
        // projected (60, 70), picked 10 px off in u: L1 distance 10 -> 100
        let corr = Correspondences::new(vec![[70.0, 70.0]], vec![[0.1, 0.2, 1.0]]).unwrap();
        let cost = correspondence_cost(&corr, &tau, &k(), 100, 80);
        let offset = 3.0 * ((100.0f64 * 100.0 + 80.0 * 80.0).sqrt());
        assert_relative_eq!(cost, -offset + 300.0, epsilon = 1e-9);
    }

    #[test]
    fn small_residuals_stay_linear() {
        let tau = Tau::zeros();
        let corr = Correspondences::new(vec![[62.0, 70.0]], vec![[0.1, 0.2, 1.0]]).unwrap();
        let cost = correspondence_cost(&corr, &tau, &k(), 100, 80);
        let offset = 3.0 * ((100.0f64 * 100.0 + 80.0 * 80.0).sqrt());
        assert_relative_eq!(cost, -offset + 6.0, epsilon = 1e-9);
    }

    #[test]
    fn empty_contributes_zero() {
        let corr = Correspondences::default();
        assert_eq!(correspondence_cost(&corr, &Tau::zeros(), &k(), 100, 80), 0.0);
    }

    #[test]
    fn mismatched_pairs_rejected() {
        assert!(Correspondences::new(vec![[0.0, 0.0]], vec![]).is_err());
    }
}
