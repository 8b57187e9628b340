//! Projection of lidar points into the camera image.
//!
//! Given the current transform this rebuilds, per frame, the camera-frame
//! points, pixel coordinates and in-frustum mask that every cost term
//! consumes. The projection is a pure function of `(tau, K, dims, points)`:
//! equal inputs produce bit-identical tables.

use nalgebra::{Matrix3, Point2, Point3, Vector3};

use crate::frame::Frame;
use crate::transform::{tau_to_rt, Tau};
use crate::{CalibError, Result};

/// Points closer to the image plane than this are treated as behind the
/// camera; avoids the pinhole singularity at z = 0.
pub const MIN_CAMERA_Z: f64 = 1e-3;

/// Pinhole intrinsics extracted from a 3x3 camera matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn from_matrix(k: &Matrix3<f64>) -> Result<Self> {
        let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
        if !(fx.is_finite() && fy.is_finite() && cx.is_finite() && cy.is_finite()) {
            return Err(CalibError::InvalidConfig(
                "camera matrix has non-finite entries".into(),
            ));
        }
        if fx <= 0.0 || fy <= 0.0 {
            return Err(CalibError::InvalidConfig(format!(
                "focal lengths must be positive (fx={fx}, fy={fy})"
            )));
        }
        Ok(Self { fx, fy, cx, cy })
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

/// Tables derived from one frame at the current transform. Parallel
/// arrays, one entry per lidar point.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTables {
    pub cam_points: Vec<Vector3<f64>>,
    pub pixels: Vec<Point2<f64>>,
    pub in_frustum: Vec<bool>,
    pub n_in_frustum: usize,
}

/// Degeneracy floor below which a projection is not trusted.
#[derive(Debug, Clone, Copy)]
pub struct FrustumFloor {
    /// Minimum fraction of each frame's points that must project inside.
    pub min_frac: f64,
    /// Minimum total in-frustum count across all frames.
    pub min_total: usize,
}

impl Default for FrustumFloor {
    fn default() -> Self {
        Self {
            min_frac: 0.10,
            min_total: 10_000,
        }
    }
}

/// Project one frame's points. Pure; never fails.
pub fn project_frame(
    tau: &Tau,
    k: &Intrinsics,
    width: usize,
    height: usize,
    points: &[Point3<f64>],
) -> FrameTables {
    let (rot, trans) = tau_to_rt(tau);
    let w = width as f64;
    let h = height as f64;

    let mut cam_points = Vec::with_capacity(points.len());
    let mut pixels = Vec::with_capacity(points.len());
    let mut in_frustum = Vec::with_capacity(points.len());
    let mut n_in = 0usize;

    for p in points {
        let c = rot * p.coords + trans;
        let (px, inside) = if c.z > MIN_CAMERA_Z {
            let u = k.fx * c.x / c.z + k.cx;
            let v = k.fy * c.y / c.z + k.cy;
            let inside = (0.0..=w).contains(&u) && (0.0..=h).contains(&v);
            (Point2::new(u, v), inside)
        } else {
            (Point2::new(-1.0, -1.0), false)
        };
        cam_points.push(c);
        pixels.push(px);
        in_frustum.push(inside);
        n_in += inside as usize;
    }

    FrameTables {
        cam_points,
        pixels,
        in_frustum,
        n_in_frustum: n_in,
    }
}

/// Project all frames, checking the degeneracy floor.
///
/// Returns [`CalibError::BadProjection`] when any frame drops below
/// `min_frac` of its points or the total drops below `min_total`; the
/// optimizer shell is the only intended catcher.
pub fn project_all(
    tau: &Tau,
    k: &Intrinsics,
    frames: &[Frame],
    floor: &FrustumFloor,
) -> Result<Vec<FrameTables>> {
    let mut tables = Vec::with_capacity(frames.len());
    let mut total_in = 0usize;
    let mut total = 0usize;
    for frame in frames {
        let t = project_frame(tau, k, frame.width(), frame.height(), &frame.points);
        total_in += t.n_in_frustum;
        total += frame.num_points();
        let min_count = (floor.min_frac * frame.num_points() as f64).ceil() as usize;
        if t.n_in_frustum < min_count {
            return Err(CalibError::BadProjection {
                in_frustum: t.n_in_frustum,
                total: frame.num_points(),
            });
        }
        tables.push(t);
    }
    if total_in < floor.min_total {
        return Err(CalibError::BadProjection {
            in_frustum: total_in,
            total,
        });
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn identity_k() -> Intrinsics {
        Intrinsics::from_matrix(&Matrix3::identity()).unwrap()
    }

    #[test]
    fn identity_transform_normalizes_by_depth() {
        let k = identity_k();
        let points = vec![
            Point3::new(1.0, 0.0, 5.0),
            Point3::new(0.0, 1.0, 5.0),
            Point3::new(0.0, 0.0, 5.0),
        ];
        let t = project_frame(&Tau::zeros(), &k, 2, 2, &points);
        assert_relative_eq!(t.pixels[0], Point2::new(0.2, 0.0));
        assert_relative_eq!(t.pixels[1], Point2::new(0.0, 0.2));
        assert_relative_eq!(t.pixels[2], Point2::new(0.0, 0.0));
        assert_eq!(t.n_in_frustum, 3);
    }

    #[test]
    fn reprojection_consistency() {
        // P1: re-projecting cam_points with K reproduces pixels.
        let k = Intrinsics {
            fx: 720.0,
            fy: 700.0,
            cx: 320.5,
            cy: 240.5,
        };
        let tau = Tau::new(0.1, -0.2, 0.05, 0.3, -0.1, 0.2);
        let points: Vec<Point3<f64>> = (0..50)
            .map(|i| {
                let i = i as f64;
                Point3::new(0.1 * i - 2.5, 0.07 * i - 1.5, 4.0 + 0.1 * i)
            })
            .collect();
        let t = project_frame(&tau, &k, 640, 480, &points);
        for i in 0..points.len() {
            if !t.in_frustum[i] {
                continue;
            }
            let c = t.cam_points[i];
            let u = k.fx * c.x / c.z + k.cx;
            let v = k.fy * c.y / c.z + k.cy;
            assert!((u - t.pixels[i].x).abs() < 1e-4);
            assert!((v - t.pixels[i].y).abs() < 1e-4);
        }
    }

    #[test]
    fn idempotent_over_equal_tau() {
        // P4: two projections at the same tau are bit-identical.
        let k = identity_k();
        let tau = Tau::new(0.01, 0.02, -0.03, 0.5, -0.5, 0.1);
        let points: Vec<Point3<f64>> = (0..100)
            .map(|i| Point3::new((i % 10) as f64 * 0.3, (i / 10) as f64 * 0.3, 5.0))
            .collect();
        let a = project_frame(&tau, &k, 64, 64, &points);
        let b = project_frame(&tau, &k, 64, 64, &points);
        assert_eq!(a, b);
    }

    #[test]
    fn behind_camera_is_rejected() {
        let k = identity_k();
        let points = vec![Point3::new(0.0, 0.0, -5.0)];
        let t = project_frame(&Tau::zeros(), &k, 10, 10, &points);
        assert_eq!(t.n_in_frustum, 0);
        assert!(!t.in_frustum[0]);
    }

    #[test]
    fn degenerate_projection_is_tagged() {
        let k = identity_k();
        let img = image::RgbImage::new(10, 10);
        let points: Vec<Point3<f64>> = (0..20).map(|_| Point3::new(0.0, 0.0, -5.0)).collect();
        let refl = vec![0.5; 20];
        let frame = Frame::new(img, points, refl).unwrap();
        let floor = FrustumFloor {
            min_frac: 0.1,
            min_total: 0,
        };
        match project_all(&Tau::zeros(), &k, std::slice::from_ref(&frame), &floor) {
            Err(CalibError::BadProjection { in_frustum, total }) => {
                assert_eq!(in_frustum, 0);
                assert_eq!(total, 20);
            }
            other => panic!("expected BadProjection, got {other:?}"),
        }
    }

    #[test]
    fn bad_camera_matrix_rejected() {
        let mut k = Matrix3::identity();
        k[(0, 0)] = -1.0;
        assert!(Intrinsics::from_matrix(&k).is_err());
        k[(0, 0)] = f64::NAN;
        assert!(Intrinsics::from_matrix(&k).is_err());
    }
}
