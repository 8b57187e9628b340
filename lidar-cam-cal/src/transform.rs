//! Codec between the 6-vector transform parameterization and (R, T).
//!
//! `tau[0..3]` is an axis-angle rotation vector (the norm is the rotation
//! angle in radians), `tau[3..6]` is the translation in meters.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3, Vector6};

pub type Tau = Vector6<f64>;

/// Convert a parameter vector to a rotation matrix and translation.
pub fn tau_to_rt(tau: &Tau) -> (Rotation3<f64>, Vector3<f64>) {
    let axisangle = Vector3::new(tau[0], tau[1], tau[2]);
    let rot = UnitQuaternion::new(axisangle).to_rotation_matrix();
    let trans = Vector3::new(tau[3], tau[4], tau[5]);
    (rot, trans)
}

/// Convert (R, T) back to the parameter vector.
///
/// Of the two equivalent axis-angle representations the one with angle in
/// `[0, pi]` is returned, so `rt_to_tau(tau_to_rt(tau))` round-trips
/// exactly for rotation angles below pi.
pub fn rt_to_tau(rot: &Rotation3<f64>, trans: &Vector3<f64>) -> Tau {
    let quat = UnitQuaternion::from_rotation_matrix(rot);
    // A quaternion with negative scalar part encodes the same rotation
    // with angle > pi; flip it to stay on the short side.
    let quat = if quat.w < 0.0 {
        UnitQuaternion::from_quaternion(-quat.into_inner())
    } else {
        quat
    };
    let axisangle = quat.scaled_axis();
    Tau::new(
        axisangle.x,
        axisangle.y,
        axisangle.z,
        trans.x,
        trans.y,
        trans.z,
    )
}

/// The skew-symmetric cross-product matrix `[v]_x`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Left Jacobian of SO(3) at the axis-angle vector `omega`.
///
/// `J_L = I + (1-cos t)/t^2 [w]_x + (t-sin t)/t^3 [w]_x^2` with a series
/// expansion below the angle where the closed form loses precision.
pub fn left_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let k = skew(omega);
    let k2 = k * k;
    if theta < 1e-6 {
        Matrix3::identity() + k * 0.5 + k2 * (1.0 / 6.0)
    } else {
        let t2 = theta * theta;
        Matrix3::identity()
            + k * ((1.0 - theta.cos()) / t2)
            + k2 * ((theta - theta.sin()) / (t2 * theta))
    }
}
