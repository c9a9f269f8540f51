//! Linear algebra kernel: fixed-size matrix/vector types and the quaternion
//! and angle primitives shared by the calibration transformer and the EKF.
//!
//! Dense 9-state blocks use `nalgebra`'s statically-sized `SMatrix`/`SVector`
//! the same way this crate's filter layer type-aliases `StateMat15`/
//! `StateVec15` for its larger Kalman filters.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};

/// State/covariance dimension shared by position, velocity, and accel bias.
pub const STATE_DIM: usize = 9;

pub type Vec9 = SVector<f64, STATE_DIM>;
pub type Mat9 = SMatrix<f64, STATE_DIM, STATE_DIM>;

/// 9x9 identity, row-major by construction (nalgebra stores column-major
/// internally but the identity is symmetric so the distinction is moot).
pub fn mat9_identity() -> Mat9 {
    Mat9::identity()
}

/// 9x9 diagonal matrix from a 9-element diagonal.
pub fn mat9_diagonal(d: [f64; STATE_DIM]) -> Mat9 {
    Mat9::from_diagonal(&Vec9::from(d))
}

pub fn mat9_add(a: &Mat9, b: &Mat9) -> Mat9 {
    a + b
}

pub fn mat9_mul(a: &Mat9, b: &Mat9) -> Mat9 {
    a * b
}

pub fn mat9_transpose(a: &Mat9) -> Mat9 {
    a.transpose()
}

pub fn mat9_scale(a: &Mat9, s: f64) -> Mat9 {
    a * s
}

/// Inverts a 3x3 matrix by cofactor expansion. Returns `None` when
/// `|det| < 1e-10` rather than dividing by a near-zero determinant.
pub fn mat3_invert(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let det = m.determinant();
    if det.abs() < 1e-10 {
        return None;
    }

    let c00 = m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)];
    let c01 = m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)];
    let c02 = m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)];
    let c10 = m[(0, 2)] * m[(2, 1)] - m[(0, 1)] * m[(2, 2)];
    let c11 = m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)];
    let c12 = m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)];
    let c20 = m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)];
    let c21 = m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)];
    let c22 = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)];

    let inv_det = 1.0 / det;
    Some(Matrix3::new(
        c00 * inv_det,
        c10 * inv_det,
        c20 * inv_det,
        c01 * inv_det,
        c11 * inv_det,
        c21 * inv_det,
        c02 * inv_det,
        c12 * inv_det,
        c22 * inv_det,
    ))
}

/// Unit quaternion, `(w, x, y, z)` with `w` first, Hamilton convention.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const fn identity() -> Self {
        Self { w: 1.0, x: 0.0, y: 0.0, z: 0.0 }
    }

    pub const fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn normalized(&self) -> Self {
        let n = self.norm();
        if n < 1e-12 {
            return Self::identity();
        }
        Self::new(self.w / n, self.x / n, self.y / n, self.z / n)
    }

    pub fn dot(&self, other: &Self) -> f64 {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn neg(&self) -> Self {
        Self::new(-self.w, -self.x, -self.y, -self.z)
    }

    pub fn conjugate(&self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Hamilton product `self ⊗ other`.
    pub fn mul(&self, other: &Self) -> Self {
        Self::new(
            self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        )
    }

    /// Canonicalizes sign so that `dot(self, prev) >= 0`, for interpolation
    /// continuity across a stream of orientation samples.
    pub fn canonicalized_toward(&self, prev: &Self) -> Self {
        if self.dot(prev) < 0.0 {
            self.neg()
        } else {
            *self
        }
    }
}

/// Rotates `v` (in the quaternion's native frame) into the world frame via
/// `q ⊗ (0, v) ⊗ q⁻¹`.
pub fn quat_rotate(v: Vector3<f64>, q: Quaternion) -> Vector3<f64> {
    let qv = Quaternion::new(0.0, v.x, v.y, v.z);
    let q_inv = q.conjugate();
    let rotated = q.mul(&qv).mul(&q_inv);
    Vector3::new(rotated.x, rotated.y, rotated.z)
}

/// Spherical linear interpolation between two unit quaternions.
///
/// Normalizes inputs, negates `b` if `dot(a, b) < 0` (shortest path), and
/// falls back to normalized linear interpolation when the quaternions are
/// nearly parallel (`dot > 0.9995`) to avoid dividing by a near-zero sine.
pub fn quat_slerp(a: Quaternion, b: Quaternion, t: f64) -> Quaternion {
    let a = a.normalized();
    let mut b = b.normalized();
    let mut dot = a.dot(&b);

    if dot < 0.0 {
        b = b.neg();
        dot = -dot;
    }

    if dot > 0.9995 {
        let w = a.w + t * (b.w - a.w);
        let x = a.x + t * (b.x - a.x);
        let y = a.y + t * (b.y - a.y);
        let z = a.z + t * (b.z - a.z);
        return Quaternion::new(w, x, y, z).normalized();
    }

    let theta_0 = dot.acos();
    let theta = theta_0 * t;
    let sin_theta_0 = theta_0.sin();
    let sin_theta = theta.sin();

    let s0 = theta.cos() - dot * sin_theta / sin_theta_0;
    let s1 = sin_theta / sin_theta_0;

    Quaternion::new(
        s0 * a.w + s1 * b.w,
        s0 * a.x + s1 * b.x,
        s0 * a.y + s1 * b.y,
        s0 * a.z + s1 * b.z,
    )
}

/// Wraps an angle into `[-pi, pi]`.
pub fn normalize_angle(theta: f64) -> f64 {
    let two_pi = std::f64::consts::TAU;
    let mut a = theta % two_pi;
    if a > std::f64::consts::PI {
        a -= two_pi;
    } else if a < -std::f64::consts::PI {
        a += two_pi;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quat_rotate_preserves_norm() {
        let q = Quaternion::new(0.7071067811865476, 0.0, 0.7071067811865476, 0.0);
        let v = Vector3::new(1.0, 2.0, 3.0);
        let rotated = quat_rotate(v, q);
        assert_relative_eq!(rotated.norm(), v.norm(), epsilon = 1e-12);
    }

    #[test]
    fn quat_rotate_90_about_y() {
        let q = Quaternion::new(
            std::f64::consts::FRAC_1_SQRT_2,
            0.0,
            std::f64::consts::FRAC_1_SQRT_2,
            0.0,
        );
        let rotated = quat_rotate(Vector3::new(0.0, 0.0, 1.0), q);
        assert_relative_eq!(rotated.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(rotated.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(rotated.z, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn slerp_endpoints_and_identity() {
        let a = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let b = Quaternion::new(
            std::f64::consts::FRAC_1_SQRT_2,
            0.0,
            std::f64::consts::FRAC_1_SQRT_2,
            0.0,
        );
        let at0 = quat_slerp(a, b, 0.0);
        let at1 = quat_slerp(a, b, 1.0);
        assert_relative_eq!(at0.w, a.w, epsilon = 1e-9);
        assert_relative_eq!(at1.w, b.w, epsilon = 1e-9);

        for t in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let same = quat_slerp(a, a, t);
            assert_relative_eq!(same.w, a.w, epsilon = 1e-9);
            assert_relative_eq!(same.x, a.x, epsilon = 1e-9);
        }
    }

    #[test]
    fn normalize_angle_periodicity() {
        let theta = 0.4;
        for k in -3..=3 {
            let shifted = theta + (k as f64) * std::f64::consts::TAU;
            assert_relative_eq!(
                normalize_angle(shifted),
                normalize_angle(theta),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn mat3_invert_singular_returns_none() {
        let m = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 1.0, 1.0, 1.0);
        assert!(mat3_invert(&m).is_none());
    }

    #[test]
    fn mat3_invert_identity() {
        let m = Matrix3::identity();
        let inv = mat3_invert(&m).unwrap();
        assert_relative_eq!(inv, m, epsilon = 1e-12);
    }
}
