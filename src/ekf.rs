//! Nine-state Extended Kalman Filter (C3): double-integrates gravity
//! compensated, world-rotated acceleration into position and velocity,
//! estimates a slowly-varying accelerometer bias, and corrects drift with
//! Zero-Velocity Updates and a heuristic magnetometer heading rotation.
//!
//! Orientation is not a filter state — it is supplied by the caller every
//! step, consumed from whatever upstream sensor fusion produced the fused
//! quaternion. This halves the state dimension relative to a textbook
//! attitude-coupled EKF and keeps the prediction Jacobian sparse.

use nalgebra::{Matrix3, Vector3};

use crate::config::TrackerConfig;
use crate::error::TrackerEvent;
use crate::linalg::{mat3_invert, mat9_diagonal, quat_rotate, Mat9, Quaternion, Vec9};

/// Last-observed orientation, update clock, and the ZUPT/heading bookkeeping
/// that rides alongside the state vector and covariance.
#[derive(Clone, Debug, Default)]
pub struct EkfAuxState {
    pub last_orientation: Option<Quaternion>,
    pub last_update_ms: Option<i64>,
    pub stationary_counter: u32,
    pub reference_heading: Option<f64>,
}

/// The nine-state filter: `x = [p(3) v(3) b(3)]`, covariance `P` (9x9).
pub struct Ekf {
    x: Vec9,
    p: Mat9,
    aux: EkfAuxState,
    config: TrackerConfig,
}

impl Default for Ekf {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Ekf {
    pub fn new(config: TrackerConfig) -> Self {
        let p = mat9_diagonal(config.initial_covariance_diag);
        Self { x: Vec9::zeros(), p, aux: EkfAuxState::default(), config }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x[0], self.x[1], self.x[2])
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.x[3], self.x[4], self.x[5])
    }

    pub fn bias(&self) -> Vector3<f64> {
        Vector3::new(self.x[6], self.x[7], self.x[8])
    }

    pub fn covariance(&self) -> &Mat9 {
        &self.p
    }

    pub fn aux(&self) -> &EkfAuxState {
        &self.aux
    }

    /// Wall-clock prediction: computes `dt` from `now_ms` and the last call's
    /// timestamp. The very first call has no prior timestamp to difference
    /// against, so it only seeds the clock and leaves the state untouched.
    pub fn predict(
        &mut self,
        a_device: Vector3<f64>,
        q: Quaternion,
        now_ms: i64,
    ) -> (Vector3<f64>, Option<TrackerEvent>) {
        let dt = match self.aux.last_update_ms {
            None => {
                self.aux.last_update_ms = Some(now_ms);
                return (self.position(), None);
            }
            Some(last) => (now_ms - last) as f64 / 1000.0,
        };
        self.aux.last_update_ms = Some(now_ms);
        self.predict_with_dt(a_device, q, dt)
    }

    /// Deterministic prediction with an explicit `dt`, used by the offline
    /// preprocessor so replay is independent of wall-clock timing.
    ///
    /// Skips integration (but still records nothing) when `dt` is
    /// non-positive or exceeds [`TrackerConfig::max_dt`] — the same guard
    /// that protects the wall-clock path against tab-suspend and clock jumps.
    pub fn predict_with_dt(
        &mut self,
        a_device: Vector3<f64>,
        q: Quaternion,
        dt: f64,
    ) -> (Vector3<f64>, Option<TrackerEvent>) {
        if dt <= 0.0 || dt > self.config.max_dt {
            return (self.position(), Some(TrackerEvent::NonMonotonicTime { dt }));
        }

        self.aux.last_orientation = Some(q);

        let a_world = quat_rotate(a_device, q);
        let a_corrected = a_world - self.bias();

        let pos = self.position();
        let vel = self.velocity();
        let dt2 = dt * dt;

        let new_pos = pos + vel * dt + a_corrected * (0.5 * dt2);
        let new_vel = vel + a_corrected * dt;
        self.x[0] = new_pos.x;
        self.x[1] = new_pos.y;
        self.x[2] = new_pos.z;
        self.x[3] = new_vel.x;
        self.x[4] = new_vel.y;
        self.x[5] = new_vel.z;

        let mut f = Mat9::identity();
        for i in 0..3 {
            f[(i, 3 + i)] = dt;
            f[(i, 6 + i)] = -0.5 * dt2;
            f[(3 + i, 6 + i)] = -dt;
        }
        let q_mat = mat9_diagonal(self.config.process_noise_diag);
        self.p = f * self.p * f.transpose() + q_mat * dt;

        if a_device.norm() < self.config.zupt_accel_threshold {
            self.aux.stationary_counter += 1;
        } else {
            self.aux.stationary_counter = 0;
        }

        let event = if self.aux.stationary_counter >= self.config.zupt_frames_required {
            self.zupt()
        } else {
            None
        };

        (self.position(), event)
    }

    /// Zero-Velocity Update: observes `z = 0` on velocity. Skips (leaving
    /// state and covariance untouched) when the innovation covariance is
    /// singular; the stationary counter is left running so the next sample
    /// retries. No explicit symmetrization of `P` is performed, per the
    /// estimator's original asymmetric-but-preserved formula.
    fn zupt(&mut self) -> Option<TrackerEvent> {
        let mut p_vv = Matrix3::zeros();
        for i in 0..3 {
            for j in 0..3 {
                p_vv[(i, j)] = self.p[(3 + i, 3 + j)];
            }
        }
        let s = p_vv + Matrix3::identity() * self.config.zupt_velocity_noise;

        let s_inv = match mat3_invert(&s) {
            Some(inv) => inv,
            None => return Some(TrackerEvent::SingularMatrix),
        };

        // K = P[:, 3..6] * S^-1, a 9x3 gain.
        let mut k = [[0.0; 3]; 9];
        for i in 0..9 {
            for j in 0..3 {
                let mut sum = 0.0;
                for m in 0..3 {
                    sum += self.p[(i, 3 + m)] * s_inv[(m, j)];
                }
                k[i][j] = sum;
            }
        }

        let v = self.velocity();
        for i in 0..9 {
            self.x[i] -= k[i][0] * v.x + k[i][1] * v.y + k[i][2] * v.z;
        }

        // P <- P - K * P[3..6, :] using the pre-update P for both operands.
        let p_before = self.p;
        for i in 0..9 {
            for j in 0..9 {
                let mut sum = 0.0;
                for m in 0..3 {
                    sum += k[i][m] * p_before[(3 + m, j)];
                }
                self.p[(i, j)] -= sum;
            }
        }

        Some(TrackerEvent::ZuptApplied)
    }

    /// Rotates horizontal velocity toward a one-shot reference heading
    /// established from the first magnetometer reading. This is a heuristic
    /// rotation, not a Kalman observation: it never touches position or
    /// covariance, by design (see the estimator's design notes).
    pub fn magnetometer_update(&mut self, m: Vector3<f64>) -> Option<TrackerEvent> {
        let q = match self.aux.last_orientation {
            Some(q) => q,
            None => return Some(TrackerEvent::OrientationAbsent),
        };

        let m_world = quat_rotate(m, q);
        let mut psi = m_world.x.atan2(m_world.z);
        if psi < 0.0 {
            psi += std::f64::consts::TAU;
        }

        let psi_ref = match self.aux.reference_heading {
            Some(r) => r,
            None => {
                self.aux.reference_heading = Some(psi);
                return None;
            }
        };

        let delta = crate::linalg::normalize_angle(psi - psi_ref);
        let vel = self.velocity();
        let speed = (vel.x * vel.x + vel.z * vel.z).sqrt();
        if speed < self.config.heading_correction_min_speed {
            return None;
        }

        let alpha = self.config.heading_correction_gain * delta;
        let (sin_a, cos_a) = alpha.sin_cos();
        let new_vx = vel.x * cos_a - vel.z * sin_a;
        let new_vz = vel.x * sin_a + vel.z * cos_a;
        self.x[3] = new_vx;
        self.x[5] = new_vz;
        None
    }

    /// Re-initializes state to the origin, nominal covariance, and clears
    /// orientation/counters/reference heading — bit-identical to a freshly
    /// constructed filter (modulo `last_update_ms`, which a fresh filter has
    /// never set either, so it matches too).
    pub fn reset(&mut self) {
        self.x = Vec9::zeros();
        self.p = mat9_diagonal(self.config.initial_covariance_diag);
        self.aux = EkfAuxState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn identity_quat() -> Quaternion {
        Quaternion::identity()
    }

    #[test]
    fn s1_pure_rest_stays_at_origin_and_zupts() {
        let mut ekf = Ekf::default();
        let mut zupt_seen = false;
        for _ in 0..50 {
            let (_, event) = ekf.predict_with_dt(Vector3::zeros(), identity_quat(), 0.01);
            if matches!(event, Some(TrackerEvent::ZuptApplied)) {
                zupt_seen = true;
            }
        }
        let pos = ekf.position();
        assert_relative_eq!(pos.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(pos.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(pos.z, 0.0, epsilon = 1e-9);
        assert!(zupt_seen);
        assert!(ekf.velocity().norm() < 1e-6);
    }

    #[test]
    fn s2_constant_acceleration_along_x() {
        let mut ekf = Ekf::default();
        for _ in 0..100 {
            ekf.predict_with_dt(Vector3::new(1.0, 0.0, 0.0), identity_quat(), 0.01);
        }
        let pos = ekf.position();
        assert_relative_eq!(pos.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(pos.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(pos.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn s3_rotated_frame_free_motion() {
        let mut ekf = Ekf::default();
        let half = std::f64::consts::FRAC_1_SQRT_2;
        let q = Quaternion::new(half, 0.0, half, 0.0);
        for _ in 0..100 {
            ekf.predict_with_dt(Vector3::new(0.0, 0.0, 1.0), q, 0.01);
        }
        let pos = ekf.position();
        assert_relative_eq!(pos.x, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn s5_magnetometer_heading_correction() {
        let mut ekf = Ekf::default();
        // Seed orientation and a known velocity without disturbing it via ZUPT.
        ekf.aux.last_orientation = Some(identity_quat());
        ekf.x[3] = 1.0;
        ekf.x[5] = 0.0;

        // First reading establishes the reference heading.
        ekf.magnetometer_update(Vector3::new(0.0, 0.0, 1.0));

        // A reading yielding a heading error of +0.2 rad: world-frame mag
        // pointing at angle 0.2 from +Z toward +X, with identity orientation
        // world == device frame.
        let psi = 0.2;
        let reading = Vector3::new(psi.sin(), 0.0, psi.cos());
        ekf.magnetometer_update(reading);

        let vel = ekf.velocity();
        let alpha = 0.05 * 0.2;
        let expected_x = 1.0 * alpha.cos();
        let expected_z = 1.0 * alpha.sin();
        assert_relative_eq!(vel.x, expected_x, epsilon = 1e-6);
        assert_relative_eq!(vel.z, expected_z, epsilon = 1e-6);
    }

    #[test]
    fn magnetometer_update_without_orientation_is_noop_event() {
        let mut ekf = Ekf::default();
        let event = ekf.magnetometer_update(Vector3::new(1.0, 0.0, 0.0));
        assert!(matches!(event, Some(TrackerEvent::OrientationAbsent)));
    }

    #[test]
    fn non_monotonic_dt_skips_integration() {
        let mut ekf = Ekf::default();
        ekf.predict_with_dt(Vector3::new(1.0, 0.0, 0.0), identity_quat(), 0.01);
        let before = ekf.position();
        let (pos, event) = ekf.predict_with_dt(Vector3::new(1.0, 0.0, 0.0), identity_quat(), -0.01);
        assert_eq!(pos, before);
        assert!(matches!(event, Some(TrackerEvent::NonMonotonicTime { .. })));

        let (pos2, event2) = ekf.predict_with_dt(Vector3::new(1.0, 0.0, 0.0), identity_quat(), 5.0);
        assert_eq!(pos2, before);
        assert!(matches!(event2, Some(TrackerEvent::NonMonotonicTime { .. })));
    }

    #[test]
    fn covariance_diagonal_stays_nonnegative() {
        let mut ekf = Ekf::default();
        for i in 0..200 {
            let a = Vector3::new((i as f64 * 0.1).sin(), 0.3, -0.2);
            ekf.predict_with_dt(a, identity_quat(), 0.01);
        }
        for i in 0..9 {
            assert!(ekf.covariance()[(i, i)] >= 0.0);
        }
    }

    #[test]
    fn reset_matches_fresh_instance() {
        let mut ekf = Ekf::default();
        for _ in 0..20 {
            ekf.predict_with_dt(Vector3::new(0.5, 0.1, -0.2), identity_quat(), 0.01);
        }
        ekf.reset();
        let fresh = Ekf::default();
        assert_eq!(ekf.x, fresh.x);
        assert_eq!(ekf.p, fresh.p);
        assert_eq!(ekf.aux.stationary_counter, fresh.aux.stationary_counter);
        assert_eq!(ekf.aux.reference_heading, fresh.aux.reference_heading);
    }

    #[test]
    fn first_wall_clock_predict_is_a_noop() {
        let mut ekf = Ekf::default();
        let (pos, event) = ekf.predict(Vector3::new(9.0, 9.0, 9.0), identity_quat(), 1_000);
        assert_eq!(pos, Vector3::zeros());
        assert!(event.is_none());
        assert_eq!(ekf.aux.last_update_ms, Some(1_000));
    }
}
