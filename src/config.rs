//! Tunable constants for the pose estimator, calibration transformer, and
//! offline preprocessor, collected in one place the way this crate's
//! original sensor-fusion layer collected its filter tunables in a single
//! `FusionConfig`.

/// Every numeric knob named by the estimator and preprocessor, gathered so
/// none of it is a literal scattered through `ekf.rs`/`preprocessor.rs`.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Largest accepted `predict` timestep, in seconds. Longer gaps (tab
    /// suspend, clock jump) are treated as a no-op rather than integrated.
    pub max_dt: f64,

    /// Device-frame acceleration magnitude below which a sample counts
    /// toward the stationary run, in m/s².
    pub zupt_accel_threshold: f64,

    /// Consecutive below-threshold samples required before a ZUPT fires.
    pub zupt_frames_required: u32,

    /// Scalar measurement noise `R` for the ZUPT velocity observation.
    pub zupt_velocity_noise: f64,

    /// Gain applied to the magnetometer heading error when rotating
    /// horizontal velocity toward the reference heading.
    pub heading_correction_gain: f64,

    /// Minimum horizontal speed, in m/s, before a heading correction is
    /// allowed to act (below this, noise would dominate the correction).
    pub heading_correction_min_speed: f64,

    /// Process noise diagonal `[pos(3), vel(3), bias(3)]`.
    pub process_noise_diag: [f64; 9],

    /// Initial covariance diagonal `[pos(3), vel(3), bias(3)]`.
    pub initial_covariance_diag: [f64; 9],

    /// Samples averaged per calibration step.
    pub calibration_samples_per_step: usize,

    /// Emit a progress event every this-many samples within a step.
    pub calibration_progress_stride: usize,

    /// Default replay frame rate used by the offline preprocessor, in Hz.
    pub default_frame_rate_hz: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_dt: 1.0,
            zupt_accel_threshold: 0.3,
            zupt_frames_required: 5,
            zupt_velocity_noise: 1e-3,
            heading_correction_gain: 0.05,
            heading_correction_min_speed: 0.1,
            process_noise_diag: [
                1e-3, 1e-3, 1e-3, // position
                1e-1, 1e-1, 1e-1, // velocity
                1e-4, 1e-4, 1e-4, // accel bias
            ],
            initial_covariance_diag: [
                1e-1, 1e-1, 1e-1, // position
                1e-2, 1e-2, 1e-2, // velocity
                1e-2, 1e-2, 1e-2, // accel bias
            ],
            calibration_samples_per_step: 25,
            calibration_progress_stride: 5,
            default_frame_rate_hz: 60.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.max_dt, 1.0);
        assert_eq!(cfg.zupt_frames_required, 5);
        assert_eq!(cfg.calibration_samples_per_step, 25);
        assert_eq!(cfg.default_frame_rate_hz, 60.0);
    }
}
