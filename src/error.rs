//! Error and event types for the pose estimator.
//!
//! Mirrors this crate's existing pattern of a dedicated event enum for
//! state-machine and recoverable-condition reporting (see the sensor-fusion
//! layer's `FusionEvent`): recoverable conditions are values the caller can
//! inspect or log, while the one hard refusal (an unreadable recording) is a
//! real `Result` error via `thiserror`.

use thiserror::Error;

use crate::calibration::CalibrationStep;

/// Hard-refusal errors. Everything else in the tracker recovers locally and
/// is reported, if at all, through [`TrackerEvent`].
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("recording has unsupported schema version {found}, expected {expected}")]
    InvalidRecordingSchema { found: i64, expected: i64 },

    #[error("recording event stream is empty")]
    EmptyRecording,
}

/// Recoverable conditions and calibration-transformer notifications, surfaced
/// as typed values rather than bare strings or silent swallowing.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerEvent {
    /// Calibration advanced to a new step; carries the instruction string
    /// shown to the operator.
    CalibrationStepChanged {
        step: CalibrationStep,
        instruction: String,
    },
    /// Progress within the current calibration step, in percent (0-100).
    CalibrationProgress { step: CalibrationStep, percent: u32 },
    /// Calibration was cancelled before completion.
    CalibrationCancelled,
    /// Calibration finished and was persisted.
    CalibrationCompleted,
    /// A persisted calibration blob failed the structural check on load and
    /// was treated as absent.
    MalformedPersistedCalibration,
    /// An axis difference in calibration data was zero; that axis's
    /// projected component is forced to zero rather than rejecting outright.
    DegenerateCalibrationAxis,
    /// ZUPT innovation covariance was singular; the update was skipped.
    SingularMatrix,
    /// `predict`/`predictWithDt` saw a non-positive or too-large `dt` and
    /// skipped integration, advancing only the update clock.
    NonMonotonicTime { dt: f64 },
    /// Magnetometer update called with no prior orientation recorded.
    OrientationAbsent,
    /// A ZUPT fired, driving velocity toward zero.
    ZuptApplied,
}
