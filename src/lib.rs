//! Inertial pose estimator: converts a stream of 9-DOF IMU samples (fused
//! orientation quaternion, gravity-compensated linear acceleration,
//! calibrated magnetometer) into a drift-controlled position/orientation
//! pose for real-time visualization and offline replay.
//!
//! Four pieces carry the tracking math, leaves first:
//! - [`linalg`] — the 9x9 dense matrix kernel, quaternion rotate/slerp, angle
//!   normalization.
//! - [`calibration`] — the six-direction axis-alignment calibration
//!   transformer.
//! - [`ekf`] — the nine-state EKF: predict/update, ZUPT, magnetometer
//!   heading correction.
//! - [`preprocessor`] — deterministic offline replay: run the EKF over a
//!   recording with explicit per-sample `dt`, resample to a fixed-rate track.
//!
//! Rendering, the BLE transport, the terminal UI, and sensor firmware are
//! external collaborators this crate does not model.

pub mod calibration;
pub mod config;
pub mod ekf;
pub mod error;
pub mod linalg;
pub mod preprocessor;
pub mod recording;

pub use calibration::{
    AxisAlignmentMatrix, CalibrationData, CalibrationStore, CalibrationTransformer,
    FileCalibrationStore, InMemoryCalibrationStore,
};
pub use config::TrackerConfig;
pub use ekf::Ekf;
pub use error::{TrackerError, TrackerEvent};
pub use linalg::Quaternion;
pub use preprocessor::{preprocess, ReplayFrame, ReplaySession};
pub use recording::{RecordingEvent, RecordingSession};
