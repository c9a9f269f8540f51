//! Live-capture loop: ticks a synthetic sensor source through the
//! calibration transformer and EKF at a fixed rate and logs the resulting
//! pose. Stands in for the BLE transport callback this crate's estimator is
//! normally invoked from.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use imu_pose_tracker::calibration::{load_persisted, CalibrationTransformer, FileCalibrationStore};
use imu_pose_tracker::linalg::Quaternion;
use imu_pose_tracker::{Ekf, TrackerConfig, TrackerEvent};
use nalgebra::Vector3;

#[derive(Parser, Debug)]
struct Args {
    /// Sensor sample rate, in Hz.
    #[arg(long, default_value = "50.0")]
    rate_hz: f64,

    /// Number of tracking samples to process after calibration completes
    /// (0 = run forever).
    #[arg(long, default_value = "0")]
    ticks: u64,

    /// Path to the on-disk calibration store.
    #[arg(long, default_value = "calibration.json")]
    calibration_path: PathBuf,

    /// Device name recorded alongside calibration data.
    #[arg(long)]
    device_name: Option<String>,
}

/// A synthetic sensor reading, standing in for one BLE-delivered sample.
fn synthetic_sample(tick: u64, rate_hz: f64) -> (Vector3<f64>, Quaternion, Vector3<f64>) {
    let t = tick as f64 / rate_hz;
    let accel = Vector3::new(0.2 * (t * std::f64::consts::TAU * 0.25).sin(), 0.0, 0.0);
    let quat = Quaternion::identity();
    let mag = Vector3::new(0.0, 0.0, 45.0);
    (accel, quat, mag)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = TrackerConfig::default();
    let mut ekf = Ekf::new(config.clone());
    let mut calibration = CalibrationTransformer::new(&config);
    let mut store = FileCalibrationStore::new(&args.calibration_path);

    if let Some(cal) = load_persisted(&store) {
        log::info!("loaded persisted calibration for {:?}", cal.device_name);
        let blob = imu_pose_tracker::calibration::to_json(&cal);
        calibration.load(&blob);
    } else {
        log::info!("no persisted calibration found at {:?}, calibrating", args.calibration_path);
        calibration.start(args.device_name.clone(), chrono::Utc::now().timestamp_millis());
    }

    let tick_interval = Duration::from_secs_f64(1.0 / args.rate_hz);
    let mut interval = tokio::time::interval(tick_interval);

    let mut tick: u64 = 0;
    let mut tracking_ticks: u64 = 0;
    loop {
        interval.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (raw_accel, quat, mag) = synthetic_sample(tick, args.rate_hz);
        tick += 1;

        if calibration.step() != imu_pose_tracker::calibration::CalibrationStep::Complete {
            for event in calibration.add_sample(raw_accel, now_ms) {
                log::info!("calibration event: {:?}", event);
                if matches!(event, TrackerEvent::CalibrationCompleted) {
                    if let Some(cal) = calibration.calibration() {
                        imu_pose_tracker::calibration::persist(&mut store, cal);
                    }
                }
            }
            continue;
        }

        let accel = calibration.transform(raw_accel);
        let (position, predict_event) = ekf.predict(accel, quat, now_ms);
        if let Some(event) = predict_event {
            log::debug!("predict event: {:?}", event);
        }
        if let Some(event) = ekf.magnetometer_update(mag) {
            log::debug!("magnetometer event: {:?}", event);
        }

        log::info!(
            "t={now_ms}ms pos=({:.4}, {:.4}, {:.4})",
            position.x,
            position.y,
            position.z
        );

        tracking_ticks += 1;
        if args.ticks != 0 && tracking_ticks >= args.ticks {
            break;
        }
    }

    Ok(())
}
