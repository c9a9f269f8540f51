//! Offline preprocessor (C4): runs the EKF deterministically over a recorded
//! event stream with explicit per-sample `dt`, then resamples the resulting
//! position/orientation keyframes to a fixed-rate replay track with
//! spherical-linear-interpolated orientation.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::calibration::AxisAlignmentMatrix;
use crate::config::TrackerConfig;
use crate::ekf::Ekf;
use crate::error::TrackerError;
use crate::linalg::{quat_slerp, Quaternion};
use crate::recording::{RecordingEvent, RecordingSession};

pub const REPLAY_SCHEMA_VERSION: i64 = 1;

/// One resampled frame of the replay track.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayFrame {
    #[serde(rename = "tMs")]
    pub t_ms: i64,
    pub position: ReplayVec3,
    pub quaternion: ReplayQuat,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReplayVec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Vector3<f64>> for ReplayVec3 {
    fn from(v: Vector3<f64>) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReplayQuat {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Quaternion> for ReplayQuat {
    fn from(q: Quaternion) -> Self {
        Self { w: q.w, x: q.x, y: q.y, z: q.z }
    }
}

impl From<ReplayQuat> for Quaternion {
    fn from(q: ReplayQuat) -> Self {
        Quaternion::new(q.w, q.x, q.y, q.z)
    }
}

/// A schema-version-1 replay session, ready to hand to the renderer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplaySession {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i64,
    #[serde(rename = "sourceFileName", skip_serializing_if = "Option::is_none")]
    pub source_file_name: Option<String>,
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: i64,
    pub frames: Vec<ReplayFrame>,
}

impl ReplaySession {
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("replay session always serializes")
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Finds the `(k0, k1)` keyframe pair bracketing `t`, advancing `idx`
/// monotonically so repeated calls with increasing `t` are `O(1)` amortized.
fn bracket<T: Clone>(kfs: &[(i64, T)], t: i64, idx: &mut usize) -> ((i64, T), (i64, T)) {
    while *idx + 1 < kfs.len() && kfs[*idx + 1].0 <= t {
        *idx += 1;
    }
    let k0 = kfs[*idx].clone();
    let k1 = if *idx + 1 < kfs.len() { kfs[*idx + 1].clone() } else { kfs[*idx].clone() };
    (k0, k1)
}

fn lerp_vec(a: Vector3<f64>, b: Vector3<f64>, t: f64) -> Vector3<f64> {
    a + (b - a) * t
}

/// Estimates the default `dt` (seconds) used for the first acceleration
/// sample, as the mean interval between the first up-to-12 linear-
/// acceleration events, clamped to `(0, 0.2]`. Falls back to `1/60` only
/// when there isn't enough data to compute a mean at all.
fn estimate_default_dt(events: &[RecordingEvent]) -> f64 {
    let accel_times: Vec<i64> = events
        .iter()
        .filter(|e| e.linear_accel().is_some())
        .map(|e| e.t_ms)
        .take(12)
        .collect();

    if accel_times.len() < 2 {
        return 1.0 / 60.0;
    }

    let span = (accel_times[accel_times.len() - 1] - accel_times[0]) as f64;
    let mean = span / (accel_times.len() - 1) as f64 / 1000.0;

    if mean <= 0.0 {
        1.0 / 60.0
    } else {
        mean.min(0.2)
    }
}

/// Runs the deterministic EKF pass over `session` and resamples to
/// `frame_rate_hz` (defaulting to [`TrackerConfig::default_frame_rate_hz`]
/// when `None`), producing a fixed-rate replay track.
pub fn preprocess(
    session: &RecordingSession,
    frame_rate_hz: Option<f64>,
    source_file_name: Option<String>,
    config: &TrackerConfig,
) -> Result<ReplaySession, TrackerError> {
    if session.schema_version != crate::recording::RECORDING_SCHEMA_VERSION {
        return Err(TrackerError::InvalidRecordingSchema {
            found: session.schema_version,
            expected: crate::recording::RECORDING_SCHEMA_VERSION,
        });
    }
    if session.events.is_empty() {
        return Err(TrackerError::EmptyRecording);
    }

    let frame_rate_hz = frame_rate_hz.unwrap_or(config.default_frame_rate_hz);

    let mut events = session.events.clone();
    events.sort_by_key(|e| e.t_ms);

    let alignment = session
        .calibration
        .as_ref()
        .map(|cal| AxisAlignmentMatrix::from_calibration(cal).0);

    let default_dt = estimate_default_dt(&events);

    let mut ekf = Ekf::new(config.clone());
    let mut quat_keyframes: Vec<(i64, Quaternion)> = Vec::new();
    let mut pos_keyframes: Vec<(i64, Vector3<f64>)> = Vec::new();

    let mut last_quat: Option<Quaternion> = None;
    let mut last_accel_t: Option<i64> = None;
    let mut last_event_t: i64 = 0;

    for event in &events {
        last_event_t = last_event_t.max(event.t_ms);

        if let Some(q) = event.quaternion() {
            let canonical = match last_quat {
                Some(prev) => q.normalized().canonicalized_toward(&prev),
                None => q.normalized(),
            };
            last_quat = Some(canonical);
            quat_keyframes.push((event.t_ms, canonical));
            continue;
        }

        if let Some(a) = event.linear_accel() {
            let Some(q) = last_quat else { continue };
            let a = match &alignment {
                Some(m) => m.apply(a),
                None => a,
            };
            let dt = match last_accel_t {
                Some(prev_t) => (event.t_ms - prev_t) as f64 / 1000.0,
                None => default_dt,
            };
            let (pos, _event) = ekf.predict_with_dt(a, q, dt);
            pos_keyframes.push((event.t_ms, pos));
            last_accel_t = Some(event.t_ms);
            continue;
        }

        if let Some(m) = event.magnetometer() {
            ekf.magnetometer_update(m);
        }
    }

    let last_quat_t = quat_keyframes.last().map(|(t, _)| *t).unwrap_or(0);
    let last_pos_t = pos_keyframes.last().map(|(t, _)| *t).unwrap_or(0);
    let duration_ms = last_quat_t.max(last_pos_t).max(last_event_t);

    if quat_keyframes.is_empty() {
        quat_keyframes.push((0, Quaternion::identity()));
    }
    if pos_keyframes.is_empty() {
        pos_keyframes.push((0, Vector3::zeros()));
    }

    let frame_interval_ms = (1000.0 / frame_rate_hz).round() as i64;
    let frame_interval_ms = frame_interval_ms.max(1);

    let mut frames = Vec::new();
    let mut quat_idx = 0usize;
    let mut pos_idx = 0usize;
    let mut t = 0i64;
    while t <= duration_ms {
        let ((q0_t, q0), (q1_t, q1)) = bracket(&quat_keyframes, t, &mut quat_idx);
        let alpha_q = if q1_t > q0_t { clamp01((t - q0_t) as f64 / (q1_t - q0_t) as f64) } else { 0.0 };
        let quat = quat_slerp(q0, q1, alpha_q);

        let ((p0_t, p0), (p1_t, p1)) = bracket(&pos_keyframes, t, &mut pos_idx);
        let alpha_p = if p1_t > p0_t { clamp01((t - p0_t) as f64 / (p1_t - p0_t) as f64) } else { 0.0 };
        let position = lerp_vec(p0, p1, alpha_p);

        frames.push(ReplayFrame {
            t_ms: t,
            position: position.into(),
            quaternion: quat.into(),
        });

        t += frame_interval_ms;
    }

    Ok(ReplaySession {
        schema_version: REPLAY_SCHEMA_VERSION,
        source_file_name,
        device_name: session.device_name.clone(),
        duration_ms,
        frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn session_with_events(events: Vec<RecordingEvent>) -> RecordingSession {
        RecordingSession {
            schema_version: 1,
            recorded_at: "2026-01-01T00:00:00Z".to_string(),
            device_name: Some("test-device".to_string()),
            connected_at: None,
            disconnected_at: None,
            calibration: None,
            events,
        }
    }

    #[test]
    fn s6_replay_keyframe_interpolation() {
        let events = vec![
            RecordingEvent::data(0, "t0", "quat").with_quaternion(Quaternion::identity()),
            RecordingEvent::data(0, "t0", "pos").with_linear_accel(Vector3::zeros()),
            RecordingEvent::data(50, "t50", "quat").with_quaternion(Quaternion::new(
                std::f64::consts::FRAC_1_SQRT_2,
                0.0,
                std::f64::consts::FRAC_1_SQRT_2,
                0.0,
            )),
            RecordingEvent::data(100, "t100", "quat")
                .with_quaternion(Quaternion::new(0.0, 0.0, 1.0, 0.0)),
            RecordingEvent::data(100, "t100", "pos")
                .with_linear_accel(Vector3::new(0.0, 0.0, 0.0)),
        ];
        let session = session_with_events(events);
        let replay = preprocess(&session, Some(100.0), None, &TrackerConfig::default()).unwrap();

        let frame5 = replay.frames.iter().find(|f| f.t_ms == 50).unwrap();
        assert_relative_eq!(frame5.quaternion.w, std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-6);
        assert_relative_eq!(frame5.quaternion.y, std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-6);
    }

    #[test]
    fn rejects_empty_recording() {
        let session = session_with_events(vec![]);
        let err = preprocess(&session, None, None, &TrackerConfig::default()).unwrap_err();
        assert!(matches!(err, TrackerError::EmptyRecording));
    }

    #[test]
    fn determinism_across_runs() {
        let events = vec![
            RecordingEvent::data(0, "t0", "quat").with_quaternion(Quaternion::identity()),
            RecordingEvent::data(10, "t10", "accel").with_linear_accel(Vector3::new(1.0, 0.0, 0.0)),
            RecordingEvent::data(20, "t20", "accel").with_linear_accel(Vector3::new(1.0, 0.0, 0.0)),
            RecordingEvent::data(30, "t30", "mag").with_magnetometer(Vector3::new(0.0, 0.0, 1.0)),
            RecordingEvent::data(40, "t40", "accel").with_linear_accel(Vector3::new(0.5, 0.0, 0.0)),
        ];
        let session = session_with_events(events);
        let cfg = TrackerConfig::default();
        let a = preprocess(&session, Some(60.0), None, &cfg).unwrap();
        let b = preprocess(&session, Some(60.0), None, &cfg).unwrap();
        assert_eq!(a.to_json_pretty(), b.to_json_pretty());
    }

    #[test]
    fn skips_accel_before_first_quaternion() {
        let accel_only =
            RecordingEvent::data(0, "t0", "accel").with_linear_accel(Vector3::new(1.0, 0.0, 0.0));
        let session = session_with_events(vec![accel_only]);
        let replay = preprocess(&session, None, None, &TrackerConfig::default()).unwrap();
        assert_eq!(replay.frames[0].position.x, 0.0);
    }

    #[test]
    fn default_dt_clamps_to_0_2_rather_than_falling_back() {
        let events = vec![
            RecordingEvent::data(0, "t0", "accel").with_linear_accel(Vector3::new(1.0, 0.0, 0.0)),
            RecordingEvent::data(500, "t500", "accel")
                .with_linear_accel(Vector3::new(1.0, 0.0, 0.0)),
        ];
        assert_relative_eq!(estimate_default_dt(&events), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn default_dt_falls_back_when_insufficient_samples() {
        let events =
            vec![RecordingEvent::data(0, "t0", "accel").with_linear_accel(Vector3::new(1.0, 0.0, 0.0))];
        assert_relative_eq!(estimate_default_dt(&events), 1.0 / 60.0, epsilon = 1e-12);
    }
}
