//! Recording (v1) schema consumed by the offline preprocessor: a timestamped
//! event stream plus optional embedded calibration, as produced by whatever
//! records a live BLE session to disk.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationData;
use crate::error::TrackerError;
use crate::linalg::Quaternion;

pub const RECORDING_SCHEMA_VERSION: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingEventKind {
    System,
    Data,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Vec3Field {
    x: f64,
    y: f64,
    z: f64,
}

impl From<Vector3<f64>> for Vec3Field {
    fn from(v: Vector3<f64>) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }
}

impl From<Vec3Field> for Vector3<f64> {
    fn from(v: Vec3Field) -> Self {
        Vector3::new(v.x, v.y, v.z)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct QuatField {
    w: f64,
    x: f64,
    y: f64,
    z: f64,
}

impl From<Quaternion> for QuatField {
    fn from(q: Quaternion) -> Self {
        Self { w: q.w, x: q.x, y: q.y, z: q.z }
    }
}

impl From<QuatField> for Quaternion {
    fn from(q: QuatField) -> Self {
        Quaternion::new(q.w, q.x, q.y, q.z)
    }
}

/// One timestamped event: a system/data/error log line, optionally carrying
/// one of the three sensor readings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingEvent {
    #[serde(rename = "tMs")]
    pub t_ms: i64,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: RecordingEventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quaternion: Option<QuatField>,
    #[serde(rename = "linearAccel", default, skip_serializing_if = "Option::is_none")]
    linear_accel: Option<Vec3Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    magnetometer: Option<Vec3Field>,
}

impl RecordingEvent {
    pub fn data(t_ms: i64, timestamp: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            t_ms,
            timestamp: timestamp.into(),
            kind: RecordingEventKind::Data,
            message: message.into(),
            quaternion: None,
            linear_accel: None,
            magnetometer: None,
        }
    }

    pub fn with_quaternion(mut self, q: Quaternion) -> Self {
        self.quaternion = Some(q.into());
        self
    }

    pub fn with_linear_accel(mut self, a: Vector3<f64>) -> Self {
        self.linear_accel = Some(a.into());
        self
    }

    pub fn with_magnetometer(mut self, m: Vector3<f64>) -> Self {
        self.magnetometer = Some(m.into());
        self
    }

    pub fn quaternion(&self) -> Option<Quaternion> {
        self.quaternion.clone().map(Quaternion::from)
    }

    pub fn linear_accel(&self) -> Option<Vector3<f64>> {
        self.linear_accel.clone().map(Vector3::from)
    }

    pub fn magnetometer(&self) -> Option<Vector3<f64>> {
        self.magnetometer.clone().map(Vector3::from)
    }
}

/// A full recorded session, schema version 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingSession {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i64,
    #[serde(rename = "recordedAt")]
    pub recorded_at: String,
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "connectedAt")]
    pub connected_at: Option<String>,
    #[serde(rename = "disconnectedAt")]
    pub disconnected_at: Option<String>,
    #[serde(with = "calibration_wire", default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationData>,
    pub events: Vec<RecordingEvent>,
}

/// Serializes/deserializes the embedded calibration snapshot through
/// [`crate::calibration::CalibrationWire`] so it lands on the same
/// `{posX, negX, ...}` wire shape as the persisted calibration blob, even
/// though `CalibrationData` itself carries no `Serialize`/`Deserialize` impl.
mod calibration_wire {
    use super::CalibrationData;
    use crate::calibration::CalibrationWire;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(cal: &Option<CalibrationData>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        cal.as_ref().map(CalibrationWire::from).serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<CalibrationData>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<CalibrationWire>::deserialize(d)?.map(CalibrationData::from))
    }
}

impl RecordingSession {
    /// Parses and validates a recording blob, refusing anything that isn't
    /// schema version 1 — the one hard-refusal error this crate surfaces to
    /// its caller rather than recovering from silently.
    pub fn from_json(blob: &str) -> Result<Self, TrackerError> {
        let session: RecordingSession =
            serde_json::from_str(blob).map_err(|_| TrackerError::InvalidRecordingSchema {
                found: -1,
                expected: RECORDING_SCHEMA_VERSION,
            })?;
        if session.schema_version != RECORDING_SCHEMA_VERSION {
            return Err(TrackerError::InvalidRecordingSchema {
                found: session.schema_version,
                expected: RECORDING_SCHEMA_VERSION,
            });
        }
        Ok(session)
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("recording session always serializes")
    }
}
