//! Calibration transformer (C2): walks the operator through six directional
//! holds, averages each into an axis-alignment matrix, and applies that
//! matrix to subsequent acceleration samples.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::error::TrackerEvent;

/// The fixed key this crate's calibration blob lives under in whatever
/// key/value store backs [`CalibrationStore`].
pub const CALIBRATION_STORE_KEY: &str = "imu_calibration_data";

/// Calibration state machine steps, in the order they are visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationStep {
    Idle,
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
    Complete,
}

impl CalibrationStep {
    fn next(self) -> Self {
        match self {
            CalibrationStep::Idle => CalibrationStep::PosX,
            CalibrationStep::PosX => CalibrationStep::NegX,
            CalibrationStep::NegX => CalibrationStep::PosY,
            CalibrationStep::PosY => CalibrationStep::NegY,
            CalibrationStep::NegY => CalibrationStep::PosZ,
            CalibrationStep::PosZ => CalibrationStep::NegZ,
            CalibrationStep::NegZ => CalibrationStep::Complete,
            CalibrationStep::Complete => CalibrationStep::Idle,
        }
    }

    /// Operator-facing instruction shown when this step becomes active.
    pub fn instruction(self) -> &'static str {
        match self {
            CalibrationStep::Idle => "hold still to begin",
            CalibrationStep::PosX => "hold device with +X axis pointing up",
            CalibrationStep::NegX => "hold device with -X axis pointing up",
            CalibrationStep::PosY => "hold device with +Y axis pointing up",
            CalibrationStep::NegY => "hold device with -Y axis pointing up",
            CalibrationStep::PosZ => "hold device with +Z axis pointing up",
            CalibrationStep::NegZ => "hold device with -Z axis pointing up",
            CalibrationStep::Complete => "calibration complete",
        }
    }
}

/// Six directional acceleration averages plus provenance, the raw input to
/// [`AxisAlignmentMatrix::from_calibration`]. Serialized through
/// [`CalibrationWire`], not derived directly, so the wire shape stays
/// `{x,y,z}`-object vectors regardless of how `Vector3<f64>` itself
/// serializes.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationData {
    pub pos_x: Vector3<f64>,
    pub neg_x: Vector3<f64>,
    pub pos_y: Vector3<f64>,
    pub neg_y: Vector3<f64>,
    pub pos_z: Vector3<f64>,
    pub neg_z: Vector3<f64>,
    pub timestamp: i64,
    pub device_name: Option<String>,
}

/// 3x3 axis-alignment matrix: each row is the independently normalized unit
/// vector of one axis's `pos - neg` difference. Not necessarily orthogonal —
/// this is a projection, not a rotation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisAlignmentMatrix {
    pub x_hat: Vector3<f64>,
    pub y_hat: Vector3<f64>,
    pub z_hat: Vector3<f64>,
}

fn normalized_or_zero(v: Vector3<f64>) -> (Vector3<f64>, bool) {
    let n = v.norm();
    if n < 1e-12 {
        (Vector3::zeros(), true)
    } else {
        (v / n, false)
    }
}

impl AxisAlignmentMatrix {
    /// Builds the alignment matrix from calibration data. Degenerate axes
    /// (zero-norm difference) normalize to the zero vector rather than
    /// panicking or dividing by zero; `transform` then reports zero for that
    /// component and emits [`TrackerEvent::DegenerateCalibrationAxis`].
    pub fn from_calibration(cal: &CalibrationData) -> (Self, bool) {
        let (x_hat, x_degenerate) = normalized_or_zero(cal.pos_x - cal.neg_x);
        let (y_hat, y_degenerate) = normalized_or_zero(cal.pos_y - cal.neg_y);
        let (z_hat, z_degenerate) = normalized_or_zero(cal.pos_z - cal.neg_z);
        (
            Self { x_hat, y_hat, z_hat },
            x_degenerate || y_degenerate || z_degenerate,
        )
    }

    pub fn apply(&self, a: Vector3<f64>) -> Vector3<f64> {
        Vector3::new(a.dot(&self.x_hat), a.dot(&self.y_hat), a.dot(&self.z_hat))
    }
}

/// Capability interface for the host key/value store, per this crate's
/// convention of not hardwiring a single storage backend into the algorithm
/// (compare the existing JSON persistence used by the replay binaries).
/// Every method is fallible/optional so a backend that simply doesn't exist
/// (a headless preprocessing run) is representable without special-casing.
pub trait CalibrationStore {
    fn get(&self) -> Option<String>;
    fn set(&mut self, value: &str);
    fn remove(&mut self);
}

/// File-backed store used by the live-capture binary.
pub struct FileCalibrationStore {
    path: PathBuf,
}

impl FileCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn get(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }

    fn set(&mut self, value: &str) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&self.path, value) {
            log::warn!("failed to persist calibration to {:?}: {}", self.path, err);
        }
    }

    fn remove(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// In-memory store, used by tests and any caller without durable storage.
#[derive(Default)]
pub struct InMemoryCalibrationStore {
    values: HashMap<&'static str, String>,
}

impl CalibrationStore for InMemoryCalibrationStore {
    fn get(&self) -> Option<String> {
        self.values.get(CALIBRATION_STORE_KEY).cloned()
    }

    fn set(&mut self, value: &str) {
        self.values.insert(CALIBRATION_STORE_KEY, value.to_string());
    }

    fn remove(&mut self) {
        self.values.remove(CALIBRATION_STORE_KEY);
    }
}

#[derive(Serialize, Deserialize)]
struct Vec3Json {
    x: f64,
    y: f64,
    z: f64,
}

impl From<Vector3<f64>> for Vec3Json {
    fn from(v: Vector3<f64>) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }
}

impl From<Vec3Json> for Vector3<f64> {
    fn from(v: Vec3Json) -> Self {
        Vector3::new(v.x, v.y, v.z)
    }
}

/// Wire shape for [`CalibrationData`]: six `{x,y,z}` fields under their
/// camelCase names, an integer `timestamp`, and an optional `deviceName` —
/// exactly the persistence-contract JSON object. `pub(crate)` so
/// `recording.rs` can embed a recording's calibration snapshot in the same
/// shape.
#[derive(Serialize, Deserialize)]
pub(crate) struct CalibrationWire {
    #[serde(rename = "posX")]
    pos_x: Vec3Json,
    #[serde(rename = "negX")]
    neg_x: Vec3Json,
    #[serde(rename = "posY")]
    pos_y: Vec3Json,
    #[serde(rename = "negY")]
    neg_y: Vec3Json,
    #[serde(rename = "posZ")]
    pos_z: Vec3Json,
    #[serde(rename = "negZ")]
    neg_z: Vec3Json,
    #[serde(default)]
    timestamp: i64,
    #[serde(rename = "deviceName", skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
}

impl From<&CalibrationData> for CalibrationWire {
    fn from(cal: &CalibrationData) -> Self {
        Self {
            pos_x: cal.pos_x.into(),
            neg_x: cal.neg_x.into(),
            pos_y: cal.pos_y.into(),
            neg_y: cal.neg_y.into(),
            pos_z: cal.pos_z.into(),
            neg_z: cal.neg_z.into(),
            timestamp: cal.timestamp,
            device_name: cal.device_name.clone(),
        }
    }
}

impl From<CalibrationWire> for CalibrationData {
    fn from(j: CalibrationWire) -> Self {
        Self {
            pos_x: j.pos_x.into(),
            neg_x: j.neg_x.into(),
            pos_y: j.pos_y.into(),
            neg_y: j.neg_y.into(),
            pos_z: j.pos_z.into(),
            neg_z: j.neg_z.into(),
            timestamp: j.timestamp,
            device_name: j.device_name,
        }
    }
}

/// Serializes calibration data to the JSON shape described in the
/// persistence contract (six `{x,y,z}` fields, integer `timestamp`, optional
/// `deviceName`).
pub fn to_json(cal: &CalibrationData) -> String {
    serde_json::to_string(&CalibrationWire::from(cal)).expect("calibration data always serializes")
}

/// Parses a persisted calibration blob. Returns `None` (silently, per the
/// `MalformedPersistedCalibration` policy) unless all six vector fields are
/// present and well-formed; `timestamp` is not part of the acceptance gate
/// and defaults to `0` when absent.
pub fn from_json(blob: &str) -> Option<CalibrationData> {
    serde_json::from_str::<CalibrationWire>(blob).ok().map(CalibrationData::from)
}

/// Drives the `idle -> posX -> negX -> posY -> negY -> posZ -> negZ ->
/// complete -> idle` state machine and owns the in-progress sample buffer.
pub struct CalibrationTransformer {
    step: CalibrationStep,
    buffer: Vec<Vector3<f64>>,
    partial: CalibrationBuilder,
    matrix: Option<AxisAlignmentMatrix>,
    data: Option<CalibrationData>,
    samples_per_step: usize,
    progress_stride: usize,
}

#[derive(Default)]
struct CalibrationBuilder {
    pos_x: Option<Vector3<f64>>,
    neg_x: Option<Vector3<f64>>,
    pos_y: Option<Vector3<f64>>,
    neg_y: Option<Vector3<f64>>,
    pos_z: Option<Vector3<f64>>,
    neg_z: Option<Vector3<f64>>,
    timestamp: i64,
    device_name: Option<String>,
}

impl CalibrationBuilder {
    fn commit(&mut self, step: CalibrationStep, mean: Vector3<f64>) {
        match step {
            CalibrationStep::PosX => self.pos_x = Some(mean),
            CalibrationStep::NegX => self.neg_x = Some(mean),
            CalibrationStep::PosY => self.pos_y = Some(mean),
            CalibrationStep::NegY => self.neg_y = Some(mean),
            CalibrationStep::PosZ => self.pos_z = Some(mean),
            CalibrationStep::NegZ => self.neg_z = Some(mean),
            _ => {}
        }
    }

    fn finish(&self, timestamp: i64) -> Option<CalibrationData> {
        Some(CalibrationData {
            pos_x: self.pos_x?,
            neg_x: self.neg_x?,
            pos_y: self.pos_y?,
            neg_y: self.neg_y?,
            pos_z: self.pos_z?,
            neg_z: self.neg_z?,
            timestamp,
            device_name: self.device_name.clone(),
        })
    }
}

impl Default for CalibrationTransformer {
    fn default() -> Self {
        Self::new(&TrackerConfig::default())
    }
}

impl CalibrationTransformer {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            step: CalibrationStep::Idle,
            buffer: Vec::new(),
            partial: CalibrationBuilder::default(),
            matrix: None,
            data: None,
            samples_per_step: config.calibration_samples_per_step,
            progress_stride: config.calibration_progress_stride,
        }
    }

    pub fn step(&self) -> CalibrationStep {
        self.step
    }

    pub fn calibration(&self) -> Option<&CalibrationData> {
        self.data.as_ref()
    }

    pub fn matrix(&self) -> Option<&AxisAlignmentMatrix> {
        self.matrix.as_ref()
    }

    /// Begins a fresh calibration pass, discarding any in-progress buffer.
    pub fn start(&mut self, device_name: Option<String>, now_ms: i64) -> TrackerEvent {
        self.buffer.clear();
        self.partial = CalibrationBuilder::default();
        self.partial.device_name = device_name;
        self.partial.timestamp = now_ms;
        self.step = CalibrationStep::Idle.next();
        TrackerEvent::CalibrationStepChanged {
            step: self.step,
            instruction: self.step.instruction().to_string(),
        }
    }

    /// Adds a sample to the current step's buffer. No-op (empty event list)
    /// when idle or complete. Returns the events emitted, in order; the
    /// caller can check `events.iter().any(|e| matches!(e,
    /// TrackerEvent::CalibrationStepChanged { .. }))` to learn whether a step
    /// just completed.
    pub fn add_sample(&mut self, a: Vector3<f64>, now_ms: i64) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        if self.step == CalibrationStep::Idle || self.step == CalibrationStep::Complete {
            return events;
        }

        self.buffer.push(a);
        let n = self.buffer.len();

        if n % self.progress_stride == 0 || n == self.samples_per_step {
            let percent = (100 * n / self.samples_per_step) as u32;
            events.push(TrackerEvent::CalibrationProgress { step: self.step, percent });
        }

        if n >= self.samples_per_step {
            let sum = self.buffer.iter().fold(Vector3::zeros(), |acc, v| acc + v);
            let mean = sum / self.samples_per_step as f64;
            self.partial.commit(self.step, mean);
            self.buffer.clear();

            self.step = self.step.next();
            self.partial.timestamp = now_ms;

            if self.step == CalibrationStep::Complete {
                if let Some(data) = self.partial.finish(now_ms) {
                    let (matrix, degenerate) = AxisAlignmentMatrix::from_calibration(&data);
                    self.matrix = Some(matrix);
                    self.data = Some(data);
                    if degenerate {
                        events.push(TrackerEvent::DegenerateCalibrationAxis);
                    }
                }
                events.push(TrackerEvent::CalibrationCompleted);
            } else {
                events.push(TrackerEvent::CalibrationStepChanged {
                    step: self.step,
                    instruction: self.step.instruction().to_string(),
                });
            }
        }

        events
    }

    /// Discards the in-progress buffer and returns to `idle`. Idempotent.
    pub fn cancel(&mut self) -> TrackerEvent {
        self.buffer.clear();
        self.partial = CalibrationBuilder::default();
        self.step = CalibrationStep::Idle;
        TrackerEvent::CalibrationCancelled
    }

    /// Loads a persisted calibration into this transformer, replacing any
    /// in-progress state. Silently leaves the transformer untouched if the
    /// blob fails the structural check.
    pub fn load(&mut self, blob: &str) -> Option<TrackerEvent> {
        match from_json(blob) {
            Some(data) => {
                let (matrix, _) = AxisAlignmentMatrix::from_calibration(&data);
                self.matrix = Some(matrix);
                self.data = Some(data);
                self.step = CalibrationStep::Complete;
                None
            }
            None => Some(TrackerEvent::MalformedPersistedCalibration),
        }
    }

    /// Clears any stored calibration, returning to the uncalibrated
    /// (identity-transform) state.
    pub fn clear(&mut self) {
        self.matrix = None;
        self.data = None;
        self.step = CalibrationStep::Idle;
    }

    /// Applies the current axis-alignment matrix, or the identity transform
    /// if no calibration is present.
    pub fn transform(&self, a: Vector3<f64>) -> Vector3<f64> {
        match &self.matrix {
            Some(m) => m.apply(a),
            None => a,
        }
    }
}

/// Persists `cal` to `store` under [`CALIBRATION_STORE_KEY`] as JSON.
pub fn persist(store: &mut dyn CalibrationStore, cal: &CalibrationData) {
    store.set(&to_json(cal));
}

/// Loads and structurally validates a calibration blob from `store`.
/// Returns `None` — without mutating the store — if absent or malformed.
pub fn load_persisted(store: &dyn CalibrationStore) -> Option<CalibrationData> {
    store.get().and_then(|blob| from_json(&blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis_swap_calibration() -> CalibrationData {
        CalibrationData {
            pos_x: Vector3::new(0.0, 1.0, 0.0),
            neg_x: Vector3::new(0.0, -1.0, 0.0),
            pos_y: Vector3::new(1.0, 0.0, 0.0),
            neg_y: Vector3::new(-1.0, 0.0, 0.0),
            pos_z: Vector3::new(0.0, 0.0, 1.0),
            neg_z: Vector3::new(0.0, 0.0, -1.0),
            timestamp: 0,
            device_name: None,
        }
    }

    #[test]
    fn s4_calibration_permutation() {
        let cal = axis_swap_calibration();
        let (matrix, degenerate) = AxisAlignmentMatrix::from_calibration(&cal);
        assert!(!degenerate);
        let out = matrix.apply(Vector3::new(1.0, 2.0, 3.0));
        assert!((out.x - 2.0).abs() < 1e-12);
        assert!((out.y - 1.0).abs() < 1e-12);
        assert!((out.z - 3.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_axis_projects_to_zero() {
        let mut cal = axis_swap_calibration();
        cal.pos_x = Vector3::zeros();
        cal.neg_x = Vector3::zeros();
        let (matrix, degenerate) = AxisAlignmentMatrix::from_calibration(&cal);
        assert!(degenerate);
        let out = matrix.apply(Vector3::new(5.0, 5.0, 5.0));
        assert_eq!(out.x, 0.0);
    }

    #[test]
    fn no_calibration_is_identity() {
        let t = CalibrationTransformer::default();
        let a = Vector3::new(1.0, -2.0, 3.5);
        assert_eq!(t.transform(a), a);
    }

    #[test]
    fn full_cycle_reaches_complete_and_persists() {
        let cfg = TrackerConfig::default();
        let mut t = CalibrationTransformer::new(&cfg);
        t.start(Some("test-device".to_string()), 1_000);

        let directions = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -1.0),
        ];

        let mut completed = false;
        for dir in directions {
            for _ in 0..cfg.calibration_samples_per_step {
                let events = t.add_sample(dir, 2_000);
                if events
                    .iter()
                    .any(|e| matches!(e, TrackerEvent::CalibrationCompleted))
                {
                    completed = true;
                }
            }
        }

        assert!(completed);
        assert_eq!(t.step(), CalibrationStep::Complete);
        assert!(t.calibration().is_some());

        let mut store = InMemoryCalibrationStore::default();
        persist(&mut store, t.calibration().unwrap());
        let reloaded = load_persisted(&store).unwrap();
        assert_eq!(reloaded.pos_x, t.calibration().unwrap().pos_x);
    }

    #[test]
    fn cancel_is_idempotent_and_drops_buffer() {
        let mut t = CalibrationTransformer::default();
        t.start(None, 0);
        t.add_sample(Vector3::new(1.0, 0.0, 0.0), 0);
        t.cancel();
        t.cancel();
        assert_eq!(t.step(), CalibrationStep::Idle);
        assert!(t.calibration().is_none());
    }

    #[test]
    fn malformed_blob_is_rejected_without_mutation() {
        let mut store = InMemoryCalibrationStore::default();
        store.set("{\"not\":\"calibration\"}");
        assert!(load_persisted(&store).is_none());
    }

    #[test]
    fn blob_with_six_vectors_but_no_timestamp_is_accepted() {
        let blob = r#"{"posX":{"x":1,"y":0,"z":0},"negX":{"x":-1,"y":0,"z":0},
            "posY":{"x":0,"y":1,"z":0},"negY":{"x":0,"y":-1,"z":0},
            "posZ":{"x":0,"y":0,"z":1},"negZ":{"x":0,"y":0,"z":-1}}"#;
        let cal = from_json(blob).expect("six vectors with no timestamp should parse");
        assert_eq!(cal.timestamp, 0);
    }
}
