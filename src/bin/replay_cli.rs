//! Offline replay CLI: loads a recorded session (optionally gzip-compressed)
//! from disk, runs it through the deterministic preprocessor, and writes a
//! schema-version-1 replay track as JSON.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

use clap::Parser;
use flate2::read::GzDecoder;
use imu_pose_tracker::preprocessor::preprocess;
use imu_pose_tracker::recording::RecordingSession;
use imu_pose_tracker::TrackerConfig;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a recording_*.json[.gz] file.
    #[arg(long)]
    recording: PathBuf,

    /// Output path for the replay track JSON.
    #[arg(long)]
    out: PathBuf,

    /// Target replay frame rate, in Hz. Defaults to the tracker config's
    /// default rate (60 Hz) when omitted.
    #[arg(long)]
    frame_rate_hz: Option<f64>,
}

fn load_recording(path: &PathBuf) -> anyhow::Result<RecordingSession> {
    let file = File::open(path)?;
    let mut buf = String::new();
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let mut reader = BufReader::new(GzDecoder::new(file));
        reader.read_to_string(&mut buf)?;
    } else {
        let mut reader = BufReader::new(file);
        reader.read_to_string(&mut buf)?;
    }
    Ok(RecordingSession::from_json(&buf)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let session = load_recording(&args.recording)?;
    let source_file_name = args
        .recording
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());

    let config = TrackerConfig::default();
    let replay = preprocess(&session, args.frame_rate_hz, source_file_name, &config)?;

    let mut out = File::create(&args.out)?;
    out.write_all(replay.to_json_pretty().as_bytes())?;

    log::info!(
        "wrote {} frames ({} ms) to {:?}",
        replay.frames.len(),
        replay.duration_ms,
        args.out
    );

    Ok(())
}
