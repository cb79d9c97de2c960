use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use opencv::core::Point;
use tracing::{info, warn};

use target_tracker::config::TrackerConfig;
use target_tracker::io::{DeviceSpec, FrameSource};
use target_tracker::system::{TargetSelection, TrackingEngine, selection_channel};

/// How long each engine waits for its selection before giving up.
const SELECTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "target-tracker",
    version,
    about = "Track colour targets in a camera or video stream"
)]
struct Args {
    /// Camera index to open.
    #[arg(long, conflicts_with = "video")]
    camera: Option<i32>,

    /// Video file to read instead of a camera.
    #[arg(long, value_name = "FILE")]
    video: Option<PathBuf>,

    /// YAML configuration file. Defaults are used when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Target region as x0,y0,x1,y1. Repeat for several targets.
    #[arg(long = "roi", value_name = "X0,Y0,X1,Y1", value_parser = parse_roi, required = true)]
    rois: Vec<TargetSelection>,

    /// Append position packets to this CSV file.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Milliseconds between position polls.
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,

    /// Stop after this many seconds. Runs until the source ends otherwise.
    #[arg(long)]
    duration: Option<f64>,
}

fn parse_roi(s: &str) -> Result<TargetSelection, String> {
    let values: Vec<i32> = s
        .split(',')
        .map(|v| v.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid ROI '{}': {}", s, e))?;
    match values.as_slice() {
        [x0, y0, x1, y1] => Ok(TargetSelection::new(
            Point::new(*x0, *y0),
            Point::new(*x1, *y1),
        )),
        _ => Err(format!("ROI '{}' must have four comma-separated values", s)),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "target_tracker=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };

    let spec = match (&args.video, args.camera) {
        (Some(path), _) => DeviceSpec::Path(path.to_string_lossy().into_owned()),
        (None, Some(index)) => DeviceSpec::Index(index),
        (None, None) => DeviceSpec::Index(0),
    };
    info!("Opening {}", spec);
    let source = Arc::new(FrameSource::open(&spec, &config.camera)?);

    // One engine per region, each handed its selection through its own channel.
    let mut engines = Vec::with_capacity(args.rois.len());
    for (i, selection) in args.rois.iter().enumerate() {
        let (tx, rx) = selection_channel();
        tx.send(selection.clone())?;
        let engine = TrackingEngine::await_and_start(
            i as u32,
            Arc::clone(&source),
            &rx,
            SELECTION_TIMEOUT,
            &config,
        )
        .with_context(|| format!("Failed to start engine for target {}", i))?;
        engines.push(engine);
    }
    info!("{} tracking engine(s) running", engines.len());

    let mut writer = match &args.output {
        Some(path) => {
            let exists = path.exists();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open {:?}", path))?;
            Some(
                csv::WriterBuilder::new()
                    .has_headers(!exists)
                    .from_writer(file),
            )
        }
        None => None,
    };

    let poll = Duration::from_millis(args.poll_ms.max(1));
    let deadline = match args.duration {
        Some(secs) if secs.is_finite() && secs > 0.0 => {
            Some(Instant::now() + Duration::from_secs_f64(secs))
        }
        Some(secs) => bail!("--duration must be positive, got {}", secs),
        None => None,
    };

    let mut packets: u64 = 0;
    loop {
        for engine in &engines {
            if let Some(packet) = engine.get_pos_data() {
                info!(
                    target_id = packet.target_id,
                    timestamp = packet.timestamp,
                    x = packet.x,
                    y = packet.y,
                    confidence = packet.confidence,
                    "Position"
                );
                if let Some(writer) = writer.as_mut() {
                    writer.serialize(packet)?;
                }
                packets += 1;
            }
        }

        if engines.iter().all(|e| !e.is_running()) {
            warn!("All tracking engines have stopped");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(poll);
    }

    for engine in &engines {
        engine.stop();
        let stats = engine.stats();
        info!(
            target_id = engine.target_id(),
            cycles = stats.cycles,
            predicts = stats.predicts,
            updates = stats.updates,
            lock_losses = stats.lock_losses,
            "Engine summary"
        );
    }
    source.stop();

    if let Some(mut writer) = writer {
        writer.flush()?;
    }
    info!("Done, {} packets", packets);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roi() {
        let sel = parse_roi("10, 20,30,40").unwrap();
        assert_eq!(sel.corner_a, Point::new(10, 20));
        assert_eq!(sel.corner_b, Point::new(30, 40));
    }

    #[test]
    fn test_parse_roi_rejects_bad_input() {
        assert!(parse_roi("1,2,3").is_err());
        assert!(parse_roi("a,b,c,d").is_err());
    }

    #[test]
    fn test_cli_accepts_multiple_rois() {
        let args = Args::try_parse_from([
            "target-tracker",
            "--video",
            "clip.mp4",
            "--roi",
            "0,0,10,10",
            "--roi",
            "20,20,30,30",
        ])
        .unwrap();
        assert_eq!(args.rois.len(), 2);
        assert!(args.camera.is_none());
    }
}
