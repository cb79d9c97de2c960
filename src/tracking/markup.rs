//! One-shot target initialization from a selection.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use nalgebra::Vector2;
use opencv::core::{Mat, Point2f, Rect, Size};
use opencv::imgproc;
use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::io::{Frame, FrameSource};
use crate::measurement::ColorProfile;
use crate::measurement::flow::{detect_features, rect_mask};
use crate::system::messages::{RegionBounds, SelectionReceiver, TargetSelection};

/// How long markup waits for the Frame Source to deliver a fresh capture.
const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Everything an engine needs to start tracking a target.
pub struct InitialTarget {
    pub profile: ColorProfile,
    /// Selection centroid, the first observation and filter position.
    pub observation: Vector2<f64>,
    /// Initial flow keypoints.
    pub seeds: Vec<Point2f>,
    /// Grayscale markup frame, the flow reference for the first cycle.
    pub gray: Mat,
    pub frame_index: u64,
    pub timestamp: f64,
    /// Monotonic capture instant of the markup frame.
    pub captured_at: Instant,
    pub frame_size: Size,
}

/// Wait for a selection on `receiver`, then mark the target up.
pub fn await_markup(
    source: &FrameSource,
    receiver: &SelectionReceiver,
    timeout: Duration,
    config: &TrackerConfig,
) -> Result<InitialTarget> {
    let Some(selection) = receiver.await_selection(timeout)? else {
        bail!("No target selection received within {:?}", timeout);
    };
    markup_target(source, &selection, config)
}

/// Learn the target's colour and keypoints from a fresh frame.
pub fn markup_target(
    source: &FrameSource,
    selection: &TargetSelection,
    config: &TrackerConfig,
) -> Result<InitialTarget> {
    // Two captures, so the engine's first frame already has a real delta.
    let first = wait_for_new_frame(source, source.latest_index())?;
    let frame = wait_for_new_frame(source, Some(first.index))?;
    let frame_size = Size::new(frame.width(), frame.height());

    let region = clamp_region(selection.bounds(), frame_size)?;
    let profile = ColorProfile::from_region(&frame.image, region, &config.color)?;

    let mut gray = Mat::default();
    imgproc::cvt_color_def(&frame.image, &mut gray, imgproc::COLOR_BGR2GRAY)?;

    let seeds = if selection.keypoints.is_empty() {
        let mask = rect_mask(frame_size, region)?;
        detect_features(&gray, &mask, &config.feature)?
    } else {
        let inside: Vec<Point2f> = selection
            .keypoints
            .iter()
            .copied()
            .filter(|p| contains_point(region, p))
            .collect();
        if inside.len() < selection.keypoints.len() {
            debug!(
                dropped = selection.keypoints.len() - inside.len(),
                "Keypoints outside the selection ignored"
            );
        }
        inside
    };

    let observation = clamp_to_frame(selection.bounds().centroid(), frame_size);

    info!(
        x = observation.x,
        y = observation.y,
        hue_lo = profile.hue.lower,
        hue_hi = profile.hue.upper,
        sat_lo = profile.saturation.lower,
        sat_hi = profile.saturation.upper,
        seeds = seeds.len(),
        "Target marked up"
    );

    Ok(InitialTarget {
        profile,
        observation,
        seeds,
        gray,
        frame_index: frame.index,
        timestamp: frame.timestamp,
        captured_at: frame.captured_at,
        frame_size,
    })
}

/// Clip the selection to the frame. A box with no area becomes its centre pixel.
pub fn clamp_region(bounds: &RegionBounds, frame: Size) -> Result<Rect> {
    if frame.width <= 0 || frame.height <= 0 {
        bail!("Cannot mark up an empty frame");
    }
    let clamp_x = |x: i32| x.clamp(0, frame.width - 1);
    let clamp_y = |y: i32| y.clamp(0, frame.height - 1);

    if bounds.is_degenerate() {
        return Ok(Rect::new(clamp_x(bounds.mean_x), clamp_y(bounds.mean_y), 1, 1));
    }

    let x0 = clamp_x(bounds.min_x);
    let y0 = clamp_y(bounds.min_y);
    let x1 = bounds.max_x.clamp(0, frame.width);
    let y1 = bounds.max_y.clamp(0, frame.height);
    if x1 <= x0 || y1 <= y0 {
        // Entirely off-frame: fall back to the nearest pixel.
        return Ok(Rect::new(x0, y0, 1, 1));
    }
    Ok(Rect::new(x0, y0, x1 - x0, y1 - y0))
}

fn contains_point(rect: Rect, p: &Point2f) -> bool {
    let (x, y) = (p.x as f64, p.y as f64);
    x >= rect.x as f64
        && x < (rect.x + rect.width) as f64
        && y >= rect.y as f64
        && y < (rect.y + rect.height) as f64
}

fn clamp_to_frame(point: Vector2<f64>, frame: Size) -> Vector2<f64> {
    Vector2::new(
        point.x.clamp(0.0, (frame.width - 1) as f64),
        point.y.clamp(0.0, (frame.height - 1) as f64),
    )
}

/// Request captures until one newer than `after` is published.
fn wait_for_new_frame(source: &FrameSource, after: Option<u64>) -> Result<Frame> {
    let start = Instant::now();
    loop {
        source.request_capture();
        if let Some(index) = source.latest_index() {
            if after.is_none_or(|seen| index > seen) {
                if let Some(frame) = source.current_frame()? {
                    debug!(index = frame.index, "Markup frame");
                    return Ok(frame);
                }
            }
        }
        if !source.is_opened() {
            bail!("Frame source closed during markup");
        }
        if start.elapsed() > FRAME_WAIT_TIMEOUT {
            bail!("Timed out waiting for a markup frame");
        }
        thread::sleep(FRAME_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FrameReplay;
    use crate::system::messages::selection_channel;
    use approx::assert_relative_eq;
    use opencv::core::{CV_8UC3, Point, Scalar};
    use opencv::prelude::*;

    fn green_square_frame() -> Mat {
        let mut img =
            Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0)).unwrap();
        imgproc::rectangle(
            &mut img,
            Rect::new(90, 90, 21, 21),
            Scalar::new(0.0, 255.0, 0.0, 0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        img
    }

    fn source() -> FrameSource {
        FrameSource::with_device(FrameReplay::looping(vec![green_square_frame()])).unwrap()
    }

    #[test]
    fn test_clamp_region_inside() {
        let sel = TargetSelection::new(Point::new(10, 20), Point::new(30, 50));
        let rect = clamp_region(sel.bounds(), Size::new(100, 100)).unwrap();
        assert_eq!(rect, Rect::new(10, 20, 20, 30));
    }

    #[test]
    fn test_clamp_region_overhanging() {
        let sel = TargetSelection::new(Point::new(-10, 90), Point::new(20, 130));
        let rect = clamp_region(sel.bounds(), Size::new(100, 100)).unwrap();
        assert_eq!(rect, Rect::new(0, 90, 20, 10));
    }

    #[test]
    fn test_clamp_region_degenerate() {
        let sel = TargetSelection::new(Point::new(40, 40), Point::new(40, 60));
        let rect = clamp_region(sel.bounds(), Size::new(100, 100)).unwrap();
        assert_eq!(rect, Rect::new(40, 50, 1, 1));
    }

    #[test]
    fn test_clamp_region_off_frame() {
        let sel = TargetSelection::new(Point::new(200, 200), Point::new(300, 300));
        let rect = clamp_region(sel.bounds(), Size::new(100, 100)).unwrap();
        assert_eq!((rect.width, rect.height), (1, 1));
    }

    #[test]
    fn test_markup_learns_green_target() {
        let source = source();
        let sel = TargetSelection::new(Point::new(92, 92), Point::new(108, 108));
        let target = markup_target(&source, &sel, &TrackerConfig::default()).unwrap();

        assert_eq!((target.profile.hue.lower, target.profile.hue.upper), (50, 70));
        assert_relative_eq!(target.observation, Vector2::new(100.0, 100.0));
        assert_eq!(target.frame_size, Size::new(320, 240));
        assert!(target.frame_index >= 2);
        assert_eq!(target.gray.channels(), 1);
    }

    #[test]
    fn test_markup_detects_seeds_in_box() {
        let source = source();
        let sel = TargetSelection::new(Point::new(80, 80), Point::new(120, 120));
        let target = markup_target(&source, &sel, &TrackerConfig::default()).unwrap();

        assert!(!target.seeds.is_empty());
        for p in &target.seeds {
            assert!(p.x >= 80.0 && p.x <= 120.0 && p.y >= 80.0 && p.y <= 120.0);
        }
    }

    #[test]
    fn test_markup_prefers_user_keypoints() {
        let source = source();
        let keypoints = vec![Point2f::new(95.0, 95.0)];
        let sel = TargetSelection::with_keypoints(
            Point::new(80, 80),
            Point::new(120, 120),
            keypoints.clone(),
        );
        let target = markup_target(&source, &sel, &TrackerConfig::default()).unwrap();
        assert_eq!(target.seeds, keypoints);
    }

    #[test]
    fn test_markup_drops_keypoints_outside_region() {
        let source = source();
        let sel = TargetSelection::with_keypoints(
            Point::new(80, 80),
            Point::new(120, 120),
            vec![
                Point2f::new(95.0, 95.0),
                Point2f::new(10.0, 10.0),
                Point2f::new(120.5, 100.0),
            ],
        );
        let target = markup_target(&source, &sel, &TrackerConfig::default()).unwrap();
        assert_eq!(target.seeds, vec![Point2f::new(95.0, 95.0)]);
    }

    #[test]
    fn test_keypoints_clipped_with_overhanging_region() {
        let source = source();
        // The box overhangs the left edge, so x = -5 falls outside the clamped region.
        let sel = TargetSelection::with_keypoints(
            Point::new(-20, 80),
            Point::new(40, 120),
            vec![Point2f::new(-5.0, 100.0), Point2f::new(5.0, 100.0)],
        );
        let target = markup_target(&source, &sel, &TrackerConfig::default()).unwrap();
        assert_eq!(target.seeds, vec![Point2f::new(5.0, 100.0)]);
    }

    #[test]
    fn test_single_pixel_selection() {
        let source = source();
        let sel = TargetSelection::new(Point::new(100, 100), Point::new(100, 100));
        let target = markup_target(&source, &sel, &TrackerConfig::default()).unwrap();
        assert_eq!((target.profile.hue.lower, target.profile.hue.upper), (50, 70));
        assert_relative_eq!(target.observation, Vector2::new(100.0, 100.0));
    }

    #[test]
    fn test_await_markup_times_out() {
        let source = source();
        let (_tx, rx) = selection_channel();
        let result = await_markup(
            &source,
            &rx,
            Duration::from_millis(20),
            &TrackerConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_markup_on_closed_source_fails() {
        let source = source();
        source.stop();
        let sel = TargetSelection::new(Point::new(92, 92), Point::new(108, 108));
        assert!(markup_target(&source, &sel, &TrackerConfig::default()).is_err());
    }
}
