//! Flow Measurement Unit.
//!
//! Tracks a bounded set of Shi-Tomasi keypoints with pyramidal Lucas-Kanade
//! flow. Every point is tracked forward and then back again; points whose
//! round trip does not land where they started are dropped. The target
//! position is the centre of the smallest circle enclosing the survivors.

use std::collections::VecDeque;

use anyhow::Result;
use nalgebra::Vector2;
use opencv::core::{CV_8UC1, Mat, Point, Point2f, Rect, Scalar, Size, TermCriteria, TermCriteria_Type, Vector};
use opencv::prelude::*;
use opencv::{imgproc, video};
use tracing::debug;

use crate::config::{FeatureConfig, FlowConfig};

/// Position history of one keypoint, newest last.
#[derive(Debug, Clone)]
pub struct FlowTrack {
    points: VecDeque<Point2f>,
}

impl FlowTrack {
    pub fn new(start: Point2f) -> Self {
        let mut points = VecDeque::with_capacity(2);
        points.push_back(start);
        Self { points }
    }

    pub fn last(&self) -> Point2f {
        // A track is never empty: it is created with one point and only ever
        // evicts while above `max_len >= 1`.
        self.points.back().copied().unwrap_or_default()
    }

    /// Append a point, evicting the oldest once more than `max_len` are held.
    pub fn push(&mut self, point: Point2f, max_len: usize) {
        self.points.push_back(point);
        while self.points.len() > max_len.max(1) {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &Point2f> {
        self.points.iter()
    }
}

/// Forward-backward check: the back-tracked point must land within
/// `threshold` pixels (per axis) of where it started.
pub fn forward_backward_consistent(start: Point2f, round_trip: Point2f, threshold: f32) -> bool {
    let dx = (start.x - round_trip.x).abs();
    let dy = (start.y - round_trip.y).abs();
    dx.max(dy) < threshold
}

/// Single-channel mask with a filled circle of 255.
pub fn circle_mask(size: Size, center: &Vector2<f64>, radius: f64) -> Result<Mat> {
    let mut mask = Mat::new_size_with_default(size, CV_8UC1, Scalar::all(0.0))?;
    imgproc::circle(
        &mut mask,
        Point::new(center.x.round() as i32, center.y.round() as i32),
        radius.round().max(1.0) as i32,
        Scalar::all(255.0),
        -1,
        imgproc::LINE_8,
        0,
    )?;
    Ok(mask)
}

/// Single-channel mask with a filled rectangle of 255.
pub fn rect_mask(size: Size, rect: Rect) -> Result<Mat> {
    let mut mask = Mat::new_size_with_default(size, CV_8UC1, Scalar::all(0.0))?;
    imgproc::rectangle(&mut mask, rect, Scalar::all(255.0), -1, imgproc::LINE_8, 0)?;
    Ok(mask)
}

/// Shi-Tomasi corners of `gray` inside `mask`.
pub fn detect_features(gray: &Mat, mask: &Mat, config: &FeatureConfig) -> Result<Vec<Point2f>> {
    let mut corners = Vector::<Point2f>::new();
    imgproc::good_features_to_track(
        gray,
        &mut corners,
        config.max_corners,
        config.quality_level,
        config.min_distance,
        mask,
        config.block_size,
        false,
        0.04,
    )?;
    Ok(corners.to_vec())
}

pub struct FlowUnit {
    tracks: Vec<FlowTrack>,
    prev_gray: Option<Mat>,
    flow: FlowConfig,
    features: FeatureConfig,
    criteria: TermCriteria,
    locked: bool,
}

impl FlowUnit {
    pub fn new(flow: &FlowConfig, features: &FeatureConfig) -> Result<Self> {
        let criteria = TermCriteria::new(
            TermCriteria_Type::COUNT as i32 | TermCriteria_Type::EPS as i32,
            flow.max_iterations,
            flow.epsilon,
        )?;
        Ok(Self {
            tracks: Vec::new(),
            prev_gray: None,
            flow: flow.clone(),
            features: features.clone(),
            criteria,
            locked: false,
        })
    }

    pub fn tracks(&self) -> &[FlowTrack] {
        &self.tracks
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Start one track per given point, with `gray` as the reference frame.
    pub fn seed_points(&mut self, gray: &Mat, points: &[Point2f]) -> Result<()> {
        self.tracks.extend(points.iter().copied().map(FlowTrack::new));
        self.prev_gray = Some(gray.try_clone()?);
        Ok(())
    }

    /// Detect keypoints inside `mask` and start a track for each.
    pub fn seed_in_mask(&mut self, gray: &Mat, mask: &Mat) -> Result<usize> {
        let seeds = detect_features(gray, mask, &self.features)?;
        self.seed_points(gray, &seeds)?;
        Ok(seeds.len())
    }

    /// Measure the target position in a grayscale frame.
    ///
    /// With live tracks, advances them and returns the enclosing-circle
    /// centre. With no tracks, seeds new ones around `seed` (a colour
    /// observation and its radius) and returns `None` for this cycle.
    pub fn observe(
        &mut self,
        gray: &Mat,
        seed: Option<(Vector2<f64>, f64)>,
    ) -> Result<Option<Vector2<f64>>> {
        self.locked = false;
        let prev = self.prev_gray.take();

        let observation = match (&prev, self.tracks.is_empty(), seed) {
            (Some(prev), false, _) => self.advance(prev, gray)?,
            (_, true, Some((center, radius))) => {
                let mask = circle_mask(gray.size()?, &center, radius)?;
                let added = self.seed_in_mask(gray, &mask)?;
                debug!(added, "Seeded flow tracks around colour blob");
                None
            }
            _ => None,
        };

        self.prev_gray = Some(gray.try_clone()?);
        self.locked = observation.is_some();
        Ok(observation)
    }

    fn advance(&mut self, prev: &Mat, gray: &Mat) -> Result<Option<Vector2<f64>>> {
        let p0: Vector<Point2f> = self.tracks.iter().map(FlowTrack::last).collect();
        let win = Size::new(self.flow.win_size, self.flow.win_size);

        // Step 1: forward flow prev -> current
        let mut p1 = Vector::<Point2f>::new();
        let mut status_fwd = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();
        video::calc_optical_flow_pyr_lk(
            prev,
            gray,
            &p0,
            &mut p1,
            &mut status_fwd,
            &mut err,
            win,
            self.flow.max_level,
            self.criteria,
            0,
            1e-4,
        )?;

        // Step 2: backward flow current -> prev
        let mut p0r = Vector::<Point2f>::new();
        let mut status_bwd = Vector::<u8>::new();
        video::calc_optical_flow_pyr_lk(
            gray,
            prev,
            &p1,
            &mut p0r,
            &mut status_bwd,
            &mut err,
            win,
            self.flow.max_level,
            self.criteria,
            0,
            1e-4,
        )?;

        // Step 3: keep only round-trip consistent points
        let before = self.tracks.len();
        let tracks = std::mem::take(&mut self.tracks);
        for (i, mut track) in tracks.into_iter().enumerate() {
            let good = status_fwd.get(i)? != 0
                && status_bwd.get(i)? != 0
                && forward_backward_consistent(p0.get(i)?, p0r.get(i)?, self.flow.fb_threshold);
            if good {
                track.push(p1.get(i)?, self.flow.track_len);
                self.tracks.push(track);
            }
        }
        debug!(before, after = self.tracks.len(), "Flow tracks advanced");

        if self.tracks.is_empty() {
            return Ok(None);
        }

        // Step 4: enclosing circle of the surviving points
        let current: Vector<Point2f> = self.tracks.iter().map(FlowTrack::last).collect();
        let mut center = Point2f::default();
        let mut radius = 0.0f32;
        imgproc::min_enclosing_circle(&current, &mut center, &mut radius)?;
        Ok(Some(Vector2::new(center.x as f64, center.y as f64)))
    }
}
