//! Target selection handoff.
//!
//! A selection UI (or the CLI) hands a [`TargetSelection`] to a waiting
//! engine through a channel scoped to one session. Nothing about the
//! selection lives in global state.

use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use nalgebra::Vector2;
use opencv::core::{Point, Point2f};

/// Pending selections held by one channel.
const SELECTION_CHANNEL_CAPACITY: usize = 1;

/// Bounding box of a selection. Means are truncated to whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBounds {
    pub min_x: i32,
    pub max_x: i32,
    pub mean_x: i32,
    pub min_y: i32,
    pub max_y: i32,
    pub mean_y: i32,
}

impl RegionBounds {
    /// True when the box has no area and only the centre pixel is usable.
    pub fn is_degenerate(&self) -> bool {
        self.min_x == self.max_x || self.min_y == self.max_y
    }

    pub fn centroid(&self) -> Vector2<f64> {
        Vector2::new(self.mean_x as f64, self.mean_y as f64)
    }
}

/// A user-chosen target: two opposite corners and optional keypoints to track.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSelection {
    pub corner_a: Point,
    pub corner_b: Point,
    pub keypoints: Vec<Point2f>,
    bounds: RegionBounds,
}

impl TargetSelection {
    pub fn new(corner_a: Point, corner_b: Point) -> Self {
        Self::with_keypoints(corner_a, corner_b, Vec::new())
    }

    pub fn with_keypoints(corner_a: Point, corner_b: Point, keypoints: Vec<Point2f>) -> Self {
        let bounds = RegionBounds {
            min_x: corner_a.x.min(corner_b.x),
            max_x: corner_a.x.max(corner_b.x),
            mean_x: mean_coord(corner_a.x, corner_b.x),
            min_y: corner_a.y.min(corner_b.y),
            max_y: corner_a.y.max(corner_b.y),
            mean_y: mean_coord(corner_a.y, corner_b.y),
        };
        Self {
            corner_a,
            corner_b,
            keypoints,
            bounds,
        }
    }

    pub fn bounds(&self) -> &RegionBounds {
        &self.bounds
    }
}

/// Truncated mean of two coordinates, summed wide so extreme corners cannot overflow.
fn mean_coord(a: i32, b: i32) -> i32 {
    ((a as i64 + b as i64) / 2) as i32
}

/// Sending half of a selection channel.
#[derive(Clone)]
pub struct SelectionSender {
    tx: Sender<TargetSelection>,
}

impl SelectionSender {
    /// Deliver a selection. Fails once the receiving engine has gone away.
    pub fn send(&self, selection: TargetSelection) -> Result<()> {
        self.tx
            .send(selection)
            .map_err(|_| anyhow!("selection receiver dropped"))
    }
}

/// Receiving half of a selection channel.
pub struct SelectionReceiver {
    rx: Receiver<TargetSelection>,
}

impl SelectionReceiver {
    /// Block until a selection arrives.
    ///
    /// Returns `Ok(None)` on timeout and an error when every sender is gone.
    pub fn await_selection(&self, timeout: Duration) -> Result<Option<TargetSelection>> {
        match self.rx.recv_timeout(timeout) {
            Ok(selection) => Ok(Some(selection)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("selection sender dropped")),
        }
    }
}

/// Create a selection channel for one markup session.
pub fn selection_channel() -> (SelectionSender, SelectionReceiver) {
    let (tx, rx) = bounded(SELECTION_CHANNEL_CAPACITY);
    (SelectionSender { tx }, SelectionReceiver { rx })
}
