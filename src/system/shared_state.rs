//! State shared between a tracking engine thread and its readers.
//!
//! The engine writes the published snapshot under one mutex right after
//! each predict or locked update; readers take a packet at most once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector2;
use parking_lot::Mutex;

use crate::filter::PredictiveFilter;
use crate::tracking::result::{EngineStats, PositionPacket};

/// Latest filter output as seen by readers.
#[derive(Debug, Clone)]
pub struct PublishedState {
    pub timestamp: f64,
    pub position: Vector2<f64>,
    /// Position variances `P[0,0]` and `P[1,1]`.
    pub variance: Vector2<f64>,
    /// Set once a reader has taken the current snapshot.
    pub read: bool,
    pub locked: bool,
}

impl PublishedState {
    /// Copy the filter output and mark it unread.
    pub fn refresh<F: PredictiveFilter + ?Sized>(&mut self, timestamp: f64, filter: &F) {
        let p = filter.covariance();
        self.timestamp = timestamp;
        self.position = filter.position();
        self.variance = Vector2::new(p[(0, 0)], p[(1, 1)]);
        self.read = false;
    }
}

/// Shared state of one tracking engine.
pub struct EngineShared {
    pub target_id: u32,
    frame_width: i32,
    frame_height: i32,

    /// Snapshot, read flag and lock flag, always taken together.
    pub published: Mutex<PublishedState>,

    pub stats: Mutex<EngineStats>,

    /// Cooperative cancellation, checked at the top of each engine cycle.
    stop_requested: AtomicBool,

    /// True while the engine thread is inside its loop.
    running: AtomicBool,
}

impl EngineShared {
    pub fn new(
        target_id: u32,
        frame_width: i32,
        frame_height: i32,
        timestamp: f64,
        position: Vector2<f64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target_id,
            frame_width,
            frame_height,
            published: Mutex::new(PublishedState {
                timestamp,
                position,
                variance: Vector2::zeros(),
                // Nothing to read until the first predict.
                read: true,
                locked: false,
            }),
            stats: Mutex::new(EngineStats::default()),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(true),
        })
    }

    /// Take the latest packet if the target is locked and nobody read it yet.
    pub fn take_packet(&self) -> Option<PositionPacket> {
        let mut published = self.published.lock();
        if !published.locked || published.read {
            return None;
        }
        published.read = true;
        Some(PositionPacket {
            target_id: self.target_id,
            timestamp: published.timestamp,
            x: published.position.x,
            y: published.position.y,
            confidence: PositionPacket::confidence_from(
                published.variance.x,
                published.variance.y,
                self.frame_width,
                self.frame_height,
            ),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.published.lock().locked
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
