//! Tracking Engine: the public per-target handle.
//!
//! `TrackingEngine` marks the target up on the caller's thread, then spawns
//! the tracker loop on its own thread. Readers poll it for position packets.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::info;

use crate::config::TrackerConfig;
use crate::filter::{KalmanTracker, PredictiveFilter};
use crate::io::FrameSource;
use crate::tracking::markup::{InitialTarget, await_markup, markup_target};
use crate::tracking::result::{EngineStats, PositionPacket};
use crate::tracking::tracker::Tracker;

use super::messages::{SelectionReceiver, TargetSelection};
use super::shared_state::EngineShared;

/// Handle to one running tracking engine.
pub struct TrackingEngine {
    shared: Arc<EngineShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TrackingEngine {
    /// Mark up `selection` and start tracking with the default Kalman filter.
    pub fn start(
        target_id: u32,
        source: Arc<FrameSource>,
        selection: &TargetSelection,
        config: &TrackerConfig,
    ) -> Result<Self> {
        let filter = KalmanTracker::new(&config.kalman);
        Self::start_with_filter(target_id, source, selection, config, filter)
    }

    /// Mark up `selection` and start tracking with a caller-supplied filter.
    pub fn start_with_filter<F: PredictiveFilter + 'static>(
        target_id: u32,
        source: Arc<FrameSource>,
        selection: &TargetSelection,
        config: &TrackerConfig,
        filter: F,
    ) -> Result<Self> {
        let initial = markup_target(&source, selection, config)?;
        Self::spawn(target_id, source, initial, config, filter)
    }

    /// Block until a selection arrives on `receiver`, then start tracking.
    pub fn await_and_start(
        target_id: u32,
        source: Arc<FrameSource>,
        receiver: &SelectionReceiver,
        timeout: Duration,
        config: &TrackerConfig,
    ) -> Result<Self> {
        let initial = await_markup(&source, receiver, timeout, config)?;
        let filter = KalmanTracker::new(&config.kalman);
        Self::spawn(target_id, source, initial, config, filter)
    }

    fn spawn<F: PredictiveFilter + 'static>(
        target_id: u32,
        source: Arc<FrameSource>,
        initial: InitialTarget,
        config: &TrackerConfig,
        filter: F,
    ) -> Result<Self> {
        let shared = EngineShared::new(
            target_id,
            initial.frame_size.width,
            initial.frame_size.height,
            initial.timestamp,
            initial.observation,
        );

        let mut tracker = Tracker::new(source, filter, initial, config, Arc::clone(&shared))?;
        let handle = thread::Builder::new()
            .name(format!("tracking-{}", target_id))
            .spawn(move || tracker.run())?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn target_id(&self) -> u32 {
        self.shared.target_id
    }

    /// Latest locked position, at most once per produced estimate.
    pub fn get_pos_data(&self) -> Option<PositionPacket> {
        self.shared.take_packet()
    }

    pub fn is_locked(&self) -> bool {
        self.shared.is_locked()
    }

    /// False once the engine loop has exited.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats()
    }

    /// Stop the engine thread and wait for it. Idempotent.
    pub fn stop(&self) {
        self.shared.request_stop();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
            info!(target_id = self.shared.target_id, "Tracking engine joined");
        }
    }
}

impl Drop for TrackingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
