//! Tracking engine worker: the per-target control loop.
//!
//! Each cycle pulls the newest frame from the shared Frame Source, advances
//! the filter timers by the time since the last processed frame, then runs
//! whichever of the predict and update stages are due. Results are
//! published under the engine mutex, which is never held while measuring.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::filter::PredictiveFilter;
use crate::io::{Frame, FrameSource};
use crate::measurement::{ColorUnit, FlowUnit};
use crate::system::shared_state::EngineShared;
use crate::tracking::TrackingState;
use crate::tracking::markup::InitialTarget;
use crate::tracking::observer::TargetObserver;
use crate::tracking::state::LockState;

/// Pause when no new frame is available yet.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

pub struct Tracker<F: PredictiveFilter> {
    source: Arc<FrameSource>,
    filter: F,
    observer: TargetObserver,
    shared: Arc<EngineShared>,

    /// Index and monotonic capture instant of the last frame processed.
    last_index: u64,
    last_capture: Instant,

    /// Tracking state after the last update stage, for transition logging.
    state: TrackingState,
}

impl<F: PredictiveFilter> Tracker<F> {
    pub fn new(
        source: Arc<FrameSource>,
        mut filter: F,
        initial: InitialTarget,
        config: &TrackerConfig,
        shared: Arc<EngineShared>,
    ) -> Result<Self> {
        filter.set_position(&initial.observation);

        let color = ColorUnit::new(initial.profile, &config.color)?;
        let mut flow = FlowUnit::new(&config.flow, &config.feature)?;
        flow.seed_points(&initial.gray, &initial.seeds)?;
        let lock = LockState::new(initial.observation, config.lock.max_failed_cycles);
        let observer = TargetObserver::new(color, flow, lock, config.lock.clone());

        Ok(Self {
            source,
            filter,
            observer,
            shared,
            last_index: initial.frame_index,
            last_capture: initial.captured_at,
            state: TrackingState::NotInitialized,
        })
    }

    /// Main loop. Returns when stopped or when the Frame Source closes.
    pub fn run(&mut self) {
        let target_id = self.shared.target_id;
        info!(target_id, "Tracking engine started");
        self.shared.set_running(true);

        loop {
            if self.shared.is_stop_requested() {
                break;
            }
            if !self.source.is_opened() {
                warn!(target_id, "Frame source closed, tracking engine exiting");
                break;
            }

            match self.step() {
                Ok(true) => {}
                Ok(false) => thread::sleep(IDLE_SLEEP),
                Err(e) => {
                    warn!(target_id, "Tracking cycle failed: {:#}", e);
                    thread::sleep(IDLE_SLEEP);
                }
            }
        }

        self.shared.set_running(false);
        let stats = self.shared.stats();
        info!(
            target_id,
            cycles = stats.cycles,
            predicts = stats.predicts,
            updates = stats.updates,
            lock_losses = stats.lock_losses,
            "Tracking engine stopped"
        );
    }

    /// Fetch and process one new frame. `Ok(false)` when nothing new arrived.
    pub fn step(&mut self) -> Result<bool> {
        self.source.request_capture();

        // Cheap staleness check before copying pixels.
        match self.source.latest_index() {
            Some(index) if index > self.last_index => {}
            _ => return Ok(false),
        }
        let Some(frame) = self.source.current_frame()? else {
            return Ok(false);
        };
        if frame.index <= self.last_index {
            return Ok(false);
        }

        self.process_frame(&frame);
        Ok(true)
    }

    /// Run the due filter stages on `frame`.
    pub fn process_frame(&mut self, frame: &Frame) {
        // Wall-clock time can jump; the filter only sees the monotonic gap.
        let dt = frame
            .captured_at
            .saturating_duration_since(self.last_capture)
            .as_secs_f64();
        self.last_index = frame.index;
        self.last_capture = frame.captured_at;
        self.filter.update_elapsed_counters(dt);

        let mut predicted = false;
        if self.filter.predict_stage_elapsed() {
            let mut published = self.shared.published.lock();
            self.filter.predict();
            published.refresh(frame.timestamp, &self.filter);
            predicted = true;
        }

        let mut updated = false;
        if self.filter.update_stage_elapsed() {
            // Measurement runs outside the lock.
            self.observer.observe(&frame.image, &self.filter);
            let locked = self.observer.is_locked();

            let mut published = self.shared.published.lock();
            published.locked = locked;
            if locked {
                self.filter.update(self.observer.observation());
                published.refresh(frame.timestamp, &self.filter);
                updated = true;
            }
            drop(published);

            self.note_transition();
        }

        let mut stats = self.shared.stats.lock();
        stats.cycles += 1;
        stats.predicts += predicted as u64;
        stats.updates += updated as u64;
        debug!(index = frame.index, dt, predicted, updated, "Engine cycle");
    }

    fn note_transition(&mut self) {
        let next = self.observer.tracking_state();
        if next == self.state {
            return;
        }
        let target_id = self.shared.target_id;
        let position = self.filter.position();
        match next {
            TrackingState::Lost => {
                self.shared.stats.lock().lock_losses += 1;
                warn!(target_id, "Target lost");
            }
            TrackingState::Locked if self.state != TrackingState::Coasting => {
                info!(target_id, x = position.x, y = position.y, "Target locked");
            }
            _ => debug!(target_id, from = ?self.state, to = ?next, "Tracking state changed"),
        }
        self.state = next;
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.state
    }
}
