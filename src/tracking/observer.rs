//! Per-cycle measurement: both units, fusion and the lock update.

use anyhow::Result;
use nalgebra::Vector2;
use opencv::core::Mat;
use opencv::imgproc;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::filter::PredictiveFilter;
use crate::measurement::{ColorUnit, FlowUnit};

use super::fusion::{FusionBranch, is_discontinuous};
use super::state::{LockState, TrackingState};

pub struct TargetObserver {
    color: ColorUnit,
    flow: FlowUnit,
    lock: LockState,
    config: LockConfig,
}

impl TargetObserver {
    pub fn new(color: ColorUnit, flow: FlowUnit, lock: LockState, config: LockConfig) -> Self {
        Self {
            color,
            flow,
            lock,
            config,
        }
    }

    /// Measure the target in `bgr` and advance the lock state.
    ///
    /// The filter is read, never written: its current estimate picks the
    /// colour blob and gates the discontinuity test. A vision error inside
    /// either unit counts as a miss for that unit.
    pub fn observe<F: PredictiveFilter + ?Sized>(&mut self, bgr: &Mat, filter: &F) -> FusionBranch {
        let estimate = filter.observe_model();

        let color_obs = self.color.observe(bgr, &estimate).unwrap_or_else(|e| {
            warn!("Colour measurement failed: {:#}", e);
            None
        });

        let seed = color_obs.map(|c| (c, self.color.target_radius()));
        let flow_obs = self.observe_flow(bgr, seed).unwrap_or_else(|e| {
            warn!("Flow measurement failed: {:#}", e);
            None
        });

        let discontinuous = match (&color_obs, &flow_obs) {
            (Some(c), Some(f)) => is_discontinuous(
                c,
                f,
                self.color.target_radius(),
                &estimate,
                &filter.velocity(),
                &self.config,
            ),
            _ => false,
        };

        let branch = self
            .lock
            .step(color_obs.as_ref(), flow_obs.as_ref(), discontinuous);
        debug!(
            ?branch,
            color = color_obs.is_some(),
            flow = flow_obs.is_some(),
            discontinuous,
            cycles_unlocked = self.lock.cycles_unlocked(),
            "Measurement cycle"
        );
        branch
    }

    fn observe_flow(
        &mut self,
        bgr: &Mat,
        seed: Option<(Vector2<f64>, f64)>,
    ) -> Result<Option<Vector2<f64>>> {
        let mut gray = Mat::default();
        imgproc::cvt_color_def(bgr, &mut gray, imgproc::COLOR_BGR2GRAY)?;
        self.flow.observe(&gray, seed)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn observation(&self) -> &Vector2<f64> {
        self.lock.observation()
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.lock.tracking_state()
    }

    /// Consecutive cycles without a usable observation.
    pub fn cycles_unlocked(&self) -> u32 {
        self.lock.cycles_unlocked()
    }

    pub fn flow_tracks(&self) -> usize {
        self.flow.tracks().len()
    }
}
