//! Predictive filter seam.
//!
//! The tracking engine only ever talks to a filter through
//! [`PredictiveFilter`]. The state layout is fixed: position at indices
//! 0 and 1 of the state vector, velocity at 2 and 3.

mod kalman;

pub use kalman::KalmanTracker;

use nalgebra::{Matrix4, Vector2, Vector4};

/// A predict/update filter over a 2D constant-velocity state.
pub trait PredictiveFilter: Send {
    /// Project the state forward by the time accumulated for this predict stage.
    fn predict(&mut self);

    /// Correct the state with a position observation in pixels.
    fn update(&mut self, observation: &Vector2<f64>);

    /// Position the filter currently expects to observe.
    fn observe_model(&self) -> Vector2<f64>;

    /// Whether a predict step is due. Consumes the elapsed time when it is,
    /// so it reports `true` at most once per accumulated interval.
    fn predict_stage_elapsed(&mut self) -> bool;

    /// Whether an update step is due. Same latching rule as the predict stage.
    fn update_stage_elapsed(&mut self) -> bool;

    /// Advance both stage timers by `delta_time` seconds.
    fn update_elapsed_counters(&mut self, delta_time: f64);

    /// State vector `x`: `[u, v, du, dv]`.
    fn state(&self) -> &Vector4<f64>;

    /// Error covariance `P`.
    fn covariance(&self) -> &Matrix4<f64>;

    /// Reset the position (and zero the velocity), used once at markup.
    fn set_position(&mut self, position: &Vector2<f64>);

    fn position(&self) -> Vector2<f64> {
        let x = self.state();
        Vector2::new(x[0], x[1])
    }

    fn velocity(&self) -> Vector2<f64> {
        let x = self.state();
        Vector2::new(x[2], x[3])
    }
}
