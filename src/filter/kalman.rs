use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};
use tracing::warn;

use crate::config::KalmanConfig;

use super::PredictiveFilter;

/// Constant-velocity Kalman filter in image coordinates.
///
/// Predict and update run on independent timers: the caller feeds frame
/// deltas through [`PredictiveFilter::update_elapsed_counters`] and asks each
/// stage whether it is due.
#[derive(Debug, Clone)]
pub struct KalmanTracker {
    x: Vector4<f64>,
    p: Matrix4<f64>,
    observation_mat: Matrix2x4<f64>,
    measurement_cov: Matrix2<f64>,
    position_noise: f64,
    velocity_noise: f64,

    predict_interval: f64,
    update_interval: f64,
    predict_elapsed: f64,
    update_elapsed: f64,
    /// Time latched by the last `predict_stage_elapsed` that fired.
    pending_dt: f64,
}

impl KalmanTracker {
    pub fn new(config: &KalmanConfig) -> Self {
        let mut observation_mat = Matrix2x4::zeros();
        observation_mat[(0, 0)] = 1.0;
        observation_mat[(1, 1)] = 1.0;

        let p = Matrix4::from_diagonal(&Vector4::new(
            config.initial_position_variance,
            config.initial_position_variance,
            config.initial_velocity_variance,
            config.initial_velocity_variance,
        ));

        Self {
            x: Vector4::zeros(),
            p,
            observation_mat,
            measurement_cov: Matrix2::identity() * config.measurement_noise,
            position_noise: config.position_noise,
            velocity_noise: config.velocity_noise,
            predict_interval: config.predict_interval,
            update_interval: config.update_interval,
            predict_elapsed: 0.0,
            update_elapsed: 0.0,
            pending_dt: 0.0,
        }
    }

    fn motion_mat(dt: f64) -> Matrix4<f64> {
        let mut f = Matrix4::identity();
        f[(0, 2)] = dt;
        f[(1, 3)] = dt;
        f
    }
}

impl PredictiveFilter for KalmanTracker {
    fn predict(&mut self) {
        let dt = if self.pending_dt > 0.0 {
            self.pending_dt
        } else {
            self.predict_interval
        };
        self.pending_dt = 0.0;

        let f = Self::motion_mat(dt);
        let q = Matrix4::from_diagonal(&Vector4::new(
            self.position_noise * dt,
            self.position_noise * dt,
            self.velocity_noise * dt,
            self.velocity_noise * dt,
        ));

        self.x = f * self.x;
        self.p = f * self.p * f.transpose() + q;
    }

    fn update(&mut self, observation: &Vector2<f64>) {
        let h = &self.observation_mat;
        let s = h * self.p * h.transpose() + self.measurement_cov;
        let Some(chol) = s.cholesky() else {
            warn!("Innovation covariance not SPD, skipping update");
            return;
        };

        let gain = self.p * h.transpose() * chol.inverse();
        let innovation = observation - h * self.x;

        self.x += gain * innovation;
        self.p = (Matrix4::identity() - gain * h) * self.p;
    }

    fn observe_model(&self) -> Vector2<f64> {
        self.observation_mat * self.x
    }

    fn predict_stage_elapsed(&mut self) -> bool {
        if self.predict_elapsed >= self.predict_interval {
            self.pending_dt = self.predict_elapsed;
            self.predict_elapsed = 0.0;
            true
        } else {
            false
        }
    }

    fn update_stage_elapsed(&mut self) -> bool {
        if self.update_elapsed >= self.update_interval {
            self.update_elapsed = 0.0;
            true
        } else {
            false
        }
    }

    fn update_elapsed_counters(&mut self, delta_time: f64) {
        if delta_time.is_finite() && delta_time > 0.0 {
            self.predict_elapsed += delta_time;
            self.update_elapsed += delta_time;
        }
    }

    fn state(&self) -> &Vector4<f64> {
        &self.x
    }

    fn covariance(&self) -> &Matrix4<f64> {
        &self.p
    }

    fn set_position(&mut self, position: &Vector2<f64>) {
        self.x = Vector4::new(position.x, position.y, 0.0, 0.0);
    }
}
