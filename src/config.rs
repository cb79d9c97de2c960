//! Tracker configuration.
//!
//! Every tunable of the pipeline lives here as an immutable value. Each
//! engine receives its own clone, so no two instances ever share (or
//! mutate) a parameter set.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Top-level configuration for a Frame Source and its Tracking Engines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub camera: CameraConfig,
    pub kalman: KalmanConfig,
    pub flow: FlowConfig,
    pub feature: FeatureConfig,
    pub color: ColorConfig,
    pub lock: LockConfig,
}

impl TrackerConfig {
    /// Load a YAML configuration file. Missing keys fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: TrackerConfig = serde_yaml::from_reader(
            File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
        )
        .with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter sets the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.camera.capture_width <= 0 || self.camera.capture_height <= 0 {
            bail!(
                "capture resolution must be positive, got {}x{}",
                self.camera.capture_width,
                self.camera.capture_height
            );
        }
        if self.kalman.predict_interval <= 0.0 || self.kalman.update_interval <= 0.0 {
            bail!("kalman predict/update intervals must be positive");
        }
        if self.kalman.measurement_noise <= 0.0 {
            bail!("kalman measurement noise must be positive");
        }
        if self.flow.track_len == 0 {
            bail!("flow track_len must be at least 1");
        }
        if self.flow.win_size < 3 {
            bail!("flow win_size must be at least 3, got {}", self.flow.win_size);
        }
        if self.feature.max_corners <= 0 {
            bail!("feature max_corners must be positive");
        }
        if self.color.kernel_size <= 0 || self.color.kernel_size % 2 == 0 {
            bail!(
                "color kernel_size must be a positive odd number, got {}",
                self.color.kernel_size
            );
        }
        if self.lock.max_failed_cycles == 0 {
            bail!("lock max_failed_cycles must be at least 1");
        }
        Ok(())
    }
}

/// Capture device parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Requested capture width in pixels.
    pub capture_width: i32,
    /// Requested capture height in pixels.
    pub capture_height: i32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            capture_width: 640,
            capture_height: 480,
        }
    }
}

/// Constant-velocity Kalman filter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Seconds between predict steps.
    pub predict_interval: f64,
    /// Seconds between update (measurement) steps.
    pub update_interval: f64,
    /// Process noise spectral density for position (px²/s).
    pub position_noise: f64,
    /// Process noise spectral density for velocity (px²/s³).
    pub velocity_noise: f64,
    /// Measurement noise variance (px²).
    pub measurement_noise: f64,
    /// Initial position variance (px²).
    pub initial_position_variance: f64,
    /// Initial velocity variance ((px/s)²).
    pub initial_velocity_variance: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            predict_interval: 1.0 / 60.0,
            update_interval: 1.0 / 30.0,
            position_noise: 1.0,
            velocity_noise: 50.0,
            measurement_noise: 4.0,
            initial_position_variance: 100.0,
            initial_velocity_variance: 1000.0,
        }
    }
}

/// Pyramidal Lucas-Kanade parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Search window side length in pixels.
    pub win_size: i32,
    /// Maximum pyramid level (0 = no pyramid).
    pub max_level: i32,
    /// Iteration cap for the LK solver.
    pub max_iterations: i32,
    /// Convergence epsilon for the LK solver.
    pub epsilon: f64,
    /// Maximum number of points kept per track.
    pub track_len: usize,
    /// Forward-backward round-trip error above which a point is dropped (px).
    pub fb_threshold: f32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            win_size: 15,
            max_level: 2,
            max_iterations: 10,
            epsilon: 0.03,
            track_len: 10,
            fb_threshold: 1.0,
        }
    }
}

/// Shi-Tomasi keypoint detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub max_corners: i32,
    pub quality_level: f64,
    pub min_distance: f64,
    pub block_size: i32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            max_corners: 100,
            quality_level: 0.3,
            min_distance: 7.0,
            block_size: 7,
        }
    }
}

/// Colour profile and blob extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    /// Half-width of the hue window around the learned mean (OpenCV hue units, 0..180).
    pub hue_window: f64,
    /// Half-width of the saturation window around the learned mean (0..255).
    pub sat_window: f64,
    /// Side length of the elliptical morphology kernel. Must be odd.
    pub kernel_size: i32,
    /// Radius added to the blob-equivalent radius, and the radius used before the first blob.
    pub base_target_radius: f64,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            hue_window: 10.0,
            sat_window: 60.0,
            kernel_size: 5,
            base_target_radius: 10.0,
        }
    }
}

/// Target lock parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Consecutive failed cycles after which the target counts as lost.
    pub max_failed_cycles: u32,
    /// Jumps shorter than this are always accepted (px).
    pub dead_zone: f64,
    /// Scale applied to the colour radius and to the filter speed in the discontinuity test.
    pub shift_multiplier: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_failed_cycles: 10,
            dead_zone: 20.0,
            shift_multiplier: 3.0,
        }
    }
}
