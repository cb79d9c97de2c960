//! Capture device seam.
//!
//! The Frame Source drives a device through [`CaptureDevice`] so the capture
//! loop is independent of where pixels come from. [`OpenCvDevice`] wraps an
//! OpenCV `VideoCapture` opened on a camera index or a video file.

use anyhow::{Result, bail};
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use tracing::{info, warn};

use crate::config::CameraConfig;

/// A source of BGR frames owned by exactly one capture thread.
pub trait CaptureDevice: Send + 'static {
    /// Latch the next frame. Returns `false` when no frame could be grabbed.
    fn grab(&mut self) -> Result<bool>;

    /// Decode the frame latched by the last successful `grab`.
    fn retrieve(&mut self) -> Result<Mat>;

    fn is_opened(&self) -> bool;

    /// Release the underlying handle. Called once, after the capture loop ends.
    fn release(&mut self) -> Result<()>;
}

/// Where to open a device from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Camera index as enumerated by the OS backend.
    Index(i32),
    /// Video file or stream URL.
    Path(String),
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSpec::Index(id) => write!(f, "camera {}", id),
            DeviceSpec::Path(path) => write!(f, "{}", path),
        }
    }
}

/// OpenCV-backed capture device.
pub struct OpenCvDevice {
    cap: VideoCapture,
}

impl OpenCvDevice {
    /// Open the device described by `spec`. Failure to open is fatal.
    pub fn open(spec: &DeviceSpec, config: &CameraConfig) -> Result<Self> {
        let mut cap = match spec {
            DeviceSpec::Index(id) => VideoCapture::new(*id, videoio::CAP_ANY)?,
            DeviceSpec::Path(path) => VideoCapture::from_file(path, videoio::CAP_ANY)?,
        };

        if !cap.is_opened()? {
            bail!("Failed to open capture device: {}", spec);
        }

        if let DeviceSpec::Index(_) = spec {
            let width_ok = cap.set(
                videoio::CAP_PROP_FRAME_WIDTH,
                config.capture_width as f64,
            )?;
            let height_ok = cap.set(
                videoio::CAP_PROP_FRAME_HEIGHT,
                config.capture_height as f64,
            )?;
            if !(width_ok && height_ok) {
                warn!(
                    "{} rejected capture resolution {}x{}",
                    spec, config.capture_width, config.capture_height
                );
            }
        }

        let width = videoio::VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)?;
        let height = videoio::VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)?;
        info!("Opened {} at {}x{}", spec, width, height);

        Ok(Self { cap })
    }
}

impl CaptureDevice for OpenCvDevice {
    fn grab(&mut self) -> Result<bool> {
        Ok(self.cap.grab()?)
    }

    fn retrieve(&mut self) -> Result<Mat> {
        let mut frame = Mat::default();
        if !self.cap.retrieve(&mut frame, 0)? || frame.empty() {
            bail!("Grabbed frame could not be decoded");
        }
        Ok(frame)
    }

    fn is_opened(&self) -> bool {
        self.cap.is_opened().unwrap_or(false)
    }

    fn release(&mut self) -> Result<()> {
        self.cap.release()?;
        Ok(())
    }
}
