//! Frame Source: one capture thread per physical device.
//!
//! Readers call [`FrameSource::request_capture`] to ask for a fresh frame and
//! [`FrameSource::current_frame`] to copy out whatever capture completed
//! last. The `(frame, timestamp, delta)` triple is published as one value
//! under a single lock, so a reader never sees a timestamp paired with
//! another capture's pixels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use opencv::core::Mat;
use opencv::prelude::*;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::CameraConfig;

use super::device::{CaptureDevice, DeviceSpec, OpenCvDevice};

/// Upper bound on how long the capture thread sleeps before re-checking stop.
const WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// A captured BGR frame and its timing.
pub struct Frame {
    pub image: Mat,
    /// Wall-clock capture time in seconds since the UNIX epoch.
    pub timestamp: f64,
    /// Seconds since the previous capture (0 for the first).
    pub delta_time: f64,
    /// Monotonic capture instant. Filter timing is derived from this, never
    /// from the wall-clock `timestamp`.
    pub captured_at: Instant,
    /// 1-based capture counter.
    pub index: u64,
}

impl Frame {
    /// Deep copy, so the caller owns its pixels outright.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            image: self.image.try_clone()?,
            timestamp: self.timestamp,
            delta_time: self.delta_time,
            captured_at: self.captured_at,
            index: self.index,
        })
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }
}

/// State shared between the capture thread and readers.
struct CaptureState {
    latest: Mutex<Option<Frame>>,
    requested: Mutex<bool>,
    request_cv: Condvar,
    stop: AtomicBool,
    opened: AtomicBool,
}

impl CaptureState {
    fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct FrameSource {
    state: Arc<CaptureState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FrameSource {
    /// Open an OpenCV device and start capturing.
    pub fn open(spec: &DeviceSpec, config: &CameraConfig) -> Result<Self> {
        let device = OpenCvDevice::open(spec, config)?;
        Self::with_device(device)
    }

    /// Start a capture thread that owns `device`.
    pub fn with_device<D: CaptureDevice>(device: D) -> Result<Self> {
        if !device.is_opened() {
            bail!("Capture device is not open");
        }

        let state = Arc::new(CaptureState {
            latest: Mutex::new(None),
            // Prime the first capture so readers get a frame promptly.
            requested: Mutex::new(true),
            request_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            opened: AtomicBool::new(true),
        });

        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("frame-source".to_string())
            .spawn(move || run_capture_loop(device, thread_state))?;

        Ok(Self {
            state,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask the capture thread for a new frame. Never blocks on a capture.
    pub fn request_capture(&self) {
        *self.state.requested.lock() = true;
        self.state.request_cv.notify_one();
    }

    /// Copy of the last completed capture, or `None` before the first one.
    pub fn current_frame(&self) -> Result<Option<Frame>> {
        let latest = self.state.latest.lock();
        match latest.as_ref() {
            Some(frame) => Ok(Some(frame.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Index of the last completed capture, without copying pixels.
    pub fn latest_index(&self) -> Option<u64> {
        self.state.latest.lock().as_ref().map(|f| f.index)
    }

    /// False once the device has stopped producing frames or was released.
    pub fn is_opened(&self) -> bool {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Stop the capture thread and release the device. Idempotent.
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        {
            let _requested = self.state.requested.lock();
            self.state.request_cv.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_loop<D: CaptureDevice>(mut device: D, state: Arc<CaptureState>) {
    info!("Frame source thread started");

    let mut last_capture: Option<Instant> = None;
    let mut index: u64 = 0;

    loop {
        // Step 1: wait until a capture is requested or we are told to stop
        {
            let mut requested = state.requested.lock();
            while !*requested && !state.is_stop_requested() {
                state.request_cv.wait_for(&mut requested, WAIT_TIMEOUT);
            }
            if state.is_stop_requested() {
                break;
            }
            // Cleared before capturing so a request arriving mid-capture is kept.
            *requested = false;
        }

        // Step 2: grab, timestamp, decode
        let image = match device.grab() {
            Ok(true) => {
                let now = Instant::now();
                let timestamp = wall_clock_seconds();
                match device.retrieve() {
                    Ok(image) => Some((image, now, timestamp)),
                    Err(e) => {
                        warn!("Frame decode failed: {:#}", e);
                        None
                    }
                }
            }
            Ok(false) => None,
            Err(e) => {
                warn!("Frame grab failed: {:#}", e);
                None
            }
        };

        let Some((image, now, timestamp)) = image else {
            if device.is_opened() {
                // Transient miss; the next request retries.
                continue;
            }
            warn!("Capture device closed after {} frames", index);
            break;
        };

        // Step 3: publish the triple atomically
        let delta_time = last_capture
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        last_capture = Some(now);
        index += 1;

        *state.latest.lock() = Some(Frame {
            image,
            timestamp,
            delta_time,
            captured_at: now,
            index,
        });
        debug!(index, delta_time, "Frame captured");
    }

    state.opened.store(false, Ordering::SeqCst);
    if let Err(e) = device.release() {
        warn!("Device release failed: {:#}", e);
    }
    info!("Frame source thread exiting after {} frames", index);
}

fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
