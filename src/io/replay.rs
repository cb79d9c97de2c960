//! In-memory frame replay device.
//!
//! Serves a fixed sequence of pre-decoded frames through [`CaptureDevice`],
//! either once (then reports no more frames) or looping forever.

use anyhow::{Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;

use super::device::CaptureDevice;

pub struct FrameReplay {
    frames: Vec<Mat>,
    cursor: usize,
    looping: bool,
    opened: bool,
    /// Index latched by the last successful grab.
    pending: Option<usize>,
}

impl FrameReplay {
    /// Replay `frames` once, then stop producing.
    pub fn once(frames: Vec<Mat>) -> Self {
        Self::new(frames, false)
    }

    /// Replay `frames` in a loop until released.
    pub fn looping(frames: Vec<Mat>) -> Self {
        Self::new(frames, true)
    }

    fn new(frames: Vec<Mat>, looping: bool) -> Self {
        Self {
            opened: !frames.is_empty(),
            frames,
            cursor: 0,
            looping,
            pending: None,
        }
    }
}

impl CaptureDevice for FrameReplay {
    fn grab(&mut self) -> Result<bool> {
        if !self.opened {
            return Ok(false);
        }
        if self.cursor >= self.frames.len() {
            if !self.looping {
                self.opened = false;
                return Ok(false);
            }
            self.cursor = 0;
        }
        self.pending = Some(self.cursor);
        self.cursor += 1;
        Ok(true)
    }

    fn retrieve(&mut self) -> Result<Mat> {
        let idx = self.pending.take().context("retrieve called without a grab")?;
        Ok(self.frames[idx].try_clone()?)
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn release(&mut self) -> Result<()> {
        self.opened = false;
        self.frames.clear();
        Ok(())
    }
}
