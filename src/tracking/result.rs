//! Engine outputs: position packets and run diagnostics.

use serde::Serialize;

/// One published target position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionPacket {
    pub target_id: u32,
    /// Capture time of the frame behind this estimate, seconds since the UNIX epoch.
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    /// Mean of the position variances normalised by the frame size.
    /// Lower is more certain.
    pub confidence: f64,
}

impl PositionPacket {
    /// Confidence from the position variances `P[0,0]`, `P[1,1]` and the frame size.
    pub fn confidence_from(var_x: f64, var_y: f64, width: i32, height: i32) -> f64 {
        let w = width.max(1) as f64;
        let h = height.max(1) as f64;
        (var_x / w + var_y / h) / 2.0
    }
}

/// Counters for one tracking engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Frames processed.
    pub cycles: u64,
    /// Predict steps run.
    pub predicts: u64,
    /// Update steps run with a locked target.
    pub updates: u64,
    /// Transitions from locked to unlocked.
    pub lock_losses: u64,
}
