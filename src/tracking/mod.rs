//! Per-target tracking: measurement fusion, lock state and the engine loop.
//!
//! - `markup`: one-shot initialization from a target selection
//! - `fusion` / `state`: combine colour and flow, decide whether the target is locked
//! - `observer`: one measurement cycle over both units
//! - `tracker`: the engine thread's control loop

pub mod fusion;
pub mod markup;
pub mod observer;
pub mod result;
pub mod state;
pub mod tracker;

pub use markup::{InitialTarget, await_markup, markup_target};
pub use result::{EngineStats, PositionPacket};
pub use state::{LockState, TrackingState};
pub use tracker::Tracker;
