//! Engine orchestration: thread ownership, shared state and the
//! selection handoff.

pub mod messages;
pub mod shared_state;
mod tracking_engine;

pub use messages::{SelectionReceiver, SelectionSender, TargetSelection, selection_channel};
pub use shared_state::EngineShared;
pub use tracking_engine::TrackingEngine;
