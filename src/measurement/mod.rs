//! Visual measurement units.
//!
//! Each unit turns one frame into an optional pixel position of the target:
//! - `color`: HSV blob centroid against a learned colour profile
//! - `flow`: enclosing-circle centre of Lucas-Kanade tracked keypoints

pub mod color;
pub mod flow;

pub use color::{ColorProfile, ColorUnit, HueRange, SaturationRange};
pub use flow::{FlowTrack, FlowUnit};
