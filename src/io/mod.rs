//! Frame acquisition: capture devices and the threaded Frame Source.

pub mod device;
pub mod frame_source;
pub mod replay;

pub use device::{CaptureDevice, DeviceSpec, OpenCvDevice};
pub use frame_source::{Frame, FrameSource};
pub use replay::FrameReplay;
