mod frame;
mod pattern;
mod v4l_capture;

pub use frame::{FramePool, VideoFrame};
pub use pattern::TestPatternCapture;
pub use v4l_capture::WebcamCapture;

use anyhow::Result;

/// Trait for camera capture sources
pub trait CaptureSource {
    /// Capture a single frame. The caller must close it when done.
    fn capture_frame(&mut self) -> Result<VideoFrame>;

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);

    /// Detach from the device. No frames are produced afterwards.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
