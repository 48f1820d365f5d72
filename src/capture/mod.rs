mod pattern;
mod webcam;

pub use pattern::TestPattern;
pub use webcam::WebcamCapture;

use anyhow::Result;
use image::RgbImage;

/// Trait for render-loop frame sources
pub trait CaptureSource {
    /// Capture a single frame; the caller owns it and may hand it to the pipeline
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);
}
