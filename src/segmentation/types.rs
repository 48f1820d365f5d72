use anyhow::Result;
use image::RgbImage;

/// Alpha matte: 0.0 = background, 1.0 = foreground
///
/// Values are flattened in row-major order and `alpha.len() == width * height`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matte {
    pub width: u32,
    pub height: u32,
    pub alpha: Vec<f32>,
}

impl Matte {
    pub fn new(width: u32, height: u32, alpha: Vec<f32>) -> Self {
        debug_assert_eq!(alpha.len(), (width * height) as usize);
        Self {
            width,
            height,
            alpha,
        }
    }

    /// Fraction of pixels at or above `threshold`
    pub fn coverage(&self, threshold: f32) -> f32 {
        if self.alpha.is_empty() {
            return 0.0;
        }
        let foreground = self.alpha.iter().filter(|&&a| a >= threshold).count();
        foreground as f32 / self.alpha.len() as f32
    }
}

/// Pan/zoom that keeps the subject centered and filling the frame
///
/// Offsets are in normalized frame coordinates (-0.5..=0.5, positive = right/down).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoFrameTransform {
    pub offset_x: f32,
    pub offset_y: f32,
    pub zoom: f32,
}

/// Trait for segmentation models
///
/// The pipeline treats implementations as opaque: an image goes in, a
/// per-pixel foreground matte comes out. Different backends (stateless
/// segmenters, recurrent matting networks) are interchangeable.
pub trait SegmentationModel: Send {
    /// Segment a frame. The returned matte has the frame's dimensions.
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte>;

    /// Reset internal state (for models with temporal/recurrent components)
    ///
    /// Called whenever the frame stream restarts, e.g. after the pipeline
    /// falls back to inline computation.
    fn reset_state(&mut self) {}

    /// Preferred input dimensions (width, height)
    fn input_size(&self) -> (u32, u32);
}
