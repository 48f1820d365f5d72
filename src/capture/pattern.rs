use super::CaptureSource;
use anyhow::Result;
use image::{Rgb, RgbImage};

/// Synthetic source: a bright block sweeping across a dark background
///
/// Lets the pipeline run on machines without a camera.
pub struct TestPattern {
    width: u32,
    height: u32,
    tick: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl CaptureSource for TestPattern {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let block_w = (self.width / 4).max(1);
        let block_h = (self.height / 2).max(1);
        let span = self.width.saturating_sub(block_w).max(1);
        let left = (self.tick * 8) % span;
        let top = (self.height - block_h) / 2;
        self.tick = self.tick.wrapping_add(1);

        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            let inside = (left..left + block_w).contains(&x) && (top..top + block_h).contains(&y);
            if inside {
                Rgb([230, 200, 170])
            } else {
                Rgb([20, 30, 40])
            }
        }))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
