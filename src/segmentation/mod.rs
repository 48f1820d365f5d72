mod autoframe;
mod onnx;
pub mod types;

pub use autoframe::compute_transform;
pub use onnx::OnnxMatting;
pub use types::{AutoFrameTransform, Matte, SegmentationModel};

use crate::config::{AutoFrameConfig, ModelConfig};
use anyhow::{Context, Result};

/// Create the default segmentation model for a model configuration
pub fn create_default_model(config: &ModelConfig) -> Result<Box<dyn SegmentationModel>> {
    let path = config
        .model_path
        .as_ref()
        .context("No segmentation model path configured")?;
    let model = OnnxMatting::new(path, config.input_size)?;
    Ok(Box::new(model))
}

/// Run one frame through a model, deriving the auto-frame transform when asked
pub fn segment_frame(
    model: &mut dyn SegmentationModel,
    frame: &image::RgbImage,
    auto_frame: Option<&AutoFrameConfig>,
) -> Result<(Matte, Option<AutoFrameTransform>)> {
    let matte = model.segment(frame)?;
    let transform = auto_frame.and_then(|config| compute_transform(&matte, config));
    Ok((matte, transform))
}
