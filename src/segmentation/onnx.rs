use super::types::{Matte, SegmentationModel};
use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use ndarray::{Array1, Array4, ArrayD};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;
use std::path::Path;

/// Hidden states of a recurrent matting network (RVM style)
///
/// They are fed back on every frame for temporal consistency.
struct RecurrentState {
    states: Option<[ArrayD<f32>; 4]>,
    downsample_ratio: f32,
    /// Whether the graph takes the downsample ratio as an extra input
    takes_ratio: bool,
}

/// ONNX matting/segmentation network
///
/// Two graph shapes are recognized from the model inputs:
/// - a single image input producing one mask output (selfie/MODNet style)
/// - an image input plus four recurrent states, optionally followed by a
///   downsample ratio (RobustVideoMatting); outputs are fgr, pha, r1..r4
pub struct OnnxMatting {
    session: Session,
    width: u32,
    height: u32,
    recurrent: Option<RecurrentState>,
}

impl OnnxMatting {
    /// Load a model and size its input to `input_size` (width, height)
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: (u32, u32)) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        let input_count = session.inputs.len();
        let recurrent = match input_count {
            1 => None,
            5 | 6 => Some(RecurrentState {
                states: None,
                downsample_ratio: 0.25,
                takes_ratio: input_count == 6,
            }),
            n => bail!("Unsupported model layout: {} inputs", n),
        };

        tracing::info!(
            "Segmentation model loaded ({} inputs, recurrent={})",
            input_count,
            recurrent.is_some()
        );

        let (width, height) = input_size;
        Ok(Self {
            session,
            width,
            height,
            recurrent,
        })
    }

    /// Resize and convert an RGB frame into a normalized NCHW tensor
    fn to_tensor(&self, frame: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let source = if frame.dimensions() != (self.width, self.height) {
            resized = imageops::resize(
                frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            frame
        };

        Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| source.get_pixel(x as u32, y as u32)[c] as f32 / 255.0,
        )
    }

    fn run_stateless(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let outputs = self
            .session
            .run(ort::inputs![Tensor::from_array(input)?])
            .context("Failed to run inference")?;
        Ok(outputs[0].try_extract_array::<f32>()?.to_owned())
    }

    fn run_recurrent(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let (width, height) = (self.width, self.height);
        let Some(state) = self.recurrent.as_mut() else {
            bail!("Model has no recurrent state");
        };

        let [r1, r2, r3, r4] = match state.states.take() {
            Some(states) => states,
            None => zero_states(width, height, state.downsample_ratio),
        };

        let mut inputs: Vec<SessionInputValue<'_>> = vec![
            Tensor::from_array(input)?.into(),
            Tensor::from_array(r1)?.into(),
            Tensor::from_array(r2)?.into(),
            Tensor::from_array(r3)?.into(),
            Tensor::from_array(r4)?.into(),
        ];
        if state.takes_ratio {
            let ratio = Array1::from_elem(1, state.downsample_ratio);
            inputs.push(Tensor::from_array(ratio)?.into());
        }

        let outputs = self
            .session
            .run(inputs.as_slice())
            .context("Failed to run inference")?;

        let pha = outputs[1].try_extract_array::<f32>()?.to_owned();
        let next = [
            outputs[2].try_extract_array::<f32>()?.to_owned(),
            outputs[3].try_extract_array::<f32>()?.to_owned(),
            outputs[4].try_extract_array::<f32>()?.to_owned(),
            outputs[5].try_extract_array::<f32>()?.to_owned(),
        ];
        drop(outputs);

        if let Some(state) = self.recurrent.as_mut() {
            state.states = Some(next);
        }
        Ok(pha)
    }
}

fn zero_states(width: u32, height: u32, ratio: f32) -> [ArrayD<f32>; 4] {
    let h = (height as f32 * ratio) as usize;
    let w = (width as f32 * ratio) as usize;
    tracing::debug!("Initializing hidden states to {}x{}", w, h);
    [
        Array4::<f32>::zeros((1, 16, h, w)).into_dyn(),
        Array4::<f32>::zeros((1, 20, h / 2, w / 2)).into_dyn(),
        Array4::<f32>::zeros((1, 24, h / 4, w / 4)).into_dyn(),
        Array4::<f32>::zeros((1, 28, h / 8, w / 8)).into_dyn(),
    ]
}

/// Spatial size (width, height) of a mask tensor in NCHW or NHWC layout
fn mask_dimensions(mask: &ArrayD<f32>) -> Result<(u32, u32)> {
    match mask.shape() {
        [1, 1, h, w] => Ok((*w as u32, *h as u32)),
        [1, h, w, 1] => Ok((*w as u32, *h as u32)),
        [1, h, w] => Ok((*w as u32, *h as u32)),
        other => bail!("Unexpected mask shape {:?}", other),
    }
}

/// Resize a model-resolution matte to the frame resolution
fn resize_matte(alpha: Vec<f32>, width: u32, height: u32, target: (u32, u32)) -> Matte {
    let _span = tracing::debug_span!("postprocess").entered();

    if (width, height) == target {
        return Matte::new(width, height, alpha);
    }

    let gray = image::GrayImage::from_fn(width, height, |x, y| {
        let value = (alpha[(y * width + x) as usize] * 255.0).clamp(0.0, 255.0) as u8;
        image::Luma([value])
    });
    let resized = imageops::resize(&gray, target.0, target.1, imageops::FilterType::Triangle);
    let alpha = resized.pixels().map(|p| p[0] as f32 / 255.0).collect();
    Matte::new(target.0, target.1, alpha)
}

impl SegmentationModel for OnnxMatting {
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte> {
        let _span = tracing::debug_span!("onnx_segment").entered();

        let input = self.to_tensor(frame);
        let mask = if self.recurrent.is_some() {
            self.run_recurrent(input)?
        } else {
            self.run_stateless(input)?
        };

        let (width, height) = mask_dimensions(&mask)?;
        let alpha: Vec<f32> = mask.iter().copied().collect();
        Ok(resize_matte(alpha, width, height, frame.dimensions()))
    }

    fn reset_state(&mut self) {
        if let Some(state) = self.recurrent.as_mut() {
            tracing::info!("Resetting recurrent hidden states");
            state.states = None;
        }
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
