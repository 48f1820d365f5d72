use super::{channel, ContextEndpoint, ContextEvent, ContextFactory, ContextHandle, ContextRequest};
use crate::config::{AutoFrameConfig, ModelConfig};
use crate::error::ContextError;
use crate::segmentation::{self, SegmentationModel};
use anyhow::Result;
use std::sync::Arc;

type ModelLoader = dyn Fn(&ModelConfig) -> Result<Box<dyn SegmentationModel>> + Send + Sync;

/// Runs each execution context on its own OS thread
///
/// The thread owns its model exclusively; the model is constructed when
/// `init` arrives, so a slow or failing load never touches the caller.
pub struct ThreadContextFactory {
    loader: Arc<ModelLoader>,
    inline_fallback: bool,
}

impl ThreadContextFactory {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&ModelConfig) -> Result<Box<dyn SegmentationModel>> + Send + Sync + 'static,
    {
        Self {
            loader: Arc::new(loader),
            inline_fallback: true,
        }
    }

    /// Factory backed by [`segmentation::create_default_model`]
    pub fn onnx() -> Self {
        Self::new(segmentation::create_default_model)
    }

    /// Whether the loader may also be used for inline computation
    pub fn with_inline_fallback(mut self, enabled: bool) -> Self {
        self.inline_fallback = enabled;
        self
    }
}

impl ContextFactory for ThreadContextFactory {
    fn spawn(&self, generation: u64) -> Result<ContextHandle, ContextError> {
        let (handle, endpoint) = channel(generation);
        let loader = Arc::clone(&self.loader);

        std::thread::Builder::new()
            .name(format!("segmentation-ctx-{}", generation))
            .spawn(move || run_context(generation, endpoint, loader))?;

        Ok(handle)
    }

    fn inline_model(&self, config: &ModelConfig) -> Option<Box<dyn SegmentationModel>> {
        if !self.inline_fallback {
            return None;
        }
        match (self.loader)(config) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!("Inline segmentation unavailable: {:#}", e);
                None
            }
        }
    }
}

/// Context thread main loop; returns on `Terminate` or when the pipeline hangs up
fn run_context(generation: u64, endpoint: ContextEndpoint, loader: Arc<ModelLoader>) {
    let ContextEndpoint {
        mut requests,
        events,
    } = endpoint;

    let mut model: Option<Box<dyn SegmentationModel>> = None;
    let mut auto_frame = AutoFrameConfig::default();

    tracing::debug!("Execution context {} started", generation);

    while let Some(request) = requests.blocking_recv() {
        let event = match request {
            ContextRequest::Init(config) => match loader(&config) {
                Ok(loaded) => {
                    model = Some(loaded);
                    auto_frame = config.auto_frame;
                    ContextEvent::InitComplete {
                        success: true,
                        error: None,
                    }
                }
                Err(e) => ContextEvent::InitComplete {
                    success: false,
                    error: Some(format!("{:#}", e)),
                },
            },
            ContextRequest::SubmitFrame {
                sequence_id,
                image,
                auto_frame: wants_transform,
            } => match model.as_deref_mut() {
                None => ContextEvent::Error {
                    sequence_id: Some(sequence_id),
                    message: "model not initialized".to_string(),
                },
                Some(model) => {
                    let _span = tracing::debug_span!("context_frame", sequence_id).entered();
                    let frame_config = wants_transform.then_some(&auto_frame);
                    match segmentation::segment_frame(model, &image, frame_config) {
                        Ok((mask, transform)) => ContextEvent::FrameReady {
                            sequence_id,
                            mask: Some(mask),
                            transform,
                        },
                        Err(e) => ContextEvent::Error {
                            sequence_id: Some(sequence_id),
                            message: format!("{:#}", e),
                        },
                    }
                }
            },
            ContextRequest::Terminate => break,
        };

        if events.send(event).is_err() {
            break;
        }
    }

    tracing::debug!("Execution context {} stopped", generation);
}
