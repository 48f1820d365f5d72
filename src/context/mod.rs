//! Message contract between the pipeline and an isolated execution context.
//!
//! The pipeline talks to exactly one context at a time over a pair of
//! channels. Requests flow in, events flow out. Images and masks travel by
//! value, so once a frame is submitted the caller no longer owns it.
//!
//! Order of a context's life:
//! 1. `Init` is sent, and nothing else until `InitComplete` arrives.
//! 2. Any number of `SubmitFrame` requests, each answered by at most one
//!    `FrameReady` or `Error` event.
//! 3. `Terminate`, after which the context is torn down.
//!
//! If the channel itself breaks (the context died or never existed), the
//! receiving side yields a synthetic `Error` without a sequence id.

mod thread;

pub use thread::ThreadContextFactory;

use crate::config::ModelConfig;
use crate::error::{ContextError, PipelineError};
use crate::segmentation::{AutoFrameTransform, Matte, SegmentationModel};
use image::RgbImage;
use tokio::sync::mpsc;

/// Pipeline → context
#[derive(Debug)]
pub enum ContextRequest {
    Init(ModelConfig),
    SubmitFrame {
        sequence_id: u64,
        image: RgbImage,
        auto_frame: bool,
    },
    Terminate,
}

/// Context → pipeline
#[derive(Debug)]
pub enum ContextEvent {
    InitComplete {
        success: bool,
        error: Option<String>,
    },
    FrameReady {
        sequence_id: u64,
        mask: Option<Matte>,
        transform: Option<AutoFrameTransform>,
    },
    Error {
        sequence_id: Option<u64>,
        message: String,
    },
}

/// Creates execution contexts for the pipeline manager
pub trait ContextFactory: Send + Sync {
    /// Bring up a fresh context tagged with `generation`
    fn spawn(&self, generation: u64) -> Result<ContextHandle, ContextError>;

    /// A model the caller can run inline when no context comes up
    ///
    /// Returning `None` means inline computation is not feasible.
    fn inline_model(&self, _config: &ModelConfig) -> Option<Box<dyn SegmentationModel>> {
        None
    }
}

/// Create a connected pipeline/context channel pair
pub fn channel(generation: u64) -> (ContextHandle, ContextEndpoint) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let handle = ContextHandle {
        sender: ContextSender {
            generation,
            tx: request_tx,
            ready: false,
            terminated: false,
        },
        events: EventReceiver {
            generation,
            rx: event_rx,
        },
    };
    let endpoint = ContextEndpoint {
        requests: request_rx,
        events: event_tx,
    };
    (handle, endpoint)
}

/// The context's side of the channel pair
pub struct ContextEndpoint {
    pub requests: mpsc::UnboundedReceiver<ContextRequest>,
    pub events: mpsc::UnboundedSender<ContextEvent>,
}

/// The pipeline's side of one execution context
pub struct ContextHandle {
    sender: ContextSender,
    events: EventReceiver,
}

impl ContextHandle {
    pub fn generation(&self) -> u64 {
        self.sender.generation
    }

    /// Send `init` and wait for `init-complete`
    ///
    /// The caller bounds the wait; this only interprets the first event.
    pub async fn initialize(&mut self, config: ModelConfig) -> Result<(), PipelineError> {
        self.sender.send(ContextRequest::Init(config))?;

        match self.events.recv().await {
            ContextEvent::InitComplete { success: true, .. } => {
                self.sender.ready = true;
                Ok(())
            }
            ContextEvent::InitComplete { error, .. } => Err(PipelineError::InitFailure(
                error.unwrap_or_else(|| "context reported failure".to_string()),
            )),
            ContextEvent::Error { message, .. } => Err(PipelineError::InitFailure(message)),
            ContextEvent::FrameReady { sequence_id, .. } => Err(PipelineError::InitFailure(
                format!("unexpected frame {} before init-complete", sequence_id),
            )),
        }
    }

    /// Best-effort shutdown notice; consumes the handle
    pub fn terminate(self) {
        let (sender, _events) = self.split();
        sender.terminate();
    }

    pub fn split(self) -> (ContextSender, EventReceiver) {
        (self.sender, self.events)
    }
}

/// Sending half of a context
///
/// Dropping it without calling [`terminate`](Self::terminate) still sends
/// the shutdown notice.
pub struct ContextSender {
    generation: u64,
    tx: mpsc::UnboundedSender<ContextRequest>,
    ready: bool,
    terminated: bool,
}

impl ContextSender {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand a frame to the context. The image is moved, not copied.
    pub fn submit_frame(
        &self,
        sequence_id: u64,
        image: RgbImage,
        auto_frame: bool,
    ) -> Result<(), PipelineError> {
        if !self.ready {
            return Err(PipelineError::ContextLost(
                "frame submitted before init-complete".to_string(),
            ));
        }
        self.send(ContextRequest::SubmitFrame {
            sequence_id,
            image,
            auto_frame,
        })
    }

    pub fn terminate(mut self) {
        self.send_terminate();
    }

    fn send(&self, request: ContextRequest) -> Result<(), PipelineError> {
        self.tx.send(request).map_err(|_| {
            PipelineError::ContextLost(format!("context {} channel closed", self.generation))
        })
    }

    fn send_terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        tracing::debug!("Terminating execution context {}", self.generation);
        let _ = self.tx.send(ContextRequest::Terminate);
    }
}

impl Drop for ContextSender {
    fn drop(&mut self) {
        self.send_terminate();
    }
}

/// Receiving half of a context
pub struct EventReceiver {
    generation: u64,
    rx: mpsc::UnboundedReceiver<ContextEvent>,
}

impl EventReceiver {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next event; a closed channel turns into a sequence-less `Error`
    pub async fn recv(&mut self) -> ContextEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => ContextEvent::Error {
                sequence_id: None,
                message: format!("context {} channel closed", self.generation),
            },
        }
    }
}
