//! Scripted execution contexts for pipeline tests.

use crate::config::ModelConfig;
use crate::context::{channel, ContextEndpoint, ContextEvent, ContextFactory, ContextHandle, ContextRequest};
use crate::error::ContextError;
use crate::segmentation::{Matte, SegmentationModel};
use anyhow::Result;
use image::RgbImage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a context reacts to `init` (or to being spawned at all)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitScript {
    Ready,
    Fail,
    Hang,
    SpawnError,
    Unsupported,
}

/// How a context reacts to one submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScript {
    Respond(Duration),
    Hang,
    Fail,
    Crash,
}

/// Model that marks every pixel as foreground
pub struct FullMatte;

impl SegmentationModel for FullMatte {
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte> {
        let (w, h) = frame.dimensions();
        Ok(Matte::new(w, h, vec![1.0; (w * h) as usize]))
    }

    fn input_size(&self) -> (u32, u32) {
        (16, 16)
    }
}

pub struct ScriptedFactory {
    inits: Mutex<VecDeque<InitScript>>,
    frames: Arc<Mutex<VecDeque<FrameScript>>>,
    spawn_calls: AtomicUsize,
    terminations: Mutex<Vec<Arc<AtomicUsize>>>,
    inline: bool,
}

impl ScriptedFactory {
    /// Contexts follow `inits` in order, then default to `Ready`
    pub fn new(inits: impl IntoIterator<Item = InitScript>) -> Self {
        Self {
            inits: Mutex::new(inits.into_iter().collect()),
            frames: Arc::new(Mutex::new(VecDeque::new())),
            spawn_calls: AtomicUsize::new(0),
            terminations: Mutex::new(Vec::new()),
            inline: false,
        }
    }

    /// Frames follow `frames` in order, then answer after 10ms
    pub fn with_frames(self, frames: impl IntoIterator<Item = FrameScript>) -> Self {
        self.frames.lock().extend(frames);
        self
    }

    pub fn with_inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    /// Number of `spawn` calls, failed ones included
    pub fn spawn_calls(&self) -> usize {
        self.spawn_calls.load(Ordering::SeqCst)
    }

    /// `terminate` notices received, per constructed context
    pub fn terminations(&self) -> Vec<usize> {
        self.terminations
            .lock()
            .iter()
            .map(|count| count.load(Ordering::SeqCst))
            .collect()
    }
}

impl ContextFactory for ScriptedFactory {
    fn spawn(&self, generation: u64) -> Result<ContextHandle, ContextError> {
        self.spawn_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.inits.lock().pop_front().unwrap_or(InitScript::Ready);

        match script {
            InitScript::SpawnError => {
                return Err(ContextError::Spawn(std::io::Error::other(format!(
                    "spawn {} refused",
                    generation
                ))))
            }
            InitScript::Unsupported => {
                return Err(ContextError::Unsupported("no isolated contexts".to_string()))
            }
            _ => {}
        }

        let (handle, endpoint) = channel(generation);
        let terminated = Arc::new(AtomicUsize::new(0));
        self.terminations.lock().push(Arc::clone(&terminated));
        tokio::spawn(run_scripted(
            endpoint,
            script,
            Arc::clone(&self.frames),
            terminated,
        ));
        Ok(handle)
    }

    fn inline_model(&self, _config: &ModelConfig) -> Option<Box<dyn SegmentationModel>> {
        self.inline
            .then(|| Box::new(FullMatte) as Box<dyn SegmentationModel>)
    }
}

async fn run_scripted(
    mut endpoint: ContextEndpoint,
    init: InitScript,
    frames: Arc<Mutex<VecDeque<FrameScript>>>,
    terminated: Arc<AtomicUsize>,
) {
    while let Some(request) = endpoint.requests.recv().await {
        let event = match request {
            ContextRequest::Init(_) => match init {
                InitScript::Ready => ContextEvent::InitComplete {
                    success: true,
                    error: None,
                },
                InitScript::Fail => ContextEvent::InitComplete {
                    success: false,
                    error: Some("model failed to load".to_string()),
                },
                _ => continue,
            },
            ContextRequest::SubmitFrame {
                sequence_id, image, ..
            } => {
                let script = frames
                    .lock()
                    .pop_front()
                    .unwrap_or(FrameScript::Respond(Duration::from_millis(10)));
                match script {
                    FrameScript::Respond(delay) => {
                        tokio::time::sleep(delay).await;
                        let (w, h) = image.dimensions();
                        ContextEvent::FrameReady {
                            sequence_id,
                            mask: Some(Matte::new(w, h, vec![1.0; (w * h) as usize])),
                            transform: None,
                        }
                    }
                    FrameScript::Hang => continue,
                    FrameScript::Fail => ContextEvent::Error {
                        sequence_id: Some(sequence_id),
                        message: "inference failed".to_string(),
                    },
                    FrameScript::Crash => return,
                }
            }
            ContextRequest::Terminate => {
                terminated.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        if endpoint.events.send(event).is_err() {
            return;
        }
    }
}
