//! Real-time segmentation pipeline for webcam effects.
//!
//! [`PipelineManager`](pipeline::PipelineManager) runs person/background
//! segmentation in an isolated execution context and keeps the render loop
//! smooth: one frame in flight at a time, per-frame deadlines, an adaptive
//! skip interval, and bounded recovery that degrades to inline computation
//! or no segmentation instead of failing.

pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod segmentation;

#[cfg(test)]
mod test_utils;

pub use config::{ControllerConfig, ModelConfig, PipelineConfig};
pub use error::PipelineError;
pub use pipeline::{FrameResult, FrameStatus, PipelineManager, PipelineMode};
