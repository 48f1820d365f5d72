use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the segmentation pipeline
///
/// The defaults are values that work well for a 30 fps webcam feed with a
/// mid-sized matting network. None of them are hard contracts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of execution contexts tried per initialization cycle
    pub max_init_attempts: u32,
    /// How long a single attempt waits for `init-complete`
    pub init_attempt_timeout: Duration,
    /// Backoff before the second attempt; doubled for every later one
    pub init_backoff_base: Duration,
    /// Upper bound on the backoff delay
    pub init_backoff_max: Duration,
    /// Deadline for a submitted frame
    pub frame_timeout: Duration,
    /// Consecutive timeouts in worker mode that trigger a recovery cycle
    pub timeout_threshold: u32,
    /// Fall back to inline computation when no context comes up
    pub allow_main_thread_fallback: bool,
    pub controller: ControllerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_init_attempts: 3,
            init_attempt_timeout: Duration::from_secs(5),
            init_backoff_base: Duration::from_millis(500),
            init_backoff_max: Duration::from_secs(4),
            frame_timeout: Duration::from_secs(3),
            timeout_threshold: 3,
            allow_main_thread_fallback: true,
            controller: ControllerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Delay before attempt `attempt` (zero-based) of an initialization cycle
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.init_backoff_base
            .saturating_mul(factor)
            .min(self.init_backoff_max)
    }
}

/// Settings for the adaptive frame-skip controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Smallest skip interval (1 = submit every rendered frame)
    pub base_interval: u32,
    pub max_interval: u32,
    /// Nominal per-frame inference budget
    pub frame_budget: Duration,
    /// Rolling latency above this widens the interval by one step
    pub moderate_threshold: Duration,
    /// Rolling latency above this widens the interval by two steps
    pub high_threshold: Duration,
    /// Narrow only when rolling latency is below `frame_budget * recovery_factor`
    pub recovery_factor: f64,
    /// Number of samples in the rolling window
    pub window: usize,
    /// Render-loop frame time above which the interval is never narrowed
    pub render_budget: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_interval: 1,
            max_interval: 8,
            frame_budget: Duration::from_millis(100),
            moderate_threshold: Duration::from_millis(250),
            high_threshold: Duration::from_millis(1000),
            recovery_factor: 0.8,
            window: 5,
            render_budget: Duration::from_millis(50),
        }
    }
}

/// Model settings sent to an execution context in the `init` message
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// ONNX model file; `None` lets the context pick its built-in model
    pub model_path: Option<PathBuf>,
    /// Network input resolution (width, height)
    pub input_size: (u32, u32),
    pub auto_frame: AutoFrameConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            input_size: (512, 512),
            auto_frame: AutoFrameConfig::default(),
        }
    }
}

/// Parameters for deriving the auto-frame transform from a mask
#[derive(Debug, Clone, Copy)]
pub struct AutoFrameConfig {
    /// Mask values at or above this count as foreground
    pub threshold: f32,
    /// Fraction of the frame height the subject should fill
    pub target_fill: f32,
    pub max_zoom: f32,
    /// Ignore masks with less foreground than this fraction of all pixels
    pub min_coverage: f32,
}

impl Default for AutoFrameConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            target_fill: 0.7,
            max_zoom: 2.0,
            min_coverage: 0.01,
        }
    }
}
