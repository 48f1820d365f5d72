use anyhow::{Context, Result};
use camola_pipeline::capture::{CaptureSource, TestPattern, WebcamCapture};
use camola_pipeline::config::{ControllerConfig, ModelConfig, PipelineConfig};
use camola_pipeline::context::ThreadContextFactory;
use camola_pipeline::pipeline::{FrameResult, FrameStatus, PipelineManager, PipelineMode};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Use a synthetic test pattern instead of a webcam
    #[arg(long)]
    test_pattern: bool,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Target frames per second of the render loop
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Path to segmentation model (ONNX file)
    #[arg(long)]
    model: PathBuf,

    /// Model input size (square)
    #[arg(long, default_value_t = 512)]
    model_size: u32,

    /// Compute the auto-frame transform for every result
    #[arg(long)]
    auto_frame: bool,

    /// Per-frame segmentation deadline in milliseconds
    #[arg(long, default_value_t = 3000)]
    frame_timeout_ms: u64,

    /// Execution contexts tried per initialization cycle
    #[arg(long, default_value_t = 3)]
    init_attempts: u32,

    /// Upper bound for the adaptive skip interval
    #[arg(long, default_value_t = 8)]
    max_skip: u32,

    /// Never fall back to inline segmentation on the render loop
    #[arg(long)]
    no_inline_fallback: bool,

    /// Stop after this many rendered frames (0 = run forever)
    #[arg(long, default_value_t = 0)]
    max_frames: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_init_attempts: self.init_attempts,
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            allow_main_thread_fallback: !self.no_inline_fallback,
            controller: ControllerConfig {
                max_interval: self.max_skip,
                render_budget: Duration::from_secs_f32(1.5 / self.fps.max(1) as f32),
                ..ControllerConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model_path: Some(self.model.clone()),
            input_size: (self.model_size, self.model_size),
            ..ModelConfig::default()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Camola starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Target FPS: {}", args.fps);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let mut capture: Box<dyn CaptureSource> = if args.test_pattern {
        tracing::info!("Using synthetic test pattern");
        Box::new(TestPattern::new(args.capture_width, args.capture_height))
    } else {
        Box::new(
            WebcamCapture::new(
                args.input_device,
                args.capture_width,
                args.capture_height,
                args.fps,
            )
            .context("Failed to initialize webcam capture")?,
        )
    };

    let config = args.pipeline_config();
    let factory =
        ThreadContextFactory::onnx().with_inline_fallback(config.allow_main_thread_fallback);
    let manager = Arc::new(PipelineManager::new(config, Arc::new(factory)));

    tracing::info!("Loading segmentation model from {}", args.model.display());
    let mode = manager.initialize(args.model_config()).await;
    match mode {
        PipelineMode::Worker => tracing::info!("Segmentation running in worker mode"),
        other => tracing::warn!("Segmentation degraded: {} mode", other),
    }

    let result = render_loop(capture.as_mut(), &manager, &args).await;
    manager.dispose();
    result
}

#[derive(Default)]
struct RenderStats {
    frames: u64,
    capture_time: Duration,
    results: u64,
    result_latency: Duration,
    timeouts: u64,
    failures: u64,
    last_coverage: f32,
}

impl RenderStats {
    fn record(&mut self, result: &FrameResult) {
        match result.status {
            FrameStatus::Completed => {
                self.results += 1;
                self.result_latency += result.latency;
                if let Some(mask) = &result.mask {
                    self.last_coverage = mask.coverage(0.5);
                }
            }
            FrameStatus::TimedOut => self.timeouts += 1,
            FrameStatus::Failed => self.failures += 1,
            FrameStatus::Busy | FrameStatus::Unavailable => {}
        }
    }
}

/// Stand-in for the compositor's render loop: capture at the target rate and
/// offer every `skip_interval`-th frame to the pipeline without waiting on it.
async fn render_loop(
    capture: &mut dyn CaptureSource,
    manager: &Arc<PipelineManager>,
    args: &Args,
) -> Result<()> {
    let frame_duration = Duration::from_secs_f32(1.0 / args.fps.max(1) as f32);
    let mut modes = manager.subscribe_mode();
    let mut in_flight: Option<JoinHandle<FrameResult>> = None;
    let mut frames_since_submit = u32::MAX;
    let mut stats = RenderStats::default();

    tracing::info!("Starting render loop");
    tracing::info!("Press Ctrl+C to stop");

    loop {
        let loop_start = Instant::now();

        if modes.has_changed().unwrap_or(false) {
            let mode = *modes.borrow_and_update();
            tracing::warn!("Segmentation mode changed to {}", mode);
        }

        let capture_start = Instant::now();
        let frame = capture
            .capture_frame()
            .context("Failed to capture frame")?;
        stats.capture_time += capture_start.elapsed();

        if in_flight.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = in_flight.take() {
                match handle.await {
                    Ok(result) => stats.record(&result),
                    Err(e) => tracing::warn!("Segmentation task failed: {}", e),
                }
            }
        }

        frames_since_submit = frames_since_submit.saturating_add(1);
        let active = matches!(
            manager.mode(),
            PipelineMode::Worker | PipelineMode::MainThread
        );
        if active && in_flight.is_none() && frames_since_submit >= manager.skip_interval() {
            frames_since_submit = 0;
            let manager = Arc::clone(manager);
            let auto_frame = args.auto_frame;
            in_flight = Some(tokio::spawn(async move {
                manager.submit_frame(frame, auto_frame).await
            }));
        }

        stats.frames += 1;

        // Log stats every 30 frames
        if stats.frames % 30 == 0 {
            let avg_capture_ms = stats.capture_time.as_secs_f64() * 1000.0 / stats.frames as f64;
            let avg_latency_ms = if stats.results > 0 {
                stats.result_latency.as_secs_f64() * 1000.0 / stats.results as f64
            } else {
                0.0
            };
            tracing::info!(
                "Frame {}: capture={:.1}ms, segment={:.1}ms, results={}, timeouts={}, failures={}, skip={}, coverage={:.0}%, mode={}",
                stats.frames,
                avg_capture_ms,
                avg_latency_ms,
                stats.results,
                stats.timeouts,
                stats.failures,
                manager.skip_interval(),
                stats.last_coverage * 100.0,
                manager.mode()
            );
        }

        if args.max_frames > 0 && stats.frames >= args.max_frames {
            tracing::info!("Reached {} frames, stopping", stats.frames);
            break;
        }

        // Frame rate limiting
        let elapsed = loop_start.elapsed();
        manager.record_render_frame_time(elapsed);
        if elapsed < frame_duration {
            tokio::time::sleep(frame_duration - elapsed).await;
        }
    }

    tracing::info!("Pipeline stats: {:?}", manager.stats());
    Ok(())
}
