//! Segmentation pipeline manager.
//!
//! Owns one execution context at a time and keeps the render loop away from
//! inference latency and failures:
//! - `scheduler`: single-flight submission with per-frame deadlines
//! - `controller`: adaptive skip interval from measured latency
//! - `recovery`: lifecycle state machine, bounded retries, demotion
//!
//! Public operations never fail. Problems surface as a mode change or as the
//! `error` field of a [`FrameResult`].

mod controller;
mod recovery;
mod scheduler;

pub use controller::{AdaptiveController, PerformanceSample};
pub use recovery::{InitializationAttempt, Phase, PipelineMode, RecoveryCounters, RecoveryMachine};
pub use scheduler::{FrameResult, FrameScheduler, FrameStatus, FrameTicket, Settled};

use crate::config::{ModelConfig, PipelineConfig};
use crate::context::{ContextEvent, ContextFactory, ContextHandle, ContextSender, EventReceiver};
use crate::error::{ContextError, PipelineError};
use crate::segmentation::{self, SegmentationModel};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Running totals for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub completed: u64,
    pub dropped_busy: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub recoveries: u64,
    pub contexts_spawned: u64,
}

/// The live execution context
struct LiveContext {
    sender: ContextSender,
    pump: JoinHandle<()>,
}

impl LiveContext {
    fn generation(&self) -> u64 {
        self.sender.generation()
    }

    fn shutdown(self) {
        self.pump.abort();
        self.sender.terminate();
    }
}

struct State {
    recovery: RecoveryMachine,
    scheduler: FrameScheduler,
    controller: AdaptiveController,
    context: Option<LiveContext>,
    /// Inline model for main-thread mode; `None` while a frame is using it
    inline: Option<Box<dyn SegmentationModel>>,
    cycle: Option<JoinHandle<()>>,
    model: ModelConfig,
    next_generation: u64,
    last_frame_time: Duration,
    stats: PipelineStats,
}

struct Shared {
    config: PipelineConfig,
    factory: Arc<dyn ContextFactory>,
    state: Mutex<State>,
    mode: watch::Sender<PipelineMode>,
    /// Epoch of the most recently resolved cycle
    settled: watch::Sender<u64>,
}

/// Owns the segmentation execution context and everything around it
///
/// Dropping the manager disposes it.
pub struct PipelineManager {
    shared: Arc<Shared>,
}

impl PipelineManager {
    pub fn new(config: PipelineConfig, factory: Arc<dyn ContextFactory>) -> Self {
        let state = State {
            recovery: RecoveryMachine::new(config.max_init_attempts, config.timeout_threshold),
            scheduler: FrameScheduler::new(),
            controller: AdaptiveController::new(config.controller.clone()),
            context: None,
            inline: None,
            cycle: None,
            model: ModelConfig::default(),
            next_generation: 0,
            last_frame_time: Duration::ZERO,
            stats: PipelineStats::default(),
        };
        let (mode, _) = watch::channel(PipelineMode::Uninitialized);
        let (settled, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                config,
                factory,
                state: Mutex::new(state),
                mode,
                settled,
            }),
        }
    }

    /// Bring the pipeline online
    ///
    /// Resolves once the current initialization cycle settles on a mode. If
    /// a cycle is already running, waits for that one instead of starting
    /// another. In worker mode this returns immediately.
    pub async fn initialize(&self, model: ModelConfig) -> PipelineMode {
        let mut settled = self.shared.settled.subscribe();
        let epoch = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.recovery.phase() == Phase::Worker {
                return PipelineMode::Worker;
            }
            if state.recovery.cycle_in_progress() {
                state.recovery.epoch()
            } else {
                state.model = model;
                state.inline = None;
                match Shared::start_cycle(&self.shared, state, false) {
                    Some(epoch) => epoch,
                    None => return state.recovery.mode(),
                }
            }
        };

        // The sender lives in `shared`, so this only ends once the cycle resolves
        let _ = settled.wait_for(|done| *done >= epoch).await;
        self.mode()
    }

    /// Offer a frame for segmentation
    ///
    /// Returns immediately with [`FrameStatus::Busy`] when a frame is already
    /// in flight; the offered image is dropped in that case. Otherwise the
    /// image moves to the execution context and this resolves on the result,
    /// the deadline, or a context failure.
    pub async fn submit_frame(&self, image: RgbImage, auto_frame: bool) -> FrameResult {
        let receiver = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;

            match state.recovery.phase() {
                Phase::Worker => {}
                Phase::MainThread => {
                    drop(guard);
                    return self.submit_inline(image, auto_frame);
                }
                _ => return FrameResult::unavailable(),
            }

            let Some(context) = state.context.as_ref() else {
                return FrameResult::unavailable();
            };

            let now = Instant::now();
            let Some(ticket) =
                state
                    .scheduler
                    .begin(context.generation(), now, self.shared.config.frame_timeout)
            else {
                state.stats.dropped_busy += 1;
                tracing::trace!("Frame dropped, segmentation busy");
                return FrameResult::busy();
            };
            let sequence_id = ticket.sequence_id;
            state.stats.submitted += 1;

            if let Err(error) = context.sender.submit_frame(sequence_id, image, auto_frame) {
                tracing::warn!("Failed to dispatch frame {}: {}", sequence_id, error);
                let _ = state.scheduler.abort(now);
                state.stats.failed += 1;
                Shared::register_failure(&self.shared, state);
                self.shared.publish(state);
                return FrameResult::failed(Some(sequence_id), error, Duration::ZERO);
            }

            let weak = Arc::downgrade(&self.shared);
            let deadline = ticket.deadline;
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(shared) = weak.upgrade() {
                    Shared::expire(&shared, sequence_id);
                }
            });
            state.scheduler.arm_timer(sequence_id, timer);

            tracing::trace!("Frame {} dispatched", sequence_id);
            ticket.receiver
        };

        receiver
            .await
            .unwrap_or_else(|_| FrameResult::failed(None, PipelineError::Disposed, Duration::ZERO))
    }

    /// Segment a frame synchronously in the caller
    fn submit_inline(&self, image: RgbImage, auto_frame: bool) -> FrameResult {
        let (mut model, sequence_id, auto_config) = {
            let mut state = self.shared.state.lock();
            let Some(model) = state.inline.take() else {
                state.stats.dropped_busy += 1;
                return FrameResult::busy();
            };
            state.stats.submitted += 1;
            let sequence_id = state.scheduler.allocate_sequence();
            (model, sequence_id, state.model.auto_frame)
        };

        let started = Instant::now();
        let outcome =
            segmentation::segment_frame(model.as_mut(), &image, auto_frame.then_some(&auto_config));
        let latency = started.elapsed();

        let mut state = self.shared.state.lock();
        if state.recovery.phase() == Phase::MainThread && state.inline.is_none() {
            state.inline = Some(model);
        }

        match outcome {
            Ok((mask, transform)) => {
                state.stats.completed += 1;
                FrameResult::completed(sequence_id, Some(mask), transform, latency)
            }
            Err(e) => {
                state.stats.failed += 1;
                let error = PipelineError::FrameError {
                    sequence_id,
                    message: format!("{:#}", e),
                };
                FrameResult::failed(Some(sequence_id), error, latency)
            }
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.shared.state.lock().recovery.mode()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().recovery.phase()
    }

    /// Follow mode changes, e.g. to show a degraded-service indicator
    pub fn subscribe_mode(&self) -> watch::Receiver<PipelineMode> {
        self.shared.mode.subscribe()
    }

    /// Rendered frames to let pass between submissions
    pub fn skip_interval(&self) -> u32 {
        self.shared.state.lock().controller.interval()
    }

    /// Report the render loop's latest frame time to the skip controller
    pub fn record_render_frame_time(&self, frame_time: Duration) {
        self.shared.state.lock().last_frame_time = frame_time;
    }

    pub fn counters(&self) -> RecoveryCounters {
        self.shared.state.lock().recovery.counters()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.state.lock().stats
    }

    /// Tear everything down and settle in `Disabled`
    ///
    /// Cancels timers and any running initialization, fails the in-flight
    /// frame, terminates the context and releases the inline model. Safe to
    /// call more than once.
    pub fn dispose(&self) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if let Some(cycle) = state.cycle.take() {
            cycle.abort();
        }
        if let Some(settled) = state.scheduler.abort(Instant::now()) {
            let sequence_id = settled.sequence_id;
            let latency = settled.latency;
            settled.deliver(FrameResult::failed(
                Some(sequence_id),
                PipelineError::Disposed,
                latency,
            ));
        }
        if let Some(context) = state.context.take() {
            tracing::info!("Disposing execution context {}", context.generation());
            context.shutdown();
        }
        state.inline = None;
        state.controller.set_active(false);
        state.recovery.dispose();
        self.shared.publish(state);
        self.shared.settle(state.recovery.epoch());
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Shared {
    /// Push the state machine's mode to subscribers if it changed
    fn publish(&self, state: &State) {
        let mode = state.recovery.mode();
        self.mode.send_if_modified(|current| {
            if *current == mode {
                return false;
            }
            *current = mode;
            true
        });
    }

    /// Wake `initialize` callers waiting on cycles up to `epoch`
    fn settle(&self, epoch: u64) {
        self.settled.send_if_modified(|done| {
            if *done >= epoch {
                return false;
            }
            *done = epoch;
            true
        });
    }

    fn start_cycle(shared: &Arc<Shared>, state: &mut State, recovering: bool) -> Option<u64> {
        let epoch = state.recovery.begin_cycle(recovering)?;
        state.controller.set_active(false);
        shared.publish(state);

        tracing::info!(
            "Starting segmentation {} (up to {} attempts)",
            if recovering { "recovery" } else { "initialization" },
            shared.config.max_init_attempts
        );

        if let Some(previous) = state.cycle.take() {
            previous.abort();
        }
        state.cycle = Some(tokio::spawn(run_cycle(Arc::downgrade(shared), epoch)));
        Some(epoch)
    }

    /// Count a timeout-equivalent failure and start recovery on threshold
    fn register_failure(shared: &Arc<Shared>, state: &mut State) {
        if !state.recovery.frame_failed() {
            return;
        }
        tracing::warn!(
            "{} consecutive frame failures, replacing execution context",
            shared.config.timeout_threshold
        );
        if let Some(context) = state.context.take() {
            context.shutdown();
        }
        state.stats.recoveries += 1;
        Shared::start_cycle(shared, state, true);
    }

    fn expire(shared: &Arc<Shared>, sequence_id: u64) {
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        let Some(settled) = state.scheduler.expire(sequence_id, Instant::now()) else {
            return;
        };
        tracing::warn!(
            "Frame {} timed out after {:.0}ms",
            sequence_id,
            settled.latency.as_secs_f64() * 1000.0
        );
        let latency = settled.latency;
        settled.deliver(FrameResult::timed_out(sequence_id, latency));
        state.stats.timed_out += 1;

        Shared::register_failure(shared, state);
        shared.publish(state);
    }

    fn handle_event(shared: &Arc<Shared>, generation: u64, event: ContextEvent) {
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        if state.context.as_ref().map(LiveContext::generation) != Some(generation) {
            tracing::debug!("Dropping event from retired context {}", generation);
            return;
        }
        let now = Instant::now();

        match event {
            ContextEvent::FrameReady {
                sequence_id,
                mask,
                transform,
            } => {
                let Some(settled) = state.scheduler.complete(generation, sequence_id, now) else {
                    tracing::debug!("Discarding stale result for frame {}", sequence_id);
                    return;
                };
                let latency = settled.latency;
                state.recovery.frame_succeeded();
                state.controller.record(PerformanceSample {
                    latency,
                    frame_time: state.last_frame_time,
                });
                state.stats.completed += 1;
                settled.deliver(FrameResult::completed(sequence_id, mask, transform, latency));
            }
            ContextEvent::Error {
                sequence_id: Some(sequence_id),
                message,
            } => {
                let Some(settled) = state.scheduler.complete(generation, sequence_id, now) else {
                    tracing::debug!("Discarding stale error for frame {}", sequence_id);
                    return;
                };
                tracing::warn!("Frame {} failed: {}", sequence_id, message);
                state.stats.failed += 1;
                let latency = settled.latency;
                settled.deliver(FrameResult::failed(
                    Some(sequence_id),
                    PipelineError::FrameError {
                        sequence_id,
                        message,
                    },
                    latency,
                ));
            }
            ContextEvent::Error {
                sequence_id: None,
                message,
            } => {
                tracing::warn!("Execution context {} failed: {}", generation, message);
                if let Some(settled) = state.scheduler.abort(now) {
                    let sequence_id = settled.sequence_id;
                    let latency = settled.latency;
                    settled.deliver(FrameResult::failed(
                        Some(sequence_id),
                        PipelineError::ContextLost(message),
                        latency,
                    ));
                    state.stats.failed += 1;
                }
                Shared::register_failure(shared, state);
                shared.publish(state);
            }
            ContextEvent::InitComplete { .. } => {
                tracing::debug!("Ignoring repeated init-complete from context {}", generation);
            }
        }
    }

    /// Make a freshly initialized context authoritative
    fn install(shared: &Arc<Shared>, epoch: u64, handle: ContextHandle) {
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        if !state.recovery.attempt_succeeded(epoch) {
            tracing::debug!("Initialization abandoned, dropping context {}", handle.generation());
            handle.terminate();
            return;
        }

        let (sender, events) = handle.split();
        let generation = sender.generation();
        if let Some(previous) = state.context.take() {
            previous.shutdown();
        }
        let pump = tokio::spawn(pump_events(Arc::downgrade(shared), events));
        state.context = Some(LiveContext { sender, pump });
        state.controller.set_active(true);
        state.cycle = None;
        shared.publish(state);
        shared.settle(epoch);

        tracing::info!("Segmentation worker ready (context {})", generation);
    }

    /// Settle a cycle that produced no context
    async fn conclude_without_context(shared: &Arc<Shared>, epoch: u64, reason: &str) {
        let (recovering, model) = {
            let state = shared.state.lock();
            (state.recovery.is_recovering_cycle(), state.model.clone())
        };

        let inline = if shared.config.allow_main_thread_fallback && !recovering {
            let factory = Arc::clone(&shared.factory);
            tokio::task::spawn_blocking(move || factory.inline_model(&model))
                .await
                .ok()
                .flatten()
        } else {
            None
        };

        let mut guard = shared.state.lock();
        let state = &mut *guard;
        let Some(mode) = state.recovery.exhausted(epoch, inline.is_some()) else {
            return;
        };
        if mode == PipelineMode::MainThread {
            state.inline = inline.map(|mut model| {
                model.reset_state();
                model
            });
        }
        state.cycle = None;
        shared.publish(state);
        shared.settle(epoch);

        tracing::warn!("Segmentation worker unavailable ({}), running in {} mode", reason, mode);
    }
}

/// One initialization cycle: bounded attempts with exponential backoff
async fn run_cycle(weak: Weak<Shared>, epoch: u64) {
    let Some(max_attempts) = weak.upgrade().map(|s| s.config.max_init_attempts.max(1)) else {
        return;
    };

    for attempt in 0..max_attempts {
        let backoff = match weak.upgrade() {
            Some(shared) => shared.config.backoff_for(attempt),
            None => return,
        };
        if !backoff.is_zero() {
            tracing::debug!("Retrying initialization in {:?}", backoff);
            tokio::time::sleep(backoff).await;
        }

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let timeout = shared.config.init_attempt_timeout;

        let (generation, model, deadline) = {
            let mut state = shared.state.lock();
            let Some(deadline) = state.recovery.start_attempt(epoch, Instant::now(), timeout)
            else {
                return;
            };
            state.next_generation += 1;
            (state.next_generation, state.model.clone(), deadline)
        };

        tracing::info!(
            "Initialization attempt {}/{} (context {})",
            attempt + 1,
            max_attempts,
            generation
        );

        let error = match shared.factory.spawn(generation) {
            Err(ContextError::Unsupported(reason)) => {
                tracing::warn!("Execution context unsupported: {}", reason);
                shared
                    .state
                    .lock()
                    .recovery
                    .attempt_failed(epoch, PipelineError::CapabilityUnsupported(reason.clone()));
                Shared::conclude_without_context(&shared, epoch, &reason).await;
                return;
            }
            Err(e) => PipelineError::InitFailure(e.to_string()),
            Ok(mut handle) => {
                shared.state.lock().stats.contexts_spawned += 1;
                match tokio::time::timeout_at(deadline, handle.initialize(model)).await {
                    Ok(Ok(())) => {
                        Shared::install(&shared, epoch, handle);
                        return;
                    }
                    Ok(Err(e)) => {
                        handle.terminate();
                        e
                    }
                    Err(_) => {
                        handle.terminate();
                        PipelineError::InitFailure(format!("no init-complete within {:?}", timeout))
                    }
                }
            }
        };

        tracing::warn!("Initialization attempt {} failed: {}", attempt + 1, error);
        shared.state.lock().recovery.attempt_failed(epoch, error);
    }

    if let Some(shared) = weak.upgrade() {
        Shared::conclude_without_context(&shared, epoch, "initialization budget exhausted").await;
    }
}

/// Forward context events until the context goes away
async fn pump_events(weak: Weak<Shared>, mut events: EventReceiver) {
    let generation = events.generation();
    loop {
        let event = events.recv().await;
        let lost = matches!(
            event,
            ContextEvent::Error {
                sequence_id: None,
                ..
            }
        );
        let Some(shared) = weak.upgrade() else {
            return;
        };
        Shared::handle_event(&shared, generation, event);
        if lost {
            return;
        }
    }
}

#[cfg(test)]
mod tests;
