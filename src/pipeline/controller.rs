use crate::config::ControllerConfig;
use std::collections::VecDeque;
use std::time::Duration;

/// One completed frame cycle as seen by the controller
#[derive(Debug, Clone, Copy)]
pub struct PerformanceSample {
    /// Submission to result
    pub latency: Duration,
    /// Most recent render-loop frame time
    pub frame_time: Duration,
}

/// Adaptive frame-skip controller
///
/// Advises how many rendered frames the caller should let pass between
/// submissions. Steps are +2 above the high threshold, +1 above the moderate
/// threshold and -1 once the rolling latency is comfortably under budget,
/// so the interval never moves more than two steps per evaluation.
pub struct AdaptiveController {
    config: ControllerConfig,
    interval: u32,
    latencies: VecDeque<Duration>,
    frame_times: VecDeque<Duration>,
    active: bool,
}

impl AdaptiveController {
    pub fn new(config: ControllerConfig) -> Self {
        let interval = config.base_interval.max(1);
        Self {
            latencies: VecDeque::with_capacity(config.window),
            frame_times: VecDeque::with_capacity(config.window),
            config,
            interval,
            active: false,
        }
    }

    /// Current advised skip interval
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Adjustment only runs while the pipeline is in worker mode
    pub fn set_active(&mut self, active: bool) {
        if self.active && !active {
            self.latencies.clear();
            self.frame_times.clear();
        }
        self.active = active;
    }

    pub fn average_latency(&self) -> Option<Duration> {
        average(&self.latencies)
    }

    /// Add a sample and evaluate once; returns the (possibly new) interval
    pub fn record(&mut self, sample: PerformanceSample) -> u32 {
        if !self.active {
            return self.interval;
        }

        push_bounded(&mut self.latencies, sample.latency, self.config.window);
        if !sample.frame_time.is_zero() {
            push_bounded(&mut self.frame_times, sample.frame_time, self.config.window);
        }

        self.evaluate();
        self.interval
    }

    fn evaluate(&mut self) {
        let Some(latency) = self.average_latency() else {
            return;
        };
        let base = self.config.base_interval.max(1);
        let max = self.config.max_interval.max(base);
        let previous = self.interval;

        if latency > self.config.high_threshold {
            self.interval = self.interval.saturating_add(2).min(max);
        } else if latency > self.config.moderate_threshold {
            self.interval = self.interval.saturating_add(1).min(max);
        } else if latency.as_secs_f64()
            < self.config.frame_budget.as_secs_f64() * self.config.recovery_factor
            && self.interval > base
            && self.render_within_budget()
        {
            self.interval -= 1;
        }

        if self.interval != previous {
            tracing::debug!(
                "Skip interval {} -> {} (avg latency {:.1}ms)",
                previous,
                self.interval,
                latency.as_secs_f64() * 1000.0
            );
        }
    }

    fn render_within_budget(&self) -> bool {
        average(&self.frame_times).map_or(true, |t| t <= self.config.render_budget)
    }
}

fn push_bounded(window: &mut VecDeque<Duration>, value: Duration, capacity: usize) {
    if window.len() >= capacity.max(1) {
        window.pop_front();
    }
    window.push_back(value);
}

fn average(window: &VecDeque<Duration>) -> Option<Duration> {
    if window.is_empty() {
        return None;
    }
    Some(window.iter().sum::<Duration>() / window.len() as u32)
}
