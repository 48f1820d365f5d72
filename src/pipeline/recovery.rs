//! Mode state machine and failure counters.
//!
//! ```text
//! Uninitialized ─► Initializing ─► Worker ◄─► Recovering ─► Initializing ─► {Worker, Disabled}
//!                       │
//!                       └─(budget exhausted / unsupported)─► MainThread | Disabled
//! ```
//!
//! This is the only place that changes the pipeline mode. The public mode
//! only moves when a cycle resolves; while one runs it keeps the previous
//! resolved value and `Phase` carries the detail.
//!
//! Every cycle gets an epoch. Cycle-side calls carry it, so a cancelled
//! cycle that is still unwinding cannot act on a newer one.

use crate::error::PipelineError;
use std::fmt;
use tokio::time::Instant;

/// Externally visible operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// No cycle has resolved yet
    Uninitialized,
    /// The isolated context is live and accepting frames
    Worker,
    /// Frames are segmented inline in the caller
    MainThread,
    /// No segmentation is produced
    Disabled,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineMode::Uninitialized => "uninitialized",
            PipelineMode::Worker => "worker",
            PipelineMode::MainThread => "main-thread",
            PipelineMode::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Detailed lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing {
        /// Zero-based index of the current attempt
        attempt: u32,
        /// Whether this cycle was started by recovery
        recovering: bool,
    },
    Worker,
    /// Threshold crossed; the old context is being replaced
    Recovering,
    MainThread,
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryCounters {
    pub consecutive_timeouts: u32,
    pub consecutive_init_failures: u32,
}

#[derive(Debug, Clone)]
pub struct InitializationAttempt {
    pub index: u32,
    pub started_at: Instant,
    /// `init-complete` must arrive before this
    pub deadline: Instant,
    /// Set once the attempt has failed
    pub error: Option<PipelineError>,
}

pub struct RecoveryMachine {
    phase: Phase,
    resolved: PipelineMode,
    epoch: u64,
    counters: RecoveryCounters,
    attempts: Vec<InitializationAttempt>,
    max_attempts: u32,
    timeout_threshold: u32,
}

impl RecoveryMachine {
    pub fn new(max_attempts: u32, timeout_threshold: u32) -> Self {
        Self {
            phase: Phase::Uninitialized,
            resolved: PipelineMode::Uninitialized,
            epoch: 0,
            counters: RecoveryCounters::default(),
            attempts: Vec::new(),
            max_attempts: max_attempts.max(1),
            timeout_threshold: timeout_threshold.max(1),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counters(&self) -> RecoveryCounters {
        self.counters
    }

    pub fn attempts(&self) -> &[InitializationAttempt] {
        &self.attempts
    }

    /// Last resolved mode
    pub fn mode(&self) -> PipelineMode {
        self.resolved
    }

    /// Epoch of the latest cycle (0 before the first one)
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn in_cycle(&self, epoch: u64) -> bool {
        epoch == self.epoch && matches!(self.phase, Phase::Initializing { .. })
    }

    pub fn cycle_in_progress(&self) -> bool {
        matches!(self.phase, Phase::Initializing { .. } | Phase::Recovering)
    }

    /// Start an initialization cycle with a fresh attempt budget
    ///
    /// An explicit cycle may start from any resolved or uninitialized phase;
    /// a recovery cycle only from `Recovering`. Returns the cycle's epoch.
    pub fn begin_cycle(&mut self, recovering: bool) -> Option<u64> {
        let allowed = match self.phase {
            Phase::Recovering => recovering,
            Phase::Uninitialized | Phase::MainThread | Phase::Disabled => !recovering,
            Phase::Initializing { .. } | Phase::Worker => false,
        };
        if !allowed {
            return None;
        }
        self.epoch += 1;
        self.attempts.clear();
        self.counters = RecoveryCounters::default();
        self.phase = Phase::Initializing {
            attempt: 0,
            recovering,
        };
        Some(self.epoch)
    }

    /// Register a new attempt and return its deadline
    ///
    /// `None` when the budget is spent or the cycle was abandoned.
    pub fn start_attempt(
        &mut self,
        epoch: u64,
        now: Instant,
        timeout: std::time::Duration,
    ) -> Option<Instant> {
        if !self.in_cycle(epoch) {
            return None;
        }
        let Phase::Initializing { recovering, .. } = self.phase else {
            return None;
        };
        let index = self.attempts.len() as u32;
        if index >= self.max_attempts {
            return None;
        }
        let deadline = now + timeout;
        self.attempts.push(InitializationAttempt {
            index,
            started_at: now,
            deadline,
            error: None,
        });
        self.phase = Phase::Initializing {
            attempt: index,
            recovering,
        };
        Some(deadline)
    }

    pub fn attempt_failed(&mut self, epoch: u64, error: PipelineError) {
        if !self.in_cycle(epoch) {
            return;
        }
        if let Some(attempt) = self.attempts.last_mut() {
            attempt.error = Some(error);
        }
        self.counters.consecutive_init_failures += 1;
    }

    /// Context came up; returns `false` if the cycle was abandoned meanwhile
    pub fn attempt_succeeded(&mut self, epoch: u64) -> bool {
        if !self.in_cycle(epoch) {
            return false;
        }
        self.phase = Phase::Worker;
        self.resolved = PipelineMode::Worker;
        self.counters = RecoveryCounters::default();
        self.attempts.clear();
        true
    }

    /// Resolve a cycle that produced no context
    ///
    /// A failed recovery always disables; the initial cycle may settle on
    /// inline computation. `None` if the cycle was abandoned.
    pub fn exhausted(&mut self, epoch: u64, inline_available: bool) -> Option<PipelineMode> {
        if !self.in_cycle(epoch) {
            return None;
        }
        let Phase::Initializing { recovering, .. } = self.phase else {
            return None;
        };
        (self.phase, self.resolved) = if inline_available && !recovering {
            (Phase::MainThread, PipelineMode::MainThread)
        } else {
            (Phase::Disabled, PipelineMode::Disabled)
        };
        self.attempts.clear();
        Some(self.resolved)
    }

    pub fn is_recovering_cycle(&self) -> bool {
        matches!(
            self.phase,
            Phase::Initializing {
                recovering: true,
                ..
            }
        )
    }

    pub fn frame_succeeded(&mut self) {
        self.counters.consecutive_timeouts = 0;
    }

    /// Count a timeout (or context failure); `true` when recovery must start
    ///
    /// Fires once per threshold crossing: the phase leaves `Worker` and the
    /// counters are reset.
    pub fn frame_failed(&mut self) -> bool {
        if self.phase != Phase::Worker {
            return false;
        }
        self.counters.consecutive_timeouts += 1;
        if self.counters.consecutive_timeouts < self.timeout_threshold {
            return false;
        }
        self.phase = Phase::Recovering;
        self.counters = RecoveryCounters::default();
        true
    }

    pub fn dispose(&mut self) {
        self.phase = Phase::Disabled;
        self.resolved = PipelineMode::Disabled;
        self.attempts.clear();
    }
}
