use crate::error::PipelineError;
use crate::segmentation::{AutoFrameTransform, Matte};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Outcome category of a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The context produced a mask
    Completed,
    /// Another frame is in flight; this one was dropped
    Busy,
    /// No answer before the deadline
    TimedOut,
    /// The context (or inline model) reported an error
    Failed,
    /// No segmentation available in the current mode
    Unavailable,
}

/// Answer to one `submit_frame` call
#[derive(Debug, Clone)]
pub struct FrameResult {
    /// `None` for frames that were never dispatched
    pub sequence_id: Option<u64>,
    pub status: FrameStatus,
    pub mask: Option<Matte>,
    pub transform: Option<AutoFrameTransform>,
    pub latency: Duration,
    pub error: Option<PipelineError>,
}

impl FrameResult {
    pub fn completed(
        sequence_id: u64,
        mask: Option<Matte>,
        transform: Option<AutoFrameTransform>,
        latency: Duration,
    ) -> Self {
        Self {
            sequence_id: Some(sequence_id),
            status: FrameStatus::Completed,
            mask,
            transform,
            latency,
            error: None,
        }
    }

    pub fn busy() -> Self {
        Self::empty(None, FrameStatus::Busy, Duration::ZERO, None)
    }

    pub fn timed_out(sequence_id: u64, latency: Duration) -> Self {
        Self::empty(
            Some(sequence_id),
            FrameStatus::TimedOut,
            latency,
            Some(PipelineError::FrameTimeout { sequence_id }),
        )
    }

    pub fn failed(sequence_id: Option<u64>, error: PipelineError, latency: Duration) -> Self {
        Self::empty(sequence_id, FrameStatus::Failed, latency, Some(error))
    }

    pub fn unavailable() -> Self {
        Self::empty(None, FrameStatus::Unavailable, Duration::ZERO, None)
    }

    fn empty(
        sequence_id: Option<u64>,
        status: FrameStatus,
        latency: Duration,
        error: Option<PipelineError>,
    ) -> Self {
        Self {
            sequence_id,
            status,
            mask: None,
            transform: None,
            latency,
            error,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == FrameStatus::Completed
    }
}

/// The single in-flight frame
struct Outstanding {
    sequence_id: u64,
    generation: u64,
    submitted_at: Instant,
    reply: oneshot::Sender<FrameResult>,
    timer: Option<JoinHandle<()>>,
}

/// Dispatch slot handed out by [`FrameScheduler::begin`]
pub struct FrameTicket {
    pub sequence_id: u64,
    pub deadline: Instant,
    pub receiver: oneshot::Receiver<FrameResult>,
}

/// A request removed from the scheduler, ready to be answered
pub struct Settled {
    pub sequence_id: u64,
    pub latency: Duration,
    reply: oneshot::Sender<FrameResult>,
}

impl Settled {
    pub fn deliver(self, result: FrameResult) {
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

/// Single-flight frame bookkeeping
///
/// Holds at most one outstanding request. A result is accepted only when
/// both its sequence id and its context generation match that request;
/// everything else is stale and dropped.
#[derive(Default)]
pub struct FrameScheduler {
    next_sequence: u64,
    outstanding: Option<Outstanding>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn outstanding_sequence(&self) -> Option<u64> {
        self.outstanding.as_ref().map(|o| o.sequence_id)
    }

    /// Next sequence id, also used for frames that never enter the slot
    pub fn allocate_sequence(&mut self) -> u64 {
        let id = self.next_sequence;
        self.next_sequence += 1;
        id
    }

    /// Claim the slot; `None` when a frame is already in flight
    pub fn begin(&mut self, generation: u64, now: Instant, timeout: Duration) -> Option<FrameTicket> {
        if self.outstanding.is_some() {
            return None;
        }
        let sequence_id = self.allocate_sequence();
        let deadline = now + timeout;
        let (reply, receiver) = oneshot::channel();

        self.outstanding = Some(Outstanding {
            sequence_id,
            generation,
            submitted_at: now,
            reply,
            timer: None,
        });

        Some(FrameTicket {
            sequence_id,
            deadline,
            receiver,
        })
    }

    /// Attach the deadline timer of the current request
    pub fn arm_timer(&mut self, sequence_id: u64, timer: JoinHandle<()>) {
        match self.outstanding.as_mut() {
            Some(o) if o.sequence_id == sequence_id => o.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Match a context answer against the outstanding request
    pub fn complete(&mut self, generation: u64, sequence_id: u64, now: Instant) -> Option<Settled> {
        match &self.outstanding {
            Some(o) if o.sequence_id == sequence_id && o.generation == generation => {}
            _ => return None,
        }
        self.take(now, true)
    }

    /// Deadline passed for `sequence_id`
    pub fn expire(&mut self, sequence_id: u64, now: Instant) -> Option<Settled> {
        if self.outstanding_sequence() != Some(sequence_id) {
            return None;
        }
        // called from the timer itself, so it is not aborted
        self.take(now, false)
    }

    /// Drop whatever is in flight (context lost, disposal)
    pub fn abort(&mut self, now: Instant) -> Option<Settled> {
        self.take(now, true)
    }

    fn take(&mut self, now: Instant, cancel_timer: bool) -> Option<Settled> {
        let outstanding = self.outstanding.take()?;
        if cancel_timer {
            if let Some(timer) = &outstanding.timer {
                timer.abort();
            }
        }
        Some(Settled {
            sequence_id: outstanding.sequence_id,
            latency: now.saturating_duration_since(outstanding.submitted_at),
            reply: outstanding.reply,
        })
    }
}
