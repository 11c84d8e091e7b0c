//! Idle-triggered autosave policy.
//!
//! # Responsibility
//! - Debounce edit activity into one incremental flush per quiet period.
//! - Serialize flushes: a new flush is never started while one is running.
//! - Count consecutive failed flush transactions against a retry bound.
//!
//! # Invariants
//! - Every recorded activity pushes the deadline out (debounce, not throttle).
//! - The scheduler never runs a flush itself; callers poll `begin_flush` and
//!   report back through `finish_flush`.
//!
//! # See also
//! - `service::study_session` for the wiring to an outline document.

use crate::config::AutosaveConfig;
use log::{debug, warn};
use std::time::{Duration, Instant};

/// Source of monotonic time for the scheduler.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock used outside tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing waiting to be saved.
    Idle,
    /// Unsaved activity; a flush is due once `last` is older than the threshold.
    ActivityDetected { last: Instant },
    /// A flush is running.
    Flushing,
}

/// How a flush started by the scheduler ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Committed with nothing left to retry.
    Complete,
    /// Committed, but some lines still need another attempt.
    Partial,
    /// The transaction was rejected.
    Failed,
}

/// Debounced autosave state machine.
#[derive(Debug, Clone)]
pub struct AutosaveScheduler {
    idle_threshold: Duration,
    max_consecutive_failures: u32,
    state: SchedulerState,
    consecutive_failures: u32,
    activity_during_flush: Option<Instant>,
}

impl AutosaveScheduler {
    pub fn new(config: &AutosaveConfig) -> Self {
        Self {
            idle_threshold: config.idle_threshold(),
            max_consecutive_failures: config.max_consecutive_failures,
            state: SchedulerState::Idle,
            consecutive_failures: 0,
            activity_during_flush: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Records one edit at `now` and restarts the idle timer.
    pub fn record_activity(&mut self, now: Instant) {
        match self.state {
            SchedulerState::Flushing => self.activity_during_flush = Some(now),
            SchedulerState::Idle | SchedulerState::ActivityDetected { .. } => {
                self.state = SchedulerState::ActivityDetected { last: now };
            }
        }
    }

    /// Instant at which the pending flush becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SchedulerState::ActivityDetected { last } => Some(last + self.idle_threshold),
            SchedulerState::Idle | SchedulerState::Flushing => None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Claims the due flush. Returns `false` when nothing is due or a flush
    /// is already running.
    pub fn begin_flush(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.state = SchedulerState::Flushing;
        true
    }

    /// Reports the end of the flush claimed by `begin_flush`.
    ///
    /// Anything short of `Complete` re-arms the timer from `now`, so the next
    /// attempt waits one more idle period.
    pub fn finish_flush(&mut self, now: Instant, outcome: FlushOutcome) {
        if self.state != SchedulerState::Flushing {
            warn!(
                "event=autosave_finish module=autosave status=skip reason=not_flushing outcome={outcome:?}"
            );
            return;
        }

        match outcome {
            FlushOutcome::Complete | FlushOutcome::Partial => self.consecutive_failures = 0,
            FlushOutcome::Failed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
        let pending = self.activity_during_flush.take();
        self.state = match (outcome, pending) {
            (FlushOutcome::Complete, None) => SchedulerState::Idle,
            (FlushOutcome::Complete, Some(last)) => SchedulerState::ActivityDetected { last },
            (FlushOutcome::Partial | FlushOutcome::Failed, pending) => {
                SchedulerState::ActivityDetected {
                    last: pending.map_or(now, |last| last.max(now)),
                }
            }
        };
        debug!(
            "event=autosave_finish module=autosave status=ok outcome={outcome:?} consecutive_failures={}",
            self.consecutive_failures
        );
    }

    /// Returns to `Idle` after an out-of-band flush (for example at shutdown)
    /// persisted everything.
    pub fn reset(&mut self) {
        self.state = SchedulerState::Idle;
        self.consecutive_failures = 0;
        self.activity_during_flush = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether failed transactions reached the configured bound.
    pub fn is_failing(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures.max(1)
    }
}
