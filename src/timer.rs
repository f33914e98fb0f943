//! Timed tasks and the injectable clock.
//!
//! The loop keeps timers in a plain vector scanned once per turn, which is
//! adequate for the small timer counts this runtime sees. A task carries a
//! shared cancelled flag; cancelled entries are dropped lazily on the next
//! scan.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source for the loop. Injectable so time-dependent
/// behavior can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system monotonic clock.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cancellation handle for a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub(crate) fn new() -> TimerHandle {
        TimerHandle::default()
    }

    /// Flag the task as cancelled; the loop discards it on its next scan.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What a due timer does.
pub(crate) enum TaskKind {
    /// User closure submitted through `schedule` / `schedule_at_fixed_rate`.
    User(Box<dyn FnMut() + Send>),
    /// Connect-timeout guard for a pending dial, resolved by the loop.
    ConnectTimeout { pending: usize },
}

/// A scheduled unit of work. `period == None` means one-shot; periodic
/// tasks reschedule at `execute_at + period`.
pub(crate) struct TimeTask {
    pub(crate) execute_at: Instant,
    pub(crate) period: Option<Duration>,
    pub(crate) handle: TimerHandle,
    pub(crate) kind: TaskKind,
}
