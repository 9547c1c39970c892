//! Bounded polling: every wait in the hub has an interval, a deadline and a way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Delay before the first check.
    pub settle: Duration,
    pub interval: Duration,
    /// Total budget measured from the first check.
    pub budget: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Blocks the calling thread, running `check` until it yields a value, the
/// budget runs out, or `cancel` is raised.
pub fn poll_until<T>(
    schedule: PollSchedule,
    cancel: &AtomicBool,
    mut check: impl FnMut() -> Option<T>,
) -> PollOutcome<T> {
    if sleep_unless_cancelled(schedule.settle, cancel) {
        return PollOutcome::Cancelled;
    }
    let deadline = Instant::now() + schedule.budget;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return PollOutcome::Cancelled;
        }
        if let Some(value) = check() {
            return PollOutcome::Ready(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }
        let nap = schedule.interval.min(deadline - now);
        if sleep_unless_cancelled(nap, cancel) {
            return PollOutcome::Cancelled;
        }
    }
}

fn sleep_unless_cancelled(duration: Duration, cancel: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(10);
    let until = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= until {
            return false;
        }
        thread::sleep(SLICE.min(until - now));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTick {
    NotDue,
    Due,
    Expired,
}

/// Non-blocking counterpart of [`poll_until`] for the owner loop: it is polled
/// from `tick()` and reports when the next check is due or the deadline passed.
#[derive(Debug, Clone, Copy)]
pub struct RepeatingDeadline {
    interval: Duration,
    next_due: Instant,
    deadline: Instant,
}

impl RepeatingDeadline {
    pub fn start(interval: Duration, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            next_due: now + interval,
            deadline: now + timeout,
        }
    }

    pub fn poll(&mut self, now: Instant) -> TimerTick {
        if now >= self.deadline {
            return TimerTick::Expired;
        }
        if now < self.next_due {
            return TimerTick::NotDue;
        }
        self.next_due = now + self.interval;
        TimerTick::Due
    }

    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.next_due.min(self.deadline).saturating_duration_since(now)
    }
}
