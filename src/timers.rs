//! Timer queue for the session event loop.
//!
//! A min-heap of deadlines. Ties are broken by insertion order so timers due
//! at the same instant fire in the order they were scheduled.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Periodic reconciliation of the desired settings.
    CheckSettings,
    /// Periodic stabilisation routine.
    Snoutfocus,
    /// Next step of the mode active under `generation`.
    ModeTick { generation: u64 },
}

/// Pending timers ordered by deadline.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, TimerKind)>>,
    seq: u64,
}

impl TimerQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `kind` at `deadline`. Equal deadlines fire in scheduling order.
    pub fn schedule_at(&mut self, deadline: Instant, kind: TimerKind) {
        self.seq += 1;
        self.heap.push(Reverse((deadline, self.seq, kind)));
    }

    /// Fire `kind` after `delay`.
    pub fn schedule_in(&mut self, delay: Duration, kind: TimerKind) {
        self.schedule_at(Instant::now() + delay, kind);
    }

    /// Deadline of the earliest timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Remove and return the earliest timer if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        match self.heap.peek() {
            Some(Reverse((deadline, _, _))) if *deadline <= now => {
                self.heap.pop().map(|Reverse((_, _, kind))| kind)
            }
            _ => None,
        }
    }

    /// Drop every mode tick; periodic timers stay.
    pub fn cancel_mode_ticks(&mut self) {
        self.heap
            .retain(|Reverse((_, _, kind))| !matches!(kind, TimerKind::ModeTick { .. }));
    }

    /// Pending timers.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
