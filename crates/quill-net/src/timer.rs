//! Hashed timing wheel driving idle-connection reaping and embedder timers.
//!
//! Power-of-two tick resolution and spoke count give O(1) schedule and
//! cancel. Timers in the same tick fire in no particular order. The wheel
//! itself is not synchronized; the engine guards it with a mutex and a
//! dedicated ticker thread advances it.

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Identifies a scheduled timer; stable across repeats.
pub type TimerId = u64;

pub(crate) struct TimerEntry {
    pub(crate) id: TimerId,
    deadline_ns: u64,
    pub(crate) repeat: Option<Duration>,
    pub(crate) callback: Box<dyn FnMut() + Send>,
}

pub(crate) struct TimingWheel {
    start: Instant,
    resolution_shift: u32,
    spoke_mask: u64,
    current_tick: u64,
    next_id: TimerId,
    slots: Vec<Vec<TimerEntry>>,
    cancelled: HashSet<TimerId>,
    timer_count: usize,
}

impl TimingWheel {
    /// `tick` is rounded up to a power-of-two nanosecond resolution;
    /// `spokes` must be a power of two.
    pub(crate) fn new(tick: Duration, spokes: usize) -> Self {
        assert!(spokes.is_power_of_two(), "spoke count must be a power of two");
        let tick_ns = (tick.as_nanos() as u64).max(1).next_power_of_two();
        Self {
            start: Instant::now(),
            resolution_shift: tick_ns.trailing_zeros(),
            spoke_mask: spokes as u64 - 1,
            current_tick: 0,
            next_id: 1,
            slots: (0..spokes).map(|_| Vec::new()).collect(),
            cancelled: HashSet::new(),
            timer_count: 0,
        }
    }

    /// Effective tick duration after rounding.
    pub(crate) fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1 << self.resolution_shift)
    }

    pub(crate) fn timer_count(&self) -> usize {
        self.timer_count
    }

    /// Schedule `callback` to run after `delay`, then every `repeat` if set.
    pub(crate) fn schedule(
        &mut self,
        delay: Duration,
        repeat: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline_ns = self.now_ns() + delay.as_nanos() as u64;
        self.insert(TimerEntry {
            id,
            deadline_ns,
            repeat,
            callback,
        });
        id
    }

    /// Cancel a timer. Firing a cancelled timer is a no-op; cancelling an
    /// unknown or already-fired id is too.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Advance the wheel to `now`, removing and returning every due entry.
    /// The caller runs the callbacks without holding the wheel lock and
    /// hands repeating entries back via [`TimingWheel::reschedule`].
    pub(crate) fn collect_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        let now_ns = now.saturating_duration_since(self.start).as_nanos() as u64;
        let target_tick = now_ns >> self.resolution_shift;
        let mut expired = Vec::new();
        while self.current_tick <= target_tick {
            let spoke = (self.current_tick & self.spoke_mask) as usize;
            let slot = &mut self.slots[spoke];
            let mut i = 0;
            while i < slot.len() {
                if self.cancelled.contains(&slot[i].id) {
                    let entry = slot.swap_remove(i);
                    self.cancelled.remove(&entry.id);
                    self.timer_count -= 1;
                    continue;
                }
                if slot[i].deadline_ns <= now_ns {
                    expired.push(slot.swap_remove(i));
                    self.timer_count -= 1;
                    continue;
                }
                i += 1;
            }
            if self.current_tick == target_tick {
                break;
            }
            self.current_tick += 1;
        }
        expired
    }

    /// Re-arm a repeating entry collected by `collect_expired`. Dropped
    /// silently if the timer was cancelled while its callback ran.
    pub(crate) fn reschedule(&mut self, mut entry: TimerEntry) {
        if self.cancelled.remove(&entry.id) {
            return;
        }
        let Some(period) = entry.repeat else {
            return;
        };
        entry.deadline_ns = self.now_ns() + period.as_nanos() as u64;
        self.insert(entry);
    }

    fn insert(&mut self, entry: TimerEntry) {
        let tick = (entry.deadline_ns >> self.resolution_shift).max(self.current_tick);
        let spoke = (tick & self.spoke_mask) as usize;
        self.slots[spoke].push(entry);
        self.timer_count += 1;
    }

    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}
