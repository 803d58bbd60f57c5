//! One-shot timers keyed by caller chosen ids
//!
//! The table is generic over the context handed to callbacks so it can be
//! driven without a display. A fired timer is removed before its callback
//! runs; re-arming from inside the callback is allowed.

use std::fmt;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Upper bound on distinct timer ids per connection
pub const MAX_TIMERS: usize = 16;

// about thirty years; stands in for delays no clock can represent
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// Deadline `delay` after `now`, clamped to the far future on overflow
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Positive timer identifier, scoped to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(NonZeroU32);

impl TimerId {
    /// `None` for zero, which is not a valid id
    pub const fn new(id: u32) -> Option<Self> {
        match NonZeroU32::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Callback run once when a timer expires
pub type TimerCallback<C> = Box<dyn FnOnce(&mut C, TimerId)>;

struct TimerEntry<C> {
    id: TimerId,
    deadline: Instant,
    callback: TimerCallback<C>,
}

/// Pending timers of one connection
pub struct TimerTable<C> {
    entries: Vec<TimerEntry<C>>,
}

impl<C> Default for TimerTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for TimerTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (e.id, e.deadline)))
            .finish()
    }
}

impl<C> TimerTable<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_TIMERS),
        }
    }

    /// Arm `id` to fire at `deadline`, replacing any timer with the same id
    pub fn set(&mut self, id: TimerId, deadline: Instant, callback: TimerCallback<C>) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.deadline = deadline;
            entry.callback = callback;
            return Ok(());
        }
        if self.entries.len() >= MAX_TIMERS {
            return Err(Error::TooManyTimers(MAX_TIMERS));
        }
        self.entries.push(TimerEntry { id, deadline, callback });
        Ok(())
    }

    /// Remove one timer; false when it was not armed
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Remove every timer, returning how many were armed
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Time left until the earliest deadline, zero if one already passed
    pub fn delay_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Detach every expired timer, earliest deadline first
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, TimerCallback<C>)> {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].deadline <= now {
                due.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|e| (e.deadline, e.id));
        due.into_iter().map(|e| (e.id, e.callback)).collect()
    }
}
