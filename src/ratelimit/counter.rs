//! Window counters backing the in-memory storage.
//!
//! Counters are plain values; callers hold the owning map entry for the
//! duration of an update so each hit is applied atomically.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::item::MAX_PERIOD;

/// End of a window opening at `start` and lasting `period`.
///
/// Periods past the end of the clock are clamped to [`MAX_PERIOD`].
fn window_end(start: Instant, period: Duration) -> Instant {
    start
        .checked_add(period)
        .or_else(|| start.checked_add(MAX_PERIOD))
        .unwrap_or(start)
}

/// A fixed window counter.
///
/// The window starts at the first hit and lasts one period. With elastic
/// expiry every hit pushes the end of the window out by a full period.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    /// Hits recorded in the current window
    count: u64,
    /// When the current window ends
    expires_at: Instant,
}

impl WindowCounter {
    /// Create an empty counter whose window ends `period` from now.
    pub fn new(period: Duration) -> Self {
        Self {
            count: 0,
            expires_at: window_end(Instant::now(), period),
        }
    }

    /// Record one hit and check it against `amount`.
    ///
    /// Returns `true` if the hit is within the limit. Hits over the limit
    /// are still counted.
    pub fn increment(&mut self, amount: u64, period: Duration, elastic: bool) -> bool {
        let now = Instant::now();
        if now >= self.expires_at {
            self.count = 0;
            self.expires_at = window_end(now, period);
        } else if elastic {
            self.expires_at = window_end(now, period);
        }

        self.count += 1;
        self.count <= amount
    }

    /// Hits in the current window, zero once it has expired.
    pub fn current_count(&self) -> u64 {
        if self.is_expired() {
            0
        } else {
            self.count
        }
    }

    /// When the current window ends.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// A moving window log of hit instants.
#[derive(Debug, Clone)]
pub struct MovingWindow {
    /// Length of the trailing window
    period: Duration,
    entries: VecDeque<Instant>,
}

impl MovingWindow {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            entries: VecDeque::new(),
        }
    }

    /// Record a hit if fewer than `amount` hits fall within the trailing period.
    ///
    /// Rejected hits are not recorded.
    pub fn acquire(&mut self, amount: u64) -> bool {
        let now = Instant::now();
        self.evict(now);

        if (self.entries.len() as u64) < amount {
            self.entries.push_back(now);
            true
        } else {
            false
        }
    }

    /// Hits within the trailing period.
    pub fn current_count(&mut self) -> u64 {
        self.evict(Instant::now());
        self.entries.len() as u64
    }

    /// When the log empties if no further hits arrive; `None` once it is empty.
    pub fn expires_at(&mut self) -> Option<Instant> {
        self.evict(Instant::now());
        self.entries
            .back()
            .map(|newest| window_end(*newest, self.period))
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.entries.front() {
            if now.duration_since(*oldest) >= self.period {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}
