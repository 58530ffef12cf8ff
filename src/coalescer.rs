//! Rate limiting for region-updated notifications.
//!
//! Decoders report changed areas far more often than a viewer can repaint.
//! Changes are unioned into a pending rectangle and released at most once per
//! flush interval, plus one final flush at end of session.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::models::Rect;

pub struct ProgressCoalescer {
    pending: Rect,
    last_emit: Instant,
    interval: Duration,
}

impl ProgressCoalescer {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            pending: Rect::default(),
            last_emit: now,
            interval,
        }
    }

    /// Restart the flush timer, e.g. when a session starts.
    pub fn reset(&mut self, now: Instant) {
        self.pending = Rect::default();
        self.last_emit = now;
    }

    /// Union `rect` into the pending region.
    ///
    /// Returns the region to emit if more than the flush interval has elapsed
    /// since the last emission.
    pub fn region_changed(&mut self, rect: Rect, now: Instant) -> Option<Rect> {
        self.pending = self.pending.union(&rect);
        if self.pending.is_empty() {
            return None;
        }
        if now.saturating_duration_since(self.last_emit) > self.interval {
            trace!(?self.pending, "Flushing coalesced region");
            self.last_emit = now;
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }

    /// Take whatever is pending regardless of the timer.
    pub fn flush(&mut self, now: Instant) -> Option<Rect> {
        if self.pending.is_empty() {
            return None;
        }
        self.last_emit = now;
        Some(std::mem::take(&mut self.pending))
    }

    pub fn pending(&self) -> Rect {
        self.pending
    }

    pub fn last_emit(&self) -> Instant {
        self.last_emit
    }
}
