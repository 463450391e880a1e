/// Debounced hotplug state tracking.
///
/// A raw reading becomes *stable* after `threshold` consecutive identical
/// polls, and a stable value is *applied* (returned to the caller for side
/// effects) only when it differs from the last applied value. The double
/// gate rejects electrical glitches and re-application of an unchanged
/// state.
use std::time::{Duration, Instant};

pub const DEBOUNCE_POLLS: u32 = 3;

#[derive(Debug)]
pub struct Debounce {
    threshold: u32,
    raw: Option<bool>,
    streak: u32,
    applied: Option<bool>,
}

/// An applied stable transition.
#[derive(Debug, PartialEq, Eq)]
pub struct Transition {
    pub connected: bool,
    /// True for the first applied reading after startup, when the
    /// compositor restart is skipped.
    pub first: bool,
}

impl Debounce {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            raw: None,
            streak: 0,
            applied: None,
        }
    }

    /// Last applied stable value, if any.
    pub fn applied(&self) -> Option<bool> {
        self.applied
    }

    /// Feeds one raw poll; returns a transition exactly when the debounce
    /// threshold is crossed into a value different from the last applied one.
    pub fn observe(&mut self, raw: bool) -> Option<Transition> {
        if self.raw == Some(raw) {
            self.streak += 1;
        } else {
            self.raw = Some(raw);
            self.streak = 1;
        }

        // Exact equality: a long steady streak fires at most once.
        if self.streak == self.threshold && self.applied != Some(raw) {
            let first = self.applied.is_none();
            self.applied = Some(raw);
            return Some(Transition {
                connected: raw,
                first,
            });
        }
        None
    }
}

/// Rate limiter for periodic work inside the fast poll loop (heartbeat
/// logging, external-manager retry spacing). Fires on the first check.
#[derive(Debug)]
pub struct Cadence {
    period: Duration,
    last: Option<Instant>,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.period => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
