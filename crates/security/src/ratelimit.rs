//! Per-session sliding-window rate limiting.
//!
//! The window is bucketed at one-second granularity over the last minute.
//! Stale buckets are pruned on every check, and a rejected envelope leaves
//! no trace — in particular its nonce is never recorded, so a later retry
//! with a fresh nonce is not penalized twice.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

const WINDOW_SECS: i64 = 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SlidingWindow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered (second, count) buckets for one session, oldest first.
#[derive(Debug, Default, Clone)]
pub struct SlidingWindow {
    buckets: VecDeque<(i64, u32)>,
}

impl SlidingWindow {
    /// Drop buckets that fell out of the window ending at `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now.timestamp() - WINDOW_SECS;
        while let Some(&(sec, _)) = self.buckets.front() {
            if sec <= cutoff {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Total envelopes inside the window (call `prune` first).
    pub fn total(&self) -> u32 {
        self.buckets.iter().map(|&(_, c)| c).sum()
    }

    /// Count one envelope in the bucket for `now`.
    pub fn record(&mut self, now: DateTime<Utc>) {
        let sec = now.timestamp();
        match self.buckets.back_mut() {
            Some((last, count)) if *last == sec => *count += 1,
            _ => self.buckets.push_back((sec, 1)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RateLimiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stateless policy applied to each session's [`SlidingWindow`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    pub limit_per_minute: u32,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self { limit_per_minute }
    }

    /// Whether one more envelope at `now` would exceed the ceiling.
    /// Prunes the window as a side effect; does not record.
    pub fn would_exceed(&self, window: &mut SlidingWindow, now: DateTime<Utc>) -> bool {
        window.prune(now);
        window.total() >= self.limit_per_minute
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
