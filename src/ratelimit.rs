//! Per-rule sliding-window rate limiting.
//!
//! Each rule id owns an independent window of action timestamps covering
//! the trailing 60 seconds. Windows are created lazily on first check and
//! destroyed when their rule is deleted.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

/// Length of the sliding window.
const WINDOW_SECS: i64 = 60;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Under the limit; the action was recorded against the window.
    NotExceeded,
    /// At the limit; nothing was recorded.
    Exceeded,
}

/// Sliding-window action counter keyed by rule id.
///
/// A standalone guard: callers (the evaluator or an external
/// action-execution layer) decide when to consult it.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    /// Create an empty limiter with no windows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check (and on success record) an action for the given rule.
    ///
    /// Prunes timestamps older than 60 seconds from the rule's window,
    /// then records a new timestamp only when the remaining count is
    /// below `limit`.
    pub fn check(&mut self, rule_id: &str, limit: u32) -> RateDecision {
        self.check_at(rule_id, limit, Utc::now())
    }

    /// [`check`](Self::check) with an explicit clock, for tests.
    pub fn check_at(&mut self, rule_id: &str, limit: u32, now: DateTime<Utc>) -> RateDecision {
        let window = self.windows.entry(rule_id.to_owned()).or_default();

        let cutoff = now
            .checked_sub_signed(Duration::seconds(WINDOW_SECS))
            .unwrap_or(now);
        while window.front().is_some_and(|ts| *ts <= cutoff) {
            window.pop_front();
        }

        let count = u32::try_from(window.len()).unwrap_or(u32::MAX);
        if count < limit {
            window.push_back(now);
            RateDecision::NotExceeded
        } else {
            RateDecision::Exceeded
        }
    }

    /// Drop the window for a deleted rule. No-op if none exists.
    pub fn remove(&mut self, rule_id: &str) {
        self.windows.remove(rule_id);
    }

    /// Number of live windows (rules that have been checked at least once).
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}
