//! Violation events, bounded in-memory history, and the durable log.
//!
//! The ring buffer is authoritative for queries; the JSONL log on disk is
//! a best-effort durable trail that is appended to and never truncated or
//! rotated by this subsystem.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum number of events held in memory.
const HISTORY_CAPACITY: usize = 1000;

/// Maximum number of events a single query may return.
pub const QUERY_LIMIT_MAX: usize = 1000;

/// Severity attached to every violation while in soft-alert mode.
pub const SEVERITY_WARNING: &str = "warning";

/// A record of one rule pattern matching one log line.
///
/// `rule_id` is a weak reference: the rule may be deleted later without
/// invalidating the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationEvent {
    /// When the match was observed.
    pub ts: DateTime<Utc>,
    /// Id of the rule whose pattern matched.
    pub rule_id: String,
    /// Up to 200 characters of the triggering line.
    pub log_excerpt: String,
    /// Severity level (always "warning" in soft-alert mode).
    pub severity: String,
}

/// Bounded in-memory violation history plus the append-only durable log.
#[derive(Debug)]
pub struct ViolationLedger {
    history: VecDeque<ViolationEvent>,
    log_path: PathBuf,
}

impl ViolationLedger {
    /// Create a ledger whose durable log lives at the given path.
    ///
    /// The log file itself is created lazily on first append.
    pub fn new(log_path: &Path) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            log_path: log_path.to_path_buf(),
        }
    }

    /// Record a violation.
    ///
    /// The in-memory append always succeeds (evicting the oldest event at
    /// capacity). The durable append is best-effort: a disk fault is
    /// logged and never surfaced, so the in-memory view stays available.
    pub fn record(&mut self, event: ViolationEvent) {
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());

        if let Err(e) = self.append_durable(&event) {
            warn!(
                error = %e,
                path = %self.log_path.display(),
                "failed to append violation to durable log"
            );
        }
    }

    /// Most recent events, optionally filtered to `ts >= since`.
    ///
    /// `limit` is clamped to `1..=1000`. Events are returned in
    /// chronological order, keeping the most recent when truncating.
    pub fn list(&self, since: Option<DateTime<Utc>>, limit: usize) -> Vec<ViolationEvent> {
        let limit = limit.clamp(1, QUERY_LIMIT_MAX);

        let matching: Vec<&ViolationEvent> = self
            .history
            .iter()
            .filter(|v| since.is_none_or(|s| v.ts >= s))
            .collect();

        matching
            .iter()
            .skip(matching.len().saturating_sub(limit))
            .map(|v| (*v).clone())
            .collect()
    }

    /// The most recent violation, if any.
    pub fn last(&self) -> Option<&ViolationEvent> {
        self.history.back()
    }

    /// Total events currently held in memory.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether no events have been recorded (or all have been evicted).
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Append one JSONL record to the durable log.
    fn append_durable(&self, event: &ViolationEvent) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{line}")
    }
}
