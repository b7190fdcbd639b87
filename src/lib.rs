//! Clawguard — soft-alert safety sidecar for a supervised agent process.
//!
//! Supervises one external agent binary, captures its output to a durable
//! log, and continuously screens new log lines against configurable
//! guardrail rules. Violations are recorded and surfaced, never used to
//! terminate the supervised process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration loading and filesystem path resolution.
pub mod config;
/// Guardrail evaluation engine tying rules, rate limits, and violations together.
pub mod engine;
/// Structured logging setup.
pub mod logging;
/// Per-rule sliding-window rate limiting.
pub mod ratelimit;
/// Guard rule model, validation, and durable rule store.
pub mod rules;
/// Supervised process lifecycle and durable output capture.
pub mod supervisor;
/// Violation events, bounded history, and the durable violation log.
pub mod violations;
/// Incremental log tailing for the watch loop.
pub mod watcher;
