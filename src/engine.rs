//! Guardrail evaluation engine.
//!
//! [`GuardEngine`] is the single owner of the rule store, the rate
//! limiter, and the violation ledger. Reads of rules and violation
//! history may proceed concurrently; every mutation is serialized behind
//! the corresponding lock. Handed to callers and the watch loop by `Arc`.
//!
//! SOFT ALERT MODE: a violation is recorded and surfaced, never used to
//! signal or terminate the supervised process.

use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::ratelimit::{RateDecision, RateLimiter};
use crate::rules::{GuardRule, RuleError, RulePatch, RuleSpec, RuleStore};
use crate::violations::{ViolationEvent, ViolationLedger, SEVERITY_WARNING};

/// Maximum characters of a triggering line kept in a violation excerpt.
const EXCERPT_MAX_CHARS: usize = 200;

/// Owns guardrail state and evaluates log lines against it.
#[derive(Debug)]
pub struct GuardEngine {
    rules: RwLock<RuleStore>,
    limiter: Mutex<RateLimiter>,
    ledger: RwLock<ViolationLedger>,
}

impl GuardEngine {
    /// Load the rule document and open the violation ledger.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Persistence`] if an existing rules document
    /// cannot be read or parsed at the top level.
    pub fn open(rules_path: &Path, violations_log: &Path) -> Result<Self, RuleError> {
        let store = RuleStore::load(rules_path)?;
        info!(
            rules = store.list().len(),
            path = %rules_path.display(),
            "rule store loaded"
        );
        Ok(Self {
            rules: RwLock::new(store),
            limiter: Mutex::new(RateLimiter::new()),
            ledger: RwLock::new(ViolationLedger::new(violations_log)),
        })
    }

    // -- Rule CRUD --

    /// All rules in insertion order.
    pub fn list_rules(&self) -> Vec<GuardRule> {
        self.read_rules(|store| store.list().to_vec())
    }

    /// Look up one rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] for an unknown id.
    pub fn get_rule(&self, id: &str) -> Result<GuardRule, RuleError> {
        self.read_rules(|store| {
            store
                .get(id)
                .cloned()
                .ok_or_else(|| RuleError::NotFound(id.to_owned()))
        })
    }

    /// Create a rule and persist the document.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Validation`] or [`RuleError::Persistence`].
    pub fn create_rule(&self, spec: RuleSpec) -> Result<GuardRule, RuleError> {
        let rule = self.write_rules(|store| store.create(spec))?;
        info!(id = %rule.id, name = %rule.name, "rule created");
        Ok(rule)
    }

    /// Merge a partial update onto a rule and persist the document.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`], [`RuleError::Validation`], or
    /// [`RuleError::Persistence`].
    pub fn update_rule(&self, id: &str, patch: RulePatch) -> Result<GuardRule, RuleError> {
        let rule = self.write_rules(|store| store.update(id, patch))?;
        info!(id = %rule.id, "rule updated");
        Ok(rule)
    }

    /// Delete a rule and drop its rate window.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] or [`RuleError::Persistence`].
    pub fn delete_rule(&self, id: &str) -> Result<(), RuleError> {
        self.write_rules(|store| store.delete(id))?;
        self.with_limiter(|limiter| limiter.remove(id));
        info!(id = %id, "rule deleted");
        Ok(())
    }

    // -- Evaluation --

    /// Evaluate one log line against the current rule set.
    ///
    /// First-match-wins: rules are visited in insertion order, disabled
    /// rules skipped, and within a rule the block patterns are tried in
    /// order. The first pattern whose lowercase form is a substring of
    /// the lowercased line produces exactly one violation; later rules
    /// and patterns are not checked. Returns `None` when nothing matches.
    pub fn evaluate_line(&self, line: &str) -> Option<ViolationEvent> {
        let lowered = line.to_lowercase();

        let matched = self.read_rules(|store| {
            for rule in store.list() {
                if !rule.enabled {
                    continue;
                }
                for pattern in &rule.block_patterns {
                    if lowered.contains(&pattern.to_lowercase()) {
                        return Some((rule.id.clone(), pattern.clone()));
                    }
                }
            }
            None
        });

        let (rule_id, pattern) = matched?;
        let event = ViolationEvent {
            ts: Utc::now(),
            rule_id,
            log_excerpt: truncate_chars(line, EXCERPT_MAX_CHARS),
            severity: SEVERITY_WARNING.to_owned(),
        };

        warn!(
            rule_id = %event.rule_id,
            pattern = %pattern,
            excerpt = %event.log_excerpt,
            "guardrail violation (soft alert)"
        );

        match self.ledger.write() {
            Ok(mut ledger) => ledger.record(event.clone()),
            Err(poisoned) => {
                warn!("violation ledger lock poisoned, recovering");
                poisoned.into_inner().record(event.clone());
            }
        }

        Some(event)
    }

    /// Consult a rule's sliding-window rate limit.
    ///
    /// Standalone guard: not called from the evaluation path. Any layer
    /// that executes guarded actions can use it before acting.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] for an unknown rule id.
    pub fn check_rate_limit(&self, rule_id: &str) -> Result<RateDecision, RuleError> {
        let limit = self.get_rule(rule_id)?.rate_limit_per_min;
        Ok(self.with_limiter(|limiter| limiter.check(rule_id, limit)))
    }

    // -- Violation queries --

    /// Recent violations, optionally filtered to `ts >= since`.
    ///
    /// `limit` is clamped to `1..=1000`; the most recent events win.
    pub fn list_violations(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<ViolationEvent> {
        match self.ledger.read() {
            Ok(ledger) => ledger.list(since, limit),
            Err(poisoned) => {
                warn!("violation ledger lock poisoned, recovering");
                poisoned.into_inner().list(since, limit)
            }
        }
    }

    /// The most recent violation, if any.
    pub fn last_violation(&self) -> Option<ViolationEvent> {
        match self.ledger.read() {
            Ok(ledger) => ledger.last().cloned(),
            Err(poisoned) => {
                warn!("violation ledger lock poisoned, recovering");
                poisoned.into_inner().last().cloned()
            }
        }
    }

    // -- Lock helpers (poisoned locks are recovered, never propagated) --

    fn read_rules<T>(&self, f: impl FnOnce(&RuleStore) -> T) -> T {
        match self.rules.read() {
            Ok(store) => f(&store),
            Err(poisoned) => {
                warn!("rule store lock poisoned, recovering");
                f(&poisoned.into_inner())
            }
        }
    }

    fn write_rules<T>(&self, f: impl FnOnce(&mut RuleStore) -> T) -> T {
        match self.rules.write() {
            Ok(mut store) => f(&mut store),
            Err(poisoned) => {
                warn!("rule store lock poisoned, recovering");
                f(&mut poisoned.into_inner())
            }
        }
    }

    fn with_limiter<T>(&self, f: impl FnOnce(&mut RateLimiter) -> T) -> T {
        match self.limiter.lock() {
            Ok(mut limiter) => f(&mut limiter),
            Err(poisoned) => {
                warn!("rate limiter lock poisoned, recovering");
                f(&mut poisoned.into_inner())
            }
        }
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
fn truncate_chars(line: &str, max: usize) -> String {
    line.chars().take(max).collect()
}
