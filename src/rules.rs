//! Guard rule model, validation, and the durable rule store.
//!
//! Rules live in memory in insertion order and are rewritten to a JSON
//! document on every mutation. Rule counts are small, so full rewrites
//! keep the on-disk document consistent without any incremental format.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Rule store operation errors.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule spec failed validation; nothing was mutated.
    #[error("invalid rule: {0}")]
    Validation(String),
    /// No rule exists with the given id.
    #[error("rule not found: {0}")]
    NotFound(String),
    /// The rules document could not be read or written.
    #[error("rules persistence error: {0}")]
    Persistence(String),
}

/// A guardrail rule screening the supervised process's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRule {
    /// Unique identifier, immutable once created.
    pub id: String,
    /// Human-readable rule name.
    pub name: String,
    /// Ordered case-insensitive substrings that trigger a violation.
    #[serde(default)]
    pub block_patterns: Vec<String>,
    /// Advisory path allowlist (reserved, not consulted by the evaluator).
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Maximum guarded actions per trailing minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: u32,
    /// Whether the rule participates in evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Fields for creating a new rule; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Human-readable rule name.
    pub name: String,
    /// Ordered case-insensitive substrings that trigger a violation.
    #[serde(default)]
    pub block_patterns: Vec<String>,
    /// Advisory path allowlist.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Maximum guarded actions per trailing minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: u32,
    /// Whether the rule participates in evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Partial update merged field-wise onto an existing rule.
///
/// `None` fields keep the current value. The id is never patchable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    /// New rule name.
    #[serde(default)]
    pub name: Option<String>,
    /// Replacement block pattern list.
    #[serde(default)]
    pub block_patterns: Option<Vec<String>>,
    /// Replacement advisory path allowlist.
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,
    /// New per-minute rate limit.
    #[serde(default)]
    pub rate_limit_per_min: Option<u32>,
    /// New enabled flag.
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// On-disk rules document: `{"rules": [...]}`.
///
/// Entries are kept as raw JSON values on load so one malformed entry
/// cannot poison the whole document.
#[derive(Debug, Serialize, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    rules: Vec<serde_json::Value>,
}

/// Owns the guardrail rule set and its backing JSON document.
///
/// Rules are held in insertion order; every mutation synchronously
/// rewrites the document in full. Callers serialize mutations (the
/// engine wraps the store in a `RwLock`).
#[derive(Debug)]
pub struct RuleStore {
    rules: Vec<GuardRule>,
    path: PathBuf,
}

impl RuleStore {
    /// Load the rule store from the given document path.
    ///
    /// A missing document yields an empty store. Individually malformed
    /// entries and duplicate ids are skipped with a warning rather than
    /// failing the whole load.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Persistence`] if an existing document cannot
    /// be read or is not valid JSON at the top level.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let mut store = Self {
            rules: Vec::new(),
            path: path.to_path_buf(),
        };

        if !path.exists() {
            return Ok(store);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| RuleError::Persistence(format!("read {}: {e}", path.display())))?;
        let document: RulesDocument = serde_json::from_str(&contents)
            .map_err(|e| RuleError::Persistence(format!("parse {}: {e}", path.display())))?;

        for entry in document.rules {
            match serde_json::from_value::<GuardRule>(entry) {
                Ok(rule) => {
                    if store.rules.iter().any(|r| r.id == rule.id) {
                        warn!(id = %rule.id, "duplicate rule id in document, skipping");
                        continue;
                    }
                    store.rules.push(rule);
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed rule entry");
                }
            }
        }

        Ok(store)
    }

    /// All rules in insertion order.
    pub fn list(&self) -> &[GuardRule] {
        &self.rules
    }

    /// Look up a rule by id.
    pub fn get(&self, id: &str) -> Option<&GuardRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Create a rule from a spec, assign a fresh unique id, and persist.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Validation`] for a malformed spec and
    /// [`RuleError::Persistence`] if the document rewrite fails.
    pub fn create(&mut self, spec: RuleSpec) -> Result<GuardRule, RuleError> {
        let rule = GuardRule {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            block_patterns: spec.block_patterns,
            allowed_paths: spec.allowed_paths,
            rate_limit_per_min: spec.rate_limit_per_min,
            enabled: spec.enabled,
        };
        validate(&rule)?;

        self.rules.push(rule.clone());
        if let Err(e) = self.persist() {
            self.rules.pop();
            return Err(e);
        }
        Ok(rule)
    }

    /// Merge a partial update onto an existing rule, re-validate, persist.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] for an unknown id,
    /// [`RuleError::Validation`] if the merged rule is invalid, and
    /// [`RuleError::Persistence`] if the document rewrite fails.
    pub fn update(&mut self, id: &str, patch: RulePatch) -> Result<GuardRule, RuleError> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_owned()))?;

        let mut merged = self.rules[index].clone();
        if let Some(name) = patch.name {
            merged.name = name;
        }
        if let Some(patterns) = patch.block_patterns {
            merged.block_patterns = patterns;
        }
        if let Some(paths) = patch.allowed_paths {
            merged.allowed_paths = paths;
        }
        if let Some(limit) = patch.rate_limit_per_min {
            merged.rate_limit_per_min = limit;
        }
        if let Some(enabled) = patch.enabled {
            merged.enabled = enabled;
        }
        validate(&merged)?;

        let previous = std::mem::replace(&mut self.rules[index], merged.clone());
        if let Err(e) = self.persist() {
            self.rules[index] = previous;
            return Err(e);
        }
        Ok(merged)
    }

    /// Delete a rule by id and persist.
    ///
    /// The caller is responsible for dropping the rule's rate window.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] for an unknown id and
    /// [`RuleError::Persistence`] if the document rewrite fails.
    pub fn delete(&mut self, id: &str) -> Result<(), RuleError> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_owned()))?;

        let removed = self.rules.remove(index);
        if let Err(e) = self.persist() {
            self.rules.insert(index, removed);
            return Err(e);
        }
        Ok(())
    }

    /// Rewrite the full rules document.
    fn persist(&self) -> Result<(), RuleError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RuleError::Persistence(format!("create {}: {e}", parent.display())))?;
        }

        let entries = self
            .rules
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RuleError::Persistence(format!("serialize rules: {e}")))?;
        let document = RulesDocument { rules: entries };

        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| RuleError::Persistence(format!("serialize document: {e}")))?;
        std::fs::write(&self.path, json)
            .map_err(|e| RuleError::Persistence(format!("write {}: {e}", self.path.display())))
    }
}

/// Check a rule's fields before it is stored.
fn validate(rule: &GuardRule) -> Result<(), RuleError> {
    if rule.name.trim().is_empty() {
        return Err(RuleError::Validation("name must not be empty".to_owned()));
    }
    if rule.rate_limit_per_min == 0 {
        return Err(RuleError::Validation(
            "rate_limit_per_min must be positive".to_owned(),
        ));
    }
    if rule.block_patterns.iter().any(|p| p.trim().is_empty()) {
        return Err(RuleError::Validation(
            "block_patterns must not contain empty entries".to_owned(),
        ));
    }
    Ok(())
}

fn default_rate_limit() -> u32 {
    60
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, patterns: &[&str]) -> RuleSpec {
        RuleSpec {
            name: name.to_owned(),
            block_patterns: patterns.iter().map(|p| (*p).to_owned()).collect(),
            allowed_paths: Vec::new(),
            rate_limit_per_min: 60,
            enabled: true,
        }
    }

    #[test]
    fn create_assigns_unique_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RuleStore::load(&dir.path().join("rules.json")).expect("load");

        let a = store.create(spec("a", &["x"])).expect("create a");
        let b = store.create(spec("b", &["y"])).expect("create b");
        assert_ne!(a.id, b.id);
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn round_trip_preserves_rules_and_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.json");

        let mut store = RuleStore::load(&path).expect("load");
        let first = store.create(spec("first", &["rm -rf"])).expect("create");
        let second = store.create(spec("second", &["curl"])).expect("create");

        let reloaded = RuleStore::load(&path).expect("reload");
        assert_eq!(reloaded.list(), &[first, second]);
    }

    #[test]
    fn update_merges_partial_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RuleStore::load(&dir.path().join("rules.json")).expect("load");
        let rule = store.create(spec("original", &["x"])).expect("create");

        let patch = RulePatch {
            enabled: Some(false),
            ..RulePatch::default()
        };
        let updated = store.update(&rule.id, patch).expect("update");

        assert!(!updated.enabled);
        assert_eq!(updated.name, "original");
        assert_eq!(updated.block_patterns, vec!["x".to_owned()]);
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RuleStore::load(&dir.path().join("rules.json")).expect("load");

        let result = store.update("missing", RulePatch::default());
        assert!(matches!(result, Err(RuleError::NotFound(_))));
    }

    #[test]
    fn delete_removes_rule() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.json");
        let mut store = RuleStore::load(&path).expect("load");
        let rule = store.create(spec("doomed", &["x"])).expect("create");

        store.delete(&rule.id).expect("delete");
        assert!(store.get(&rule.id).is_none());
        assert!(matches!(
            store.delete(&rule.id),
            Err(RuleError::NotFound(_))
        ));

        let reloaded = RuleStore::load(&path).expect("reload");
        assert!(reloaded.list().is_empty());
    }

    #[test]
    fn invalid_spec_rejected_before_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RuleStore::load(&dir.path().join("rules.json")).expect("load");

        assert!(matches!(
            store.create(spec("  ", &["x"])),
            Err(RuleError::Validation(_))
        ));

        let mut zero = spec("zero", &["x"]);
        zero.rate_limit_per_min = 0;
        assert!(matches!(
            store.create(zero),
            Err(RuleError::Validation(_))
        ));

        assert!(store.list().is_empty());
    }

    #[test]
    fn malformed_entry_skipped_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.json");

        let document = serde_json::json!({
            "rules": [
                {"id": "ok-1", "name": "good", "block_patterns": ["x"],
                 "allowed_paths": [], "rate_limit_per_min": 10, "enabled": true},
                {"name": "no id field"},
                {"id": "ok-2", "name": "also good"},
            ]
        });
        std::fs::write(&path, document.to_string()).expect("write");

        let store = RuleStore::load(&path).expect("load");
        let ids: Vec<&str> = store.list().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ok-1", "ok-2"]);
        // Optional fields fall back to their defaults.
        assert_eq!(store.list()[1].rate_limit_per_min, 60);
        assert!(store.list()[1].enabled);
    }
}
