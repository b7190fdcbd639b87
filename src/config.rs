//! Configuration loading for the Clawguard sidecar.
//!
//! Loads `clawguard.toml` with per-section defaults. All sections use
//! `#[serde(default)]` so a minimal or missing config file is valid.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Top-level Clawguard configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardConfig {
    /// Supervised agent process settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Watch loop timing.
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Settings for the supervised agent process.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Path or name of the agent executable to supervise.
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Seconds to wait for graceful termination before force-killing.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

/// Timing for the tail-and-evaluate watch loop.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Milliseconds between polls of the agent output log.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

impl GuardConfig {
    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.agent.executable.trim().is_empty(),
            "agent.executable must not be empty"
        );
        anyhow::ensure!(
            (1..=60).contains(&self.agent.stop_grace_secs),
            "agent.stop_grace_secs must be in [1, 60]"
        );
        anyhow::ensure!(
            (50..=60_000).contains(&self.watch.interval_ms),
            "watch.interval_ms must be in [50, 60000]"
        );
        Ok(())
    }
}

/// Resolved filesystem paths for Clawguard state under `~/.clawguard/`.
#[derive(Debug, Clone)]
pub struct GuardPaths {
    /// Root state directory.
    pub root: PathBuf,

    /// Directory for configuration documents.
    pub config_dir: PathBuf,

    /// Directory for durable logs.
    pub logs_dir: PathBuf,

    /// Path to the guardrail rules document.
    pub rules_file: PathBuf,

    /// Path to the append-only JSONL violation log.
    pub violations_log: PathBuf,

    /// Path to the supervised agent's raw output log.
    pub agent_log: PathBuf,

    /// Path to `clawguard.toml`.
    pub config_toml: PathBuf,
}

impl GuardPaths {
    /// Build the path set rooted at an arbitrary directory (used by tests).
    pub fn under(root: &Path) -> Self {
        let config_dir = root.join("config");
        let logs_dir = root.join("logs");
        Self {
            rules_file: config_dir.join("rules.json"),
            violations_log: logs_dir.join("violations.log"),
            agent_log: logs_dir.join("agent.log"),
            config_toml: root.join("clawguard.toml"),
            root: root.to_path_buf(),
            config_dir,
            logs_dir,
        }
    }

    /// Create the config and logs directories if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("failed to create {}", self.config_dir.display()))?;
        std::fs::create_dir_all(&self.logs_dir)
            .with_context(|| format!("failed to create {}", self.logs_dir.display()))?;
        Ok(())
    }
}

/// Resolve Clawguard's filesystem paths under the user's home directory.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn guard_paths() -> anyhow::Result<GuardPaths> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(GuardPaths::under(&base.home_dir().join(".clawguard")))
}

/// Load configuration from a TOML file.
///
/// A missing file yields the defaults; a present file must parse and
/// pass validation.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or
/// fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<GuardConfig> {
    if !path.exists() {
        let config = GuardConfig::default();
        config.validate()?;
        return Ok(config);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: GuardConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

// Default value functions for serde.

fn default_executable() -> String {
    "openclaw".to_owned()
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_interval_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("clawguard.toml")).expect("load");
        assert_eq!(config.watch.interval_ms, 500);
        assert_eq!(config.agent.stop_grace_secs, 5);
        assert_eq!(config.agent.executable, "openclaw");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clawguard.toml");
        std::fs::write(&path, "[watch]\ninterval_ms = 200\n").expect("write");

        let config = load_config(&path).expect("load");
        assert_eq!(config.watch.interval_ms, 200);
        assert_eq!(config.agent.executable, "openclaw");
    }

    #[test]
    fn out_of_range_interval_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clawguard.toml");
        std::fs::write(&path, "[watch]\ninterval_ms = 5\n").expect("write");

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn paths_are_rooted() {
        let paths = GuardPaths::under(Path::new("/tmp/cg"));
        assert_eq!(paths.rules_file, Path::new("/tmp/cg/config/rules.json"));
        assert_eq!(paths.agent_log, Path::new("/tmp/cg/logs/agent.log"));
    }
}
