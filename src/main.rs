//! Clawguard CLI entry point.
//!
//! Provides `start`, `check`, and `rules` subcommands for running the
//! sidecar daemon, taking a one-shot look at guardrail state, and
//! managing rules from the command line.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use clawguard::config::{guard_paths, load_config, GuardPaths};
use clawguard::engine::GuardEngine;
use clawguard::logging;
use clawguard::rules::{RulePatch, RuleSpec};
use clawguard::supervisor::{tail_lines, ProcessSupervisor};
use clawguard::violations::ViolationEvent;
use clawguard::watcher::LogTailer;

/// Clawguard — soft-alert safety sidecar for a supervised agent process.
#[derive(Parser)]
#[command(name = "clawguard", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the sidecar daemon: supervise the agent and watch its output.
    Start {
        /// Override the agent executable from the config file.
        #[arg(long)]
        executable: Option<String>,
    },
    /// Print guardrail rules and recent violations, then exit.
    Check,
    /// Manage guardrail rules.
    Rules {
        /// Rule operation to perform.
        #[command(subcommand)]
        action: RulesAction,
    },
}

/// Rule management operations.
#[derive(Subcommand)]
enum RulesAction {
    /// List all rules as JSON.
    List,
    /// Create a new rule.
    Add {
        /// Human-readable rule name.
        #[arg(long)]
        name: String,
        /// Block pattern (repeatable, matched case-insensitively in order).
        #[arg(long = "pattern")]
        patterns: Vec<String>,
        /// Advisory allowed path (repeatable).
        #[arg(long = "allow-path")]
        allowed_paths: Vec<String>,
        /// Maximum guarded actions per minute.
        #[arg(long, default_value_t = 60)]
        rate_limit: u32,
        /// Create the rule disabled.
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a rule by id.
    Rm {
        /// Id of the rule to delete.
        id: String,
    },
    /// Enable or disable a rule by id.
    Toggle {
        /// Id of the rule to toggle.
        id: String,
        /// New enabled state.
        #[arg(long)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { executable } => handle_start(executable).await,
        Command::Check => handle_check(),
        Command::Rules { action } => handle_rules(action),
    }
}

/// Run the sidecar daemon: start the agent, then tail and evaluate its
/// output until interrupted.
async fn handle_start(executable_override: Option<String>) -> anyhow::Result<()> {
    let paths = guard_paths()?;
    paths.ensure_dirs()?;

    // Rotated JSON logs for the sidecar itself, separate from the
    // agent's raw output log.
    let _logging_guard = logging::init_daemon(&paths.logs_dir.join("controller"))?;

    let config = load_config(&paths.config_toml)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;

    let engine = Arc::new(
        GuardEngine::open(&paths.rules_file, &paths.violations_log)
            .context("failed to open guardrail engine")?,
    );

    let mut supervisor = ProcessSupervisor::new(
        &paths.agent_log,
        Duration::from_secs(config.agent.stop_grace_secs),
    );

    // Position the cursor before the agent starts so nothing written
    // after spawn is missed; existing history is skipped.
    let mut tailer = LogTailer::new(&paths.agent_log);

    let executable = executable_override.unwrap_or_else(|| config.agent.executable.clone());
    let status = supervisor
        .start(&executable)
        .with_context(|| format!("failed to start agent '{executable}'"))?;

    info!(
        pid = status.pid,
        rules = engine.list_rules().len(),
        interval_ms = config.watch.interval_ms,
        "clawguard sidecar started"
    );

    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_millis(config.watch.interval_ms));

    // Tail-and-evaluate loop. Rule mutations made through the engine
    // take effect on the next tick without restarting the loop.
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let lines = match tailer.poll_lines() {
                    Ok(lines) => lines,
                    Err(e) => {
                        warn!(error = %e, "failed to poll agent log");
                        continue;
                    }
                };

                for line in &lines {
                    // Soft alert: the violation is recorded and logged,
                    // never fed back into process control.
                    engine.evaluate_line(line);
                }

                if !lines.is_empty() {
                    debug!(lines = lines.len(), cursor = tailer.cursor(), "tick evaluated");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    match supervisor.stop().await {
        Ok(status) => info!(running = status.running, "agent stopped"),
        Err(e) => warn!(error = %e, "agent stop reported an error"),
    }

    Ok(())
}

/// One-shot look at the rule set and the recent violation trail.
fn handle_check() -> anyhow::Result<()> {
    logging::init_cli();

    let paths = guard_paths()?;
    let engine = GuardEngine::open(&paths.rules_file, &paths.violations_log)
        .context("failed to open guardrail engine")?;

    let rules = engine.list_rules();
    info!(rules = rules.len(), "rule store loaded");
    for rule in &rules {
        info!(
            id = %rule.id,
            name = %rule.name,
            enabled = rule.enabled,
            patterns = rule.block_patterns.len(),
            "rule"
        );
    }

    // The daemon owns the live ring buffer; a one-shot check reads the
    // durable trail instead.
    let recent = recent_violations(&paths, 10)?;
    if recent.is_empty() {
        info!("no recorded violations");
    } else {
        for violation in &recent {
            info!(
                ts = %violation.ts,
                rule_id = %violation.rule_id,
                excerpt = %violation.log_excerpt,
                "violation"
            );
        }
    }

    Ok(())
}

/// Parse the last `tail` records of the durable violation log.
fn recent_violations(paths: &GuardPaths, tail: usize) -> anyhow::Result<Vec<ViolationEvent>> {
    if !paths.violations_log.exists() {
        return Ok(Vec::new());
    }

    let lines = tail_lines(&paths.violations_log, tail).with_context(|| {
        format!(
            "failed to read violation log {}",
            paths.violations_log.display()
        )
    })?;

    // Malformed records are skipped, mirroring tolerant rule loading.
    Ok(lines
        .iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Execute a rule CRUD operation and print the result as JSON.
fn handle_rules(action: RulesAction) -> anyhow::Result<()> {
    logging::init_cli();

    let paths = guard_paths()?;
    paths.ensure_dirs()?;
    let engine = GuardEngine::open(&paths.rules_file, &paths.violations_log)
        .context("failed to open guardrail engine")?;

    match action {
        RulesAction::List => {
            let rules = engine.list_rules();
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
        RulesAction::Add {
            name,
            patterns,
            allowed_paths,
            rate_limit,
            disabled,
        } => {
            let rule = engine.create_rule(RuleSpec {
                name,
                block_patterns: patterns,
                allowed_paths,
                rate_limit_per_min: rate_limit,
                enabled: !disabled,
            })?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }
        RulesAction::Rm { id } => {
            engine.delete_rule(&id)?;
            info!(id = %id, "rule deleted");
        }
        RulesAction::Toggle { id, enabled } => {
            let patch = RulePatch {
                enabled: Some(enabled),
                ..RulePatch::default()
            };
            let rule = engine.update_rule(&id, patch)?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }
    }

    Ok(())
}
