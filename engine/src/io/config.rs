//! Engine configuration stored under `<state-dir>/config.toml`.
//!
//! This file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible MVP values.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the parallel worker pool for independent step batches.
    pub worker_pool_size: usize,

    /// Per-turn agent timeout, in seconds, for the worker role.
    pub worker_timeout_secs: u64,
    /// Per-turn agent timeout, in seconds, for the supervisor role.
    pub supervisor_timeout_secs: u64,
    /// Per-turn agent timeout, in seconds, for the planner role.
    pub planner_timeout_secs: u64,

    /// Maximum retries for a single classified-recoverable operation.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Backoff ceiling in milliseconds.
    pub backoff_cap_ms: u64,
    /// Consecutive failures on one operation id before the circuit breaker
    /// trips and forces ABORT recovery.
    pub circuit_breaker_threshold: u32,
    /// How long a tripped circuit breaker stays open before it resets.
    pub circuit_breaker_cooldown_secs: u64,

    /// Minimum and maximum adaptive delay between worker turns, in
    /// milliseconds.
    pub min_turn_delay_ms: u64,
    pub max_turn_delay_ms: u64,

    /// How long a step may sit unfinished, in seconds, before it is
    /// eligible for decomposition even if its complexity isn't `Complex`.
    pub slow_step_threshold_secs: u64,

    /// Safety counter bounding outer-loop replanning cycles.
    pub max_cycles: u32,
    /// Consecutive false completion claims tolerated before an escalation
    /// event is emitted (the run still continues).
    pub max_false_claims: u32,

    /// Token budget for a single assembled prompt context.
    pub context_token_budget: u32,
    /// Number of most-recent messages kept uncompressed.
    pub context_keep_recent: usize,
    /// Message count above which history is compressed.
    pub context_compress_threshold: usize,

    /// Bound on the assessment cache and prompt cache entry counts.
    pub cache_capacity: usize,
    /// TTL for cache entries, in seconds.
    pub cache_ttl_secs: u64,

    /// Bound on the duplicate-response detection window.
    pub duplicate_window_size: usize,

    /// Output byte cap for agent turns and verification/smoke commands.
    pub output_limit_bytes: usize,

    /// Retention count for session checkpoints.
    pub checkpoint_retention: usize,
    /// Age, in hours, beyond which a completed/failed session is eligible
    /// for cleanup.
    pub session_retention_hours: u64,

    /// External agent binary invoked by the `AgentDriver`.
    pub agent_binary: String,

    /// Force retry-shaped recovery even for strategies that would
    /// otherwise skip straight to escalation (the CLI `--retry` flag).
    #[serde(default)]
    pub force_retry: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 3,
            worker_timeout_secs: 300,
            supervisor_timeout_secs: 60,
            planner_timeout_secs: 120,
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_cap_ms: 30_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 60,
            min_turn_delay_ms: 500,
            max_turn_delay_ms: 15_000,
            slow_step_threshold_secs: 600,
            max_cycles: 10,
            max_false_claims: 3,
            context_token_budget: 8_000,
            context_keep_recent: 6,
            context_compress_threshold: 20,
            cache_capacity: 256,
            cache_ttl_secs: 900,
            duplicate_window_size: 10,
            output_limit_bytes: 1_000_000,
            checkpoint_retention: 20,
            session_retention_hours: 24,
            agent_binary: "agent".to_string(),
            force_retry: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(anyhow!("worker_pool_size must be > 0"));
        }
        if self.worker_timeout_secs == 0 || self.supervisor_timeout_secs == 0 || self.planner_timeout_secs == 0 {
            return Err(anyhow!("per-role timeouts must be > 0"));
        }
        if self.backoff_factor < 1.0 {
            return Err(anyhow!("backoff_factor must be >= 1.0"));
        }
        if self.min_turn_delay_ms > self.max_turn_delay_ms {
            return Err(anyhow!("min_turn_delay_ms must be <= max_turn_delay_ms"));
        }
        if self.max_cycles == 0 {
            return Err(anyhow!("max_cycles must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.agent_binary.trim().is_empty() {
            return Err(anyhow!("agent_binary must be non-empty"));
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn supervisor_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor_timeout_secs)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Load config from a TOML file. If the file is missing, returns
/// `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig = toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path.parent().with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = EngineConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_inverted_turn_delay_bounds() {
        let mut cfg = EngineConfig::default();
        cfg.min_turn_delay_ms = 5000;
        cfg.max_turn_delay_ms = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_worker_pool() {
        let mut cfg = EngineConfig::default();
        cfg.worker_pool_size = 0;
        assert!(cfg.validate().is_err());
    }
}
