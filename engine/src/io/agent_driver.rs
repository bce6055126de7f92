//! Subprocess adapter over an external CLI LLM agent.
//!
//! The orchestration engine treats the agent as an opaque, fail-fast
//! collaborator: this module owns the one place that actually shells out
//! to it. `AgentDriver` is a trait so tests substitute a scripted fake
//! instead of spawning a real binary, exactly as the teacher's tests
//! substitute `ScriptedExecutor` for `CodexExecutor`.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::context_score::{Message, Role};
use crate::io::process::run_command_with_stream;

/// Which conversational role a driver instance plays. Each role is just a
/// distinct [`AgentDriverConfig`] value fed to the same subprocess
/// adapter — no polymorphism needed for a closed set of three roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Worker,
    Supervisor,
    Planner,
}

#[derive(Debug, Clone)]
pub struct AgentDriverConfig {
    pub binary: String,
    pub base_args: Vec<String>,
    pub model: String,
    pub fallback_model: Option<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub stream_path: Option<PathBuf>,
}

impl AgentDriverConfig {
    pub fn for_role(role: AgentRole, binary: &str) -> Self {
        let (model, fallback_model, timeout) = match role {
            AgentRole::Worker => ("worker-primary".to_string(), Some("worker-fallback".to_string()), Duration::from_secs(300)),
            AgentRole::Supervisor => (
                "supervisor-primary".to_string(),
                Some("supervisor-fallback".to_string()),
                Duration::from_secs(60),
            ),
            AgentRole::Planner => ("planner-primary".to_string(), Some("planner-fallback".to_string()), Duration::from_secs(120)),
        };
        Self {
            binary: binary.to_string(),
            base_args: Vec::new(),
            model,
            fallback_model,
            timeout,
            output_limit_bytes: 1_000_000,
            stream_path: None,
        }
    }
}

/// The result of a single agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub response: String,
    pub session_id: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

fn approx_tokens(text: &str) -> u32 {
    (text.len() as u32 / 4).max(1)
}

/// Opaque adapter over the external agent.
pub trait AgentDriver {
    fn start_session(&mut self, system_context: &str, first_prompt: &str) -> Result<TurnResult>;
    fn continue_session(&mut self, prompt: &str) -> Result<TurnResult>;
    fn has_active_session(&self) -> bool;
    fn reset(&mut self);
    fn history(&self) -> &[Message];
}

/// A driver backed by spawning `config.binary` once per turn, feeding the
/// prompt on stdin and reading the response from stdout.
pub struct SubprocessAgentDriver {
    config: AgentDriverConfig,
    session_id: Option<String>,
    history: Vec<Message>,
    /// Set once this conversation has failed over to the fallback model, so
    /// every subsequent turn in the same session keeps using it rather than
    /// bouncing back to a primary model that already proved unreachable.
    using_fallback: bool,
}

impl SubprocessAgentDriver {
    pub fn new(config: AgentDriverConfig) -> Self {
        Self {
            config,
            session_id: None,
            history: Vec::new(),
            using_fallback: false,
        }
    }

    fn active_model(&self) -> &str {
        if self.using_fallback {
            self.config.fallback_model.as_deref().unwrap_or(&self.config.model)
        } else {
            &self.config.model
        }
    }

    #[instrument(skip_all, fields(model = %self.active_model()))]
    fn run_turn(&mut self, prompt: &str) -> Result<TurnResult> {
        match self.run_turn_with_model(prompt, self.active_model().to_string()) {
            Ok(turn) => Ok(turn),
            Err(primary_err) => {
                if self.using_fallback {
                    return Err(primary_err);
                }
                let Some(fallback) = self.config.fallback_model.clone() else {
                    return Err(primary_err);
                };
                warn!(primary_model = %self.config.model, fallback_model = %fallback, err = %primary_err, "primary model failed, retrying with fallback");
                self.using_fallback = true;
                self.run_turn_with_model(prompt, fallback)
            }
        }
    }

    fn run_turn_with_model(&mut self, prompt: &str, model: String) -> Result<TurnResult> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.base_args).arg("--model").arg(&model).stdin(Stdio::piped());

        let output = run_command_with_stream(
            cmd,
            Some(prompt.as_bytes()),
            self.config.timeout,
            self.config.output_limit_bytes,
            self.config.stream_path.as_deref(),
        )
        .context("run agent driver subprocess")?;

        if output.timed_out {
            warn!(model = %model, "agent driver timed out");
            return Err(anyhow!("agent driver timed out after {:?}", self.config.timeout));
        }
        if !output.status.success() {
            warn!(model = %model, exit_code = ?output.status.code(), "agent driver exited non-zero");
            return Err(anyhow!("agent driver failed with status {:?}", output.status.code()));
        }

        let response = String::from_utf8_lossy(&output.stdout).into_owned();
        let session_id = self
            .session_id
            .clone()
            .unwrap_or_else(|| format!("{:x}", md5_like_hash(prompt)));
        self.session_id = Some(session_id.clone());

        self.history.push(Message {
            role: Role::User,
            content: prompt.to_string(),
        });
        self.history.push(Message {
            role: Role::Assistant,
            content: response.clone(),
        });

        Ok(TurnResult {
            tokens_in: approx_tokens(prompt),
            tokens_out: approx_tokens(&response),
            response,
            session_id,
        })
    }
}

/// A cheap, non-cryptographic fingerprint used only to derive a
/// conversation-scoped session id when the underlying agent binary
/// doesn't hand one back (SHA-256 is reserved for the engine's own
/// resumable session ids).
fn md5_like_hash(seed: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in seed.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl AgentDriver for SubprocessAgentDriver {
    fn start_session(&mut self, system_context: &str, first_prompt: &str) -> Result<TurnResult> {
        info!(model = %self.config.model, "starting agent session");
        self.history.clear();
        self.session_id = None;
        let combined = format!("{system_context}\n\n{first_prompt}");
        self.run_turn(&combined)
    }

    fn continue_session(&mut self, prompt: &str) -> Result<TurnResult> {
        if self.session_id.is_none() {
            return Err(anyhow!("continue_session called with no active session"));
        }
        self.run_turn(prompt)
    }

    fn has_active_session(&self) -> bool {
        self.session_id.is_some()
    }

    fn reset(&mut self) {
        self.session_id = None;
        self.history.clear();
        self.using_fallback = false;
    }

    fn history(&self) -> &[Message] {
        &self.history
    }
}
