//! Shared test fakes, gated the same way the teacher gates its
//! `test_support` module: available to this crate's own tests and to
//! integration tests that opt into the `test-support` feature.

use anyhow::{Result, anyhow};

use crate::core::context_score::{Message, Role};
use crate::io::agent_driver::{AgentDriver, TurnResult};

fn approx_tokens(text: &str) -> u32 {
    (text.len() as u32 / 4).max(1)
}

/// A scripted driver that replays a fixed list of responses instead of
/// spawning a process — the `engine` analogue of the teacher's
/// `ScriptedExecutor`/`ScriptedGuardRunner` fakes.
pub struct ScriptedAgentDriver {
    pub responses: Vec<String>,
    next: usize,
    session_id: Option<String>,
    history: Vec<Message>,
}

impl ScriptedAgentDriver {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            next: 0,
            session_id: None,
            history: Vec::new(),
        }
    }

    fn next_response(&mut self) -> Result<String> {
        let response = self.responses.get(self.next).cloned().ok_or_else(|| anyhow!("scripted driver exhausted"))?;
        self.next += 1;
        Ok(response)
    }
}

impl AgentDriver for ScriptedAgentDriver {
    fn start_session(&mut self, _system_context: &str, first_prompt: &str) -> Result<TurnResult> {
        self.session_id = Some("scripted-session".to_string());
        let response = self.next_response()?;
        self.history.push(Message {
            role: Role::User,
            content: first_prompt.to_string(),
        });
        self.history.push(Message {
            role: Role::Assistant,
            content: response.clone(),
        });
        Ok(TurnResult {
            tokens_in: approx_tokens(first_prompt),
            tokens_out: approx_tokens(&response),
            response,
            session_id: "scripted-session".to_string(),
        })
    }

    fn continue_session(&mut self, prompt: &str) -> Result<TurnResult> {
        let response = self.next_response()?;
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
            session_id: "scripted-session".to_string(),
        })
    }

    fn has_active_session(&self) -> bool {
        self.session_id.is_some()
    }

    fn reset(&mut self) {
        self.session_id = None;
        self.history.clear();
    }

    fn history(&self) -> &[Message] {
        &self.history
    }
}
