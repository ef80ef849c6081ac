use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::config::WorkflowConfig;
use crate::error::{Stage, WorkflowError};
use crate::types::{LlmResponse, Message};

use super::action::{has_finished, parse_action};
use super::llm::{CallOptions, LlmClient};
use super::session::{TerminalSession, ENTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// The model emitted the completion token.
    Completed,
    /// The step ceiling was reached first.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    NotStarted,
    Running,
    Halted(HaltReason),
}

/// Snapshot of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub status: HaltReason,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_creation_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub steps: usize,
    pub messages: Vec<Message>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowOutput {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write transcript: {}", path.display()))?;
        Ok(())
    }
}

impl fmt::Display for WorkflowOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Status: {:?}", self.status)?;
        writeln!(f, "Total input tokens: {}", self.total_input_tokens)?;
        writeln!(f, "Total output tokens: {}", self.total_output_tokens)?;
        writeln!(f, "Steps taken: {}", self.steps)?;
        writeln!(f, "Messages:")?;
        for msg in &self.messages {
            writeln!(f, "\t[{}]: {}", msg.role.as_str(), msg.content.trim())?;
        }
        Ok(())
    }
}

/// Drives the model one step at a time: a reply with a single command, then
/// the command's output, until it signals completion. One instance owns one
/// conversation.
pub struct AgenticWorkflow {
    client: Arc<dyn LlmClient>,
    config: WorkflowConfig,
    options: CallOptions,
    messages: Vec<Message>,
    steps: usize,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cache_creation_tokens: u64,
    total_cache_read_tokens: u64,
    state: WorkflowState,
}

impl AgenticWorkflow {
    pub fn new(client: Arc<dyn LlmClient>, config: WorkflowConfig) -> Self {
        AgenticWorkflow {
            client,
            config,
            options: CallOptions::default(),
            messages: Vec::new(),
            steps: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cache_creation_tokens: 0,
            total_cache_read_tokens: 0,
            state: WorkflowState::NotStarted,
        }
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.total_input_tokens
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output_tokens
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    fn reset(&mut self, instruction: &str) {
        self.messages = vec![
            Message::system(self.config.system_prompt.as_str()),
            Message::user(self.config.render_instruction(instruction)),
        ];
        self.steps = 0;
        self.total_input_tokens = 0;
        self.total_output_tokens = 0;
        self.total_cache_creation_tokens = 0;
        self.total_cache_read_tokens = 0;
        self.state = WorkflowState::Running;
    }

    fn step_limit_reached(&self) -> bool {
        self.config.max_steps > 0 && self.steps >= self.config.max_steps
    }

    pub async fn run(
        &mut self,
        instruction: &str,
        session: &mut dyn TerminalSession,
    ) -> Result<WorkflowOutput, WorkflowError> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("workflow", %run_id, model = %self.client.model());
        self.run_inner(instruction, session).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        instruction: &str,
        session: &mut dyn TerminalSession,
    ) -> Result<WorkflowOutput, WorkflowError> {
        tracing::info!("Starting workflow");
        let started_at = Utc::now();
        self.reset(instruction);

        let reason = loop {
            if self.step_limit_reached() {
                tracing::warn!(max_steps = self.config.max_steps, "Step limit reached");
                break HaltReason::Exhausted;
            }
            if self.step(session).await? {
                tracing::info!("Task marked as complete");
                break HaltReason::Completed;
            }
        };
        self.state = WorkflowState::Halted(reason);

        tracing::info!(steps = self.steps, "Workflow completed in {} steps", self.steps);

        Ok(WorkflowOutput {
            status: reason,
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
            total_cache_creation_tokens: self.total_cache_creation_tokens,
            total_cache_read_tokens: self.total_cache_read_tokens,
            steps: self.steps,
            messages: self.messages.clone(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// One model consultation plus its action. Returns true when the parsed
    /// action carries the completion token.
    pub async fn step(&mut self, session: &mut dyn TerminalSession) -> Result<bool, WorkflowError> {
        tracing::info!("*************Step {}*************", self.steps + 1);

        let response = self.consult().await?;
        self.total_input_tokens += response.input_tokens;
        self.total_output_tokens += response.output_tokens;
        self.total_cache_creation_tokens += response.cache_creation_tokens;
        self.total_cache_read_tokens += response.cache_read_tokens;

        tracing::info!("LLM Response: {}...", preview(&response.content));
        self.messages.push(Message::assistant(response.content.as_str()));

        let action = parse_action(&response.content);
        if has_finished(&action) {
            self.steps += 1;
            return Ok(true);
        }

        if action.is_empty() {
            tracing::warn!("Failed to parse bash command from LLM response");
            self.messages.push(Message::user(format!(
                "Parsing error: {}. Bash command must be enclosed in triple backticks bash block.",
                response.content
            )));
        } else {
            tracing::info!("Executing: {}", action);
            let output = self.execute(session, &action).await?;
            tracing::info!("Output: {}...", preview(&output));
            self.messages.push(Message::user(format!("Output: {}", output)));
        }

        self.steps += 1;
        Ok(false)
    }

    async fn consult(&self) -> Result<LlmResponse, WorkflowError> {
        let limit = Duration::from_secs(self.config.llm_timeout_secs);
        tokio::time::timeout(limit, self.client.call(&self.messages, &self.options))
            .await
            .map_err(|_| WorkflowError::Timeout {
                stage: Stage::Transport,
                after: limit,
            })?
            .map_err(WorkflowError::Transport)
    }

    async fn execute(
        &self,
        session: &mut dyn TerminalSession,
        action: &str,
    ) -> Result<String, WorkflowError> {
        let limit = Duration::from_secs(self.config.command_timeout_secs);
        let exec = async {
            session.send(action, ENTER).await?;
            session.read_incremental_output().await
        };
        let output = tokio::time::timeout(limit, exec)
            .await
            .map_err(|_| WorkflowError::Timeout {
                stage: Stage::Session,
                after: limit,
            })?
            .map_err(WorkflowError::Session)?;
        Ok(output.trim().to_string())
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
