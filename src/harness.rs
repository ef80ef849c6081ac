//! Boundary adapter for benchmark harnesses: one task in, token usage and a
//! failure classification out.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::instrument::WithSubscriber;

use crate::agent::{
    AgenticWorkflow, AnthropicClient, CallOptions, HaltReason, LlmClient, TerminalSession,
};
use crate::config::Config;
use crate::error::{Stage, WorkflowError};
use crate::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    None,
    Timeout,
    StepLimitExceeded,
    TransportError,
    SessionError,
    ConfigurationError,
}

impl From<&WorkflowError> for FailureMode {
    fn from(err: &WorkflowError) -> Self {
        match err {
            WorkflowError::Transport(_) => FailureMode::TransportError,
            WorkflowError::Session(_) => FailureMode::SessionError,
            WorkflowError::Timeout { .. } => FailureMode::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub steps: usize,
    pub failure_mode: FailureMode,
}

impl AgentResult {
    fn failed(failure_mode: FailureMode) -> Self {
        AgentResult {
            total_input_tokens: 0,
            total_output_tokens: 0,
            steps: 0,
            failure_mode,
        }
    }
}

pub struct TaskAgent {
    config: Config,
    client: Option<Arc<dyn LlmClient>>,
}

impl TaskAgent {
    pub fn new(config: Config) -> Self {
        TaskAgent {
            config,
            client: None,
        }
    }

    /// Use this client instead of building one from the transport config.
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn name() -> &'static str {
        "pca-agent"
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Blocking entry point. Writes `run.log` and `trajectory.json` into
    /// `logging_dir` when one is given.
    pub fn perform_task(
        &self,
        instruction: &str,
        session: &mut dyn TerminalSession,
        logging_dir: Option<&Path>,
    ) -> AgentResult {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("failed to build tokio runtime: {}", e);
                return AgentResult::failed(FailureMode::ConfigurationError);
            }
        };
        runtime.block_on(self.perform_task_async(instruction, session, logging_dir))
    }

    pub async fn perform_task_async(
        &self,
        instruction: &str,
        session: &mut dyn TerminalSession,
        logging_dir: Option<&Path>,
    ) -> AgentResult {
        let log_file = logging_dir.map(|dir| dir.join("run.log"));
        let subscriber = match logging::build_subscriber(&self.config.log.level, log_file.as_deref())
        {
            Ok(subscriber) => subscriber,
            Err(e) => {
                eprintln!("failed to set up logging: {:#}", e);
                return AgentResult::failed(FailureMode::ConfigurationError);
            }
        };

        self.execute(instruction, session, logging_dir)
            .with_subscriber(subscriber)
            .await
    }

    fn client(&self) -> anyhow::Result<Arc<dyn LlmClient>> {
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => Ok(Arc::new(AnthropicClient::new(self.config.transport.clone())?)),
        }
    }

    async fn execute(
        &self,
        instruction: &str,
        session: &mut dyn TerminalSession,
        logging_dir: Option<&Path>,
    ) -> AgentResult {
        tracing::info!("Starting task:\n{}", instruction);

        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("Configuration error: {:#}", e);
                return AgentResult::failed(FailureMode::ConfigurationError);
            }
        };
        let transport = &self.config.transport;
        let options = CallOptions {
            enable_caching: Some(transport.enable_caching),
            temperature: Some(transport.temperature),
            extra: transport.extra.clone(),
        };
        let mut workflow =
            AgenticWorkflow::new(client, self.config.workflow.clone()).with_call_options(options);

        if let Err(e) = session.start().await {
            tracing::error!("Failed to start session: {:#}", e);
            return AgentResult::failed(FailureMode::SessionError);
        }
        let outcome = workflow.run(instruction, session).await;
        if let Err(e) = session.stop().await {
            tracing::warn!("Failed to stop session: {:#}", e);
        }

        match outcome {
            Ok(output) => {
                tracing::info!("Task completed in {} steps", output.steps);
                tracing::info!(
                    "Token usage - Input: {}, Output: {}",
                    output.total_input_tokens,
                    output.total_output_tokens
                );
                tracing::info!("Workflow output:\n{}", output);
                if let Some(dir) = logging_dir {
                    if let Err(e) = output.write_json(&dir.join("trajectory.json")) {
                        tracing::warn!("Failed to save trajectory: {:#}", e);
                    }
                }

                AgentResult {
                    total_input_tokens: output.total_input_tokens,
                    total_output_tokens: output.total_output_tokens,
                    steps: output.steps,
                    failure_mode: match output.status {
                        HaltReason::Completed => FailureMode::None,
                        HaltReason::Exhausted => FailureMode::StepLimitExceeded,
                    },
                }
            }
            Err(e) => {
                let stage = match &e {
                    WorkflowError::Timeout { stage, .. } => *stage,
                    WorkflowError::Transport(_) => Stage::Transport,
                    WorkflowError::Session(_) => Stage::Session,
                };
                tracing::error!(%stage, steps = workflow.steps(), "Task failed: {}", e);

                AgentResult {
                    total_input_tokens: workflow.total_input_tokens(),
                    total_output_tokens: workflow.total_output_tokens(),
                    steps: workflow.steps(),
                    failure_mode: FailureMode::from(&e),
                }
            }
        }
    }
}
