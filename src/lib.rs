pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod harness;
pub mod logging;
pub mod types;

pub use agent::{AgenticWorkflow, AnthropicClient, LlmClient, ShellSession, TerminalSession};
pub use cli::run_cli;
pub use config::{Config, LogConfig, TransportConfig, WorkflowConfig};
pub use error::WorkflowError;
pub use harness::{AgentResult, FailureMode, TaskAgent};
pub use types::{LlmResponse, Message, Role};
