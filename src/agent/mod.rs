pub mod action;
pub mod core;
pub mod llm;
pub mod session;

pub use action::{has_finished, parse_action, COMPLETION_TOKEN};
pub use core::{AgenticWorkflow, HaltReason, WorkflowOutput, WorkflowState};
pub use llm::{AnthropicClient, CallOptions, LlmClient};
pub use session::{ShellSession, TerminalSession};
