use std::time::Duration;

/// Failures that end a workflow run. Parse failures never get here; they are
/// fed back to the model as the next user turn.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("transport call failed: {0:#}")]
    Transport(anyhow::Error),

    #[error("session command failed: {0:#}")]
    Session(anyhow::Error),

    #[error("{stage} timed out after {}s", .after.as_secs())]
    Timeout { stage: Stage, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transport,
    Session,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Transport => write!(f, "transport call"),
            Stage::Session => write!(f, "session command"),
        }
    }
}
