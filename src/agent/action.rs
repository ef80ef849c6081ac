use once_cell::sync::Lazy;
use regex::Regex;

/// Token the model emits inside a bash block to end the task.
pub const COMPLETION_TOKEN: &str = "COMPLETE_TASK";

static BASH_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```bash\n(.*?)\n```").expect("bash block pattern is valid"));

/// Extracts the command from the first ```bash fenced block, trimmed.
/// Returns an empty string when the reply has no such block.
pub fn parse_action(reply: &str) -> String {
    BASH_BLOCK
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

pub fn has_finished(action: &str) -> bool {
    action.contains(COMPLETION_TOKEN)
}
