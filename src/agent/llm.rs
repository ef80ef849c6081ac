use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::config::TransportConfig;
use crate::types::{
    AnthropicErrorBody, AnthropicMessage, AnthropicRequest, AnthropicResponse, CacheControl,
    ContentBlock, LlmResponse, Message, Role, TextBlock,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Request fields owned by the client; passthrough values never replace them.
const RESERVED_FIELDS: &[&str] = &["model", "max_tokens", "system", "messages", "temperature"];

/// Per-call overrides. `None` falls back to the client's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub enable_caching: Option<bool>,
    pub temperature: Option<f32>,
    /// Provider-specific fields passed through untouched, except the ones the
    /// client sets itself (`model`, `max_tokens`, `system`, `messages`,
    /// `temperature`), which are dropped.
    pub extra: Map<String, Value>,
}

impl CallOptions {
    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.enable_caching = Some(enabled);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Anything that can turn a conversation into a model reply.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    async fn call(&self, messages: &[Message], options: &CallOptions) -> Result<LlmResponse>;
}

pub struct AnthropicClient {
    client: Client,
    config: TransportConfig,
    api_key: String,
}

impl AnthropicClient {
    /// Fails when no API key is configured or present in the environment.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow!("no API key: set ANTHROPIC_API_KEY or transport.api_key"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(AnthropicClient {
            client,
            config,
            api_key,
        })
    }

    pub fn build_request(&self, messages: &[Message], options: &CallOptions) -> AnthropicRequest {
        build_request(
            &self.config.model,
            self.config.max_tokens,
            messages,
            options.enable_caching.unwrap_or(self.config.enable_caching),
            options.temperature.unwrap_or(self.config.temperature),
            options.extra.clone(),
        )
    }
}

/// Splits system turns from the conversation and marks the newest block of
/// each as a cache boundary.
pub fn build_request(
    model: &str,
    max_tokens: u32,
    messages: &[Message],
    enable_caching: bool,
    temperature: f32,
    mut extra: Map<String, Value>,
) -> AnthropicRequest {
    extra.retain(|key, _| {
        let reserved = RESERVED_FIELDS.contains(&key.as_str());
        if reserved {
            tracing::warn!("ignoring passthrough field `{}`: set by the client", key);
        }
        !reserved
    });

    let (system_messages, conversation): (Vec<&Message>, Vec<&Message>) =
        messages.iter().partition(|m| m.role == Role::System);

    let system = if system_messages.is_empty() {
        None
    } else {
        let mut blocks: Vec<TextBlock> = system_messages
            .iter()
            .map(|m| TextBlock::new(m.content.as_str()))
            .collect();
        if enable_caching {
            if let Some(last) = blocks.last_mut() {
                last.cache_control = Some(CacheControl::ephemeral());
            }
        }
        Some(blocks)
    };

    let mut turns: Vec<AnthropicMessage> = conversation
        .iter()
        .map(|m| AnthropicMessage {
            role: m.role.as_str().to_string(),
            content: vec![TextBlock::new(m.content.as_str())],
        })
        .collect();
    if enable_caching {
        if let Some(block) = turns.last_mut().and_then(|t| t.content.last_mut()) {
            block.cache_control = Some(CacheControl::ephemeral());
        }
    }

    AnthropicRequest {
        model: model.to_string(),
        max_tokens,
        system,
        messages: turns,
        temperature,
        extra,
    }
}

/// Turns a raw status and body into a parsed reply or a descriptive error.
pub fn parse_api_response(status: StatusCode, text: &str) -> Result<AnthropicResponse> {
    if !status.is_success() {
        let detail = serde_json::from_str::<AnthropicErrorBody>(text)
            .map(|body| format!("{}: {}", body.error.error_type, body.error.message))
            .unwrap_or_else(|_| text.to_string());
        return Err(anyhow!("Anthropic API error: {} - {}", status, detail));
    }

    serde_json::from_str(text)
        .with_context(|| format!("failed to parse Anthropic response: {}", text))
}

/// Concatenates text segments only; usage counters the provider omits are zero.
pub fn normalize_response(response: AnthropicResponse) -> LlmResponse {
    let content = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<String>();

    LlmResponse {
        content,
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        cache_creation_tokens: response.usage.cache_creation_input_tokens.unwrap_or(0),
        cache_read_tokens: response.usage.cache_read_input_tokens.unwrap_or(0),
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn call(&self, messages: &[Message], options: &CallOptions) -> Result<LlmResponse> {
        let request = self.build_request(messages, options);
        let url = format!("{}/messages", self.config.base_url.trim_end_matches('/'));

        tracing::debug!(
            model = %request.model,
            turns = request.messages.len(),
            "sending messages request"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .context("failed to call Anthropic API")?;

        let status = response.status();
        let text = response.text().await.context("failed to read response body")?;

        let response = normalize_response(parse_api_response(status, &text)?);
        tracing::debug!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cache_creation_tokens = response.cache_creation_tokens,
            cache_read_tokens = response.cache_read_tokens,
            "received reply"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversation() -> Vec<Message> {
        vec![
            Message::system("operate the shell"),
            Message::user("Task:\nlist files"),
            Message::assistant("```bash\nls\n```"),
            Message::user("Output: a b"),
        ]
    }

    fn request(messages: &[Message], caching: bool) -> AnthropicRequest {
        build_request("claude-test", 1024, messages, caching, 1.0, Map::new())
    }

    fn client() -> AnthropicClient {
        AnthropicClient::new(TransportConfig {
            api_key: Some("sk-test".into()),
            ..TransportConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_cache_hint_on_last_blocks_only() {
        let req = request(&conversation(), true);

        let system = req.system.as_ref().unwrap();
        assert_eq!(system.iter().filter(|b| b.is_cached()).count(), 1);
        assert!(system.last().unwrap().is_cached());

        let cached: Vec<_> = req
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|b| b.is_cached())
            .collect();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].text, "Output: a b");
    }

    #[test]
    fn test_only_last_of_several_system_blocks_is_cached() {
        let mut messages = conversation();
        messages.insert(1, Message::system("second preamble"));
        let req = request(&messages, true);

        let system = req.system.unwrap();
        assert_eq!(system.len(), 2);
        assert!(!system[0].is_cached());
        assert!(system[1].is_cached());
        assert_eq!(system[1].text, "second preamble");
        assert_eq!(req.messages.len(), 3);
    }

    #[test]
    fn test_caching_disabled_marks_nothing() {
        let req = request(&conversation(), false);
        assert!(req.system.unwrap().iter().all(|b| !b.is_cached()));
        assert!(req
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .all(|b| !b.is_cached()));
    }

    #[test]
    fn test_no_system_messages_omits_system_field() {
        let req = request(&[Message::user("hi")], true);
        assert!(req.system.is_none());

        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("system").is_none());
        assert_eq!(
            body["messages"][0]["content"][0]["cache_control"],
            json!({"type": "ephemeral"})
        );
    }

    #[test]
    fn test_wire_shape() {
        let extra = json!({"top_k": 5}).as_object().cloned().unwrap();
        let req = build_request("claude-test", 2048, &conversation(), true, 0.5, extra);
        let body = serde_json::to_value(&req).unwrap();

        assert_eq!(body["model"], "claude-test");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["top_k"], 5);
        assert_eq!(
            body["system"],
            json!([{"type": "text", "text": "operate the shell", "cache_control": {"type": "ephemeral"}}])
        );
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(
            body["messages"][1]["content"],
            json!([{"type": "text", "text": "```bash\nls\n```"}])
        );
    }

    #[test]
    fn test_passthrough_cannot_replace_client_fields() {
        let mut extra = Map::new();
        extra.insert("model".into(), json!("other-model"));
        extra.insert("max_tokens".into(), json!(1));
        extra.insert("top_k".into(), json!(5));

        let request = build_request("m", 64, &[Message::user("hi")], false, 1.0, extra);
        let text = serde_json::to_string(&request).unwrap();
        let wire: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(wire["model"], "m");
        assert_eq!(wire["max_tokens"], 64);
        assert_eq!(wire["top_k"], 5);
        assert_eq!(text.matches("\"model\"").count(), 1);
        assert_eq!(text.matches("\"max_tokens\"").count(), 1);
    }

    #[test]
    fn test_error_status_with_structured_body() {
        let body = r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let err = parse_api_response(StatusCode::TOO_MANY_REQUESTS, body).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("429"));
        assert!(message.contains("rate_limit_error: slow down"));
    }

    #[test]
    fn test_error_status_with_plain_body() {
        let err = parse_api_response(StatusCode::BAD_GATEWAY, "bad gateway").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("502"));
        assert!(message.ends_with("bad gateway"));
    }

    #[test]
    fn test_success_status_with_malformed_body() {
        let err = parse_api_response(StatusCode::OK, "{\"content\": [").unwrap_err();
        assert!(format!("{:#}", err).contains("failed to parse Anthropic response"));

        let ok = parse_api_response(
            StatusCode::OK,
            r#"{"content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":3,"output_tokens":1}}"#,
        )
        .unwrap();
        assert_eq!(normalize_response(ok).content, "hi");
    }

    #[test]
    fn test_client_defaults_and_overrides() {
        let client = client();

        let req = client.build_request(&conversation(), &CallOptions::default());
        assert_eq!(req.temperature, 1.0);
        assert_eq!(req.max_tokens, 65_536);
        assert!(req.system.unwrap()[0].is_cached());

        let options = CallOptions::default()
            .with_caching(false)
            .with_temperature(0.2)
            .with_extra("stop_sequences", json!(["STOP"]));
        let req = client.build_request(&conversation(), &options);
        assert_eq!(req.temperature, 0.2);
        assert!(!req.system.unwrap()[0].is_cached());
        assert_eq!(req.extra["stop_sequences"], json!(["STOP"]));
    }

    #[test]
    fn test_missing_api_key_fails_at_construction() {
        let config = TransportConfig {
            api_key: Some("   ".into()),
            ..TransportConfig::default()
        };
        if std::env::var("ANTHROPIC_API_KEY").map_or(true, |k| k.trim().is_empty()) {
            assert!(AnthropicClient::new(config).is_err());
        }
    }

    #[test]
    fn test_normalize_ignores_non_text_blocks() {
        let raw = json!({
            "id": "msg_1",
            "model": "claude-test",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "x"},
                {"type": "text", "text": "Plan first. "},
                {"type": "tool_use", "id": "t1", "name": "bash", "input": {}},
                {"type": "text", "text": "```bash\nls\n```"}
            ],
            "usage": {
                "input_tokens": 12,
                "output_tokens": 7,
                "cache_creation_input_tokens": 300,
                "cache_read_input_tokens": 40
            }
        });
        let response = normalize_response(serde_json::from_value(raw).unwrap());

        assert_eq!(response.content, "Plan first. ```bash\nls\n```");
        assert_eq!(response.input_tokens, 12);
        assert_eq!(response.output_tokens, 7);
        assert_eq!(response.cache_creation_tokens, 300);
        assert_eq!(response.cache_read_tokens, 40);
    }

    #[test]
    fn test_missing_or_null_cache_counters_default_to_zero() {
        let raw = json!({
            "content": [{"type": "text", "text": "ok"}],
            "usage": {"input_tokens": 3, "output_tokens": 1, "cache_read_input_tokens": null}
        });
        let response = normalize_response(serde_json::from_value(raw).unwrap());
        assert_eq!(response.cache_creation_tokens, 0);
        assert_eq!(response.cache_read_tokens, 0);
        assert_eq!(response.total_input_tokens(), 3);
    }

    #[test]
    fn test_request_text_survives_single_block_reply() {
        let messages = conversation();
        let req = request(&messages, true);
        let last = &req.messages.last().unwrap().content[0].text;

        let raw = json!({
            "content": [{"type": "text", "text": last}],
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let response = normalize_response(serde_json::from_value(raw).unwrap());
        assert_eq!(&response.content, &messages.last().unwrap().content);
    }
}
