mod anthropic;
mod message;

pub use anthropic::{
    AnthropicErrorBody, AnthropicMessage, AnthropicRequest, AnthropicResponse, AnthropicUsage,
    CacheControl, ContentBlock, TextBlock,
};
pub use message::{LlmResponse, Message, Role};
