//! Wire types for the Ollama chat API.

use serde::{Deserialize, Serialize};

use crate::config::PerformanceConfig;
use crate::store::Role;

/// Role of a prompt message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System prompt.
    System,
    /// User input.
    User,
    /// Assistant output.
    Assistant,
}

impl From<Role> for ChatRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// One prompt message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author.
    pub role: ChatRole,
    /// Text.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatOptions {
    temperature: f64,
    num_ctx: u32,
    num_batch: u32,
    num_predict: i32,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
    keep_alive: &'a str,
}

impl<'a> ChatRequestBody<'a> {
    pub(crate) fn new(
        model: &'a str,
        messages: &'a [ChatMessage],
        temperature: f64,
        stream: bool,
        performance: &'a PerformanceConfig,
    ) -> Self {
        Self {
            model,
            messages,
            stream,
            options: ChatOptions {
                temperature,
                num_ctx: performance.num_ctx,
                num_batch: performance.num_batch,
                num_predict: performance.num_predict,
            },
            keep_alive: performance.keep_alive.as_str(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PreloadBody<'a> {
    pub(crate) model: &'a str,
    pub(crate) messages: [ChatMessage; 0],
    pub(crate) keep_alive: &'a str,
}

/// One line of a chat response (streamed or not).
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChatResponseLine {
    #[serde(default)]
    pub(crate) message: Option<ResponseMessage>,
    #[serde(default)]
    pub(crate) done: bool,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseMessage {
    #[serde(default)]
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub(crate) models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagEntry {
    pub(crate) name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let perf = PerformanceConfig::default();
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let body = ChatRequestBody::new("qwen2.5:7b", &messages, 0.3, true, &perf);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["model"], "qwen2.5:7b");
        assert_eq!(json["stream"], true);
        assert_eq!(json["keep_alive"], "30m");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["options"]["num_ctx"], 4096);
        assert_eq!(json["options"]["num_predict"], -1);
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-9);
    }
}
