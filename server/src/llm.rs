use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::LlmConfig,
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatTurn,
}

/// Models that emit a channel preamble put the user-facing text after this tag.
const MESSAGE_TAG: &str = "<|message|>";

pub fn extract_message(raw: &str) -> String {
    match raw.rfind(MESSAGE_TAG) {
        Some(index) => raw[index + MESSAGE_TAG.len()..].trim().to_string(),
        None => raw.trim().to_string(),
    }
}

/// One OpenAI-compatible chat completion, bounded by `config.timeout`.
/// Returns the cleaned assistant text, which may be empty.
pub async fn complete(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: &[ChatTurn],
    max_tokens: usize,
    temperature: f32,
) -> Result<String> {
    let response = client
        .post(format!("{}/chat/completions", config.base_url))
        .bearer_auth(&config.api_key)
        .timeout(config.timeout)
        .json(&json!({
            "model": config.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Upstream(format!("completion returned {status}: {body}")));
    }

    let payload = response.json::<CompletionResponse>().await?;
    let raw = payload
        .choices
        .first()
        .map(|choice| choice.message.content.as_str())
        .unwrap_or_default();
    Ok(extract_message(raw))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn message_tag_is_stripped() {
        assert_eq!(extract_message("analysis...<|message|> 您好 "), "您好");
        assert_eq!(extract_message("  plain  "), "plain");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: "sk-noauth".to_string(),
            model: "test".to_string(),
            timeout: Duration::from_millis(500),
        };
        let result = complete(
            &reqwest::Client::new(),
            &config,
            &[ChatTurn::user("bonjour")],
            64,
            0.0,
        )
        .await;
        assert!(result.is_err());
    }
}
