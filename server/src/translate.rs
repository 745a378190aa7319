use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::LlmConfig,
    error::{Error, Result},
    llm::{self, ChatTurn},
    prompting::translation_prompts,
};

/// Source language value that lets the service detect the language itself.
pub const AUTO_DETECT: &str = "auto";

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String>;
}

fn lang_code(value: &str) -> String {
    value.trim().to_ascii_lowercase().chars().take(2).collect()
}

/// `None` for an unknown source, which the service detects itself.
fn source_code(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case(AUTO_DETECT) {
        None
    } else {
        Some(lang_code(value))
    }
}

fn contains_cjk(text: &str) -> bool {
    text.chars().any(|ch| ('\u{4E00}'..='\u{9FFF}').contains(&ch))
}

/// True when no call is needed because the text is already in the target language.
pub fn already_in_target(text: &str, source: &str, target: &str) -> bool {
    let target = lang_code(target);
    if target == "zh" && contains_cjk(text) {
        return true;
    }
    source_code(source).is_some_and(|source| source == target)
}

/// Translation that never fails: errors degrade to the untouched text.
pub async fn translate_or_original(
    translator: &dyn Translator,
    text: &str,
    source: &str,
    target: &str,
) -> Option<String> {
    match translator.translate(text, source, target).await {
        Ok(out) if !out.trim().is_empty() => Some(out.trim().to_string()),
        Ok(_) => None,
        Err(err) => {
            warn!(source, target, error = %err, "translation failed, keeping original text");
            None
        }
    }
}

/// Returns the input unchanged; used when translation is switched off.
#[derive(Debug, Default, Clone)]
pub struct Passthrough;

#[async_trait]
impl Translator for Passthrough {
    async fn translate(&self, text: &str, _source: &str, _target: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

#[derive(Debug, Serialize)]
struct LibreRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibreResponse {
    #[serde(default)]
    translated_text: String,
}

/// LibreTranslate client trying each endpoint in order until one answers.
#[derive(Debug, Clone)]
pub struct LibreTranslate {
    client: reqwest::Client,
    endpoints: Vec<String>,
    timeout: Duration,
}

impl LibreTranslate {
    pub fn new(client: reqwest::Client, endpoints: Vec<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoints,
            timeout,
        }
    }

    async fn post_endpoint(&self, url: &str, body: &LibreRequest<'_>) -> Result<String> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;

        // Some deployments only accept form bodies.
        let response = if matches!(response.status().as_u16(), 400 | 415 | 422) {
            debug!(url, status = %response.status(), "retrying translation as form body");
            self.client
                .post(url)
                .timeout(self.timeout)
                .form(body)
                .send()
                .await?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(Error::translation(format!("{url} returned {}", response.status())));
        }

        let payload = response.json::<LibreResponse>().await?;
        let out = payload.translated_text.trim().to_string();
        if out.is_empty() {
            return Err(Error::translation(format!("{url} returned empty text")));
        }
        Ok(out)
    }
}

#[async_trait]
impl Translator for LibreTranslate {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() || already_in_target(text, source, target) {
            return Ok(text.to_string());
        }

        let source = source_code(source).unwrap_or_else(|| AUTO_DETECT.to_string());
        let target = lang_code(target);
        let body = LibreRequest {
            q: text,
            source: &source,
            target: &target,
            format: "text",
        };

        for url in &self.endpoints {
            match self.post_endpoint(url, &body).await {
                Ok(out) => return Ok(out),
                Err(err) => warn!(url = %url, error = %err, "translation endpoint failed"),
            }
        }

        Err(Error::translation(format!(
            "all {} endpoints failed",
            self.endpoints.len()
        )))
    }
}

/// Chat-model translation, used when the dedicated services cannot help.
pub struct LlmTranslate {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmTranslate {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Translator for LlmTranslate {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() || already_in_target(text, source, target) {
            return Ok(text.to_string());
        }

        let (system, user) = translation_prompts(&lang_code(target), text);
        let max_tokens = (text.chars().count() * 3).clamp(128, 2048);
        let out = llm::complete(
            &self.client,
            &self.config,
            &[ChatTurn::system(system), ChatTurn::user(user)],
            max_tokens,
            0.0,
        )
        .await
        .map_err(|err| Error::translation(err.to_string()))?;
        if out.is_empty() {
            return Err(Error::translation("model returned empty text"));
        }
        Ok(out)
    }
}

/// Tries each translator in order. An answer identical to the input only
/// counts when the text is already in the target language.
pub struct TranslatorChain {
    tiers: Vec<Arc<dyn Translator>>,
}

impl TranslatorChain {
    pub fn new(tiers: Vec<Arc<dyn Translator>>) -> Self {
        Self { tiers }
    }
}

fn is_usable(text: &str, out: &str, source: &str, target: &str) -> bool {
    let out = out.trim();
    !out.is_empty() && (out != text.trim() || already_in_target(text, source, target))
}

#[async_trait]
impl Translator for TranslatorChain {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.translate(text, source, target).await {
                Ok(out) if is_usable(text, &out, source, target) => {
                    return Ok(out.trim().to_string());
                }
                Ok(_) => debug!(tier = index, target, "translator returned the text unchanged"),
                Err(err) => debug!(tier = index, target, error = %err, "translator failed"),
            }
        }
        Err(Error::translation("no translator produced a result"))
    }
}
