use std::{env, time::Duration};

use serde::Serialize;

use crate::types::LanguagePair;

const DEFAULT_LIBRE_ENDPOINTS: [&str; 3] = [
    "https://libretranslate.de/translate",
    "https://translate.astian.org/translate",
    "https://libretranslate.com/translate",
];

pub const MIN_TYPING_WINDOW_MS: u64 = 400;
pub const MAX_TYPING_WINDOW_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub public_base_url: String,
    pub customer_lang: String,
    pub agent_lang: String,
    pub translation_enabled: bool,
    pub translation_timeout: Duration,
    pub libre_endpoints: Vec<String>,
    pub max_message_length: usize,
    pub typing_window: Duration,
    pub llm: Option<LlmConfig>,
    pub bot_name: String,
    pub bot_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

/// Subset of the configuration that browsers may read.
#[derive(Debug, Clone, Serialize)]
pub struct PublicConfig {
    #[serde(rename = "API_BASE_URL")]
    pub api_base_url: String,
    #[serde(rename = "DEFAULT_CLIENT_LANG")]
    pub default_client_lang: String,
    #[serde(rename = "AGENT_LANG")]
    pub agent_lang: String,
    #[serde(rename = "TRANSLATION_ENABLED")]
    pub translation_enabled: bool,
    #[serde(rename = "MAX_MESSAGE_LENGTH")]
    pub max_message_length: usize,
    #[serde(rename = "TYPING_THROTTLE_MS")]
    pub typing_throttle_ms: u64,
}

fn env_text(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_text(key) {
        Some(value) => !value.eq_ignore_ascii_case("false") && value != "0",
        None => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_text(key)
        .and_then(|v| v.parse::<f64>().ok())
        .and_then(parse_secs)
        .unwrap_or(default)
}

fn parse_secs(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

fn normalize_lang(value: &str) -> String {
    value.trim().to_ascii_lowercase().chars().take(2).collect()
}

/// Splits a comma separated endpoint list, dropping blanks.
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn clamp_typing_window(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(MIN_TYPING_WINDOW_MS, MAX_TYPING_WINDOW_MS))
}

impl Config {
    pub fn from_env() -> Self {
        let port = env_text("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        let public_base_url = env_text("API_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let libre_endpoints = env_text("LIBRE_ENDPOINTS")
            .map(|raw| parse_endpoints(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_LIBRE_ENDPOINTS
                    .iter()
                    .map(|url| url.to_string())
                    .collect()
            });

        let translation_timeout = env_secs("TRANSLATION_TIMEOUT_SEC", Duration::from_secs(5));

        let typing_window = clamp_typing_window(
            env_text("TYPING_THROTTLE_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(MIN_TYPING_WINDOW_MS),
        );

        let llm = env_text("LLM_BASE_URL").map(|base_url| LlmConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: env_text("LLM_API_KEY").unwrap_or_else(|| "sk-noauth".to_string()),
            model: env_text("LLM_MODEL").unwrap_or_else(|| "qwen2.5-3b-instruct".to_string()),
            timeout: env_secs("LLM_TIMEOUT_SEC", Duration::from_secs(15)),
        });

        Self {
            port,
            public_base_url,
            customer_lang: normalize_lang(
                &env_text("DEFAULT_CLIENT_LANG").unwrap_or_else(|| "fr".to_string()),
            ),
            agent_lang: normalize_lang(&env_text("AGENT_LANG").unwrap_or_else(|| "zh".to_string())),
            translation_enabled: env_flag("TRANSLATION_ENABLED", true),
            translation_timeout,
            libre_endpoints,
            max_message_length: env_text("MAX_MESSAGE_LENGTH")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|len| *len > 0)
                .unwrap_or(500),
            typing_window,
            llm,
            bot_name: env_text("BOT_NAME").unwrap_or_else(|| "Leo".to_string()),
            bot_timeout: env_secs("BOT_TIMEOUT_SEC", Duration::from_secs(20)),
        }
    }

    pub fn languages(&self) -> LanguagePair {
        LanguagePair {
            customer: self.customer_lang.clone(),
            agent: self.agent_lang.clone(),
        }
    }

    pub fn public(&self) -> PublicConfig {
        PublicConfig {
            api_base_url: self.public_base_url.clone(),
            default_client_lang: self.customer_lang.clone(),
            agent_lang: self.agent_lang.clone(),
            translation_enabled: self.translation_enabled,
            max_message_length: self.max_message_length,
            typing_throttle_ms: self.typing_window.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_list_drops_blank_entries() {
        let parsed = parse_endpoints(" https://a/translate, ,https://b/translate ,");
        assert_eq!(parsed, vec!["https://a/translate", "https://b/translate"]);
    }

    #[test]
    fn typing_window_is_clamped() {
        assert_eq!(clamp_typing_window(100), Duration::from_millis(400));
        assert_eq!(clamp_typing_window(450), Duration::from_millis(450));
        assert_eq!(clamp_typing_window(2_000), Duration::from_millis(500));
    }

    #[test]
    fn timeouts_must_be_positive_and_finite() {
        assert_eq!(parse_secs(2.5), Some(Duration::from_millis(2_500)));
        assert_eq!(parse_secs(0.0), None);
        assert_eq!(parse_secs(-1.0), None);
        assert_eq!(parse_secs(f64::NAN), None);
    }

    #[test]
    fn language_codes_keep_two_letters() {
        assert_eq!(normalize_lang(" FR-ca "), "fr");
        assert_eq!(normalize_lang("zh"), "zh");
    }
}
