// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

use super::ConfigError;

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    /// "openai" | "mock" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL of an OpenAI-compatible API; `/chat/completions` is appended.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            endpoint: default_endpoint(),
            api_key: default_api_key(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl AiSettings {
    /// Apply env overrides and resolve the "ENV" key placeholder.
    pub(crate) fn resolve_env(&mut self) -> Result<(), ConfigError> {
        self.provider = self.provider.trim().to_lowercase();
        if env::var("AI_TEST_MODE").is_ok_and(|v| v == "mock") {
            self.provider = "mock".to_string();
        }
        if let Ok(m) = env::var("OPENAI_MODEL") {
            self.model = m;
        }
        if let Ok(e) = env::var("OPENAI_ENDPOINT") {
            self.endpoint = e;
        }

        if !matches!(self.provider.as_str(), "openai" | "mock") {
            return Err(ConfigError::Invalid {
                key: "ai.provider",
                reason: format!("unsupported provider '{}'", self.provider),
            });
        }
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = if self.is_mock() {
                String::new()
            } else {
                env::var("OPENAI_API_KEY").unwrap_or_default()
            };
        }

        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_timeout_secs();
        }
        Ok(())
    }

    pub fn is_mock(&self) -> bool {
        self.provider == "mock"
    }
}
