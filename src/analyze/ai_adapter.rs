//! AI adapter: the three digest stages over a chat-completion provider, plus a
//! deterministic mock for tests and offline runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ai::AiSettings;
use crate::digest::model::{DigestOverview, Importance, PostSummary};
use crate::digest::prompts::StagePrompt;

/// Title used when the digest-summary answer has no separate title line.
pub const DEFAULT_DIGEST_TITLE: &str = "Daily Digest";

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("AI client is not configured: {0}")]
    Config(String),
    #[error("AI request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("AI API returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("AI returned an empty answer")]
    EmptyResponse,
    #[error("AI returned an invalid importance: '{0}'")]
    InvalidImportance(String),
}

/// The AI collaborator used by the digest pipeline.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn summarize(&self, content: &str, prompt: &StagePrompt) -> Result<String, AiError>;

    async fn score_importance(
        &self,
        content: &str,
        prompt: &StagePrompt,
    ) -> Result<Importance, AiError>;

    async fn summarize_digest(
        &self,
        posts: &[PostSummary],
        prompt: &StagePrompt,
    ) -> Result<DigestOverview, AiError>;

    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynAiClient = Arc<dyn AiClient>;

/// Factory: build a client according to settings.
///
/// * `provider = "mock"` (also forced by `AI_TEST_MODE=mock`) returns [`MockAiClient`].
/// * Otherwise an OpenAI-compatible chat client. A missing key is reported per call.
pub fn build_ai_client(settings: &AiSettings) -> Result<DynAiClient, AiError> {
    if settings.is_mock() {
        return Ok(Arc::new(MockAiClient));
    }
    let provider = OpenAiProvider::new(settings)?;
    Ok(Arc::new(PromptedClient::new(provider)))
}

// ------------------------------------------------------------
// Provider abstraction + concrete providers
// ------------------------------------------------------------

/// Low-level provider: one system + user message in, answer text out.
#[async_trait]
pub trait ChatProvider: Send + Sync + 'static {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AiError>;
    fn name(&self) -> &'static str;
}

/// OpenAI-compatible Chat Completions provider.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAiProvider {
    pub fn new(settings: &AiSettings) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("feed-digest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            url: format!("{}/chat/completions", settings.endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AiError> {
        if self.api_key.is_empty() {
            return Err(AiError::Config("OPENAI_API_KEY is not set".into()));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system,
                },
                Msg {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.2,
        };

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), provider = "openai", "AI API error");
            return Err(AiError::Api {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        let body: Resp = resp.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(AiError::EmptyResponse);
        }
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Runs the digest stages on top of any [`ChatProvider`]: renders the user template,
/// then parses the answer for the stage.
pub struct PromptedClient<P: ChatProvider> {
    inner: P,
}

impl<P: ChatProvider> PromptedClient<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P: ChatProvider> AiClient for PromptedClient<P> {
    async fn summarize(&self, content: &str, prompt: &StagePrompt) -> Result<String, AiError> {
        let answer = self
            .inner
            .complete(&prompt.system, &prompt.user_message(content))
            .await?;
        Ok(answer.trim().to_string())
    }

    async fn score_importance(
        &self,
        content: &str,
        prompt: &StagePrompt,
    ) -> Result<Importance, AiError> {
        let answer = self
            .inner
            .complete(&prompt.system, &prompt.user_message(content))
            .await?;
        parse_importance(&answer)
    }

    async fn summarize_digest(
        &self,
        posts: &[PostSummary],
        prompt: &StagePrompt,
    ) -> Result<DigestOverview, AiError> {
        let joined = join_summaries(posts);
        let answer = self
            .inner
            .complete(&prompt.system, &prompt.user_message(&joined))
            .await?;
        parse_overview(&answer)
    }

    fn provider_name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Deterministic client: no network, answers derived from the input only.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockAiClient;

#[async_trait]
impl AiClient for MockAiClient {
    async fn summarize(&self, content: &str, _prompt: &StagePrompt) -> Result<String, AiError> {
        let first = content
            .split_terminator(['.', '\n'])
            .map(str::trim)
            .find(|s| !s.is_empty())
            .ok_or(AiError::EmptyResponse)?;
        Ok(sanitize_line(first, 160))
    }

    async fn score_importance(
        &self,
        content: &str,
        _prompt: &StagePrompt,
    ) -> Result<Importance, AiError> {
        let n = content.chars().count() % 10 + 1;
        Importance::new(n as i64).map_err(|e| AiError::InvalidImportance(e.0.to_string()))
    }

    async fn summarize_digest(
        &self,
        posts: &[PostSummary],
        _prompt: &StagePrompt,
    ) -> Result<DigestOverview, AiError> {
        Ok(DigestOverview {
            title: format!("{DEFAULT_DIGEST_TITLE} ({} posts)", posts.len()),
            overview: sanitize_line(&join_summaries(posts), 600),
        })
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Answer parsing
// ------------------------------------------------------------

/// Content of the digest-summary prompt: one summary per paragraph, in digest order.
pub fn join_summaries(posts: &[PostSummary]) -> String {
    posts
        .iter()
        .map(|p| p.summary.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+").expect("integer regex"));

/// The first integer in the answer, which must lie in `[1, 10]`.
pub fn parse_importance(answer: &str) -> Result<Importance, AiError> {
    let invalid = || AiError::InvalidImportance(answer.trim().chars().take(80).collect());
    let m = INT_RE.find(answer).ok_or_else(invalid)?;
    let value: i64 = m.as_str().parse().map_err(|_| invalid())?;
    Importance::new(value).map_err(|_| invalid())
}

static TITLE_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(#+\s*)?(title\s*:\s*)?").expect("title regex"));

/// First non-empty line is the title, the rest the overview. A single-line answer
/// becomes the overview under [`DEFAULT_DIGEST_TITLE`].
pub fn parse_overview(answer: &str) -> Result<DigestOverview, AiError> {
    let mut lines = answer.lines().map(str::trim).skip_while(|l| l.is_empty());
    let first = lines.next().ok_or(AiError::EmptyResponse)?;
    let rest: String = lines.collect::<Vec<_>>().join("\n").trim().to_string();

    if rest.is_empty() {
        return Ok(DigestOverview {
            title: DEFAULT_DIGEST_TITLE.to_string(),
            overview: first.to_string(),
        });
    }

    let title = TITLE_PREFIX_RE.replace(first, "");
    let title = title.trim().trim_matches(|c| c == '*' || c == '"').trim();
    Ok(DigestOverview {
        title: if title.is_empty() {
            DEFAULT_DIGEST_TITLE.to_string()
        } else {
            sanitize_line(title, 160)
        },
        overview: rest,
    })
}

/// Single line, collapsed whitespace, at most `max` chars.
pub fn sanitize_line(input: &str, max: usize) -> String {
    let mut out = String::with_capacity(max.min(input.len()));
    let mut count = 0usize;
    let mut prev_space = false;
    for ch in input.chars() {
        let c = if ch.is_whitespace() { ' ' } else { ch };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
                count += 1;
            }
            prev_space = true;
        } else {
            out.push(c);
            count += 1;
            prev_space = false;
        }
        if count >= max {
            break;
        }
    }
    out.trim().to_string()
}
