// src/digest/prompts.rs
//! Prompt templates for the three AI stages (post summary, post importance,
//! digest summary) plus per-request overrides that fall back to configured defaults.

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder replaced by the post content (or the joined summaries) at render time.
pub const CONTENT_PLACEHOLDER: &str = "{Content}";

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{content\}").expect("placeholder regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("prompt template cannot be blank")]
    Blank,
    #[error("prompt template must contain the {{Content}} placeholder, but was '{0}'")]
    MissingPlaceholder(String),
    #[error("prompt template must contain exactly one {{Content}} placeholder, but was '{0}'")]
    MultiplePlaceholders(String),
}

/// User prompt text with exactly one `{Content}` placeholder (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PromptTemplate(String);

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Result<Self, PromptError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(PromptError::Blank);
        }
        match PLACEHOLDER_RE.find_iter(&text).count() {
            0 => Err(PromptError::MissingPlaceholder(text)),
            1 => Ok(Self(text)),
            _ => Err(PromptError::MultiplePlaceholders(text)),
        }
    }

    pub fn text(&self) -> &str {
        &self.0
    }

    /// Substitute `content` for the placeholder. `$` in content is taken literally.
    pub fn render(&self, content: &str) -> String {
        PLACEHOLDER_RE
            .replace(&self.0, NoExpand(content))
            .into_owned()
    }
}

impl TryFrom<String> for PromptTemplate {
    type Error = PromptError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PromptTemplate> for String {
    fn from(value: PromptTemplate) -> Self {
        value.0
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    PostSummary,
    PostImportance,
    DigestSummary,
}

/// System prompt + user template for one AI stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePrompt {
    pub system: String,
    pub user: PromptTemplate,
}

impl StagePrompt {
    pub fn user_message(&self, content: &str) -> String {
        self.user.render(content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSet {
    pub post_summary: StagePrompt,
    pub post_importance: StagePrompt,
    pub digest_summary: StagePrompt,
}

impl PromptSet {
    pub fn stage(&self, kind: PromptKind) -> &StagePrompt {
        match kind {
            PromptKind::PostSummary => &self.post_summary,
            PromptKind::PostImportance => &self.post_importance,
            PromptKind::DigestSummary => &self.digest_summary,
        }
    }
}

impl Default for PromptSet {
    fn default() -> Self {
        // Built-in templates are statically known to be valid.
        let template = |s: &str| PromptTemplate(s.to_string());
        Self {
            post_summary: StagePrompt {
                system: "You summarize posts from news feeds. Answer with one or two plain sentences, no markup.".into(),
                user: template("Summarize this post:\n\n{Content}"),
            },
            post_importance: StagePrompt {
                system: "You rate how important a post is for a busy reader. Answer with a single integer from 1 (trivial) to 10 (critical) and nothing else.".into(),
                user: template("Rate the importance of this post:\n\n{Content}"),
            },
            digest_summary: StagePrompt {
                system: "You write digests of news posts. Answer with a short title on the first line, then a one-paragraph overview.".into(),
                user: template("Write a digest for these post summaries:\n\n{Content}"),
            },
        }
    }
}

/// Replaces either half of one stage's prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<PromptTemplate>,
}

impl PromptOverride {
    fn apply(&self, default: &StagePrompt) -> StagePrompt {
        StagePrompt {
            system: self
                .system
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(&default.system)
                .to_string(),
            user: self.user.clone().unwrap_or_else(|| default.user.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOverrides {
    #[serde(default)]
    pub post_summary: PromptOverride,
    #[serde(default)]
    pub post_importance: PromptOverride,
    #[serde(default)]
    pub digest_summary: PromptOverride,
}

impl PromptOverrides {
    pub fn resolve(&self, defaults: &PromptSet) -> PromptSet {
        PromptSet {
            post_summary: self.post_summary.apply(&defaults.post_summary),
            post_importance: self.post_importance.apply(&defaults.post_importance),
            digest_summary: self.digest_summary.apply(&defaults.digest_summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_requires_exactly_one_placeholder() {
        assert!(PromptTemplate::new("Summarize {content} please").is_ok());
        assert_eq!(PromptTemplate::new("   "), Err(PromptError::Blank));
        assert!(matches!(
            PromptTemplate::new("no placeholder"),
            Err(PromptError::MissingPlaceholder(_))
        ));
        assert!(matches!(
            PromptTemplate::new("{Content} and {CONTENT}"),
            Err(PromptError::MultiplePlaceholders(_))
        ));
    }

    #[test]
    fn render_is_case_insensitive_and_literal() {
        let t = PromptTemplate::new("Post: {CONTENT}!").unwrap();
        assert_eq!(t.render("costs $5 ${x}"), "Post: costs $5 ${x}!");
    }

    #[test]
    fn overrides_fall_back_to_defaults() {
        let defaults = PromptSet::default();
        let overrides = PromptOverrides {
            post_summary: PromptOverride {
                system: None,
                user: Some(PromptTemplate::new("TL;DR: {Content}").unwrap()),
            },
            digest_summary: PromptOverride {
                system: Some("Be brief.".into()),
                user: None,
            },
            ..Default::default()
        };
        let resolved = overrides.resolve(&defaults);
        assert_eq!(resolved.post_summary.user.text(), "TL;DR: {Content}");
        assert_eq!(resolved.post_summary.system, defaults.post_summary.system);
        assert_eq!(resolved.post_importance, defaults.post_importance);
        assert_eq!(resolved.digest_summary.system, "Be brief.");
        assert_eq!(resolved.digest_summary.user, defaults.digest_summary.user);
    }

    #[test]
    fn default_templates_are_valid() {
        let set = PromptSet::default();
        for kind in [
            PromptKind::PostSummary,
            PromptKind::PostImportance,
            PromptKind::DigestSummary,
        ] {
            let text = set.stage(kind).user.text().to_string();
            assert!(PromptTemplate::new(text).is_ok());
        }
    }
}
