// src/config/app.rs
use chrono::NaiveTime;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::ai::AiSettings;
use super::ConfigError;
use crate::digest::prompts::{PromptOverrides, PromptSet};

pub const ENV_CONFIG_PATH: &str = "DIGEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/digest.toml";

const DEFAULT_MAX_CONCURRENT_AI_TASKS: usize = 4;
const DEFAULT_STORAGE_DIR: &str = "data/digests";
const DEFAULT_LOOKBACK_HOURS: u32 = 24;

// ---- file shape ----

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    scheduler: SchedulerSection,
    storage: StorageSection,
    prompts: PromptOverrides,
    ai: AiSettings,
    schedule: ScheduleSection,
    email: Option<EmailSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SchedulerSection {
    max_concurrent_ai_tasks: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StorageSection {
    dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScheduleSection {
    digest_time_utc: Option<String>,
    lookback_hours: Option<u32>,
    feeds_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmailSection {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

// ---- resolved config ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Daily run time; `None` disables the scheduled digest.
    pub digest_time_utc: Option<NaiveTime>,
    pub lookback_hours: u32,
    pub feeds_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSettings {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub max_concurrent_ai_tasks: usize,
    pub storage_dir: PathBuf,
    pub prompts: PromptSet,
    pub ai: AiSettings,
    pub schedule: ScheduleSettings,
    pub email: Option<EmailSettings>,
}

impl AppConfig {
    /// Read `$DIGEST_CONFIG_PATH` (or `config/digest.toml`), then apply env overrides.
    /// A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                String::new()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Self::from_toml_str(&text, &path.display().to_string())
    }

    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        Self::resolve(file)
    }

    fn resolve(file: FileConfig) -> Result<Self, ConfigError> {
        let max_raw = match env::var("MAX_CONCURRENT_AI_TASKS") {
            Ok(v) => Some(v.trim().parse::<i64>().map_err(|_| ConfigError::Invalid {
                key: "MAX_CONCURRENT_AI_TASKS",
                reason: format!("'{v}' is not an integer"),
            })?),
            Err(_) => file.scheduler.max_concurrent_ai_tasks,
        };
        let max_concurrent_ai_tasks = match max_raw {
            None => DEFAULT_MAX_CONCURRENT_AI_TASKS,
            Some(n) if n >= 1 => usize::try_from(n).map_err(|_| ConfigError::Invalid {
                key: "scheduler.max_concurrent_ai_tasks",
                reason: format!("{n} is too large"),
            })?,
            Some(n) => {
                return Err(ConfigError::Invalid {
                    key: "scheduler.max_concurrent_ai_tasks",
                    reason: format!("must be a positive integer, got {n}"),
                })
            }
        };

        let storage_dir = env::var("DIGEST_STORAGE_DIR")
            .map(PathBuf::from)
            .ok()
            .or(file.storage.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));

        let prompts = file.prompts.resolve(&PromptSet::default());

        let mut ai = file.ai;
        ai.resolve_env()?;

        let time_raw = env::var("DIGEST_TIME_UTC")
            .ok()
            .or(file.schedule.digest_time_utc)
            .filter(|s| !s.trim().is_empty());
        let digest_time_utc = time_raw
            .map(|s| {
                NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ConfigError::Invalid {
                    key: "schedule.digest_time_utc",
                    reason: format!("'{s}' is not HH:MM"),
                })
            })
            .transpose()?;
        let lookback_hours = file
            .schedule
            .lookback_hours
            .unwrap_or(DEFAULT_LOOKBACK_HOURS);
        if lookback_hours == 0 {
            return Err(ConfigError::Invalid {
                key: "schedule.lookback_hours",
                reason: "must be at least 1".into(),
            });
        }
        let schedule = ScheduleSettings {
            digest_time_utc,
            lookback_hours,
            feeds_path: env::var(crate::ingest::config::ENV_FEEDS_PATH)
                .map(PathBuf::from)
                .ok()
                .or(file.schedule.feeds_path),
        };

        let email = resolve_email(file.email.unwrap_or_default())?;

        Ok(Self {
            max_concurrent_ai_tasks,
            storage_dir,
            prompts,
            ai,
            schedule,
            email,
        })
    }
}

fn env_or(key: &str, from_file: Option<String>) -> Option<String> {
    env::var(key)
        .ok()
        .or(from_file)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve_email(section: EmailSection) -> Result<Option<EmailSettings>, ConfigError> {
    let Some(host) = env_or("SMTP_HOST", section.host) else {
        return Ok(None);
    };
    let port = match env::var("SMTP_PORT") {
        Ok(p) => Some(p.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
            key: "SMTP_PORT",
            reason: format!("'{p}' is not a port number"),
        })?),
        Err(_) => section.port,
    };
    let username = env_or("SMTP_USER", section.username);
    let password = env_or("SMTP_PASS", section.password);
    let from = env_or("DIGEST_EMAIL_FROM", section.from)
        .or_else(|| username.clone())
        .ok_or(ConfigError::Invalid {
            key: "email.from",
            reason: "required when an SMTP host is configured".into(),
        })?;
    let to = env_or("DIGEST_EMAIL_TO", section.to).ok_or(ConfigError::Invalid {
        key: "email.to",
        reason: "required when an SMTP host is configured".into(),
    })?;

    Ok(Some(EmailSettings {
        host,
        port,
        username,
        password,
        from,
        to,
    }))
}
