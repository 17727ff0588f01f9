// src/config/mod.rs
//! Process configuration: a TOML file plus environment overrides, read once at start-up.

pub mod ai;
pub mod app;

pub use ai::AiSettings;
pub use app::{AppConfig, EmailSettings, ScheduleSettings, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
