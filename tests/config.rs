// tests/config.rs
//
// AppConfig: TOML file + env overrides. Every test touching env is serialized and
// starts from a clean slate.

use std::env;
use std::path::PathBuf;

use chrono::NaiveTime;
use feed_digest::config::{AppConfig, ConfigError};
use feed_digest::digest::prompts::PromptSet;

const ENV_KEYS: &[&str] = &[
    "MAX_CONCURRENT_AI_TASKS",
    "DIGEST_STORAGE_DIR",
    "DIGEST_TIME_UTC",
    "DIGEST_FEEDS_PATH",
    "AI_TEST_MODE",
    "OPENAI_MODEL",
    "OPENAI_ENDPOINT",
    "OPENAI_API_KEY",
    "SMTP_HOST",
    "SMTP_PORT",
    "SMTP_USER",
    "SMTP_PASS",
    "DIGEST_EMAIL_FROM",
    "DIGEST_EMAIL_TO",
];

fn clean_env() {
    for k in ENV_KEYS {
        env::remove_var(k);
    }
}

#[serial_test::serial]
#[test]
fn empty_file_yields_defaults() {
    clean_env();
    let cfg = AppConfig::from_toml_str("", "inline").unwrap();
    assert_eq!(cfg.max_concurrent_ai_tasks, 4);
    assert_eq!(cfg.storage_dir, PathBuf::from("data/digests"));
    assert_eq!(cfg.prompts, PromptSet::default());
    assert_eq!(cfg.ai.provider, "openai");
    assert_eq!(cfg.ai.api_key, "");
    assert_eq!(cfg.schedule.digest_time_utc, None);
    assert_eq!(cfg.schedule.lookback_hours, 24);
    assert!(cfg.email.is_none());
}

#[serial_test::serial]
#[test]
fn file_values_are_read_and_env_wins() {
    clean_env();
    let toml = r#"
        [scheduler]
        max_concurrent_ai_tasks = 2

        [storage]
        dir = "/var/lib/digests"

        [ai]
        provider = "Mock"

        [schedule]
        digest_time_utc = "06:30"
        lookback_hours = 12

        [prompts.post_summary]
        user = "In one line: {content}"
    "#;

    let cfg = AppConfig::from_toml_str(toml, "inline").unwrap();
    assert_eq!(cfg.max_concurrent_ai_tasks, 2);
    assert_eq!(cfg.storage_dir, PathBuf::from("/var/lib/digests"));
    assert!(cfg.ai.is_mock());
    assert_eq!(cfg.schedule.digest_time_utc, NaiveTime::from_hms_opt(6, 30, 0));
    assert_eq!(cfg.schedule.lookback_hours, 12);
    assert_eq!(cfg.prompts.post_summary.user.text(), "In one line: {content}");
    assert_eq!(cfg.prompts.post_importance, PromptSet::default().post_importance);

    env::set_var("MAX_CONCURRENT_AI_TASKS", "7");
    env::set_var("DIGEST_TIME_UTC", "23:05");
    let cfg = AppConfig::from_toml_str(toml, "inline").unwrap();
    assert_eq!(cfg.max_concurrent_ai_tasks, 7);
    assert_eq!(cfg.schedule.digest_time_utc, NaiveTime::from_hms_opt(23, 5, 0));
    clean_env();
}

#[serial_test::serial]
#[test]
fn non_positive_ai_cap_is_rejected() {
    clean_env();
    let err = AppConfig::from_toml_str("[scheduler]\nmax_concurrent_ai_tasks = 0\n", "inline")
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }), "got {err:?}");

    env::set_var("MAX_CONCURRENT_AI_TASKS", "-3");
    assert!(AppConfig::from_toml_str("", "inline").is_err());
    env::set_var("MAX_CONCURRENT_AI_TASKS", "lots");
    assert!(AppConfig::from_toml_str("", "inline").is_err());
    clean_env();
}

#[serial_test::serial]
#[test]
fn prompt_without_placeholder_fails_to_parse() {
    clean_env();
    let err = AppConfig::from_toml_str(
        "[prompts.digest_summary]\nuser = \"no placeholder here\"\n",
        "digest.toml",
    )
    .unwrap_err();
    match err {
        ConfigError::Parse { path, .. } => assert_eq!(path, "digest.toml"),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[serial_test::serial]
#[test]
fn malformed_time_and_zero_lookback_are_rejected() {
    clean_env();
    assert!(AppConfig::from_toml_str("[schedule]\ndigest_time_utc = \"7am\"\n", "inline").is_err());
    assert!(AppConfig::from_toml_str("[schedule]\nlookback_hours = 0\n", "inline").is_err());
}

#[serial_test::serial]
#[test]
fn unsupported_ai_provider_is_rejected() {
    clean_env();
    let err = AppConfig::from_toml_str("[ai]\nprovider = \"llama\"\n", "inline").unwrap_err();
    assert!(err.to_string().contains("llama"), "got {err}");
}

#[serial_test::serial]
#[test]
fn api_key_placeholder_reads_env() {
    clean_env();
    env::set_var("OPENAI_API_KEY", "sk-test");
    env::set_var("OPENAI_MODEL", "gpt-test");
    let cfg = AppConfig::from_toml_str("", "inline").unwrap();
    assert_eq!(cfg.ai.api_key, "sk-test");
    assert_eq!(cfg.ai.model, "gpt-test");

    env::set_var("AI_TEST_MODE", "mock");
    let cfg = AppConfig::from_toml_str("", "inline").unwrap();
    assert!(cfg.ai.is_mock());
    assert_eq!(cfg.ai.api_key, "");
    clean_env();
}

#[serial_test::serial]
#[test]
fn email_requires_recipient_and_falls_back_to_username() {
    clean_env();
    let err = AppConfig::from_toml_str("[email]\nhost = \"smtp.example.test\"\n", "inline")
        .unwrap_err();
    assert!(err.to_string().contains("email.to"), "got {err}");

    let cfg = AppConfig::from_toml_str(
        r#"
        [email]
        host = "smtp.example.test"
        port = 2525
        username = "bot@example.test"
        to = "me@example.test"
        "#,
        "inline",
    )
    .unwrap();
    let email = cfg.email.expect("email configured");
    assert_eq!(email.from, "bot@example.test");
    assert_eq!(email.port, Some(2525));

    env::set_var("SMTP_PORT", "not-a-port");
    assert!(AppConfig::from_toml_str("[email]\nhost = \"h\"\nto = \"t\"\nfrom = \"f\"\n", "inline").is_err());
    clean_env();
}

#[serial_test::serial]
#[test]
fn missing_file_is_defaults() {
    clean_env();
    let dir = tempfile::tempdir().unwrap();
    let cfg = AppConfig::load_from(&dir.path().join("nope.toml")).unwrap();
    assert_eq!(cfg.max_concurrent_ai_tasks, 4);
}
