// src/analyze/mod.rs
//! AI analysis of posts: per-post summary and importance, digest overview.

pub mod ai_adapter;

pub use ai_adapter::{build_ai_client, AiClient, AiError, DynAiClient, MockAiClient};
