// src/digest/mod.rs
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod repository;

pub use model::{
    DigestFilter, DigestGenerationOutcome, DigestId, DigestResult, DigestSummaryView, FeedId,
    FilterError, Importance, Post, PostSummary,
};
pub use orchestrator::{DigestProcessingOrchestrator, DigestScope, ScopeFactory, SharedScopeFactory};
pub use pipeline::{AiSlots, DigestError, DigestPipeline};
pub use prompts::{PromptOverrides, PromptSet, PromptTemplate};
pub use repository::{
    DigestRepository, InMemoryDigestRepository, JsonFileDigestRepository, RepositoryError,
};
