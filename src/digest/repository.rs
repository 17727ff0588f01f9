// src/digest/repository.rs
//! Digest persistence: an in-memory store for tests and a JSON-file store (one file per digest).

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::model::{DigestId, DigestResult, DigestSummaryView};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("digest storage i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("digest record is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait DigestRepository: Send + Sync {
    /// Insert or replace the digest stored under `digest.id`.
    async fn save_digest(&self, digest: &DigestResult) -> Result<(), RepositoryError>;

    async fn load_digest(&self, id: DigestId) -> Result<Option<DigestResult>, RepositoryError>;

    /// All stored digests without their posts, newest first.
    async fn list_digest_summaries(&self) -> Result<Vec<DigestSummaryView>, RepositoryError>;

    /// Returns whether a digest was removed.
    async fn delete_digest(&self, id: DigestId) -> Result<bool, RepositoryError>;
}

fn newest_first(mut v: Vec<DigestSummaryView>) -> Vec<DigestSummaryView> {
    v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    v
}

#[derive(Debug, Default)]
pub struct InMemoryDigestRepository {
    digests: RwLock<HashMap<DigestId, DigestResult>>,
}

impl InMemoryDigestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.digests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.read().is_empty()
    }
}

#[async_trait]
impl DigestRepository for InMemoryDigestRepository {
    async fn save_digest(&self, digest: &DigestResult) -> Result<(), RepositoryError> {
        self.digests.write().insert(digest.id, digest.clone());
        Ok(())
    }

    async fn load_digest(&self, id: DigestId) -> Result<Option<DigestResult>, RepositoryError> {
        Ok(self.digests.read().get(&id).cloned())
    }

    async fn list_digest_summaries(&self) -> Result<Vec<DigestSummaryView>, RepositoryError> {
        let v = self
            .digests
            .read()
            .values()
            .map(DigestSummaryView::from)
            .collect();
        Ok(newest_first(v))
    }

    async fn delete_digest(&self, id: DigestId) -> Result<bool, RepositoryError> {
        Ok(self.digests.write().remove(&id).is_some())
    }
}

/// `<dir>/<id>.json` per digest. Writes go to a temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct JsonFileDigestRepository {
    dir: PathBuf,
}

impl JsonFileDigestRepository {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: DigestId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl DigestRepository for JsonFileDigestRepository {
    async fn save_digest(&self, digest: &DigestResult) -> Result<(), RepositoryError> {
        let path = self.path_for(digest.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(digest)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(digest_id = %digest.id, path = %path.display(), "digest saved");
        Ok(())
    }

    async fn load_digest(&self, id: DigestId) -> Result<Option<DigestResult>, RepositoryError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_digest_summaries(&self) -> Result<Vec<DigestSummaryView>, RepositoryError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<DigestResult>(&bytes) {
                Ok(d) => out.push(DigestSummaryView::from(&d)),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "skipping unreadable digest file");
                }
            }
        }
        Ok(newest_first(out))
    }

    async fn delete_digest(&self, id: DigestId) -> Result<bool, RepositoryError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
