//! In-memory artifact store

use crate::artifacts::{Artifact, ArtifactError, ArtifactStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

type ArtifactKey = (String, Uuid);

/// Process-wide artifact store backed by a map
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<HashMap<ArtifactKey, Arc<Artifact>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, artifact: Artifact) -> Result<Arc<Artifact>, ArtifactError> {
        let key = (artifact.job.clone(), artifact.run_id);
        let mut artifacts = self.artifacts.write().await;

        if artifacts.contains_key(&key) {
            return Err(ArtifactError::AlreadyPublished {
                job: key.0,
                run_id: key.1,
            });
        }

        debug!(
            "Published artifact {} from {} ({} files, {} bytes)",
            artifact.name,
            artifact.job,
            artifact.files.len(),
            artifact.size()
        );
        let artifact = Arc::new(artifact);
        artifacts.insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    async fn get_at(
        &self,
        job: &str,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Arc<Artifact>, ArtifactError> {
        let artifacts = self.artifacts.read().await;
        let artifact = artifacts
            .get(&(job.to_string(), run_id))
            .ok_or_else(|| ArtifactError::NotFound {
                job: job.to_string(),
                run_id,
            })?;

        match artifact.expires_at {
            Some(expired_at) if artifact.is_expired_at(now) => Err(ArtifactError::Expired {
                job: job.to_string(),
                expired_at,
            }),
            _ => Ok(Arc::clone(artifact)),
        }
    }

    async fn expire(&self, now: DateTime<Utc>) -> usize {
        let mut artifacts = self.artifacts.write().await;
        let before = artifacts.len();
        artifacts.retain(|_, artifact| !artifact.is_expired_at(now));
        let purged = before - artifacts.len();
        if purged > 0 {
            debug!("Purged {} expired artifact(s)", purged);
        }
        purged
    }

    async fn purge_run(&self, run_id: Uuid) -> usize {
        let mut artifacts = self.artifacts.write().await;
        let before = artifacts.len();
        artifacts.retain(|(_, id), _| *id != run_id);
        before - artifacts.len()
    }

    async fn list_run(&self, run_id: Uuid) -> BTreeMap<String, Arc<Artifact>> {
        let artifacts = self.artifacts.read().await;
        artifacts
            .iter()
            .filter(|((_, id), _)| *id == run_id)
            .map(|((job, _), artifact)| (job.clone(), Arc::clone(artifact)))
            .collect()
    }
}
