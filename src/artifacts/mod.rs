//! Artifact store: expiring file bundles published by jobs

pub mod memory;

pub use memory::InMemoryArtifactStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Files published by one job in one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Rendered artifact name
    pub name: String,

    /// Producing job
    pub job: String,

    pub run_id: Uuid,

    /// Relative path -> contents
    pub files: BTreeMap<String, Vec<u8>>,

    pub created_at: DateTime<Utc>,

    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        job: impl Into<String>,
        run_id: Uuid,
        files: BTreeMap<String, Vec<u8>>,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            name: name.into(),
            job: job.into(),
            run_id,
            files,
            created_at,
            // A retention past the representable range never expires
            expires_at: ttl.and_then(|ttl| created_at.checked_add_signed(ttl)),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Total payload size in bytes
    pub fn size(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("no artifact from job '{job}' in run {run_id}")]
    NotFound { job: String, run_id: Uuid },

    #[error("artifact from job '{job}' expired at {expired_at}")]
    Expired {
        job: String,
        expired_at: DateTime<Utc>,
    },

    #[error("job '{job}' already published an artifact in run {run_id}")]
    AlreadyPublished { job: String, run_id: Uuid },
}

impl ArtifactError {
    /// Both a missing and an expired artifact read as not found to consumers
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ArtifactError::NotFound { .. } | ArtifactError::Expired { .. }
        )
    }
}

/// Storage for artifacts keyed by (job, run id)
///
/// An artifact is inserted whole, so readers never observe a partial
/// bundle, and each key accepts a single write.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publish an artifact
    async fn put(&self, artifact: Artifact) -> Result<Arc<Artifact>, ArtifactError>;

    /// Fetch an artifact as of `now`
    async fn get_at(
        &self,
        job: &str,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Arc<Artifact>, ArtifactError>;

    /// Fetch an artifact as of the current time
    async fn get(&self, job: &str, run_id: Uuid) -> Result<Arc<Artifact>, ArtifactError> {
        self.get_at(job, run_id, Utc::now()).await
    }

    /// Purge every artifact expired at `now`; returns how many were removed
    async fn expire(&self, now: DateTime<Utc>) -> usize;

    /// Drop every artifact of a run
    ///
    /// The engine never calls this; a run can be resumed until its owner
    /// discards it, and the owner tears its artifacts down here.
    async fn purge_run(&self, run_id: Uuid) -> usize;

    /// Artifacts of a run keyed by producing job
    async fn list_run(&self, run_id: Uuid) -> BTreeMap<String, Arc<Artifact>>;
}
