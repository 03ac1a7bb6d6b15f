//! Deployment environments and their last deployed version

use crate::core::context::PipelineContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// A named deployment target bound to one deploy job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub job: String,
    pub deployed_version: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Version a deploy job rolls out: `DEPLOY_TAG` when set, else the commit
pub fn deploy_version(ctx: &PipelineContext) -> String {
    ctx.deploy_tag()
        .map(str::to_string)
        .unwrap_or_else(|| ctx.commit_sha().to_string())
}

/// Process-wide registry of environments
///
/// Outlives individual runs so a redeploy of the same version can be
/// recognised and skipped.
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    environments: RwLock<HashMap<String, Environment>>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment for a job; keeps any recorded deployment
    pub async fn bind(&self, name: &str, job: &str) {
        let mut environments = self.environments.write().await;
        environments
            .entry(name.to_string())
            .and_modify(|env| env.job = job.to_string())
            .or_insert_with(|| Environment {
                name: name.to_string(),
                job: job.to_string(),
                deployed_version: None,
                deployed_at: None,
            });
    }

    /// Whether `version` is what the environment already runs
    pub async fn is_current(&self, name: &str, version: &str) -> bool {
        let environments = self.environments.read().await;
        environments
            .get(name)
            .and_then(|env| env.deployed_version.as_deref())
            == Some(version)
    }

    pub async fn record_deploy(&self, name: &str, job: &str, version: &str) {
        let mut environments = self.environments.write().await;
        let env = environments
            .entry(name.to_string())
            .or_insert_with(|| Environment {
                name: name.to_string(),
                job: job.to_string(),
                deployed_version: None,
                deployed_at: None,
            });
        env.deployed_version = Some(version.to_string());
        env.deployed_at = Some(Utc::now());
        debug!("Environment {} now runs {}", name, version);
    }

    pub async fn get(&self, name: &str) -> Option<Environment> {
        self.environments.read().await.get(name).cloned()
    }

    /// All environments sorted by name
    pub async fn list(&self) -> Vec<Environment> {
        let mut environments: Vec<Environment> =
            self.environments.read().await.values().cloned().collect();
        environments.sort_by(|a, b| a.name.cmp(&b.name));
        environments
    }
}
