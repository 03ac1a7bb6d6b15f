//! Pipeline context - the immutable snapshot a pipeline run is evaluated against

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Variable that gates deploy-only jobs
pub const DEPLOY_TAG: &str = "DEPLOY_TAG";

/// What caused the pipeline to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Push of a branch or tag
    Push,
    /// Scheduled timer
    Schedule,
    /// Manual trigger from the web interface
    Web,
    /// Trigger token / downstream pipeline
    Trigger,
    /// API call
    Api,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Push => "push",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Web => "web",
            TriggerSource::Trigger => "trigger",
            TriggerSource::Api => "api",
        }
    }
}

/// Immutable snapshot for one pipeline invocation
///
/// Built once at run start (see the `for_*` constructors and `with_*`
/// builders) and only read afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    run_id: Uuid,
    ref_name: String,
    is_tag: bool,
    commit_sha: String,
    variables: HashMap<String, String>,
    source: TriggerSource,
}

impl PipelineContext {
    /// Context for a branch push
    pub fn for_push(ref_name: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::new(ref_name, commit_sha, false, TriggerSource::Push)
    }

    /// Context for a tag creation
    pub fn for_tag(tag: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::new(tag, commit_sha, true, TriggerSource::Push)
    }

    /// Context for a scheduled pipeline on a branch
    pub fn for_schedule(ref_name: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::new(ref_name, commit_sha, false, TriggerSource::Schedule)
    }

    /// Context for a pipeline started from the web interface
    pub fn for_web(ref_name: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::new(ref_name, commit_sha, false, TriggerSource::Web)
    }

    pub fn new(
        ref_name: impl Into<String>,
        commit_sha: impl Into<String>,
        is_tag: bool,
        source: TriggerSource,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            ref_name: ref_name.into(),
            is_tag,
            commit_sha: commit_sha.into(),
            variables: HashMap::new(),
            source,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_variables<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.variables
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Copy of this context where `defaults` fill in variables the
    /// context does not define itself
    pub fn with_defaults(&self, defaults: &HashMap<String, String>) -> Self {
        let mut ctx = self.clone();
        for (key, value) in defaults {
            ctx.variables
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        ctx
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    pub fn is_tag(&self) -> bool {
        self.is_tag
    }

    pub fn commit_sha(&self) -> &str {
        &self.commit_sha
    }

    pub fn source(&self) -> TriggerSource {
        self.source
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Get a variable
    pub fn variable(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    /// `DEPLOY_TAG` if it is set to a non-empty value
    pub fn deploy_tag(&self) -> Option<&str> {
        self.variable(DEPLOY_TAG).filter(|v| !v.is_empty())
    }

    /// Variables every job of this run sees regardless of configuration
    pub fn predefined_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("CI_PIPELINE_ID".to_string(), self.run_id.to_string());
        vars.insert("CI_COMMIT_REF_NAME".to_string(), self.ref_name.clone());
        vars.insert("CI_COMMIT_SHA".to_string(), self.commit_sha.clone());
        vars.insert(
            "CI_PIPELINE_SOURCE".to_string(),
            self.source.as_str().to_string(),
        );
        if self.is_tag {
            vars.insert("CI_COMMIT_TAG".to_string(), self.ref_name.clone());
        }
        vars
    }
}
