//! Job domain model

use crate::core::{
    condition::TriggerRule,
    config::{parse_duration, DefaultsConfig, JobTemplate, DEFAULT_EXPIRE_IN},
    stage::StageOrder,
    state::{FailureCause, JobState},
};
use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// When a job is started once its dependencies allow it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    /// Start automatically
    #[default]
    OnSuccess,
    /// Wait for an explicit approval
    Manual,
}

/// Files a job publishes after it succeeds
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSpec {
    /// Name template, rendered with the job's variables
    pub name: Option<String>,
    pub paths: Vec<String>,
    /// `None` keeps the artifact until the run is purged
    pub expire_in: Option<chrono::Duration>,
}

impl ArtifactSpec {
    /// Render the artifact name; defaults to the job name
    pub fn render_name(&self, job: &str, variables: &HashMap<String, String>) -> String {
        match &self.name {
            Some(template) => expand_variables(template, variables),
            None => job.to_string(),
        }
    }
}

/// Values a job falls back to when its definition leaves them out
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub retry: usize,
    pub timeout_secs: u64,
    pub expire_in: Option<chrono::Duration>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            retry: 0,
            timeout_secs: 3600,
            expire_in: Some(chrono::Duration::days(7)),
        }
    }
}

impl JobDefaults {
    pub fn from_config(config: &DefaultsConfig) -> Result<Self> {
        let fallback = Self::default();
        let expire_in = parse_duration(config.expire_in.as_deref().unwrap_or(DEFAULT_EXPIRE_IN))
            .context("Invalid defaults.expire_in")?;
        Ok(Self {
            retry: config.retry.unwrap_or(fallback.retry),
            timeout_secs: config.timeout_secs.unwrap_or(fallback.timeout_secs),
            expire_in,
        })
    }
}

/// A single schedulable unit of work
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,

    /// Index into the pipeline's stage order
    pub stage: usize,

    pub stage_name: String,

    pub rule: TriggerRule,

    /// Jobs whose status and artifacts this job requires
    pub dependencies: Vec<String>,

    /// Extra attempts after the first failure
    pub retry: usize,

    pub allow_failure: bool,

    pub when: When,

    pub artifacts: Option<ArtifactSpec>,

    /// Deployment environment this job is bound to
    pub environment: Option<String>,

    /// Opaque body: before_script lines followed by script lines
    pub script: Vec<String>,

    /// Job-level variables
    pub variables: HashMap<String, String>,

    pub timeout_secs: u64,

    /// Runtime state
    pub state: JobState,
}

impl Job {
    /// Build a job from its merged definition
    pub fn from_spec(
        name: &str,
        spec: &JobTemplate,
        stages: &StageOrder,
        defaults: &JobDefaults,
        global_before_script: &[String],
    ) -> Result<Self> {
        let stage_name = spec
            .stage
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Job '{}' has no stage", name))?;
        let stage = stages
            .index_of(&stage_name)
            .ok_or_else(|| anyhow::anyhow!("Job '{}' uses undeclared stage '{}'", name, stage_name))?;

        let artifacts = match &spec.artifacts {
            Some(config) => {
                let expire_in = match &config.expire_in {
                    Some(raw) => parse_duration(raw)
                        .with_context(|| format!("Invalid artifacts.expire_in in job '{}'", name))?,
                    None => defaults.expire_in,
                };
                Some(ArtifactSpec {
                    name: config.name.clone(),
                    paths: config.paths.clone(),
                    expire_in,
                })
            }
            None => None,
        };

        let mut script = spec
            .before_script
            .clone()
            .unwrap_or_else(|| global_before_script.to_vec());
        script.extend(spec.script.clone().unwrap_or_default());

        Ok(Job {
            name: name.to_string(),
            stage,
            stage_name,
            rule: TriggerRule::from_config(spec.only.as_ref(), spec.except.as_ref()),
            dependencies: spec.dependencies.clone().unwrap_or_default(),
            retry: spec.retry.unwrap_or(defaults.retry),
            allow_failure: spec.allow_failure.unwrap_or(false),
            when: spec.when.unwrap_or_default(),
            artifacts,
            environment: spec.environment.as_ref().map(|e| e.name().to_string()),
            script,
            variables: spec.variables_as_string_map(),
            timeout_secs: spec.timeout_secs.unwrap_or(defaults.timeout_secs),
            state: JobState::Pending,
        })
    }

    /// Total attempts allowed: the first run plus retries
    pub fn max_attempts(&self) -> usize {
        self.retry + 1
    }

    pub fn is_manual(&self) -> bool {
        self.when == When::Manual
    }

    /// Whether this job's current state makes the pipeline fail
    pub fn affects_verdict(&self) -> bool {
        match &self.state {
            JobState::Failed { .. } => !self.allow_failure,
            JobState::Skipped { reason } => !self.allow_failure && reason.caused_by_failure(),
            _ => false,
        }
    }

    /// Whether a dependent may consume this job's result
    ///
    /// A rejected gate never ran, so it blocks dependents even when
    /// `allow_failure` is set.
    pub fn satisfies_dependents(&self) -> bool {
        match &self.state {
            JobState::Succeeded { .. } => true,
            JobState::Failed { cause, .. } => {
                self.allow_failure && *cause == FailureCause::Execution
            }
            _ => false,
        }
    }
}

fn variable_reference() -> &'static Regex {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    REFERENCE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable reference regex is valid")
    })
}

/// Expand `$VAR` and `${VAR}` references; unknown variables expand to ""
pub fn expand_variables(template: &str, variables: &HashMap<String, String>) -> String {
    variable_reference()
        .replace_all(template, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            variables.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}
