//! Pipeline configuration from YAML

use crate::core::{job::When, stage::DEFAULT_STAGES, Pipeline};
use crate::execution::scheduler::ManualGatePolicy;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

/// Default artifact retention when neither the job nor `defaults` set one
pub const DEFAULT_EXPIRE_IN: &str = "7 days";

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Ordered stage names (defaults to test, build, publish, kubernetes, flaming-fir)
    #[serde(default)]
    pub stages: Vec<String>,

    /// Global variables available to all jobs
    #[serde(default)]
    variables: BTreeMap<String, Value>,

    /// Defaults applied to every job
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Commands prepended to every job's script unless the job sets its own
    #[serde(default)]
    pub before_script: Vec<String>,

    /// Whether later stages proceed while a manual gate is pending
    #[serde(default)]
    pub manual_gate_policy: ManualGatePolicy,

    /// Reusable partial job definitions
    #[serde(default)]
    pub templates: BTreeMap<String, JobTemplate>,

    /// Jobs keyed by name
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

/// Pipeline-wide job defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub retry: Option<usize>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Artifact retention, e.g. "7 days" or "never"
    #[serde(default)]
    pub expire_in: Option<String>,
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    /// Templates merged in order before the job's own fields
    #[serde(default)]
    pub extends: Vec<String>,

    #[serde(flatten)]
    pub spec: JobTemplate,
}

/// Partial job definition, used both for templates and for jobs
///
/// Every field is optional so templates and jobs can be merged; a field
/// set later replaces the earlier value wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_script: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<FilterConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<FilterConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_failure: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl JobTemplate {
    /// Merge `overlay` on top of `self`; fields set in `overlay` win
    pub fn merge(self, overlay: &JobTemplate) -> JobTemplate {
        let overlay = overlay.clone();
        JobTemplate {
            stage: overlay.stage.or(self.stage),
            script: overlay.script.or(self.script),
            before_script: overlay.before_script.or(self.before_script),
            variables: overlay.variables.or(self.variables),
            only: overlay.only.or(self.only),
            except: overlay.except.or(self.except),
            dependencies: overlay.dependencies.or(self.dependencies),
            retry: overlay.retry.or(self.retry),
            allow_failure: overlay.allow_failure.or(self.allow_failure),
            when: overlay.when.or(self.when),
            artifacts: overlay.artifacts.or(self.artifacts),
            environment: overlay.environment.or(self.environment),
            timeout_secs: overlay.timeout_secs.or(self.timeout_secs),
        }
    }

    /// Job variables rendered as strings
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .as_ref()
            .map(|vars| {
                vars.iter()
                    .map(|(k, v)| (k.clone(), render_value(v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `only` / `except` block: either a plain ref list or `{ refs, variables }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterConfig {
    Refs(Vec<String>),
    Detailed {
        #[serde(default)]
        refs: Vec<String>,
        #[serde(default)]
        variables: Vec<String>,
    },
}

impl FilterConfig {
    /// (refs, variables)
    pub fn parts(&self) -> (&[String], &[String]) {
        match self {
            FilterConfig::Refs(refs) => (refs.as_slice(), &[]),
            FilterConfig::Detailed { refs, variables } => (refs.as_slice(), variables.as_slice()),
        }
    }
}

/// Artifact declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Name template, e.g. "${CI_JOB_NAME}_${CI_COMMIT_REF_NAME}"
    #[serde(default)]
    pub name: Option<String>,

    /// Files or directories collected after the job succeeds
    #[serde(default)]
    pub paths: Vec<String>,

    /// Retention, e.g. "7 days" or "never"
    #[serde(default)]
    pub expire_in: Option<String>,
}

/// Deployment environment binding: `environment: name` or `environment: { name: ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    Name(String),
    Detailed { name: String },
}

impl EnvironmentConfig {
    pub fn name(&self) -> &str {
        match self {
            EnvironmentConfig::Name(name) => name,
            EnvironmentConfig::Detailed { name } => name,
        }
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Stage names in order, falling back to the default stage list
    pub fn stage_names(&self) -> Vec<String> {
        if self.stages.is_empty() {
            DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
        } else {
            self.stages.clone()
        }
    }

    /// Merge a job's templates and its own fields into one definition
    pub fn resolve_job(&self, name: &str) -> Result<JobTemplate> {
        let job = self
            .jobs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown job '{}'", name))?;

        let mut merged = JobTemplate::default();
        for template_name in &job.extends {
            let template = self.templates.get(template_name).ok_or_else(|| {
                anyhow::anyhow!(
                    "Job '{}' extends non-existent template '{}'",
                    name,
                    template_name
                )
            })?;
            merged = merged.merge(template);
        }
        Ok(merged.merge(&job.spec))
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        let stages = self.stage_names();
        let mut seen_stages = HashSet::new();
        for stage in &stages {
            if !seen_stages.insert(stage) {
                anyhow::bail!("Duplicate stage: {}", stage);
            }
        }

        if let Some(expire_in) = &self.defaults.expire_in {
            parse_duration(expire_in).context("Invalid defaults.expire_in")?;
        }

        let mut resolved = BTreeMap::new();
        for name in self.jobs.keys() {
            resolved.insert(name.as_str(), self.resolve_job(name)?);
        }

        let stage_index = |name: &str| stages.iter().position(|s| s == name);
        let mut environments: HashMap<&str, &str> = HashMap::new();

        for (name, spec) in &resolved {
            let stage = spec
                .stage
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Job '{}' has no stage", name))?;
            let index = stage_index(stage).ok_or_else(|| {
                anyhow::anyhow!("Job '{}' uses undeclared stage '{}'", name, stage)
            })?;

            if spec.script.as_ref().map_or(true, |s| s.is_empty()) {
                anyhow::bail!("Job '{}' has no script", name);
            }

            // Dependencies must exist and belong to an earlier or the same stage
            for dep in spec.dependencies.iter().flatten() {
                let dep_spec = resolved.get(dep.as_str()).ok_or_else(|| {
                    anyhow::anyhow!("Job '{}' depends on non-existent job '{}'", name, dep)
                })?;
                let dep_index = dep_spec
                    .stage
                    .as_deref()
                    .and_then(stage_index)
                    .unwrap_or(usize::MAX);
                if dep_index > index {
                    anyhow::bail!(
                        "Job '{}' in stage '{}' depends on '{}' from a later stage",
                        name,
                        stage,
                        dep
                    );
                }
            }

            if let Some(artifacts) = &spec.artifacts {
                if let Some(expire_in) = &artifacts.expire_in {
                    parse_duration(expire_in)
                        .with_context(|| format!("Invalid artifacts.expire_in in job '{}'", name))?;
                }
            }

            // Environments are bound 1:1 to deploy jobs
            if let Some(environment) = &spec.environment {
                if let Some(other) = environments.insert(environment.name(), name) {
                    anyhow::bail!(
                        "Environment '{}' is bound to both '{}' and '{}'",
                        environment.name(),
                        other,
                        name
                    );
                }
            }
        }

        self.check_cycles(&resolved)?;

        Ok(())
    }

    /// Check for cycles in the job dependency graph
    fn check_cycles(&self, resolved: &BTreeMap<&str, JobTemplate>) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for name in resolved.keys() {
            if !visited.contains(*name) {
                Self::dfs_check(name, resolved, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        name: &str,
        resolved: &BTreeMap<&str, JobTemplate>,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(name.to_string());
        recursion_stack.insert(name.to_string());

        if let Some(spec) = resolved.get(name) {
            for dep in spec.dependencies.iter().flatten() {
                if recursion_stack.contains(dep) {
                    anyhow::bail!("Cycle detected in dependency graph involving job '{}'", dep);
                }
                if !visited.contains(dep) {
                    Self::dfs_check(dep, resolved, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(name);
        Ok(())
    }

    /// Get variables as string map
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v)))
            .collect()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        Pipeline::from_config(self)
    }
}

/// Render a YAML scalar the way it would appear in an environment variable
pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn duration_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"(\d+)\s*([A-Za-z]+)").expect("duration regex is valid"))
}

/// Parse a retention duration such as "7 days", "1 week", "2 hours 30 mins"
///
/// Returns `None` for "never".
pub fn parse_duration(raw: &str) -> Result<Option<chrono::Duration>> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("never") {
        return Ok(None);
    }
    if trimmed.is_empty() {
        anyhow::bail!("Empty duration");
    }

    let token = duration_token();
    if !token.replace_all(trimmed, "").trim().is_empty() {
        anyhow::bail!("Unrecognised duration '{}'", raw);
    }

    let mut total = chrono::Duration::zero();
    for caps in token.captures_iter(trimmed) {
        let amount: i64 = caps[1]
            .parse()
            .with_context(|| format!("Duration amount out of range in '{}'", raw))?;
        let unit_secs: i64 = match caps[2].to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "wk" | "wks" | "week" | "weeks" => 604_800,
            other => anyhow::bail!("Unknown duration unit '{}' in '{}'", other, raw),
        };
        total = amount
            .checked_mul(unit_secs)
            .and_then(chrono::Duration::try_seconds)
            .and_then(|part| total.checked_add(&part))
            .with_context(|| format!("Duration out of range in '{}'", raw))?;
    }

    Ok(Some(total))
}
