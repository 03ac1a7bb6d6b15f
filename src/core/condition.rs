//! Trigger rule model - `only`/`except` filters over the pipeline context

use crate::core::{
    config::FilterConfig,
    context::{PipelineContext, TriggerSource},
    error::RuleEvaluationError,
};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use tracing::warn;

/// Outcome of evaluating a job's trigger rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleDecision {
    Run,
    Skip,
}

/// Ref keywords that match on the kind of pipeline rather than the ref name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKeyword {
    Branches,
    Tags,
    Schedules,
    Web,
    Pushes,
    Triggers,
    Api,
}

impl RefKeyword {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "branches" => Some(RefKeyword::Branches),
            "tags" => Some(RefKeyword::Tags),
            "schedules" => Some(RefKeyword::Schedules),
            "web" => Some(RefKeyword::Web),
            "pushes" => Some(RefKeyword::Pushes),
            "triggers" => Some(RefKeyword::Triggers),
            "api" => Some(RefKeyword::Api),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RefKeyword::Branches => "branches",
            RefKeyword::Tags => "tags",
            RefKeyword::Schedules => "schedules",
            RefKeyword::Web => "web",
            RefKeyword::Pushes => "pushes",
            RefKeyword::Triggers => "triggers",
            RefKeyword::Api => "api",
        }
    }

    fn matches(&self, ctx: &PipelineContext) -> bool {
        match self {
            RefKeyword::Branches => !ctx.is_tag(),
            RefKeyword::Tags => ctx.is_tag(),
            RefKeyword::Schedules => ctx.source() == TriggerSource::Schedule,
            RefKeyword::Web => ctx.source() == TriggerSource::Web,
            RefKeyword::Pushes => ctx.source() == TriggerSource::Push,
            RefKeyword::Triggers => ctx.source() == TriggerSource::Trigger,
            RefKeyword::Api => ctx.source() == TriggerSource::Api,
        }
    }
}

/// A single entry of a `refs` list
#[derive(Debug, Clone)]
pub enum RefCondition {
    Keyword(RefKeyword),
    /// `/regex/` or `/regex/i`, unanchored like a search
    Pattern(Regex),
    /// Exact ref name
    Exact(String),
    /// Kept so evaluation can fail closed instead of dropping the entry
    Invalid { raw: String, reason: String },
}

impl RefCondition {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return RefCondition::invalid(raw, "empty ref pattern");
        }

        if let Some(body) = trimmed.strip_prefix('/') {
            let Some(end) = body.rfind('/') else {
                return RefCondition::invalid(raw, "regex pattern is missing its closing '/'");
            };
            let (pattern, flags) = (&body[..end], &body[end + 1..]);
            if pattern.is_empty() {
                return RefCondition::invalid(raw, "empty regex pattern");
            }
            let case_insensitive = match flags {
                "" => false,
                "i" => true,
                other => {
                    return RefCondition::invalid(raw, &format!("unsupported regex flags '{}'", other))
                }
            };
            return match RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
            {
                Ok(regex) => RefCondition::Pattern(regex),
                Err(e) => RefCondition::invalid(raw, &e.to_string()),
            };
        }

        match RefKeyword::parse(trimmed) {
            Some(keyword) => RefCondition::Keyword(keyword),
            None => RefCondition::Exact(trimmed.to_string()),
        }
    }

    fn invalid(raw: &str, reason: &str) -> Self {
        RefCondition::Invalid {
            raw: raw.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn matches(&self, ctx: &PipelineContext) -> Result<bool, RuleEvaluationError> {
        match self {
            RefCondition::Keyword(keyword) => Ok(keyword.matches(ctx)),
            RefCondition::Pattern(regex) => Ok(regex.is_match(ctx.ref_name())),
            RefCondition::Exact(name) => Ok(name == ctx.ref_name()),
            RefCondition::Invalid { raw, reason } => Err(RuleEvaluationError {
                condition: raw.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

impl fmt::Display for RefCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefCondition::Keyword(keyword) => write!(f, "{}", keyword.as_str()),
            RefCondition::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
            RefCondition::Exact(name) => write!(f, "{}", name),
            RefCondition::Invalid { raw, .. } => write!(f, "{} (invalid)", raw),
        }
    }
}

/// A single entry of a `variables` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableCondition {
    /// `$VAR` - defined and non-empty
    Defined(String),
    /// `$VAR == "value"`
    Equals { name: String, value: String },
    /// `$VAR != "value"`
    NotEquals { name: String, value: String },
    Invalid { raw: String, reason: String },
}

fn variable_expression() -> &'static Regex {
    static EXPR: OnceLock<Regex> = OnceLock::new();
    EXPR.get_or_init(|| {
        Regex::new(
            r#"^\$([A-Za-z_][A-Za-z0-9_]*)\s*(?:(==|!=)\s*(?:"([^"]*)"|'([^']*)'))?$"#,
        )
        .expect("variable expression regex is valid")
    })
}

impl VariableCondition {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let Some(caps) = variable_expression().captures(trimmed) else {
            return VariableCondition::Invalid {
                raw: raw.to_string(),
                reason: "expected `$VAR`, `$VAR == \"value\"` or `$VAR != \"value\"`".to_string(),
            };
        };

        let name = caps[1].to_string();
        let value = caps
            .get(3)
            .or_else(|| caps.get(4))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        match caps.get(2).map(|m| m.as_str()) {
            None => VariableCondition::Defined(name),
            Some("==") => VariableCondition::Equals { name, value },
            Some(_) => VariableCondition::NotEquals { name, value },
        }
    }

    pub fn matches(&self, ctx: &PipelineContext) -> Result<bool, RuleEvaluationError> {
        match self {
            VariableCondition::Defined(name) => {
                Ok(ctx.variable(name).is_some_and(|v| !v.is_empty()))
            }
            VariableCondition::Equals { name, value } => {
                Ok(ctx.variable(name).unwrap_or("") == value)
            }
            VariableCondition::NotEquals { name, value } => {
                Ok(ctx.variable(name).unwrap_or("") != value)
            }
            VariableCondition::Invalid { raw, reason } => Err(RuleEvaluationError {
                condition: raw.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

impl fmt::Display for VariableCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableCondition::Defined(name) => write!(f, "${}", name),
            VariableCondition::Equals { name, value } => write!(f, "${} == \"{}\"", name, value),
            VariableCondition::NotEquals { name, value } => write!(f, "${} != \"{}\"", name, value),
            VariableCondition::Invalid { raw, .. } => write!(f, "{} (invalid)", raw),
        }
    }
}

/// One side of a trigger rule
///
/// `refs` entries are OR'd, `variables` entries are OR'd, and the two
/// lists are AND'd. An empty list places no constraint.
#[derive(Debug, Clone, Default)]
pub struct RefFilter {
    pub refs: Vec<RefCondition>,
    pub variables: Vec<VariableCondition>,
}

impl RefFilter {
    pub fn from_config(config: &FilterConfig) -> Self {
        let (refs, variables) = config.parts();
        Self {
            refs: refs.iter().map(|r| RefCondition::parse(r)).collect(),
            variables: variables.iter().map(|v| VariableCondition::parse(v)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty() && self.variables.is_empty()
    }

    /// Every condition is checked before combining so a malformed entry
    /// always surfaces, even next to one that matches.
    pub fn matches(&self, ctx: &PipelineContext) -> Result<bool, RuleEvaluationError> {
        let ref_hits = self
            .refs
            .iter()
            .map(|r| r.matches(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let variable_hits = self
            .variables
            .iter()
            .map(|v| v.matches(ctx))
            .collect::<Result<Vec<_>, _>>()?;

        let refs_ok = ref_hits.is_empty() || ref_hits.iter().any(|hit| *hit);
        let variables_ok = variable_hits.is_empty() || variable_hits.iter().any(|hit| *hit);
        Ok(refs_ok && variables_ok)
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.refs.is_empty() {
            let refs: Vec<String> = self.refs.iter().map(|r| r.to_string()).collect();
            parts.push(format!("refs [{}]", refs.join(", ")));
        }
        if !self.variables.is_empty() {
            let vars: Vec<String> = self.variables.iter().map(|v| v.to_string()).collect();
            parts.push(format!("variables [{}]", vars.join(", ")));
        }
        parts.join(" and ")
    }
}

/// A job's trigger rule
#[derive(Debug, Clone, Default)]
pub struct TriggerRule {
    pub only: Option<RefFilter>,
    pub except: Option<RefFilter>,
}

impl TriggerRule {
    /// Rule that always runs
    pub fn always() -> Self {
        Self::default()
    }

    pub fn from_config(only: Option<&FilterConfig>, except: Option<&FilterConfig>) -> Self {
        let build = |config: Option<&FilterConfig>| {
            config
                .map(RefFilter::from_config)
                .filter(|filter| !filter.is_empty())
        };
        Self {
            only: build(only),
            except: build(except),
        }
    }

    /// Human readable summary for plans and logs
    pub fn describe(&self) -> String {
        match (&self.only, &self.except) {
            (None, None) => "always".to_string(),
            (Some(only), None) => format!("only {}", only.describe()),
            (None, Some(except)) => format!("except {}", except.describe()),
            (Some(only), Some(except)) => {
                format!("only {}; except {}", only.describe(), except.describe())
            }
        }
    }
}

/// Evaluate a rule, surfacing malformed conditions
pub fn try_evaluate(
    rule: &TriggerRule,
    ctx: &PipelineContext,
) -> Result<RuleDecision, RuleEvaluationError> {
    if let Some(only) = &rule.only {
        if !only.matches(ctx)? {
            return Ok(RuleDecision::Skip);
        }
    }
    if let Some(except) = &rule.except {
        if except.matches(ctx)? {
            return Ok(RuleDecision::Skip);
        }
    }
    Ok(RuleDecision::Run)
}

/// Evaluate a rule; malformed conditions fail closed to `Skip`
pub fn evaluate(rule: &TriggerRule, ctx: &PipelineContext) -> RuleDecision {
    match try_evaluate(rule, ctx) {
        Ok(decision) => decision,
        Err(e) => {
            warn!("Skipping job with unusable trigger rule: {}", e);
            RuleDecision::Skip
        }
    }
}
