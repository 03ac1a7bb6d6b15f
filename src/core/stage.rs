//! Stage ordering

use serde::{Deserialize, Serialize};

/// Stage order used when a pipeline file does not declare `stages`
pub const DEFAULT_STAGES: &[&str] = &["test", "build", "publish", "kubernetes", "flaming-fir"];

/// A named, ordered phase of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub index: usize,
}

/// Ascending list of stages for one pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOrder {
    stages: Vec<Stage>,
}

impl StageOrder {
    /// Build an order from stage names; position defines precedence
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        let stages = names
            .iter()
            .enumerate()
            .map(|(index, name)| Stage {
                name: name.as_ref().to_string(),
                index,
            })
            .collect();
        Self { stages }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// Name of the stage at `index`, or an empty string if out of range
    pub fn name_of(&self, index: usize) -> &str {
        self.stages.get(index).map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageOrder {
    fn default() -> Self {
        Self::new(DEFAULT_STAGES)
    }
}
