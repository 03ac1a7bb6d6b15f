//! Shell runner configuration

use std::path::PathBuf;

/// Configuration for the shell runner
#[derive(Debug, Clone)]
pub struct ShellRunnerConfig {
    /// Shell used to run each script line with `-c`
    pub shell: String,

    /// Directory under which per-run, per-job working directories are created
    pub workspace_root: PathBuf,
}

impl Default for ShellRunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            workspace_root: std::env::temp_dir().join("stagehand"),
        }
    }
}

impl ShellRunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }
}
